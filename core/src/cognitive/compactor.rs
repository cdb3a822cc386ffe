//! Bounds prompt-history growth: keeps a recent window verbatim and collapses
//! older steps into grouped one-line summaries.

use super::step::{categorize, CompactStep, CompactedHistory, Step, ToolCategory};

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    pub recent_window: usize,
    pub max_compact_steps: usize,
    pub group_similar: bool,
    pub preserve_failures: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            recent_window: 5,
            max_compact_steps: 20,
            group_similar: true,
            preserve_failures: true,
        }
    }
}

pub struct StepCompactor {
    config: CompactionConfig,
}

impl StepCompactor {
    pub fn new(config: CompactionConfig) -> Self {
        Self { config }
    }

    /// Compacts `steps` per the configured policy. `recent_steps` is always
    /// a suffix of `steps`; `len(recent_steps) + len(compact_steps) <=
    /// recent_window + max_compact_steps` for all inputs.
    pub fn compact(&self, steps: &[Step]) -> CompactedHistory {
        let total_original = steps.len();

        if steps.len() <= self.config.recent_window {
            return CompactedHistory {
                recent_steps: steps.to_vec(),
                compact_steps: Vec::new(),
                dropped_count: 0,
                total_original,
            };
        }

        let split = steps.len() - self.config.recent_window;
        let older = &steps[..split];
        let recent = steps[split..].to_vec();

        let mut compact_steps = if self.config.group_similar {
            self.group(older)
        } else {
            older.iter().map(|s| CompactStep { id: s.id.clone(), summary: s.observation.clone() }).collect()
        };

        let dropped_count = if compact_steps.len() > self.config.max_compact_steps {
            let drop = compact_steps.len() - self.config.max_compact_steps;
            compact_steps.drain(0..drop);
            drop
        } else {
            0
        };

        CompactedHistory {
            recent_steps: recent,
            compact_steps,
            dropped_count,
            total_original,
        }
    }

    fn group(&self, steps: &[Step]) -> Vec<CompactStep> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < steps.len() {
            let category = categorize(&steps[i].tool_name);
            let tool_name = steps[i].tool_name.clone();
            let mut j = i + 1;
            while j < steps.len() && categorize(&steps[j].tool_name) == category && (category != ToolCategory::Other || steps[j].tool_name == tool_name) {
                j += 1;
            }

            let run = &steps[i..j];
            if run.len() == 1 {
                out.push(CompactStep {
                    id: run[0].id.clone(),
                    summary: run[0].observation.clone(),
                });
            } else {
                let failed = run.iter().filter(|s| !s.success).count();
                let noun = match category {
                    ToolCategory::Other => format!("{}x {}", run.len(), tool_name),
                    other => format!("{} {}", run.len(), other.noun()),
                };
                let mut summary = format!("[{}..{}] {}", run[0].id, run[run.len() - 1].id, noun);
                if self.config.preserve_failures && failed > 0 {
                    summary.push_str(&format!(" ({failed} failed)"));
                }
                out.push(CompactStep {
                    id: format!("{}..{}", run[0].id, run[run.len() - 1].id),
                    summary,
                });
            }
            i = j;
        }
        out
    }
}

impl CompactedHistory {
    /// Renders the two-block prompt fragment: a summarized block of older
    /// steps followed by the verbatim recent-actions block.
    pub fn format_for_prompt(&self) -> String {
        let mut out = String::from("Previous actions (summarized):\n");
        for compact in &self.compact_steps {
            out.push_str(&compact.render());
            out.push('\n');
        }
        if self.dropped_count > 0 {
            out.push_str(&format!("... ({} earlier steps omitted)\n", self.dropped_count));
        }
        out.push('\n');
        out.push_str("Recent actions:\n");
        for step in &self.recent_steps {
            let mark = if step.success { "✓" } else { "✗" };
            out.push_str(&format!("[{}] {} {}\n", step.id, mark, step.observation));
        }
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::step::{StepIdCounter, StepReducer};

    fn make_step(counter: &StepIdCounter, tool: &str, observation: &str, success: bool) -> Step {
        let args = serde_json::json!({});
        let mut step = StepReducer::reduce(tool, &args, None, success, if success { None } else { Some("err") }, 0, counter);
        step.observation = observation.to_string();
        step
    }

    #[test]
    fn no_compaction_below_window() {
        let compactor = StepCompactor::new(CompactionConfig::default());
        let counter = StepIdCounter::new();
        let steps = vec![make_step(&counter, "fs:read_file", "a", true), make_step(&counter, "fs:read_file", "b", true)];
        let compacted = compactor.compact(&steps);
        assert_eq!(compacted.recent_steps.len(), 2);
        assert!(compacted.compact_steps.is_empty());
        assert_eq!(compacted.dropped_count, 0);
    }

    #[test]
    fn compaction_stays_within_configured_bound() {
        let config = CompactionConfig { recent_window: 5, max_compact_steps: 20, ..Default::default() };
        let compactor = StepCompactor::new(config.clone());
        let counter = StepIdCounter::new();
        let steps: Vec<Step> = (0..200)
            .map(|i| make_step(&counter, if i % 2 == 0 { "fs:read_file" } else { "system:shell" }, "x", true))
            .collect();
        let compacted = compactor.compact(&steps);
        assert!(compacted.recent_steps.len() + compacted.compact_steps.len() <= config.recent_window + config.max_compact_steps);
        assert_eq!(compacted.recent_steps, &steps[steps.len() - config.recent_window..]);
    }

    #[test]
    fn grouping_collapses_contiguous_runs() {
        let compactor = StepCompactor::new(CompactionConfig::default());
        let counter = StepIdCounter::new();
        let mut steps = Vec::new();
        for _ in 0..7 {
            steps.push(make_step(&counter, "fs:read_file", "read", true));
        }
        for _ in 0..5 {
            steps.push(make_step(&counter, "system:shell", "ran", true));
        }
        let compacted = compactor.compact(&steps);
        let rendered = compacted.format_for_prompt();
        assert!(rendered.contains("Previous actions (summarized):"));
        assert!(rendered.contains("Recent actions:"));
    }
}
