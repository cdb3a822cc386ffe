pub mod filesystem;
pub mod shell;

pub use filesystem::{DeleteFileTool, ListDirTool, ReadFileTool, WriteFileTool};
pub use shell::ShellTool;
