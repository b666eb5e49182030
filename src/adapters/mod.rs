//! Concrete collaborators used by the `conductor` binary.

pub mod command;
pub mod file_source;
pub mod workspace;

pub use command::CommandBackend;
pub use file_source::{FileTaskSource, OutcomeRecord};
pub use workspace::DirectoryProvisioner;
