//! Sandboxing for module code
//!
//! Resource ceilings, a restricted primitive namespace and a textual pre-scan,
//! applied to one OS process per execution.

pub mod executor;
pub mod process;
pub mod scanner;

pub use executor::{ExecutionOutput, Sandbox, SandboxStats};
pub use process::{ResourceLimits, ResourceUsage, SandboxContext};
pub use scanner::{
    CodeScanner, DYNAMIC_COMMAND_OPERATION, PATH_OPERATION, REDIRECTION_OPERATION,
    SOURCE_OPERATION,
};
