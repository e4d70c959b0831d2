pub mod defs;
pub mod runtime;
pub mod step;

pub use runtime::{WorkflowRun, WorkflowRuntime};
