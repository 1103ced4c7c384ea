mod deadline;
mod host_runtime;
mod runner;
mod state;

pub use deadline::Deadline;
pub use host_runtime::{ComponentHost, HostOptions, StartMode};
pub use runner::{run, RunOptions, ShutdownOptions};
pub use state::{ComponentState, LifecyclePhase};
