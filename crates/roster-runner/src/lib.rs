//! roster-runner: supervised execution of the operator scripts
//! (diagnostics, seeding, enrollment, camera loop).

pub mod log;
pub mod registry;
pub mod runner;

pub use log::{LogBuffer, MAX_LOG_LINES};
pub use registry::{ParamSpec, Registry, RegistryError, ScriptSpec};
pub use runner::{RunnerError, ScriptRecord, ScriptRunner, ScriptStatus, StartOutcome, MAX_LINE_BYTES};
