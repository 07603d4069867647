//! User script subsystem: persistence, sandboxed execution, cadence.

pub mod engine;
pub mod repository;
pub mod scheduler;
pub mod types;

pub use engine::{run_script, ScriptContext};
pub use scheduler::ScriptScheduler;
pub use types::ScriptDefinition;
