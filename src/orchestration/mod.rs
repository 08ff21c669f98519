//! Decision loop, planners and the multi-operation scheduler.

pub mod health;
mod obfuscation;
mod operation;
mod planner;
mod planners;
mod scheduler;

pub use health::{HealthConfig, HealthEvent, HealthMonitor};
pub use obfuscation::{obfuscator_for, Base64Obfuscator, Obfuscator, PlainText};
pub use operation::{
    EngineContext, EngineSettings, Operation, OperationConfig, OperationEvent, OperationRecord,
    OperationState, StepOutcome,
};
pub use planner::{agent_globals, Planner, PlannerContext, PlannerRegistry};
pub use planners::{AtomicPlanner, BatchPlanner, BucketsPlanner};
pub use scheduler::Scheduler;
