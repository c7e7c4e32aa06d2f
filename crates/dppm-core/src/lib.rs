pub mod config;
pub mod error;
pub mod execution;
pub mod experience;
pub mod plan;
pub mod reflection;
pub mod risk;
pub mod run;
pub mod subtask;
pub mod workflow;

pub use config::DppmConfig;
pub use error::DppmError;
pub use execution::{ErrorKind, ExecutionError, ExecutionResult, StepResult, StepStatus};
pub use experience::{Experience, NewExperience};
pub use plan::{AlternativeApproach, ExecutionPhase, MergedPlan, MiniPlan, PlanStep};
pub use reflection::{PostExecutionReflection, ReflectionNote, Sentiment};
pub use risk::{AppliedMitigation, Mitigation, MitigationStrategy, PreFlightReport, Risk};
pub use run::{DppmResult, RunRecord, RunState};
pub use subtask::{Domain, Subtask};
pub use workflow::{CreateWorkflow, Workflow, WorkflowStatus};
