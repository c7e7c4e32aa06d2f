pub mod bridge;
pub mod config;
pub mod decomposer;
pub mod experience;
pub mod merger;
pub mod orchestrator;
pub mod plan_parser;
pub mod planner;
pub mod preflight;
pub mod process;
pub mod provider;
pub mod reflector;
pub mod risk;
pub mod router;
pub mod run_tracker;
pub mod subtask_parser;
pub mod tool;

pub use orchestrator::Orchestrator;
