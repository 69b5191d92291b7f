pub mod command;
pub mod evals;
pub mod intent;
pub mod orchestrator;
pub mod preflight;
pub mod selection;
