pub mod bootstrap;
pub mod command;
pub mod config;
pub mod credentials;
pub mod deploy;
pub mod engine;
pub mod image_cache;
pub mod job;
pub mod log_bridge;
pub mod provider;
pub mod readiness;
pub mod runner;
pub mod scheduler;

// Re-export commonly used items
pub use config::OrchestratorSettings;
pub use engine::Engine;
pub use runner::JobRunner;
pub use scheduler::{Step, StepOutcome, StepScheduler};
