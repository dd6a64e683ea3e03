pub mod cascade;
pub mod cron;
pub mod engine;
pub mod error;
pub mod executor;
pub mod inventory;
pub mod locks;
pub mod models;
pub mod orchestrator;
pub mod plugin;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod wake;

pub use error::JobError;
pub use models::{BackupJob, Device, JobRequest, JobStatus, LockKey, Share};
pub use orchestrator::{Health, Orchestrator};
pub use progress::ProgressTracker;
