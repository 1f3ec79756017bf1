pub mod derive;
pub mod manager;
pub mod observer;
pub mod pg;
pub mod poller;
pub mod store;

pub use manager::{JobManager, JobManagerSettings};
pub use store::{Job, JobFilter, JobStore, MemoryJobStore, StatusHistoryEntry};
