pub mod lifecycle;
pub mod state;
pub mod types;

pub use lifecycle::{JobOutcome, Lifecycle, LifecycleConfig, Progress};
pub use types::{
    GameKind, Job, JobError, JobPatch, JobPayload, JobStatus, JobType, PortRequest, Server,
    ServerSpec, ServerStatus,
};
