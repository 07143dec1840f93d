pub mod config;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod registry;
pub mod sharing;
pub mod store;
pub mod types;

pub use config::{TqConfig, WeightAggregation, DEFAULT_CPU_TIME_LADDER, TQ_MIN_SHARE};
pub use engine::TaskQueueEngine;
pub use error::{Result, TqError};
pub use registry::{GroupRegistry, IdentityCorrector, SharesCorrector, StaticRegistry};
pub use types::{
    CleanupReport, JobDescription, JobId, MatchOutcome, MatchRequest, PoppedJob, QueueFilter,
    TaskQueueDefinition, TaskQueueSummary, TqId,
};
