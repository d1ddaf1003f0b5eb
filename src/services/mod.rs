pub mod checkpoint;
pub mod output_store;
pub mod prompts;
pub mod rate_limiter;
pub mod reporter;
pub mod result_codec;
pub mod retry;

pub use checkpoint::{
    CheckpointEntry, CheckpointState, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
    Outcome,
};
pub use output_store::OutputStore;
pub use rate_limiter::{RateLimiter, RateLimits};
pub use reporter::{ProgressSnapshot, Reporter};
pub use result_codec::{ParsedResponse, ResultCodec};
pub use retry::{
    AttemptDecision, GiveUpReason, RetryExecutor, RetryOutcome, RetryPolicy, Sleeper, TokioSleeper,
};
