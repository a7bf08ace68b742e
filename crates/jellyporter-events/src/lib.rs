pub mod webhook;

pub use webhook::{WebhookError, WebhookServer};

use thiserror::Error;
use tokio::sync::oneshot;

/// Why the scheduler shed an event instead of starting a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncRejected {
    #[error("too many requests")]
    TooManyRequests,
}

/// A request to run a sync cycle, produced by an event source. The scheduler
/// sends exactly one reply over `reply`: `Ok` once the cycle is accepted,
/// `Err` when the event is shed.
#[derive(Debug)]
pub struct SyncRequest {
    pub source: &'static str,
    pub metadata: String,
    pub reply: oneshot::Sender<Result<(), SyncRejected>>,
}
