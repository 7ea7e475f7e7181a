use std::any::Any;
use std::time::Duration;

use thiserror::Error;

/// The registry never reached a trustworthy state.
///
/// Fatal for the process: serving broadcasts against an unsynchronized
/// registry would silently skip targets.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("discovery did not complete its initial listing within {0:?}")]
    Timeout(Duration),
    #[error("discovery event stream closed before the initial listing completed")]
    SourceClosed,
}

/// A broadcast operation panicked instead of returning.
#[derive(Debug, Error)]
#[error("operation panicked: {0}")]
pub struct Panicked(pub String);

impl Panicked {
    pub fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self(message)
    }
}

/// A failed call to a single broadcast target.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("invalid target url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Panicked(#[from] Panicked),
}
