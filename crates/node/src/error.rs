//! Error taxonomy and the edge-triggered last-error store.
//!
//! Nothing in the core throws or aborts: errors are recorded per instance
//! and surfaced through the error observer exactly when the stored string
//! *changes*. Repeating failures (a Hub that is down for an hour) produce
//! one observer call, not one per retry.

use thiserror::Error;

use crate::config::ConfigError;

/// Failure kinds the node reports. Only `Config` is fatal; everything else
/// recovers through the state machine.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("hub returned HTTP {status}")]
    Http { status: u16 },
    #[error("authentication rejected with HTTP {status}")]
    Auth { status: u16 },
    #[error("hub refused: {0}")]
    Refused(String),
    #[error("tunnel failure: {0}")]
    Tunnel(String),
    #[error("malformed payload: {0}")]
    Payload(String),
}

/// Observer invoked when the last-error string changes.
pub type ErrorObserver = Box<dyn Fn(&str) + Send>;

/// Per-instance last-error string with edge-triggered observation.
#[derive(Default)]
pub struct LastError {
    message: Option<String>,
    observer: Option<ErrorObserver>,
}

impl LastError {
    pub fn set_observer(&mut self, observer: ErrorObserver) {
        self.observer = Some(observer);
    }

    /// Records `message`; fires the observer only if it differs from the
    /// stored value.
    pub fn set(&mut self, message: impl Into<String>) {
        let message = message.into();
        if self.message.as_deref() == Some(message.as_str()) {
            return;
        }
        tracing::warn!(error = %message, "node error");
        if let Some(observer) = &self.observer {
            observer(&message);
        }
        self.message = Some(message);
    }

    /// Clears the stored error without firing the observer.
    pub fn clear(&mut self) {
        self.message = None;
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}
