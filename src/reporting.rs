//! Error reporting side channel.
//!
//! Performer failures are returned to the caller and also handed to an
//! [`ErrorReporter`] so operators see them without every caller logging.

use crate::error::{ErrorKind, RoomserverError};
use tracing::{error, warn};

pub trait ErrorReporter: Send + Sync {
    /// Called once per failed operation, after the error kind is final.
    fn capture(&self, operation: &str, err: &RoomserverError);
}

/// Logs through `tracing` and counts the error in metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn capture(&self, operation: &str, err: &RoomserverError) {
        crate::metrics::record_error(operation, err.error_code());
        match err.kind() {
            ErrorKind::Storage | ErrorKind::Internal | ErrorKind::StateUnavailable => {
                error!(operation, code = err.error_code(), error = %err, "Operation failed");
            }
            _ => {
                warn!(operation, code = err.error_code(), error = %err, "Operation refused");
            }
        }
    }
}
