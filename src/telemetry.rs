//! Telemetry utilities for operation timing and span correlation.

use std::time::Instant;

/// Guard for timing an operation and recording metrics.
///
/// Records operation latency when dropped.
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation.
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        crate::metrics::record_operation(self.operation, duration);
    }
}

/// Standardized span constructors for room observability.
pub mod spans {
    use slroom_proto::{EventId, RoomId, ServerName};
    use tracing::{Span, debug_span, info_span};

    /// Span for a per-room input actor.
    pub fn room(room_id: &RoomId) -> Span {
        info_span!("room", room_id = %room_id)
    }

    /// Span for one event moving through the input pipeline.
    pub fn input_event(event_id: &EventId, kind: &str, origin: &ServerName) -> Span {
        debug_span!("input_event", event_id = %event_id, kind = %kind, origin = %origin)
    }

    /// Span for a performer call.
    pub fn perform(operation: &str, room_id: &RoomId) -> Span {
        info_span!("perform", operation = %operation, room_id = %room_id)
    }

    /// Span for a loopback federation request.
    pub fn federation(method: &str, destination: &ServerName) -> Span {
        debug_span!("federation", method = %method, destination = %destination)
    }
}
