//! Telemetry emitter.
//!
//! Stateless: each call reflects the manager's state at that moment. The
//! stream timer calls [`TelemetryEmitter::emit`] exactly once per tick.

use crate::stage::{PositionSample, StageConnectionManager};
use std::sync::Arc;

/// Turns connection state into a renderable position sample.
#[derive(Clone)]
pub struct TelemetryEmitter {
    manager: Arc<StageConnectionManager>,
}

impl TelemetryEmitter {
    /// Emit samples from `manager`.
    pub fn new(manager: Arc<StageConnectionManager>) -> Self {
        Self { manager }
    }

    /// Live position when established, a zeroed sample otherwise. Never fails.
    pub async fn emit(&self) -> PositionSample {
        self.manager.current_position().await
    }
}
