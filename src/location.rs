use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::LocationError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
}

/// Source of the device's current position.
pub trait LocationProvider: Send + Sync + 'static {
    /// Acquire a fix no older than `max_age`, giving up after `timeout`.
    fn current_position(
        &self,
        timeout: Duration,
        max_age: Duration,
    ) -> impl Future<Output = Result<Position, LocationError>> + Send;
}

/// Reports a configured position, or fails when none is configured.
#[derive(Debug, Clone, Default)]
pub struct StaticLocation {
    position: Option<Position>,
}

impl StaticLocation {
    pub fn new(position: Option<Position>) -> Self {
        Self { position }
    }
}

impl LocationProvider for StaticLocation {
    async fn current_position(
        &self,
        _timeout: Duration,
        _max_age: Duration,
    ) -> Result<Position, LocationError> {
        self.position.ok_or(LocationError::Unavailable)
    }
}
