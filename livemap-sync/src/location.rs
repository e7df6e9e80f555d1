//! Device positioning behind a polled source.
//!
//! Samples are pulled on demand by the client's poll timer; nothing is
//! pushed. [`CachedLocationSource`] bounds every request with a timeout and
//! reuses a fix that is still younger than the freshness window.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::protocol::Coordinates;

/// Positioning failures. None of them are fatal: the cycle is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("timed out waiting for a position fix")]
    Timeout,
    #[error("position unavailable: {0}")]
    Unavailable(String),
}

/// A single position fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    pub coordinates: Coordinates,
    pub captured_at: Instant,
}

impl PositionSample {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self {
            coordinates: Coordinates::new(lon, lat),
            captured_at: Instant::now(),
        }
    }

    pub fn longitude(&self) -> f64 {
        self.coordinates.lon
    }

    pub fn latitude(&self) -> f64 {
        self.coordinates.lat
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }
}

/// Something that can produce the device position when asked.
pub trait LocationSource: Send {
    /// Request a fresh position fix.
    fn current_position(
        &mut self,
    ) -> impl Future<Output = Result<PositionSample, LocationError>> + Send;
}

/// Always reports the same coordinates.
#[derive(Debug, Clone)]
pub struct FixedLocationSource {
    coordinates: Coordinates,
}

impl FixedLocationSource {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self {
            coordinates: Coordinates::new(lon, lat),
        }
    }
}

impl LocationSource for FixedLocationSource {
    async fn current_position(&mut self) -> Result<PositionSample, LocationError> {
        Ok(PositionSample {
            coordinates: self.coordinates,
            captured_at: Instant::now(),
        })
    }
}

/// Replays a fixed script of fixes and failures, cycling forever.
#[derive(Debug, Clone)]
pub struct ScriptedLocationSource {
    script: Vec<Result<Coordinates, LocationError>>,
    cursor: usize,
}

impl ScriptedLocationSource {
    pub fn new(script: Vec<Result<Coordinates, LocationError>>) -> Self {
        Self { script, cursor: 0 }
    }

    /// Start the sequence over from its first entry.
    pub fn restart(&mut self) {
        self.cursor = 0;
    }
}

impl LocationSource for ScriptedLocationSource {
    async fn current_position(&mut self) -> Result<PositionSample, LocationError> {
        if self.script.is_empty() {
            return Err(LocationError::Unavailable("empty script".into()));
        }
        let entry = self.script[self.cursor % self.script.len()].clone();
        self.cursor = self.cursor.wrapping_add(1);
        entry.map(|coordinates| PositionSample {
            coordinates,
            captured_at: Instant::now(),
        })
    }
}

/// Wraps a source with a freshness window and a request timeout.
pub struct CachedLocationSource<L> {
    inner: L,
    max_age: Duration,
    timeout: Duration,
    last: Option<PositionSample>,
}

impl<L: LocationSource> CachedLocationSource<L> {
    pub fn new(inner: L, max_age: Duration, timeout: Duration) -> Self {
        Self {
            inner,
            max_age,
            timeout,
            last: None,
        }
    }

    /// A fix no older than `max_age`, asking the inner source only if needed.
    pub async fn fix(&mut self) -> Result<PositionSample, LocationError> {
        if let Some(sample) = self.last.filter(|s| s.age() < self.max_age) {
            return Ok(sample);
        }

        let sample = tokio::time::timeout(self.timeout, self.inner.current_position())
            .await
            .map_err(|_| LocationError::Timeout)??;
        self.last = Some(sample);
        Ok(sample)
    }

    /// Last successful fix, however old.
    pub fn last(&self) -> Option<&PositionSample> {
        self.last.as_ref()
    }

    /// Forget the cached fix.
    pub fn invalidate(&mut self) {
        self.last = None;
    }
}
