//! Match log: reports positive live matches, at most once per camera per interval.

use facewatch_core::FaceObservation;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Receives positive live matches.
pub trait MatchSink: Send + Sync {
    fn on_match(&self, camera: &str, identity: &str, score: f32);
}

/// Default sink: one `info` event per match on the `facewatch::match` target.
pub struct TracingSink;

impl MatchSink for TracingSink {
    fn on_match(&self, camera: &str, identity: &str, score: f32) {
        tracing::info!(target: "facewatch::match", camera, identity, score, "face matched");
    }
}

/// Allows one event per interval. A zero interval allows everything.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    /// Check at `now`; the slot is consumed only by [`RateLimiter::mark`].
    pub fn ready(&self, now: Instant) -> bool {
        match self.last {
            _ if self.interval.is_zero() => true,
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }
}

/// Per-camera match reporter.
pub struct MatchLog {
    camera: String,
    sink: Arc<dyn MatchSink>,
    limiter: Mutex<RateLimiter>,
}

impl MatchLog {
    pub fn new(camera: impl Into<String>, sink: Arc<dyn MatchSink>, interval: Duration) -> Self {
        Self { camera: camera.into(), sink, limiter: Mutex::new(RateLimiter::new(interval)) }
    }

    /// Report the first live match of a detection batch if the camera's
    /// interval has elapsed. Returns whether anything was emitted.
    pub fn report(&self, observations: &[FaceObservation], now: Instant) -> bool {
        let mut limiter = self.limiter.lock().unwrap_or_else(|p| p.into_inner());
        if !limiter.ready(now) {
            return false;
        }
        let Some(hit) = observations.iter().find(|o| o.is_live_match()) else {
            return false;
        };
        self.sink.on_match(&self.camera, hit.display_name(), hit.match_score);
        limiter.mark(now);
        true
    }
}
