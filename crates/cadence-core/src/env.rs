//! Environment seams: wall clock and signaling sink.
//!
//! Decoupling these from the session keeps the protocol logic deterministic
//! under test: the harness provides a virtual clock and an in-memory relay,
//! production provides the system clock and a socket to the signaling
//! server.

use std::time::{SystemTime, UNIX_EPOCH};

use cadence_proto::Signal;

/// Source of wall-clock time for frame pacing.
///
/// Implementations must be monotonic enough for pacing: values never
/// decrease within one session.
pub trait Clock {
    /// Current unix time in microseconds.
    fn now_unix_usec(&self) -> i64;
}

/// System wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_usec(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_micros() as i64)
    }
}

/// Outbound half of the signaling connection.
///
/// The relay is reliable and ordered; delivery failures are the
/// application's concern, not the session's.
pub trait SignalSink {
    /// Queue a message for the signaling server.
    fn signal_send(&mut self, message: &Signal);
}
