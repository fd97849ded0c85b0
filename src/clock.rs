//! Wall-clock helpers shared by the stream and control paths.
//!
//! Stream packets carry a presentation timestamp in microseconds; the
//! keep-alive ping carries milliseconds. Both sides of an RTT measurement
//! must read the same clock, so every call site goes through here.

use chrono::Utc;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}
