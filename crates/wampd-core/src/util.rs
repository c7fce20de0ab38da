//! Id and timestamp helpers.

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;

/// Generate a random alphanumeric id of the given length.
///
/// Used for cookie tracking ids and long-poll transport ids.
pub fn newid(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect()
}

/// Current UTC time.
pub fn utcnow() -> DateTime<Utc> {
    Utc::now()
}

/// Render a timestamp as an ISO-8601 UTC string with millisecond precision.
pub fn utcstr(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}
