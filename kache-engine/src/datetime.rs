//! HTTP-date parsing and response age calculation (RFC 7234 §4.2.3).

use std::time::{Duration, SystemTime};

/// Parse an HTTP-date in any of the three formats RFC 7231 §7.1.1.1
/// recognizes (IMF-fixdate, obsolete RFC 850, and asctime). `httpdate`
/// accepts all three when parsing and only ever emits IMF-fixdate.
/// Unknown or malformed input maps to the Unix epoch, treating an
/// unparseable date as if no date were present at all.
pub fn parse_http_date(value: &str) -> SystemTime {
    httpdate::parse_http_date(value.trim()).unwrap_or(SystemTime::UNIX_EPOCH)
}

/// `apparent_age = max(0, response_time - date)`.
pub fn apparent_age(date: Option<SystemTime>, response_time: SystemTime) -> Duration {
    match date {
        Some(date) => response_time.duration_since(date).unwrap_or(Duration::ZERO),
        None => Duration::ZERO,
    }
}

/// Parses the `Age` header as whole seconds; `0` on any parse failure.
pub fn corrected_age(age_header: Option<&str>) -> Duration {
    age_header
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::ZERO)
}

/// `current_age = max(apparent_age, corrected_age) + (now - response_time)`.
pub fn current_age(
    date: Option<SystemTime>,
    age_header: Option<&str>,
    response_time: SystemTime,
    now: SystemTime,
) -> Duration {
    let corrected_initial_age = apparent_age(date, response_time).max(corrected_age(age_header));
    let resident_time = now.duration_since(response_time).unwrap_or(Duration::ZERO);
    corrected_initial_age + resident_time
}

/// The `Age` header value written on a hit: `current_age` rounded to whole
/// seconds. `response_time`/`now` carry sub-second precision even though
/// `date` only has second precision, so this always has a fractional
/// remainder to round away rather than truncate.
pub fn age_header_value(age: Duration) -> u64 {
    age.as_secs_f64().round() as u64
}
