//! `Cache-Control` (and `Pragma`) directive parsing.
//!
//! Directives are split on commas; each token is trimmed, lowercased, and
//! optionally split once on `=`. Arguments are unquoted (surrounding ASCII
//! quotes stripped) and parsed as non-negative integer seconds; a parse
//! failure yields the "unset" sentinel (`-1`) rather than an error, matching
//! the cache's general graceful-degradation policy.

use kache_types::{RequestCacheControl, ResponseCacheControl};

const UNSET: i64 = -1;

struct Directive<'a> {
    name: &'a str,
    arg: Option<&'a str>,
}

fn directives(header_value: &str) -> impl Iterator<Item = Directive<'_>> {
    header_value.split(',').filter_map(|part| {
        let part = part.trim();
        if part.is_empty() {
            return None;
        }
        let mut split = part.splitn(2, '=');
        let name = split.next()?.trim();
        if name.is_empty() {
            return None;
        }
        let arg = split.next().map(|v| v.trim().trim_matches('"'));
        Some(Directive { name, arg })
    })
}

fn parse_seconds(arg: Option<&str>) -> i64 {
    match arg.and_then(|v| v.parse::<i64>().ok()) {
        Some(n) if n >= 0 => n,
        _ => UNSET,
    }
}

/// Parse every `Cache-Control` header value present on a request (values are
/// concatenated with `,` per HTTP list-header semantics, but callers
/// typically pass the joined value of all instances).
pub fn parse_request_cache_control(header_value: &str) -> RequestCacheControl {
    let mut cc = RequestCacheControl {
        max_age: UNSET,
        min_fresh: UNSET,
        ..Default::default()
    };
    for d in directives(header_value) {
        match d.name.to_lowercase().as_str() {
            "no-cache" => cc.no_cache = true,
            "no-store" => cc.no_store = true,
            "no-transform" => cc.no_transform = true,
            "only-if-cached" => cc.only_if_cached = true,
            "max-age" => cc.max_age = parse_seconds(d.arg),
            "min-fresh" => cc.min_fresh = parse_seconds(d.arg),
            "max-stale" => {
                cc.max_stale = Some(match d.arg {
                    Some(_) => parse_seconds(d.arg),
                    None => UNSET, // bare form: unbounded
                });
            }
            _ => {}
        }
    }
    cc
}

/// As [`parse_request_cache_control`], for response `Cache-Control` values.
pub fn parse_response_cache_control(header_value: &str) -> ResponseCacheControl {
    let mut cc = ResponseCacheControl { s_maxage: UNSET, max_age: UNSET, ..Default::default() };
    for d in directives(header_value) {
        match d.name.to_lowercase().as_str() {
            "no-cache" => cc.must_validate = true,
            "no-store" | "private" => cc.no_store = true,
            "no-transform" => cc.no_transform = true,
            "must-revalidate" | "proxy-revalidate" => cc.no_stale = true,
            "public" => cc.public = true,
            "s-maxage" => cc.s_maxage = parse_seconds(d.arg),
            "max-age" => cc.max_age = parse_seconds(d.arg),
            _ => {}
        }
    }
    cc
}

/// If the request carries no `Cache-Control` header at all but does carry
/// `Pragma: no-cache`, fold that into the request directives. Any other
/// Pragma directive is ignored, and Pragma is ignored entirely when
/// `Cache-Control` is present.
pub fn apply_pragma_fallback(
    cc: &mut RequestCacheControl,
    has_cache_control: bool,
    pragma: Option<&str>,
) {
    if has_cache_control {
        return;
    }
    if let Some(pragma) = pragma {
        if pragma.split(',').any(|p| p.trim().eq_ignore_ascii_case("no-cache")) {
            cc.no_cache = true;
        }
    }
}

/// The response's effective freshness lifetime in seconds, following
/// `s-maxage` (takes precedence), then `max-age`, then `Expires - Date`.
/// `None` means no freshness lifetime could be derived.
pub fn freshness_lifetime(
    cc: &ResponseCacheControl,
    date: Option<std::time::SystemTime>,
    expires: Option<std::time::SystemTime>,
) -> Option<i64> {
    if cc.s_maxage >= 0 {
        return Some(cc.s_maxage);
    }
    if cc.max_age >= 0 {
        return Some(cc.max_age);
    }
    match (date, expires) {
        (Some(date), Some(expires)) => {
            let secs = expires
                .duration_since(date)
                .map(|d| d.as_secs() as i64)
                .unwrap_or_else(|e| -(e.duration().as_secs() as i64));
            Some(secs)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_and_valued_directives() {
        let cc = parse_request_cache_control("no-cache, max-age=10, max-stale");
        assert!(cc.no_cache);
        assert_eq!(cc.max_age, 10);
        assert_eq!(cc.max_stale, Some(-1));
    }

    #[test]
    fn bad_numeric_argument_yields_unset() {
        let cc = parse_request_cache_control("max-age=notanumber");
        assert_eq!(cc.max_age, -1);
    }

    #[test]
    fn strips_quotes_from_arguments() {
        let cc = parse_response_cache_control("max-age=\"30\"");
        assert_eq!(cc.max_age, 30);
    }

    #[test]
    fn s_maxage_takes_precedence_over_max_age() {
        let cc = parse_response_cache_control("s-maxage=5, max-age=50");
        assert_eq!(freshness_lifetime(&cc, None, None), Some(5));
    }

    #[test]
    fn pragma_fallback_only_applies_without_cache_control() {
        let mut cc = RequestCacheControl { max_age: -1, min_fresh: -1, ..Default::default() };
        apply_pragma_fallback(&mut cc, false, Some("no-cache"));
        assert!(cc.no_cache);

        let mut cc2 = RequestCacheControl { max_age: 10, min_fresh: -1, ..Default::default() };
        apply_pragma_fallback(&mut cc2, true, Some("no-cache"));
        assert!(!cc2.no_cache);
    }

    #[test]
    fn no_store_and_private_both_set_no_store() {
        assert!(parse_response_cache_control("no-store").no_store);
        assert!(parse_response_cache_control("private").no_store);
    }
}
