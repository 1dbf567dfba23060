use std::time::Duration;

/// TTL for a cached slot from a `Cache-Control` value.
///
/// `s-maxage` wins over `max-age`; missing or unparsable values fall back to
/// `default`, and every result is capped at `max`.
pub fn ttl_from_cache_control(value: Option<&str>, default: Duration, max: Duration) -> Duration {
    let directive = |name: &str| {
        value?.split(',').find_map(|part| {
            let (key, seconds) = part.trim().split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| seconds.trim().trim_matches('"').parse::<u64>().ok())
                .flatten()
        })
    };

    directive("s-maxage")
        .or_else(|| directive("max-age"))
        .map(Duration::from_secs)
        .unwrap_or(default)
        .min(max)
}
