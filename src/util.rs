use std::collections::HashMap;
use std::time::Duration;

/// Parses an HTTP `Link` header value into `rel -> url` pairs, e.g.
/// `<https://ca/issuer>; rel="up", <https://ca/x>; rel="alternate"`.
#[must_use]
pub fn parse_link_header(value: &str) -> HashMap<String, String> {
    let mut links = HashMap::new();
    for entry in value.split(',') {
        let mut parts = entry.split(';');
        let Some(url_part) = parts.next() else { continue };
        let url = url_part.trim().trim_start_matches('<').trim_end_matches('>');
        if url.is_empty() {
            continue;
        }
        for param in parts {
            let param = param.trim();
            if let Some(rel) = param.strip_prefix("rel=") {
                let rel = rel.trim_matches('"');
                links.insert(rel.to_string(), url.to_string());
            }
        }
    }
    links
}

/// Generates a doubling-backoff schedule starting at `floor`, doubling each
/// step, capped at `cap`, for up to `total_timeout` of cumulative delay.
#[must_use]
pub fn backoff_schedule(floor: Duration, cap: Duration, total_timeout: Duration) -> Vec<Duration> {
    let mut schedule = Vec::new();
    let mut elapsed = Duration::ZERO;
    let mut step = floor;
    while elapsed < total_timeout {
        let remaining = total_timeout - elapsed;
        let this_step = step.min(remaining);
        if this_step.is_zero() {
            break;
        }
        schedule.push(this_step);
        elapsed += this_step;
        step = (step * 2).min(cap);
    }
    schedule
}
