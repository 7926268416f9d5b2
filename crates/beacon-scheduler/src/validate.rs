//! Creation-time checks for new tasks.

use std::ops::RangeInclusive;

use url::Url;

use crate::error::ValidationError;
use crate::types::NewTask;

pub const REPEAT_RANGE: RangeInclusive<u32> = 1..=10_000;
pub const MIN_INTERVAL_MS: u64 = 100;
pub const TIMEOUT_RANGE_MS: RangeInclusive<u64> = 1_000..=120_000;
pub const USER_AGENT_LEN: RangeInclusive<usize> = 1..=512;
pub const VIEWPORT_RANGE: RangeInclusive<u32> = 100..=8_192;

/// Whether `url` targets a blocked host.
///
/// A URL that does not parse, or has no host, counts as blocked. Blank suffixes
/// are ignored and matching is case-insensitive.
pub fn is_blocked_host(url: &str, blocked: &[String]) -> bool {
    let Some(host) = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
    else {
        return true;
    };

    blocked
        .iter()
        .map(|suffix| suffix.trim().to_lowercase())
        .filter(|suffix| !suffix.is_empty())
        .any(|suffix| host.ends_with(&suffix))
}

/// Check a URL against the blocklist and require an http(s) scheme.
pub fn validate_url(url: &str, blocked: &[String]) -> Result<(), ValidationError> {
    if is_blocked_host(url, blocked) {
        return Err(ValidationError::BlockedHost(url.to_string()));
    }

    let lower = url.to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return Err(ValidationError::UnsupportedScheme(url.to_string()));
    }

    Ok(())
}

/// Validate a creation request in full.
pub fn validate_new_task(spec: &NewTask, blocked: &[String]) -> Result<(), ValidationError> {
    validate_url(&spec.url, blocked)?;

    if !REPEAT_RANGE.contains(&spec.repeat) {
        return Err(ValidationError::RepeatOutOfRange(spec.repeat));
    }
    if spec.interval_ms < MIN_INTERVAL_MS {
        return Err(ValidationError::IntervalTooShort(spec.interval_ms));
    }

    let options = &spec.options;
    if let Some(timeout) = options.timeout_ms {
        if !TIMEOUT_RANGE_MS.contains(&timeout) {
            return Err(ValidationError::TimeoutOutOfRange(timeout));
        }
    }
    if let Some(ua) = &options.user_agent {
        if !USER_AGENT_LEN.contains(&ua.chars().count()) {
            return Err(ValidationError::UserAgentLength);
        }
    }
    if let Some(vp) = options.viewport {
        if !VIEWPORT_RANGE.contains(&vp.width) || !VIEWPORT_RANGE.contains(&vp.height) {
            return Err(ValidationError::ViewportOutOfRange {
                width: vp.width,
                height: vp.height,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Viewport;

    fn blocked(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_blocked_suffix_matches_case_insensitively() {
        let list = blocked(&["internal.corp", " LOCALHOST "]);
        assert!(is_blocked_host("https://api.internal.corp/x", &list));
        assert!(is_blocked_host("http://LocalHost:8080/", &list));
        assert!(!is_blocked_host("https://example.com", &list));
    }

    #[test]
    fn test_malformed_url_is_blocked() {
        assert!(is_blocked_host("not a url", &[]));
        assert!(is_blocked_host("https://", &[]));
        assert_eq!(
            validate_url("::::", &[]),
            Err(ValidationError::BlockedHost("::::".to_string()))
        );
    }

    #[test]
    fn test_blank_entries_are_ignored() {
        let list = blocked(&["", "  "]);
        assert!(!is_blocked_host("https://example.com", &list));
    }

    #[test]
    fn test_scheme_must_be_http() {
        assert!(matches!(
            validate_url("ftp://example.com/file", &[]),
            Err(ValidationError::UnsupportedScheme(_))
        ));
        assert!(validate_url("HTTPS://example.com", &[]).is_ok());
    }

    #[test]
    fn test_ranges() {
        let ok = NewTask::new("https://example.com", 3, 100);
        assert!(validate_new_task(&ok, &[]).is_ok());

        let zero = NewTask::new("https://example.com", 0, 100);
        assert_eq!(
            validate_new_task(&zero, &[]),
            Err(ValidationError::RepeatOutOfRange(0))
        );

        let too_many = NewTask::new("https://example.com", 10_001, 100);
        assert!(validate_new_task(&too_many, &[]).is_err());

        let fast = NewTask::new("https://example.com", 1, 99);
        assert_eq!(
            validate_new_task(&fast, &[]),
            Err(ValidationError::IntervalTooShort(99))
        );
    }

    #[test]
    fn test_option_ranges() {
        let mut spec = NewTask::new("https://example.com", 1, 100);
        spec.options.timeout_ms = Some(500);
        assert_eq!(
            validate_new_task(&spec, &[]),
            Err(ValidationError::TimeoutOutOfRange(500))
        );

        spec.options.timeout_ms = Some(30_000);
        spec.options.user_agent = Some(String::new());
        assert_eq!(
            validate_new_task(&spec, &[]),
            Err(ValidationError::UserAgentLength)
        );

        spec.options.user_agent = Some("beacon/1.0".to_string());
        spec.options.viewport = Some(Viewport {
            width: 50,
            height: 600,
        });
        assert!(matches!(
            validate_new_task(&spec, &[]),
            Err(ValidationError::ViewportOutOfRange { width: 50, .. })
        ));

        spec.options.viewport = Some(Viewport {
            width: 1280,
            height: 720,
        });
        assert!(validate_new_task(&spec, &[]).is_ok());
    }
}
