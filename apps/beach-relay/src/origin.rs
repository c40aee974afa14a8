use axum::http::{header, HeaderMap, Uri};
use thiserror::Error;

/// Which browser origins may open a relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginPolicy {
    /// Every origin is accepted. Only reachable through an explicit
    /// development flag.
    Disabled,
    /// Same-host origins plus the listed patterns (`host`, `host:port`,
    /// `*.domain`).
    SameHostOr(Vec<String>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OriginError {
    #[error("origin {0:?} is not allowed")]
    NotAllowed(String),
    #[error("origin header {0:?} is malformed")]
    Malformed(String),
}

impl Default for OriginPolicy {
    fn default() -> Self {
        OriginPolicy::SameHostOr(Vec::new())
    }
}

impl OriginPolicy {
    pub fn allow<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        OriginPolicy::SameHostOr(
            patterns
                .into_iter()
                .map(|p| p.as_ref().trim().to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        )
    }

    /// Requests without an `Origin` header come from non-browser clients and
    /// are always accepted.
    pub fn check(&self, headers: &HeaderMap) -> Result<(), OriginError> {
        let patterns = match self {
            OriginPolicy::Disabled => return Ok(()),
            OriginPolicy::SameHostOr(patterns) => patterns,
        };
        let Some(origin) = headers.get(header::ORIGIN) else {
            return Ok(());
        };
        let origin = origin
            .to_str()
            .map_err(|_| OriginError::Malformed(String::from_utf8_lossy(origin.as_bytes()).into()))?;
        let authority = origin
            .parse::<Uri>()
            .ok()
            .filter(|uri| uri.scheme().is_some())
            .and_then(|uri| uri.authority().map(|a| a.as_str().to_ascii_lowercase()))
            .ok_or_else(|| OriginError::Malformed(origin.to_string()))?;

        let same_host = headers
            .get(header::HOST)
            .and_then(|host| host.to_str().ok())
            .is_some_and(|host| host.eq_ignore_ascii_case(&authority));
        if same_host || patterns.iter().any(|p| matches_pattern(p, &authority)) {
            Ok(())
        } else {
            Err(OriginError::NotAllowed(origin.to_string()))
        }
    }
}

fn matches_pattern(pattern: &str, authority: &str) -> bool {
    // Patterns without a port match any port.
    let candidate = if pattern.contains(':') {
        authority
    } else {
        authority
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(authority)
    };
    match pattern.strip_prefix("*.") {
        Some(suffix) => candidate
            .strip_suffix(suffix)
            .is_some_and(|rest| rest.ends_with('.')),
        None => candidate == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(origin: Option<&str>, host: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_str(host).unwrap());
        if let Some(origin) = origin {
            headers.insert(header::ORIGIN, HeaderValue::from_str(origin).unwrap());
        }
        headers
    }

    #[test]
    fn missing_origin_is_accepted() {
        let policy = OriginPolicy::default();
        assert!(policy.check(&headers(None, "relay.example.com")).is_ok());
    }

    #[test]
    fn same_host_is_accepted_by_default() {
        let policy = OriginPolicy::default();
        assert!(policy
            .check(&headers(Some("https://relay.example.com"), "relay.example.com"))
            .is_ok());
        assert!(policy
            .check(&headers(Some("http://localhost:4000"), "localhost:4000"))
            .is_ok());
        assert_eq!(
            policy.check(&headers(Some("https://evil.test"), "relay.example.com")),
            Err(OriginError::NotAllowed("https://evil.test".into()))
        );
    }

    #[test]
    fn patterns_match_hosts_ports_and_subdomains() {
        let policy = OriginPolicy::allow(["app.example.com", "localhost:5173", "*.beach.dev"]);
        let host = "relay.internal:4000";
        assert!(policy.check(&headers(Some("https://app.example.com"), host)).is_ok());
        assert!(policy.check(&headers(Some("https://app.example.com:8443"), host)).is_ok());
        assert!(policy.check(&headers(Some("http://localhost:5173"), host)).is_ok());
        assert!(policy.check(&headers(Some("http://localhost:3000"), host)).is_err());
        assert!(policy.check(&headers(Some("https://web.beach.dev"), host)).is_ok());
        assert!(policy.check(&headers(Some("https://beach.dev"), host)).is_err());
        assert!(policy.check(&headers(Some("https://evilbeach.dev"), host)).is_err());
    }

    #[test]
    fn disabled_policy_accepts_anything() {
        let policy = OriginPolicy::Disabled;
        assert!(policy.check(&headers(Some("https://evil.test"), "relay")).is_ok());
    }

    #[test]
    fn malformed_origin_is_rejected() {
        let policy = OriginPolicy::default();
        assert!(matches!(
            policy.check(&headers(Some("null"), "relay")),
            Err(OriginError::Malformed(_))
        ));
    }
}
