// uhdslave/src/context.rs
//
// The transport-facing request view. The reverse-proxy front constructs a
// `RequestHead` per request, runs the pipeline against it, and carries the
// `RequestContext` through to the log phase. Nothing here depends on the
// transport's own types.

use std::net::IpAddr;

use crate::types::Fingerprint;

// ── Request head ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method:    String,
    pub path:      String,
    /// Decoded query parameters in arrival order.
    pub query:     Vec<(String, String)>,
    /// Headers in arrival order.
    pub headers:   Vec<(String, String)>,
    pub client_ip: IpAddr,
}

impl RequestHead {
    /// Build from a raw request line URI (`/path?a=b`) and header list.
    pub fn new(
        method: impl Into<String>,
        uri: &str,
        headers: Vec<(String, String)>,
        client_ip: IpAddr,
    ) -> Self {
        let (path, query_raw) = match uri.split_once('?') {
            Some((p, q)) => (p.to_string(), q),
            None         => (uri.to_string(), ""),
        };
        let query = query_raw
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                (k.to_string(), decode(v))
            })
            .collect();
        Self { method: method.into(), path, query, headers, client_ip }
    }

    /// Find a header value (case-insensitive, first match).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Find a query parameter (case-sensitive, first match).
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("User-Agent")
    }
}

fn decode(value: &str) -> String {
    urlencoding::decode(value)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

// ── Per-request context ───────────────────────────────────────────────────────

/// State the access phase leaves behind for the transport and the log phase:
/// the resolved fingerprint, a throttle directive if any stage asked for one,
/// and whether the stream gate saw an already-admitted session.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub fingerprint:       Option<Fingerprint>,
    pub throttle_rate_bps: Option<u64>,
    pub session_continued: bool,
    pub user_agent:        Option<String>,
}

/// Response-side facts the transport hands to the log phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseMeta {
    pub status:           u16,
    pub bytes_sent:       u64,
    pub request_time_ms:  u64,
    pub upstream_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(uri: &str) -> RequestHead {
        RequestHead::new("GET", uri, vec![("User-Agent".into(), "Infuse/7.8.1".into())], "10.0.0.1".parse().unwrap())
    }

    #[test]
    fn query_parameters_are_url_decoded() {
        let h = head("/Videos/abc/stream?PlaySessionId=P%3A1&DeviceId=d1&empty=");
        assert_eq!(h.path, "/Videos/abc/stream");
        assert_eq!(h.query_param("PlaySessionId"), Some("P:1"));
        assert_eq!(h.query_param("DeviceId"), Some("d1"));
        assert_eq!(h.query_param("empty"), Some(""));
        assert_eq!(h.query_param("missing"), None);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let h = head("/anything");
        assert_eq!(h.header("user-agent"), Some("Infuse/7.8.1"));
        assert_eq!(h.header("X-Emby-Token"), None);
    }

    #[test]
    fn query_params_are_case_sensitive() {
        let h = head("/x?deviceId=lower");
        assert_eq!(h.query_param("deviceId"), Some("lower"));
        assert_eq!(h.query_param("DeviceId"), None);
    }
}
