//! CONNECT admission
//!
//! A filter sees every parsed CONNECT request before a session is opened for
//! it. No filter configured means allow-all.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::common::Address;

/// A parsed CONNECT request as a filter sees it
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// The tunnel target the client asked for
    pub target: Address,
    /// Header fields, keys lowercased
    pub headers: Vec<(String, String)>,
}

impl ConnectRequest {
    /// Look up a header by its lowercase name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Decides whether a CONNECT request may open a session
pub trait Filter: Send + Sync {
    fn allow(&self, request: &ConnectRequest) -> bool;
}

/// Checks `Proxy-Authorization: Basic` credentials
pub struct BasicAuthFilter {
    expected: String,
}

impl BasicAuthFilter {
    pub fn new(username: &str, password: &str) -> Self {
        let credentials = format!("{}:{}", username, password);
        Self {
            expected: format!("Basic {}", BASE64.encode(credentials)),
        }
    }
}

impl Filter for BasicAuthFilter {
    fn allow(&self, request: &ConnectRequest) -> bool {
        request
            .header("proxy-authorization")
            .map(|value| value == self.expected)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: Vec<(String, String)>) -> ConnectRequest {
        ConnectRequest {
            target: Address::domain("example.com", 443),
            headers,
        }
    }

    #[test]
    fn missing_header_is_rejected() {
        let filter = BasicAuthFilter::new("admin", "hunter2");
        assert!(!filter.allow(&request(vec![])));
    }

    #[test]
    fn wrong_credentials_are_rejected() {
        let filter = BasicAuthFilter::new("admin", "hunter2");
        let req = request(vec![(
            "proxy-authorization".to_string(),
            "Basic d3Jvbmc6d3Jvbmc=".to_string(),
        )]);
        assert!(!filter.allow(&req));
    }

    #[test]
    fn matching_credentials_are_allowed() {
        let filter = BasicAuthFilter::new("admin", "hunter2");
        let req = request(vec![(
            "proxy-authorization".to_string(),
            "Basic YWRtaW46aHVudGVyMg==".to_string(),
        )]);
        assert!(filter.allow(&req));
    }
}
