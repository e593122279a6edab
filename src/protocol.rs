//! Wire protocol between the host and guest modules
//!
//! A request is serialized to JSON and handed to the guest entry point as its
//! sole input; the guest answers with a JSON response. Header maps keep the
//! key casing they were received with, so lookups go through the
//! case-insensitive helpers below.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;

/// Multi-valued header map, keyed by header name as received
pub type Headers = BTreeMap<String, Vec<String>>;

/// HTTP request as seen by a guest module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Full request URL including scheme, host and query
    #[serde(default)]
    pub url: String,
    /// HTTP method
    #[serde(default)]
    pub method: String,
    /// All header values, in arrival order
    #[serde(default)]
    pub headers: Headers,
    /// Raw body as text
    #[serde(default)]
    pub body: String,
}

impl Request {
    /// Encode as JSON bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from JSON bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// All values of a header, matching the name case-insensitively
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        header_values(&self.headers, name)
    }

    /// First value of a header, matching the name case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        header_values(&self.headers, name).into_iter().next()
    }
}

/// HTTP response produced by a guest module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Status code; zero means "use the default" (200)
    #[serde(default)]
    pub status_code: u16,
    /// Header values to append to the HTTP response
    #[serde(default)]
    pub headers: Headers,
    /// Response body
    #[serde(default)]
    pub body: String,
}

impl Response {
    /// Encode as JSON bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from JSON bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Status code with the zero default applied
    pub fn effective_status(&self) -> u16 {
        if self.status_code == 0 {
            200
        } else {
            self.status_code
        }
    }

    /// All values of a header, matching the name case-insensitively
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        header_values(&self.headers, name)
    }
}

/// Collect every value stored under `name`, ignoring ASCII case.
///
/// Keys differing only in case are visited in map order, so values from
/// `Cookie` come before values from `cookie`.
pub fn header_values<'a>(headers: &'a Headers, name: &str) -> Vec<&'a str> {
    headers
        .iter()
        .filter(|(key, _)| key.eq_ignore_ascii_case(name))
        .flat_map(|(_, values)| values.iter().map(String::as_str))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip_keeps_value_order() {
        let mut headers = Headers::new();
        headers.insert(
            "X-Multi".to_string(),
            vec!["one".to_string(), "two".to_string(), "three".to_string()],
        );
        let request = Request {
            url: "https://acme.example.com/hi?x=1".to_string(),
            method: "GET".to_string(),
            headers,
            body: String::new(),
        };

        let decoded = Request::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.header_values("x-multi"), vec!["one", "two", "three"]);
    }

    #[test]
    fn test_response_round_trip_with_empty_headers() {
        let response = Response {
            status_code: 204,
            headers: Headers::new(),
            body: String::new(),
        };
        let decoded = Response::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_response_uses_camel_case_status() {
        let response =
            Response::decode(br#"{"statusCode":201,"headers":{"X-Test":["a","b"]},"body":"ok"}"#)
                .unwrap();
        assert_eq!(response.status_code, 201);
        assert_eq!(response.header_values("x-test"), vec!["a", "b"]);
        assert_eq!(response.body, "ok");

        let encoded = String::from_utf8(response.encode().unwrap()).unwrap();
        assert!(encoded.contains("\"statusCode\":201"));
    }

    #[test]
    fn test_missing_fields_default() {
        let response = Response::decode(b"{}").unwrap();
        assert_eq!(response.status_code, 0);
        assert_eq!(response.effective_status(), 200);
        assert!(response.headers.is_empty());
    }

    #[test]
    fn test_header_lookup_preserves_key_casing() {
        let mut headers = Headers::new();
        headers.insert("Cookie".to_string(), vec!["session=abc".to_string()]);
        let request = Request {
            headers,
            ..Default::default()
        };

        assert_eq!(request.header("COOKIE"), Some("session=abc"));
        assert_eq!(request.header("cookie"), Some("session=abc"));
        assert!(request.headers.contains_key("Cookie"));
        assert!(!request.headers.contains_key("cookie"));
        assert_eq!(request.header("authorization"), None);
    }

    #[test]
    fn test_malformed_response_is_error() {
        assert!(Response::decode(b"not json").is_err());
        assert!(Response::decode(br#"{"statusCode":"ok"}"#).is_err());
    }
}
