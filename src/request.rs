//! Replayable view of an inbound HTTP request.
//!
//! The body is buffered once at handler entry so that several downstream
//! consumers (an in-process source plus a remote forwarder, for instance)
//! can each read it in full.

use axum::http::{HeaderMap, Method, Uri};
use bytes::{Buf, Bytes};
use serde::de::DeserializeOwned;

use crate::error::{BrokerError, BrokerResult};

/// Method, path, query, headers and buffered body of an NGSI-LD API request.
#[derive(Debug, Clone)]
pub struct RequestWrapper {
    method: Method,
    path: String,
    raw_query: String,
    headers: HeaderMap,
    body: Bytes,
}

impl RequestWrapper {
    pub fn new(method: Method, uri: &Uri, headers: HeaderMap, body: Bytes) -> Self {
        RequestWrapper {
            method,
            path: uri.path().to_string(),
            raw_query: uri.query().unwrap_or_default().to_string(),
            headers,
            body,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn raw_query(&self) -> &str {
        &self.raw_query
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the named header as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// A fresh reader over the buffered body bytes.
    pub fn body_reader(&self) -> impl std::io::Read {
        self.body.clone().reader()
    }

    pub fn body_bytes(&self) -> Bytes {
        self.body.clone()
    }

    /// Parses the buffered body as JSON.
    pub fn decode_body_into<T: DeserializeOwned>(&self) -> BrokerResult<T> {
        serde_json::from_slice(&self.body).map_err(|e| BrokerError::bad_parameter(e.to_string()))
    }
}
