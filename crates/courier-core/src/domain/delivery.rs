//! Delivery model: one message handed over by the broker.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// Message headers, keyed by name.
///
/// Broker-neutral on purpose: adapters convert their own table type into this
/// one and back, so a republished message carries the same headers it arrived
/// with.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A single header value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Bytes(Vec<u8>),
    /// Seconds since the Unix epoch.
    Timestamp(u64),
    List(Vec<HeaderValue>),
    Table(Headers),
    Void,
}

impl HeaderValue {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }
}

/// One unit handed by the broker for processing.
///
/// The tag is opaque to everything except the adapter that issued it.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

impl Delivery {
    pub fn new(tag: u64, body: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            body: body.into(),
            headers: Headers::new(),
            content_type: None,
            content_encoding: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: HeaderValue) -> Self {
        self.headers.insert(key.into(), value);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_encoding(mut self, content_encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(content_encoding.into());
        self
    }
}

/// A message to be published back to the work queue (the retry vehicle).
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub headers: Headers,
}

impl Publication {
    /// Copy of `delivery` for a retry: body, content type and encoding are
    /// verbatim, `headers` replaces the original set, timestamp is `now`.
    pub fn retry_of(delivery: &Delivery, headers: Headers, now: DateTime<Utc>) -> Self {
        Self {
            body: delivery.body.clone(),
            content_type: delivery.content_type.clone(),
            content_encoding: delivery.content_encoding.clone(),
            timestamp: now,
            headers,
        }
    }
}
