//! Retry counter carried inside message headers.
//!
//! On the wire the counter is a decimal string under [`RETRY_COUNT_HEADER`].
//! Internally it is parsed once into [`RetryCount`] and never touched as text
//! again.

use std::fmt;

use super::delivery::{HeaderValue, Headers};

/// Header key holding the retry counter.
pub const RETRY_COUNT_HEADER: &str = "retry_count";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RetryHeaderError {
    #[error("retry header \"retry_count\" is not a non-negative integer: {0:?}")]
    NotANumber(String),

    #[error("retry header \"retry_count\" has unsupported type: {0}")]
    UnsupportedType(&'static str),
}

/// How many times a logical message has already been retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RetryCount(u32);

impl RetryCount {
    pub const ZERO: Self = Self(0);

    pub fn new(n: u32) -> Self {
        Self(n)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Read the counter from headers. A missing header means zero.
    pub fn from_headers(headers: &Headers) -> Result<Self, RetryHeaderError> {
        match headers.get(RETRY_COUNT_HEADER) {
            None => Ok(Self::ZERO),
            Some(HeaderValue::Text(s)) => s
                .parse::<u32>()
                .map(Self)
                .map_err(|_| RetryHeaderError::NotANumber(s.clone())),
            Some(HeaderValue::Integer(n)) => u32::try_from(*n)
                .map(Self)
                .map_err(|_| RetryHeaderError::NotANumber(n.to_string())),
            Some(other) => Err(RetryHeaderError::UnsupportedType(type_name(other))),
        }
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Wire form of the counter.
    pub fn to_header(self) -> HeaderValue {
        HeaderValue::Text(self.0.to_string())
    }

    /// `headers` with the counter replaced by `self`.
    pub fn stamp(self, headers: &Headers) -> Headers {
        let mut out = headers.clone();
        out.insert(RETRY_COUNT_HEADER.to_string(), self.to_header());
        out
    }
}

impl fmt::Display for RetryCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

fn type_name(value: &HeaderValue) -> &'static str {
    match value {
        HeaderValue::Text(_) => "text",
        HeaderValue::Integer(_) => "integer",
        HeaderValue::Float(_) => "float",
        HeaderValue::Boolean(_) => "boolean",
        HeaderValue::Bytes(_) => "bytes",
        HeaderValue::Timestamp(_) => "timestamp",
        HeaderValue::List(_) => "list",
        HeaderValue::Table(_) => "table",
        HeaderValue::Void => "void",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn headers_with(value: HeaderValue) -> Headers {
        let mut h = Headers::new();
        h.insert(RETRY_COUNT_HEADER.to_string(), value);
        h
    }

    #[test]
    fn missing_header_is_zero() {
        assert_eq!(RetryCount::from_headers(&Headers::new()), Ok(RetryCount::ZERO));
    }

    #[test]
    fn missing_header_equals_explicit_zero() {
        let explicit = RetryCount::from_headers(&headers_with(HeaderValue::text("0")));
        assert_eq!(explicit, RetryCount::from_headers(&Headers::new()));
    }

    #[rstest]
    #[case(HeaderValue::text("0"), 0)]
    #[case(HeaderValue::text("7"), 7)]
    #[case(HeaderValue::Integer(3), 3)]
    fn parses_numeric_values(#[case] value: HeaderValue, #[case] expected: u32) {
        let count = RetryCount::from_headers(&headers_with(value)).unwrap();
        assert_eq!(count.get(), expected);
    }

    #[rstest]
    #[case(HeaderValue::text("abc"))]
    #[case(HeaderValue::text("-1"))]
    #[case(HeaderValue::text(""))]
    #[case(HeaderValue::text(" 2 "))]
    #[case(HeaderValue::Integer(-4))]
    #[case(HeaderValue::Boolean(true))]
    fn rejects_malformed_values(#[case] value: HeaderValue) {
        assert!(RetryCount::from_headers(&headers_with(value)).is_err());
    }

    #[test]
    fn stamp_only_touches_the_counter() {
        let mut original = Headers::new();
        original.insert("trace".to_string(), HeaderValue::text("abc"));
        original.insert(RETRY_COUNT_HEADER.to_string(), HeaderValue::text("1"));

        let stamped = RetryCount::new(1).next().stamp(&original);

        assert_eq!(stamped.get("trace"), Some(&HeaderValue::text("abc")));
        assert_eq!(stamped.get(RETRY_COUNT_HEADER), Some(&HeaderValue::text("2")));
        assert_eq!(stamped.len(), 2);
    }
}
