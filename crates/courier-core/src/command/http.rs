//! HTTP strategy: POST the raw payload to a fixed URL.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

use super::{Command, CommandError, CommandFactory};

/// Builds [`HttpCommand`]s sharing one client.
///
/// The client keeps no idle connections, so every attempt opens its own.
#[derive(Debug, Clone)]
pub struct HttpFactory {
    client: reqwest::Client,
    url: String,
    content_type: String,
}

impl HttpFactory {
    pub fn new(url: impl Into<String>, content_type: impl Into<String>) -> Result<Self, CommandError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| CommandError::Client(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            content_type: content_type.into(),
        })
    }
}

impl CommandFactory for HttpFactory {
    fn create(&self, payload: &[u8]) -> Box<dyn Command> {
        Box::new(HttpCommand {
            client: self.client.clone(),
            url: self.url.clone(),
            content_type: self.content_type.clone(),
            body: payload.to_vec(),
        })
    }
}

#[derive(Debug)]
pub struct HttpCommand {
    client: reqwest::Client,
    url: String,
    content_type: String,
    body: Vec<u8>,
}

#[async_trait]
impl Command for HttpCommand {
    /// Success is any 2xx. The response body is only read on failure and
    /// becomes the error detail; on success the output is always empty.
    async fn execute(self: Box<Self>) -> Result<Vec<u8>, CommandError> {
        let resp = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, &self.content_type)
            .body(self.body)
            .send()
            .await
            .map_err(|e| CommandError::Network(e.to_string()))?;

        if resp.status().is_success() {
            return Ok(Vec::new());
        }

        let detail = resp
            .text()
            .await
            .map_err(|e| CommandError::Network(e.to_string()))?;
        Err(CommandError::HttpStatus(detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;

    #[tokio::test]
    async fn posts_raw_payload_with_configured_content_type() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/y")
                    .header("content-type", "application/octet-stream")
                    .body("raw \u{1} bytes");
                then.status(200).body("ignored");
            })
            .await;

        let out = HttpFactory::new(server.url("/y"), "application/octet-stream")
            .unwrap()
            .create("raw \u{1} bytes".as_bytes())
            .execute()
            .await
            .unwrap();

        mock.assert_async().await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn any_2xx_is_success() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/y");
                then.status(204);
            })
            .await;

        let res = HttpFactory::new(server.url("/y"), "application/json")
            .unwrap()
            .create(b"{}")
            .execute()
            .await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn server_error_yields_response_body_as_detail() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/y");
                then.status(500).body("boom");
            })
            .await;

        let err = HttpFactory::new(server.url("/y"), "application/json")
            .unwrap()
            .create(b"P")
            .execute()
            .await
            .unwrap_err();

        assert!(matches!(&err, CommandError::HttpStatus(detail) if detail == "boom"));
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_network_error() {
        let err = HttpFactory::new("http://127.0.0.1:1/y", "application/json")
            .unwrap()
            .create(b"P")
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Network(_)));
    }
}
