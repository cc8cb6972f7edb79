//! Response backend client
//!
//! The backend turns an utterance into reply text, optionally executing
//! tools along the way. It is reached over HTTP with a short timeout and a
//! fallback route that is tried when the primary one fails.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::{Error, Result};

/// Request sent to the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendRequest {
    /// What the user said
    pub text: String,

    /// Whether the backend may execute tools for this request
    pub tools_enabled: bool,
}

/// Reply returned by the backend
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackendReply {
    /// Text to speak, may be empty
    #[serde(default, alias = "reply", alias = "response")]
    pub reply_text: String,
}

/// Something that answers utterances
#[async_trait]
pub trait ResponseBackend: Send + Sync {
    /// Produce a reply for `request`
    async fn respond(&self, request: BackendRequest) -> Result<BackendReply>;
}

/// Backend reached over HTTP
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    route: String,
    fallback_route: Option<String>,
}

impl HttpBackend {
    /// Create a client for the configured backend
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            route: config.route.clone(),
            fallback_route: config.fallback_route.clone(),
        })
    }

    fn url(&self, route: &str) -> String {
        format!("{}/{}", self.base_url, route.trim_start_matches('/'))
    }

    async fn post(&self, route: &str, request: &BackendRequest) -> Result<BackendReply> {
        let response = self
            .client
            .post(self.url(route))
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Backend(format!("{route} returned {status}: {body}")));
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl ResponseBackend for HttpBackend {
    async fn respond(&self, request: BackendRequest) -> Result<BackendReply> {
        tracing::debug!(
            route = %self.route,
            tools_enabled = request.tools_enabled,
            "backend request"
        );

        match self.post(&self.route, &request).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                let Some(fallback) = &self.fallback_route else {
                    return Err(e);
                };
                tracing::warn!(error = %e, fallback = %fallback, "primary backend route failed");
                self.post(fallback, &request).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_aliases() {
        let reply: BackendReply = serde_json::from_str(r#"{"reply_text":"ok"}"#).unwrap();
        assert_eq!(reply.reply_text, "ok");

        let reply: BackendReply = serde_json::from_str(r#"{"response":"done"}"#).unwrap();
        assert_eq!(reply.reply_text, "done");

        let reply: BackendReply = serde_json::from_str(r#"{"reply":"yes","extra":1}"#).unwrap();
        assert_eq!(reply.reply_text, "yes");

        let reply: BackendReply = serde_json::from_str("{}").unwrap();
        assert!(reply.reply_text.is_empty());
    }

    #[test]
    fn test_request_shape() {
        let request = BackendRequest {
            text: "turn on the lights".to_string(),
            tools_enabled: true,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["text"], "turn on the lights");
        assert_eq!(json["tools_enabled"], true);
    }

    #[test]
    fn test_url_joining() {
        let backend = HttpBackend::new(&BackendConfig {
            base_url: "http://localhost:8000/".to_string(),
            ..BackendConfig::default()
        })
        .unwrap();
        assert_eq!(backend.url("/respond"), "http://localhost:8000/respond");
        assert_eq!(backend.url("chat"), "http://localhost:8000/chat");
    }
}
