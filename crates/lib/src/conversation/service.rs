//! Remote conversation service: create a conversation, fetch its details.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Body of `POST /api/conversations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    pub initial_user_msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

/// A conversation the service just created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedConversation {
    pub conversation_id: String,
    /// Service-reported status (e.g. "ok"), when present.
    pub status: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("response is not valid JSON: {0}")]
    Decode(String),
    #[error("response has no conversation_id")]
    MissingConversationId,
    #[error("invalid service url {0}")]
    InvalidUrl(String),
}

/// Creates conversations. The controller only needs this one call.
#[async_trait]
pub trait ConversationService: Send + Sync {
    async fn create_conversation(
        &self,
        request: &CreateConversationRequest,
    ) -> Result<CreatedConversation, ConversationError>;
}

/// Parse a creation response body. The `conversation_id` must be a string that is not
/// blank; it is kept exactly as sent.
pub fn parse_created_conversation(body: &str) -> Result<CreatedConversation, ConversationError> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| ConversationError::Decode(e.to_string()))?;
    let conversation_id = value
        .get("conversation_id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or(ConversationError::MissingConversationId)?
        .to_string();
    let status = value
        .get("status")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    Ok(CreatedConversation {
        conversation_id,
        status,
    })
}

/// HTTP client for the conversation API.
#[derive(Clone)]
pub struct HttpConversationService {
    base_url: String,
    client: reqwest::Client,
}

impl HttpConversationService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `{base_url}/seg/seg/..`, each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url, ConversationError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| ConversationError::InvalidUrl(format!("{}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| ConversationError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// GET /api/conversations/{id}: raw conversation details.
    pub async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<serde_json::Value, ConversationError> {
        let url = self.endpoint(&["api", "conversations", conversation_id])?;
        let res = self.client.get(url).send().await?;
        let status = res.status();
        let body = res.text().await?;
        if !status.is_success() {
            return Err(ConversationError::Status {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| ConversationError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ConversationService for HttpConversationService {
    /// POST /api/conversations. Only a 200 with a conversation id counts as success.
    async fn create_conversation(
        &self,
        request: &CreateConversationRequest,
    ) -> Result<CreatedConversation, ConversationError> {
        let url = self.endpoint(&["api", "conversations"])?;
        log::debug!("creating conversation via {}", url);
        let res = self.client.post(url).json(request).send().await?;
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        if status != reqwest::StatusCode::OK {
            return Err(ConversationError::Status {
                status: status.as_u16(),
                body,
            });
        }
        parse_created_conversation(&body)
    }
}
