// HTTP side channel, independent of the persistent connection: one-shot
// history fetch and the presence seed.

use log::debug;
use serde::Deserialize;

use crate::models::ChatMessage;

use super::channel::ChatError;

#[derive(Deserialize)]
struct HistoryResponse {
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdminStatusResponse {
    is_online: bool,
}

#[derive(Clone)]
pub struct HistoryApi {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HistoryApi {
    pub fn new(base_url: &str, token: &str) -> Self {
        HistoryApi {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    /// GET /conversations/{participantId}/messages
    pub async fn fetch_messages(&self, participant_id: &str) -> Result<Vec<ChatMessage>, ChatError> {
        let url = format!("{}/conversations/{}/messages", self.base_url, participant_id);
        debug!("Fetching conversation history from {}", url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ChatError::History(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ChatError::History(format!(
                "server returned {}",
                response.status()
            )));
        }

        let body: HistoryResponse = response
            .json()
            .await
            .map_err(|e| ChatError::History(e.to_string()))?;
        debug!("Fetched {} history messages", body.messages.len());
        Ok(body.messages)
    }

    /// GET /admin/status
    pub async fn fetch_admin_status(&self) -> Result<bool, ChatError> {
        let url = format!("{}/admin/status", self.base_url);
        debug!("Fetching admin status from {}", url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ChatError::History(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ChatError::History(format!(
                "server returned {}",
                response.status()
            )));
        }

        let body: AdminStatusResponse = response
            .json()
            .await
            .map_err(|e| ChatError::History(e.to_string()))?;
        Ok(body.is_online)
    }
}
