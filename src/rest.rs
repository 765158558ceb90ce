//! REST collaborators backed by the chat server's HTTP API.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use log::debug;
use serde::Serialize;
use serde::de::DeserializeOwned;
use wirecore::{ChatMessage, ParticipantId, User};

use crate::store::{ChatStore, UserDirectory};

/// HTTP client for the chat server. Since `ureq` is blocking, every request
/// runs inside `tokio::task::spawn_blocking`.
#[derive(Debug, Clone)]
pub struct RestClient {
    http_base: String,
    token: String,
}

#[derive(Serialize)]
struct NewMessage<'a> {
    content: &'a str,
}

impl RestClient {
    pub fn new(http_base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http_base: http_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    pub fn messages_url(&self, receiver_id: ParticipantId) -> String {
        format!("{}/api/messages/{}/", self.http_base, receiver_id)
    }

    pub fn users_url(&self) -> String {
        format!("{}/api/users/", self.http_base)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn get<T: DeserializeOwned + Send + 'static>(&self, url: String) -> Result<T> {
        let auth = self.bearer();
        debug!(target: "Rest", "GET {url}");
        tokio::task::spawn_blocking(move || {
            let response = ureq::get(&url)
                .header("Authorization", &auth)
                .header("Accept", "application/json")
                .call()
                .with_context(|| format!("GET {url}"))?;
            let body = response.into_body().read_to_vec()?;
            serde_json::from_slice(&body).with_context(|| format!("decoding response of {url}"))
        })
        .await?
    }

    async fn post<T: DeserializeOwned + Send + 'static>(
        &self,
        url: String,
        body: Vec<u8>,
    ) -> Result<T> {
        let auth = self.bearer();
        debug!(target: "Rest", "POST {url}");
        tokio::task::spawn_blocking(move || {
            let response = ureq::post(&url)
                .header("Authorization", &auth)
                .header("Content-Type", "application/json")
                .send(&body[..])
                .with_context(|| format!("POST {url}"))?;
            let status = response.status().as_u16();
            if !(200..300).contains(&status) {
                return Err(anyhow!("POST {url} returned {status}"));
            }
            let body = response.into_body().read_to_vec()?;
            serde_json::from_slice(&body).with_context(|| format!("decoding response of {url}"))
        })
        .await?
    }
}

#[async_trait]
impl ChatStore for RestClient {
    async fn send_message(&self, receiver_id: ParticipantId, content: &str) -> Result<ChatMessage> {
        let body = serde_json::to_vec(&NewMessage { content })?;
        self.post(self.messages_url(receiver_id), body).await
    }

    async fn messages(&self, receiver_id: ParticipantId) -> Result<Vec<ChatMessage>> {
        self.get(self.messages_url(receiver_id)).await
    }
}

#[async_trait]
impl UserDirectory for RestClient {
    async fn users(&self) -> Result<Vec<User>> {
        self.get(self.users_url()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let client = RestClient::new("http://localhost:8000/", "t");
        assert_eq!(client.messages_url(7), "http://localhost:8000/api/messages/7/");
        assert_eq!(client.users_url(), "http://localhost:8000/api/users/");
        assert_eq!(client.bearer(), "Bearer t");
    }

    #[test]
    fn test_new_message_body() {
        let body = serde_json::to_string(&NewMessage { content: "hi" }).unwrap();
        assert_eq!(body, r#"{"content":"hi"}"#);
    }
}
