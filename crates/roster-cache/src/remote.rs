//! Remote cache reached through a REST command endpoint.
//!
//! Each command is POSTed as a JSON array of strings (`["SET", key, ...]`)
//! with a bearer token; the reply is `{"result": ...}` or `{"error": "..."}`.

use crate::backend::{ttl_millis, BackendKind, CacheBackend, CacheError};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct RestReply {
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<String>,
}

pub struct RemoteCache {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl RemoteCache {
    pub fn new(base_url: &str, token: &str) -> Result<Self, CacheError> {
        if base_url.is_empty() || token.is_empty() {
            return Err(CacheError::NotConfigured(
                "remote cache URL and token are both required".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CacheError::NotConfigured(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn run(&self, command: &[String]) -> Result<serde_json::Value, CacheError> {
        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.token)
            .json(command)
            .send()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        let reply: RestReply = response
            .json()
            .await
            .map_err(|e| CacheError::Protocol(e.to_string()))?;
        if let Some(error) = reply.error {
            return Err(CacheError::Protocol(error));
        }
        Ok(reply.result)
    }
}

/// `SET ... NX` replies `"OK"` when the key was created and `null` otherwise.
fn parse_set_reply(value: &serde_json::Value) -> Result<bool, CacheError> {
    match value {
        serde_json::Value::Null => Ok(false),
        serde_json::Value::String(s) if s.eq_ignore_ascii_case("OK") => Ok(true),
        other => Err(CacheError::Protocol(format!("SET returned {other}"))),
    }
}

fn parse_ping_reply(value: &serde_json::Value) -> Result<(), CacheError> {
    match value.as_str() {
        Some(s) if s.eq_ignore_ascii_case("PONG") => Ok(()),
        _ => Err(CacheError::Protocol(format!("PING returned {value}"))),
    }
}

#[async_trait]
impl CacheBackend for RemoteCache {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn try_admit(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let command = vec![
            "SET".to_string(),
            key.to_string(),
            "1".to_string(),
            "NX".to_string(),
            "PX".to_string(),
            ttl_millis(ttl).to_string(),
        ];
        let reply = self.run(&command).await?;
        parse_set_reply(&reply)
    }

    async fn health_check(&self) -> Result<(), CacheError> {
        let reply = self.run(&["PING".to_string()]).await?;
        parse_ping_reply(&reply)
    }
}
