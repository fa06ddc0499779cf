//! Signaling Client: a small HTTP/JSON rendezvous client against an
//! external key/value signaling endpoint.
//!
//! Grounded in this codebase's existing `reqwest`-based controller/agent
//! exchange (heartbeat POST, JSON GET), generalized to a publish/fetch/
//! checkUpdates/watch contract, with a graduated retry/backoff schedule
//! instead of a flat poll.

use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

const RAPID_RETRY_ATTEMPTS: u32 = 3;
const RAPID_RETRY_DELAY: Duration = Duration::from_millis(200);
const BACKOFF_CAP: Duration = Duration::from_secs(5);
const NOT_FOUND_BACKOFF_MULTIPLIER: f64 = 1.2;
const TRANSPORT_ERROR_BACKOFF_MULTIPLIER: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    role: &'a str,
    room: &'a str,
    data: &'a str,
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    #[allow(dead_code)]
    status: String,
    #[allow(dead_code)]
    mapping_version: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CheckUpdatesResponse {
    has_update: bool,
    #[allow(dead_code)]
    version: u64,
    client_data: Option<String>,
}

/// Thin HTTP client over the external signaling endpoint. Owns its own
/// bounded idle connection pool via `reqwest::Client`.
#[derive(Clone)]
pub struct SignalingClient {
    http: Client,
    base_url: String,
}

impl SignalingClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builds with static config");

        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// POST `{role, room, data}`. Idempotent, last-writer-wins for that role.
    pub async fn publish(&self, role: Role, room_id: &str, payload: &str) -> Result<()> {
        let body = PublishRequest {
            role: role.as_str(),
            room: room_id,
            data: payload,
        };

        let resp = self
            .http
            .post(&self.base_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::signaling(format!("publish failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::signaling(format!(
                "publish returned status {}",
                resp.status()
            )));
        }

        let _: PublishResponse = resp
            .json()
            .await
            .map_err(|e| Error::signaling(format!("publish response malformed: {e}")))?;

        Ok(())
    }

    /// GET the raw payload for `role` in `room_id`, retrying with the
    /// graduated backoff schedule until `deadline` elapses.
    pub async fn fetch(&self, room_id: &str, role: Role, deadline: Duration) -> Result<String> {
        let start = Instant::now();
        let mut attempt: u32 = 0;
        let mut backoff = RAPID_RETRY_DELAY;

        loop {
            if start.elapsed() >= deadline {
                return Err(Error::signaling("fetch timed out".to_string()));
            }

            let url = format!(
                "{}?role={}&room={}",
                self.base_url,
                role.as_str(),
                room_id
            );

            match self.http.get(&url).send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                    return resp
                        .text()
                        .await
                        .map_err(|e| Error::signaling(format!("fetch body read failed: {e}")));
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                    backoff = next_backoff(attempt, backoff, NOT_FOUND_BACKOFF_MULTIPLIER);
                }
                Ok(resp) => {
                    return Err(Error::signaling(format!(
                        "fetch returned unexpected status {}",
                        resp.status()
                    )));
                }
                Err(_) => {
                    backoff = next_backoff(attempt, backoff, TRANSPORT_ERROR_BACKOFF_MULTIPLIER);
                }
            }

            attempt += 1;
            let remaining = deadline.saturating_sub(start.elapsed());
            let sleep_for = backoff.min(remaining);
            if sleep_for.is_zero() {
                return Err(Error::signaling("fetch timed out".to_string()));
            }
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// PUT `{room, mappings}`; bumps the room's `mappingVersion` server-side.
    pub async fn update_mappings(&self, room_id: &str, mappings: &[String]) -> Result<()> {
        let body = json!({ "room": room_id, "mappings": mappings });

        let resp = self
            .http
            .put(&self.base_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::signaling(format!("updateMappings failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::signaling(format!(
                "updateMappings returned status {}",
                resp.status()
            )));
        }

        Ok(())
    }

    /// GET with `check_updates=true&last_mapping_version=N`.
    pub async fn check_updates(
        &self,
        room_id: &str,
        last_mapping_version: u64,
    ) -> Result<(bool, Option<String>)> {
        let url = format!(
            "{}?role=client&room={}&check_updates=true&last_mapping_version={}",
            self.base_url, room_id, last_mapping_version
        );

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::signaling(format!("checkUpdates failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::signaling(format!(
                "checkUpdates returned status {}",
                resp.status()
            )));
        }

        let parsed: CheckUpdatesResponse = resp
            .json()
            .await
            .map_err(|e| Error::signaling(format!("checkUpdates response malformed: {e}")))?;

        Ok((parsed.has_update, parsed.client_data))
    }

    /// Polls `checkUpdates` on a fixed tick, invoking `on_update` with the
    /// fresh Client payload whenever `hasUpdate` is observed. Runs until
    /// `cancel` fires.
    pub async fn watch<F, Fut>(
        &self,
        room_id: &str,
        tick: Duration,
        cancel: CancellationToken,
        mut last_known_version: u64,
        mut on_update: F,
    ) where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(tick) => {}
            }

            match self.check_updates(room_id, last_known_version).await {
                Ok((true, Some(payload))) => {
                    last_known_version += 1;
                    on_update(payload).await;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "watch: checkUpdates failed, will retry next tick");
                }
            }
        }
    }
}

fn next_backoff(attempt: u32, current: Duration, multiplier: f64) -> Duration {
    if attempt < RAPID_RETRY_ATTEMPTS {
        return RAPID_RETRY_DELAY;
    }
    let scaled = current.mul_f64(multiplier);
    scaled.min(BACKOFF_CAP)
}

#[cfg(all(test, feature = "test-support"))]
mod tests {
    use super::*;
    use crate::signaling_stub::SignalingStub;

    #[tokio::test]
    async fn publish_then_fetch_round_trips() {
        let stub = SignalingStub::spawn().await;
        let client = SignalingClient::new(stub.base_url());

        client
            .publish(Role::Client, "room1", "hello")
            .await
            .unwrap();

        let got = client
            .fetch("room1", Role::Client, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(got, "hello");
    }

    #[tokio::test]
    async fn fetch_times_out_when_role_never_published() {
        let stub = SignalingStub::spawn().await;
        let client = SignalingClient::new(stub.base_url());

        let result = client
            .fetch("nope", Role::Server, Duration::from_millis(700))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn fetch_retries_through_backoff_until_payload_appears() {
        let stub = SignalingStub::spawn().await;
        let client = SignalingClient::new(stub.base_url());

        let publish_after = stub.base_url();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            let late_client = SignalingClient::new(publish_after);
            late_client
                .publish(Role::Server, "delayed-room", "late-payload")
                .await
                .unwrap();
        });

        let got = client
            .fetch("delayed-room", Role::Server, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(got, "late-payload");
    }

    #[tokio::test]
    async fn update_mappings_then_check_updates_reports_change() {
        let stub = SignalingStub::spawn().await;
        let client = SignalingClient::new(stub.base_url());

        client
            .publish(Role::Client, "room2", "initial")
            .await
            .unwrap();

        client
            .update_mappings("room2", &["tcp:1:2".to_string()])
            .await
            .unwrap();

        let (has_update, payload) = client.check_updates("room2", 0).await.unwrap();
        assert!(has_update);
        assert_eq!(payload.as_deref(), Some("initial"));
    }
}
