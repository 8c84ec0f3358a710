
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Credentials and candidate list needed to bootstrap an ICE connectivity
/// check, keyed by the owning client id. This is both the `/register`
/// payload core and the `/lookup`//`/poll` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceInfo {
    pub id: String,
    pub ufrag: String,
    pub password: String,
    pub candidates: Vec<String>,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    id: &'a str,
    ufrag: &'a str,
    password: &'a str,
    candidates: &'a [String],
    ttl_seconds: u64,
}

#[derive(Serialize)]
struct LookupRequest<'a> {
    id: &'a str,
    from_id: &'a str,
}

#[derive(Serialize)]
struct IntentRequest<'a> {
    from_id: &'a str,
    to_id: &'a str,
    ttl_seconds: u64,
}

#[derive(Serialize)]
struct PollRequest<'a> {
    id: &'a str,
}

#[derive(Serialize)]
struct DeclineRequest<'a> {
    intent_id: &'a str,
    from_id: &'a str,
    ttl_seconds: u64,
}

#[derive(Serialize)]
struct UnregisterRequest<'a> {
    id: &'a str,
}

/// Stateless JSON/HTTP client for the rendezvous service.
///
/// Every operation surfaces errors by status code; 429 and 403 map to the
/// distinguished `ErrRateLimited` and `ErrDeclined` kinds because the
/// manager's poll loop treats them differently (back-off vs. abort).
#[derive(Debug, Clone)]
pub struct RendezvousClient {
    base_url: String,
    http: reqwest::Client,
}

impl RendezvousClient {
    pub fn new(server_addr: &str) -> Self {
        Self {
            base_url: format!("http://{server_addr}"),
            http: reqwest::Client::new(),
        }
    }

    pub fn server_addr(&self) -> &str {
        self.base_url.trim_start_matches("http://")
    }

    /// Publishes our ICE info under `info.id` with the given TTL.
    pub async fn register(&self, info: &IceInfo, ttl_seconds: u64) -> Result<()> {
        log::info!(
            "registering client_id={} candidates={}",
            info.id,
            info.candidates.len()
        );
        let resp = self
            .http
            .post(format!("{}/register", self.base_url))
            .json(&RegisterRequest {
                id: &info.id,
                ufrag: &info.ufrag,
                password: &info.password,
                candidates: &info.candidates,
                ttl_seconds,
            })
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(()),
            status => Err(Error::ErrUnexpectedStatus(status.as_u16())),
        }
    }

    /// Fetches the ICE info registered for `target_id`. `Ok(None)` means the
    /// target is not (yet) registered; polling callers keep trying.
    pub async fn lookup(&self, target_id: &str, from_id: &str) -> Result<Option<IceInfo>> {
        let resp = self
            .http
            .post(format!("{}/lookup", self.base_url))
            .json(&LookupRequest {
                id: target_id,
                from_id,
            })
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(Some(resp.json().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::TOO_MANY_REQUESTS => Err(Error::ErrRateLimited),
            StatusCode::FORBIDDEN => Err(Error::ErrDeclined),
            status => Err(Error::ErrUnexpectedStatus(status.as_u16())),
        }
    }

    /// Publishes a short-TTL connect intent so the callee's poller can
    /// discover the inbound offer.
    pub async fn send_intent(&self, from_id: &str, to_id: &str, ttl_seconds: u64) -> Result<()> {
        log::info!("intent sent from={from_id} to={to_id}");
        let resp = self
            .http
            .post(format!("{}/intent", self.base_url))
            .json(&IntentRequest {
                from_id,
                to_id,
                ttl_seconds,
            })
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(()),
            status => Err(Error::ErrUnexpectedStatus(status.as_u16())),
        }
    }

    /// Checks for a pending inbound intent addressed to `id`.
    pub async fn poll_intent(&self, id: &str) -> Result<Option<IceInfo>> {
        let resp = self
            .http
            .post(format!("{}/poll", self.base_url))
            .json(&PollRequest { id })
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(Some(resp.json().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(Error::ErrUnexpectedStatus(status.as_u16())),
        }
    }

    /// Declines a pending intent from `intent_id`.
    pub async fn send_decline(
        &self,
        intent_id: &str,
        from_id: &str,
        ttl_seconds: u64,
    ) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/decline", self.base_url))
            .json(&DeclineRequest {
                intent_id,
                from_id,
                ttl_seconds,
            })
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(()),
            status => Err(Error::ErrUnexpectedStatus(status.as_u16())),
        }
    }

    /// Removes our registration. A 404 counts as success: the record may
    /// already have expired or been dropped.
    pub async fn unregister(&self, id: &str) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/unregister", self.base_url))
            .json(&UnregisterRequest { id })
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK | StatusCode::NOT_FOUND => Ok(()),
            status => Err(Error::ErrUnexpectedStatus(status.as_u16())),
        }
    }

    /// Probes `/health` with a short timeout. Any failure is "unhealthy".
    pub async fn health(&self) -> bool {
        let resp = self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;
        match resp {
            Ok(resp) => resp.status() == StatusCode::OK,
            Err(err) => {
                log::warn!("rendezvous health failed: {err}");
                false
            }
        }
    }
}
