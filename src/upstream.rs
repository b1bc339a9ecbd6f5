// Copyright 2026 The Gantry Project
// SPDX-License-Identifier: Apache-2.0

// Upstream client seam and credential pool.
//
// Handlers never touch an HTTP client directly; they go through the
// injected `UpstreamClient` trait. The reqwest implementation owns
// cookie assembly and byte streaming; deeper upstream policy (proxy
// rotation, retries) lives behind this trait and stays out of the
// gateway core.

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// One upstream account credential.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Operator-facing name, recorded in request logs.
    pub key_name: String,
    /// The session cookie presented to the upstream.
    pub cookie: String,
    /// Credential pool class.
    pub tier: Tier,
}

impl Credential {
    /// Last four characters of the cookie, for log correlation without
    /// exposing the credential.
    pub fn token_suffix(&self) -> String {
        let chars: Vec<char> = self.cookie.chars().collect();
        let start = chars.len().saturating_sub(4);
        chars[start..].iter().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Super,
    Basic,
}

/// Classify a model name against the configured super-tier list.
pub fn model_tier(model: &str, super_models: &[String]) -> Tier {
    if super_models.iter().any(|m| m == model) {
        Tier::Super
    } else {
        Tier::Basic
    }
}

/// A streamed upstream response body.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

pub struct UpstreamRequest {
    pub model: String,
    /// The inbound OpenAI request body, forwarded opaquely.
    pub body: serde_json::Value,
    pub credential: Credential,
    /// Extra cookie fragment (`cf_clearance=…`), empty when unset.
    pub cf_clearance_cookie: String,
}

pub struct UpstreamResponse {
    pub status: u16,
    pub body: ByteStream,
}

/// A proxied asset fetched from the upstream.
pub struct AssetResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Transport(String),

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("upstream read failed: {0}")]
    Read(String),
}

// ---------------------------------------------------------------------------
// Trait: UpstreamClient (dependency injection point)
// ---------------------------------------------------------------------------

/// Abstraction over the HTTP client that talks to the Grok upstream.
///
/// Implementations must be Send + Sync so they can be shared across
/// request handlers via `Arc`.
#[async_trait::async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Start a chat completion and return the NDJSON byte stream.
    async fn chat_stream(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError>;

    /// Fetch one asset (image/video/poster) for the `/images/` proxy.
    /// Path references resolve against the upstream origin.
    async fn fetch_asset(&self, asset: &crate::assets::AssetRef)
        -> Result<AssetResponse, UpstreamError>;

    /// Cheap liveness probe for one credential, used by the batch
    /// refresh job.
    async fn refresh_credential(&self, credential: &Credential) -> Result<(), UpstreamError>;
}

// ---------------------------------------------------------------------------
// Reqwest implementation
// ---------------------------------------------------------------------------

pub struct ReqwestGrokClient {
    http: reqwest::Client,
    base_url: String,
}

impl ReqwestGrokClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn cookie_header(request: &UpstreamRequest) -> String {
        if request.cf_clearance_cookie.is_empty() {
            request.credential.cookie.clone()
        } else {
            format!(
                "{}; {}",
                request.credential.cookie, request.cf_clearance_cookie
            )
        }
    }

    fn asset_url(&self, asset: &crate::assets::AssetRef) -> String {
        match asset {
            crate::assets::AssetRef::Url(url) => url.clone(),
            crate::assets::AssetRef::Path(path) => {
                format!("{}{}", self.base_url.trim_end_matches('/'), path)
            }
        }
    }
}

#[async_trait::async_trait]
impl UpstreamClient for ReqwestGrokClient {
    async fn chat_stream(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let url = format!(
            "{}/rest/app-chat/conversations/new",
            self.base_url.trim_end_matches('/')
        );
        let cookie = Self::cookie_header(&request);

        let response = self
            .http
            .post(&url)
            .header(reqwest::header::COOKIE, cookie)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&request.body)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map_err(|e| UpstreamError::Read(e.to_string())),
        );

        Ok(UpstreamResponse { status, body })
    }

    async fn fetch_asset(
        &self,
        asset: &crate::assets::AssetRef,
    ) -> Result<AssetResponse, UpstreamError> {
        let response = self
            .http
            .get(self.asset_url(asset))
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::Read(e.to_string()))?;

        Ok(AssetResponse {
            status,
            content_type,
            body,
        })
    }

    async fn refresh_credential(&self, credential: &Credential) -> Result<(), UpstreamError> {
        let url = format!(
            "{}/rest/rate-limits",
            self.base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::COOKIE, credential.cookie.clone())
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(UpstreamError::Status(response.status().as_u16()))
        }
    }
}

// ---------------------------------------------------------------------------
// Token pool (thin lookup)
// ---------------------------------------------------------------------------

/// Minimal credential selection: super-tier models draw only from the
/// super pool; basic-tier models draw from the basic pool, falling
/// back to super when allowed. Rotation is round-robin. Deeper
/// selection policy (cooldowns, quota accounting) stays outside the
/// gateway core.
pub trait TokenPool: Send + Sync {
    fn lookup(&self, model: &str) -> Option<Credential>;

    /// All credentials, for batch admin jobs.
    fn credentials(&self) -> Vec<Credential>;
}

pub struct StaticTokenPool {
    credentials: Vec<Credential>,
    super_models: Vec<String>,
    basic_falls_back_to_super: bool,
    cursor: AtomicUsize,
}

impl StaticTokenPool {
    pub fn new(
        credentials: Vec<Credential>,
        super_models: Vec<String>,
        basic_falls_back_to_super: bool,
    ) -> Self {
        Self {
            credentials,
            super_models,
            basic_falls_back_to_super,
            cursor: AtomicUsize::new(0),
        }
    }

    fn pick(&self, eligible: Vec<&Credential>) -> Option<Credential> {
        if eligible.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
        Some(eligible[index].clone())
    }
}

impl TokenPool for StaticTokenPool {
    fn lookup(&self, model: &str) -> Option<Credential> {
        match model_tier(model, &self.super_models) {
            Tier::Super => self.pick(
                self.credentials
                    .iter()
                    .filter(|c| c.tier == Tier::Super)
                    .collect(),
            ),
            Tier::Basic => {
                let basic: Vec<&Credential> = self
                    .credentials
                    .iter()
                    .filter(|c| c.tier == Tier::Basic)
                    .collect();
                if !basic.is_empty() {
                    return self.pick(basic);
                }
                if self.basic_falls_back_to_super {
                    self.pick(self.credentials.iter().collect())
                } else {
                    None
                }
            }
        }
    }

    fn credentials(&self) -> Vec<Credential> {
        self.credentials.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred(name: &str, tier: Tier) -> Credential {
        Credential {
            key_name: name.to_string(),
            cookie: format!("sso={name}-cookie-value"),
            tier,
        }
    }

    #[test]
    fn super_models_only_draw_from_super_pool() {
        let pool = StaticTokenPool::new(
            vec![cred("basic-1", Tier::Basic)],
            vec!["grok-4-heavy".to_string()],
            true,
        );
        assert!(pool.lookup("grok-4-heavy").is_none());

        let pool = StaticTokenPool::new(
            vec![cred("basic-1", Tier::Basic), cred("super-1", Tier::Super)],
            vec!["grok-4-heavy".to_string()],
            true,
        );
        assert_eq!(pool.lookup("grok-4-heavy").unwrap().key_name, "super-1");
    }

    #[test]
    fn basic_falls_back_to_super_when_allowed() {
        let pool = StaticTokenPool::new(
            vec![cred("super-1", Tier::Super)],
            vec![],
            true,
        );
        assert_eq!(pool.lookup("grok-3").unwrap().key_name, "super-1");

        let strict = StaticTokenPool::new(vec![cred("super-1", Tier::Super)], vec![], false);
        assert!(strict.lookup("grok-3").is_none());
    }

    #[test]
    fn round_robin_rotates() {
        let pool = StaticTokenPool::new(
            vec![cred("a", Tier::Basic), cred("b", Tier::Basic)],
            vec![],
            true,
        );
        let first = pool.lookup("grok-3").unwrap().key_name;
        let second = pool.lookup("grok-3").unwrap().key_name;
        assert_ne!(first, second);
    }

    #[test]
    fn token_suffix_is_last_four_chars() {
        let c = cred("a", Tier::Basic);
        assert_eq!(c.token_suffix(), "alue");

        let short = Credential {
            key_name: "s".to_string(),
            cookie: "ab".to_string(),
            tier: Tier::Basic,
        };
        assert_eq!(short.token_suffix(), "ab");
    }
}
