//! Dual-credential token service.
//!
//! Two credential slots are maintained in Redis: the delegated slot
//! (resource-owner password flow, acts as the sync user) and the application
//! slot (client credentials, acts as the tenant app). Each slot's Redis TTL
//! is set short of the token's real expiry, so consumers that only check key
//! existence are never handed an about-to-expire bearer.

use crate::config::PlannerConfig;
use crate::constants::{
    TOKEN_BACKOFF_CAP_SECS, TOKEN_MIN_VALIDITY_SECS, TOKEN_NEAR_EXPIRY_SECS,
    TOKEN_REFRESH_INTERVAL_SECS, TOKEN_TTL_MARGIN_SECS,
};
use crate::redis::{keys, RedisClient};
use crate::{BridgeError, Result};
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Credential classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Delegated,
    Application,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Delegated => "delegated",
            TokenKind::Application => "application",
        }
    }
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation classes the rest of the system names its calls by. The token
/// service owns the class → credential mapping so callers never hardcode a
/// kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    TaskGraph,
    Calendar,
    Mail,
    UserRead,
    TenantRead,
    ChatSubscription,
    ChannelSubscription,
    Unknown,
}

impl OpClass {
    /// Fixed mapping: tenant-wide reads and chat/channel subscriptions need
    /// the application credential; everything user-scoped runs delegated.
    /// Unknown defaults to delegated.
    pub fn token_kind(&self) -> TokenKind {
        match self {
            OpClass::TenantRead | OpClass::ChatSubscription | OpClass::ChannelSubscription => {
                TokenKind::Application
            }
            OpClass::TaskGraph | OpClass::Calendar | OpClass::Mail | OpClass::UserRead
            | OpClass::Unknown => TokenKind::Delegated,
        }
    }
}

/// The credential surface HTTP clients depend on. A trait seam so clients
/// can be exercised with static bearers in tests.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    /// A bearer valid for at least 60 s.
    async fn bearer_for(&self, kind: TokenKind) -> Result<String>;
    /// Force re-acquisition (after a 401).
    async fn invalidate(&self, kind: TokenKind) -> Result<String>;
}

#[async_trait::async_trait]
impl TokenProvider for TokenService {
    async fn bearer_for(&self, kind: TokenKind) -> Result<String> {
        self.token_for(kind).await
    }

    async fn invalidate(&self, kind: TokenKind) -> Result<String> {
        self.refresh(kind).await
    }
}

/// The Redis-resident token slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSlot {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub scope: String,
    pub refresh_count: u64,
    pub stored_at: DateTime<Utc>,
}

impl TokenSlot {
    pub fn remaining_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    scope: String,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Per-kind acquisition diagnostics surfaced in the health snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenDiagnostics {
    pub refresh_count: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub mfa_challenged: bool,
}

#[derive(Clone)]
pub struct TokenService {
    config: PlannerConfig,
    redis: RedisClient,
    http: reqwest::Client,
    // One guard per kind collapses concurrent acquisitions to a single
    // in-flight request.
    flight_guards: Arc<HashMap<TokenKind, Arc<Mutex<()>>>>,
    diagnostics: Arc<RwLock<HashMap<TokenKind, TokenDiagnostics>>>,
}

impl TokenService {
    pub fn new(config: PlannerConfig, redis: RedisClient) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(
                crate::constants::HTTP_TIMEOUT_SECS,
            ))
            .build()
            .map_err(BridgeError::PlannerApi)?;

        let flight_guards = HashMap::from([
            (TokenKind::Delegated, Arc::new(Mutex::new(()))),
            (TokenKind::Application, Arc::new(Mutex::new(()))),
        ]);

        Ok(Self {
            config,
            redis,
            http,
            flight_guards: Arc::new(flight_guards),
            diagnostics: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Return a bearer valid for at least 60 s, acquiring synchronously on
    /// cache miss or near-expiry.
    pub async fn token_for(&self, kind: TokenKind) -> Result<String> {
        if let Some(slot) = self.read_slot(kind).await? {
            if slot.remaining_secs() >= TOKEN_MIN_VALIDITY_SECS {
                return Ok(slot.token);
            }
        }
        self.acquire(kind).await
    }

    /// Choose the credential for an operation class and hand out its bearer.
    pub async fn token_for_operation(&self, op_class: OpClass) -> Result<String> {
        self.token_for(op_class.token_kind()).await
    }

    /// Force re-acquisition regardless of cached validity.
    pub async fn refresh(&self, kind: TokenKind) -> Result<String> {
        self.acquire(kind).await
    }

    pub async fn diagnostics(&self) -> HashMap<TokenKind, TokenDiagnostics> {
        self.diagnostics.read().await.clone()
    }

    /// Age in seconds of each stored token, for the health snapshot.
    pub async fn token_ages(&self) -> HashMap<String, i64> {
        let mut ages = HashMap::new();
        for kind in [TokenKind::Delegated, TokenKind::Application] {
            if let Ok(Some(slot)) = self.read_slot(kind).await {
                ages.insert(
                    kind.to_string(),
                    (Utc::now() - slot.stored_at).num_seconds(),
                );
            }
        }
        ages
    }

    async fn read_slot(&self, kind: TokenKind) -> Result<Option<TokenSlot>> {
        self.redis.json_get(&keys::token(kind.as_str()), "$").await
    }

    async fn acquire(&self, kind: TokenKind) -> Result<String> {
        let guard = self.flight_guards[&kind].clone();
        let _flight = guard.lock().await;

        // Another caller may have refreshed while we waited for the guard.
        if let Some(slot) = self.read_slot(kind).await? {
            if slot.remaining_secs() >= TOKEN_NEAR_EXPIRY_SECS {
                return Ok(slot.token);
            }
        }

        debug!("Acquiring {kind} token");
        let response = self.request_token(kind).await;

        match response {
            Ok(token_response) => {
                let slot = self.store_slot(kind, token_response).await?;
                self.record_success(kind).await;
                info!(
                    "Acquired {kind} token (valid {}s, refresh #{})",
                    slot.remaining_secs(),
                    slot.refresh_count
                );
                Ok(slot.token)
            }
            Err(e) => {
                self.record_failure(kind, &e).await;
                Err(e)
            }
        }
    }

    async fn request_token(&self, kind: TokenKind) -> Result<TokenResponse> {
        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
        ];
        match kind {
            TokenKind::Delegated => {
                form.push(("grant_type", "password"));
                form.push(("username", &self.config.username));
                form.push(("password", &self.config.password));
                form.push(("scope", &self.config.delegated_scope));
            }
            TokenKind::Application => {
                form.push(("grant_type", "client_credentials"));
                form.push(("scope", &self.config.application_scope));
            }
        }

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(response.json::<TokenResponse>().await?)
        } else {
            let body = response.text().await.unwrap_or_default();
            let parsed: TokenErrorResponse =
                serde_json::from_str(&body).unwrap_or(TokenErrorResponse {
                    error: status.to_string(),
                    error_description: body.clone(),
                });

            // Multi-factor challenges cannot be satisfied by retrying; make
            // the diagnostic unmistakable for the operator.
            if parsed.error == "interaction_required"
                || parsed.error_description.contains("AADSTS50076")
            {
                error!(
                    "Delegated credential requires multi-factor interaction; \
                     exclude the sync user from MFA policy or use certificate auth"
                );
                let mut diagnostics = self.diagnostics.write().await;
                diagnostics.entry(kind).or_default().mfa_challenged = true;
            }

            Err(BridgeError::TokenAcquisition {
                kind: kind.to_string(),
                message: format!("{}: {}", parsed.error, parsed.error_description),
            })
        }
    }

    async fn store_slot(&self, kind: TokenKind, response: TokenResponse) -> Result<TokenSlot> {
        let previous_count = self
            .read_slot(kind)
            .await?
            .map(|s| s.refresh_count)
            .unwrap_or(0);

        let now = Utc::now();
        let slot = TokenSlot {
            token: response.access_token,
            expires_at: now + chrono::Duration::seconds(response.expires_in),
            scope: response.scope,
            refresh_count: previous_count + 1,
            stored_at: now,
        };

        let key = keys::token(kind.as_str());
        self.redis.json_set(&key, "$", &slot).await?;

        // TTL short of real expiry: key presence implies ≥5min of validity.
        let ttl = (response.expires_in - TOKEN_TTL_MARGIN_SECS).max(1);
        let mut conn = self.redis.get_conn().await?;
        conn.expire::<_, ()>(&key, ttl).await?;

        Ok(slot)
    }

    async fn record_success(&self, kind: TokenKind) {
        let mut diagnostics = self.diagnostics.write().await;
        let entry = diagnostics.entry(kind).or_default();
        entry.refresh_count += 1;
        entry.last_success = Some(Utc::now());
        entry.consecutive_failures = 0;
        entry.mfa_challenged = false;
    }

    async fn record_failure(&self, kind: TokenKind, error: &BridgeError) {
        warn!("Token acquisition failed for {kind}: {error}");
        let mut diagnostics = self.diagnostics.write().await;
        let entry = diagnostics.entry(kind).or_default();
        entry.last_failure = Some(Utc::now());
        entry.consecutive_failures += 1;
    }

    /// Seconds since the last successful acquisition of either kind, if any
    /// kind has never succeeded or is failing. The supervisor uses this for
    /// its fatal-condition check.
    pub async fn worst_staleness_secs(&self) -> Option<i64> {
        let diagnostics = self.diagnostics.read().await;
        let mut worst: Option<i64> = None;
        for kind in [TokenKind::Delegated, TokenKind::Application] {
            let Some(entry) = diagnostics.get(&kind) else { continue };
            if entry.consecutive_failures == 0 {
                continue;
            }
            let staleness = entry
                .last_success
                .map(|t| (Utc::now() - t).num_seconds())
                .unwrap_or(i64::MAX);
            worst = Some(worst.map_or(staleness, |w: i64| w.max(staleness)));
        }
        worst
    }

    /// Background refresher: wakes every 60 s and re-acquires any token with
    /// under 15 min of lifetime left. Failures back off exponentially,
    /// capped at 5 min, without tight-looping on MFA challenges.
    pub async fn run_refresher(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Token refresher started");
        let mut failure_streak: u32 = 0;

        loop {
            let delay = if failure_streak == 0 {
                TOKEN_REFRESH_INTERVAL_SECS
            } else {
                (2u64.saturating_pow(failure_streak)).min(TOKEN_BACKOFF_CAP_SECS)
            };

            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(delay)) => {}
                _ = shutdown.changed() => {
                    info!("Token refresher shutting down");
                    return;
                }
            }

            let mut any_failure = false;
            for kind in [TokenKind::Delegated, TokenKind::Application] {
                let needs_refresh = match self.read_slot(kind).await {
                    Ok(Some(slot)) => slot.remaining_secs() < TOKEN_NEAR_EXPIRY_SECS,
                    Ok(None) => true,
                    Err(e) => {
                        warn!("Could not read {kind} token slot: {e}");
                        continue;
                    }
                };

                if needs_refresh {
                    if let Err(e) = self.acquire(kind).await {
                        warn!("Background refresh of {kind} token failed: {e}");
                        any_failure = true;
                    }
                }
            }

            failure_streak = if any_failure { failure_streak + 1 } else { 0 };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_class_mapping_is_fixed() {
        assert_eq!(OpClass::TenantRead.token_kind(), TokenKind::Application);
        assert_eq!(OpClass::ChatSubscription.token_kind(), TokenKind::Application);
        assert_eq!(OpClass::ChannelSubscription.token_kind(), TokenKind::Application);
        assert_eq!(OpClass::TaskGraph.token_kind(), TokenKind::Delegated);
        assert_eq!(OpClass::Calendar.token_kind(), TokenKind::Delegated);
        assert_eq!(OpClass::Mail.token_kind(), TokenKind::Delegated);
        assert_eq!(OpClass::UserRead.token_kind(), TokenKind::Delegated);
        assert_eq!(OpClass::Unknown.token_kind(), TokenKind::Delegated);
    }

    #[test]
    fn slot_remaining_reflects_expiry() {
        let slot = TokenSlot {
            token: "bearer".to_string(),
            expires_at: Utc::now() + chrono::Duration::seconds(120),
            scope: String::new(),
            refresh_count: 1,
            stored_at: Utc::now(),
        };
        let remaining = slot.remaining_secs();
        assert!((115..=120).contains(&remaining));
    }
}
