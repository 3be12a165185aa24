use crate::{BridgeError, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub redis: RedisConfig,
    pub planner: PlannerConfig,
    pub webhook: WebhookConfig,
    pub sync: SyncConfig,
    pub subscriptions: SubscriptionTargets,
}

/// Identifiers the change-notification subscriptions are scoped to. A
/// family whose identifier is unset is simply not subscribed; its polling
/// fallback stays on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionTargets {
    pub group_id: Option<String>,
    pub chat_id: Option<String>,
    pub team_id: Option<String>,
    pub channel_id: Option<String>,
    pub message_user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: usize,
}

/// Credentials and endpoints for the external planner tenant.
///
/// Two credential classes are maintained: the delegated slot authenticates
/// as a directory user (resource-owner password flow), the application slot
/// as the tenant app (client credentials). Which slot an operation uses is
/// decided by the token service, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub base_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
    pub username: String,
    pub password: String,
    pub delegated_scope: String,
    pub application_scope: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub host: String,
    pub port: u16,
    /// External URL the planner's notification service targets. Required:
    /// subscriptions are created against this address.
    pub public_url: String,
    /// Stem for per-family clientState values.
    pub client_state_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Plan agent-originated tasks are created in. Required for creates.
    pub default_plan_id: String,
    /// Static agent-identifier → remote-user-id map for assignments.
    pub user_id_map: HashMap<String, String>,
    pub upload_workers: usize,
    pub download_workers: usize,
    pub poll_interval_active_secs: u64,
    pub poll_interval_quiet_secs: u64,
    pub conflict_grace_window_secs: i64,
    pub conflict_tie_wins: TieDirection,
    pub health_ttl_secs: u64,
}

/// Which side a near-tie conflict resolves toward. The source system's
/// documentation is inconsistent on this; it is a knob defaulted to the
/// human-preferring direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TieDirection {
    Remote,
    Agent,
}

fn required(name: &str) -> Result<String> {
    let value = env::var(name)
        .map_err(|_| BridgeError::Configuration(format!("{name} environment variable is required")))?;
    if value.trim().is_empty() {
        return Err(BridgeError::Configuration(format!("{name} cannot be empty")));
    }
    Ok(value)
}

fn optional(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn optional_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse `agent-id=remote-user-id` comma-separated pairs.
fn parse_user_id_map(raw: &str) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let (agent, remote) = pair.split_once('=').ok_or_else(|| {
            BridgeError::Configuration(format!(
                "BRIDGE_USER_ID_MAP entry '{pair}' is not of the form agent=remote-user-id"
            ))
        })?;
        map.insert(agent.trim().to_string(), remote.trim().to_string());
    }
    Ok(map)
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file
        match dotenv() {
            Ok(path) => tracing::info!("Loaded .env file from: {:?}", path),
            Err(e) => tracing::debug!("Could not load .env file: {}", e),
        }

        Self::from_env()
    }

    /// Build the configuration from the current process environment.
    /// Separated from `load()` so tests can drive it without a .env file.
    pub fn from_env() -> Result<Self> {
        let redis = RedisConfig {
            url: optional("BRIDGE_REDIS_URL", "redis://127.0.0.1:6379"),
            pool_size: optional_parsed("BRIDGE_REDIS_POOL_SIZE", 16usize),
        };

        let tenant_id = required("BRIDGE_TENANT_ID")?;
        let planner = PlannerConfig {
            base_url: optional("BRIDGE_PLANNER_BASE_URL", "https://graph.example.com/v1.0")
                .trim_end_matches('/')
                .to_string(),
            token_url: env::var("BRIDGE_TOKEN_URL").unwrap_or_else(|_| {
                format!("https://login.example.com/{tenant_id}/oauth2/v2.0/token")
            }),
            client_id: required("BRIDGE_CLIENT_ID")?,
            client_secret: required("BRIDGE_CLIENT_SECRET")?,
            tenant_id,
            username: required("BRIDGE_USERNAME")?,
            password: required("BRIDGE_PASSWORD")?,
            delegated_scope: optional(
                "BRIDGE_DELEGATED_SCOPE",
                "https://graph.example.com/.default",
            ),
            application_scope: optional(
                "BRIDGE_APPLICATION_SCOPE",
                "https://graph.example.com/.default",
            ),
        };

        let public_url = required("BRIDGE_WEBHOOK_PUBLIC_URL")?;
        // A subscription created with a malformed notification URL fails with
        // an opaque planner-side error hours later; validate up front.
        url::Url::parse(&public_url).map_err(|e| {
            BridgeError::Configuration(format!("BRIDGE_WEBHOOK_PUBLIC_URL is not a valid URL: {e}"))
        })?;

        let webhook = WebhookConfig {
            host: optional("BRIDGE_WEBHOOK_HOST", "0.0.0.0"),
            port: optional_parsed("BRIDGE_WEBHOOK_PORT", 3978u16),
            public_url,
            client_state_prefix: optional("BRIDGE_CLIENT_STATE_PREFIX", "spiral-bridge"),
        };

        let tie = optional("BRIDGE_CONFLICT_TIE_WINS", "remote");
        let conflict_tie_wins = match tie.to_lowercase().as_str() {
            "remote" => TieDirection::Remote,
            "agent" => TieDirection::Agent,
            other => {
                return Err(BridgeError::Configuration(format!(
                    "BRIDGE_CONFLICT_TIE_WINS must be 'remote' or 'agent', got '{other}'"
                )))
            }
        };

        let user_id_map = match env::var("BRIDGE_USER_ID_MAP") {
            Ok(raw) => parse_user_id_map(&raw)?,
            Err(_) => HashMap::new(),
        };

        let sync = SyncConfig {
            default_plan_id: required("BRIDGE_DEFAULT_PLAN_ID")?,
            user_id_map,
            upload_workers: optional_parsed(
                "BRIDGE_UPLOAD_WORKERS",
                crate::constants::DEFAULT_WORKER_COUNT,
            ),
            download_workers: optional_parsed(
                "BRIDGE_DOWNLOAD_WORKERS",
                crate::constants::DEFAULT_WORKER_COUNT,
            ),
            poll_interval_active_secs: optional_parsed(
                "BRIDGE_POLL_INTERVAL_ACTIVE",
                crate::constants::POLL_INTERVAL_ACTIVE_SECS,
            ),
            poll_interval_quiet_secs: optional_parsed(
                "BRIDGE_POLL_INTERVAL_QUIET",
                crate::constants::POLL_INTERVAL_QUIET_SECS,
            ),
            conflict_grace_window_secs: optional_parsed(
                "BRIDGE_CONFLICT_GRACE_WINDOW",
                crate::constants::CONFLICT_GRACE_WINDOW_SECS,
            ),
            conflict_tie_wins,
            health_ttl_secs: optional_parsed(
                "BRIDGE_HEALTH_TTL",
                crate::constants::HEALTH_INTERVAL_SECS,
            ),
        };

        if sync.upload_workers == 0 || sync.download_workers == 0 {
            return Err(BridgeError::Configuration(
                "worker pool sizes must be at least 1".to_string(),
            ));
        }

        let subscriptions = SubscriptionTargets {
            group_id: env::var("BRIDGE_GROUP_ID").ok().filter(|v| !v.is_empty()),
            chat_id: env::var("BRIDGE_CHAT_ID").ok().filter(|v| !v.is_empty()),
            team_id: env::var("BRIDGE_TEAM_ID").ok().filter(|v| !v.is_empty()),
            channel_id: env::var("BRIDGE_CHANNEL_ID").ok().filter(|v| !v.is_empty()),
            message_user_id: env::var("BRIDGE_MESSAGE_USER_ID")
                .ok()
                .filter(|v| !v.is_empty()),
        };

        Ok(Config {
            redis,
            planner,
            webhook,
            sync,
            subscriptions,
        })
    }
}
