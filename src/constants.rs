//! 🎯 SPIRAL BRIDGE CONSTANTS: System-wide configuration values
//! DECISION ARCHAEOLOGY: Each constant includes reasoning for its specific value
//! AUDIT: Verify these values align with planner-tenant quotas and agent latency expectations

// ⚙️ UPLOAD PIPELINE CONFIGURATION
/// ⏱️ DEBOUNCE FLOOR: Minimum wait after the first unserviced change signal
/// Why: Agents burst-write the conscious state; 500ms folds a burst into one diff
/// Alternative: 100ms (rejected: one diff per keystroke-equivalent), 1s (rejected: sluggish create path)
pub const DEBOUNCE_MIN_MS: u64 = 500;

/// ⏱️ DEBOUNCE CEILING: Maximum age of an unserviced change signal before a diff runs
/// Why: 2s bounds how long an agent create can sit before its POST goes out
pub const DEBOUNCE_MAX_MS: u64 = 2000;

/// 🔄 DRIFT INTERVAL: Full-universe diff cadence catching missed notifications
/// Why: 30s bounds the staleness of anything keyspace events dropped
/// Alternative: 10s (rejected: 3x scan load on large states), 60s (rejected: slow convergence)
pub const DRIFT_INTERVAL_SECS: u64 = 30;

/// 🚦 PENDING OPS SOFT LIMIT: Back-pressure threshold on the operation queue
/// Why: Past 10K queued ops the drift timer only adds noise; skip it and mark degraded
pub const PENDING_OPS_SOFT_LIMIT: usize = 10_000;

/// 👷 WORKER POOL SIZE: Default upload/download worker count
/// Why: 4 workers saturate the per-tenant planner quota without queue starvation
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// ⏳ BACKOFF CAP: Upper bound on exponential retry backoff
/// Why: min(2^attempt, 300)s keeps a poisoned op from sleeping past the drift safety net twice
pub const BACKOFF_CAP_SECS: u64 = 300;

/// 🔁 MAX OP ATTEMPTS: Retry budget before an op is parked in failed_ops
pub const MAX_OP_ATTEMPTS: u32 = 5;

// 📥 DOWNLOAD PIPELINE CONFIGURATION
/// ⏱️ POLL INTERVAL (ACTIVE): Fallback polling cadence for plans with recent activity
pub const POLL_INTERVAL_ACTIVE_SECS: u64 = 60;

/// ⏱️ POLL INTERVAL (QUIET): Fallback polling cadence for plans without recent activity
pub const POLL_INTERVAL_QUIET_SECS: u64 = 1800;

/// 🔇 WEBHOOK SILENCE GATE: How recently a subscription must have delivered
/// an event for its family's polling fallback to stay disabled
pub const WEBHOOK_FRESHNESS_SECS: u64 = 600;

/// ⚖️ CONFLICT GRACE WINDOW: Timestamp delta within which a tie is declared
/// Why: 30s covers clock skew between the agent host and the planner tenant
pub const CONFLICT_GRACE_WINDOW_SECS: i64 = 30;

// 🔑 TOKEN SERVICE CONFIGURATION
/// ⏱️ REFRESHER INTERVAL: Background token refresher wake cadence
pub const TOKEN_REFRESH_INTERVAL_SECS: u64 = 60;

/// ⏳ NEAR-EXPIRY THRESHOLD: Remaining lifetime below which a token is refreshed
pub const TOKEN_NEAR_EXPIRY_SECS: i64 = 900;

/// 🛟 TTL SAFETY MARGIN: Redis TTL is expires_at − now − this margin, so key
/// existence alone proves ≥5min of remaining validity
pub const TOKEN_TTL_MARGIN_SECS: i64 = 300;

/// ✅ MIN HANDOUT VALIDITY: token_for never returns a bearer with less than this remaining
pub const TOKEN_MIN_VALIDITY_SECS: i64 = 60;

/// ⏳ TOKEN BACKOFF CAP: Acquisition retry backoff ceiling
pub const TOKEN_BACKOFF_CAP_SECS: u64 = 300;

// 📡 SUBSCRIPTION MANAGER CONFIGURATION
/// 🔄 RENEWAL SCAN INTERVAL: How often subscription expiries are examined
pub const SUBSCRIPTION_SCAN_INTERVAL_SECS: u64 = 3600;

/// 📐 RENEWAL THRESHOLD FRACTION: Renew when remaining lifetime falls under
/// this share of the family's maximum lifetime
pub const SUBSCRIPTION_RENEW_FRACTION: f64 = 0.2;

// 🌐 HTTP CONFIGURATION
/// ⏱️ HTTP TIMEOUT: Per-request ceiling on outbound planner calls
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// 🚰 RATE LIMIT QUOTA: Planner task-graph family quota per app-tenant
/// Why: Service documents 300 req / 5 min; the governor bucket enforces it locally
pub const PLANNER_REQUESTS_PER_5_MIN: u32 = 300;

// 🏥 HEALTH & HOUSEKEEPING CONFIGURATION
/// ⏱️ HEALTH INTERVAL: Snapshot publication cadence; TTL matches, so key
/// absence for >5min reads as a dead syncer
pub const HEALTH_INTERVAL_SECS: u64 = 300;

/// 📜 LOG TRIM LENGTH: Bound on sync_log and webhook_log entries
pub const LOG_TRIM_LENGTH: isize = 500;

/// 🗂️ MAPPING VERIFY AGE: Mappings older than this get a remote existence check
pub const MAPPING_VERIFY_AGE_SECS: i64 = 86_400;

/// 🕐 METADATA TTL: Directory metadata cache lifetime
pub const METADATA_TTL_SECS: u64 = 86_400;

/// 🕐 CACHED REMOTE TTL: Last-fetched remote snapshot lifetime (echo suppression)
pub const CACHED_REMOTE_TTL_SECS: u64 = 3600;

// 📨 WEBHOOK RECEIVER CONFIGURATION
/// 📦 WEBHOOK QUEUE CAPACITY: Bounded in-memory notification queue
/// Why: Oldest-dropped on overflow with a health counter; 4096 rides out a
/// subscription-renewal replay burst without unbounded memory
pub const WEBHOOK_QUEUE_CAPACITY: usize = 4096;

// 🛑 SUPERVISOR CONFIGURATION
/// ⏱️ SHUTDOWN GRACE: In-flight drain window before pipelines are aborted
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// 💀 REDIS FATAL THRESHOLD: Unreachable-Redis duration the supervisor treats as fatal
pub const REDIS_FATAL_SECS: u64 = 60;

/// 💀 TOKEN FATAL THRESHOLD: No-valid-token duration the supervisor treats as fatal
pub const TOKEN_FATAL_SECS: u64 = 900;
