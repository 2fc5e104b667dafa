//! Service configuration, loaded from the environment.
//!
//! Everything operational is env-tunable:
//! - `DESKBRIDGE_HOST` / `DESKBRIDGE_PORT`: webhook listener bind address
//! - `HELPDESK_BASE_URL` / `HELPDESK_API_TOKEN`: remote helpdesk API
//! - `HELPDESK_WEBHOOK_SECRET`: HMAC secret for inbound webhooks
//! - `DISCORD_BOT_TOKEN` / `DISCORD_GUILD_ID` / `DISCORD_CHANNEL_ID`: chat side
//! - `DESKBRIDGE_ROLE_IDS`: comma-separated role ids whose members join threads
//! - `DESKBRIDGE_BROADCAST_CHANNEL_ID`: channel for presence alerts
//! - `DESKBRIDGE_DB_PATH`: sqlite database path
//! - reconcile/probe intervals, grace windows and attachment caps (see below)

use std::env;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use crate::BridgeError;

const DEFAULT_PORT: u16 = 9310;
const DEFAULT_BODY_MAX_BYTES: usize = 2 * 1024 * 1024;

/// Attachment transfer budget, read before every transfer batch.
///
/// Held behind [`AttachmentLimitsHandle`] so operators can retune caps on a
/// running process without a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentLimits {
    /// Largest single file transferred inline.
    pub per_file_bytes: u64,
    /// Cumulative cap across all files of one message.
    pub per_message_bytes: u64,
    /// Maximum number of files transferred inline per message.
    pub max_files: usize,
    /// Hard cap on any single download regardless of declared size.
    pub download_safety_bytes: u64,
}

impl Default for AttachmentLimits {
    fn default() -> Self {
        Self {
            per_file_bytes: 8 * 1024 * 1024,
            per_message_bytes: 25 * 1024 * 1024,
            max_files: 10,
            download_safety_bytes: 50 * 1024 * 1024,
        }
    }
}

impl AttachmentLimits {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            per_file_bytes: resolve_u64_env("DESKBRIDGE_ATTACH_PER_FILE_BYTES", defaults.per_file_bytes),
            per_message_bytes: resolve_u64_env(
                "DESKBRIDGE_ATTACH_PER_MESSAGE_BYTES",
                defaults.per_message_bytes,
            ),
            max_files: resolve_u64_env("DESKBRIDGE_ATTACH_MAX_FILES", defaults.max_files as u64)
                as usize,
            download_safety_bytes: resolve_u64_env(
                "DESKBRIDGE_ATTACH_DOWNLOAD_SAFETY_BYTES",
                defaults.download_safety_bytes,
            ),
        }
    }
}

/// Shared, reloadable view of [`AttachmentLimits`].
#[derive(Debug, Default)]
pub struct AttachmentLimitsHandle {
    inner: RwLock<AttachmentLimits>,
}

impl AttachmentLimitsHandle {
    pub fn new(limits: AttachmentLimits) -> Self {
        Self {
            inner: RwLock::new(limits),
        }
    }

    pub fn current(&self) -> AttachmentLimits {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Re-read limits from the environment.
    pub fn reload_from_env(&self) {
        self.set(AttachmentLimits::from_env());
    }

    pub fn set(&self, limits: AttachmentLimits) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = limits;
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub body_max_bytes: usize,

    pub helpdesk_base_url: String,
    pub helpdesk_api_token: String,
    pub webhook_secret: String,

    pub discord_bot_token: String,
    pub discord_guild_id: u64,
    /// Channel where ticket threads are anchored.
    pub discord_channel_id: u64,
    /// Channel for presence alerts and operator-visible failures.
    pub broadcast_channel_id: Option<u64>,
    /// Roles whose members are added to open ticket threads.
    pub member_role_ids: Vec<u64>,

    pub db_path: PathBuf,

    pub http_timeout: Duration,
    pub reconcile_interval: Duration,
    /// Coarser sub-interval for per-ticket article catch-up during reconcile.
    pub article_catchup_interval: Duration,
    pub probe_interval: Duration,
    /// Consecutive probe failures before presence flips to down.
    pub probe_failure_threshold: u32,

    /// List-absence must persist past this window before a close is applied.
    pub close_grace: Duration,
    /// A local CLOSED fact is trusted over list data for this window.
    pub reopen_grace: Duration,

    /// Normalized state names treated as HIDDEN (members removed).
    pub hidden_states: Vec<String>,
    /// Normalized state names treated as HIDDEN plus thread archive.
    pub hidden_archive_states: Vec<String>,
    /// Normalized state names treated as CLOSED.
    pub closed_states: Vec<String>,

    /// Egress throttle toward the chat platform.
    pub egress_max_concurrency: usize,
    pub egress_max_per_second: u32,

    pub attachment_limits: AttachmentLimits,
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, BridgeError> {
        dotenvy::dotenv().ok();

        let host = env::var("DESKBRIDGE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("DESKBRIDGE_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);

        let helpdesk_base_url = required_env("HELPDESK_BASE_URL")?;
        let helpdesk_api_token = required_env("HELPDESK_API_TOKEN")?;
        let webhook_secret = required_env("HELPDESK_WEBHOOK_SECRET")?;
        let discord_bot_token = required_env("DISCORD_BOT_TOKEN")?;
        let discord_guild_id = required_u64_env("DISCORD_GUILD_ID")?;
        let discord_channel_id = required_u64_env("DISCORD_CHANNEL_ID")?;

        let broadcast_channel_id = env::var("DESKBRIDGE_BROADCAST_CHANNEL_ID")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok());

        let member_role_ids = env::var("DESKBRIDGE_ROLE_IDS")
            .ok()
            .map(|value| parse_id_list(&value))
            .unwrap_or_default();

        let db_path = PathBuf::from(
            env::var("DESKBRIDGE_DB_PATH").unwrap_or_else(|_| "deskbridge.db".to_string()),
        );

        Ok(Self {
            host,
            port,
            body_max_bytes: resolve_u64_env(
                "DESKBRIDGE_BODY_MAX_BYTES",
                DEFAULT_BODY_MAX_BYTES as u64,
            ) as usize,
            helpdesk_base_url,
            helpdesk_api_token,
            webhook_secret,
            discord_bot_token,
            discord_guild_id,
            discord_channel_id,
            broadcast_channel_id,
            member_role_ids,
            db_path,
            http_timeout: resolve_secs_env("DESKBRIDGE_HTTP_TIMEOUT_SECS", 15),
            reconcile_interval: resolve_secs_env("DESKBRIDGE_RECONCILE_INTERVAL_SECS", 60),
            article_catchup_interval: resolve_secs_env("DESKBRIDGE_ARTICLE_CATCHUP_SECS", 300),
            probe_interval: resolve_secs_env("DESKBRIDGE_PROBE_INTERVAL_SECS", 30),
            probe_failure_threshold: resolve_u64_env("DESKBRIDGE_PROBE_FAILURES", 3) as u32,
            close_grace: resolve_secs_env("DESKBRIDGE_CLOSE_GRACE_SECS", 300),
            reopen_grace: resolve_secs_env("DESKBRIDGE_REOPEN_GRACE_SECS", 120),
            hidden_states: resolve_state_list_env(
                "DESKBRIDGE_HIDDEN_STATES",
                &["pending reminder"],
            ),
            hidden_archive_states: resolve_state_list_env(
                "DESKBRIDGE_HIDDEN_ARCHIVE_STATES",
                &["pending close"],
            ),
            closed_states: resolve_state_list_env("DESKBRIDGE_CLOSED_STATES", &["closed", "merged"]),
            egress_max_concurrency: resolve_u64_env("DESKBRIDGE_EGRESS_CONCURRENCY", 10) as usize,
            egress_max_per_second: resolve_u64_env("DESKBRIDGE_EGRESS_PER_SECOND", 45) as u32,
            attachment_limits: AttachmentLimits::from_env(),
        })
    }
}

fn required_env(key: &str) -> Result<String, BridgeError> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| BridgeError::Config(format!("missing required env var {key}")))
}

fn required_u64_env(key: &str) -> Result<u64, BridgeError> {
    required_env(key)?
        .parse::<u64>()
        .map_err(|_| BridgeError::Config(format!("env var {key} must be a numeric id")))
}

fn parse_id_list(raw: &str) -> Vec<u64> {
    raw.split(',')
        .filter_map(|part| part.trim().parse::<u64>().ok())
        .collect()
}

fn resolve_state_list_env(key: &str, defaults: &[&str]) -> Vec<String> {
    let from_env = env::var(key).ok().map(|value| {
        value
            .split(',')
            .map(|part| part.trim().to_lowercase())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
    });
    match from_env {
        Some(list) if !list.is_empty() => list,
        _ => defaults.iter().map(|s| s.to_string()).collect(),
    }
}

fn resolve_u64_env(key: &str, default_value: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default_value)
}

fn resolve_secs_env(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(resolve_u64_env(key, default_secs))
}
