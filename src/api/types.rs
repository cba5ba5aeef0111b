//! API request/response types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::connections::ConnectionKind;
use crate::cooldowns::CooldownReason;
use crate::endpoints::EndpointClass;
use crate::queue::{Profile, QueueStats};

/// Body accepted by `POST /profiles` (one element of it, at least).
#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueRequest {
    pub steam_id: String,
    pub username: String,
}

/// Per-item answer for `POST /profiles`.
#[derive(Debug, Clone, Serialize)]
pub struct EnqueueResult {
    pub steam_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added: Option<bool>,
    /// Queue depth right after the insert; only present when `added`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_len: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `GET /profiles/queue` answer.
#[derive(Debug, Serialize)]
pub struct QueueResponse {
    pub profiles: Vec<Profile>,
    pub stats: QueueStats,
}

/// `POST /proxies` / `DELETE /proxies` body.
#[derive(Debug, Deserialize)]
pub struct ProxyRequest {
    pub url: String,
}

/// One connection in the `GET /proxies` listing, with cooldown-aware
/// availability.
#[derive(Debug, Serialize)]
pub struct ProxyListEntry {
    pub index: usize,
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// False when at least one endpoint class is cooling on this connection.
    pub available: bool,
    /// Endpoint classes currently cooling on this connection.
    pub cooling_endpoints: Vec<EndpointClass>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Cooldown health
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct CooldownsResponse {
    pub cooldowns: BTreeMap<String, ConnectionCooldowns>,
    pub summary: CooldownSummary,
    pub overall_status: OverallStatus,
}

#[derive(Debug, Serialize)]
pub struct ConnectionCooldowns {
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub endpoints: BTreeMap<EndpointClass, EndpointCooldownInfo>,
}

#[derive(Debug, Serialize)]
pub struct EndpointCooldownInfo {
    pub in_cooldown: bool,
    pub remaining_ms: u64,
    pub remaining_minutes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<CooldownReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_level: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
}

/// One cooling cell, referenced from the summary lists.
#[derive(Debug, Clone, Serialize)]
pub struct CooldownCellRef {
    pub connection: String,
    pub endpoint: EndpointClass,
    pub remaining_minutes: u64,
}

#[derive(Debug, Serialize)]
pub struct CooldownSummary {
    pub total_connections: usize,
    pub available_connections: usize,
    pub endpoints_in_cooldown: Vec<EndpointClass>,
    pub short_cooldowns: Vec<CooldownCellRef>,
    pub long_cooldowns: Vec<CooldownCellRef>,
}

/// `healthy` = no active cooldowns; `limited` = only short ones (under 30
/// minutes remaining); `degraded` = at least one long one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Limited,
    Degraded,
}
