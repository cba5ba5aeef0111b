//! Per-(connection, endpoint) cooldown tracking with exponential backoff.
//!
//! The matrix of cooldown cells is persisted to `endpoint_cooldowns.json`
//! after every mutation. 429 cooldowns escalate along a configurable minute
//! sequence; the escalation level lives in an in-memory map that survives
//! record expiry and is only cleared by a successful call on the same cell.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::CooldownDurations;
use crate::connections::{Connection, ConnectionKind};
use crate::endpoints::EndpointClass;
use crate::util::now_ms;

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// Reason a cooldown cell was marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CooldownReason {
    /// HTTP 429 rate limit; escalates along the backoff sequence.
    #[serde(rename = "429")]
    RateLimited,
    /// Connection reset/refused, socket hang-up, TLS failure.
    #[serde(rename = "connection_reset")]
    ConnectionReset,
    /// Request or connect timeout.
    #[serde(rename = "timeout")]
    Timeout,
    /// Name resolution or host-unreachable failure.
    #[serde(rename = "dns_failure")]
    DnsFailure,
    /// SOCKS negotiation failure on a proxy connection.
    #[serde(rename = "socks_error")]
    SocksError,
    /// Configured but not produced by the categoriser.
    #[serde(rename = "permanent")]
    Permanent,
}

impl std::fmt::Display for CooldownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited => write!(f, "429"),
            Self::ConnectionReset => write!(f, "connection_reset"),
            Self::Timeout => write!(f, "timeout"),
            Self::DnsFailure => write!(f, "dns_failure"),
            Self::SocksError => write!(f, "socks_error"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// One cooldown cell's state.
///
/// Writes always carry `duration_ms`; older files recorded
/// `duration_minutes` (or `duration_used`) instead, so deserialization
/// accepts all three and normalises on the next write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RawCooldownRecord")]
pub struct CooldownRecord {
    pub cooldown_until: i64,
    pub reason: CooldownReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_level: Option<u32>,
    pub applied_at: i64,
    pub error_message: String,
    pub duration_ms: u64,
}

impl CooldownRecord {
    /// Whether the cell is still cooling at `now`.
    pub fn is_active(&self, now: i64) -> bool {
        self.cooldown_until > now
    }

    /// Remaining cooldown at `now`, zero when expired.
    pub fn remaining_ms(&self, now: i64) -> u64 {
        (self.cooldown_until - now).max(0) as u64
    }
}

#[derive(Debug, Deserialize)]
struct RawCooldownRecord {
    cooldown_until: i64,
    reason: CooldownReason,
    #[serde(default)]
    backoff_level: Option<u32>,
    #[serde(default)]
    applied_at: Option<i64>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    duration_used: Option<u64>,
    #[serde(default)]
    duration_minutes: Option<u64>,
}

impl From<RawCooldownRecord> for CooldownRecord {
    fn from(raw: RawCooldownRecord) -> Self {
        let applied_at = raw.applied_at.unwrap_or(0);
        let duration_ms = raw
            .duration_ms
            .or(raw.duration_used)
            .or(raw.duration_minutes.map(|m| m * 60_000))
            .unwrap_or_else(|| (raw.cooldown_until - applied_at).max(1) as u64);
        Self {
            cooldown_until: raw.cooldown_until,
            reason: raw.reason,
            backoff_level: raw.backoff_level,
            applied_at,
            error_message: raw.error_message.unwrap_or_default(),
            duration_ms,
        }
    }
}

/// On-disk shape of `endpoint_cooldowns.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CooldownFile {
    #[serde(default)]
    connections: Vec<CooldownFileEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CooldownFileEntry {
    index: usize,
    #[serde(rename = "type")]
    kind: ConnectionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(default)]
    endpoint_cooldowns: HashMap<EndpointClass, CooldownRecord>,
}

/// An active cooldown cell, for health reporting.
#[derive(Debug, Clone)]
pub struct CooldownCell {
    pub connection: Connection,
    pub endpoint: EndpointClass,
    pub record: CooldownRecord,
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

struct CooldownState {
    records: HashMap<(usize, EndpointClass), CooldownRecord>,
    /// 429 escalation level per cell. Survives record expiry; cleared only
    /// by `reset_on_success`.
    backoff_levels: HashMap<(usize, EndpointClass), u32>,
    /// Mirror of the connection registry, re-synced on registry mutations.
    connections: Vec<Connection>,
}

/// The cooldown matrix, shared by the dispatcher, scheduler and health API.
pub struct CooldownStore {
    inner: Mutex<CooldownState>,
    storage_path: PathBuf,
    backoff_sequence: Vec<u64>,
    durations: CooldownDurations,
}

impl CooldownStore {
    /// Create the store: load any persisted matrix, seed the in-memory
    /// backoff levels from 429 records, then align cells with the current
    /// registry snapshot.
    pub async fn new(
        storage_path: PathBuf,
        backoff_sequence: Vec<u64>,
        durations: CooldownDurations,
        registry_snapshot: Vec<Connection>,
    ) -> Self {
        debug_assert!(!backoff_sequence.is_empty());

        let (connections, records) = match Self::load_from_path(&storage_path) {
            Ok(loaded) => loaded,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Vec::new(), HashMap::new()),
            Err(e) => {
                tracing::error!(
                    path = %storage_path.display(),
                    error = %e,
                    "Failed to load cooldown matrix, starting empty"
                );
                (Vec::new(), HashMap::new())
            }
        };

        let mut backoff_levels = HashMap::new();
        for (cell, record) in &records {
            if record.reason == CooldownReason::RateLimited {
                if let Some(level) = record.backoff_level {
                    backoff_levels.insert(*cell, level);
                }
            }
        }
        if !records.is_empty() {
            tracing::info!(
                cells = records.len(),
                seeded_backoff_levels = backoff_levels.len(),
                "Loaded cooldown matrix"
            );
        }

        let store = Self {
            inner: Mutex::new(CooldownState {
                records,
                backoff_levels,
                connections,
            }),
            storage_path,
            backoff_sequence,
            durations,
        };
        store.sync_connections(registry_snapshot).await;
        store
    }

    fn load_from_path(
        path: &PathBuf,
    ) -> Result<(Vec<Connection>, HashMap<(usize, EndpointClass), CooldownRecord>), std::io::Error>
    {
        let contents = std::fs::read_to_string(path)?;
        let file: CooldownFile = serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut connections = Vec::new();
        let mut records = HashMap::new();
        for entry in file.connections {
            connections.push(Connection {
                index: entry.index,
                kind: entry.kind,
                url: entry.url,
            });
            for (endpoint, record) in entry.endpoint_cooldowns {
                records.insert((entry.index, endpoint), record);
            }
        }
        Ok((connections, records))
    }

    /// Serialize the matrix and write atomically (temp file, then rename).
    /// Called while holding the state lock so writes cannot interleave.
    fn save_to_disk(&self, state: &CooldownState) {
        let file = CooldownFile {
            connections: state
                .connections
                .iter()
                .map(|c| CooldownFileEntry {
                    index: c.index,
                    kind: c.kind,
                    url: c.url.clone(),
                    endpoint_cooldowns: state
                        .records
                        .iter()
                        .filter(|((index, _), _)| *index == c.index)
                        .map(|((_, endpoint), record)| (*endpoint, record.clone()))
                        .collect(),
                })
                .collect(),
        };

        let result = (|| -> Result<(), std::io::Error> {
            if let Some(parent) = self.storage_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let contents = serde_json::to_string_pretty(&file)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            let tmp_path = self.storage_path.with_extension("tmp");
            std::fs::write(&tmp_path, contents)?;
            std::fs::rename(&tmp_path, &self.storage_path)?;
            Ok(())
        })();
        if let Err(e) = result {
            tracing::error!(
                path = %self.storage_path.display(),
                error = %e,
                "Failed to persist cooldown matrix"
            );
        }
    }

    /// Whether `(connection, endpoint)` may be used right now.
    pub async fn is_available(&self, connection: usize, endpoint: EndpointClass) -> bool {
        let state = self.inner.lock().await;
        match state.records.get(&(connection, endpoint)) {
            Some(record) => !record.is_active(now_ms()),
            None => true,
        }
    }

    /// Drop every expired record from the matrix and the file. Backoff
    /// levels for expired 429 records stay in memory until a success on the
    /// same cell resets them.
    pub async fn cleanup_expired(&self) -> usize {
        let mut state = self.inner.lock().await;
        let now = now_ms();
        let before = state.records.len();
        state.records.retain(|_, record| record.is_active(now));
        let removed = before - state.records.len();
        if removed > 0 {
            self.save_to_disk(&state);
            tracing::debug!(removed, "Expired cooldown records cleaned up");
        }
        removed
    }

    /// Place `(connection, endpoint)` into cooldown for `reason`.
    ///
    /// 429 escalates: the first rate limit on a cell uses level 0, each
    /// further one advances a level, saturating at the end of the sequence.
    /// Other reasons use their fixed configured duration. Returns the
    /// applied cooldown duration.
    pub async fn mark(
        &self,
        connection: usize,
        endpoint: EndpointClass,
        reason: CooldownReason,
        error_message: &str,
    ) -> Duration {
        let mut state = self.inner.lock().await;
        let cell = (connection, endpoint);

        let (duration, backoff_level) = if reason == CooldownReason::RateLimited {
            let level = match state.backoff_levels.get(&cell) {
                None => 0,
                Some(current) => {
                    (*current + 1).min(self.backoff_sequence.len() as u32 - 1)
                }
            };
            state.backoff_levels.insert(cell, level);
            let minutes = self.backoff_sequence[level as usize];
            (Duration::from_secs(minutes * 60), Some(level))
        } else {
            (self.fixed_duration(reason), None)
        };

        let now = now_ms();
        let record = CooldownRecord {
            cooldown_until: now + duration.as_millis() as i64,
            reason,
            backoff_level,
            applied_at: now,
            error_message: error_message.to_string(),
            duration_ms: duration.as_millis() as u64,
        };
        state.records.insert(cell, record);
        self.save_to_disk(&state);

        tracing::info!(
            connection,
            endpoint = %endpoint,
            reason = %reason,
            backoff_level = backoff_level.map(|l| l as i64).unwrap_or(-1),
            cooldown_secs = duration.as_secs(),
            "Cooldown applied"
        );
        duration
    }

    /// A successful call on a cell clears its 429 escalation: the backoff
    /// level entry and any 429 record are removed. Non-429 records reflect
    /// external conditions and are left to expire naturally.
    pub async fn reset_on_success(&self, connection: usize, endpoint: EndpointClass) {
        let mut state = self.inner.lock().await;
        let cell = (connection, endpoint);
        let had_level = state.backoff_levels.remove(&cell).is_some();
        let had_record = match state.records.get(&cell) {
            Some(record) if record.reason == CooldownReason::RateLimited => {
                state.records.remove(&cell);
                true
            }
            _ => false,
        };
        if had_record {
            self.save_to_disk(&state);
        }
        if had_level || had_record {
            tracing::debug!(connection, endpoint = %endpoint, "Rate-limit backoff reset");
        }
    }

    /// Whether at least one connection may be used for `endpoint` now.
    pub async fn any_available_for(&self, endpoint: EndpointClass) -> bool {
        let state = self.inner.lock().await;
        let now = now_ms();
        state.connections.iter().any(|c| {
            state
                .records
                .get(&(c.index, endpoint))
                .map(|r| !r.is_active(now))
                .unwrap_or(true)
        })
    }

    /// Whether every connection is cooling for `endpoint`.
    pub async fn all_in_cooldown_for(&self, endpoint: EndpointClass) -> bool {
        !self.any_available_for(endpoint).await
    }

    /// Minimum remaining cooldown across connections for `endpoint`; zero
    /// when any connection is available.
    pub async fn next_available_in_for(&self, endpoint: EndpointClass) -> Duration {
        let state = self.inner.lock().await;
        let now = now_ms();
        let mut min_remaining: Option<u64> = None;
        for c in &state.connections {
            let remaining = state
                .records
                .get(&(c.index, endpoint))
                .map(|r| r.remaining_ms(now))
                .unwrap_or(0);
            if remaining == 0 {
                return Duration::ZERO;
            }
            min_remaining = Some(min_remaining.map_or(remaining, |m| m.min(remaining)));
        }
        Duration::from_millis(min_remaining.unwrap_or(0))
    }

    /// Current 429 escalation level of a cell, if any. Exposed for health
    /// output and tests.
    pub async fn backoff_level(&self, connection: usize, endpoint: EndpointClass) -> Option<u32> {
        self.inner
            .lock()
            .await
            .backoff_levels
            .get(&(connection, endpoint))
            .copied()
    }

    /// Active cells plus the mirrored connection list, for health output.
    pub async fn snapshot(&self) -> (Vec<Connection>, Vec<CooldownCell>) {
        let state = self.inner.lock().await;
        let now = now_ms();
        let cells = state
            .records
            .iter()
            .filter(|(_, record)| record.is_active(now))
            .filter_map(|((index, endpoint), record)| {
                state
                    .connections
                    .iter()
                    .find(|c| c.index == *index)
                    .map(|connection| CooldownCell {
                        connection: connection.clone(),
                        endpoint: *endpoint,
                        record: record.clone(),
                    })
            })
            .collect();
        (state.connections.clone(), cells)
    }

    /// Re-align the matrix with a fresh registry snapshot.
    ///
    /// Each current connection adopts the cells of the old connection it
    /// matches, trying `(index, type, url)`, then `(type, url)`, then
    /// `(type = direct)`. Cells of connections that match nothing are
    /// dropped, so removing a proxy removes its column.
    pub async fn sync_connections(&self, current: Vec<Connection>) {
        let mut state = self.inner.lock().await;

        let old_connections = std::mem::take(&mut state.connections);
        let mut claimed: Vec<bool> = vec![false; old_connections.len()];
        let mut remap: HashMap<usize, usize> = HashMap::new();

        for connection in &current {
            let position = find_match(&old_connections, &claimed, connection);
            if let Some(pos) = position {
                claimed[pos] = true;
                remap.insert(old_connections[pos].index, connection.index);
            }
        }

        let records = std::mem::take(&mut state.records);
        state.records = records
            .into_iter()
            .filter_map(|((index, endpoint), record)| {
                remap.get(&index).map(|new| ((*new, endpoint), record))
            })
            .collect();

        let levels = std::mem::take(&mut state.backoff_levels);
        state.backoff_levels = levels
            .into_iter()
            .filter_map(|((index, endpoint), level)| {
                remap.get(&index).map(|new| ((*new, endpoint), level))
            })
            .collect();

        state.connections = current;
        self.save_to_disk(&state);
    }

    fn fixed_duration(&self, reason: CooldownReason) -> Duration {
        match reason {
            CooldownReason::ConnectionReset => self.durations.connection_reset,
            CooldownReason::Timeout => self.durations.timeout,
            CooldownReason::DnsFailure => self.durations.dns_failure,
            CooldownReason::SocksError => self.durations.socks_error,
            CooldownReason::Permanent => self.durations.permanent,
            // mark() never reaches here for 429, but fall back sanely.
            CooldownReason::RateLimited => Duration::from_secs(60),
        }
    }
}

/// Sync-strategy matcher: `(index, type, url)`, then `(type, url)`, then
/// `(type = direct)`. Already-claimed old entries are skipped so two new
/// connections cannot adopt the same column.
fn find_match(old: &[Connection], claimed: &[bool], target: &Connection) -> Option<usize> {
    let free = |i: &usize| !claimed[*i];

    (0..old.len())
        .filter(free)
        .find(|&i| {
            old[i].index == target.index && old[i].kind == target.kind && old[i].url == target.url
        })
        .or_else(|| {
            (0..old.len())
                .filter(free)
                .find(|&i| old[i].kind == target.kind && old[i].url == target.url)
        })
        .or_else(|| {
            if target.kind == ConnectionKind::Direct {
                (0..old.len())
                    .filter(free)
                    .find(|&i| old[i].kind == ConnectionKind::Direct)
            } else {
                None
            }
        })
}
