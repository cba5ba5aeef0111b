//! Durable profile queue.
//!
//! A single JSON array of profile records, shared across processes through a
//! sibling advisory lock file and replaced atomically on every write. The
//! queue is the restart boundary: check statuses (including `deferred`) are
//! persisted here and everything else is reconstructed from them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::endpoints::EndpointClass;
use crate::util::{hostname, now_ms};

/// Lock acquisition retry delay.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Attempts before acquisition fails with `LockTimeout`.
const LOCK_MAX_ATTEMPTS: u32 = 20;
/// A lock older than this may be forcibly removed by any caller.
const STALE_LOCK_AGE_MS: i64 = 5 * 60 * 1000;

/// Operation retry policy for lock/filesystem/corruption errors.
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue lock acquisition timed out")]
    LockTimeout,

    #[error("queue file corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// Profile model
// ─────────────────────────────────────────────────────────────────────────────

/// The battery of checks every queued profile carries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CheckName {
    AnimatedAvatar,
    AvatarFrame,
    MiniProfileBackground,
    ProfileBackground,
    SteamLevel,
    Friends,
    CsgoInventory,
}

/// Fixed evaluation order. `steam_level` precedes `friends` and
/// `csgo_inventory` so a private-profile signal can short-circuit them.
pub const CHECK_ORDER: [CheckName; 7] = [
    CheckName::AnimatedAvatar,
    CheckName::AvatarFrame,
    CheckName::MiniProfileBackground,
    CheckName::ProfileBackground,
    CheckName::SteamLevel,
    CheckName::Friends,
    CheckName::CsgoInventory,
];

impl CheckName {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckName::AnimatedAvatar => "animated_avatar",
            CheckName::AvatarFrame => "avatar_frame",
            CheckName::MiniProfileBackground => "mini_profile_background",
            CheckName::ProfileBackground => "profile_background",
            CheckName::SteamLevel => "steam_level",
            CheckName::Friends => "friends",
            CheckName::CsgoInventory => "csgo_inventory",
        }
    }

    /// The endpoint class this check dispatches against.
    pub fn endpoint_class(&self) -> EndpointClass {
        match self {
            CheckName::AnimatedAvatar => EndpointClass::AnimatedAvatar,
            CheckName::AvatarFrame => EndpointClass::AvatarFrame,
            CheckName::MiniProfileBackground => EndpointClass::MiniProfileBackground,
            CheckName::ProfileBackground => EndpointClass::ProfileBackground,
            CheckName::SteamLevel => EndpointClass::SteamLevel,
            CheckName::Friends => EndpointClass::Friends,
            CheckName::CsgoInventory => EndpointClass::Inventory,
        }
    }
}

impl std::fmt::Display for CheckName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    ToCheck,
    Passed,
    Failed,
    Deferred,
}

impl CheckStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckStatus::Passed | CheckStatus::Failed)
    }
}

/// One queued profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub steam_id: String,
    pub username: String,
    /// Tolerated missing on load so legacy records keep parsing.
    #[serde(default)]
    pub enqueued_at: i64,
    pub checks: BTreeMap<CheckName, CheckStatus>,
}

impl Profile {
    pub fn new(steam_id: String, username: String) -> Self {
        Self {
            steam_id,
            username,
            enqueued_at: now_ms(),
            checks: CHECK_ORDER
                .iter()
                .map(|check| (*check, CheckStatus::ToCheck))
                .collect(),
        }
    }

    /// Checks still waiting for their first attempt, in evaluation order.
    pub fn pending_checks(&self) -> Vec<CheckName> {
        CHECK_ORDER
            .iter()
            .filter(|check| self.checks.get(check) == Some(&CheckStatus::ToCheck))
            .copied()
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        self.checks.values().any(|s| *s == CheckStatus::ToCheck)
    }

    pub fn has_deferred(&self) -> bool {
        self.checks.values().any(|s| *s == CheckStatus::Deferred)
    }

    pub fn all_terminal(&self) -> bool {
        self.checks.values().all(CheckStatus::is_terminal)
    }

    pub fn all_passed(&self) -> bool {
        self.checks.values().all(|s| *s == CheckStatus::Passed)
    }

    /// Restore the seven-check invariant on records loaded from disk.
    fn normalize(&mut self) {
        for check in CHECK_ORDER {
            self.checks.entry(check).or_insert(CheckStatus::ToCheck);
        }
    }
}

/// Result of `add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added { queue_len: usize },
    AlreadyPresent,
}

/// Aggregate counts for observability endpoints.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub total_profiles: usize,
    pub to_check: usize,
    pub passed: usize,
    pub failed: usize,
    pub deferred: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Lock file
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    host: String,
    acquired_at: i64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

/// File-backed queue store. Every public operation acquires the advisory
/// lock, works on a freshly-read snapshot and (for mutations) replaces the
/// file atomically.
pub struct QueueStore {
    queue_path: PathBuf,
    lock_path: PathBuf,
}

impl QueueStore {
    pub fn new(queue_path: PathBuf) -> Self {
        let lock_path = queue_path.with_extension("json.lock");
        Self {
            queue_path,
            lock_path,
        }
    }

    /// Enqueue a profile. Idempotent: a duplicate `steam_id` leaves the
    /// existing record (and its original username) untouched.
    pub async fn add(&self, steam_id: &str, username: &str) -> Result<AddOutcome, QueueError> {
        self.locked("add", |profiles| {
            if profiles.iter().any(|p| p.steam_id == steam_id) {
                return Ok((false, AddOutcome::AlreadyPresent));
            }
            profiles.push(Profile::new(steam_id.to_string(), username.to_string()));
            let queue_len = profiles.len();
            Ok((true, AddOutcome::Added { queue_len }))
        })
        .await
    }

    /// Set one check's status. Unknown profiles are a no-op returning false.
    pub async fn update_check(
        &self,
        steam_id: &str,
        check: CheckName,
        status: CheckStatus,
    ) -> Result<bool, QueueError> {
        self.locked("update_check", |profiles| {
            match profiles.iter_mut().find(|p| p.steam_id == steam_id) {
                Some(profile) => {
                    profile.checks.insert(check, status);
                    Ok((true, true))
                }
                None => Ok((false, false)),
            }
        })
        .await
    }

    /// Remove a profile. Returns whether it was present.
    pub async fn remove(&self, steam_id: &str) -> Result<bool, QueueError> {
        self.locked("remove", |profiles| {
            let before = profiles.len();
            profiles.retain(|p| p.steam_id != steam_id);
            let removed = profiles.len() != before;
            Ok((removed, removed))
        })
        .await
    }

    /// The next profile the scheduler should look at:
    /// first one with unattempted checks, then one ready for downstream
    /// submission (all terminal), then one that is only deferred.
    pub async fn next_processable(&self) -> Result<Option<Profile>, QueueError> {
        self.locked("next_processable", |profiles| {
            let candidate = profiles
                .iter()
                .find(|p| p.has_pending())
                .or_else(|| profiles.iter().find(|p| p.all_terminal()))
                .or_else(|| profiles.iter().find(|p| p.has_deferred()))
                .cloned();
            Ok((false, candidate))
        })
        .await
    }

    pub async fn by_id(&self, steam_id: &str) -> Result<Option<Profile>, QueueError> {
        self.locked("by_id", |profiles| {
            Ok((false, profiles.iter().find(|p| p.steam_id == steam_id).cloned()))
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<Profile>, QueueError> {
        self.locked("list", |profiles| Ok((false, profiles.clone()))).await
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.locked("stats", |profiles| {
            let mut stats = QueueStats {
                total_profiles: profiles.len(),
                ..QueueStats::default()
            };
            for status in profiles.iter().flat_map(|p| p.checks.values()) {
                match status {
                    CheckStatus::ToCheck => stats.to_check += 1,
                    CheckStatus::Passed => stats.passed += 1,
                    CheckStatus::Failed => stats.failed += 1,
                    CheckStatus::Deferred => stats.deferred += 1,
                }
            }
            Ok((false, stats))
        })
        .await
    }

    /// Every `(steam_id, check)` pair currently deferred; the scheduler
    /// rebuilds its reactivation set from this at startup.
    pub async fn deferred_pairs(&self) -> Result<Vec<(String, CheckName)>, QueueError> {
        self.locked("deferred_pairs", |profiles| {
            let pairs = profiles
                .iter()
                .flat_map(|p| {
                    p.checks
                        .iter()
                        .filter(|(_, status)| **status == CheckStatus::Deferred)
                        .map(|(check, _)| (p.steam_id.clone(), *check))
                })
                .collect();
            Ok((false, pairs))
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────

    /// Run `op` under the advisory lock with the operation retry policy.
    /// `op` receives the freshly-read queue and returns `(dirty, value)`;
    /// a dirty queue is written back before the lock is released.
    async fn locked<T>(
        &self,
        op_name: &str,
        op: impl Fn(&mut Vec<Profile>) -> Result<(bool, T), QueueError>,
    ) -> Result<T, QueueError> {
        let mut attempt = 0u32;
        loop {
            match self.locked_once(&op).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < RETRY_ATTEMPTS => {
                    let delay = retry_delay(attempt);
                    tracing::warn!(
                        op = op_name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Queue operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(op = op_name, error = %e, "Queue operation failed");
                    return Err(e);
                }
            }
        }
    }

    async fn locked_once<T>(
        &self,
        op: &impl Fn(&mut Vec<Profile>) -> Result<(bool, T), QueueError>,
    ) -> Result<T, QueueError> {
        self.acquire_lock().await?;
        let result = (|| {
            let mut profiles = self.read_profiles()?;
            let (dirty, value) = op(&mut profiles)?;
            if dirty {
                self.write_profiles(&profiles)?;
            }
            Ok(value)
        })();
        self.release_lock();
        result
    }

    /// Exclusive-create lock acquisition with stale-lock takeover.
    async fn acquire_lock(&self) -> Result<(), QueueError> {
        for _ in 0..LOCK_MAX_ATTEMPTS {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(file) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        host: hostname(),
                        acquired_at: now_ms(),
                    };
                    serde_json::to_writer(file, &info)
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.takeover_stale_lock() {
                        continue;
                    }
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(QueueError::LockTimeout)
    }

    /// Remove the lock file if its holder looks dead. Age comes from the
    /// lock's own `acquired_at`, falling back to the file mtime when the
    /// content does not parse.
    fn takeover_stale_lock(&self) -> bool {
        let age_ms = std::fs::read_to_string(&self.lock_path)
            .ok()
            .and_then(|contents| serde_json::from_str::<LockInfo>(&contents).ok())
            .map(|info| now_ms() - info.acquired_at)
            .or_else(|| {
                std::fs::metadata(&self.lock_path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|mtime| mtime.elapsed().ok())
                    .map(|elapsed| elapsed.as_millis() as i64)
            });

        match age_ms {
            Some(age) if age > STALE_LOCK_AGE_MS => {
                tracing::warn!(
                    lock = %self.lock_path.display(),
                    age_ms = age,
                    "Removing stale queue lock"
                );
                std::fs::remove_file(&self.lock_path).is_ok()
            }
            _ => false,
        }
    }

    /// Release the lock, but only if it is still ours.
    fn release_lock(&self) {
        let ours = std::fs::read_to_string(&self.lock_path)
            .ok()
            .and_then(|contents| serde_json::from_str::<LockInfo>(&contents).ok())
            .map(|info| info.pid == std::process::id())
            .unwrap_or(true);
        if !ours {
            tracing::warn!(
                lock = %self.lock_path.display(),
                "Queue lock no longer ours, leaving it in place"
            );
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::error!(error = %e, "Failed to release queue lock");
            }
        }
    }

    /// Read the queue leniently: a missing file is an empty queue, a
    /// non-array root is corruption, and individual malformed records are
    /// logged and skipped.
    fn read_profiles(&self) -> Result<Vec<Profile>, QueueError> {
        let contents = match std::fs::read_to_string(&self.queue_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let root: serde_json::Value = serde_json::from_str(&contents)
            .map_err(|e| QueueError::Corrupt(format!("not valid JSON: {e}")))?;
        let entries = root
            .as_array()
            .ok_or_else(|| QueueError::Corrupt("root is not an array".to_string()))?;

        let mut profiles = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_value::<Profile>(entry.clone()) {
                Ok(mut profile) if !profile.steam_id.is_empty() => {
                    profile.normalize();
                    profiles.push(profile);
                }
                Ok(_) => {
                    tracing::error!("Skipping queue record with empty steam_id");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Skipping malformed queue record");
                }
            }
        }
        Ok(profiles)
    }

    /// Staged atomic write: serialise to a unique temp file, re-read and
    /// validate it, rename over the queue, then re-read and re-validate the
    /// final file.
    fn write_profiles(&self, profiles: &[Profile]) -> Result<(), QueueError> {
        if let Some(parent) = self.queue_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(profiles)
            .map_err(|e| QueueError::Corrupt(format!("serialisation failed: {e}")))?;

        let tmp_path = self.queue_path.with_file_name(format!(
            "{}.tmp.{}.{}",
            self.queue_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "profiles_queue.json".to_string()),
            std::process::id(),
            now_ms(),
        ));
        std::fs::write(&tmp_path, &contents)?;

        if let Err(e) = validate_queue_file(&tmp_path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }
        std::fs::rename(&tmp_path, &self.queue_path)?;
        validate_queue_file(&self.queue_path)
    }
}

/// Strict validation for files we just wrote: the root must be an array and
/// every record must carry `steam_id`, `username` and `checks`.
fn validate_queue_file(path: &PathBuf) -> Result<(), QueueError> {
    let contents = std::fs::read_to_string(path)?;
    let root: serde_json::Value = serde_json::from_str(&contents)
        .map_err(|e| QueueError::Corrupt(format!("written file unparseable: {e}")))?;
    let entries = root
        .as_array()
        .ok_or_else(|| QueueError::Corrupt("written root is not an array".to_string()))?;
    for entry in entries {
        let ok = entry.get("steam_id").map(|v| v.is_string()).unwrap_or(false)
            && entry.get("username").map(|v| v.is_string()).unwrap_or(false)
            && entry.get("checks").map(|v| v.is_object()).unwrap_or(false);
        if !ok {
            return Err(QueueError::Corrupt(
                "written record missing steam_id/username/checks".to_string(),
            ));
        }
    }
    Ok(())
}

fn retry_delay(attempt: u32) -> Duration {
    use rand::Rng;
    let exponential = RETRY_BASE_DELAY
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(RETRY_MAX_DELAY);
    let jitter_ms = rand::thread_rng().gen_range(0..=exponential.as_millis() as u64 / 2);
    exponential + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> QueueStore {
        QueueStore::new(dir.path().join("profiles_queue.json"))
    }

    #[tokio::test]
    async fn add_is_idempotent_and_keeps_original_username() {
        let dir = TempDir::new().unwrap();
        let queue = store(&dir);

        let first = queue.add("76561198000000001", "alice").await.unwrap();
        assert_eq!(first, AddOutcome::Added { queue_len: 1 });
        let second = queue.add("76561198000000001", "impostor").await.unwrap();
        assert_eq!(second, AddOutcome::AlreadyPresent);

        let profile = queue.by_id("76561198000000001").await.unwrap().unwrap();
        assert_eq!(profile.username, "alice");
        assert_eq!(profile.checks.len(), 7);
        assert!(profile
            .checks
            .values()
            .all(|s| *s == CheckStatus::ToCheck));
    }

    #[tokio::test]
    async fn update_check_and_remove() {
        let dir = TempDir::new().unwrap();
        let queue = store(&dir);
        queue.add("1", "a").await.unwrap();

        assert!(queue
            .update_check("1", CheckName::Friends, CheckStatus::Passed)
            .await
            .unwrap());
        assert!(!queue
            .update_check("ghost", CheckName::Friends, CheckStatus::Passed)
            .await
            .unwrap());

        let profile = queue.by_id("1").await.unwrap().unwrap();
        assert_eq!(
            profile.checks.get(&CheckName::Friends),
            Some(&CheckStatus::Passed)
        );

        assert!(queue.remove("1").await.unwrap());
        assert!(!queue.remove("1").await.unwrap());
        assert!(queue.by_id("1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn next_processable_prefers_pending_over_terminal_over_deferred() {
        let dir = TempDir::new().unwrap();
        let queue = store(&dir);
        queue.add("deferred-only", "a").await.unwrap();
        queue.add("all-passed", "b").await.unwrap();
        queue.add("has-pending", "c").await.unwrap();

        for check in CHECK_ORDER {
            queue
                .update_check("deferred-only", check, CheckStatus::Deferred)
                .await
                .unwrap();
            queue
                .update_check("all-passed", check, CheckStatus::Passed)
                .await
                .unwrap();
        }

        // A profile with unattempted checks wins even though it enqueued last.
        let next = queue.next_processable().await.unwrap().unwrap();
        assert_eq!(next.steam_id, "has-pending");

        queue.remove("has-pending").await.unwrap();
        let next = queue.next_processable().await.unwrap().unwrap();
        assert_eq!(next.steam_id, "all-passed");

        queue.remove("all-passed").await.unwrap();
        let next = queue.next_processable().await.unwrap().unwrap();
        assert_eq!(next.steam_id, "deferred-only");

        queue.remove("deferred-only").await.unwrap();
        assert!(queue.next_processable().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_count_checks_by_status() {
        let dir = TempDir::new().unwrap();
        let queue = store(&dir);
        queue.add("1", "a").await.unwrap();
        queue
            .update_check("1", CheckName::Friends, CheckStatus::Passed)
            .await
            .unwrap();
        queue
            .update_check("1", CheckName::CsgoInventory, CheckStatus::Deferred)
            .await
            .unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.total_profiles, 1);
        assert_eq!(stats.to_check, 5);
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.deferred, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn deferred_pairs_reconstruct_from_disk() {
        let dir = TempDir::new().unwrap();
        {
            let queue = store(&dir);
            queue.add("1", "a").await.unwrap();
            queue
                .update_check("1", CheckName::Friends, CheckStatus::Deferred)
                .await
                .unwrap();
            queue
                .update_check("1", CheckName::SteamLevel, CheckStatus::Deferred)
                .await
                .unwrap();
        }
        // Fresh store over the same file: the deferred set survives restarts.
        let queue = store(&dir);
        let mut pairs = queue.deferred_pairs().await.unwrap();
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("1".to_string(), CheckName::SteamLevel),
                ("1".to_string(), CheckName::Friends),
            ]
        );
    }

    #[tokio::test]
    async fn malformed_records_are_skipped_but_bad_roots_fail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("profiles_queue.json");

        std::fs::write(
            &path,
            r#"[{"steam_id":"1","username":"a","enqueued_at":5,"checks":{}},{"bogus":true}]"#,
        )
        .unwrap();
        let queue = QueueStore::new(path.clone());
        let profiles = queue.list().await.unwrap();
        assert_eq!(profiles.len(), 1);
        // Missing checks were refilled to the full battery.
        assert_eq!(profiles[0].checks.len(), 7);

        std::fs::write(&path, r#"{"not":"an array"}"#).unwrap();
        assert!(matches!(
            queue.list().await,
            Err(QueueError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn queue_file_is_valid_after_every_write() {
        let dir = TempDir::new().unwrap();
        let queue = store(&dir);
        queue.add("1", "a").await.unwrap();
        queue
            .update_check("1", CheckName::Friends, CheckStatus::Failed)
            .await
            .unwrap();

        let path = dir.path().join("profiles_queue.json");
        validate_queue_file(&path).unwrap();
        // No temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn stale_lock_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let queue = store(&dir);
        let lock_path = dir.path().join("profiles_queue.json.lock");

        let stale = LockInfo {
            pid: 999_999,
            host: "elsewhere".to_string(),
            acquired_at: now_ms() - STALE_LOCK_AGE_MS - 1_000,
        };
        std::fs::write(&lock_path, serde_json::to_string(&stale).unwrap()).unwrap();

        // The stale lock is removed and the operation proceeds.
        queue.add("1", "a").await.unwrap();
        assert!(queue.by_id("1").await.unwrap().is_some());
        // And the lock was released afterwards.
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn fresh_foreign_lock_blocks_until_timeout() {
        let dir = TempDir::new().unwrap();
        let queue = store(&dir);
        let lock_path = dir.path().join("profiles_queue.json.lock");

        let fresh = LockInfo {
            pid: 999_999,
            host: "elsewhere".to_string(),
            acquired_at: now_ms(),
        };
        std::fs::write(&lock_path, serde_json::to_string(&fresh).unwrap()).unwrap();

        tokio::time::pause();
        let add = tokio::spawn({
            let queue = QueueStore::new(dir.path().join("profiles_queue.json"));
            async move { queue.add("1", "a").await }
        });
        // Drive the paused clock past every retry of every attempt.
        for _ in 0..400 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
        let result = add.await.unwrap();
        assert!(matches!(result, Err(QueueError::LockTimeout)));
        // The foreign lock is still in place.
        assert!(lock_path.exists());
    }
}
