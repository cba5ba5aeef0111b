//! Check scheduler.
//!
//! Two cooperative loops drive every queued profile through its check
//! battery. The main loop walks unattempted checks in fixed order and
//! handles terminal profiles; the reactivation loop periodically retries
//! checks that were deferred because their endpoint class had no available
//! connection. A capacity-1 semaphore keeps main-loop ticks from
//! overlapping; all queue mutations go through the queue store's own lock.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

use crate::config::Config;
use crate::cooldowns::CooldownStore;
use crate::ingest::{IngestClient, IngestOutcome};
use crate::queue::{CheckName, CheckStatus, Profile, QueueStore};
use crate::validator::{Validator, Verdict};

pub struct Scheduler {
    queue: Arc<QueueStore>,
    cooldowns: Arc<CooldownStore>,
    validator: Arc<Validator>,
    ingest: Arc<IngestClient>,
    /// `(steam_id, check)` pairs waiting for a cooldown to expire.
    deferred: Mutex<HashSet<(String, CheckName)>>,
    /// Profiles whose `steam_level` response came back empty. Their
    /// `friends` and `csgo_inventory` checks pass without dispatching.
    private_profiles: Mutex<HashSet<String>>,
    /// Reentrancy guard for the main loop.
    tick_gate: Semaphore,
    processing_delay: Duration,
    empty_queue_delay: Duration,
    reactivation_interval: Duration,
}

impl Scheduler {
    pub fn new(
        queue: Arc<QueueStore>,
        cooldowns: Arc<CooldownStore>,
        validator: Arc<Validator>,
        ingest: Arc<IngestClient>,
        config: &Config,
    ) -> Self {
        Self {
            queue,
            cooldowns,
            validator,
            ingest,
            deferred: Mutex::new(HashSet::new()),
            private_profiles: Mutex::new(HashSet::new()),
            tick_gate: Semaphore::new(1),
            processing_delay: config.processing_delay,
            empty_queue_delay: config.empty_queue_delay,
            reactivation_interval: config.reactivation_interval,
        }
    }

    /// Rebuild the deferred set from persisted check statuses. Called once
    /// at startup so deferrals survive restarts.
    pub async fn seed_deferred(&self) {
        match self.queue.deferred_pairs().await {
            Ok(pairs) => {
                let count = pairs.len();
                let mut deferred = self.deferred.lock().await;
                deferred.extend(pairs);
                if count > 0 {
                    tracing::info!(count, "Restored deferred checks from queue");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Could not restore deferred checks from queue");
            }
        }
    }

    /// Main loop: one profile per tick, spaced by `processing_delay`.
    pub async fn run_main_loop(self: Arc<Self>) {
        tracing::info!("Check scheduler started");
        loop {
            let worked = self.tick().await;
            if worked {
                tokio::time::sleep(self.processing_delay).await;
            } else {
                tokio::time::sleep(self.empty_queue_delay).await;
            }
        }
    }

    /// Periodic loop: expire cooldowns and retry deferred checks.
    pub async fn run_reactivation_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.reactivation_interval).await;
            self.reactivate_deferred().await;
            self.log_availability().await;
        }
    }

    /// One scheduler tick. Returns whether a profile was worked on.
    pub async fn tick(&self) -> bool {
        // Overlapping ticks would break the single-outstanding-call pacing
        // assumption; skip the tick instead of queueing behind it.
        let _permit = match self.tick_gate.try_acquire() {
            Ok(permit) => permit,
            Err(_) => return false,
        };

        self.reactivate_deferred().await;

        let profile = match self.queue.next_processable().await {
            Ok(Some(profile)) => profile,
            Ok(None) => return false,
            Err(e) => {
                tracing::error!(error = %e, "Could not read queue");
                return false;
            }
        };

        self.process_profile(profile).await;
        true
    }

    async fn process_profile(&self, profile: Profile) {
        let steam_id = profile.steam_id.clone();

        if profile.all_terminal() {
            self.finish_profile(&profile).await;
            return;
        }

        for check in profile.pending_checks() {
            if self.short_circuit_private(&steam_id, check).await {
                self.update_status(&steam_id, check, CheckStatus::Passed).await;
                tracing::debug!(
                    steam_id = %steam_id,
                    check = %check,
                    "Private profile, check auto-passed"
                );
                continue;
            }

            match self.validator.run_check(check, &steam_id).await {
                Verdict::Settled {
                    passed: true,
                    private,
                    ..
                } => {
                    if private && check == CheckName::SteamLevel {
                        self.private_profiles.lock().await.insert(steam_id.clone());
                        tracing::info!(steam_id = %steam_id, "Profile flagged private");
                    }
                    self.update_status(&steam_id, check, CheckStatus::Passed).await;
                }
                Verdict::Settled {
                    passed: false,
                    details,
                    ..
                } => {
                    tracing::info!(
                        steam_id = %steam_id,
                        check = %check,
                        details = %details.unwrap_or_default(),
                        "Check failed, rejecting profile"
                    );
                    self.update_status(&steam_id, check, CheckStatus::Failed).await;
                    self.discard_profile(&steam_id).await;
                    // One failure is terminal for the whole profile.
                    return;
                }
                Verdict::Deferred { wait_ms } => {
                    tracing::info!(
                        steam_id = %steam_id,
                        check = %check,
                        wait_ms,
                        "Check deferred until a connection frees up"
                    );
                    self.defer_check(&steam_id, check).await;
                }
                Verdict::TransportError { message } => {
                    tracing::warn!(
                        steam_id = %steam_id,
                        check = %check,
                        error = %message,
                        "Check hit a terminal dispatch failure, deferring"
                    );
                    self.defer_check(&steam_id, check).await;
                }
            }
        }

        // Re-read: the battery may have completed in this pass.
        match self.queue.by_id(&steam_id).await {
            Ok(Some(current)) if current.all_terminal() => self.finish_profile(&current).await,
            _ => {}
        }
    }

    /// Downstream hand-off for a profile whose battery is complete.
    ///
    /// Submission only happens when every check passed. Retryable ingest
    /// failures leave the queue untouched so the next tick re-submits.
    async fn finish_profile(&self, profile: &Profile) {
        let steam_id = &profile.steam_id;
        if !profile.all_passed() {
            // A failed check should already have discarded the profile;
            // clean up if one slipped through (e.g. after a crash).
            tracing::warn!(steam_id = %steam_id, "Terminal profile with failures, discarding");
            self.discard_profile(steam_id).await;
            return;
        }

        match self.ingest.submit(steam_id, &profile.username).await {
            IngestOutcome::Accepted => {
                tracing::info!(steam_id = %steam_id, "Profile accepted downstream");
                self.discard_profile(steam_id).await;
            }
            IngestOutcome::AlreadyExists => {
                tracing::info!(steam_id = %steam_id, "Profile already known downstream");
                self.discard_profile(steam_id).await;
            }
            IngestOutcome::RetryLater(message) => {
                tracing::warn!(
                    steam_id = %steam_id,
                    error = %message,
                    "Downstream submission failed, will retry next cycle"
                );
            }
            IngestOutcome::Rejected(message) => {
                tracing::warn!(
                    steam_id = %steam_id,
                    error = %message,
                    "Downstream rejected profile permanently, discarding"
                );
                self.discard_profile(steam_id).await;
            }
        }
    }

    /// Retry deferred checks whose endpoint class has a free connection.
    pub async fn reactivate_deferred(&self) {
        let removed = self.cooldowns.cleanup_expired().await;
        if removed > 0 {
            tracing::debug!(removed, "Cooldowns expired before reactivation pass");
        }

        let pairs: Vec<(String, CheckName)> = {
            let deferred = self.deferred.lock().await;
            deferred.iter().cloned().collect()
        };
        if pairs.is_empty() {
            return;
        }

        for (steam_id, check) in pairs {
            if !self.cooldowns.any_available_for(check.endpoint_class()).await {
                continue;
            }

            // The profile may have been discarded while the check waited.
            let still_queued = matches!(self.queue.by_id(&steam_id).await, Ok(Some(_)));
            if !still_queued {
                self.deferred.lock().await.remove(&(steam_id.clone(), check));
                continue;
            }

            tracing::info!(
                steam_id = %steam_id,
                check = %check,
                "Reactivating deferred check"
            );

            if self.short_circuit_private(&steam_id, check).await {
                self.update_status(&steam_id, check, CheckStatus::Passed).await;
                self.deferred.lock().await.remove(&(steam_id.clone(), check));
                continue;
            }

            match self.validator.run_check(check, &steam_id).await {
                Verdict::Settled {
                    passed: true,
                    private,
                    ..
                } => {
                    if private && check == CheckName::SteamLevel {
                        self.private_profiles.lock().await.insert(steam_id.clone());
                    }
                    self.update_status(&steam_id, check, CheckStatus::Passed).await;
                    self.deferred.lock().await.remove(&(steam_id.clone(), check));
                }
                Verdict::Settled { passed: false, .. } => {
                    self.update_status(&steam_id, check, CheckStatus::Failed).await;
                    self.deferred.lock().await.remove(&(steam_id.clone(), check));
                    self.discard_profile(&steam_id).await;
                }
                Verdict::Deferred { .. } => {
                    // Still cooling; the pair stays in the set.
                }
                Verdict::TransportError { message } => {
                    tracing::warn!(
                        steam_id = %steam_id,
                        check = %check,
                        error = %message,
                        "Reactivated check failed to dispatch, keeping deferred"
                    );
                }
            }
        }
    }

    async fn log_availability(&self) {
        let (connections, cells) = self.cooldowns.snapshot().await;
        let deferred_checks = self.deferred.lock().await.len();
        tracing::info!(
            connections = connections.len(),
            cooling_cells = cells.len(),
            deferred_checks = deferred_checks,
            "Cooldown status"
        );
    }

    async fn short_circuit_private(&self, steam_id: &str, check: CheckName) -> bool {
        if check != CheckName::Friends && check != CheckName::CsgoInventory {
            return false;
        }
        self.private_profiles.lock().await.contains(steam_id)
    }

    async fn defer_check(&self, steam_id: &str, check: CheckName) {
        self.update_status(steam_id, check, CheckStatus::Deferred).await;
        self.deferred
            .lock()
            .await
            .insert((steam_id.to_string(), check));
    }

    async fn update_status(&self, steam_id: &str, check: CheckName, status: CheckStatus) {
        if let Err(e) = self.queue.update_check(steam_id, check, status).await {
            tracing::error!(
                steam_id = %steam_id,
                check = %check,
                error = %e,
                "Failed to persist check status"
            );
        }
    }

    /// Remove a profile and every piece of in-memory state attached to it.
    async fn discard_profile(&self, steam_id: &str) {
        if let Err(e) = self.queue.remove(steam_id).await {
            tracing::error!(steam_id = %steam_id, error = %e, "Failed to remove profile");
            return;
        }
        self.private_profiles.lock().await.remove(steam_id);
        self.deferred
            .lock()
            .await
            .retain(|(id, _)| id != steam_id);
    }

    /// Number of deferred `(profile, check)` pairs, for health output.
    pub async fn deferred_count(&self) -> usize {
        self.deferred.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CooldownDurations;
    use crate::connections::ConnectionStore;
    use crate::cooldowns::CooldownReason;
    use crate::dispatcher::Dispatcher;
    use crate::endpoints::EndpointClass;
    use tempfile::TempDir;

    async fn scheduler_fixture(dir: &TempDir) -> (Arc<Scheduler>, Arc<QueueStore>, Arc<CooldownStore>) {
        let config = Config::for_tests(dir.path().to_path_buf());
        let registry = Arc::new(ConnectionStore::new(config.proxies_path()).await);
        let snapshot = registry.list().await;
        let cooldowns = Arc::new(
            CooldownStore::new(
                config.cooldowns_path(),
                config.backoff_sequence.clone(),
                CooldownDurations::default(),
                snapshot,
            )
            .await,
        );
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&cooldowns),
            Duration::from_millis(1),
        ));
        let validator = Arc::new(Validator::new(dispatcher, &config));
        let ingest = Arc::new(IngestClient::new(
            config.ingest_api_url.clone(),
            config.ingest_api_key.clone(),
        ));
        let queue = Arc::new(QueueStore::new(config.queue_path()));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&queue),
            Arc::clone(&cooldowns),
            validator,
            ingest,
            &config,
        ));
        (scheduler, queue, cooldowns)
    }

    #[tokio::test]
    async fn seed_deferred_restores_pairs_from_queue() {
        let dir = TempDir::new().unwrap();
        let (scheduler, queue, _) = scheduler_fixture(&dir).await;

        queue.add("1", "a").await.unwrap();
        queue
            .update_check("1", CheckName::CsgoInventory, CheckStatus::Deferred)
            .await
            .unwrap();

        scheduler.seed_deferred().await;
        assert_eq!(scheduler.deferred_count().await, 1);
    }

    #[tokio::test]
    async fn deferred_checks_wait_while_column_is_cooling() {
        let dir = TempDir::new().unwrap();
        let (scheduler, queue, cooldowns) = scheduler_fixture(&dir).await;

        queue.add("1", "a").await.unwrap();
        queue
            .update_check("1", CheckName::CsgoInventory, CheckStatus::Deferred)
            .await
            .unwrap();
        scheduler.seed_deferred().await;

        // Whole inventory column cooling: the reactivation pass must not
        // dispatch and the pair must stay in the set.
        cooldowns
            .mark(0, EndpointClass::Inventory, CooldownReason::RateLimited, "429")
            .await;
        scheduler.reactivate_deferred().await;
        assert_eq!(scheduler.deferred_count().await, 1);

        let profile = queue.by_id("1").await.unwrap().unwrap();
        assert_eq!(
            profile.checks.get(&CheckName::CsgoInventory),
            Some(&CheckStatus::Deferred)
        );
    }

    #[tokio::test]
    async fn reactivation_drops_pairs_for_vanished_profiles() {
        let dir = TempDir::new().unwrap();
        let (scheduler, queue, _) = scheduler_fixture(&dir).await;

        queue.add("1", "a").await.unwrap();
        queue
            .update_check("1", CheckName::Friends, CheckStatus::Deferred)
            .await
            .unwrap();
        scheduler.seed_deferred().await;
        queue.remove("1").await.unwrap();

        scheduler.reactivate_deferred().await;
        assert_eq!(scheduler.deferred_count().await, 0);
    }

    #[tokio::test]
    async fn private_flag_short_circuits_dependent_checks() {
        let dir = TempDir::new().unwrap();
        let (scheduler, queue, _) = scheduler_fixture(&dir).await;

        queue.add("1", "a").await.unwrap();
        scheduler.private_profiles.lock().await.insert("1".to_string());

        assert!(
            scheduler
                .short_circuit_private("1", CheckName::Friends)
                .await
        );
        assert!(
            scheduler
                .short_circuit_private("1", CheckName::CsgoInventory)
                .await
        );
        // Only the two dependent checks are short-circuited.
        assert!(
            !scheduler
                .short_circuit_private("1", CheckName::SteamLevel)
                .await
        );
        assert!(
            !scheduler
                .short_circuit_private("2", CheckName::Friends)
                .await
        );
    }

    #[tokio::test]
    async fn discard_profile_purges_all_scheduler_state() {
        let dir = TempDir::new().unwrap();
        let (scheduler, queue, _) = scheduler_fixture(&dir).await;

        queue.add("1", "a").await.unwrap();
        scheduler.private_profiles.lock().await.insert("1".to_string());
        scheduler
            .deferred
            .lock()
            .await
            .insert(("1".to_string(), CheckName::Friends));

        scheduler.discard_profile("1").await;
        assert!(queue.by_id("1").await.unwrap().is_none());
        assert_eq!(scheduler.deferred_count().await, 0);
        assert!(!scheduler.private_profiles.lock().await.contains("1"));
    }

    #[tokio::test]
    async fn tick_gate_rejects_overlapping_ticks() {
        let dir = TempDir::new().unwrap();
        let (scheduler, _, _) = scheduler_fixture(&dir).await;

        let permit = scheduler.tick_gate.try_acquire().unwrap();
        assert!(!scheduler.tick().await);
        drop(permit);
        // Empty queue: tick runs but finds nothing to do.
        assert!(!scheduler.tick().await);
    }
}
