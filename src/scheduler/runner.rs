//! The scheduler service: arms jobs, fires them through a callback, and
//! enforces the concurrency cap, bounded retry, backoff, and auto-disable.

use crate::scheduler::{CronStore, Schedule, ScheduledJob, SchedulerConfig};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

/// Callback driven at each job firing.
#[async_trait]
pub trait OnFire: Send + Sync {
    async fn fire(&self, job: &ScheduledJob) -> Result<(), String>;
}

/// Running/pending execution bookkeeping, guarded together so admission and
/// drain can never deadlock.
#[derive(Default)]
struct ExecState {
    running: HashSet<String>,
    /// FIFO of job ids waiting for capacity; no duplicates
    pending: VecDeque<String>,
}

pub struct Scheduler {
    store: Arc<CronStore>,
    config: SchedulerConfig,
    on_fire: Arc<dyn OnFire>,
    exec: Mutex<ExecState>,
    /// Arming tasks by job id
    armed: DashMap<String, JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(store: Arc<CronStore>, config: SchedulerConfig, on_fire: Arc<dyn OnFire>) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Scheduler {
            store,
            config,
            on_fire,
            exec: Mutex::new(ExecState::default()),
            armed: DashMap::new(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn store(&self) -> &Arc<CronStore> {
        &self.store
    }

    /// Arm every enabled job, recover missed one-shots, and start the safety
    /// tick.
    pub fn start(self: &Arc<Self>) {
        let jobs = self.store.list();
        log::info!("[SCHEDULER] Starting with {} job(s)", jobs.len());
        for job in jobs {
            if !job.enabled {
                continue;
            }
            // Missed one-shot recovery: target in the past and never run
            if let Some(target) = job.at_target() {
                if target <= Utc::now() && job.run_count == 0 {
                    log::info!(
                        "[SCHEDULER] Recovering missed one-shot '{}' ({})",
                        job.name,
                        job.id
                    );
                    self.enqueue_execution(&job.id);
                    continue;
                }
            }
            self.arm(&job);
        }

        let scheduler = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let tick = Duration::from_secs(scheduler.config.safety_tick_secs.max(1));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = sleep(tick) => scheduler.safety_tick(),
                }
            }
        });
    }

    /// Signal shutdown and unarm everything. In-flight firings are left to
    /// finish or time out on their own.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        for entry in self.armed.iter() {
            entry.value().abort();
        }
        self.armed.clear();
        log::info!("[SCHEDULER] Stopped");
    }

    /// Add a job to the store and arm it if enabled.
    pub fn add_job(self: &Arc<Self>, job: ScheduledJob) -> Result<ScheduledJob, String> {
        let job = self.store.add(job)?;
        if job.enabled {
            self.arm(&job);
        }
        Ok(job)
    }

    /// Remove a job and unarm it.
    pub fn remove_job(&self, id: &str) -> Result<bool, String> {
        self.unarm(id);
        self.store.remove(id)
    }

    pub fn list_jobs(&self) -> Vec<ScheduledJob> {
        self.store.list()
    }

    /// Enable or disable a job. Enabling an auto-disabled job resets its
    /// failure counter and re-arms it.
    pub fn set_enabled(self: &Arc<Self>, id: &str, enabled: bool) -> Result<ScheduledJob, String> {
        let job = self.store.update(id, |j| {
            j.enabled = enabled;
            if enabled {
                j.state.consecutive_failures = 0;
            }
        })?;
        self.unarm(id);
        if enabled {
            self.arm(&job);
        }
        Ok(job)
    }

    /// Apply an arbitrary mutation and re-arm.
    pub fn update_job<F>(self: &Arc<Self>, id: &str, mutate: F) -> Result<ScheduledJob, String>
    where
        F: FnOnce(&mut ScheduledJob),
    {
        let job = self.store.update(id, mutate)?;
        self.unarm(id);
        if job.enabled {
            self.arm(&job);
        }
        Ok(job)
    }

    /// Fire a job immediately, bypassing its schedule but honoring the
    /// single-instance rule. Waits for the firing to finish.
    pub async fn run_now(self: &Arc<Self>, id: &str) -> Result<(), String> {
        {
            let mut exec = self.exec.lock().expect("exec state poisoned");
            if !exec.running.insert(id.to_string()) {
                return Err(format!("job '{}' is already running", id));
            }
        }
        self.execute_firing(id).await;
        self.finish_execution(id);
        Ok(())
    }

    /// Arm one job: register a timer/evaluator task that enqueues executions
    /// at each scheduled moment. Invalid cron expressions stay in the store
    /// but never arm.
    fn arm(self: &Arc<Self>, job: &ScheduledJob) {
        self.unarm(&job.id);

        let next = job.next_occurrence(Utc::now());
        let next_ms = next.map(|dt| dt.timestamp_millis());
        let _ = self.store.update(&job.id, |j| j.state.next_run_at_ms = next_ms);

        match &job.schedule {
            Schedule::At { .. } => {
                let Some(target) = job.at_target() else {
                    log::warn!("[SCHEDULER] Job '{}' has an unparseable target time", job.name);
                    return;
                };
                // A one-shot that already ran stays idle
                if target <= Utc::now() && job.run_count > 0 {
                    return;
                }
                let scheduler = Arc::clone(self);
                let job_id = job.id.clone();
                let handle = tokio::spawn(async move {
                    let wait = (target - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    sleep(wait).await;
                    scheduler.enqueue_execution(&job_id);
                });
                self.armed.insert(job.id.clone(), handle);
            }
            Schedule::Cron { expr, .. } => {
                if next.is_none() {
                    log::warn!(
                        "[SCHEDULER] Job '{}' has invalid cron expression '{}'; stored but not armed",
                        job.name,
                        expr
                    );
                    return;
                }
                self.arm_recurring(job.id.clone());
            }
            Schedule::Every { .. } => {
                self.arm_recurring(job.id.clone());
            }
        }
    }

    /// Evaluator loop for cron and interval jobs: recompute the next
    /// occurrence after every firing.
    fn arm_recurring(self: &Arc<Self>, job_id: String) {
        let scheduler = Arc::clone(self);
        let id_for_map = job_id.clone();
        let mut shutdown = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Some(job) = scheduler.store.get(&job_id) else {
                    break;
                };
                if !job.enabled {
                    break;
                }
                let Some(next) = job.next_occurrence(Utc::now()) else {
                    break;
                };
                let _ = scheduler.store.update(&job_id, |j| {
                    j.state.next_run_at_ms = Some(next.timestamp_millis());
                });
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = sleep(wait) => {}
                }
                scheduler.enqueue_execution(&job_id);
            }
        });
        self.armed.insert(id_for_map, handle);
    }

    fn unarm(&self, job_id: &str) {
        if let Some((_, handle)) = self.armed.remove(job_id) {
            handle.abort();
        }
    }

    /// Admit a firing under the concurrency cap, or append it to the FIFO
    /// pending queue. A job already running or queued is not duplicated.
    pub fn enqueue_execution(self: &Arc<Self>, job_id: &str) {
        let admit = {
            let mut exec = self.exec.lock().expect("exec state poisoned");
            if exec.running.contains(job_id) || exec.pending.iter().any(|id| id == job_id) {
                false
            } else if exec.running.len() < self.config.max_concurrency {
                exec.running.insert(job_id.to_string());
                true
            } else {
                exec.pending.push_back(job_id.to_string());
                false
            }
        };
        if admit {
            self.spawn_execution(job_id.to_string());
        }
    }

    fn spawn_execution(self: &Arc<Self>, job_id: String) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.execute_firing(&job_id).await;
            scheduler.finish_execution(&job_id);
        });
    }

    /// Release a running slot and drain the pending queue.
    fn finish_execution(self: &Arc<Self>, job_id: &str) {
        let next_up = {
            let mut exec = self.exec.lock().expect("exec state poisoned");
            exec.running.remove(job_id);
            if exec.running.len() < self.config.max_concurrency {
                if let Some(next) = exec.pending.pop_front() {
                    exec.running.insert(next.clone());
                    Some(next)
                } else {
                    None
                }
            } else {
                None
            }
        };
        if let Some(next) = next_up {
            self.spawn_execution(next);
        }
    }

    /// One firing of one job: bounded retry with exponential backoff, timeout
    /// without retry, auto-disable after too many failed firings, and durable
    /// state transitions throughout.
    async fn execute_firing(self: &Arc<Self>, job_id: &str) {
        let Some(job) = self.store.get(job_id) else {
            return;
        };
        if !job.enabled {
            log::debug!("[SCHEDULER] Skipping disabled job '{}'", job.name);
            return;
        }

        log::info!("[SCHEDULER] Executing job '{}' ({})", job.name, job.id);
        let _ = self.store.update(job_id, |j| {
            j.last_run_at = Some(Utc::now().to_rfc3339());
            j.run_count += 1;
        });

        let mut success = false;
        let mut last_error: Option<String> = None;
        let job_timeout = Duration::from_secs(self.config.job_timeout_secs.max(1));

        for attempt in 0..=self.config.max_retries {
            match timeout(job_timeout, self.on_fire.fire(&job)).await {
                Ok(Ok(())) => {
                    success = true;
                    break;
                }
                Ok(Err(e)) => {
                    log::warn!(
                        "[SCHEDULER] Job '{}' attempt {} failed: {}",
                        job.name,
                        attempt + 1,
                        e
                    );
                    last_error = Some(e);
                    if attempt < self.config.max_retries {
                        let delay = self
                            .config
                            .retry_base_delay_ms
                            .saturating_mul(1u64 << attempt.min(16));
                        let _ = self.store.update(job_id, |j| {
                            j.state.last_retry_at_ms = Some(Utc::now().timestamp_millis());
                        });
                        sleep(Duration::from_millis(delay)).await;
                    }
                }
                Err(_) => {
                    // A hung task is unlikely to do better a second time
                    let msg = format!(
                        "timed out after {}s",
                        self.config.job_timeout_secs
                    );
                    log::warn!("[SCHEDULER] Job '{}' {}", job.name, msg);
                    last_error = Some(msg);
                    break;
                }
            }
        }

        if success {
            let _ = self.store.update(job_id, |j| {
                j.last_error = None;
                j.state.consecutive_failures = 0;
            });
        } else {
            let updated = self.store.update(job_id, |j| {
                j.last_error = last_error.clone();
                j.state.consecutive_failures += 1;
            });
            if let Ok(job) = updated {
                if job.state.consecutive_failures >= self.config.max_consecutive_failures {
                    log::warn!(
                        "[SCHEDULER] Auto-disabling job '{}' after {} consecutive failures",
                        job.name,
                        job.state.consecutive_failures
                    );
                    let _ = self.store.update(job_id, |j| j.enabled = false);
                    self.unarm(job_id);
                }
            }
        }

        if job.delete_after_run && success {
            log::info!("[SCHEDULER] Removing one-shot job '{}' after run", job.name);
            self.unarm(job_id);
            let _ = self.store.remove(job_id);
            return;
        }

        // Recompute the next occurrence; one-shots have none and stay unarmed
        let next_ms = self
            .store
            .get(job_id)
            .and_then(|j| j.next_occurrence(Utc::now()))
            .map(|dt| dt.timestamp_millis());
        let _ = self.store.update(job_id, |j| j.state.next_run_at_ms = next_ms);
    }

    /// Re-check one-shot jobs whose arming was lost.
    fn safety_tick(self: &Arc<Self>) {
        let now = Utc::now();
        for job in self.store.list() {
            if !job.enabled || job.run_count > 0 {
                continue;
            }
            let Some(target) = job.at_target() else {
                continue;
            };
            if target > now {
                continue;
            }
            let armed_alive = self
                .armed
                .get(&job.id)
                .map(|h| !h.is_finished())
                .unwrap_or(false);
            if armed_alive {
                continue;
            }
            log::info!(
                "[SCHEDULER] Safety tick re-enqueueing one-shot '{}' ({})",
                job.name,
                job.id
            );
            self.enqueue_execution(&job.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::JobPayload;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFire {
        count: AtomicUsize,
        fail: bool,
        delay_ms: u64,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl CountingFire {
        fn new() -> Arc<Self> {
            Arc::new(CountingFire {
                count: AtomicUsize::new(0),
                fail: false,
                delay_ms: 0,
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(CountingFire {
                count: AtomicUsize::new(0),
                fail: true,
                delay_ms: 0,
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            })
        }

        fn slow(delay_ms: u64) -> Arc<Self> {
            Arc::new(CountingFire {
                count: AtomicUsize::new(0),
                fail: false,
                delay_ms,
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            })
        }

        fn fired(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OnFire for CountingFire {
        async fn fire(&self, _job: &ScheduledJob) -> Result<(), String> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            if self.delay_ms > 0 {
                sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.count.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err("injected failure".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            max_concurrency: 3,
            max_retries: 0,
            retry_base_delay_ms: 1,
            max_consecutive_failures: 3,
            job_timeout_secs: 5,
            safety_tick_secs: 1,
        }
    }

    fn store() -> (tempfile::TempDir, Arc<CronStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CronStore::load(dir.path().join("cron-store.json")));
        (dir, store)
    }

    fn at_job_in_past() -> ScheduledJob {
        ScheduledJob::new(
            "missed",
            Schedule::At {
                at: (Utc::now() - chrono::Duration::minutes(5)).to_rfc3339(),
            },
            JobPayload::AgentTurn {
                message: "catch up".to_string(),
            },
            "cron:missed",
        )
    }

    #[tokio::test]
    async fn missed_one_shot_fires_once_and_is_removed() {
        let (_dir, store) = store();
        let job = at_job_in_past();
        let job_id = job.id.clone();
        store.add(job).unwrap();

        let fire = CountingFire::new();
        let scheduler = Scheduler::new(store.clone(), fast_config(), fire.clone());
        scheduler.start();

        for _ in 0..50 {
            if fire.fired() == 1 && store.get(&job_id).is_none() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(fire.fired(), 1);
        assert!(store.get(&job_id).is_none(), "delete_after_run must remove");
        scheduler.stop();
    }

    #[tokio::test]
    async fn consecutive_failures_auto_disable() {
        let (_dir, store) = store();
        let job = ScheduledJob::new(
            "flaky",
            Schedule::Every {
                interval_ms: 60 * 60 * 1000,
            },
            JobPayload::SystemEvent {
                text: "x".to_string(),
            },
            "cron:flaky",
        );
        let job_id = job.id.clone();
        store.add(job).unwrap();

        let fire = CountingFire::failing();
        let scheduler = Scheduler::new(store.clone(), fast_config(), fire.clone());

        for _ in 0..3 {
            scheduler.run_now(&job_id).await.unwrap();
        }
        let job = store.get(&job_id).unwrap();
        assert!(!job.enabled);
        assert_eq!(job.state.consecutive_failures, 3);
        assert!(job.last_error.as_deref().unwrap().contains("injected"));

        // A disabled job never fires again
        scheduler.run_now(&job_id).await.unwrap();
        assert_eq!(fire.fired(), 3);

        // Explicit re-enable resets the failure counter
        let job = scheduler.set_enabled(&job_id, true).unwrap();
        assert_eq!(job.state.consecutive_failures, 0);
        scheduler.stop();
    }

    #[tokio::test]
    async fn concurrency_cap_is_enforced() {
        let (_dir, store) = store();
        let mut ids = Vec::new();
        for i in 0..6 {
            let job = ScheduledJob::new(
                format!("burst-{}", i),
                Schedule::Every {
                    interval_ms: 60 * 60 * 1000,
                },
                JobPayload::SystemEvent {
                    text: "x".to_string(),
                },
                format!("cron:burst-{}", i),
            );
            ids.push(job.id.clone());
            store.add(job).unwrap();
        }

        let fire = CountingFire::slow(50);
        let config = SchedulerConfig {
            max_concurrency: 2,
            ..fast_config()
        };
        let scheduler = Scheduler::new(store.clone(), config, fire.clone());

        for id in &ids {
            scheduler.enqueue_execution(id);
        }
        for _ in 0..100 {
            if fire.fired() == ids.len() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(fire.fired(), ids.len());
        assert!(
            fire.max_active.load(Ordering::SeqCst) <= 2,
            "in-flight exceeded the cap"
        );
        scheduler.stop();
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_coalesced() {
        let (_dir, store) = store();
        let job = ScheduledJob::new(
            "dup",
            Schedule::Every {
                interval_ms: 60 * 60 * 1000,
            },
            JobPayload::SystemEvent {
                text: "x".to_string(),
            },
            "cron:dup",
        );
        let id = job.id.clone();
        store.add(job).unwrap();

        let fire = CountingFire::slow(60);
        let scheduler = Scheduler::new(store.clone(), fast_config(), fire.clone());
        scheduler.enqueue_execution(&id);
        scheduler.enqueue_execution(&id);
        scheduler.enqueue_execution(&id);

        sleep(Duration::from_millis(300)).await;
        assert_eq!(fire.fired(), 1);
        scheduler.stop();
    }

    #[tokio::test]
    async fn invalid_cron_is_stored_but_not_armed() {
        let (_dir, store) = store();
        let fire = CountingFire::new();
        let scheduler = Scheduler::new(store.clone(), fast_config(), fire.clone());

        let job = ScheduledJob::new(
            "broken",
            Schedule::Cron {
                expr: "nonsense".to_string(),
                tz: None,
            },
            JobPayload::SystemEvent {
                text: "x".to_string(),
            },
            "cron:broken",
        );
        let id = job.id.clone();
        scheduler.add_job(job).unwrap();

        let listed = scheduler.list_jobs();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].state.next_run_at_ms.is_none());
        assert!(!scheduler.armed.contains_key(&id));
        scheduler.stop();
    }

    #[tokio::test]
    async fn timeout_is_fatal_for_the_firing_without_retry() {
        struct HangingFire {
            attempts: AtomicUsize,
        }

        #[async_trait]
        impl OnFire for HangingFire {
            async fn fire(&self, _job: &ScheduledJob) -> Result<(), String> {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<()>().await;
                unreachable!()
            }
        }

        let (_dir, store) = store();
        let job = ScheduledJob::new(
            "hang",
            Schedule::Every {
                interval_ms: 60 * 60 * 1000,
            },
            JobPayload::SystemEvent {
                text: "x".to_string(),
            },
            "cron:hang",
        );
        let id = job.id.clone();
        store.add(job).unwrap();

        let fire = Arc::new(HangingFire {
            attempts: AtomicUsize::new(0),
        });
        let config = SchedulerConfig {
            max_retries: 2,
            job_timeout_secs: 1,
            ..fast_config()
        };
        let scheduler = Scheduler::new(store.clone(), config, fire.clone());
        scheduler.run_now(&id).await.unwrap();

        assert_eq!(fire.attempts.load(Ordering::SeqCst), 1, "timeouts must not retry");
        let job = store.get(&id).unwrap();
        assert!(job.last_error.as_deref().unwrap().contains("timed out"));
        scheduler.stop();
    }

    #[tokio::test]
    async fn retries_then_succeeds_clears_error() {
        struct FlakyOnce {
            attempts: AtomicUsize,
        }

        #[async_trait]
        impl OnFire for FlakyOnce {
            async fn fire(&self, _job: &ScheduledJob) -> Result<(), String> {
                if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("transient".to_string())
                } else {
                    Ok(())
                }
            }
        }

        let (_dir, store) = store();
        let job = ScheduledJob::new(
            "flaky-once",
            Schedule::Every {
                interval_ms: 60 * 60 * 1000,
            },
            JobPayload::SystemEvent {
                text: "x".to_string(),
            },
            "cron:flaky-once",
        );
        let id = job.id.clone();
        store.add(job).unwrap();

        let fire = Arc::new(FlakyOnce {
            attempts: AtomicUsize::new(0),
        });
        let config = SchedulerConfig {
            max_retries: 2,
            retry_base_delay_ms: 1,
            ..fast_config()
        };
        let scheduler = Scheduler::new(store.clone(), config, fire.clone());
        scheduler.run_now(&id).await.unwrap();

        let job = store.get(&id).unwrap();
        assert!(job.last_error.is_none());
        assert_eq!(job.state.consecutive_failures, 0);
        assert_eq!(job.run_count, 1);
        scheduler.stop();
    }
}
