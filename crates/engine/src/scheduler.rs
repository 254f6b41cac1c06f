//! Per-user interval jobs.
//!
//! One logical job per user, keyed by user id. A job sleeps for the user's
//! interval, runs a tick inline, then sleeps again from the moment the tick
//! finished, so missed firings coalesce into one run. Ticks of the same user
//! never overlap (a per-user guard) and the number of users being checked at
//! once is bounded by a shared semaphore.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use handle_watch_domain::{
    clamp_interval, AccountRecord, Clock, Repositories, UserId, VerifyMode,
};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::{
    sync::{watch, Semaphore},
    task::{AbortHandle, JoinHandle},
    time::Instant,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    notifier::{escape_html, InlineButton, Notifier, SHOW_INACTIVE_ACCOUNTS},
    pipeline::{profile_url, AccountVerifier, IndeterminateReason, Outcome},
    provider::ProfileSummary,
    EngineError,
};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrent_users: usize,
    pub shutdown_grace: Duration,
    pub profile_base_url: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_users: 10,
            shutdown_grace: Duration::from_secs(30),
            profile_base_url: "https://www.instagram.com".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserJobStatus {
    pub user_id: i64,
    pub running: bool,
    pub checking: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub total_checks: u64,
    pub total_found: u64,
    pub total_errors: u64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub interval_minutes: Option<u32>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub max_concurrent_users: usize,
    pub active_jobs: usize,
    pub users: Vec<UserJobStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickKind {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickControl {
    Continue,
    Stop,
}

#[derive(Debug, Default)]
struct Counters {
    checking: bool,
    last_run_at: Option<DateTime<Utc>>,
    total_checks: u64,
    total_found: u64,
    total_errors: u64,
    next_run_at: Option<DateTime<Utc>>,
    interval_minutes: Option<u32>,
    last_error: Option<String>,
}

#[derive(Default)]
struct JobState {
    /// Single-flight guard; held for the whole tick.
    guard: tokio::sync::Mutex<()>,
    counters: Mutex<Counters>,
}

impl JobState {
    fn update(&self, f: impl FnOnce(&mut Counters)) {
        f(&mut lock(&self.counters));
    }
}

struct JobHandle {
    generation: u64,
    interval_tx: watch::Sender<u32>,
    cancel: CancellationToken,
    abort: AbortHandle,
}

struct SchedulerInner {
    repos: Arc<dyn Repositories>,
    verifier: Arc<dyn AccountVerifier>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    jobs: Mutex<HashMap<UserId, JobHandle>>,
    states: Mutex<HashMap<UserId, Arc<JobState>>>,
    triggers: Mutex<Vec<AbortHandle>>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: Mutex<CancellationToken>,
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct UserScheduler {
    inner: Arc<SchedulerInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn minutes(value: u32) -> Duration {
    Duration::from_secs(u64::from(value) * 60)
}

impl UserScheduler {
    pub fn new(
        repos: Arc<dyn Repositories>,
        verifier: Arc<dyn AccountVerifier>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_users.max(1)));
        Self {
            inner: Arc::new(SchedulerInner {
                repos,
                verifier,
                notifier,
                clock,
                settings,
                jobs: Mutex::new(HashMap::new()),
                states: Mutex::new(HashMap::new()),
                triggers: Mutex::new(Vec::new()),
                permits,
                tracker: TaskTracker::new(),
                shutdown: Mutex::new(CancellationToken::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Schedules every active user with auto-check switched on. Returns the
    /// number of jobs started.
    pub async fn start_all(&self) -> Result<usize, EngineError> {
        {
            let mut shutdown = lock(&self.inner.shutdown);
            if shutdown.is_cancelled() {
                *shutdown = CancellationToken::new();
            }
        }
        self.inner.tracker.reopen();

        let users = self.inner.repos.list_auto_check_users().await?;
        for user in &users {
            self.inner.ensure_job(user.id, user.check_interval_minutes);
        }
        info!(jobs = users.len(), "user scheduler started");
        Ok(users.len())
    }

    /// Cancels every job and waits up to the grace period for running ticks.
    pub async fn stop_all(&self) {
        lock(&self.inner.shutdown).cancel();
        let jobs: Vec<JobHandle> = lock(&self.inner.jobs).drain().map(|(_, job)| job).collect();
        gauge!("engine_active_user_jobs").set(0.0);
        self.inner.tracker.close();

        let grace = self.inner.settings.shutdown_grace;
        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(grace_secs = grace.as_secs(), "abandoning ticks still running after grace period");
            for job in &jobs {
                job.abort.abort();
            }
            for trigger in lock(&self.inner.triggers).drain(..) {
                trigger.abort();
            }
        }
        for state in lock(&self.inner.states).values() {
            state.update(|counters| {
                counters.next_run_at = None;
                counters.interval_minutes = None;
            });
        }
        info!(jobs = jobs.len(), "user scheduler stopped");
    }

    /// Persists auto-check on with `interval_minutes` and (re)starts the job.
    pub async fn enable(&self, user: UserId, interval_minutes: u32) -> Result<(), EngineError> {
        let interval = clamp_interval(interval_minutes);
        self.inner
            .repos
            .update_user_schedule(user, interval, true)
            .await?
            .ok_or(EngineError::UnknownUser(user))?;
        self.inner.ensure_job(user, interval);
        info!(user_id = %user, interval, "auto check enabled");
        Ok(())
    }

    pub async fn disable(&self, user: UserId) -> Result<(), EngineError> {
        let record = self
            .inner
            .repos
            .find_user(user)
            .await?
            .ok_or(EngineError::UnknownUser(user))?;
        self.inner
            .repos
            .update_user_schedule(user, record.check_interval_minutes, false)
            .await?;
        self.inner.cancel_job(user);
        info!(user_id = %user, "auto check disabled");
        Ok(())
    }

    /// Persists the new interval. A running job picks it up without
    /// interrupting an in-flight tick: the next fire is one new interval
    /// after the last completion.
    pub async fn update_interval(&self, user: UserId, interval_minutes: u32) -> Result<u32, EngineError> {
        let interval = clamp_interval(interval_minutes);
        let record = self
            .inner
            .repos
            .find_user(user)
            .await?
            .ok_or(EngineError::UnknownUser(user))?;
        let record = self
            .inner
            .repos
            .update_user_schedule(user, interval, record.auto_check_enabled)
            .await?
            .ok_or(EngineError::UnknownUser(user))?;
        if record.wants_auto_check() {
            self.inner.ensure_job(user, interval);
        }
        Ok(interval)
    }

    /// One out-of-band tick. It respects the single-flight guard, so it is
    /// dropped when a tick for the same user is already running.
    pub async fn trigger_now(&self, user: UserId) -> Result<JoinHandle<()>, EngineError> {
        if self.inner.repos.find_user(user).await?.is_none() {
            return Err(EngineError::UnknownUser(user));
        }
        let inner = self.inner.clone();
        let cancel = inner.shutdown_token().child_token();
        let handle = self.inner.tracker.spawn(async move {
            inner.tick(user, TickKind::Manual, &cancel).await;
        });
        let mut triggers = lock(&self.inner.triggers);
        triggers.retain(|trigger| !trigger.is_finished());
        triggers.push(handle.abort_handle());
        Ok(handle)
    }

    pub fn is_scheduled(&self, user: UserId) -> bool {
        lock(&self.inner.jobs).contains_key(&user)
    }

    pub fn status(&self, user: UserId) -> Option<UserJobStatus> {
        let running = self.is_scheduled(user);
        let state = lock(&self.inner.states).get(&user).cloned();
        match state {
            Some(state) => Some(snapshot(user, running, &state)),
            None if running => Some(snapshot(user, running, &JobState::default())),
            None => None,
        }
    }

    pub fn status_all(&self) -> SchedulerStatus {
        let scheduled: Vec<UserId> = lock(&self.inner.jobs).keys().copied().collect();
        let states: BTreeMap<UserId, Arc<JobState>> = lock(&self.inner.states)
            .iter()
            .map(|(user, state)| (*user, state.clone()))
            .collect();

        let mut users: Vec<UserId> = states.keys().copied().collect();
        users.extend(scheduled.iter().filter(|user| !states.contains_key(user)));
        users.sort();

        SchedulerStatus {
            running: !lock(&self.inner.shutdown).is_cancelled(),
            max_concurrent_users: self.inner.settings.max_concurrent_users,
            active_jobs: scheduled.len(),
            users: users
                .into_iter()
                .filter_map(|user| self.status(user))
                .collect(),
        }
    }
}

fn snapshot(user: UserId, running: bool, state: &JobState) -> UserJobStatus {
    let counters = lock(&state.counters);
    UserJobStatus {
        user_id: user.get(),
        running,
        checking: counters.checking,
        last_run_at: counters.last_run_at,
        total_checks: counters.total_checks,
        total_found: counters.total_found,
        total_errors: counters.total_errors,
        next_run_at: counters.next_run_at,
        interval_minutes: counters.interval_minutes,
        last_error: counters.last_error.clone(),
    }
}

impl SchedulerInner {
    fn shutdown_token(&self) -> CancellationToken {
        lock(&self.shutdown).clone()
    }

    fn state(&self, user: UserId) -> Arc<JobState> {
        lock(&self.states).entry(user).or_default().clone()
    }

    fn ensure_job(self: &Arc<Self>, user: UserId, interval: u32) {
        let interval = clamp_interval(interval);
        let mut jobs = lock(&self.jobs);
        if let Some(job) = jobs.get(&user) {
            if !job.cancel.is_cancelled() {
                job.interval_tx.send_replace(interval);
                return;
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (interval_tx, interval_rx) = watch::channel(interval);
        let cancel = self.shutdown_token().child_token();
        let task = self.tracker.spawn(run_job(
            self.clone(),
            user,
            generation,
            interval_rx,
            cancel.clone(),
        ));
        jobs.insert(
            user,
            JobHandle {
                generation,
                interval_tx,
                cancel,
                abort: task.abort_handle(),
            },
        );
        gauge!("engine_active_user_jobs").set(jobs.len() as f64);
        debug!(user_id = %user, interval, generation, "user job scheduled");
    }

    fn cancel_job(&self, user: UserId) {
        let mut jobs = lock(&self.jobs);
        if let Some(job) = jobs.remove(&user) {
            job.cancel.cancel();
        }
        gauge!("engine_active_user_jobs").set(jobs.len() as f64);
        drop(jobs);
        self.state(user).update(|counters| {
            counters.next_run_at = None;
            counters.interval_minutes = None;
        });
    }

    /// Called by a job on its way out; a newer job for the same user stays.
    fn remove_job(&self, user: UserId, generation: u64) {
        let mut jobs = lock(&self.jobs);
        if jobs.get(&user).is_some_and(|job| job.generation == generation) {
            jobs.remove(&user);
            drop(jobs);
            self.state(user).update(|counters| {
                counters.next_run_at = None;
                counters.interval_minutes = None;
            });
            let count = lock(&self.jobs).len();
            gauge!("engine_active_user_jobs").set(count as f64);
        }
    }

    fn schedule_next(&self, user: UserId, interval: u32) {
        let next = self.clock.now() + chrono::Duration::minutes(i64::from(interval));
        self.state(user).update(|counters| {
            counters.next_run_at = Some(next);
            counters.interval_minutes = Some(interval);
        });
    }

    async fn tick(&self, user: UserId, kind: TickKind, cancel: &CancellationToken) -> TickControl {
        let state = self.state(user);
        let Ok(_guard) = state.guard.try_lock() else {
            counter!("engine_ticks_total", "result" => "skipped_overlap").increment(1);
            debug!(user_id = %user, ?kind, "tick dropped, previous one still running");
            return TickControl::Continue;
        };

        let _permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return TickControl::Stop,
            },
            _ = cancel.cancelled() => {
                counter!("engine_ticks_total", "result" => "stopped").increment(1);
                return TickControl::Stop;
            }
        };

        state.update(|counters| {
            counters.checking = true;
            counters.last_run_at = Some(self.clock.now());
        });
        let result = self.run_tick(user, kind, cancel, &state).await;
        state.update(|counters| counters.checking = false);

        match result {
            Ok(TickControl::Continue) => {
                counter!("engine_ticks_total", "result" => "completed").increment(1);
                TickControl::Continue
            }
            Ok(TickControl::Stop) => {
                counter!("engine_ticks_total", "result" => "stopped").increment(1);
                TickControl::Stop
            }
            Err(err) => {
                counter!("engine_ticks_total", "result" => "failed").increment(1);
                state.update(|counters| {
                    counters.total_errors += 1;
                    counters.last_error = Some(err.to_string());
                });
                if matches!(err, EngineError::VerifyMode(_)) {
                    error!(user_id = %user, error = %err, "misconfigured user, stopping job");
                    self.cancel_job(user);
                    TickControl::Stop
                } else {
                    error!(user_id = %user, error = %err, "tick failed");
                    TickControl::Continue
                }
            }
        }
    }

    async fn run_tick(
        &self,
        user: UserId,
        kind: TickKind,
        cancel: &CancellationToken,
        state: &JobState,
    ) -> Result<TickControl, EngineError> {
        let Some(record) = self.repos.find_user(user).await? else {
            info!(user_id = %user, "user no longer exists, stopping job");
            return Ok(TickControl::Stop);
        };
        if !record.active || (kind == TickKind::Scheduled && !record.auto_check_enabled) {
            info!(user_id = %user, active = record.active, "auto check no longer wanted, stopping job");
            return Ok(TickControl::Stop);
        }

        let mode = VerifyMode::parse(&record.verify_mode)?;

        let accounts = self.repos.list_pending_accounts(user).await?;
        let mut operator: BTreeMap<&'static str, (IndeterminateReason, Vec<String>)> = BTreeMap::new();
        let mut stopped = false;

        for account in accounts {
            if cancel.is_cancelled() {
                stopped = true;
                break;
            }
            state.update(|counters| counters.total_checks += 1);

            match self.verifier.verify(user, &account.handle, mode).await {
                Ok(Outcome::Found { profile, artifact }) => {
                    if self.finish(&account, state).await {
                        state.update(|counters| counters.total_found += 1);
                        self.notify_found(&account, &profile, artifact.as_deref()).await;
                    }
                }
                Ok(Outcome::NotFound) => {
                    if self.finish(&account, state).await {
                        self.notify_not_found(&account).await;
                    }
                }
                Ok(Outcome::Indeterminate { reason }) => {
                    if reason.needs_operator() {
                        operator
                            .entry(reason.as_str())
                            .or_insert_with(|| (reason.clone(), Vec::new()))
                            .1
                            .push(account.handle.clone());
                    }
                }
                Err(err) => {
                    error!(user_id = %user, account_id = %account.id, error = %err, "verification aborted");
                    state.update(|counters| {
                        counters.total_errors += 1;
                        counters.last_error = Some(err.to_string());
                    });
                }
            }
        }

        for (reason, handles) in operator.into_values() {
            self.notify_operator(user, &reason, &handles).await;
        }

        Ok(if stopped {
            TickControl::Stop
        } else {
            TickControl::Continue
        })
    }

    /// `true` only for the call that moved the account to done.
    async fn finish(&self, account: &AccountRecord, state: &JobState) -> bool {
        match self
            .repos
            .mark_account_done(account.id, self.clock.today())
            .await
        {
            Ok(changed) => {
                if !changed {
                    debug!(account_id = %account.id, "account already finished");
                }
                changed
            }
            Err(err) => {
                error!(account_id = %account.id, error = %err, "failed to finish account");
                state.update(|counters| {
                    counters.total_errors += 1;
                    counters.last_error = Some(err.to_string());
                });
                false
            }
        }
    }

    async fn notify_found(&self, account: &AccountRecord, profile: &ProfileSummary, artifact: Option<&Path>) {
        let url = profile_url(&self.settings.profile_base_url, &account.handle);
        let mut caption = format!(
            "✅ <b>@{}</b> is reachable again.\n<a href=\"{}\">Open profile</a>",
            escape_html(&account.handle),
            escape_html(&url)
        );
        if let Some(name) = profile.full_name.as_deref().filter(|name| !name.is_empty()) {
            caption.push_str(&format!("\nName: {}", escape_html(name)));
        }
        let sent = match artifact {
            Some(path) => self.notifier.send_photo(account.owner, path, &caption).await,
            None => self.notifier.send_text(account.owner, &caption, &[]).await,
        };
        if let Err(err) = sent {
            warn!(user_id = %account.owner, account_id = %account.id, error = %err, "found notification failed");
        }
    }

    async fn notify_not_found(&self, account: &AccountRecord) {
        let text = format!(
            "❌ <b>@{}</b> does not exist anymore. Monitoring for it has finished.",
            escape_html(&account.handle)
        );
        if let Err(err) = self.notifier.send_text(account.owner, &text, &[]).await {
            warn!(user_id = %account.owner, account_id = %account.id, error = %err, "not-found notification failed");
        }
    }

    async fn notify_operator(&self, user: UserId, reason: &IndeterminateReason, handles: &[String]) {
        let accounts = handles
            .iter()
            .map(|handle| format!("@{handle}"))
            .collect::<Vec<_>>()
            .join(", ");
        let text = match reason {
            IndeterminateReason::NoProxiesAvailable => format!(
                "⚠️ No working proxies are left, so these accounts could not be checked: {accounts}.\n\
                 Add new proxies or reactivate the existing ones."
            ),
            IndeterminateReason::AllKeysExhausted => format!(
                "⚠️ Every API key is used up for today, so these accounts could not be checked: {accounts}.\n\
                 Add or rotate API keys; limits reset tomorrow."
            ),
            other => format!("⚠️ These accounts could not be checked ({}): {accounts}.", other.as_str()),
        };
        let buttons = [InlineButton::new("Show inactive accounts", SHOW_INACTIVE_ACCOUNTS)];
        if let Err(err) = self.notifier.send_text(user, &text, &buttons).await {
            warn!(user_id = %user, reason = reason.as_str(), error = %err, "operator notification failed");
        }
    }
}

async fn run_job(
    inner: Arc<SchedulerInner>,
    user: UserId,
    generation: u64,
    mut interval_rx: watch::Receiver<u32>,
    cancel: CancellationToken,
) {
    let mut interval = *interval_rx.borrow_and_update();
    let mut last_completion = Instant::now();
    let mut next = last_completion + minutes(interval);
    inner.schedule_next(user, interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = interval_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                interval = *interval_rx.borrow_and_update();
                next = last_completion + minutes(interval);
                inner.schedule_next(user, interval);
                debug!(user_id = %user, interval, "job interval updated");
                continue;
            }
            _ = tokio::time::sleep_until(next) => {}
        }

        let control = inner.tick(user, TickKind::Scheduled, &cancel).await;
        last_completion = Instant::now();
        next = last_completion + minutes(interval);
        if control == TickControl::Stop || cancel.is_cancelled() {
            break;
        }
        inner.schedule_next(user, interval);
    }

    inner.remove_job(user, generation);
}
