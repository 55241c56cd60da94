//! # Health Metrics Aggregator
//!
//! Turns the per-metric fetchers into one timestamped `HealthSnapshot`.
//!
//! ## Lifecycle
//! 1. `request_authorization()` once per session; nothing is fetched before it
//!    succeeds and a granted authorization is never re-requested.
//! 2. `refresh()` runs every fetcher concurrently for one shared reference time
//!    and publishes the assembled snapshot.
//! 3. Optionally `start_periodic()` refreshes on a fixed interval until
//!    `stop_periodic()`.
//!
//! ## Publication
//! Snapshots go out through a `tokio::sync::watch` channel and are replaced
//! wholesale. A snapshot is published only after all fetchers settled and only
//! if it is newer than the one already published.

use crate::error::HealthError;
use crate::health_fetchers::{default_policies, fetch, FetchOutcome, FetchPolicy, DEFAULT_EXERCISE_PLACEHOLDER};
use crate::health_store::{HealthStore, MetricKind, WorkoutActivity, WorkoutRecord};
use chrono::{DateTime, Duration as ChronoDuration, Local};
use futures::future::join_all;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Length of the synthetic workout
pub const SYNTHETIC_WORKOUT_MINUTES: i64 = 15;
pub const SYNTHETIC_WORKOUT_KCAL: f64 = 100.0;
pub const SYNTHETIC_WORKOUT_METERS: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationState {
    NotRequested,
    Denied,
    Granted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub heart_rate: Option<f64>,
    pub steps: Option<f64>,
    pub active_energy: Option<f64>,
    pub exercise_minutes: Option<f64>,
    pub source_device_name: Option<String>,
    pub captured_at: DateTime<Local>,
}

impl HealthSnapshot {
    fn assemble(outcomes: &[FetchOutcome], captured_at: DateTime<Local>) -> Self {
        let value = |metric: MetricKind| {
            outcomes
                .iter()
                .find(|o| o.metric == metric)
                .and_then(|o| o.value)
        };
        // The heart-rate source names the wearable; other sources are a fallback
        let source_device_name = outcomes
            .iter()
            .find(|o| o.metric == MetricKind::HeartRate)
            .and_then(|o| o.source_name.clone())
            .or_else(|| outcomes.iter().find_map(|o| o.source_name.clone()));

        Self {
            heart_rate: value(MetricKind::HeartRate),
            steps: value(MetricKind::Steps),
            active_energy: value(MetricKind::ActiveEnergy),
            exercise_minutes: value(MetricKind::ExerciseTime),
            source_device_name,
            captured_at,
        }
    }
}

/// Source of the reference time for a refresh
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub refresh_interval: Duration,
    pub query_timeout: Duration,
    pub exercise_placeholder: Option<f64>,
    /// Delay before refreshing after a synthetic workout; `None` disables it
    pub post_workout_refresh: Option<Duration>,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
            query_timeout: Duration::from_secs(10),
            exercise_placeholder: Some(DEFAULT_EXERCISE_PLACEHOLDER),
            post_workout_refresh: Some(Duration::from_secs(2)),
        }
    }
}

struct PeriodicTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn HealthStore>,
    clock: Arc<dyn Clock>,
    settings: HealthSettings,
    policies: Vec<FetchPolicy>,
    authorization: tokio::sync::Mutex<AuthorizationState>,
    last_reference: Mutex<Option<DateTime<Local>>>,
    snapshot: watch::Sender<Option<HealthSnapshot>>,
    periodic: Mutex<Option<PeriodicTask>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.periodic.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            task.token.cancel();
        }
    }
}

/// Aggregates health metrics into snapshots
///
/// Cheap to clone; clones share authorization, snapshots and the periodic task.
#[derive(Clone)]
pub struct HealthAggregator {
    inner: Arc<Inner>,
}

impl HealthAggregator {
    pub fn new(store: Arc<dyn HealthStore>, settings: HealthSettings) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), settings)
    }

    pub fn with_clock(store: Arc<dyn HealthStore>, clock: Arc<dyn Clock>, settings: HealthSettings) -> Self {
        let (snapshot, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                store,
                clock,
                policies: default_policies(settings.exercise_placeholder),
                settings,
                authorization: tokio::sync::Mutex::new(AuthorizationState::NotRequested),
                last_reference: Mutex::new(None),
                snapshot,
                periodic: Mutex::new(None),
            }),
        }
    }

    pub async fn authorization(&self) -> AuthorizationState {
        *self.inner.authorization.lock().await
    }

    /// Ask the host service for access; returns immediately once granted
    pub async fn request_authorization(&self) -> bool {
        let mut state = self.inner.authorization.lock().await;
        if *state == AuthorizationState::Granted {
            return true;
        }

        let granted = if !self.inner.store.is_available().await {
            log::warn!("Health data service is not available");
            false
        } else {
            match self.inner.store.request_authorization().await {
                Ok(granted) => granted,
                Err(e) => {
                    log::error!("Health authorization failed: {}", e);
                    false
                }
            }
        };

        *state = if granted {
            AuthorizationState::Granted
        } else {
            AuthorizationState::Denied
        };
        log::info!("Health authorization: {:?}", *state);
        granted
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Option<HealthSnapshot> {
        self.inner.snapshot.borrow().clone()
    }

    /// Receiver notified whenever a new snapshot is published
    pub fn subscribe(&self) -> watch::Receiver<Option<HealthSnapshot>> {
        self.inner.snapshot.subscribe()
    }

    /// Fetch every metric and publish one snapshot
    pub async fn refresh(&self) -> Result<HealthSnapshot, HealthError> {
        self.inner.refresh().await
    }

    /// Refresh now and then on every interval tick until stopped
    ///
    /// Restarting replaces the running task. Ticks that find the aggregator
    /// unauthorized are skipped.
    pub fn start_periodic(&self) {
        self.stop_periodic();

        let token = CancellationToken::new();
        // Weak so a forgotten task does not keep the aggregator alive
        let inner = Arc::downgrade(&self.inner);
        let interval = self.inner.settings.refresh_interval;
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(aggregator) = inner.upgrade() else { break };
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    result = aggregator.refresh() => match result {
                        Ok(snapshot) => log::debug!("Periodic health refresh at {}", snapshot.captured_at),
                        Err(HealthError::AuthorizationDenied) => {
                            log::debug!("Periodic health refresh skipped: not authorized")
                        }
                        Err(e) => log::warn!("Periodic health refresh failed: {}", e),
                    },
                }
            }
            log::debug!("Periodic health refresh stopped");
        });

        log::info!("Periodic health refresh every {:?}", interval);
        *self.lock_periodic() = Some(PeriodicTask { token, handle });
    }

    pub fn stop_periodic(&self) {
        if let Some(task) = self.lock_periodic().take() {
            task.token.cancel();
        }
    }

    pub fn is_periodic_running(&self) -> bool {
        self.lock_periodic()
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    fn lock_periodic(&self) -> std::sync::MutexGuard<'_, Option<PeriodicTask>> {
        self.inner.periodic.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write a short walking workout ending now
    ///
    /// Requests authorization first when needed. The follow-up refresh, if
    /// configured, runs in the background after a settle delay.
    pub async fn record_synthetic_activity(&self) -> Result<WorkoutRecord, HealthError> {
        if !self.request_authorization().await {
            return Err(HealthError::AuthorizationDenied);
        }

        let end = self.inner.clock.now();
        let workout = WorkoutRecord {
            activity: WorkoutActivity::Walking,
            start: end - ChronoDuration::minutes(SYNTHETIC_WORKOUT_MINUTES),
            end,
            energy_kcal: SYNTHETIC_WORKOUT_KCAL,
            distance_m: SYNTHETIC_WORKOUT_METERS,
        };
        self.inner.store.save_workout(&workout).await.map_err(|e| {
            log::error!("Failed to record synthetic workout: {}", e);
            e
        })?;
        log::info!("Recorded synthetic {:?} workout ending {}", workout.activity, workout.end);

        if let Some(delay) = self.inner.settings.post_workout_refresh {
            let aggregator = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = aggregator.refresh().await {
                    log::warn!("Refresh after synthetic workout failed: {}", e);
                }
            });
        }
        Ok(workout)
    }
}

impl Inner {
    async fn refresh(&self) -> Result<HealthSnapshot, HealthError> {
        if *self.authorization.lock().await != AuthorizationState::Granted {
            return Err(HealthError::AuthorizationDenied);
        }

        let reference = self.next_reference();
        let store = self.store.as_ref();
        let timeout = self.settings.query_timeout;
        let outcomes = join_all(
            self.policies
                .iter()
                .map(|policy| fetch(store, policy, reference, timeout)),
        )
        .await;

        let snapshot = HealthSnapshot::assemble(&outcomes, reference);
        self.snapshot.send_if_modified(|current| {
            let newer = current
                .as_ref()
                .map_or(true, |published| published.captured_at < snapshot.captured_at);
            if newer {
                *current = Some(snapshot.clone());
            }
            newer
        });
        log::info!(
            "Health snapshot: hr={:?} steps={:?} energy={:?} exercise={:?}",
            snapshot.heart_rate,
            snapshot.steps,
            snapshot.active_energy,
            snapshot.exercise_minutes
        );
        Ok(snapshot)
    }

    // Reference times strictly increase even if the clock stalls or steps back
    fn next_reference(&self) -> DateTime<Local> {
        let mut last = self.last_reference.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();
        let reference = match *last {
            Some(previous) if now <= previous => previous + ChronoDuration::microseconds(1),
            _ => now,
        };
        *last = Some(reference);
        reference
    }
}
