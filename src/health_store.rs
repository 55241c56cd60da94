//! # Health Data Store
//!
//! Interface to the host platform's health-data service and an in-memory
//! implementation of it.
//!
//! ## Query Model
//! A query is keyed by metric and time range. The service answers either with a
//! single statistics aggregate or with the matching samples ordered by end
//! time, each optionally tagged with the name of the device that recorded it.
//! Activity summaries (one per day) are queried separately.
//!
//! ## In-memory store
//! `InMemoryHealthStore` backs desktop runs and tests. Step counts are answered
//! as aggregates, every other metric as samples. Saving a workout also records
//! its energy and exercise minutes so later queries can read them back.

use crate::error::HealthError;
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Source name attached to records written by this application
pub const APP_SOURCE_NAME: &str = "fitsense";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    HeartRate,
    Steps,
    ActiveEnergy,
    ExerciseTime,
}

impl MetricKind {
    /// Whether values accumulate over a day rather than describe a moment
    pub fn is_cumulative(&self) -> bool {
        !matches!(self, MetricKind::HeartRate)
    }

    pub fn unit(&self) -> &'static str {
        match self {
            MetricKind::HeartRate => "bpm",
            MetricKind::Steps => "steps",
            MetricKind::ActiveEnergy => "kcal",
            MetricKind::ExerciseTime => "min",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::HeartRate => "heart rate",
            MetricKind::Steps => "steps",
            MetricKind::ActiveEnergy => "active energy",
            MetricKind::ExerciseTime => "exercise time",
        };
        write!(f, "{}", name)
    }
}

/// Closed time interval `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
}

impl TimeRange {
    pub fn new(start: DateTime<Local>, end: DateTime<Local>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, instant: DateTime<Local>) -> bool {
        self.start <= instant && instant <= self.end
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthSample {
    pub value: f64,
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
    pub source_name: Option<String>,
}

impl HealthSample {
    /// A point-in-time sample
    pub fn at(value: f64, instant: DateTime<Local>, source_name: Option<&str>) -> Self {
        Self {
            value,
            start: instant,
            end: instant,
            source_name: source_name.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Aggregate(f64),
    /// Ordered by end time, oldest first
    Samples(Vec<HealthSample>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivitySummary {
    pub date: NaiveDate,
    pub exercise_minutes: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkoutActivity {
    Walking,
    Running,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkoutRecord {
    pub activity: WorkoutActivity,
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
    pub energy_kcal: f64,
    pub distance_m: f64,
}

impl WorkoutRecord {
    pub fn duration_minutes(&self) -> f64 {
        (self.end - self.start).num_seconds() as f64 / 60.0
    }
}

/// Host health-data service
#[async_trait]
pub trait HealthStore: Send + Sync {
    async fn is_available(&self) -> bool;

    /// Prompt for read/write access; `Ok(false)` when the user declines
    async fn request_authorization(&self) -> Result<bool, HealthError>;

    async fn query(&self, kind: MetricKind, range: TimeRange) -> Result<QueryOutcome, HealthError>;

    async fn query_activity_summary(&self, range: TimeRange) -> Result<Vec<ActivitySummary>, HealthError>;

    async fn save_workout(&self, workout: &WorkoutRecord) -> Result<(), HealthError>;
}

#[derive(Debug)]
struct StoreState {
    available: bool,
    grant_on_request: bool,
    authorized: bool,
    authorization_requests: usize,
    samples: HashMap<MetricKind, Vec<HealthSample>>,
    summaries: Vec<ActivitySummary>,
    workouts: Vec<WorkoutRecord>,
    failing: HashSet<MetricKind>,
    failing_summaries: bool,
    queries: usize,
}

/// Health store kept entirely in memory
#[derive(Debug)]
pub struct InMemoryHealthStore {
    state: Mutex<StoreState>,
}

impl Default for InMemoryHealthStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryHealthStore {
    /// An available store that grants authorization when asked
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState {
                available: true,
                grant_on_request: true,
                authorized: false,
                authorization_requests: 0,
                samples: HashMap::new(),
                summaries: Vec::new(),
                workouts: Vec::new(),
                failing: HashSet::new(),
                failing_summaries: false,
                queries: 0,
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn set_available(&self, available: bool) {
        self.with_state(|s| s.available = available);
    }

    /// Decide how the next authorization prompt is answered
    pub fn set_grant_on_request(&self, grant: bool) {
        self.with_state(|s| s.grant_on_request = grant);
    }

    pub fn insert_sample(&self, kind: MetricKind, sample: HealthSample) {
        self.with_state(|s| {
            let samples = s.samples.entry(kind).or_default();
            samples.push(sample);
            samples.sort_by_key(|sample| sample.end);
        });
    }

    pub fn insert_summary(&self, summary: ActivitySummary) {
        self.with_state(|s| s.summaries.push(summary));
    }

    /// Make every query for `kind` fail
    pub fn fail_queries(&self, kind: MetricKind) {
        self.with_state(|s| {
            s.failing.insert(kind);
        });
    }

    pub fn fail_summaries(&self) {
        self.with_state(|s| s.failing_summaries = true);
    }

    pub fn workouts(&self) -> Vec<WorkoutRecord> {
        self.with_state(|s| s.workouts.clone())
    }

    pub fn authorization_requests(&self) -> usize {
        self.with_state(|s| s.authorization_requests)
    }

    /// Number of metric and summary queries answered or rejected so far
    pub fn query_count(&self) -> usize {
        self.with_state(|s| s.queries)
    }

    fn check_readable(state: &mut StoreState) -> Result<(), HealthError> {
        state.queries += 1;
        if !state.available {
            return Err(HealthError::Unavailable);
        }
        if !state.authorized {
            return Err(HealthError::AuthorizationDenied);
        }
        Ok(())
    }
}

#[async_trait]
impl HealthStore for InMemoryHealthStore {
    async fn is_available(&self) -> bool {
        self.with_state(|s| s.available)
    }

    async fn request_authorization(&self) -> Result<bool, HealthError> {
        self.with_state(|s| {
            if !s.available {
                return Err(HealthError::Unavailable);
            }
            s.authorization_requests += 1;
            s.authorized = s.grant_on_request;
            Ok(s.authorized)
        })
    }

    async fn query(&self, kind: MetricKind, range: TimeRange) -> Result<QueryOutcome, HealthError> {
        self.with_state(|s| {
            Self::check_readable(s)?;
            if s.failing.contains(&kind) {
                return Err(HealthError::Query(format!("{} query rejected", kind)));
            }

            let matching: Vec<HealthSample> = s
                .samples
                .get(&kind)
                .map(|samples| {
                    samples
                        .iter()
                        .filter(|sample| range.contains(sample.end))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();

            if kind == MetricKind::Steps && !matching.is_empty() {
                return Ok(QueryOutcome::Aggregate(matching.iter().map(|s| s.value).sum()));
            }
            Ok(QueryOutcome::Samples(matching))
        })
    }

    async fn query_activity_summary(&self, range: TimeRange) -> Result<Vec<ActivitySummary>, HealthError> {
        self.with_state(|s| {
            Self::check_readable(s)?;
            if s.failing_summaries {
                return Err(HealthError::Query("activity summary rejected".to_string()));
            }
            let (first, last) = (range.start.date_naive(), range.end.date_naive());
            Ok(s
                .summaries
                .iter()
                .filter(|summary| first <= summary.date && summary.date <= last)
                .cloned()
                .collect())
        })
    }

    async fn save_workout(&self, workout: &WorkoutRecord) -> Result<(), HealthError> {
        self.with_state(|s| {
            if !s.available {
                return Err(HealthError::Unavailable);
            }
            if !s.authorized {
                return Err(HealthError::AuthorizationDenied);
            }
            if workout.end < workout.start {
                return Err(HealthError::Write("workout ends before it starts".to_string()));
            }

            let record = |value: f64| HealthSample {
                value,
                start: workout.start,
                end: workout.end,
                source_name: Some(APP_SOURCE_NAME.to_string()),
            };
            for (kind, sample) in [
                (MetricKind::ActiveEnergy, record(workout.energy_kcal)),
                (MetricKind::ExerciseTime, record(workout.duration_minutes())),
            ] {
                let samples = s.samples.entry(kind).or_default();
                samples.push(sample);
                samples.sort_by_key(|sample| sample.end);
            }
            s.workouts.push(workout.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 14, 12, 0, 0).unwrap()
    }

    async fn authorized_store() -> InMemoryHealthStore {
        let store = InMemoryHealthStore::new();
        assert_eq!(store.request_authorization().await, Ok(true));
        store
    }

    #[tokio::test]
    async fn test_query_requires_authorization() {
        let store = InMemoryHealthStore::new();
        let range = TimeRange::new(noon() - Duration::hours(1), noon());
        assert_eq!(
            store.query(MetricKind::HeartRate, range).await,
            Err(HealthError::AuthorizationDenied)
        );

        store.set_available(false);
        assert_eq!(store.request_authorization().await, Err(HealthError::Unavailable));
    }

    #[tokio::test]
    async fn test_query_filters_by_end_time() {
        let store = authorized_store().await;
        store.insert_sample(MetricKind::HeartRate, HealthSample::at(80.0, noon() - Duration::minutes(10), None));
        store.insert_sample(MetricKind::HeartRate, HealthSample::at(60.0, noon() - Duration::hours(3), None));

        let range = TimeRange::new(noon() - Duration::hours(1), noon());
        match store.query(MetricKind::HeartRate, range).await.unwrap() {
            QueryOutcome::Samples(samples) => {
                assert_eq!(samples.len(), 1);
                assert_eq!(samples[0].value, 80.0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_steps_are_aggregated() {
        let store = authorized_store().await;
        store.insert_sample(MetricKind::Steps, HealthSample::at(1500.0, noon() - Duration::hours(2), None));
        store.insert_sample(MetricKind::Steps, HealthSample::at(500.0, noon() - Duration::hours(1), None));

        let range = TimeRange::new(noon() - Duration::hours(12), noon());
        assert_eq!(
            store.query(MetricKind::Steps, range).await,
            Ok(QueryOutcome::Aggregate(2000.0))
        );
    }

    #[tokio::test]
    async fn test_saved_workout_is_readable() {
        let store = authorized_store().await;
        let workout = WorkoutRecord {
            activity: WorkoutActivity::Walking,
            start: noon() - Duration::minutes(15),
            end: noon(),
            energy_kcal: 100.0,
            distance_m: 1000.0,
        };
        store.save_workout(&workout).await.unwrap();
        assert_eq!(store.workouts(), vec![workout]);

        let range = TimeRange::new(noon() - Duration::hours(1), noon());
        match store.query(MetricKind::ExerciseTime, range).await.unwrap() {
            QueryOutcome::Samples(samples) => {
                assert_eq!(samples[0].value, 15.0);
                assert_eq!(samples[0].source_name.as_deref(), Some(APP_SOURCE_NAME));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_save_workout_denied_without_authorization() {
        let store = InMemoryHealthStore::new();
        store.set_grant_on_request(false);
        assert_eq!(store.request_authorization().await, Ok(false));
        let workout = WorkoutRecord {
            activity: WorkoutActivity::Running,
            start: noon() - Duration::minutes(5),
            end: noon(),
            energy_kcal: 50.0,
            distance_m: 900.0,
        };
        assert_eq!(store.save_workout(&workout).await, Err(HealthError::AuthorizationDenied));
        assert!(store.workouts().is_empty());
    }

    #[test]
    fn test_metric_kind_properties() {
        assert!(!MetricKind::HeartRate.is_cumulative());
        assert!(MetricKind::ActiveEnergy.is_cumulative());
        assert_eq!(MetricKind::ExerciseTime.unit(), "min");
    }
}
