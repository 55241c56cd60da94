//! # Health Metric Fetchers
//!
//! Each metric is fetched by walking an ordered list of tiers. A tier names a
//! lookback window, a data source and how multiple results are reduced. The
//! first tier that yields a value wins; a tier that fails or times out counts
//! as empty. When every tier is empty the policy placeholder applies, if the
//! metric has one. A metric with no value stays `None` and is never coerced to
//! zero.
//!
//! ## Default policies
//! | Metric | Tiers | Placeholder |
//! |---|---|---|
//! | heart rate | last hour (latest), last 7 days (latest) | none |
//! | steps | since local midnight (sum) | none |
//! | active energy | since local midnight (sum) | none |
//! | exercise time | samples since midnight (sum), activity summary since midnight | configurable, 30 min |

use crate::error::HealthError;
use crate::health_store::{HealthSample, HealthStore, MetricKind, QueryOutcome, TimeRange};
use chrono::{DateTime, Duration as ChronoDuration, Local, Timelike};
use std::time::Duration;

/// Days covered by the widened heart-rate lookback
pub const WIDE_LOOKBACK_DAYS: u32 = 7;

/// Default exercise minutes when no activity data exists at all
pub const DEFAULT_EXERCISE_PLACEHOLDER: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookbackWindow {
    LastHour,
    SinceLocalMidnight,
    LastDays(u32),
}

impl LookbackWindow {
    /// Resolve the window against a reference time
    pub fn range(&self, reference: DateTime<Local>) -> TimeRange {
        let start = match self {
            LookbackWindow::LastHour => reference - ChronoDuration::hours(1),
            LookbackWindow::SinceLocalMidnight => local_midnight(reference),
            LookbackWindow::LastDays(days) => reference - ChronoDuration::days(i64::from(*days)),
        };
        TimeRange::new(start, reference)
    }
}

fn local_midnight(reference: DateTime<Local>) -> DateTime<Local> {
    reference
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(Local).earliest())
        // Midnight skipped by a DST change
        .unwrap_or_else(|| {
            reference - ChronoDuration::seconds(i64::from(reference.num_seconds_from_midnight()))
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// Add every sample in range
    Sum,
    /// Take the sample with the latest end time
    Latest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierSource {
    Samples(MetricKind),
    /// Exercise minutes from the daily activity summary
    ActivitySummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTier {
    pub source: TierSource,
    pub window: LookbackWindow,
    pub aggregation: Aggregation,
}

impl FetchTier {
    pub fn samples(kind: MetricKind, window: LookbackWindow, aggregation: Aggregation) -> Self {
        Self {
            source: TierSource::Samples(kind),
            window,
            aggregation,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchPolicy {
    pub metric: MetricKind,
    pub tiers: Vec<FetchTier>,
    pub placeholder: Option<f64>,
}

impl FetchPolicy {
    /// Sample-only policy for a metric
    ///
    /// Cumulative metrics are summed since local midnight. Point-in-time
    /// metrics take the latest sample of the last hour, widening to the last
    /// [`WIDE_LOOKBACK_DAYS`] days when the hour is empty.
    pub fn for_metric(kind: MetricKind) -> Self {
        let tiers = if kind.is_cumulative() {
            vec![FetchTier::samples(kind, LookbackWindow::SinceLocalMidnight, Aggregation::Sum)]
        } else {
            vec![
                FetchTier::samples(kind, LookbackWindow::LastHour, Aggregation::Latest),
                FetchTier::samples(kind, LookbackWindow::LastDays(WIDE_LOOKBACK_DAYS), Aggregation::Latest),
            ]
        };
        Self {
            metric: kind,
            tiers,
            placeholder: None,
        }
    }

    /// Exercise minutes: samples, then the activity summary, then `placeholder`
    pub fn exercise_time(placeholder: Option<f64>) -> Self {
        let mut policy = Self::for_metric(MetricKind::ExerciseTime);
        policy.tiers.push(FetchTier {
            source: TierSource::ActivitySummary,
            window: LookbackWindow::SinceLocalMidnight,
            aggregation: Aggregation::Latest,
        });
        policy.placeholder = placeholder;
        policy
    }
}

/// Policies for every snapshot metric, heart rate first
pub fn default_policies(exercise_placeholder: Option<f64>) -> Vec<FetchPolicy> {
    vec![
        FetchPolicy::for_metric(MetricKind::HeartRate),
        FetchPolicy::for_metric(MetricKind::Steps),
        FetchPolicy::for_metric(MetricKind::ActiveEnergy),
        FetchPolicy::exercise_time(exercise_placeholder),
    ]
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub metric: MetricKind,
    pub value: Option<f64>,
    /// Display name of the device behind the value, when the store reported one
    pub source_name: Option<String>,
    /// Index of the tier that produced the value
    pub tier: Option<usize>,
    pub used_placeholder: bool,
}

/// Run one policy against the store
pub async fn fetch(
    store: &dyn HealthStore,
    policy: &FetchPolicy,
    reference: DateTime<Local>,
    query_timeout: Duration,
) -> FetchOutcome {
    for (index, tier) in policy.tiers.iter().enumerate() {
        let range = tier.window.range(reference);
        let attempt = tokio::time::timeout(query_timeout, run_tier(store, tier, range)).await;
        match attempt.unwrap_or(Err(HealthError::Timeout)) {
            Ok(Some((value, source_name))) => {
                log::debug!("{}: {} from tier {} ({:?})", policy.metric, value, index, tier.window);
                return FetchOutcome {
                    metric: policy.metric,
                    value: Some(value),
                    source_name,
                    tier: Some(index),
                    used_placeholder: false,
                };
            }
            Ok(None) => log::debug!("{}: no data in tier {} ({:?})", policy.metric, index, tier.window),
            Err(e) => log::warn!("{}: tier {} failed: {}", policy.metric, index, e),
        }
    }

    if let Some(placeholder) = policy.placeholder {
        log::warn!("{}: no data, using placeholder {}", policy.metric, placeholder);
    }
    FetchOutcome {
        metric: policy.metric,
        value: policy.placeholder,
        source_name: None,
        tier: None,
        used_placeholder: policy.placeholder.is_some(),
    }
}

async fn run_tier(
    store: &dyn HealthStore,
    tier: &FetchTier,
    range: TimeRange,
) -> Result<Option<(f64, Option<String>)>, HealthError> {
    match tier.source {
        TierSource::Samples(kind) => Ok(match store.query(kind, range).await? {
            QueryOutcome::Aggregate(value) => Some((value, None)),
            QueryOutcome::Samples(samples) => reduce(&samples, tier.aggregation),
        }),
        TierSource::ActivitySummary => {
            let summaries = store.query_activity_summary(range).await?;
            let minutes: Vec<f64> = summaries.iter().filter_map(|s| s.exercise_minutes).collect();
            let value = match tier.aggregation {
                Aggregation::Sum => (!minutes.is_empty()).then(|| minutes.iter().sum()),
                Aggregation::Latest => minutes.last().copied(),
            };
            Ok(value.map(|value| (value, None)))
        }
    }
}

fn reduce(samples: &[HealthSample], aggregation: Aggregation) -> Option<(f64, Option<String>)> {
    let latest = samples.iter().max_by_key(|s| s.end)?;
    let value = match aggregation {
        Aggregation::Sum => samples.iter().map(|s| s.value).sum(),
        Aggregation::Latest => latest.value,
    };
    Some((value, latest.source_name.clone()))
}
