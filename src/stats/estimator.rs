// src/stats/estimator.rs

//! Runtime estimation from execution history.
//!
//! Estimates are EWMA over the last `lookback_runs` successful durations of
//! a task signature, most recent first, with outlier dampening: a sample
//! more than 3x the current estimate is capped at 2x before blending. A
//! signature with fewer than `min_samples` observations has no estimate.

use std::collections::HashMap;
use std::f64::consts::TAU;
use std::sync::Mutex;

use chrono::{DateTime, Timelike, Utc};
use tracing::debug;

use crate::errors::RushtiError;
use crate::model::Task;
use crate::stats::store::StatsStore;

#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    pub lookback_runs: usize,
    pub min_samples: usize,
    pub alpha: f64,
    pub cache_hours: u32,
    pub time_of_day_weighting: bool,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            lookback_runs: 10,
            min_samples: 3,
            alpha: 0.3,
            cache_hours: 24,
            time_of_day_weighting: false,
        }
    }
}

pub struct Estimator<'a> {
    store: &'a StatsStore,
    config: EstimatorConfig,
    cache: Mutex<HashMap<String, (f64, DateTime<Utc>)>>,
}

impl<'a> Estimator<'a> {
    pub fn new(store: &'a StatsStore, config: EstimatorConfig) -> Self {
        Self {
            store,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Scheduling weight for a task in seconds; `None` when history is
    /// insufficient.
    pub fn cost(&self, task: &Task) -> Result<Option<f64>, RushtiError> {
        self.cost_of_signature(&task.signature())
    }

    pub fn cost_of_signature(&self, signature: &str) -> Result<Option<f64>, RushtiError> {
        // Time-of-day weighting varies with the clock, so it is never cached.
        if !self.config.time_of_day_weighting {
            let cache = self.cache.lock().unwrap();
            if let Some((value, computed_at)) = cache.get(signature) {
                let age_hours = (Utc::now() - *computed_at).num_seconds() as f64 / 3600.0;
                if age_hours < self.config.cache_hours as f64 {
                    return Ok(Some(*value));
                }
            }
        }

        let estimate = if self.config.time_of_day_weighting {
            let samples = self
                .store
                .recent_with_times(signature, self.config.lookback_runs)?;
            if samples.len() < self.config.min_samples {
                return Ok(None);
            }
            Some(time_of_day_weighted(&samples, Utc::now()))
        } else {
            let durations = self.store.recent(signature, self.config.lookback_runs)?;
            if durations.len() < self.config.min_samples {
                return Ok(None);
            }
            Some(ewma(&durations, self.config.alpha))
        };

        if let Some(value) = estimate {
            debug!(signature = %signature, estimate = value, "computed runtime estimate");
            if !self.config.time_of_day_weighting {
                self.cache
                    .lock()
                    .unwrap()
                    .insert(signature.to_string(), (value, Utc::now()));
            }
        }
        Ok(estimate)
    }

    /// Costs for a whole DAG, keyed by task id. Estimation failures on the
    /// store are surfaced; absent history maps to `None`.
    pub fn costs_for(
        &self,
        tasks: &[Task],
    ) -> Result<HashMap<String, Option<f64>>, RushtiError> {
        let mut out = HashMap::with_capacity(tasks.len());
        for task in tasks {
            out.insert(task.id.clone(), self.cost(task)?);
        }
        Ok(out)
    }
}

/// EWMA over samples ordered most recent first, seeded with the most recent
/// value, with outlier dampening.
pub fn ewma(durations: &[f64], alpha: f64) -> f64 {
    let Some((&first, rest)) = durations.split_first() else {
        return 0.0;
    };
    let mut estimate = first;
    for &sample in rest {
        let damped = if estimate > 0.0 && sample > estimate * 3.0 {
            sample.min(estimate * 2.0)
        } else {
            sample
        };
        estimate = alpha * damped + (1.0 - alpha) * estimate;
    }
    estimate
}

/// Mean weighted by circular closeness of each sample's start hour to the
/// current hour: weight = (1 + cos(2π·Δh/24)) / 2.
fn time_of_day_weighted(samples: &[(f64, DateTime<Utc>)], now: DateTime<Utc>) -> f64 {
    let now_hour = now.hour() as f64 + now.minute() as f64 / 60.0;
    let mut weighted_sum = 0.0;
    let mut weight_sum = 0.0;

    for (duration, start) in samples {
        let sample_hour = start.hour() as f64 + start.minute() as f64 / 60.0;
        let delta = (sample_hour - now_hour).abs();
        let weight = (1.0 + (TAU * delta / 24.0).cos()) / 2.0;
        weighted_sum += duration * weight;
        weight_sum += weight;
    }

    if weight_sum > 0.0 {
        weighted_sum / weight_sum
    } else {
        samples.iter().map(|(d, _)| d).sum::<f64>() / samples.len() as f64
    }
}

/// Runtime estimate detail for one task signature, as reported by the
/// workflow analysis.
#[derive(Debug, Clone)]
pub struct SignatureEstimate {
    pub signature: String,
    pub ewma_seconds: f64,
    pub sample_count: usize,
    /// Confidence score in [0, 1]; zero for default-filled estimates.
    pub confidence: f64,
    /// True when the value is the fastest-quartile default, not history.
    pub estimated: bool,
}

/// Confidence score for an estimate: quantity (samples / 10, up to 0.5)
/// plus consistency (1 minus the coefficient of variation, up to 0.5).
/// A single sample gets middle consistency.
pub fn confidence(durations: &[f64]) -> f64 {
    if durations.is_empty() {
        return 0.0;
    }

    let quantity = (durations.len() as f64 / 10.0).min(1.0) * 0.5;

    let consistency = if durations.len() >= 2 {
        let mean = durations.iter().sum::<f64>() / durations.len() as f64;
        let variance = durations
            .iter()
            .map(|d| (d - mean).powi(2))
            .sum::<f64>()
            / (durations.len() - 1) as f64;
        let cv = if mean > 0.0 {
            variance.sqrt() / mean
        } else {
            1.0
        };
        (1.0 - cv.min(1.0)) * 0.5
    } else {
        0.25
    };

    quantity + consistency
}

/// Default estimate for signatures without history: mean of the fastest
/// quartile of known estimates. Used for reporting only, never for queue
/// ordering.
pub fn default_estimate(known: &[f64]) -> f64 {
    if known.is_empty() {
        return 10.0;
    }
    let mut sorted: Vec<f64> = known.iter().copied().filter(|d| *d > 0.0).collect();
    if sorted.is_empty() {
        return 10.0;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let quartile = (sorted.len() / 4).max(1);
    sorted[..quartile].iter().sum::<f64>() / quartile as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::store::TaskRecord;
    use chrono::Duration;

    fn seed(store: &StatsStore, sig: &str, durations: &[f64]) {
        let base = Utc::now() - Duration::hours(1);
        for (i, d) in durations.iter().enumerate() {
            store
                .append_task(&TaskRecord {
                    run_id: format!("r{i}"),
                    workflow: "wf".into(),
                    task_id: "t".into(),
                    signature: sig.into(),
                    instance: "prod".into(),
                    process: "p".into(),
                    parameters_json: "{}".into(),
                    status: "succeeded".into(),
                    start: base + Duration::minutes(i as i64),
                    finish: base + Duration::minutes(i as i64),
                    duration_seconds: *d,
                    attempts: 1,
                    error_kind: None,
                    error_message: None,
                    stage: None,
                    predecessors_json: None,
                })
                .unwrap();
        }
    }

    #[test]
    fn ewma_blends_toward_older_samples() {
        // Most recent first: starts at 10, blends in 20 with alpha 0.3.
        let value = ewma(&[10.0, 20.0], 0.3);
        assert!((value - 13.0).abs() < 1e-9);
    }

    #[test]
    fn ewma_dampens_outliers() {
        // 100 is >3x the running estimate of 10, so it is capped at 20.
        let value = ewma(&[10.0, 100.0], 0.3);
        assert!((value - 13.0).abs() < 1e-9);
    }

    #[test]
    fn below_min_samples_has_no_estimate() {
        let store = StatsStore::in_memory().unwrap();
        seed(&store, "sig", &[5.0, 6.0]);
        let estimator = Estimator::new(&store, EstimatorConfig::default());
        assert!(estimator.cost_of_signature("sig").unwrap().is_none());
    }

    #[test]
    fn estimates_with_enough_samples_and_caches() {
        let store = StatsStore::in_memory().unwrap();
        seed(&store, "sig", &[5.0, 6.0, 7.0]);
        let estimator = Estimator::new(&store, EstimatorConfig::default());

        let first = estimator.cost_of_signature("sig").unwrap().unwrap();
        assert!(first > 0.0);

        // Cached: more history appended does not change the value within
        // the cache window.
        seed(&store, "sig", &[500.0, 500.0, 500.0]);
        let second = estimator.cost_of_signature("sig").unwrap().unwrap();
        assert!((first - second).abs() < 1e-9);
    }

    #[test]
    fn time_of_day_weighting_prefers_same_hour_samples() {
        let now = Utc::now();
        let same_hour = (100.0, now);
        let opposite = (10.0, now + Duration::hours(12));
        let estimate = time_of_day_weighted(&[same_hour, opposite], now);
        // Opposite-hour sample has near-zero weight.
        assert!(estimate > 90.0);
    }

    #[test]
    fn default_estimate_uses_fastest_quartile() {
        let value = default_estimate(&[1.0, 2.0, 3.0, 4.0, 100.0, 200.0, 300.0, 400.0]);
        assert!((value - 1.5).abs() < 1e-9);
    }

    #[test]
    fn confidence_rewards_quantity_and_consistency() {
        // Ten identical samples: full quantity, full consistency.
        let steady = vec![20.0; 10];
        assert!((confidence(&steady) - 1.0).abs() < 1e-9);

        // Same count, wild variance: quantity intact, consistency collapses.
        let noisy = [1.0, 50.0, 2.0, 80.0, 3.0, 90.0, 1.0, 70.0, 2.0, 60.0];
        let noisy_score = confidence(&noisy);
        assert!(noisy_score >= 0.5);
        assert!(noisy_score < confidence(&steady));
    }

    #[test]
    fn confidence_of_sparse_history() {
        assert_eq!(confidence(&[]), 0.0);
        // One sample: 0.05 quantity + 0.25 middle consistency.
        assert!((confidence(&[12.0]) - 0.3).abs() < 1e-9);
    }
}
