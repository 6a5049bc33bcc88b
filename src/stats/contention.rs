// src/stats/contention.rs

//! Contention-aware workflow analysis.
//!
//! An offline pass over execution history that detects which task parameter
//! drives duration variance, isolates heavy parameter groups via IQR
//! statistics, and rewrites the workflow so heavy groups run as sequential
//! chains instead of competing for the same remote resources. Also derives
//! a recommended worker count, including the "sweet spot" observed across
//! past runs at different worker settings.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{info, warn};

use crate::errors::RushtiError;
use crate::stats::estimator::{confidence, default_estimate, ewma, SignatureEstimate};
use crate::stats::store::{AnalyzerTaskRow, StatsStore};
use crate::taskfile::Taskfile;

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// IQR multiplier `k`; larger is more conservative.
    pub sensitivity: f64,
    pub lookback_runs: usize,
    pub alpha: f64,
    /// The driver's duration range must exceed the runner-up's by this
    /// factor, otherwise no driver is declared.
    pub min_range_ratio: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            sensitivity: 10.0,
            lookback_runs: 10,
            alpha: 0.3,
            min_range_ratio: 5.0,
        }
    }
}

/// How strongly one parameter key separates task durations.
#[derive(Debug, Clone)]
pub struct ParameterAnalysis {
    pub key: String,
    pub group_averages: BTreeMap<String, f64>,
    pub range_seconds: f64,
}

/// Tasks sharing one value of the contention driver.
#[derive(Debug, Clone)]
pub struct ContentionGroup {
    pub driver_value: String,
    pub task_ids: Vec<String>,
    pub avg_duration: f64,
    pub is_heavy: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IqrStats {
    pub q1: f64,
    pub q3: f64,
    pub iqr: f64,
    pub upper_fence: f64,
}

#[derive(Debug, Clone)]
pub struct ContentionReport {
    pub workflow: String,
    pub driver: Option<String>,
    pub fan_out_keys: Vec<String>,
    pub heavy_groups: Vec<ContentionGroup>,
    pub light_groups: Vec<ContentionGroup>,
    pub fan_out_size: usize,
    pub critical_path_seconds: f64,
    pub recommended_workers: usize,
    pub sweet_spot_workers: Option<usize>,
    pub sensitivity: f64,
    pub iqr: IqrStats,
    /// Added edges: task id -> predecessor ids.
    pub predecessor_map: BTreeMap<String, Vec<String>>,
    /// Recommended task ordering (heavy-first, else longest-first).
    pub task_order: Vec<String>,
    /// Per-signature runtime estimates behind the analysis; signatures
    /// without history carry the fastest-quartile default at confidence 0.
    pub signature_estimates: Vec<SignatureEstimate>,
    pub parameter_analyses: Vec<ParameterAnalysis>,
    pub warnings: Vec<String>,
}

impl ContentionReport {
    /// Mean confidence across the estimates that have real history.
    pub fn mean_confidence(&self) -> f64 {
        let with_history: Vec<f64> = self
            .signature_estimates
            .iter()
            .filter(|e| !e.estimated)
            .map(|e| e.confidence)
            .collect();
        if with_history.is_empty() {
            0.0
        } else {
            with_history.iter().sum::<f64>() / with_history.len() as f64
        }
    }
}

/// Run the full analysis for a workflow from its stored history.
pub fn analyze_contention(
    store: &StatsStore,
    workflow: &str,
    config: &AnalyzerConfig,
) -> Result<ContentionReport, RushtiError> {
    let mut report = empty_report(workflow, config);

    // Per-signature EWMA durations with their confidence scores.
    let mut ewma_map: HashMap<String, f64> = HashMap::new();
    let mut estimates: Vec<SignatureEstimate> = Vec::new();
    for signature in store.signatures_for_workflow(workflow)? {
        let durations = store.recent(&signature, config.lookback_runs)?;
        if durations.is_empty() {
            continue;
        }
        let estimate = SignatureEstimate {
            signature: signature.clone(),
            ewma_seconds: ewma(&durations, config.alpha),
            sample_count: durations.len(),
            confidence: confidence(&durations),
            estimated: false,
        };
        ewma_map.insert(signature, estimate.ewma_seconds);
        estimates.push(estimate);
    }
    if ewma_map.is_empty() {
        report
            .warnings
            .push("no execution history for workflow".to_string());
        return Ok(report);
    }

    let tasks = store.tasks_of_latest_successful_run(workflow)?;
    if tasks.is_empty() {
        report
            .warnings
            .push("no successful run to derive task parameters from".to_string());
        return Ok(report);
    }

    // Report entries for the latest run's signatures that have no history
    // yet: the fastest-quartile default at confidence zero. Grouping and
    // ordering below still run on real history only.
    let known: Vec<f64> = estimates.iter().map(|e| e.ewma_seconds).collect();
    let fallback = default_estimate(&known);
    let unknown: BTreeSet<String> = tasks
        .iter()
        .filter(|t| !ewma_map.contains_key(&t.signature))
        .map(|t| t.signature.clone())
        .collect();
    for signature in unknown {
        estimates.push(SignatureEstimate {
            signature,
            ewma_seconds: fallback,
            sample_count: 0,
            confidence: 0.0,
            estimated: true,
        });
    }
    estimates.sort_by(|a, b| b.ewma_seconds.total_cmp(&a.ewma_seconds));
    report.signature_estimates = estimates;

    report.sweet_spot_workers = sweet_spot_workers(store, workflow)?;
    report.task_order = longest_first_order(&tasks, &ewma_map);

    // Parameter keys whose values vary across tasks.
    let varying = varying_keys(&tasks);
    if varying.is_empty() {
        report
            .warnings
            .push("all tasks have identical parameters; nothing to group by".to_string());
        return Ok(report);
    }

    // The contention driver maximises the range of per-group mean durations.
    let analyses = analyze_parameters(&tasks, &ewma_map, &varying);
    report.parameter_analyses = analyses.clone();
    let Some(driver) = pick_driver(&analyses, config.min_range_ratio, &mut report.warnings)
    else {
        return Ok(report);
    };

    let fan_out_keys: Vec<String> = varying.iter().filter(|k| **k != driver.key).cloned().collect();
    report.driver = Some(driver.key.clone());
    report.fan_out_keys = fan_out_keys.clone();
    report.fan_out_size = fan_out_values(&tasks, &fan_out_keys).len().max(1);

    // Group tasks by driver value and split heavy from light.
    let mut groups: BTreeMap<String, ContentionGroup> = BTreeMap::new();
    for task in &tasks {
        let value = param_value(task, &driver.key);
        let group = groups.entry(value.clone()).or_insert_with(|| ContentionGroup {
            driver_value: value.clone(),
            task_ids: Vec::new(),
            avg_duration: driver.group_averages.get(&value).copied().unwrap_or(0.0),
            is_heavy: false,
        });
        group.task_ids.push(task.task_id.clone());
    }
    let mut all_groups: Vec<ContentionGroup> = groups.into_values().collect();
    all_groups.sort_by(|a, b| b.avg_duration.total_cmp(&a.avg_duration));

    let (heavy, light, iqr) = detect_heavy(all_groups, config.sensitivity);
    report.iqr = iqr;
    report.critical_path_seconds = heavy.iter().map(|g| g.avg_duration).sum();

    if heavy.len() < 2 {
        report.warnings.push(format!(
            "{} heavy group(s) detected; chaining requires at least 2, \
             falling back to longest-first ordering",
            heavy.len()
        ));
        report.heavy_groups = heavy;
        report.light_groups = light;
        report.recommended_workers = report
            .sweet_spot_workers
            .unwrap_or(report.fan_out_size.max(1));
        return Ok(report);
    }

    info!(
        workflow = %workflow,
        driver = %driver.key,
        heavy = heavy.len(),
        fence = iqr.upper_fence,
        "detected heavy contention groups"
    );

    report.predecessor_map = build_chains(&heavy, &tasks, &driver.key, &fan_out_keys);
    report.task_order = chain_major_order(&heavy, &light, &tasks, &driver.key);
    report.recommended_workers =
        recommend_workers(&heavy, &light, report.fan_out_size, report.sweet_spot_workers);
    report.heavy_groups = heavy;
    report.light_groups = light;

    Ok(report)
}

/// Rewrite the workflow per the analysis: inject predecessor chains,
/// reorder tasks, and embed the recommended worker count.
pub fn apply_to_taskfile(taskfile: &Taskfile, report: &ContentionReport) -> Taskfile {
    let mut out = taskfile.clone();

    for (task_id, preds) in &report.predecessor_map {
        if let Some(task) = out.tasks.iter_mut().find(|t| &t.id == task_id) {
            task.predecessors = preds.clone();
        }
    }

    if !report.task_order.is_empty() {
        let position: HashMap<&str, usize> = report
            .task_order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        out.tasks
            .sort_by_key(|t| position.get(t.id.as_str()).copied().unwrap_or(usize::MAX));
    }

    if report.recommended_workers > 0 {
        out.settings.max_workers = Some(report.recommended_workers);
    }

    out.metadata.description = match &report.driver {
        Some(driver) => {
            let chain: Vec<&str> = report
                .heavy_groups
                .iter()
                .map(|g| g.driver_value.as_str())
                .collect();
            format!(
                "contention-aware rewrite: driver={driver}, chain=[{}], sensitivity={}, workers={}",
                chain.join(">"),
                report.sensitivity,
                report.recommended_workers
            )
        }
        None => "reordered longest-first from execution history".to_string(),
    };

    out
}

fn empty_report(workflow: &str, config: &AnalyzerConfig) -> ContentionReport {
    ContentionReport {
        workflow: workflow.to_string(),
        driver: None,
        fan_out_keys: Vec::new(),
        heavy_groups: Vec::new(),
        light_groups: Vec::new(),
        fan_out_size: 0,
        critical_path_seconds: 0.0,
        recommended_workers: 0,
        sweet_spot_workers: None,
        sensitivity: config.sensitivity,
        iqr: IqrStats::default(),
        predecessor_map: BTreeMap::new(),
        task_order: Vec::new(),
        signature_estimates: Vec::new(),
        parameter_analyses: Vec::new(),
        warnings: Vec::new(),
    }
}

fn param_value(task: &AnalyzerTaskRow, key: &str) -> String {
    task.parameters
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
        .unwrap_or_default()
}

fn varying_keys(tasks: &[AnalyzerTaskRow]) -> Vec<String> {
    let mut values: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for task in tasks {
        for (key, value) in &task.parameters {
            values.entry(key.clone()).or_default().insert(value.clone());
        }
    }
    values
        .into_iter()
        .filter(|(_, v)| v.len() > 1)
        .map(|(k, _)| k)
        .collect()
}

fn analyze_parameters(
    tasks: &[AnalyzerTaskRow],
    ewma_map: &HashMap<String, f64>,
    keys: &[String],
) -> Vec<ParameterAnalysis> {
    let mut analyses = Vec::new();

    for key in keys {
        let mut groups: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for task in tasks {
            if let Some(duration) = ewma_map.get(&task.signature) {
                groups.entry(param_value(task, key)).or_default().push(*duration);
            }
        }

        let group_averages: BTreeMap<String, f64> = groups
            .into_iter()
            .map(|(value, ds)| {
                let avg = ds.iter().sum::<f64>() / ds.len() as f64;
                (value, avg)
            })
            .collect();
        if group_averages.is_empty() {
            continue;
        }

        let max = group_averages.values().cloned().fold(f64::MIN, f64::max);
        let min = group_averages.values().cloned().fold(f64::MAX, f64::min);
        analyses.push(ParameterAnalysis {
            key: key.clone(),
            group_averages,
            range_seconds: max - min,
        });
    }

    analyses.sort_by(|a, b| b.range_seconds.total_cmp(&a.range_seconds));
    analyses
}

fn pick_driver<'a>(
    analyses: &'a [ParameterAnalysis],
    min_range_ratio: f64,
    warnings: &mut Vec<String>,
) -> Option<&'a ParameterAnalysis> {
    let winner = analyses.first()?;

    if let Some(runner_up) = analyses.get(1) {
        if runner_up.range_seconds > 0.0 {
            let ratio = winner.range_seconds / runner_up.range_seconds;
            if ratio < min_range_ratio {
                let msg = format!(
                    "ambiguous contention signal: '{}' range {:.1}s vs '{}' range {:.1}s \
                     (ratio {ratio:.1} < {min_range_ratio}); no driver declared",
                    winner.key, winner.range_seconds, runner_up.key, runner_up.range_seconds
                );
                warn!("{msg}");
                warnings.push(msg);
                return None;
            }
        }
    }

    Some(winner)
}

fn fan_out_values(tasks: &[AnalyzerTaskRow], fan_out_keys: &[String]) -> BTreeSet<String> {
    let mut sorted_keys: Vec<&String> = fan_out_keys.iter().collect();
    sorted_keys.sort();
    tasks
        .iter()
        .map(|t| {
            sorted_keys
                .iter()
                .map(|k| param_value(t, k))
                .collect::<Vec<_>>()
                .join("|")
        })
        .collect()
}

/// Split groups into heavy outliers and the rest using
/// `fence = Q3 + k * IQR` over group mean durations. Fewer than four groups
/// cannot support a meaningful IQR.
fn detect_heavy(
    groups: Vec<ContentionGroup>,
    sensitivity: f64,
) -> (Vec<ContentionGroup>, Vec<ContentionGroup>, IqrStats) {
    if groups.len() < 4 {
        return (Vec::new(), groups, IqrStats::default());
    }

    let mut durations: Vec<f64> = groups.iter().map(|g| g.avg_duration).collect();
    durations.sort_by(|a, b| a.total_cmp(b));
    let n = durations.len();
    let q1 = durations[n / 4];
    let q3 = durations[(3 * n) / 4];
    let iqr = q3 - q1;
    let upper_fence = q3 + sensitivity * iqr;

    let stats = IqrStats {
        q1,
        q3,
        iqr,
        upper_fence,
    };

    let mut heavy = Vec::new();
    let mut light = Vec::new();
    for mut group in groups {
        if group.avg_duration > upper_fence {
            group.is_heavy = true;
            heavy.push(group);
        } else {
            light.push(group);
        }
    }
    // Heaviest first: that is the chain order.
    heavy.sort_by(|a, b| b.avg_duration.total_cmp(&a.avg_duration));
    light.sort_by(|a, b| b.avg_duration.total_cmp(&a.avg_duration));

    (heavy, light, stats)
}

/// Chain heavy groups per fan-out tuple: within each tuple, the task of
/// heavy group i+1 gets the task of heavy group i as its predecessor, so
/// parallelism along non-driver dimensions is preserved.
fn build_chains(
    heavy: &[ContentionGroup],
    tasks: &[AnalyzerTaskRow],
    driver: &str,
    fan_out_keys: &[String],
) -> BTreeMap<String, Vec<String>> {
    let mut sorted_keys: Vec<&String> = fan_out_keys.iter().collect();
    sorted_keys.sort();

    let tuple_of = |task: &AnalyzerTaskRow| {
        sorted_keys
            .iter()
            .map(|k| param_value(task, k))
            .collect::<Vec<_>>()
            .join("|")
    };

    let mut lookup: HashMap<(String, String), String> = HashMap::new();
    for task in tasks {
        lookup.insert(
            (param_value(task, driver), tuple_of(task)),
            task.task_id.clone(),
        );
    }

    let tuples: BTreeSet<String> = tasks.iter().map(tuple_of).collect();
    let mut map = BTreeMap::new();

    for tuple in &tuples {
        for pair in heavy.windows(2) {
            let pred = lookup.get(&(pair[0].driver_value.clone(), tuple.clone()));
            let curr = lookup.get(&(pair[1].driver_value.clone(), tuple.clone()));
            if let (Some(pred), Some(curr)) = (pred, curr) {
                map.insert(curr.clone(), vec![pred.clone()]);
            }
        }
    }

    map
}

/// `workers = chains + ceil(light_work / chain_duration)`, floored at the
/// chain count; the observed sweet spot wins when it is lower.
fn recommend_workers(
    heavy: &[ContentionGroup],
    light: &[ContentionGroup],
    fan_out_size: usize,
    sweet_spot: Option<usize>,
) -> usize {
    let critical_path: f64 = heavy.iter().map(|g| g.avg_duration).sum();
    let light_work: f64 = light
        .iter()
        .map(|g| g.avg_duration * g.task_ids.len() as f64)
        .sum();

    let light_slots = if critical_path > 0.0 {
        (light_work / critical_path).ceil() as usize
    } else {
        0
    };
    let formula = (fan_out_size + light_slots).max(fan_out_size.max(1));

    match sweet_spot {
        Some(spot) if spot < formula => spot,
        _ => formula,
    }
}

/// Fewest workers within 10% of the fastest observed wall clock across past
/// successful runs; `None` below two distinct worker settings.
fn sweet_spot_workers(store: &StatsStore, workflow: &str) -> Result<Option<usize>, RushtiError> {
    let runs = store.recent_runs(workflow, 50)?;
    let mut best_per_workers: BTreeMap<usize, f64> = BTreeMap::new();
    for run in runs.iter().filter(|r| r.status == "success") {
        let entry = best_per_workers
            .entry(run.max_workers)
            .or_insert(run.duration_seconds);
        if run.duration_seconds < *entry {
            *entry = run.duration_seconds;
        }
    }

    if best_per_workers.len() < 2 {
        return Ok(None);
    }

    let fastest = best_per_workers
        .values()
        .cloned()
        .fold(f64::MAX, f64::min);
    Ok(best_per_workers
        .iter()
        .filter(|(_, wall)| **wall <= fastest * 1.10)
        .map(|(workers, _)| *workers)
        .min())
}

fn longest_first_order(tasks: &[AnalyzerTaskRow], ewma_map: &HashMap<String, f64>) -> Vec<String> {
    let mut ids: Vec<(&AnalyzerTaskRow, f64)> = tasks
        .iter()
        .map(|t| (t, ewma_map.get(&t.signature).copied().unwrap_or(0.0)))
        .collect();
    ids.sort_by(|a, b| b.1.total_cmp(&a.1));
    ids.into_iter().map(|(t, _)| t.task_id.clone()).collect()
}

/// Driver-major ordering: heavy groups first (heaviest first), then light
/// groups, preserving each group's internal task order.
fn chain_major_order(
    heavy: &[ContentionGroup],
    light: &[ContentionGroup],
    tasks: &[AnalyzerTaskRow],
    driver: &str,
) -> Vec<String> {
    let mut order = Vec::with_capacity(tasks.len());
    for group in heavy.iter().chain(light.iter()) {
        for task in tasks {
            if param_value(task, driver) == group.driver_value {
                order.push(task.task_id.clone());
            }
        }
    }
    order
}
