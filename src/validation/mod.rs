//! Model validation gate and hot swap
//!
//! A candidate model file passes five stages before it may replace the
//! deployed one: feature-schema check, seeded sanity inference, output
//! divergence against the current model, numeric sanity, and an equity-walk
//! replay comparison. The swap itself is backup-then-rename with restore on
//! failure, so a crash mid-swap never leaves the engine without a model.
//!
//! All functions here are synchronous filesystem work; the engine runs them
//! on the blocking pool.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ValidationConfig;
use crate::predictor::FEATURE_DIM;
use crate::runtime::{Model, ModelRuntime};

const SANITY_SEED: u64 = 42;
const HISTORICAL_SEED: u64 = 1337;
const KL_FLOOR: f64 = 1e-6;

/// Outcome of a validation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub reason: String,
    pub old_version: Option<String>,
    pub new_version: String,
}

impl ValidationReport {
    fn rejected(reason: String, old: Option<String>, new: String) -> Self {
        Self {
            valid: false,
            reason,
            old_version: old,
            new_version: new,
        }
    }
}

/// Versioned description of the model input layout. Written once and then
/// treated as the contract every candidate must match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub version: u32,
    pub feature_count: usize,
    pub names: Vec<String>,
}

impl FeatureSpec {
    pub fn current() -> Self {
        Self {
            version: 1,
            feature_count: FEATURE_DIM,
            names: [
                "volatility_pct",
                "return_5",
                "volume_ratio",
                "atr_pct",
                "trend_strength",
                "rsi_norm",
                "sin_tod",
                "cos_tod",
                "day_of_week",
                "close_vs_ema20",
                "close_vs_ema50",
                "range_position",
                "return_1",
                "return_2",
                "return_3",
                "return_4",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

pub struct ModelValidationGate {
    cfg: ValidationConfig,
    runtime: Arc<dyn ModelRuntime>,
    swap: fn(&Path, &Path) -> Result<()>,
}

impl ModelValidationGate {
    pub fn new(cfg: ValidationConfig, runtime: Arc<dyn ModelRuntime>) -> Self {
        Self {
            cfg,
            runtime,
            swap: swap_files,
        }
    }

    /// Replace the file-swap step, used to exercise the restore path
    #[cfg(test)]
    fn with_swap(mut self, swap: fn(&Path, &Path) -> Result<()>) -> Self {
        self.swap = swap;
        self
    }

    /// Run all five stages against the candidate file. Never swaps.
    pub fn validate(&self, candidate_path: &Path, current_path: &Path) -> Result<ValidationReport> {
        let new_version = file_version(candidate_path);
        let current = if current_path.exists() {
            Some(self.runtime.load(current_path).context("loading current model")?)
        } else {
            None
        };
        let old_version = current
            .as_ref()
            .map(|_| file_version(current_path));

        // stage 1: feature schema
        let spec = self.load_or_create_feature_spec()?;
        let candidate = match self.runtime.load(candidate_path) {
            Ok(m) => m,
            Err(e) => {
                return Ok(ValidationReport::rejected(
                    format!("stage 1: candidate failed to load: {}", e),
                    old_version,
                    new_version,
                ));
            }
        };
        if candidate.input_dim() != spec.feature_count {
            return Ok(ValidationReport::rejected(
                format!(
                    "stage 1: candidate expects {} features, schema v{} defines {}",
                    candidate.input_dim(),
                    spec.version,
                    spec.feature_count
                ),
                old_version,
                new_version,
            ));
        }

        // stage 2: seeded sanity inference
        let sanity = self.load_or_create_vectors(
            "sanity_vectors.json",
            SANITY_SEED,
            self.cfg.sanity_vector_count,
        )?;
        let candidate_sanity = match run_all(candidate.as_ref(), &sanity) {
            Ok(outs) => outs,
            Err(e) => {
                return Ok(ValidationReport::rejected(
                    format!("stage 2: sanity inference failed: {}", e),
                    old_version,
                    new_version,
                ));
            }
        };
        if candidate_sanity.iter().any(|out| out.len() < 3) {
            return Ok(ValidationReport::rejected(
                "stage 2: sanity inference produced fewer than 3 outputs".to_string(),
                old_version,
                new_version,
            ));
        }

        // stage 3: sanity-vector divergence against the deployed model
        if let Some(ref deployed) = current {
            if deployed.input_dim() != candidate.input_dim() {
                return Ok(ValidationReport::rejected(
                    format!(
                        "stage 3: deployed model expects {} features, candidate {}",
                        deployed.input_dim(),
                        candidate.input_dim()
                    ),
                    old_version,
                    new_version,
                ));
            }
            let deployed_sanity = run_all(deployed.as_ref(), &sanity)
                .context("running deployed model on sanity vectors")?;
            let (tv, kl) = mean_divergence(&deployed_sanity, &candidate_sanity);
            if tv > self.cfg.max_total_variation {
                return Ok(ValidationReport::rejected(
                    format!(
                        "stage 3: total variation {:.4} exceeds limit {:.4}",
                        tv, self.cfg.max_total_variation
                    ),
                    old_version,
                    new_version,
                ));
            }
            if kl > self.cfg.max_kl_divergence {
                return Ok(ValidationReport::rejected(
                    format!(
                        "stage 3: kl divergence {:.4} exceeds limit {:.4}",
                        kl, self.cfg.max_kl_divergence
                    ),
                    old_version,
                    new_version,
                ));
            }
        }

        let historical = self.load_or_create_vectors(
            "historical_vectors.json",
            HISTORICAL_SEED,
            self.cfg.historical_vector_count,
        )?;
        let candidate_hist = match run_all(candidate.as_ref(), &historical) {
            Ok(outs) => outs,
            Err(e) => {
                return Ok(ValidationReport::rejected(
                    format!("stage 4: historical inference failed: {}", e),
                    old_version,
                    new_version,
                ));
            }
        };

        // stage 4: numeric sanity on raw outputs
        let bad = candidate_sanity
            .iter()
            .chain(candidate_hist.iter())
            .flatten()
            .filter(|v| !v.is_finite())
            .count();
        if bad > 0 {
            return Ok(ValidationReport::rejected(
                format!("stage 4: {} non-finite output values", bad),
                old_version,
                new_version,
            ));
        }

        // stage 5: equity-walk replay comparison
        if let Some(ref deployed) = current {
            let deployed_hist = run_all(deployed.as_ref(), &historical)
                .context("running deployed model on historical vectors")?;
            let dd_old = max_equity_drawdown(&deployed_hist);
            let dd_new = max_equity_drawdown(&candidate_hist);
            let ratio = dd_new / dd_old.max(1e-9);
            if ratio > self.cfg.max_drawdown_ratio {
                return Ok(ValidationReport::rejected(
                    format!(
                        "stage 5: replay drawdown ratio {:.2} exceeds limit {:.2} (new {:.4}, old {:.4})",
                        ratio, self.cfg.max_drawdown_ratio, dd_new, dd_old
                    ),
                    old_version,
                    new_version,
                ));
            }
        }

        Ok(ValidationReport {
            valid: true,
            reason: "all validation stages passed".to_string(),
            old_version,
            new_version,
        })
    }

    /// Validate and, on success, atomically swap the candidate into place.
    /// A failed swap restores the previous model file from its backup.
    pub fn validate_and_swap(
        &self,
        candidate_path: &Path,
        current_path: &Path,
    ) -> Result<ValidationReport> {
        let report = self.validate(candidate_path, current_path)?;
        if !report.valid {
            warn!(reason = %report.reason, "candidate model rejected");
            return Ok(report);
        }

        let backup = self.backup_current(current_path)?;
        if let Err(e) = (self.swap)(candidate_path, current_path) {
            warn!("model swap failed, restoring backup: {}", e);
            if let Some(ref backup_path) = backup {
                fs::copy(backup_path, current_path).context("restoring model backup")?;
            }
            return Err(e);
        }
        info!(
            old = report.old_version.as_deref().unwrap_or("none"),
            new = %report.new_version,
            "model swapped in"
        );
        Ok(report)
    }

    fn backup_current(&self, current_path: &Path) -> Result<Option<PathBuf>> {
        if !current_path.exists() {
            return Ok(None);
        }
        fs::create_dir_all(&self.cfg.backup_dir).context("creating backup dir")?;
        let stem = current_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("model");
        let ext = current_path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("json");
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let backup = Path::new(&self.cfg.backup_dir).join(format!("{stem}_{stamp}.{ext}"));
        fs::copy(current_path, &backup).context("writing model backup")?;
        Ok(Some(backup))
    }

    fn load_or_create_feature_spec(&self) -> Result<FeatureSpec> {
        fs::create_dir_all(&self.cfg.data_dir).context("creating validation data dir")?;
        let path = Path::new(&self.cfg.data_dir).join("feature_spec.json");
        if path.exists() {
            let raw = fs::read_to_string(&path).context("reading feature spec")?;
            return serde_json::from_str(&raw).context("parsing feature spec");
        }
        let spec = FeatureSpec::current();
        fs::write(&path, serde_json::to_string_pretty(&spec)?).context("writing feature spec")?;
        info!(path = %path.display(), "feature spec created");
        Ok(spec)
    }

    /// Deterministic vector cache: generated once from a fixed seed, then
    /// reused so every validation run scores the same inputs.
    fn load_or_create_vectors(&self, name: &str, seed: u64, count: usize) -> Result<Vec<Vec<f64>>> {
        fs::create_dir_all(&self.cfg.data_dir).context("creating validation data dir")?;
        let path = Path::new(&self.cfg.data_dir).join(name);
        if path.exists() {
            let raw = fs::read_to_string(&path).with_context(|| format!("reading {}", name))?;
            return serde_json::from_str(&raw).with_context(|| format!("parsing {}", name));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let vectors: Vec<Vec<f64>> = (0..count)
            .map(|_| (0..FEATURE_DIM).map(|_| rng.gen_range(-1.0..=1.0)).collect())
            .collect();
        fs::write(&path, serde_json::to_string(&vectors)?)
            .with_context(|| format!("writing {}", name))?;
        Ok(vectors)
    }
}

/// Copy-to-temp then rename so the current path never holds a partial file
fn swap_files(candidate: &Path, current: &Path) -> Result<()> {
    let tmp = current.with_extension("json.tmp");
    if let Some(parent) = current.parent() {
        fs::create_dir_all(parent).context("creating model dir")?;
    }
    fs::copy(candidate, &tmp).context("staging candidate model")?;
    if current.exists() {
        fs::remove_file(current).context("removing current model")?;
    }
    fs::rename(&tmp, current).context("activating candidate model")?;
    Ok(())
}

fn run_all(model: &dyn Model, vectors: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
    vectors
        .iter()
        .map(|v| model.run(v).map_err(anyhow::Error::from))
        .collect()
}

/// Candidate/current file identity tag from filesystem metadata
pub fn file_version(path: &Path) -> String {
    match fs::metadata(path) {
        Ok(meta) => {
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            format!("{}-{}", mtime, meta.len())
        }
        Err(_) => "unknown".to_string(),
    }
}

/// Mean total-variation and floor-stabilized KL divergence between the two
/// models' softmaxed outputs, paired per vector.
fn mean_divergence(old: &[Vec<f64>], new: &[Vec<f64>]) -> (f64, f64) {
    let mut tv_sum = 0.0;
    let mut kl_sum = 0.0;
    let mut n = 0usize;
    for (a, b) in old.iter().zip(new.iter()) {
        let len = a.len().min(b.len());
        if len == 0 {
            continue;
        }
        let p = softmax(&a[..len]);
        let q = softmax(&b[..len]);
        tv_sum += 0.5 * p.iter().zip(q.iter()).map(|(x, y)| (x - y).abs()).sum::<f64>();
        kl_sum += p
            .iter()
            .zip(q.iter())
            .map(|(x, y)| {
                let x = x.max(KL_FLOOR);
                let y = y.max(KL_FLOOR);
                x * (x / y).ln()
            })
            .sum::<f64>();
        n += 1;
    }
    if n == 0 {
        (0.0, 0.0)
    } else {
        (tv_sum / n as f64, kl_sum / n as f64)
    }
}

/// Replay the model's first output as a scaled return stream and measure the
/// worst peak-to-trough drawdown of the resulting equity walk.
fn max_equity_drawdown(outputs: &[Vec<f64>]) -> f64 {
    let mut equity = 1.0f64;
    let mut peak = 1.0f64;
    let mut max_dd = 0.0f64;
    for out in outputs {
        let ret = out.first().copied().unwrap_or(0.0) * 0.01;
        equity *= 1.0 + ret.clamp(-0.5, 0.5);
        peak = peak.max(equity);
        max_dd = max_dd.max(peak - equity);
    }
    max_dd
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|&x| (x - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return vec![1.0 / logits.len() as f64; logits.len()];
    }
    exps.into_iter().map(|e| e / total).collect()
}
