//! Contextual bandit strategy selector
//!
//! Keeps a linear value estimate per arm plus a visit-count exploration bonus
//! (UCB style). Selection is deterministic given weights, context and the
//! candidate set; updates are serialized per arm so concurrent learning calls
//! for different strategies never contend.

use ndarray::Array1;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::warn;

use crate::config::BanditConfig;
use crate::strategy::{StrategyId, TradingSchedule};
use crate::types::{MarketContext, StrategySelection};

/// Context feature dimension fed to the selector
pub const CONTEXT_DIM: usize = 10;

/// Build the selector context vector from a market snapshot and the current
/// risk ratios. All entries are roughly unit scale.
pub fn context_vector(
    ctx: &MarketContext,
    drawdown_ratio: f64,
    daily_pnl_ratio: f64,
    balance_ratio: f64,
) -> Array1<f64> {
    let hour_angle = 2.0 * std::f64::consts::PI * ctx.hour as f64 / 24.0;
    let mut v = Array1::zeros(CONTEXT_DIM);
    v[0] = ctx.volatility * 100.0;
    v[1] = ctx.volume_ratio;
    v[2] = ctx.rsi / 100.0;
    v[3] = ctx.trend_strength;
    v[4] = hour_angle.sin();
    v[5] = hour_angle.cos();
    v[6] = ctx.day_of_week as f64 / 6.0;
    v[7] = drawdown_ratio;
    v[8] = daily_pnl_ratio;
    v[9] = balance_ratio;
    // NaN guard: a poisoned feature must not poison the weights
    for x in v.iter_mut() {
        if !x.is_finite() {
            *x = 0.0;
        }
    }
    v
}

struct ArmState {
    weights: Array1<f64>,
    pulls: u64,
    reward_sum: f64,
}

impl ArmState {
    fn new() -> Self {
        Self {
            weights: Array1::zeros(CONTEXT_DIM),
            pulls: 0,
            reward_sum: 0.0,
        }
    }
}

/// Per-arm rollup for persistence and the EOD snapshot
#[derive(Debug, Clone)]
pub struct ArmStats {
    pub strategy: StrategyId,
    pub pulls: u64,
    pub mean_reward: f64,
}

pub struct BanditSelector {
    arms: [Mutex<ArmState>; StrategyId::ALL.len()],
    total_pulls: AtomicU64,
    cfg: BanditConfig,
}

impl BanditSelector {
    pub fn new(cfg: BanditConfig) -> Self {
        Self {
            arms: [
                Mutex::new(ArmState::new()),
                Mutex::new(ArmState::new()),
                Mutex::new(ArmState::new()),
                Mutex::new(ArmState::new()),
            ],
            total_pulls: AtomicU64::new(0),
            cfg,
        }
    }

    /// Choose among the candidate arms for the given context.
    ///
    /// Returns an error only on internal lock poisoning; the caller falls
    /// back to [`Self::fallback`] and never propagates it.
    pub fn select(
        &self,
        candidates: &[StrategyId],
        context: &Array1<f64>,
    ) -> anyhow::Result<StrategySelection> {
        anyhow::ensure!(!candidates.is_empty(), "empty candidate arm set");
        let total = self.total_pulls.load(Ordering::Relaxed);

        let mut best: Option<(f64, StrategySelection)> = None;
        for &arm in candidates {
            let state = self
                .arms[arm.index()]
                .lock()
                .map_err(|_| anyhow::anyhow!("bandit arm lock poisoned"))?;
            let value = state.weights.dot(context);
            let exploration = self.cfg.exploration_bonus
                * (((total + 1) as f64).ln() / (state.pulls + 1) as f64).sqrt();
            let score = value + exploration;
            let confidence = sigmoid(score / self.cfg.confidence_temp);
            drop(state);

            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((
                    score,
                    StrategySelection {
                        strategy: arm,
                        confidence,
                        exploration,
                        reasoning: format!(
                            "{}: value={:.3} exploration={:.3} score={:.3}",
                            arm.code(),
                            value,
                            exploration,
                            score
                        ),
                    },
                ));
            }
        }
        // candidates is non-empty, so best is always set
        Ok(best.expect("non-empty candidate set").1)
    }

    /// Reward update for one arm, serialized per arm. Reward is clamped to
    /// [0, 1] so a bad caller cannot blow up the weights.
    pub fn update(&self, arm: StrategyId, context: &Array1<f64>, reward: f64) {
        let reward = reward.clamp(0.0, 1.0);
        let mut state = match self.arms[arm.index()].lock() {
            Ok(s) => s,
            Err(e) => {
                warn!("bandit update skipped, arm lock poisoned: {}", e);
                return;
            }
        };
        let predicted = state.weights.dot(context);
        let error = reward - predicted;
        state.weights.scaled_add(self.cfg.learning_rate * error, context);
        state.pulls += 1;
        state.reward_sum += reward;
        self.total_pulls.fetch_add(1, Ordering::Relaxed);
    }

    /// Static hour-keyed default selection used when inference fails
    pub fn fallback(&self, hour: u32, schedule: &TradingSchedule) -> StrategySelection {
        let strategy = schedule.default_arm(hour);
        StrategySelection {
            strategy,
            confidence: self.cfg.fallback_confidence,
            exploration: 0.0,
            reasoning: format!("fallback: static default arm for hour {}", hour),
        }
    }

    pub fn arm_stats(&self) -> Vec<ArmStats> {
        StrategyId::ALL
            .iter()
            .filter_map(|&strategy| {
                let state = self.arms[strategy.index()].lock().ok()?;
                Some(ArmStats {
                    strategy,
                    pulls: state.pulls,
                    mean_reward: if state.pulls > 0 {
                        state.reward_sum / state.pulls as f64
                    } else {
                        0.0
                    },
                })
            })
            .collect()
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> BanditConfig {
        BanditConfig {
            exploration_bonus: 0.3,
            learning_rate: 0.1,
            confidence_temp: 2.0,
            fallback_confidence: 0.55,
        }
    }

    fn ctx_vec() -> Array1<f64> {
        let mut v = Array1::zeros(CONTEXT_DIM);
        v[0] = 1.0;
        v[2] = 0.5;
        v[3] = 0.4;
        v
    }

    #[test]
    fn test_select_is_deterministic() {
        let bandit = BanditSelector::new(cfg());
        let context = ctx_vec();
        let a = bandit
            .select(&StrategyId::ALL, &context)
            .expect("selection");
        let b = bandit
            .select(&StrategyId::ALL, &context)
            .expect("selection");
        assert_eq!(a.strategy, b.strategy);
        assert_eq!(a.confidence, b.confidence);
    }

    #[test]
    fn test_rewarded_arm_wins() {
        let bandit = BanditSelector::new(cfg());
        let context = ctx_vec();
        for _ in 0..50 {
            bandit.update(StrategyId::OpeningDrive, &context, 1.0);
            bandit.update(StrategyId::MeanReversion, &context, 0.0);
        }
        let sel = bandit
            .select(
                &[StrategyId::OpeningDrive, StrategyId::MeanReversion],
                &context,
            )
            .expect("selection");
        assert_eq!(sel.strategy, StrategyId::OpeningDrive);
        assert!(sel.confidence > 0.5);
    }

    #[test]
    fn test_update_clamps_reward() {
        let bandit = BanditSelector::new(cfg());
        let context = ctx_vec();
        bandit.update(StrategyId::FrequentScalp, &context, 42.0);
        let stats = bandit.arm_stats();
        let scalp = stats
            .iter()
            .find(|s| s.strategy == StrategyId::FrequentScalp)
            .unwrap();
        assert_eq!(scalp.pulls, 1);
        assert!(scalp.mean_reward <= 1.0);
    }

    #[test]
    fn test_fallback_uses_schedule_default() {
        let bandit = BanditSelector::new(cfg());
        let schedule = TradingSchedule::default();
        let sel = bandit.fallback(9, &schedule);
        assert_eq!(sel.strategy, StrategyId::OpeningDrive);
        assert_eq!(sel.confidence, 0.55);
        assert_eq!(sel.exploration, 0.0);
    }

    #[test]
    fn test_empty_candidates_is_error() {
        let bandit = BanditSelector::new(cfg());
        assert!(bandit.select(&[], &ctx_vec()).is_err());
    }
}
