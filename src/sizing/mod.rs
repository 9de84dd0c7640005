//! Position sizing
//!
//! Converts a strategy selection and price prediction into a contract count.
//! Risk budget is fixed-fractional, scaled down as trailing drawdown grows
//! and by the confidence scorer, then the RL policy's CVaR-adjusted
//! multiplier reshapes the floored contract count. A hard per-drawdown
//! contract ceiling applies at every step.

use std::collections::HashMap;
use std::sync::Mutex;

use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::linear::logistic_regression::{LogisticRegression, LogisticRegressionParameters};
use tracing::{debug, warn};

use crate::config::{RiskLimits, SizingConfig};
use crate::risk::{RiskSnapshot, RiskVerdict};
use crate::runtime::RlPolicy;
use crate::types::{Instrument, MarketContext, PricePrediction, StrategySelection};

/// Multiplier table indexed by the RL policy's discrete action
pub const ACTION_MULTIPLIERS: [f64; 6] = [0.0, 0.25, 0.5, 1.0, 1.5, 2.0];

/// Dimension of the RL sizing state vector
pub const RL_STATE_DIM: usize = 16;

const SCORER_FEATURES: usize = 4;
const SCORER_RETRAIN_EVERY: usize = 25;
const SCORER_MAX_SAMPLES: usize = 1_000;

/// Per-decision inputs that come from the engine rather than the selection
#[derive(Debug, Clone, Copy)]
pub struct SizingExtras {
    pub atr: f64,
    pub instrument: Instrument,
    pub win_rate: f64,
    pub decision_freq_ratio: f64,
    pub price_momentum: f64,
    pub volume_surge: f64,
}

/// State/action pair remembered until the trade outcome arrives
#[derive(Debug, Clone)]
pub struct RlMemo {
    pub state: Vec<f64>,
    pub action: usize,
    pub value_estimate: f64,
}

/// Logistic scorer over (bandit confidence, predictor probability,
/// volatility, trend). Maps goodness of the setup into a size multiplier.
pub struct ConfidenceScorer {
    samples: Vec<([f64; SCORER_FEATURES], i64)>,
    model: Option<LogisticRegression<f64, i64, DenseMatrix<f64>, Vec<i64>>>,
    min_samples: usize,
    since_train: usize,
}

impl ConfidenceScorer {
    pub fn new(min_samples: usize) -> Self {
        Self {
            samples: Vec::new(),
            model: None,
            min_samples,
            since_train: 0,
        }
    }

    pub fn record(&mut self, features: [f64; SCORER_FEATURES], correct: bool) {
        if self.samples.len() >= SCORER_MAX_SAMPLES {
            self.samples.remove(0);
        }
        self.samples.push((features, i64::from(correct)));
        self.since_train += 1;
        if self.samples.len() >= self.min_samples && self.since_train >= SCORER_RETRAIN_EVERY {
            self.train();
        }
    }

    fn train(&mut self) {
        self.since_train = 0;
        let labels: Vec<i64> = self.samples.iter().map(|(_, y)| *y).collect();
        // fit requires both classes present
        if !labels.contains(&0) || !labels.contains(&1) {
            return;
        }
        let rows: Vec<&[f64]> = self.samples.iter().map(|(x, _)| x.as_slice()).collect();
        let x = match DenseMatrix::from_2d_array(&rows) {
            Ok(x) => x,
            Err(e) => {
                warn!("scorer matrix build failed: {:?}", e);
                return;
            }
        };
        match LogisticRegression::fit(&x, &labels, LogisticRegressionParameters::default()) {
            Ok(model) => {
                debug!(samples = self.samples.len(), "confidence scorer retrained");
                self.model = Some(model);
            }
            Err(e) => warn!("confidence scorer training failed: {:?}", e),
        }
    }

    /// Multiplier in [0.25, 0.75]; None while untrained
    pub fn multiplier(&self, features: [f64; SCORER_FEATURES]) -> Option<f64> {
        let model = self.model.as_ref()?;
        let x = DenseMatrix::from_2d_array(&[features.as_slice()]).ok()?;
        match model.predict(&x) {
            Ok(pred) if !pred.is_empty() => Some(if pred[0] == 1 { 0.75 } else { 0.25 }),
            _ => None,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

pub struct PositionSizer {
    limits: RiskLimits,
    cfg: SizingConfig,
    scorer: Mutex<ConfidenceScorer>,
    memos: Mutex<HashMap<String, RlMemo>>,
}

impl PositionSizer {
    pub fn new(limits: RiskLimits, cfg: SizingConfig) -> Self {
        let scorer = ConfidenceScorer::new(cfg.scorer_min_samples);
        Self {
            limits,
            cfg,
            scorer: Mutex::new(scorer),
            memos: Mutex::new(HashMap::new()),
        }
    }

    /// Compute the contract count for a decision. Returns 0 whenever risk,
    /// confidence, or the multiplier stack says stand down.
    #[allow(clippy::too_many_arguments)]
    pub fn optimize_size(
        &self,
        ctx: &MarketContext,
        selection: &StrategySelection,
        prediction: &PricePrediction,
        snapshot: &RiskSnapshot,
        verdict: &RiskVerdict,
        rl: Option<&dyn RlPolicy>,
        extras: &SizingExtras,
    ) -> u32 {
        if verdict.is_blocked() {
            return 0;
        }

        let confidence = selection.confidence.max(prediction.probability);
        if confidence < self.limits.confidence_threshold {
            debug!(
                symbol = %ctx.symbol,
                confidence,
                threshold = self.limits.confidence_threshold,
                "confidence below threshold, sizing to zero"
            );
            return 0;
        }

        let base_risk = snapshot.balance * self.limits.risk_per_trade;
        let dd_ratio = snapshot.drawdown_ratio(&self.limits);
        let risk_mult = if dd_ratio < 0.25 {
            1.0
        } else if dd_ratio < 0.5 {
            0.75
        } else if dd_ratio < 0.75 {
            0.5
        } else {
            0.25
        };
        let conf_mult = self.confidence_multiplier(ctx, selection, prediction);
        let risk_amount = base_risk * risk_mult * conf_mult;

        let stop_points = extras.atr.max(extras.instrument.stop_floor());
        let dollars_per_contract = stop_points * extras.instrument.point_value();
        if dollars_per_contract <= 0.0 {
            return 0;
        }
        let ceiling = self.contract_ceiling(snapshot.drawdown) as i64;
        let mut contracts =
            ((risk_amount / dollars_per_contract).floor() as i64).clamp(0, ceiling) as u32;

        if let Some(policy) = rl {
            let state = rl_state_vector(ctx, selection, prediction, snapshot, &self.limits, extras);
            match policy.action(&state) {
                Ok(action) => {
                    let m = self.rl_multiplier(ctx, &action);
                    self.remember(&ctx.symbol, state, action.action, action.value_estimate);
                    contracts =
                        ((contracts as f64 * m).round() as i64).clamp(0, ceiling) as u32;
                }
                Err(e) => {
                    warn!("rl sizing action failed, keeping baseline size: {}", e);
                }
            }
        }

        if contracts == 0 && self.cfg.bootstrap_single_contract && risk_amount > 0.0 {
            debug!(symbol = %ctx.symbol, "bootstrap override allocating single contract");
            contracts = 1;
        }
        contracts
    }

    /// CVaR-adjusted multiplier stack over the RL action
    fn rl_multiplier(&self, ctx: &MarketContext, action: &crate::runtime::SizingAction) -> f64 {
        let base = ACTION_MULTIPLIERS
            .get(action.action)
            .copied()
            .unwrap_or(1.0);
        let prob = action.probability.max(0.3);
        let value = (1.0 + action.value_estimate).clamp(0.2, 1.5);
        let cvar = if action.cvar_estimate < -0.1 {
            0.5
        } else if action.cvar_estimate < -0.05 {
            0.75
        } else {
            1.0
        };
        let vol = if ctx.volatility >= 0.025 {
            0.6
        } else if ctx.volatility >= 0.015 {
            0.8
        } else if ctx.volatility >= 0.008 {
            1.0
        } else {
            1.2
        };
        base * prob * value * cvar * vol
    }

    /// Confidence scorer's multiplier, 0.5 while the scorer is untrained
    fn confidence_multiplier(
        &self,
        ctx: &MarketContext,
        selection: &StrategySelection,
        prediction: &PricePrediction,
    ) -> f64 {
        self.scorer
            .lock()
            .map(|s| {
                s.multiplier([
                    selection.confidence,
                    prediction.probability,
                    ctx.volatility,
                    ctx.trend_strength,
                ])
            })
            .unwrap_or(None)
            .unwrap_or(0.5)
    }

    /// Hard contract ceiling by trailing drawdown in dollars
    pub fn contract_ceiling(&self, drawdown: f64) -> u32 {
        if drawdown < self.cfg.low_drawdown_usd {
            3
        } else if drawdown < self.cfg.moderate_drawdown_usd {
            2
        } else {
            1
        }
    }

    fn remember(&self, symbol: &str, state: Vec<f64>, action: usize, value_estimate: f64) {
        if let Ok(mut memos) = self.memos.lock() {
            memos.insert(
                symbol.to_string(),
                RlMemo {
                    state,
                    action,
                    value_estimate,
                },
            );
        }
    }

    /// Remove and return the pending RL memo for a symbol, if any
    pub fn take_memo(&self, symbol: &str) -> Option<RlMemo> {
        self.memos.lock().ok()?.remove(symbol)
    }

    /// Feed a trade outcome to the confidence scorer
    pub fn record_outcome(
        &self,
        ctx: &MarketContext,
        selection: &StrategySelection,
        prediction: &PricePrediction,
        correct: bool,
    ) {
        if let Ok(mut scorer) = self.scorer.lock() {
            scorer.record(
                [
                    selection.confidence,
                    prediction.probability,
                    ctx.volatility,
                    ctx.trend_strength,
                ],
                correct,
            );
        }
    }
}

/// Fixed-order RL sizing state vector
pub fn rl_state_vector(
    ctx: &MarketContext,
    selection: &StrategySelection,
    prediction: &PricePrediction,
    snapshot: &RiskSnapshot,
    limits: &RiskLimits,
    extras: &SizingExtras,
) -> Vec<f64> {
    let hour_angle = 2.0 * std::f64::consts::PI * ctx.hour as f64 / 24.0;
    let atr_norm = if ctx.price > 0.0 {
        extras.atr / ctx.price * 100.0
    } else {
        0.0
    };
    let mut state = vec![
        ctx.volatility,
        extras.price_momentum,
        extras.volume_surge,
        atr_norm,
        ctx.trend_strength,
        selection.confidence,
        selection.exploration,
        selection.strategy.index() as f64 / 3.0,
        prediction.probability,
        prediction.direction.encoding(),
        hour_angle.sin(),
        hour_angle.cos(),
        snapshot.drawdown_ratio(limits),
        snapshot.pnl_ratio(limits),
        extras.decision_freq_ratio,
        extras.win_rate,
    ];
    debug_assert_eq!(state.len(), RL_STATE_DIM);
    for v in state.iter_mut() {
        if !v.is_finite() {
            *v = 0.0;
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{SizingAction, TrainingSummary};
    use crate::strategy::StrategyId;
    use crate::types::Direction;
    use async_trait::async_trait;

    fn ctx() -> MarketContext {
        MarketContext {
            symbol: "ES".to_string(),
            price: 5000.0,
            volatility: 0.01,
            volume_ratio: 1.0,
            rsi: 55.0,
            trend_strength: 0.4,
            hour: 10,
            day_of_week: 2,
            ts: 0,
        }
    }

    fn selection(confidence: f64) -> StrategySelection {
        StrategySelection {
            strategy: StrategyId::OpeningDrive,
            confidence,
            exploration: 0.0,
            reasoning: String::new(),
        }
    }

    fn prediction(probability: f64) -> PricePrediction {
        PricePrediction {
            direction: Direction::Up,
            probability,
            expected_move: 5.0,
            horizon_minutes: 15,
        }
    }

    fn snapshot(drawdown: f64) -> RiskSnapshot {
        RiskSnapshot {
            daily_pnl: 0.0,
            drawdown,
            balance: 50_000.0 - drawdown,
        }
    }

    fn extras() -> SizingExtras {
        SizingExtras {
            atr: 8.0,
            instrument: Instrument::ES,
            win_rate: 0.5,
            decision_freq_ratio: 0.5,
            price_momentum: 0.01,
            volume_surge: 1.0,
        }
    }

    // micro contract on a small account: $50 risk per contract, so the
    // baseline size is nonzero and the RL multiplier is observable
    fn micro_extras() -> SizingExtras {
        SizingExtras {
            instrument: Instrument::MES,
            ..extras()
        }
    }

    fn micro_snapshot(drawdown: f64) -> RiskSnapshot {
        RiskSnapshot {
            daily_pnl: 0.0,
            drawdown,
            balance: 15_000.0,
        }
    }

    fn sizer() -> PositionSizer {
        PositionSizer::new(RiskLimits::default(), SizingConfig::default())
    }

    struct FixedPolicy {
        action: SizingAction,
    }

    #[async_trait]
    impl RlPolicy for FixedPolicy {
        fn action(&self, _state: &[f64]) -> anyhow::Result<SizingAction> {
            Ok(self.action)
        }
        fn add_experience(&self, _exp: crate::types::Experience) {}
        async fn train(&self) -> anyhow::Result<TrainingSummary> {
            Ok(TrainingSummary {
                episode: 0,
                total_loss: 0.0,
                average_reward: 0.0,
            })
        }
        fn buffer_len(&self) -> usize {
            0
        }
    }

    #[test]
    fn test_hard_stop_sizes_zero() {
        let n = sizer().optimize_size(
            &ctx(),
            &selection(0.9),
            &prediction(0.7),
            &snapshot(0.0),
            &RiskVerdict::HardStop("stop".into()),
            None,
            &extras(),
        );
        assert_eq!(n, 0);
    }

    #[test]
    fn test_low_confidence_sizes_zero() {
        let n = sizer().optimize_size(
            &ctx(),
            &selection(0.6),
            &prediction(0.6),
            &snapshot(0.0),
            &RiskVerdict::Normal,
            None,
            &extras(),
        );
        assert_eq!(n, 0);
    }

    #[test]
    fn test_untrained_scorer_halves_risk_budget() {
        // base risk 500, untrained scorer halves it to 250; at 10pt stop
        // floor * $50/pt the $500 per-contract cost floors to zero
        let n = sizer().optimize_size(
            &ctx(),
            &selection(0.8),
            &prediction(0.7),
            &snapshot(0.0),
            &RiskVerdict::Normal,
            None,
            &extras(),
        );
        assert_eq!(n, 0);
    }

    #[test]
    fn test_baseline_contracts_are_floored() {
        // $150 base risk, halved to $75; $50 per micro contract gives 1.5,
        // floored to 1
        let n = sizer().optimize_size(
            &ctx(),
            &selection(0.8),
            &prediction(0.7),
            &micro_snapshot(0.0),
            &RiskVerdict::Normal,
            None,
            &micro_extras(),
        );
        assert_eq!(n, 1);
    }

    #[test]
    fn test_contract_ceiling_tiers() {
        let s = sizer();
        assert_eq!(s.contract_ceiling(0.0), 3);
        assert_eq!(s.contract_ceiling(499.0), 3);
        assert_eq!(s.contract_ceiling(500.0), 2);
        assert_eq!(s.contract_ceiling(999.0), 2);
        assert_eq!(s.contract_ceiling(1_000.0), 1);
        assert_eq!(s.contract_ceiling(1_999.0), 1);
    }

    #[test]
    fn test_rl_action_zero_flats_the_trade() {
        let policy = FixedPolicy {
            action: SizingAction {
                action: 0,
                probability: 0.9,
                value_estimate: 0.2,
                cvar_estimate: 0.0,
            },
        };
        let s = sizer();
        let n = s.optimize_size(
            &ctx(),
            &selection(0.8),
            &prediction(0.7),
            &micro_snapshot(0.0),
            &RiskVerdict::Normal,
            Some(&policy),
            &micro_extras(),
        );
        assert_eq!(n, 0);
        // memo is still recorded so the outcome can train the policy
        assert!(s.take_memo("ES").is_some());
    }

    #[test]
    fn test_cvar_penalty_reduces_size() {
        let aggressive = SizingAction {
            action: 5,
            probability: 1.0,
            value_estimate: 0.5,
            cvar_estimate: 0.0,
        };
        let tail_risk = SizingAction {
            cvar_estimate: -0.2,
            ..aggressive.clone()
        };
        let s = sizer();
        let big = s.optimize_size(
            &ctx(),
            &selection(0.8),
            &prediction(0.7),
            &micro_snapshot(0.0),
            &RiskVerdict::Normal,
            Some(&FixedPolicy { action: aggressive }),
            &micro_extras(),
        );
        let small = s.optimize_size(
            &ctx(),
            &selection(0.8),
            &prediction(0.7),
            &micro_snapshot(0.0),
            &RiskVerdict::Normal,
            Some(&FixedPolicy { action: tail_risk }),
            &micro_extras(),
        );
        assert!(small < big, "cvar penalty must reduce size ({small} vs {big})");
    }

    #[test]
    fn test_drawdown_tightens_ceiling() {
        let aggressive = SizingAction {
            action: 5,
            probability: 1.0,
            value_estimate: 0.5,
            cvar_estimate: 0.0,
        };
        let s = sizer();
        // drawdown 1_200 halves the risk budget and caps contracts at 1,
        // which the x3 RL multiplier cannot raise
        let snap = RiskSnapshot {
            daily_pnl: 0.0,
            drawdown: 1_200.0,
            balance: 30_000.0,
        };
        let n = s.optimize_size(
            &ctx(),
            &selection(0.9),
            &prediction(0.7),
            &snap,
            &RiskVerdict::Normal,
            Some(&FixedPolicy { action: aggressive }),
            &micro_extras(),
        );
        assert_eq!(n, 1);
    }

    #[test]
    fn test_bootstrap_override_is_opt_in() {
        let weak = SizingAction {
            action: 1,
            probability: 0.3,
            value_estimate: -0.5,
            cvar_estimate: 0.0,
        };
        let off = sizer().optimize_size(
            &ctx(),
            &selection(0.66),
            &prediction(0.5),
            &snapshot(1_500.0),
            &RiskVerdict::Normal,
            Some(&FixedPolicy { action: weak.clone() }),
            &extras(),
        );
        assert_eq!(off, 0);

        let mut cfg = SizingConfig::default();
        cfg.bootstrap_single_contract = true;
        let s = PositionSizer::new(RiskLimits::default(), cfg);
        let on = s.optimize_size(
            &ctx(),
            &selection(0.66),
            &prediction(0.5),
            &snapshot(1_500.0),
            &RiskVerdict::Normal,
            Some(&FixedPolicy { action: weak }),
            &extras(),
        );
        assert_eq!(on, 1);
    }

    #[test]
    fn test_rl_state_vector_shape() {
        let state = rl_state_vector(
            &ctx(),
            &selection(0.8),
            &prediction(0.7),
            &snapshot(500.0),
            &RiskLimits::default(),
            &extras(),
        );
        assert_eq!(state.len(), RL_STATE_DIM);
        assert!(state.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_scorer_untrained_returns_none() {
        let scorer = ConfidenceScorer::new(30);
        assert!(scorer.multiplier([0.8, 0.7, 0.01, 0.4]).is_none());
    }

    #[test]
    fn test_scorer_trains_and_separates_classes() {
        let mut scorer = ConfidenceScorer::new(30);
        for i in 0..60 {
            let good = i % 2 == 0;
            let conf = if good { 0.9 } else { 0.3 };
            scorer.record([conf, conf, 0.01, 0.4], good);
        }
        assert!(scorer.sample_count() == 60);
        let strong = scorer.multiplier([0.9, 0.9, 0.01, 0.4]);
        let weak = scorer.multiplier([0.3, 0.3, 0.01, 0.4]);
        assert_eq!(strong, Some(0.75));
        assert_eq!(weak, Some(0.25));
    }
}
