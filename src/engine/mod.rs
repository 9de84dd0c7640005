//! Decision orchestrator
//!
//! One entry point per market event: `make_decision` runs the full pipeline
//! (risk check, strategy selection, price prediction, sizing, candidate
//! generation) and always returns a decision; any stage failure degrades to
//! a deterministic flat fallback. Realized outcomes come back through
//! `learn_from_result`, which updates the bandit, the cross-strategy
//! learner, the confidence scorer, and the RL replay buffer, and never
//! propagates errors into the caller's trade path.

pub mod sink;
pub mod tasks;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{Datelike, Timelike};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bandit::{context_vector, ArmStats, BanditSelector};
use crate::config::AppConfig;
use crate::learning::CrossStrategyLearner;
use crate::persistence::{ArmRecord, EodSnapshot, PersistenceStore, TrainingRow};
use crate::predictor::{self, DirectionPredictor};
use crate::risk::{RiskStateMachine, RiskVerdict};
use crate::runtime::{LinearRuntime, ModelRuntime, ModelStore, RlPolicy};
use crate::sizing::{PositionSizer, SizingExtras};
use crate::strategy::{GeneratorSet, StrategyId, TradingSchedule};
use crate::types::{
    Bar, Decision, Direction, Experience, Instrument, MarketContext, PriceLevels, Regime,
    SessionEnv, StrategySelection, TradeOutcome,
};
use crate::validation::{ModelValidationGate, ValidationReport};

use sink::{DecisionSink, LogSink};
use tasks::{CancelToken, TaskQueue};

/// Everything remembered about a decision until its outcome arrives
struct PendingDecision {
    ctx: MarketContext,
    selection: StrategySelection,
    prediction: crate::types::PricePrediction,
}

#[derive(Debug, Clone)]
pub struct EngineStats {
    pub decisions: u64,
    pub fallbacks: u64,
    pub outcomes: u64,
    pub avg_decision_micros: u64,
    pub pending_tasks: usize,
    pub arms: Vec<ArmStats>,
}

pub struct DecisionEngine {
    cfg: AppConfig,
    schedule: TradingSchedule,
    bandit: BanditSelector,
    model_store: Arc<ModelStore>,
    predictor: DirectionPredictor,
    runtime: Arc<dyn ModelRuntime>,
    gate: Arc<ModelValidationGate>,
    risk: Mutex<RiskStateMachine>,
    sizer: PositionSizer,
    learner: Mutex<CrossStrategyLearner>,
    generators: GeneratorSet,
    rl: Option<Arc<dyn RlPolicy>>,
    sink: Arc<dyn DecisionSink>,
    store: PersistenceStore,
    pending: Mutex<HashMap<String, PendingDecision>>,
    history: Mutex<VecDeque<Decision>>,
    decisions: AtomicU64,
    fallbacks: AtomicU64,
    outcomes: AtomicU64,
    decision_micros: AtomicU64,
    last_rl_train: Mutex<Instant>,
    tasks: TaskQueue,
}

impl DecisionEngine {
    /// Must be created inside a tokio runtime (the task queue spawns its
    /// drain loop). The model file is optional at startup; the predictor
    /// runs on rules until one is validated in.
    pub fn new(cfg: AppConfig) -> Self {
        let runtime: Arc<dyn ModelRuntime> = Arc::new(LinearRuntime);
        let model_store = Arc::new(ModelStore::empty());
        let model_path = Path::new(&cfg.engine.model_path);
        if model_path.exists() {
            match runtime.load(model_path) {
                Ok(model) => {
                    info!(path = %model_path.display(), "price model loaded");
                    model_store.replace(Some(model));
                }
                Err(e) => warn!("price model load failed, running on rules: {}", e),
            }
        }

        let gate = Arc::new(ModelValidationGate::new(
            cfg.validation.clone(),
            Arc::clone(&runtime),
        ));
        let tasks = TaskQueue::new(cfg.engine.task_queue_capacity);

        Self {
            schedule: TradingSchedule::default(),
            bandit: BanditSelector::new(cfg.bandit.clone()),
            predictor: DirectionPredictor::new(Arc::clone(&model_store)),
            model_store,
            runtime,
            gate,
            risk: Mutex::new(RiskStateMachine::new(cfg.risk.clone())),
            sizer: PositionSizer::new(cfg.risk.clone(), cfg.sizing.clone()),
            learner: Mutex::new(CrossStrategyLearner::new(cfg.learning.clone())),
            generators: GeneratorSet::new(),
            rl: None,
            sink: Arc::new(LogSink),
            store: PersistenceStore::new(cfg.persistence.clone()),
            pending: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            decisions: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            outcomes: AtomicU64::new(0),
            decision_micros: AtomicU64::new(0),
            last_rl_train: Mutex::new(Instant::now()),
            tasks,
            cfg,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn DecisionSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_rl_policy(mut self, policy: Arc<dyn RlPolicy>) -> Self {
        self.rl = Some(policy);
        self
    }

    pub fn with_generator(
        mut self,
        id: StrategyId,
        generator: Arc<dyn crate::strategy::CandidateGenerator>,
    ) -> Self {
        self.generators.set(id, generator);
        self
    }

    /// Full decision pipeline. Infallible from the caller's perspective:
    /// any internal failure produces the deterministic flat fallback.
    pub async fn make_decision(
        &self,
        symbol: &str,
        env: &SessionEnv,
        levels: &PriceLevels,
        bars: &[Bar],
        cancel: &CancelToken,
    ) -> Decision {
        let started = Instant::now();
        let decision = match self.decide_inner(symbol, env, levels, bars, cancel) {
            Ok(decision) => decision,
            Err(e) => {
                error!(symbol, "decision pipeline failed, issuing fallback: {:#}", e);
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                self.fallback_decision(symbol, env, levels, bars)
            }
        };

        self.decisions.fetch_add(1, Ordering::Relaxed);
        self.decision_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        self.push_history(decision.clone());
        if let Err(e) = self.sink.publish(&decision).await {
            warn!(symbol, "decision sink publish failed: {}", e);
        }
        decision
    }

    fn decide_inner(
        &self,
        symbol: &str,
        env: &SessionEnv,
        levels: &PriceLevels,
        bars: &[Bar],
        cancel: &CancelToken,
    ) -> Result<Decision> {
        anyhow::ensure!(!cancel.is_cancelled(), "decision cancelled before start");
        anyhow::ensure!(!bars.is_empty(), "no market data for {}", symbol);

        let ctx = build_context(symbol, bars, env);
        let regime = Regime::from_metrics(ctx.volatility, ctx.trend_strength);

        let (verdict, snapshot) = {
            let mut risk = self
                .risk
                .lock()
                .map_err(|e| anyhow::anyhow!("risk state poisoned: {}", e))?;
            (risk.check(env.now), risk.snapshot())
        };
        if let RiskVerdict::HardStop(ref reason) = verdict {
            let mut decision = self.flat_decision(&ctx, env, regime, reason.clone());
            decision.risk_assessment = format!("hard stop: {}", reason);
            return Ok(decision);
        }

        let limits = self.cfg.risk.clone();
        let context_vec = context_vector(
            &ctx,
            snapshot.drawdown_ratio(&limits),
            snapshot.pnl_ratio(&limits),
            snapshot.balance_ratio(&limits),
        );

        anyhow::ensure!(!cancel.is_cancelled(), "decision cancelled before selection");
        let eligible = self.schedule.eligible(ctx.hour);
        let selection = match self.bandit.select(eligible, &context_vec) {
            Ok(selection) => selection,
            Err(e) => {
                warn!(symbol, "bandit selection failed, using schedule default: {}", e);
                self.bandit.fallback(ctx.hour, &self.schedule)
            }
        };

        let prediction = self.predictor.predict(&ctx, bars);

        anyhow::ensure!(!cancel.is_cancelled(), "decision cancelled before sizing");
        let extras = SizingExtras {
            atr: predictor::atr(bars, 14),
            instrument: Instrument::from_symbol(symbol),
            win_rate: self
                .learner
                .lock()
                .map(|l| l.win_rate(selection.strategy))
                .unwrap_or(0.5),
            decision_freq_ratio: self.decision_freq_ratio(),
            price_momentum: momentum(bars, 5),
            volume_surge: ctx.volume_ratio,
        };
        let contracts = self.sizer.optimize_size(
            &ctx,
            &selection,
            &prediction,
            &snapshot,
            &verdict,
            self.rl.as_deref(),
            &extras,
        );

        let candidates = if contracts > 0 {
            self.generators
                .for_strategy(selection.strategy)
                .generate(&ctx, levels, bars)
        } else {
            Vec::new()
        };

        let risk_assessment = match &verdict {
            RiskVerdict::Normal => format!("normal, drawdown {:.0}", snapshot.drawdown),
            RiskVerdict::Warning(reason) => format!("warning: {}", reason),
            RiskVerdict::HardStop(reason) => format!("hard stop: {}", reason),
        };

        let decision = Decision {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            strategy: selection.strategy,
            confidence: selection.confidence,
            direction: prediction.direction,
            contracts,
            regime,
            candidates,
            decided_at: env.now,
            risk_assessment,
        };

        self.remember_pending(&ctx, Some((selection, prediction)));
        Ok(decision)
    }

    /// Deterministic stand-down decision: schedule default arm, neutral
    /// direction, zero contracts. Candidates still come from the plain base
    /// generator so the caller keeps its reference levels.
    fn fallback_decision(
        &self,
        symbol: &str,
        env: &SessionEnv,
        levels: &PriceLevels,
        bars: &[Bar],
    ) -> Decision {
        let ctx = build_context(symbol, bars, env);
        let selection = self.bandit.fallback(ctx.hour, &self.schedule);
        let candidates = self.generators.base().generate(&ctx, levels, bars);
        Decision {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            strategy: selection.strategy,
            confidence: selection.confidence,
            direction: Direction::Sideways,
            contracts: 0,
            regime: Regime::CalmChop,
            candidates,
            decided_at: env.now,
            risk_assessment: "fallback".to_string(),
        }
    }

    fn flat_decision(
        &self,
        ctx: &MarketContext,
        env: &SessionEnv,
        regime: Regime,
        reason: String,
    ) -> Decision {
        let selection = self.bandit.fallback(ctx.hour, &self.schedule);
        Decision {
            id: Uuid::new_v4().to_string(),
            symbol: ctx.symbol.clone(),
            strategy: selection.strategy,
            confidence: selection.confidence,
            direction: Direction::Sideways,
            contracts: 0,
            regime,
            candidates: Vec::new(),
            decided_at: env.now,
            risk_assessment: reason,
        }
    }

    fn remember_pending(
        &self,
        ctx: &MarketContext,
        decided: Option<(StrategySelection, crate::types::PricePrediction)>,
    ) {
        if let Some((selection, prediction)) = decided {
            if let Ok(mut pending) = self.pending.lock() {
                pending.insert(
                    ctx.symbol.clone(),
                    PendingDecision {
                        ctx: ctx.clone(),
                        selection,
                        prediction,
                    },
                );
            }
        }
    }

    /// Feed a realized outcome back into every learning surface. Errors are
    /// logged and swallowed; learning must never break the trade path.
    pub fn learn_from_result(&self, outcome: &TradeOutcome) {
        if let Err(e) = self.learn_inner(outcome) {
            error!(symbol = %outcome.symbol, "outcome learning failed: {:#}", e);
        }
    }

    fn learn_inner(&self, outcome: &TradeOutcome) -> Result<()> {
        self.outcomes.fetch_add(1, Ordering::Relaxed);

        let snapshot = {
            let mut risk = self
                .risk
                .lock()
                .map_err(|e| anyhow::anyhow!("risk state poisoned: {}", e))?;
            risk.apply_pnl(outcome.pnl);
            risk.snapshot()
        };

        let Some(pending) = self
            .pending
            .lock()
            .map_err(|e| anyhow::anyhow!("pending map poisoned: {}", e))?
            .remove(&outcome.symbol)
        else {
            warn!(symbol = %outcome.symbol, "outcome without a pending decision, skipped");
            return Ok(());
        };

        let limits = &self.cfg.risk;
        let context_vec = context_vector(
            &pending.ctx,
            snapshot.drawdown_ratio(limits),
            snapshot.pnl_ratio(limits),
            snapshot.balance_ratio(limits),
        );

        let reward = {
            let mut learner = self
                .learner
                .lock()
                .map_err(|e| anyhow::anyhow!("learner poisoned: {}", e))?;
            let reward = learner.record_outcome(outcome, &pending.ctx, &context_vec, &self.bandit);
            if learner.needs_maintenance() {
                learner.maintenance();
            }
            reward
        };

        self.sizer
            .record_outcome(&pending.ctx, &pending.selection, &pending.prediction, outcome.was_correct);

        self.feed_rl(outcome, reward);

        self.store.export_outcome(TrainingRow {
            ts: pending.ctx.ts,
            symbol: outcome.symbol.clone(),
            strategy: outcome.strategy.code().to_string(),
            volatility: pending.ctx.volatility,
            volume_ratio: pending.ctx.volume_ratio,
            rsi: pending.ctx.rsi,
            trend_strength: pending.ctx.trend_strength,
            pnl: outcome.pnl,
            was_correct: outcome.was_correct,
        })?;
        Ok(())
    }

    /// Complete the decision's RL transition and schedule a training pass
    /// when the buffer or the clock says so.
    fn feed_rl(&self, outcome: &TradeOutcome, reward: f64) {
        let Some(ref policy) = self.rl else {
            return;
        };
        let Some(memo) = self.sizer.take_memo(&outcome.symbol) else {
            return;
        };

        // next state keeps the decision-time market features and refreshes
        // the account-state entries
        let limits = &self.cfg.risk;
        let snapshot = match self.risk.lock() {
            Ok(risk) => risk.snapshot(),
            Err(_) => return,
        };
        let mut next_state = memo.state.clone();
        if next_state.len() >= 14 {
            next_state[12] = snapshot.drawdown_ratio(limits);
            next_state[13] = snapshot.pnl_ratio(limits);
        }

        policy.add_experience(Experience {
            state: memo.state,
            action: memo.action,
            reward,
            next_state,
            done: true,
            value_estimate: memo.value_estimate,
        });

        let buffer_full = policy.buffer_len() >= self.cfg.engine.rl_train_buffer;
        let interval_elapsed = self
            .last_rl_train
            .lock()
            .map(|t| t.elapsed().as_secs() >= self.cfg.engine.rl_train_interval_secs)
            .unwrap_or(false);
        if buffer_full || interval_elapsed {
            if let Ok(mut t) = self.last_rl_train.lock() {
                *t = Instant::now();
            }
            let policy = Arc::clone(policy);
            self.tasks.try_spawn(async move {
                match policy.train().await {
                    Ok(summary) => info!(
                        episode = summary.episode,
                        loss = summary.total_loss,
                        avg_reward = summary.average_reward,
                        "rl training pass finished"
                    ),
                    Err(e) => warn!("rl training pass failed: {}", e),
                }
            });
        }
    }

    /// Run the validation gate against a candidate file and, when it
    /// passes, swap it in and refresh the live model handle. In-flight
    /// decisions keep the model they already hold.
    pub async fn validate_and_reload(&self, candidate: &Path) -> Result<ValidationReport> {
        let gate = Arc::clone(&self.gate);
        let candidate = candidate.to_path_buf();
        let current = PathBuf::from(&self.cfg.engine.model_path);
        let report = tokio::task::spawn_blocking(move || gate.validate_and_swap(&candidate, &current))
            .await
            .context("validation task panicked")??;
        if report.valid {
            self.refresh_model()?;
        }
        Ok(report)
    }

    /// Re-read the model file into the hot-swap store
    pub fn refresh_model(&self) -> Result<()> {
        let path = Path::new(&self.cfg.engine.model_path);
        if path.exists() {
            let model = self.runtime.load(path).context("reloading price model")?;
            self.model_store.replace(Some(model));
            info!(path = %path.display(), "price model refreshed");
        } else {
            self.model_store.replace(None);
        }
        Ok(())
    }

    /// Write the end-of-day snapshot and flush pending exports
    pub fn end_of_day(&self, env: &SessionEnv) -> Result<PathBuf> {
        let snapshot = self
            .risk
            .lock()
            .map_err(|e| anyhow::anyhow!("risk state poisoned: {}", e))?
            .snapshot();
        let win_rates = self
            .learner
            .lock()
            .map_err(|e| anyhow::anyhow!("learner poisoned: {}", e))?
            .win_rates();
        let arms = self
            .bandit
            .arm_stats()
            .into_iter()
            .map(|s| ArmRecord {
                strategy: s.strategy.code().to_string(),
                pulls: s.pulls,
                mean_reward: s.mean_reward,
            })
            .collect();

        self.store.flush_exports()?;
        self.store.write_eod_snapshot(&EodSnapshot {
            date: env.now.date_naive(),
            daily_pnl: snapshot.daily_pnl,
            drawdown: snapshot.drawdown,
            balance: snapshot.balance,
            total_decisions: self.decisions.load(Ordering::Relaxed),
            arms,
            win_rates,
        })
    }

    /// Await completion of all queued background work
    pub async fn flush_tasks(&self) {
        self.tasks.flush().await;
    }

    pub fn stats(&self) -> EngineStats {
        let decisions = self.decisions.load(Ordering::Relaxed);
        let total_micros = self.decision_micros.load(Ordering::Relaxed);
        EngineStats {
            decisions,
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            outcomes: self.outcomes.load(Ordering::Relaxed),
            avg_decision_micros: if decisions > 0 { total_micros / decisions } else { 0 },
            pending_tasks: self.tasks.pending(),
            arms: self.bandit.arm_stats(),
        }
    }

    pub fn history(&self) -> Vec<Decision> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn push_history(&self, decision: Decision) {
        if let Ok(mut history) = self.history.lock() {
            while history.len() >= self.cfg.engine.history_cap {
                history.pop_front();
            }
            history.push_back(decision);
        }
    }

    /// Session decision pressure in [0, 1], fed to the RL state
    fn decision_freq_ratio(&self) -> f64 {
        let n = self.decisions.load(Ordering::Relaxed) as f64;
        (n / self.cfg.engine.history_cap as f64).min(1.0)
    }
}

/// Derive the per-decision market snapshot from raw bars and the injected
/// session clock.
pub fn build_context(symbol: &str, bars: &[Bar], env: &SessionEnv) -> MarketContext {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let price = closes.last().copied().unwrap_or(0.0);
    let volatility = realized_volatility(&closes);
    let atr = predictor::atr(bars, 14);
    let trend_strength = if atr > 0.0 {
        ((predictor::ema(&closes, 20) - predictor::ema(&closes, 50)) / atr).clamp(-1.0, 1.0)
    } else {
        0.0
    };
    MarketContext {
        symbol: symbol.to_string(),
        price,
        volatility,
        volume_ratio: env.volume_ratio,
        rsi: predictor::rsi(&closes, 14),
        trend_strength,
        hour: env.now.hour(),
        day_of_week: env.now.weekday().num_days_from_monday(),
        ts: bars.last().map(|b| b.ts).unwrap_or(0),
    }
}

/// Sample standard deviation of simple returns
fn realized_volatility(closes: &[f64]) -> f64 {
    if closes.len() < 3 {
        return 0.0;
    }
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    var.sqrt()
}

fn momentum(bars: &[Bar], lookback: usize) -> f64 {
    let n = bars.len();
    if n > lookback && bars[n - 1 - lookback].close != 0.0 {
        bars[n - 1].close / bars[n - 1 - lookback].close - 1.0
    } else {
        0.0
    }
}
