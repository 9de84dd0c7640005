//! Cross-strategy learning loop
//!
//! Every realized outcome updates the executed strategy's bandit arm at full
//! strength and propagates a similarity-scaled reward to the other arms, so
//! strategies that thrive in overlapping conditions learn from each other's
//! trades. Per-strategy condition statistics feed a periodic maintenance
//! sweep that prunes weak conditions and shares the leader's strong ones.

use std::collections::{HashMap, VecDeque};

use ndarray::Array1;
use tracing::{debug, info};

use crate::bandit::BanditSelector;
use crate::config::LearningConfig;
use crate::strategy::StrategyId;
use crate::types::{MarketContext, TradeOutcome};

const RECENT_PNL_WINDOW: usize = 10;
const HOLD_BONUS_SECS: i64 = 7_200;

/// Running per-strategy performance record
#[derive(Debug, Clone, Default)]
pub struct StrategyPerformance {
    pub total_trades: u64,
    pub winning_trades: u64,
    pub total_pnl: f64,
    recent_pnl: VecDeque<f64>,
}

impl StrategyPerformance {
    /// Neutral 0.5 until the strategy has traded
    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            0.5
        } else {
            self.winning_trades as f64 / self.total_trades as f64
        }
    }

    pub fn recent_pnl(&self) -> f64 {
        self.recent_pnl.iter().sum()
    }

    fn record(&mut self, pnl: f64, correct: bool) {
        self.total_trades += 1;
        if correct {
            self.winning_trades += 1;
        }
        self.total_pnl += pnl;
        if self.recent_pnl.len() >= RECENT_PNL_WINDOW {
            self.recent_pnl.pop_front();
        }
        self.recent_pnl.push_back(pnl);
    }
}

/// Weighted success counter for one market-condition tag
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionStat {
    pub successes: f64,
    pub total: f64,
}

impl ConditionStat {
    pub fn success_rate(&self) -> f64 {
        if self.total > 0.0 {
            self.successes / self.total
        } else {
            0.5
        }
    }

    fn add(&mut self, weight: f64, correct: bool) {
        self.total += weight;
        if correct {
            self.successes += weight;
        }
    }
}

pub struct CrossStrategyLearner {
    cfg: LearningConfig,
    performance: HashMap<StrategyId, StrategyPerformance>,
    conditions: HashMap<StrategyId, HashMap<String, ConditionStat>>,
    outcomes_since_sweep: usize,
}

impl CrossStrategyLearner {
    pub fn new(cfg: LearningConfig) -> Self {
        let mut conditions: HashMap<StrategyId, HashMap<String, ConditionStat>> = HashMap::new();
        for &strategy in StrategyId::ALL.iter() {
            let seeded = strategy
                .optimal_conditions()
                .iter()
                .map(|c| {
                    (
                        c.to_string(),
                        ConditionStat {
                            successes: 1.0,
                            total: 2.0,
                        },
                    )
                })
                .collect();
            conditions.insert(strategy, seeded);
        }
        Self {
            cfg,
            performance: HashMap::new(),
            conditions,
            outcomes_since_sweep: 0,
        }
    }

    /// Blend directional correctness, scaled P&L, and a quick-exit bonus
    /// into a bandit reward in [0, 1].
    pub fn reward(outcome: &TradeOutcome) -> f64 {
        let correctness = if outcome.was_correct { 1.0 } else { 0.0 };
        let pnl_term = (outcome.pnl / 100.0).tanh() * 0.5;
        let hold_bonus = if outcome.hold_time_secs < HOLD_BONUS_SECS {
            0.1
        } else {
            0.0
        };
        (correctness + pnl_term + hold_bonus).clamp(0.0, 1.0)
    }

    /// Apply one realized outcome: full-strength update for the executed
    /// arm, similarity-scaled cross updates for the rest. Returns the
    /// executed arm's reward.
    pub fn record_outcome(
        &mut self,
        outcome: &TradeOutcome,
        ctx: &MarketContext,
        context_vec: &Array1<f64>,
        bandit: &BanditSelector,
    ) -> f64 {
        let reward = Self::reward(outcome);
        let executed = outcome.strategy;
        bandit.update(executed, context_vec, reward);

        self.performance
            .entry(executed)
            .or_default()
            .record(outcome.pnl, outcome.was_correct);

        let live_tags = ctx.condition_tags();
        self.update_conditions(executed, &live_tags, 1.0, outcome.was_correct);

        for &other in StrategyId::ALL.iter().filter(|&&s| s != executed) {
            let base = if outcome.was_correct {
                reward
            } else {
                1.0 - reward
            };
            let sim = similarity(other, executed, &live_tags);
            let cross = (base * sim).clamp(0.0, 1.0);
            bandit.update(other, context_vec, cross);
            self.update_conditions(
                other,
                &live_tags,
                self.cfg.cross_pollination_weight,
                outcome.was_correct,
            );
            debug!(
                executed = %executed,
                other = %other,
                sim,
                cross,
                "cross-strategy reward propagated"
            );
        }

        self.outcomes_since_sweep += 1;
        reward
    }

    fn update_conditions(
        &mut self,
        strategy: StrategyId,
        live_tags: &[&str],
        weight: f64,
        correct: bool,
    ) {
        let stats = self.conditions.entry(strategy).or_default();
        for tag in live_tags {
            stats.entry(tag.to_string()).or_default().add(weight, correct);
        }
    }

    pub fn needs_maintenance(&self) -> bool {
        self.outcomes_since_sweep >= self.cfg.maintenance_interval
    }

    /// Periodic sweep: prune failing conditions from weak strategies,
    /// reinforce the working conditions of strong ones, and copy the
    /// leader's proven conditions into everyone else at pollination weight.
    pub fn maintenance(&mut self) {
        self.outcomes_since_sweep = 0;

        for &strategy in StrategyId::ALL.iter() {
            let win_rate = self.win_rate(strategy);
            let Some(stats) = self.conditions.get_mut(&strategy) else {
                continue;
            };
            if win_rate < self.cfg.weak_win_rate {
                let before = stats.len();
                stats.retain(|_, s| s.total < 5.0 || s.success_rate() >= self.cfg.prune_success_floor);
                if stats.len() < before {
                    info!(
                        strategy = %strategy,
                        pruned = before - stats.len(),
                        "pruned failing conditions from weak strategy"
                    );
                }
            } else if win_rate > self.cfg.strong_win_rate {
                for stat in stats.values_mut().filter(|s| s.success_rate() > 0.5) {
                    stat.add(1.0, true);
                }
            }
        }

        if let Some(leader) = self.leader() {
            let shared: Vec<(String, f64)> = self
                .conditions
                .get(&leader)
                .map(|stats| {
                    stats
                        .iter()
                        .filter(|(_, s)| s.success_rate() > self.cfg.share_success_floor)
                        .map(|(tag, s)| (tag.clone(), s.success_rate()))
                        .collect()
                })
                .unwrap_or_default();
            if !shared.is_empty() {
                info!(leader = %leader, conditions = shared.len(), "leader sharing conditions");
            }
            for &other in StrategyId::ALL.iter().filter(|&&s| s != leader) {
                let stats = self.conditions.entry(other).or_default();
                for (tag, rate) in &shared {
                    let entry = stats.entry(tag.clone()).or_default();
                    entry.total += self.cfg.cross_pollination_weight;
                    entry.successes += self.cfg.cross_pollination_weight * rate;
                }
            }
        }
    }

    /// Best-performing traded strategy, if it clears the leader bar
    fn leader(&self) -> Option<StrategyId> {
        StrategyId::ALL
            .iter()
            .copied()
            .filter(|s| {
                self.performance
                    .get(s)
                    .map(|p| p.total_trades > 0)
                    .unwrap_or(false)
            })
            .map(|s| (s, self.win_rate(s)))
            .filter(|(_, wr)| *wr >= self.cfg.leader_win_rate)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(s, _)| s)
    }

    pub fn win_rate(&self, strategy: StrategyId) -> f64 {
        self.performance
            .get(&strategy)
            .map(|p| p.win_rate())
            .unwrap_or(0.5)
    }

    /// Win rate per strategy code, for snapshots and logging
    pub fn win_rates(&self) -> HashMap<String, f64> {
        StrategyId::ALL
            .iter()
            .map(|&s| (s.code().to_string(), self.win_rate(s)))
            .collect()
    }

    pub fn performance(&self, strategy: StrategyId) -> Option<&StrategyPerformance> {
        self.performance.get(&strategy)
    }

    pub fn condition_stats(&self, strategy: StrategyId) -> Option<&HashMap<String, ConditionStat>> {
        self.conditions.get(&strategy)
    }
}

/// Fraction of `other`'s profile that overlaps the executed strategy and the
/// live market, in [0, 1].
pub fn similarity(other: StrategyId, executed: StrategyId, live_tags: &[&str]) -> f64 {
    let other_opt = other.optimal_conditions();
    let exec_opt = executed.optimal_conditions();
    let other_win = other.time_windows();
    let exec_win = executed.time_windows();

    let opt_overlap = overlap(other_opt, |c| exec_opt.contains(&c));
    let window_overlap = if other_win.is_empty() {
        0.0
    } else {
        other_win.iter().filter(|&h| exec_win.contains(h)).count() as f64 / other_win.len() as f64
    };
    let live_overlap = overlap(other_opt, |c| live_tags.iter().any(|t| *t == c));

    0.4 * opt_overlap + 0.3 * window_overlap + 0.3 * live_overlap
}

fn overlap(conditions: &[&str], mut contains: impl FnMut(&str) -> bool) -> f64 {
    if conditions.is_empty() {
        return 0.0;
    }
    conditions.iter().filter(|c| contains(c)).count() as f64 / conditions.len() as f64
}
