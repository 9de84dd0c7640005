//! Strategy identities, trading schedule and candidate generation
//!
//! Strategies are a closed enum with fixed specialization tags; the bodies of
//! the individual signal generators are pluggable collaborators behind the
//! [`CandidateGenerator`] trait.

pub mod schedule;

pub use schedule::TradingSchedule;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::types::{Bar, CandidateSignal, MarketContext, PriceLevels, Side};

/// The fixed primary strategy set.
///
/// Codes carry over from the production naming (S2/S3/S6/S11) so persisted
/// data stays comparable across ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyId {
    /// S2 - fades extensions back to value in quiet two-sided trade
    MeanReversion,
    /// S3 - trades range compression resolving into expansion
    CompressionBreakout,
    /// S6 - rides the opening drive off the cash open
    OpeningDrive,
    /// S11 - high-frequency scalps in liquid hours
    FrequentScalp,
}

impl StrategyId {
    pub const ALL: [StrategyId; 4] = [
        StrategyId::MeanReversion,
        StrategyId::CompressionBreakout,
        StrategyId::OpeningDrive,
        StrategyId::FrequentScalp,
    ];

    /// Stable string code used in logs, CSV exports and persisted state
    pub fn code(&self) -> &'static str {
        match self {
            StrategyId::MeanReversion => "S2",
            StrategyId::CompressionBreakout => "S3",
            StrategyId::OpeningDrive => "S6",
            StrategyId::FrequentScalp => "S11",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "S2" => Some(StrategyId::MeanReversion),
            "S3" => Some(StrategyId::CompressionBreakout),
            "S6" => Some(StrategyId::OpeningDrive),
            "S11" => Some(StrategyId::FrequentScalp),
            _ => None,
        }
    }

    /// Dense index for arrays keyed by strategy
    pub fn index(&self) -> usize {
        match self {
            StrategyId::MeanReversion => 0,
            StrategyId::CompressionBreakout => 1,
            StrategyId::OpeningDrive => 2,
            StrategyId::FrequentScalp => 3,
        }
    }

    /// Market conditions this strategy specializes in
    pub fn optimal_conditions(&self) -> &'static [&'static str] {
        match self {
            StrategyId::MeanReversion => &["ranging", "low_volatility"],
            StrategyId::CompressionBreakout => &["breakout", "high_volatility", "trending"],
            StrategyId::OpeningDrive => &["trending", "high_volume", "morning"],
            StrategyId::FrequentScalp => &["high_volume", "ranging"],
        }
    }

    /// UTC hours this strategy is specialized for
    pub fn time_windows(&self) -> &'static [u32] {
        match self {
            StrategyId::MeanReversion => &[11, 12, 13, 14],
            StrategyId::CompressionBreakout => &[10, 11, 15],
            StrategyId::OpeningDrive => &[9, 10],
            StrategyId::FrequentScalp => &[9, 10, 11, 12, 13, 14, 15],
        }
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Pluggable candidate-proposal generator for one strategy.
///
/// Implementations return zero or more trade proposals; the engine never
/// inspects how they were produced.
pub trait CandidateGenerator: Send + Sync {
    fn generate(
        &self,
        ctx: &MarketContext,
        levels: &PriceLevels,
        bars: &[Bar],
    ) -> Vec<CandidateSignal>;
}

/// Baseline pivot-bracket generator. Used both as the default slot filler and
/// as the unmodified generator behind fallback decisions.
pub struct BaseGenerator;

impl CandidateGenerator for BaseGenerator {
    fn generate(
        &self,
        ctx: &MarketContext,
        levels: &PriceLevels,
        _bars: &[Bar],
    ) -> Vec<CandidateSignal> {
        if ctx.price <= 0.0 {
            return Vec::new();
        }
        let pivot = if levels.pivot > 0.0 {
            levels.pivot
        } else {
            ctx.price
        };
        let stop_dist = (ctx.price * ctx.volatility).max(ctx.price * 0.001);
        let side = if ctx.price >= pivot {
            Side::Buy
        } else {
            Side::Sell
        };
        let sign = if side == Side::Buy { 1.0 } else { -1.0 };
        vec![CandidateSignal {
            side,
            entry: ctx.price,
            stop: ctx.price - sign * stop_dist,
            target: ctx.price + sign * stop_dist * 2.0,
            qty: 1,
            score: 0.5,
        }]
    }
}

/// Generator registry with compile-time-exhaustive strategy dispatch
pub struct GeneratorSet {
    slots: [Arc<dyn CandidateGenerator>; StrategyId::ALL.len()],
    base: Arc<dyn CandidateGenerator>,
}

impl GeneratorSet {
    pub fn new() -> Self {
        let base: Arc<dyn CandidateGenerator> = Arc::new(BaseGenerator);
        Self {
            slots: [base.clone(), base.clone(), base.clone(), base.clone()],
            base,
        }
    }

    /// Install a generator for one strategy slot
    pub fn set(&mut self, id: StrategyId, generator: Arc<dyn CandidateGenerator>) {
        self.slots[id.index()] = generator;
    }

    pub fn for_strategy(&self, id: StrategyId) -> &Arc<dyn CandidateGenerator> {
        &self.slots[id.index()]
    }

    /// The unmodified base generator, used by fallback decisions
    pub fn base(&self) -> &Arc<dyn CandidateGenerator> {
        &self.base
    }
}

impl Default for GeneratorSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_roundtrip() {
        for id in StrategyId::ALL {
            assert_eq!(StrategyId::from_code(id.code()), Some(id));
        }
        assert_eq!(StrategyId::from_code("S99"), None);
    }

    #[test]
    fn test_indices_are_dense() {
        for (i, id) in StrategyId::ALL.iter().enumerate() {
            assert_eq!(id.index(), i);
        }
    }

    #[test]
    fn test_base_generator_brackets_price() {
        let ctx = MarketContext {
            symbol: "ES".to_string(),
            price: 5000.0,
            volatility: 0.01,
            volume_ratio: 1.0,
            rsi: 50.0,
            trend_strength: 0.0,
            hour: 10,
            day_of_week: 2,
            ts: 0,
        };
        let levels = PriceLevels {
            support: 4950.0,
            resistance: 5050.0,
            pivot: 4990.0,
        };
        let candidates = BaseGenerator.generate(&ctx, &levels, &[]);
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.side, Side::Buy);
        assert!(c.stop < c.entry);
        assert!(c.target > c.entry);
    }
}
