//! Core types used throughout TradeBrain
//!
//! Defines common data structures for bars, contexts, predictions and decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::strategy::StrategyId;

/// Supported futures instruments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Instrument {
    ES,
    NQ,
    MES,
    MNQ,
}

impl Default for Instrument {
    fn default() -> Self {
        Instrument::ES
    }
}

impl Instrument {
    /// Dollar value of one point of movement per contract
    pub fn point_value(&self) -> f64 {
        match self {
            Instrument::ES => 50.0,
            Instrument::NQ => 20.0,
            Instrument::MES => 5.0,
            Instrument::MNQ => 2.0,
        }
    }

    /// Minimum stop distance in points used when ATR is tighter
    pub fn stop_floor(&self) -> f64 {
        match self {
            Instrument::ES | Instrument::MES => 10.0,
            Instrument::NQ | Instrument::MNQ => 25.0,
        }
    }

    /// Parse from a symbol string, defaulting unknown roots to ES
    pub fn from_symbol(symbol: &str) -> Self {
        match symbol.to_uppercase().as_str() {
            s if s.starts_with("MNQ") => Instrument::MNQ,
            s if s.starts_with("MES") => Instrument::MES,
            s if s.starts_with("NQ") => Instrument::NQ,
            _ => Instrument::ES,
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instrument::ES => write!(f, "ES"),
            Instrument::NQ => write!(f, "NQ"),
            Instrument::MES => write!(f, "MES"),
            Instrument::MNQ => write!(f, "MNQ"),
        }
    }
}

/// Predicted price direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
    Sideways,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Sideways
    }
}

impl Direction {
    /// Signed encoding used in feature vectors
    pub fn encoding(&self) -> f64 {
        match self {
            Direction::Up => 1.0,
            Direction::Down => -1.0,
            Direction::Sideways => 0.0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "UP"),
            Direction::Down => write!(f, "DOWN"),
            Direction::Sideways => write!(f, "SIDEWAYS"),
        }
    }
}

/// Market regime classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    CalmTrend,
    CalmChop,
    HighVolTrend,
    HighVolChop,
}

impl Regime {
    /// Classify from realized volatility and trend strength
    pub fn from_metrics(volatility: f64, trend_strength: f64) -> Self {
        let high_vol = volatility >= 0.015;
        let trending = trend_strength.abs() >= 0.5;
        match (high_vol, trending) {
            (false, true) => Regime::CalmTrend,
            (false, false) => Regime::CalmChop,
            (true, true) => Regime::HighVolTrend,
            (true, false) => Regime::HighVolChop,
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Regime::CalmTrend => write!(f, "Calm-Trend"),
            Regime::CalmChop => write!(f, "Calm-Chop"),
            Regime::HighVolTrend => write!(f, "HighVol-Trend"),
            Regime::HighVolChop => write!(f, "HighVol-Chop"),
        }
    }
}

/// One OHLCV bar
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bar {
    /// Bar close timestamp in milliseconds
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Key price levels supplied by the caller
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PriceLevels {
    pub support: f64,
    pub resistance: f64,
    pub pivot: f64,
}

/// Session environment for a decision. The clock is injected so replay and
/// live invocations produce identical decisions.
#[derive(Debug, Clone)]
pub struct SessionEnv {
    pub now: DateTime<Utc>,
    /// Current volume relative to a session baseline (1.0 = typical)
    pub volume_ratio: f64,
}

impl SessionEnv {
    pub fn live(volume_ratio: f64) -> Self {
        Self {
            now: Utc::now(),
            volume_ratio,
        }
    }
}

/// Immutable per-decision market snapshot, retained keyed by symbol for
/// later learning calls (single-owner overwrite semantics).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketContext {
    pub symbol: String,
    pub price: f64,
    /// Realized volatility as a fraction of price
    pub volatility: f64,
    pub volume_ratio: f64,
    pub rsi: f64,
    /// Signed trend slope normalized to roughly [-1, 1]
    pub trend_strength: f64,
    /// UTC hour of day
    pub hour: u32,
    /// 0 = Monday .. 6 = Sunday
    pub day_of_week: u32,
    pub ts: i64,
}

impl MarketContext {
    /// Named condition tags describing the live market, matched against each
    /// strategy's specialization set by the cross-learning loop.
    pub fn condition_tags(&self) -> Vec<&'static str> {
        let mut tags = Vec::with_capacity(5);
        if self.volatility >= 0.015 {
            tags.push("high_volatility");
        } else {
            tags.push("low_volatility");
        }
        if self.trend_strength.abs() >= 0.5 {
            tags.push("trending");
        } else {
            tags.push("ranging");
        }
        if self.volume_ratio >= 1.3 {
            tags.push("high_volume");
        }
        if self.volatility >= 0.012 && self.trend_strength.abs() >= 0.3 {
            tags.push("breakout");
        }
        tags.push(match self.hour {
            9 | 10 => "morning",
            11..=15 => "afternoon",
            _ => "overnight",
        });
        tags
    }
}

/// Bandit output for one decision. Ephemeral.
#[derive(Debug, Clone)]
pub struct StrategySelection {
    pub strategy: StrategyId,
    pub confidence: f64,
    pub exploration: f64,
    pub reasoning: String,
}

/// Price-direction prediction. Ephemeral.
#[derive(Debug, Clone)]
pub struct PricePrediction {
    pub direction: Direction,
    /// Probability in [0.5, 1.0]
    pub probability: f64,
    /// Expected move in points over the horizon
    pub expected_move: f64,
    pub horizon_minutes: u32,
}

/// Order side of a candidate proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// One candidate trade proposal from a strategy generator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSignal {
    pub side: Side,
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
    pub qty: u32,
    pub score: f64,
}

/// Auditable decision aggregate. Immutable once built; appended to the
/// decision history used for retraining triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub symbol: String,
    pub strategy: StrategyId,
    pub confidence: f64,
    pub direction: Direction,
    pub contracts: u32,
    pub regime: Regime,
    pub candidates: Vec<CandidateSignal>,
    pub decided_at: DateTime<Utc>,
    pub risk_assessment: String,
}

/// Realized trade outcome fed back into the learning loop
#[derive(Debug, Clone)]
pub struct TradeOutcome {
    pub symbol: String,
    pub strategy: StrategyId,
    pub pnl: f64,
    pub was_correct: bool,
    pub hold_time_secs: i64,
}

/// One replay-buffer entry for the RL sizing policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    pub state: Vec<f64>,
    pub action: usize,
    pub reward: f64,
    pub next_state: Vec<f64>,
    pub done: bool,
    pub value_estimate: f64,
}
