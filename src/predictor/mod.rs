//! Price-direction predictor
//!
//! Model-backed when the store holds a deployed model, with a deterministic
//! EMA/RSI rule fallback. Predictor faults never propagate: any failure
//! degrades to Sideways at neutral confidence.

use std::sync::Arc;
use tracing::warn;

use crate::runtime::ModelStore;
use crate::types::{Bar, Direction, MarketContext, PricePrediction};

/// Fixed input dimension of the deployed price model; must match the
/// versioned feature schema checked by the validation gate.
pub const FEATURE_DIM: usize = 16;

/// Neutral probability reported for Sideways and on any predictor fault
pub const NEUTRAL_PROBABILITY: f64 = 0.55;

/// Cap on the rule fallback's directional probability
pub const MAX_RULE_PROBABILITY: f64 = 0.75;

const DEFAULT_HORIZON_MINUTES: u32 = 15;

pub struct DirectionPredictor {
    store: Arc<ModelStore>,
}

impl DirectionPredictor {
    pub fn new(store: Arc<ModelStore>) -> Self {
        Self { store }
    }

    pub fn predict(&self, ctx: &MarketContext, bars: &[Bar]) -> PricePrediction {
        if let Some(model) = self.store.current() {
            let features = price_feature_vector(ctx, bars);
            if model.input_dim() == features.len() {
                match model.run(&features) {
                    Ok(out) if out.len() >= 3 && out.iter().all(|v| v.is_finite()) => {
                        return self.from_model_output(&out, bars);
                    }
                    Ok(_) => warn!("price model returned unusable output, using rules"),
                    Err(e) => warn!("price model inference failed, using rules: {}", e),
                }
            } else {
                warn!(
                    "price model expects {} features, engine builds {}; using rules",
                    model.input_dim(),
                    features.len()
                );
            }
        }
        self.rule_fallback(ctx, bars)
    }

    fn from_model_output(&self, out: &[f64], bars: &[Bar]) -> PricePrediction {
        let probs = softmax(&out[..3]);
        let (idx, p) = probs
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap_or((2, NEUTRAL_PROBABILITY));
        let direction = match idx {
            0 => Direction::Up,
            1 => Direction::Down,
            _ => Direction::Sideways,
        };
        let probability = p.max(0.5);
        PricePrediction {
            direction,
            probability,
            expected_move: expected_move(direction, probability, atr(bars, 14)),
            horizon_minutes: DEFAULT_HORIZON_MINUTES,
        }
    }

    /// Deterministic EMA/RSI rule fallback over the recent bar window
    pub fn rule_fallback(&self, ctx: &MarketContext, bars: &[Bar]) -> PricePrediction {
        if bars.len() < 2 {
            return neutral_prediction();
        }
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let close = closes[closes.len() - 1];
        let prev_close = closes[closes.len() - 2];
        let ema_fast = ema(&closes, 20);
        let ema_slow = ema(&closes, 50);
        let bar_range = atr(bars, 14);
        if bar_range <= 0.0 || !close.is_finite() {
            return neutral_prediction();
        }

        let probability = (0.5 + (close - prev_close).abs() / bar_range).min(MAX_RULE_PROBABILITY);
        let uptrend = ema_fast > ema_slow && close > ema_fast && ctx.rsi <= 70.0;
        let downtrend = ema_fast < ema_slow && close < ema_fast && ctx.rsi >= 30.0;

        let (direction, probability) = if uptrend {
            (Direction::Up, probability)
        } else if downtrend {
            (Direction::Down, probability)
        } else {
            (Direction::Sideways, NEUTRAL_PROBABILITY)
        };

        PricePrediction {
            direction,
            probability,
            expected_move: expected_move(direction, probability, bar_range),
            horizon_minutes: DEFAULT_HORIZON_MINUTES,
        }
    }
}

fn neutral_prediction() -> PricePrediction {
    PricePrediction {
        direction: Direction::Sideways,
        probability: NEUTRAL_PROBABILITY,
        expected_move: 0.0,
        horizon_minutes: DEFAULT_HORIZON_MINUTES,
    }
}

fn expected_move(direction: Direction, probability: f64, atr: f64) -> f64 {
    direction.encoding() * atr * (2.0 * probability - 1.0)
}

/// Fixed-order feature vector for the deployed price model
pub fn price_feature_vector(ctx: &MarketContext, bars: &[Bar]) -> Vec<f64> {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let close = closes.last().copied().unwrap_or(ctx.price);
    let hour_angle = 2.0 * std::f64::consts::PI * ctx.hour as f64 / 24.0;
    let ema_fast = if closes.is_empty() { close } else { ema(&closes, 20) };
    let ema_slow = if closes.is_empty() { close } else { ema(&closes, 50) };
    let bar_range = atr(bars, 14);

    let ret = |back: usize| -> f64 {
        let n = closes.len();
        if n > back && closes[n - 1 - back] != 0.0 {
            closes[n - 1] / closes[n - 1 - back] - 1.0
        } else {
            0.0
        }
    };
    let (low_n, high_n) = bars.iter().fold((f64::MAX, f64::MIN), |(lo, hi), b| {
        (lo.min(b.low), hi.max(b.high))
    });
    let range_pos = if bars.is_empty() || high_n <= low_n {
        0.5
    } else {
        (close - low_n) / (high_n - low_n)
    };

    let mut features = vec![
        ctx.volatility * 100.0,
        ret(5),
        ctx.volume_ratio,
        if close > 0.0 { bar_range / close * 100.0 } else { 0.0 },
        ctx.trend_strength,
        ctx.rsi / 100.0,
        hour_angle.sin(),
        hour_angle.cos(),
        ctx.day_of_week as f64 / 6.0,
        if ema_fast > 0.0 { close / ema_fast - 1.0 } else { 0.0 },
        if ema_slow > 0.0 { close / ema_slow - 1.0 } else { 0.0 },
        range_pos,
        ret(1),
        ret(2),
        ret(3),
        ret(4),
    ];
    debug_assert_eq!(features.len(), FEATURE_DIM);
    for f in features.iter_mut() {
        if !f.is_finite() {
            *f = 0.0;
        }
    }
    features
}

/// Exponential moving average seeded with the first value; period is capped
/// at the window length.
pub fn ema(values: &[f64], period: usize) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let k = 2.0 / (period.max(1) as f64 + 1.0);
    values[1..]
        .iter()
        .fold(values[0], |acc, &v| v * k + acc * (1.0 - k))
}

/// Average true range over the most recent `period` bars
pub fn atr(bars: &[Bar], period: usize) -> f64 {
    if bars.len() < 2 {
        return 0.0;
    }
    let start = bars.len().saturating_sub(period + 1);
    let window = &bars[start..];
    let mut sum = 0.0;
    let mut count = 0usize;
    for pair in window.windows(2) {
        let (prev, bar) = (pair[0], pair[1]);
        let tr = (bar.high - bar.low)
            .max((bar.high - prev.close).abs())
            .max((bar.low - prev.close).abs());
        sum += tr;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Wilder-style RSI over the most recent `period` closes, 50.0 when flat or
/// under-sampled
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    if closes.len() < 2 {
        return 50.0;
    }
    let start = closes.len().saturating_sub(period + 1);
    let mut gains = 0.0;
    let mut losses = 0.0;
    for pair in closes[start..].windows(2) {
        let delta = pair[1] - pair[0];
        if delta >= 0.0 {
            gains += delta;
        } else {
            losses += -delta;
        }
    }
    if gains + losses <= 0.0 {
        return 50.0;
    }
    100.0 * gains / (gains + losses)
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

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(rsi: f64) -> MarketContext {
        MarketContext {
            symbol: "ES".to_string(),
            price: 5020.0,
            volatility: 0.01,
            volume_ratio: 1.0,
            rsi,
            trend_strength: 0.5,
            hour: 10,
            day_of_week: 2,
            ts: 0,
        }
    }

    fn rising_bars() -> Vec<Bar> {
        (0..5)
            .map(|i| {
                let close = 5000.0 + i as f64 * 5.0;
                Bar {
                    ts: i as i64 * 60_000,
                    open: close - 3.0,
                    high: close + 2.0,
                    low: close - 5.0,
                    close,
                    volume: 1000.0,
                }
            })
            .collect()
    }

    #[test]
    fn test_rising_closes_predict_up_with_capped_probability() {
        let bars = rising_bars();
        let store = Arc::new(ModelStore::empty());
        let predictor = DirectionPredictor::new(store);
        let pred = predictor.predict(&ctx(55.0), &bars);

        assert_eq!(pred.direction, Direction::Up);
        let delta = (bars[4].close - bars[3].close).abs();
        let expected = (0.5 + delta / atr(&bars, 14)).min(MAX_RULE_PROBABILITY);
        assert!((pred.probability - expected).abs() < 1e-12);
        assert!(pred.probability <= MAX_RULE_PROBABILITY);
    }

    #[test]
    fn test_overbought_uptrend_is_sideways() {
        let bars = rising_bars();
        let predictor = DirectionPredictor::new(Arc::new(ModelStore::empty()));
        let pred = predictor.predict(&ctx(75.0), &bars);
        assert_eq!(pred.direction, Direction::Sideways);
        assert_eq!(pred.probability, NEUTRAL_PROBABILITY);
    }

    #[test]
    fn test_falling_closes_predict_down() {
        let bars: Vec<Bar> = (0..5)
            .map(|i| {
                let close = 5000.0 - i as f64 * 5.0;
                Bar {
                    ts: i as i64 * 60_000,
                    open: close + 3.0,
                    high: close + 5.0,
                    low: close - 2.0,
                    close,
                    volume: 1000.0,
                }
            })
            .collect();
        let predictor = DirectionPredictor::new(Arc::new(ModelStore::empty()));
        let pred = predictor.predict(&ctx(45.0), &bars);
        assert_eq!(pred.direction, Direction::Down);
        assert!(pred.probability > 0.5);
    }

    #[test]
    fn test_too_few_bars_is_neutral() {
        let predictor = DirectionPredictor::new(Arc::new(ModelStore::empty()));
        let pred = predictor.predict(&ctx(50.0), &[]);
        assert_eq!(pred.direction, Direction::Sideways);
        assert_eq!(pred.probability, NEUTRAL_PROBABILITY);
    }

    #[test]
    fn test_feature_vector_shape_and_finiteness() {
        let features = price_feature_vector(&ctx(50.0), &rising_bars());
        assert_eq!(features.len(), FEATURE_DIM);
        assert!(features.iter().all(|f| f.is_finite()));
    }

    #[test]
    fn test_model_backed_prediction() {
        use crate::runtime::{LinearRuntime, LinearModelSpec, ModelRuntime};
        let dir = std::env::temp_dir().join("tradebrain_predictor_model");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        // Strong constant bias toward output 0 (Up)
        let spec = LinearModelSpec {
            version: 1,
            input_dim: FEATURE_DIM,
            weights: vec![vec![0.0; FEATURE_DIM]; 3],
            bias: vec![4.0, 0.0, 0.0],
        };
        let path = dir.join("m.json");
        std::fs::write(&path, serde_json::to_string(&spec).unwrap()).unwrap();

        let store = Arc::new(ModelStore::empty());
        store.replace(Some(LinearRuntime.load(&path).unwrap()));
        let predictor = DirectionPredictor::new(store);
        let pred = predictor.predict(&ctx(50.0), &rising_bars());
        assert_eq!(pred.direction, Direction::Up);
        assert!(pred.probability > 0.9);
    }
}
