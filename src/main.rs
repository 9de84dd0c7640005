//! TradeBrain demo runner
//!
//! Loads configuration, builds the decision engine, and walks it through a
//! short synthetic session so the full pipeline (selection, prediction,
//! sizing, learning feedback, EOD snapshot) can be exercised end to end
//! without a market connection.

use anyhow::Result;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use tradebrain::config::AppConfig;
use tradebrain::engine::tasks::CancelToken;
use tradebrain::engine::DecisionEngine;
use tradebrain::types::{Bar, PriceLevels, SessionEnv, TradeOutcome};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into())),
        )
        .init();

    let cfg = AppConfig::load()?;
    info!("starting tradebrain: {}", cfg.digest());

    let engine = DecisionEngine::new(cfg);
    let cancel = CancelToken::never();
    let levels = PriceLevels {
        support: 4_980.0,
        resistance: 5_060.0,
        pivot: 5_020.0,
    };

    // synthetic trending session: sixty 1-minute bars drifting upward
    let bars = synthetic_bars(60, 5_000.0, 0.75);
    let env = SessionEnv::live(1.2);

    for symbol in ["ES", "NQ"] {
        let decision = engine
            .make_decision(symbol, &env, &levels, &bars, &cancel)
            .await;
        info!(
            symbol,
            strategy = %decision.strategy,
            direction = %decision.direction,
            contracts = decision.contracts,
            confidence = decision.confidence,
            "decision"
        );

        if decision.contracts > 0 {
            engine.learn_from_result(&TradeOutcome {
                symbol: symbol.to_string(),
                strategy: decision.strategy,
                pnl: 125.0,
                was_correct: true,
                hold_time_secs: 900,
            });
        }
    }

    engine.flush_tasks().await;
    let path = engine.end_of_day(&env)?;
    info!(snapshot = %path.display(), "eod snapshot written");

    let stats = engine.stats();
    info!(
        decisions = stats.decisions,
        fallbacks = stats.fallbacks,
        outcomes = stats.outcomes,
        avg_decision_micros = stats.avg_decision_micros,
        "session complete"
    );
    for arm in stats.arms {
        info!(strategy = %arm.strategy, pulls = arm.pulls, mean_reward = arm.mean_reward, "arm");
    }
    Ok(())
}

fn synthetic_bars(count: usize, start: f64, drift: f64) -> Vec<Bar> {
    (0..count)
        .map(|i| {
            let close = start + i as f64 * drift;
            Bar {
                ts: 1_709_540_000_000 + i as i64 * 60_000,
                open: close - drift / 2.0,
                high: close + 1.5,
                low: close - 1.5,
                close,
                volume: 1_200.0,
            }
        })
        .collect()
}
