//! Decision publication boundary
//!
//! The engine never talks to a broker or message bus directly; finished
//! decisions go through an injected sink. Production wires a real transport,
//! tests wire a recorder.

use async_trait::async_trait;
use tracing::info;

use crate::types::Decision;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DecisionSink: Send + Sync {
    async fn publish(&self, decision: &Decision) -> anyhow::Result<()>;
}

/// Logs each decision and drops it
pub struct LogSink;

#[async_trait]
impl DecisionSink for LogSink {
    async fn publish(&self, decision: &Decision) -> anyhow::Result<()> {
        info!(
            id = %decision.id,
            symbol = %decision.symbol,
            strategy = %decision.strategy,
            direction = %decision.direction,
            contracts = decision.contracts,
            confidence = decision.confidence,
            regime = %decision.regime,
            "decision published"
        );
        Ok(())
    }
}

/// Test sink that records everything it receives
pub struct RecordingSink {
    pub decisions: std::sync::Mutex<Vec<Decision>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            decisions: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DecisionSink for RecordingSink {
    async fn publish(&self, decision: &Decision) -> anyhow::Result<()> {
        self.decisions
            .lock()
            .map_err(|e| anyhow::anyhow!("recording sink poisoned: {}", e))?
            .push(decision.clone());
        Ok(())
    }
}
