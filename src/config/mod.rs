//! Configuration management for TradeBrain
//!
//! Loads from an optional config file + environment variables via .env.
//! Risk constants carry the production values and must stay byte-for-byte
//! identical across ports for behavioral equivalence.

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub risk: RiskLimits,
    pub bandit: BanditConfig,
    pub sizing: SizingConfig,
    pub learning: LearningConfig,
    pub validation: ValidationConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Engine version tag for logging and exports
    pub tag: String,
    /// Bounded decision history length
    pub history_cap: usize,
    /// Replay-buffer size that triggers an async RL training pass
    pub rl_train_buffer: usize,
    /// Minimum seconds between RL training passes
    pub rl_train_interval_secs: u64,
    /// Bounded background task queue capacity
    pub task_queue_capacity: usize,
    /// Current price-model file path (swap target for hot reload)
    pub model_path: String,
}

/// Hard compliance limits. Values are the funded-account program constants.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskLimits {
    pub account_size: f64,
    pub daily_loss_limit: f64,
    pub max_drawdown: f64,
    pub trailing_stop_floor: f64,
    /// Fraction of balance risked per trade
    pub risk_per_trade: f64,
    /// Minimum confidence to size a position
    pub confidence_threshold: f64,
    /// Fraction of the daily loss limit that raises a warning
    pub warning_ratio: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            account_size: 50_000.0,
            daily_loss_limit: 1_000.0,
            max_drawdown: 2_000.0,
            trailing_stop_floor: 48_000.0,
            risk_per_trade: 0.01,
            confidence_threshold: 0.65,
            warning_ratio: 0.9,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BanditConfig {
    pub exploration_bonus: f64,
    pub learning_rate: f64,
    /// Temperature for sigmoid confidence scaling
    pub confidence_temp: f64,
    /// Confidence reported by the static hour-keyed fallback arm
    pub fallback_confidence: f64,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            exploration_bonus: 0.3,
            learning_rate: 0.1,
            confidence_temp: 2.0,
            fallback_confidence: 0.55,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SizingConfig {
    /// Drawdown (dollars) below which the full 3-contract ceiling applies
    pub low_drawdown_usd: f64,
    /// Drawdown (dollars) below which a 2-contract ceiling applies
    pub moderate_drawdown_usd: f64,
    /// Force-allocate 1 contract when sizing rounds to zero but risk budget
    /// and confidence both clear. Off by default.
    pub bootstrap_single_contract: bool,
    /// Samples required before the confidence scorer is trained
    pub scorer_min_samples: usize,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            low_drawdown_usd: 500.0,
            moderate_drawdown_usd: 1_000.0,
            bootstrap_single_contract: false,
            scorer_min_samples: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LearningConfig {
    /// Weight applied to cross-pollinated condition updates
    pub cross_pollination_weight: f64,
    /// Outcomes between background maintenance sweeps
    pub maintenance_interval: usize,
    /// Conditions below this success rate are pruned from weak strategies
    pub prune_success_floor: f64,
    /// Win rate below which a strategy is considered weak
    pub weak_win_rate: f64,
    /// Win rate above which a strategy's conditions are strengthened
    pub strong_win_rate: f64,
    /// Minimum win rate for the best strategy to share its conditions
    pub leader_win_rate: f64,
    /// Success rate a condition needs before the leader shares it
    pub share_success_floor: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            cross_pollination_weight: 0.1,
            maintenance_interval: 25,
            prune_success_floor: 0.3,
            weak_win_rate: 0.4,
            strong_win_rate: 0.7,
            leader_win_rate: 0.6,
            share_success_floor: 0.7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    /// Directory for sanity/historical vector caches and the feature schema
    pub data_dir: String,
    /// Directory for timestamped model backups
    pub backup_dir: String,
    pub sanity_vector_count: usize,
    pub historical_vector_count: usize,
    pub max_total_variation: f64,
    pub max_kl_divergence: f64,
    /// Maximum allowed new/old replay drawdown ratio
    pub max_drawdown_ratio: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data/validation".to_string(),
            backup_dir: "./data/models/backups".to_string(),
            sanity_vector_count: 20,
            historical_vector_count: 100,
            max_total_variation: 0.20,
            max_kl_divergence: 0.25,
            max_drawdown_ratio: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory for EOD snapshots and training exports
    pub data_dir: String,
    /// Decisions between training-data export flushes
    pub export_flush_interval: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            export_flush_interval: 50,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tag: env!("CARGO_PKG_VERSION").to_string(),
            history_cap: 512,
            rl_train_buffer: 256,
            rl_train_interval_secs: 300,
            task_queue_capacity: 64,
            model_path: "./data/models/price_model.json".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            risk: RiskLimits::default(),
            bandit: BanditConfig::default(),
            sizing: SizingConfig::default(),
            learning: LearningConfig::default(),
            validation: ValidationConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Engine defaults
            .set_default("engine.tag", env!("CARGO_PKG_VERSION"))?
            .set_default("engine.history_cap", 512)?
            .set_default("engine.rl_train_buffer", 256)?
            .set_default("engine.rl_train_interval_secs", 300)?
            .set_default("engine.task_queue_capacity", 64)?
            .set_default("engine.model_path", "./data/models/price_model.json")?
            // Risk defaults (funded-account program constants)
            .set_default("risk.account_size", 50_000.0)?
            .set_default("risk.daily_loss_limit", 1_000.0)?
            .set_default("risk.max_drawdown", 2_000.0)?
            .set_default("risk.trailing_stop_floor", 48_000.0)?
            .set_default("risk.risk_per_trade", 0.01)?
            .set_default("risk.confidence_threshold", 0.65)?
            .set_default("risk.warning_ratio", 0.9)?
            // Bandit defaults
            .set_default("bandit.exploration_bonus", 0.3)?
            .set_default("bandit.learning_rate", 0.1)?
            .set_default("bandit.confidence_temp", 2.0)?
            .set_default("bandit.fallback_confidence", 0.55)?
            // Sizing defaults
            .set_default("sizing.low_drawdown_usd", 500.0)?
            .set_default("sizing.moderate_drawdown_usd", 1_000.0)?
            .set_default("sizing.bootstrap_single_contract", false)?
            .set_default("sizing.scorer_min_samples", 30)?
            // Learning defaults
            .set_default("learning.cross_pollination_weight", 0.1)?
            .set_default("learning.maintenance_interval", 25)?
            .set_default("learning.prune_success_floor", 0.3)?
            .set_default("learning.weak_win_rate", 0.4)?
            .set_default("learning.strong_win_rate", 0.7)?
            .set_default("learning.leader_win_rate", 0.6)?
            .set_default("learning.share_success_floor", 0.7)?
            // Validation defaults
            .set_default("validation.data_dir", "./data/validation")?
            .set_default("validation.backup_dir", "./data/models/backups")?
            .set_default("validation.sanity_vector_count", 20)?
            .set_default("validation.historical_vector_count", 100)?
            .set_default("validation.max_total_variation", 0.20)?
            .set_default("validation.max_kl_divergence", 0.25)?
            .set_default("validation.max_drawdown_ratio", 2.0)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.export_flush_interval", 50)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (TRADEBRAIN_*)
            .add_source(Environment::with_prefix("TRADEBRAIN").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "engine={} dll={:.0} max_dd={:.0} floor={:.0} conf_thresh={:.2}",
            self.engine.tag,
            self.risk.daily_loss_limit,
            self.risk.max_drawdown,
            self.risk.trailing_stop_floor,
            self.risk.confidence_threshold
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_preserve_program_constants() {
        let cfg = AppConfig::load().expect("defaults must load");
        assert_eq!(cfg.risk.account_size, 50_000.0);
        assert_eq!(cfg.risk.daily_loss_limit, 1_000.0);
        assert_eq!(cfg.risk.max_drawdown, 2_000.0);
        assert_eq!(cfg.risk.trailing_stop_floor, 48_000.0);
        assert_eq!(cfg.risk.risk_per_trade, 0.01);
        assert_eq!(cfg.risk.confidence_threshold, 0.65);
        assert_eq!(cfg.bandit.exploration_bonus, 0.3);
        assert!(!cfg.sizing.bootstrap_single_contract);
    }
}
