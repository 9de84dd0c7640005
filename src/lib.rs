//! TradeBrain Library
//!
//! Unified ML/RL decision engine for ES/NQ futures trading

pub mod bandit;
pub mod config;
pub mod engine;
pub mod learning;
pub mod persistence;
pub mod predictor;
pub mod risk;
pub mod runtime;
pub mod sizing;
pub mod strategy;
pub mod types;
pub mod validation;
