//! Account risk state machine
//!
//! Tracks daily P&L, trailing drawdown, and account balance against evaluated
//! account limits. Every decision pass runs `check` first; a HardStop verdict
//! forces a flat decision regardless of model output.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RiskLimits;

/// Outcome of a pre-decision risk check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RiskVerdict {
    Normal,
    Warning(String),
    HardStop(String),
}

impl RiskVerdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, RiskVerdict::HardStop(_))
    }
}

/// Immutable view of the account state at decision time
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub daily_pnl: f64,
    pub drawdown: f64,
    pub balance: f64,
}

impl RiskSnapshot {
    /// Drawdown used as a fraction of the maximum allowed, clamped to [0, 1]
    pub fn drawdown_ratio(&self, limits: &RiskLimits) -> f64 {
        (self.drawdown / limits.max_drawdown).clamp(0.0, 1.0)
    }

    /// Daily P&L as a signed fraction of the daily loss limit, in [-1, 1]
    pub fn pnl_ratio(&self, limits: &RiskLimits) -> f64 {
        (self.daily_pnl / limits.daily_loss_limit).clamp(-1.0, 1.0)
    }

    /// Balance relative to the starting account size
    pub fn balance_ratio(&self, limits: &RiskLimits) -> f64 {
        if limits.account_size > 0.0 {
            self.balance / limits.account_size
        } else {
            1.0
        }
    }
}

pub struct RiskStateMachine {
    limits: RiskLimits,
    daily_pnl: f64,
    drawdown: f64,
    balance: f64,
    last_reset: NaiveDate,
}

impl RiskStateMachine {
    pub fn new(limits: RiskLimits) -> Self {
        let balance = limits.account_size;
        Self {
            limits,
            daily_pnl: 0.0,
            drawdown: 0.0,
            balance,
            last_reset: NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default(),
        }
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        RiskSnapshot {
            daily_pnl: self.daily_pnl,
            drawdown: self.drawdown,
            balance: self.balance,
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Roll the daily counters when the session date advances. Daily P&L
    /// and drawdown both reset to zero; balance carries across days.
    pub fn roll_daily(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today > self.last_reset {
            if self.last_reset.year() > 1970 {
                info!(
                    date = %self.last_reset,
                    daily_pnl = self.daily_pnl,
                    drawdown = self.drawdown,
                    "daily risk counters reset"
                );
            }
            self.daily_pnl = 0.0;
            self.drawdown = 0.0;
            self.last_reset = today;
        }
    }

    /// Apply a realized trade P&L. Drawdown ratchets to the worst net daily
    /// loss seen so far: `max(drawdown, |daily_pnl|)` while the day is net
    /// negative. Intraday recovery never reduces it; only the daily roll
    /// clears it.
    pub fn apply_pnl(&mut self, pnl: f64) {
        self.daily_pnl += pnl;
        self.balance += pnl;
        if self.daily_pnl < 0.0 {
            self.drawdown = self.drawdown.max(-self.daily_pnl);
        }
    }

    /// Evaluate account limits in fixed order: daily roll, trailing stop
    /// floor, max drawdown, daily loss limit, then the warning band.
    pub fn check(&mut self, now: DateTime<Utc>) -> RiskVerdict {
        self.roll_daily(now);

        if self.balance <= self.limits.trailing_stop_floor {
            let reason = format!(
                "balance {:.2} at or below trailing stop floor {:.2}",
                self.balance, self.limits.trailing_stop_floor
            );
            warn!("{}", reason);
            return RiskVerdict::HardStop(reason);
        }
        if self.drawdown >= self.limits.max_drawdown {
            let reason = format!(
                "drawdown {:.2} at or above maximum {:.2}",
                self.drawdown, self.limits.max_drawdown
            );
            warn!("{}", reason);
            return RiskVerdict::HardStop(reason);
        }
        if self.daily_pnl <= -self.limits.daily_loss_limit {
            let reason = format!(
                "daily loss {:.2} at or beyond limit {:.2}",
                self.daily_pnl, self.limits.daily_loss_limit
            );
            warn!("{}", reason);
            return RiskVerdict::HardStop(reason);
        }

        let warning_floor = -self.limits.daily_loss_limit * self.limits.warning_ratio;
        if self.daily_pnl <= warning_floor {
            let reason = format!(
                "daily loss {:.2} past {:.0}% of limit {:.2}",
                self.daily_pnl,
                self.limits.warning_ratio * 100.0,
                self.limits.daily_loss_limit
            );
            return RiskVerdict::Warning(reason);
        }
        RiskVerdict::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn limits() -> RiskLimits {
        RiskLimits::default()
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_fresh_account_is_normal() {
        let mut risk = RiskStateMachine::new(limits());
        assert_eq!(risk.check(at(2024, 3, 4, 14)), RiskVerdict::Normal);
    }

    #[test]
    fn test_daily_loss_limit_hard_stops() {
        let mut risk = RiskStateMachine::new(limits());
        risk.roll_daily(at(2024, 3, 4, 14));
        risk.apply_pnl(-1_000.0);
        assert!(risk.check(at(2024, 3, 4, 15)).is_blocked());
    }

    #[test]
    fn test_warning_band_at_ninety_percent() {
        let mut risk = RiskStateMachine::new(limits());
        risk.roll_daily(at(2024, 3, 4, 14));
        risk.apply_pnl(-900.0);
        match risk.check(at(2024, 3, 4, 15)) {
            RiskVerdict::Warning(_) => {}
            other => panic!("expected warning, got {:?}", other),
        }
    }

    #[test]
    fn test_daily_roll_clears_pnl_and_drawdown() {
        let mut risk = RiskStateMachine::new(limits());
        risk.roll_daily(at(2024, 3, 4, 14));
        risk.apply_pnl(-900.0);
        assert_eq!(risk.snapshot().drawdown, 900.0);
        let verdict = risk.check(at(2024, 3, 5, 14));
        assert_eq!(verdict, RiskVerdict::Normal);
        let snap = risk.snapshot();
        assert_eq!(snap.daily_pnl, 0.0);
        assert_eq!(snap.drawdown, 0.0);
        assert_eq!(snap.balance, 49_100.0);
    }

    #[test]
    fn test_drawdown_is_worst_net_daily_loss() {
        let mut risk = RiskStateMachine::new(limits());
        risk.roll_daily(at(2024, 3, 4, 14));
        risk.apply_pnl(300.0);
        risk.apply_pnl(-400.0);
        // net -100 on the day, not the per-trade loss of 400
        assert_eq!(risk.snapshot().drawdown, 100.0);
        risk.apply_pnl(-400.0);
        assert_eq!(risk.snapshot().drawdown, 500.0);
    }

    #[test]
    fn test_drawdown_not_reduced_by_intraday_recovery() {
        let mut risk = RiskStateMachine::new(limits());
        risk.roll_daily(at(2024, 3, 4, 14));
        risk.apply_pnl(-500.0);
        risk.apply_pnl(300.0);
        assert_eq!(risk.snapshot().drawdown, 500.0);
        risk.apply_pnl(400.0);
        // day back to net positive, the ratchet still holds
        assert_eq!(risk.snapshot().drawdown, 500.0);
    }

    #[test]
    fn test_trailing_stop_floor() {
        let mut risk = RiskStateMachine::new(limits());
        risk.roll_daily(at(2024, 3, 4, 14));
        risk.apply_pnl(-600.0);
        let v = risk.check(at(2024, 3, 5, 14));
        assert_eq!(v, RiskVerdict::Normal);
        risk.apply_pnl(-600.0);
        let v = risk.check(at(2024, 3, 6, 14));
        assert_eq!(v, RiskVerdict::Normal);
        risk.apply_pnl(-900.0);
        // balance 50_000 - 2_100 = 47_900 < 48_000 floor
        assert!(risk.check(at(2024, 3, 7, 14)).is_blocked());
    }

    #[test]
    fn test_max_drawdown_hard_stops() {
        // relax the other limits so the drawdown check is the one that fires
        let mut lim = limits();
        lim.trailing_stop_floor = 0.0;
        lim.daily_loss_limit = 5_000.0;
        let mut risk = RiskStateMachine::new(lim);
        risk.roll_daily(at(2024, 3, 4, 14));
        risk.apply_pnl(-1_999.0);
        assert!(!risk.check(at(2024, 3, 4, 15)).is_blocked());
        risk.apply_pnl(-1.0);
        match risk.check(at(2024, 3, 4, 16)) {
            RiskVerdict::HardStop(reason) => assert!(reason.contains("drawdown")),
            other => panic!("expected hard stop, got {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_ratios() {
        let mut risk = RiskStateMachine::new(limits());
        risk.roll_daily(at(2024, 3, 4, 14));
        risk.apply_pnl(-500.0);
        let snap = risk.snapshot();
        let lim = limits();
        assert!((snap.drawdown_ratio(&lim) - 0.25).abs() < 1e-12);
        assert!((snap.pnl_ratio(&lim) + 0.5).abs() < 1e-12);
        assert!((snap.balance_ratio(&lim) - 0.99).abs() < 1e-12);
    }
}
