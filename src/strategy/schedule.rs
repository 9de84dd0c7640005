//! Hour-of-day trading schedule
//!
//! Maps each UTC hour to the strategy set eligible to trade in it, plus the
//! static default arm used when the bandit cannot be consulted. The table
//! mirrors the production schedule.

use serde::{Deserialize, Serialize};

use super::StrategyId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSchedule {
    hours: Vec<ScheduleSlot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScheduleSlot {
    eligible: Vec<StrategyId>,
    default_arm: StrategyId,
}

impl Default for TradingSchedule {
    fn default() -> Self {
        let slot = |eligible: &[StrategyId], default_arm: StrategyId| ScheduleSlot {
            eligible: eligible.to_vec(),
            default_arm,
        };
        let mut hours = Vec::with_capacity(24);
        for hour in 0u32..24 {
            hours.push(match hour {
                // Cash open: opening drive leads, scalper may participate
                9 => slot(
                    &[StrategyId::OpeningDrive, StrategyId::FrequentScalp],
                    StrategyId::OpeningDrive,
                ),
                10 => slot(
                    &[
                        StrategyId::CompressionBreakout,
                        StrategyId::OpeningDrive,
                        StrategyId::FrequentScalp,
                    ],
                    StrategyId::CompressionBreakout,
                ),
                // Midday two-sided trade
                11..=13 => slot(
                    &[StrategyId::MeanReversion, StrategyId::FrequentScalp],
                    StrategyId::MeanReversion,
                ),
                14 => slot(
                    &[
                        StrategyId::MeanReversion,
                        StrategyId::CompressionBreakout,
                        StrategyId::FrequentScalp,
                    ],
                    StrategyId::CompressionBreakout,
                ),
                // Afternoon expansion into the close
                15 => slot(
                    &[StrategyId::CompressionBreakout, StrategyId::FrequentScalp],
                    StrategyId::CompressionBreakout,
                ),
                // Overnight and off-hours
                _ => slot(&[StrategyId::MeanReversion], StrategyId::MeanReversion),
            });
        }
        Self { hours }
    }
}

impl TradingSchedule {
    /// Strategies eligible at the given UTC hour. Total over 0..24; hours
    /// outside that range wrap.
    pub fn eligible(&self, hour: u32) -> &[StrategyId] {
        &self.hours[(hour % 24) as usize].eligible
    }

    /// Static default arm for the hour, used when selection falls back
    pub fn default_arm(&self, hour: u32) -> StrategyId {
        self.hours[(hour % 24) as usize].default_arm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_is_total() {
        let schedule = TradingSchedule::default();
        for hour in 0..24 {
            assert!(
                !schedule.eligible(hour).is_empty(),
                "hour {} has no eligible strategies",
                hour
            );
            let default = schedule.default_arm(hour);
            assert!(
                schedule.eligible(hour).contains(&default),
                "hour {} default arm not eligible",
                hour
            );
        }
    }

    #[test]
    fn test_opening_drive_only_at_open() {
        let schedule = TradingSchedule::default();
        assert!(schedule.eligible(9).contains(&StrategyId::OpeningDrive));
        assert!(!schedule.eligible(13).contains(&StrategyId::OpeningDrive));
        assert_eq!(schedule.default_arm(9), StrategyId::OpeningDrive);
    }

    #[test]
    fn test_hours_wrap() {
        let schedule = TradingSchedule::default();
        assert_eq!(schedule.eligible(33), schedule.eligible(9));
    }
}
