//! Trading-hours calendar.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use mt_types::ProductType;
use serde::{Deserialize, Serialize};

/// Session hours used to fire market open/close hooks and gate session-bound
/// products.  `always_open` disables the session model entirely (useful for
/// tests and single-session backtests).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingCalendar {
    /// Session open (UTC hour)
    pub open_hour: u32,
    /// Session close (UTC hour)
    pub close_hour: u32,
    pub weekend_trading: bool,
    pub always_open: bool,
}

impl Default for TradingCalendar {
    fn default() -> Self {
        Self {
            open_hour: 14, // 9:30 AM EST = 14:30 UTC
            close_hour: 21, // 4:00 PM EST = 21:00 UTC
            weekend_trading: false,
            always_open: false,
        }
    }
}

impl TradingCalendar {
    pub fn always_open() -> Self {
        Self {
            always_open: true,
            ..Self::default()
        }
    }

    pub fn is_open(&self, timestamp: DateTime<Utc>) -> bool {
        if self.always_open {
            return true;
        }
        if !self.weekend_trading {
            let weekday = timestamp.weekday();
            if weekday == Weekday::Sat || weekday == Weekday::Sun {
                return false;
            }
        }
        let hour = timestamp.hour();
        hour >= self.open_hour && hour < self.close_hour
    }

    /// 24/7 products ignore the session calendar.
    pub fn is_open_for(&self, product_type: ProductType, timestamp: DateTime<Utc>) -> bool {
        product_type.is_24_7() || self.is_open(timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_session_hours() {
        let calendar = TradingCalendar::default();
        // Tuesday 2024-01-02
        let during = Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap();
        let before = Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 2, 22, 0, 0).unwrap();
        assert!(calendar.is_open(during));
        assert!(!calendar.is_open(before));
        assert!(!calendar.is_open(after));
    }

    #[test]
    fn test_weekend_closed() {
        let calendar = TradingCalendar::default();
        let saturday = Utc.with_ymd_and_hms(2024, 1, 6, 15, 0, 0).unwrap();
        assert!(!calendar.is_open(saturday));
    }

    #[test]
    fn test_always_open() {
        let calendar = TradingCalendar::always_open();
        let saturday = Utc.with_ymd_and_hms(2024, 1, 6, 3, 0, 0).unwrap();
        assert!(calendar.is_open(saturday));
    }

    #[test]
    fn test_crypto_ignores_session() {
        let calendar = TradingCalendar::default();
        let saturday = Utc.with_ymd_and_hms(2024, 1, 6, 3, 0, 0).unwrap();
        assert!(calendar.is_open_for(ProductType::Crypto, saturday));
        assert!(!calendar.is_open_for(ProductType::Stock, saturday));
    }
}
