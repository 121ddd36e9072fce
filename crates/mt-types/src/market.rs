use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::MarketDataError;

/// Product classes the engine can trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProductType {
    Stock,
    Future,
    Crypto,
}

impl ProductType {
    /// Returns true if this product trades 24/7 (no market close/weekends).
    pub fn is_24_7(&self) -> bool {
        matches!(self, ProductType::Crypto)
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProductType::Stock => "stock",
            ProductType::Future => "future",
            ProductType::Crypto => "crypto",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ProductType {
    type Err = MarketDataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stock" => Ok(ProductType::Stock),
            "future" => Ok(ProductType::Future),
            "crypto" => Ok(ProductType::Crypto),
            _ => Err(MarketDataError::Parse {
                message: format!("unknown product type: {}", s),
            }),
        }
    }
}

/// A tradable instrument identified by product type and symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Instrument {
    pub product_type: ProductType,
    pub symbol: String,
}

impl Instrument {
    pub fn new(product_type: ProductType, symbol: &str) -> Self {
        Self {
            product_type,
            symbol: symbol.to_string(),
        }
    }

    pub fn stock(symbol: &str) -> Self {
        Self::new(ProductType::Stock, symbol)
    }

    pub fn future(symbol: &str) -> Self {
        Self::new(ProductType::Future, symbol)
    }

    pub fn crypto(symbol: &str) -> Self {
        Self::new(ProductType::Crypto, symbol)
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.product_type, self.symbol)
    }
}

impl FromStr for Instrument {
    type Err = MarketDataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (product, symbol) = s.split_once(':').ok_or_else(|| MarketDataError::Parse {
            message: format!("expected <product>:<symbol>, got: {}", s),
        })?;
        Ok(Self::new(product.parse()?, symbol))
    }
}

/// Bar frequency for market data and the bar clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frequency {
    Minute,
    FiveMinute,
    FifteenMinute,
    Hour,
    Day,
}

impl Frequency {
    pub fn to_seconds(&self) -> u64 {
        match self {
            Frequency::Minute => 60,
            Frequency::FiveMinute => 300,
            Frequency::FifteenMinute => 900,
            Frequency::Hour => 3600,
            Frequency::Day => 86400,
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Frequency::Minute => "1min",
            Frequency::FiveMinute => "5min",
            Frequency::FifteenMinute => "15min",
            Frequency::Hour => "1h",
            Frequency::Day => "1D",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Frequency {
    type Err = MarketDataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "1min" | "1m" => Ok(Frequency::Minute),
            "5min" | "5m" => Ok(Frequency::FiveMinute),
            "15min" | "15m" => Ok(Frequency::FifteenMinute),
            "1h" | "60min" => Ok(Frequency::Hour),
            "1d" | "daily" => Ok(Frequency::Day),
            _ => Err(MarketDataError::Parse {
                message: format!("unknown frequency: {}", s),
            }),
        }
    }
}

/// OHLCV bar for one instrument at one bar time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub instrument: Instrument,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub frequency: Frequency,
}

impl Bar {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instrument: Instrument,
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
        frequency: Frequency,
    ) -> Self {
        Self {
            instrument,
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            frequency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_type_is_24_7() {
        assert!(ProductType::Crypto.is_24_7());
        assert!(!ProductType::Stock.is_24_7());
        assert!(!ProductType::Future.is_24_7());
    }

    #[test]
    fn test_product_type_parse_roundtrip() {
        for p in [ProductType::Stock, ProductType::Future, ProductType::Crypto] {
            assert_eq!(p.to_string().parse::<ProductType>().unwrap(), p);
        }
        assert!("bond".parse::<ProductType>().is_err());
    }

    #[test]
    fn test_instrument_constructors() {
        let i = Instrument::stock("TEST");
        assert_eq!(i.product_type, ProductType::Stock);
        assert_eq!(i.symbol, "TEST");
        assert_eq!(format!("{}", i), "stock:TEST");
    }

    #[test]
    fn test_instrument_parse() {
        let i: Instrument = "crypto:BTC-USD".parse().unwrap();
        assert_eq!(i, Instrument::crypto("BTC-USD"));
        assert!("no-colon".parse::<Instrument>().is_err());
    }

    #[test]
    fn test_frequency_seconds() {
        assert_eq!(Frequency::Minute.to_seconds(), 60);
        assert_eq!(Frequency::Day.to_seconds(), 86400);
    }

    #[test]
    fn test_frequency_parse() {
        assert_eq!("1min".parse::<Frequency>().unwrap(), Frequency::Minute);
        assert_eq!("1D".parse::<Frequency>().unwrap(), Frequency::Day);
        assert_eq!("daily".parse::<Frequency>().unwrap(), Frequency::Day);
        assert!("2h".parse::<Frequency>().is_err());
    }
}
