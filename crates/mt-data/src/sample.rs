//! Seedable random-walk bar generation for demos and smoke runs.

use chrono::{DateTime, Duration, Utc};
use mt_types::{Bar, Frequency, Instrument};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rust_decimal::Decimal;

/// Generate a random-walk OHLCV series for `instrument` between `start` and
/// `end` (inclusive), one bar per `frequency` step.  The same seed always
/// produces the same series.
pub fn random_walk_bars(
    instrument: &Instrument,
    frequency: Frequency,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    seed: u64,
    start_price: Decimal,
) -> Vec<Bar> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let step = Duration::seconds(frequency.to_seconds() as i64);
    let mut bars = Vec::new();

    let mut price = decimal_to_f64(start_price);
    let mut current = start;
    while current <= end {
        let drift = (rng.gen::<f64>() - 0.5) * 0.02; // up to +-1% per bar
        let open = price;
        let close = open * (1.0 + drift);
        let high = open.max(close) * (1.0 + rng.gen::<f64>() * 0.005);
        let low = open.min(close) * (1.0 - rng.gen::<f64>() * 0.005);
        let volume = 10_000 + rng.gen_range(0..5_000);

        bars.push(Bar::new(
            instrument.clone(),
            current,
            to_price(open),
            to_price(high),
            to_price(low),
            to_price(close),
            Decimal::from(volume),
            frequency,
        ));

        price = close;
        current += step;
    }

    bars
}

fn decimal_to_f64(value: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_f64().unwrap_or(100.0)
}

fn to_price(value: f64) -> Decimal {
    Decimal::from_f64_retain(value)
        .map(|d| d.round_dp(2))
        .unwrap_or(Decimal::ONE)
}
