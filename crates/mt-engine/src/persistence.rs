//! Persistence boundary for end-of-day order and position snapshots.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

use crate::positions::PositionRow;
use mt_types::{Order, PersistenceError};

/// Snapshot store consumed by the pipeline at end of day.
pub trait Persistence {
    fn save_orders(
        &mut self,
        source: &str,
        timestamp: DateTime<Utc>,
        orders: &[Order],
    ) -> Result<(), PersistenceError>;

    fn save_positions(
        &mut self,
        source: &str,
        timestamp: DateTime<Utc>,
        positions: &[PositionRow],
    ) -> Result<(), PersistenceError>;

    fn get_orders(
        &self,
        source: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<Order>, PersistenceError>;

    fn get_positions(
        &self,
        source: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<PositionRow>, PersistenceError>;
}

/// In-memory store; last snapshot per (source, timestamp) wins.
#[derive(Debug, Default)]
pub struct MemoryStore {
    orders: HashMap<(String, DateTime<Utc>), Vec<Order>>,
    positions: HashMap<(String, DateTime<Utc>), Vec<PositionRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MemoryStore {
    fn save_orders(
        &mut self,
        source: &str,
        timestamp: DateTime<Utc>,
        orders: &[Order],
    ) -> Result<(), PersistenceError> {
        self.orders
            .insert((source.to_string(), timestamp), orders.to_vec());
        Ok(())
    }

    fn save_positions(
        &mut self,
        source: &str,
        timestamp: DateTime<Utc>,
        positions: &[PositionRow],
    ) -> Result<(), PersistenceError> {
        self.positions
            .insert((source.to_string(), timestamp), positions.to_vec());
        Ok(())
    }

    fn get_orders(
        &self,
        source: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<Order>, PersistenceError> {
        self.orders
            .get(&(source.to_string(), timestamp))
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound {
                source_id: source.to_string(),
                timestamp,
            })
    }

    fn get_positions(
        &self,
        source: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<PositionRow>, PersistenceError> {
        self.positions
            .get(&(source.to_string(), timestamp))
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound {
                source_id: source.to_string(),
                timestamp,
            })
    }
}

/// JSON-lines snapshot files, one per (source, timestamp, kind).  Order
/// snapshots also get a sidecar file of order fingerprints for cross-run
/// comparison.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, source: &str, timestamp: DateTime<Utc>, kind: &str) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{}.jsonl",
            source,
            timestamp.format("%Y%m%dT%H%M%S"),
            kind
        ))
    }

    fn write_lines<T: serde::Serialize>(
        path: &PathBuf,
        rows: &[T],
    ) -> Result<(), PersistenceError> {
        let mut file = std::fs::File::create(path)?;
        for row in rows {
            let line = serde_json::to_string(row)?;
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }

    fn read_lines<T: for<'de> serde::Deserialize<'de>>(
        path: &PathBuf,
        source: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<T>, PersistenceError> {
        if !path.exists() {
            return Err(PersistenceError::NotFound {
                source_id: source.to_string(),
                timestamp,
            });
        }
        let content = std::fs::read_to_string(path)?;
        content
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_str(line).map_err(PersistenceError::from))
            .collect()
    }
}

impl Persistence for JsonFileStore {
    fn save_orders(
        &mut self,
        source: &str,
        timestamp: DateTime<Utc>,
        orders: &[Order],
    ) -> Result<(), PersistenceError> {
        let path = self.path(source, timestamp, "orders");
        Self::write_lines(&path, orders)?;

        let fingerprints: Vec<String> = orders.iter().map(|o| o.fingerprint()).collect();
        let mut file =
            std::fs::File::create(self.path(source, timestamp, "fingerprints"))?;
        for fingerprint in &fingerprints {
            writeln!(file, "{}", fingerprint)?;
        }

        info!(source, %timestamp, orders = orders.len(), "orders snapshot saved");
        Ok(())
    }

    fn save_positions(
        &mut self,
        source: &str,
        timestamp: DateTime<Utc>,
        positions: &[PositionRow],
    ) -> Result<(), PersistenceError> {
        let path = self.path(source, timestamp, "positions");
        Self::write_lines(&path, positions)?;
        info!(source, %timestamp, rows = positions.len(), "positions snapshot saved");
        Ok(())
    }

    fn get_orders(
        &self,
        source: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<Order>, PersistenceError> {
        Self::read_lines(&self.path(source, timestamp, "orders"), source, timestamp)
    }

    fn get_positions(
        &self,
        source: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<PositionRow>, PersistenceError> {
        Self::read_lines(&self.path(source, timestamp, "positions"), source, timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mt_types::{Instrument, Order, OrderType, Side};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap()
    }

    fn sample_order() -> Order {
        Order::new(
            Uuid::new_v4(),
            "strat".to_string(),
            Uuid::new_v4(),
            "strat".to_string(),
            Instrument::stock("TEST"),
            Side::Buy,
            100,
            OrderType::Limit { price: dec!(10) },
            t0(),
        )
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let mut store = MemoryStore::new();
        let orders = vec![sample_order()];
        store.save_orders("test", t0(), &orders).unwrap();

        let loaded = store.get_orders("test", t0()).unwrap();
        assert_eq!(loaded, orders);
        assert!(store.get_orders("other", t0()).is_err());
    }

    #[test]
    fn test_json_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStore::new(dir.path()).unwrap();

        let orders = vec![sample_order(), sample_order()];
        store.save_orders("test", t0(), &orders).unwrap();
        let loaded = store.get_orders("test", t0()).unwrap();
        assert_eq!(loaded, orders);

        // Fingerprint sidecar exists and has one line per order.
        let fingerprints = std::fs::read_to_string(
            dir.path().join("test_20240102T210000_fingerprints.jsonl"),
        )
        .unwrap();
        assert_eq!(fingerprints.lines().count(), 2);
    }

    #[test]
    fn test_json_file_store_positions_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStore::new(dir.path()).unwrap();

        let mut pm = crate::positions::PositionManager::new();
        pm.enter_trade(
            "s1",
            "s1",
            t0(),
            &Instrument::stock("TEST"),
            Side::Buy,
            100,
            dec!(10),
            dec!(-1),
        );
        let rows = pm.snapshot();
        store.save_positions("test", t0(), &rows).unwrap();
        assert_eq!(store.get_positions("test", t0()).unwrap(), rows);
    }

    #[test]
    fn test_missing_snapshot_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.get_orders("test", t0()),
            Err(PersistenceError::NotFound { .. })
        ));
    }
}
