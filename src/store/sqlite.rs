//! SQLite storage, WAL mode.
//!
//! Rows carry big integers as decimal strings. `id` is the primary key and
//! inserts use `INSERT OR IGNORE`, so re-emitting the same opportunity is a
//! no-op.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;

use super::{OpportunityQuery, OpportunityRecord, OpportunityStore, PriceQuery, PriceRow};
use crate::error::StoreError;
use crate::types::OpportunityStatus;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 1000;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open the database and run migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory database, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS opportunities (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                pair_path TEXT NOT NULL,
                venue_path TEXT NOT NULL,
                trade_amount_in TEXT NOT NULL,
                gross_profit_quote TEXT NOT NULL,
                net_profit_quote TEXT NOT NULL,
                gas_cost_quote TEXT NOT NULL,
                fee_cost_quote TEXT NOT NULL,
                margin REAL NOT NULL,
                status TEXT NOT NULL,
                reason TEXT,
                block_number INTEGER NOT NULL,
                block_hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_opportunities_created
                ON opportunities (created_at DESC);

            CREATE TABLE IF NOT EXISTS price_history (
                pair TEXT NOT NULL,
                venue TEXT NOT NULL,
                reserve0 TEXT NOT NULL,
                reserve1 TEXT NOT NULL,
                block_number INTEGER NOT NULL,
                observed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_price_history_pair
                ON price_history (pair, venue, block_number DESC);
            ",
        )?;
        Ok(())
    }
}

fn ts(t: &DateTime<Utc>) -> String {
    // Fixed-width UTC timestamps sort lexicographically.
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn record_from_row(row: &Row) -> rusqlite::Result<OpportunityRecord> {
    Ok(OpportunityRecord {
        id: row.get(0)?,
        kind: row.get(1)?,
        pair_path: row.get(2)?,
        venue_path: row.get(3)?,
        trade_amount_in: row.get(4)?,
        gross_profit_quote: row.get(5)?,
        net_profit_quote: row.get(6)?,
        gas_cost_quote: row.get(7)?,
        fee_cost_quote: row.get(8)?,
        margin: row.get(9)?,
        status: row.get(10)?,
        reason: row.get(11)?,
        block_number: row.get(12)?,
        block_hash: row.get(13)?,
        created_at: parse_ts(row.get(14)?),
        expires_at: parse_ts(row.get(15)?),
    })
}

const RECORD_COLUMNS: &str = "id, kind, pair_path, venue_path, trade_amount_in, \
     gross_profit_quote, net_profit_quote, gas_cost_quote, fee_cost_quote, \
     margin, status, reason, block_number, block_hash, created_at, expires_at";

impl OpportunityStore for SqliteStore {
    fn insert(&self, record: &OpportunityRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO opportunities (id, kind, pair_path, venue_path, \
             trade_amount_in, gross_profit_quote, net_profit_quote, gas_cost_quote, \
             fee_cost_quote, margin, status, reason, block_number, block_hash, \
             created_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                record.id,
                record.kind,
                record.pair_path,
                record.venue_path,
                record.trade_amount_in,
                record.gross_profit_quote,
                record.net_profit_quote,
                record.gas_cost_quote,
                record.fee_cost_quote,
                record.margin,
                record.status,
                record.reason,
                record.block_number,
                record.block_hash,
                ts(&record.created_at),
                ts(&record.expires_at),
            ],
        )?;
        Ok(())
    }

    fn update_status(
        &self,
        id: &str,
        status: OpportunityStatus,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let changed = conn.execute(
            "UPDATE opportunities SET status = ?2, reason = COALESCE(?3, reason) WHERE id = ?1",
            params![id, status.to_string(), reason],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn append_price(&self, row: &PriceRow) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO price_history (pair, venue, reserve0, reserve1, block_number, observed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.pair,
                row.venue,
                row.reserve0,
                row.reserve1,
                row.block_number,
                ts(&row.observed_at),
            ],
        )?;
        Ok(())
    }

    fn query_opportunities(
        &self,
        query: &OpportunityQuery,
    ) -> Result<Vec<OpportunityRecord>, StoreError> {
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let mut sql = format!(
            "SELECT {RECORD_COLUMNS} FROM opportunities WHERE 1=1"
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(kind) = &query.kind {
            sql.push_str(" AND kind = ?");
            args.push(Box::new(kind.clone()));
        }
        if let Some(min_profit) = query.min_profit {
            sql.push_str(" AND CAST(net_profit_quote AS REAL) >= ?");
            args.push(Box::new(min_profit));
        }
        if let Some(from) = &query.from {
            sql.push_str(" AND created_at >= ?");
            args.push(Box::new(ts(from)));
        }
        if let Some(to) = &query.to {
            sql.push_str(" AND created_at <= ?");
            args.push(Box::new(ts(to)));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
        args.push(Box::new(limit as i64));

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            record_from_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn get_opportunity(&self, id: &str) -> Result<Option<OpportunityRecord>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM opportunities WHERE id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![id], record_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    fn query_prices(&self, query: &PriceQuery) -> Result<Vec<PriceRow>, StoreError> {
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let mut sql = String::from(
            "SELECT pair, venue, reserve0, reserve1, block_number, observed_at \
             FROM price_history WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(pair) = &query.pair {
            sql.push_str(" AND pair = ?");
            args.push(Box::new(pair.clone()));
        }
        if let Some(venue) = &query.venue {
            sql.push_str(" AND venue = ?");
            args.push(Box::new(venue.clone()));
        }
        sql.push_str(" ORDER BY block_number DESC, observed_at DESC LIMIT ?");
        args.push(Box::new(limit as i64));

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| {
                Ok(PriceRow {
                    pair: row.get(0)?,
                    venue: row.get(1)?,
                    reserve0: row.get(2)?,
                    reserve1: row.get(3)?,
                    block_number: row.get(4)?,
                    observed_at: parse_ts(row.get(5)?),
                })
            },
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, net: &str, created_offset_secs: i64) -> OpportunityRecord {
        OpportunityRecord {
            id: id.into(),
            kind: "two_leg".into(),
            pair_path: "a>b>a".into(),
            venue_path: "uniswap>sushiswap".into(),
            trade_amount_in: "1000".into(),
            gross_profit_quote: net.into(),
            net_profit_quote: net.into(),
            gas_cost_quote: "10".into(),
            fee_cost_quote: "6".into(),
            margin: 2.0,
            status: "qualified".into(),
            reason: None,
            block_number: 100,
            block_hash: "0x00".into(),
            created_at: Utc::now() + chrono::Duration::seconds(created_offset_secs),
            expires_at: Utc::now() + chrono::Duration::seconds(created_offset_secs + 30),
        }
    }

    #[test]
    fn migrations_create_tables() {
        let store = SqliteStore::open_in_memory().expect("in-memory store opens");
        let conn = store.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(tables.contains(&"opportunities".to_string()));
        assert!(tables.contains(&"price_history".to_string()));
    }

    #[test]
    fn insert_is_idempotent_on_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(&record("opp-1", "100", 0)).unwrap();
        store.insert(&record("opp-1", "999", 0)).unwrap();

        let all = store
            .query_opportunities(&OpportunityQuery::default())
            .unwrap();
        assert_eq!(all.len(), 1);
        // First write wins; the duplicate was ignored.
        assert_eq!(all[0].net_profit_quote, "100");
    }

    #[test]
    fn query_filters_and_orders_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(&record("opp-1", "100", -20)).unwrap();
        store.insert(&record("opp-2", "5000", -10)).unwrap();
        let mut tri = record("opp-3", "700", 0);
        tri.kind = "triangular".into();
        store.insert(&tri).unwrap();

        let all = store
            .query_opportunities(&OpportunityQuery::default())
            .unwrap();
        assert_eq!(
            all.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["opp-3", "opp-2", "opp-1"]
        );

        let rich = store
            .query_opportunities(&OpportunityQuery {
                min_profit: Some(600.0),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rich.len(), 2);

        let tris = store
            .query_opportunities(&OpportunityQuery {
                kind: Some("triangular".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(tris.len(), 1);
        assert_eq!(tris[0].id, "opp-3");
    }

    #[test]
    fn status_updates_land_and_missing_id_errors() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(&record("opp-1", "100", 0)).unwrap();
        store
            .update_status("opp-1", OpportunityStatus::SimulatedExecuted, None)
            .unwrap();
        let got = store.get_opportunity("opp-1").unwrap().unwrap();
        assert_eq!(got.status, "simulated_executed");

        let missing = store.update_status("nope", OpportunityStatus::Expired, None);
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn price_history_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        for block in [100u64, 101, 102] {
            store
                .append_price(&PriceRow {
                    pair: "a/b".into(),
                    venue: "uniswap".into(),
                    reserve0: "1".into(),
                    reserve1: "2".into(),
                    block_number: block,
                    observed_at: Utc::now(),
                })
                .unwrap();
        }
        let rows = store
            .query_prices(&PriceQuery {
                pair: Some("a/b".into()),
                venue: Some("uniswap".into()),
                limit: Some(2),
            })
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].block_number, 102);
    }
}
