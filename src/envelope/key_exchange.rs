//! Persistent debounce bookkeeping for Signal prekey bundle exchanges.
//!
//! Same `sqlite`-backed `Table::open`/`Table::memory` shape as
//! `routes::Table`, scaled down to a single row per peer.
use std::fmt;
use std::path::Path;

use sqlite as sql;
use thiserror::Error;

use crate::ids::AddressName;

#[derive(Error, Debug)]
pub enum Error {
    #[error("internal error: {0}")]
    Internal(#[from] sql::Error),
}

/// `{address (PK), last_our_sent?, last_their_received?}`, epoch
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchangeState {
    pub address: AddressName,
    pub last_our_sent: Option<i64>,
    pub last_their_received: Option<i64>,
}

pub trait Store {
    fn get(&self, address: &AddressName) -> Result<Option<KeyExchangeState>, Error>;
    fn set_last_our_sent(&mut self, address: &AddressName, at_ms: i64) -> Result<(), Error>;
    fn set_last_their_received(&mut self, address: &AddressName, at_ms: i64) -> Result<(), Error>;
}

pub struct Table {
    db: sql::Connection,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key_exchange::Table(..)")
    }
}

impl Table {
    const SCHEMA: &'static str = "
        CREATE TABLE IF NOT EXISTS key_exchange_state (
          address              TEXT PRIMARY KEY,
          last_our_sent        INTEGER,
          last_their_received  INTEGER
        );
    ";

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let db = sql::Connection::open(path)?;
        db.execute(Self::SCHEMA)?;
        Ok(Self { db })
    }

    pub fn memory() -> Result<Self, Error> {
        let db = sql::Connection::open(":memory:")?;
        db.execute(Self::SCHEMA)?;
        Ok(Self { db })
    }

    fn touch(&mut self, address: &AddressName, column: &str, at_ms: i64) -> Result<(), Error> {
        let query = format!(
            "INSERT INTO key_exchange_state (address, {column}) VALUES (?, ?)
             ON CONFLICT (address) DO UPDATE SET {column} = excluded.{column}"
        );
        self.db
            .prepare(query)?
            .bind(1, address.as_str())?
            .bind(2, at_ms)?
            .next()?;
        Ok(())
    }
}

impl Store for Table {
    fn get(&self, address: &AddressName) -> Result<Option<KeyExchangeState>, Error> {
        let mut stmt = self
            .db
            .prepare(
                "SELECT address, last_our_sent, last_their_received
                 FROM key_exchange_state WHERE address = ?",
            )?
            .bind(1, address.as_str())?
            .into_cursor();

        if let Some(Ok(row)) = stmt.next() {
            Ok(Some(KeyExchangeState {
                address: AddressName::new(row.get::<String, _>(0)),
                last_our_sent: row.get::<Option<i64>, _>(1),
                last_their_received: row.get::<Option<i64>, _>(2),
            }))
        } else {
            Ok(None)
        }
    }

    fn set_last_our_sent(&mut self, address: &AddressName, at_ms: i64) -> Result<(), Error> {
        self.touch(address, "last_our_sent", at_ms)
    }

    fn set_last_their_received(&mut self, address: &AddressName, at_ms: i64) -> Result<(), Error> {
        self.touch(address, "last_their_received", at_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_timestamps() {
        let mut db = Table::memory().unwrap();
        let addr = AddressName::new("alice");

        assert!(db.get(&addr).unwrap().is_none());

        db.set_last_our_sent(&addr, 1_000).unwrap();
        let state = db.get(&addr).unwrap().unwrap();
        assert_eq!(state.last_our_sent, Some(1_000));
        assert_eq!(state.last_their_received, None);

        db.set_last_their_received(&addr, 2_000).unwrap();
        let state = db.get(&addr).unwrap().unwrap();
        assert_eq!(state.last_our_sent, Some(1_000));
        assert_eq!(state.last_their_received, Some(2_000));

        db.set_last_our_sent(&addr, 3_000).unwrap();
        assert_eq!(db.get(&addr).unwrap().unwrap().last_our_sent, Some(3_000));
    }
}
