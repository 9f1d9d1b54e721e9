//! Persistent state for outbound application messages.
//!
//! Same `sqlite`-backed `Table::open`/`Table::memory` shape as
//! `routes::Table` and `key_exchange::Table`.
use std::fmt;
use std::path::Path;

use sqlite as sql;
use thiserror::Error;

use crate::ids::{AddressName, AppMessageId, PayloadId};

use super::types::{OutboundMessage, OutboundStatus};

#[derive(Error, Debug)]
pub enum Error {
    #[error("internal error: {0}")]
    Internal(#[from] sql::Error),
    #[error("malformed outbound status in storage: {0}")]
    MalformedStatus(String),
}

pub trait Store {
    fn insert(&mut self, message: OutboundMessage) -> Result<(), Error>;
    fn get(&self, app_message_id: &AppMessageId) -> Result<Option<OutboundMessage>, Error>;
    fn set_status(
        &mut self,
        app_message_id: &AppMessageId,
        status: OutboundStatus,
    ) -> Result<(), Error>;
    fn set_payload_id(
        &mut self,
        app_message_id: &AppMessageId,
        payload_id: &PayloadId,
    ) -> Result<(), Error>;
    /// Every `Failed`/`Pending`/`PendingKeyExchange` message for
    /// `destination`, oldest first — the re-drive set for a
    /// `SessionEstablished` (or newly discovered route) event.
    fn undelivered_for_destination(
        &self,
        destination: &AddressName,
    ) -> Result<Vec<OutboundMessage>, Error>;
}

pub struct Table {
    db: sql::Connection,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dispatch::Table(..)")
    }
}

impl Table {
    const SCHEMA: &'static str = "
        CREATE TABLE IF NOT EXISTS outbound_message (
          app_message_id  TEXT PRIMARY KEY,
          destination     TEXT NOT NULL,
          status          TEXT NOT NULL,
          plaintext       BLOB NOT NULL,
          payload_id      TEXT,
          created_at      INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS outbound_message_destination
          ON outbound_message (destination);
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

    fn status_to_str(status: OutboundStatus) -> &'static str {
        match status {
            OutboundStatus::PendingKeyExchange => "pending_key_exchange",
            OutboundStatus::Pending => "pending",
            OutboundStatus::Delivered => "delivered",
            OutboundStatus::Read => "read",
            OutboundStatus::Failed => "failed",
        }
    }

    fn status_from_str(s: &str) -> Result<OutboundStatus, Error> {
        match s {
            "pending_key_exchange" => Ok(OutboundStatus::PendingKeyExchange),
            "pending" => Ok(OutboundStatus::Pending),
            "delivered" => Ok(OutboundStatus::Delivered),
            "read" => Ok(OutboundStatus::Read),
            "failed" => Ok(OutboundStatus::Failed),
            other => Err(Error::MalformedStatus(other.to_string())),
        }
    }

    fn row_to_message(row: &sql::Row) -> Result<OutboundMessage, Error> {
        Ok(OutboundMessage {
            app_message_id: AppMessageId::new(row.get::<String, _>(0)),
            destination: AddressName::new(row.get::<String, _>(1)),
            status: Self::status_from_str(&row.get::<String, _>(2))?,
            plaintext: row.get::<Vec<u8>, _>(3),
            payload_id: row.get::<Option<String>, _>(4).map(PayloadId::new),
            created_at: row.get::<i64, _>(5),
        })
    }
}

impl Store for Table {
    fn insert(&mut self, message: OutboundMessage) -> Result<(), Error> {
        self.db
            .prepare(
                "INSERT INTO outbound_message
                    (app_message_id, destination, status, plaintext, payload_id, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT DO NOTHING",
            )?
            .bind(1, message.app_message_id.as_str())?
            .bind(2, message.destination.as_str())?
            .bind(3, Self::status_to_str(message.status))?
            .bind(4, message.plaintext.as_slice())?
            .bind(5, message.payload_id.as_ref().map(|p| p.to_string()).as_deref())?
            .bind(6, message.created_at)?
            .next()?;
        Ok(())
    }

    fn get(&self, app_message_id: &AppMessageId) -> Result<Option<OutboundMessage>, Error> {
        let mut stmt = self
            .db
            .prepare(
                "SELECT app_message_id, destination, status, plaintext, payload_id, created_at
                 FROM outbound_message WHERE app_message_id = ?",
            )?
            .bind(1, app_message_id.as_str())?
            .into_cursor();

        if let Some(Ok(row)) = stmt.next() {
            Ok(Some(Self::row_to_message(&row)?))
        } else {
            Ok(None)
        }
    }

    fn set_status(
        &mut self,
        app_message_id: &AppMessageId,
        status: OutboundStatus,
    ) -> Result<(), Error> {
        self.db
            .prepare("UPDATE outbound_message SET status = ? WHERE app_message_id = ?")?
            .bind(1, Self::status_to_str(status))?
            .bind(2, app_message_id.as_str())?
            .next()?;
        Ok(())
    }

    fn set_payload_id(
        &mut self,
        app_message_id: &AppMessageId,
        payload_id: &PayloadId,
    ) -> Result<(), Error> {
        self.db
            .prepare("UPDATE outbound_message SET payload_id = ? WHERE app_message_id = ?")?
            .bind(1, payload_id.to_string().as_str())?
            .bind(2, app_message_id.as_str())?
            .next()?;
        Ok(())
    }

    fn undelivered_for_destination(
        &self,
        destination: &AddressName,
    ) -> Result<Vec<OutboundMessage>, Error> {
        let mut stmt = self
            .db
            .prepare(
                "SELECT app_message_id, destination, status, plaintext, payload_id, created_at
                 FROM outbound_message
                 WHERE destination = ?
                   AND status IN ('pending_key_exchange', 'pending', 'failed')
                 ORDER BY created_at ASC",
            )?
            .bind(1, destination.as_str())?
            .into_cursor();

        let mut out = Vec::new();
        while let Some(Ok(row)) = stmt.next() {
            out.push(Self::row_to_message(&row)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, destination: &str, created_at: i64) -> OutboundMessage {
        OutboundMessage {
            app_message_id: AppMessageId::new(id),
            destination: AddressName::new(destination),
            status: OutboundStatus::Pending,
            plaintext: b"hi".to_vec(),
            payload_id: None,
            created_at,
        }
    }

    #[test]
    fn round_trips_a_message() {
        let mut db = Table::memory().unwrap();
        db.insert(msg("m1", "bob", 1_000)).unwrap();

        let fetched = db.get(&AppMessageId::new("m1")).unwrap().unwrap();
        assert_eq!(fetched.destination, AddressName::new("bob"));
        assert_eq!(fetched.status, OutboundStatus::Pending);
        assert_eq!(fetched.plaintext, b"hi");
        assert!(fetched.payload_id.is_none());
    }

    #[test]
    fn status_and_payload_id_updates_persist() {
        let mut db = Table::memory().unwrap();
        let id = AppMessageId::new("m1");
        db.insert(msg("m1", "bob", 1_000)).unwrap();

        db.set_payload_id(&id, &PayloadId::new("p1")).unwrap();
        db.set_status(&id, OutboundStatus::Delivered).unwrap();

        let fetched = db.get(&id).unwrap().unwrap();
        assert_eq!(fetched.status, OutboundStatus::Delivered);
        assert_eq!(fetched.payload_id, Some(PayloadId::new("p1")));
    }

    #[test]
    fn undelivered_for_destination_excludes_terminal_statuses() {
        let mut db = Table::memory().unwrap();
        db.insert(msg("m1", "bob", 1_000)).unwrap();
        db.insert(msg("m2", "bob", 2_000)).unwrap();
        db.set_status(&AppMessageId::new("m2"), OutboundStatus::Delivered)
            .unwrap();
        db.insert(msg("m3", "carol", 3_000)).unwrap();
        db.insert(msg("m4", "bob", 4_000)).unwrap();
        db.set_status(&AppMessageId::new("m4"), OutboundStatus::Failed)
            .unwrap();

        let pending = db
            .undelivered_for_destination(&AddressName::new("bob"))
            .unwrap();
        assert_eq!(
            pending.iter().map(|m| m.app_message_id.clone()).collect::<Vec<_>>(),
            vec![AppMessageId::new("m1"), AppMessageId::new("m4")]
        );
    }
}
