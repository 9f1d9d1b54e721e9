//! Route Tables.
//!
//! Persistent, transactional state for discovery requests, broadcast
//! fan-out, discovered routes and per-request usage.
//!
//! Grounded directly on `service::routing::{Table, Store}`: one
//! `sqlite::Connection`, a schema loaded with `include_str!`, the
//! `ON CONFLICT DO NOTHING` / `db.change_count()` idiom for reporting
//! whether a write actually touched a row. Foreign keys with
//! `ON DELETE CASCADE` enforce the route -> usage -> backtracking deletion
//! order at the database layer.
mod types;

pub use types::{
    BroadcastStatusEntry, RouteEntry, RouteRequestEntry, RouteUsage, RouteUsageBacktracking,
};

use std::fmt;
use std::path::Path;

use sqlite as sql;
use thiserror::Error;

use crate::ids::{LocalNodeId, RequestUuid};

#[derive(Error, Debug)]
pub enum Error {
    #[error("internal error: {0}")]
    Internal(#[from] sql::Error),
    #[error("malformed request uuid in storage: {0}")]
    MalformedUuid(#[from] uuid::Error),
}

/// Persistent, transactional backing store for the route-discovery tables.
pub trait Store {
    fn insert_request(&mut self, entry: RouteRequestEntry) -> Result<(), Error>;
    fn request(&self, request_uuid: &RequestUuid) -> Result<Option<RouteRequestEntry>, Error>;
    /// Deletes the request row, cascading to its `BroadcastStatusEntry` rows.
    fn delete_request(&mut self, request_uuid: &RequestUuid) -> Result<(), Error>;

    fn insert_broadcast(
        &mut self,
        request_uuid: &RequestUuid,
        neighbor_local_id: LocalNodeId,
    ) -> Result<(), Error>;
    fn set_broadcast_pending(
        &mut self,
        request_uuid: &RequestUuid,
        neighbor_local_id: LocalNodeId,
        pending: bool,
    ) -> Result<(), Error>;
    fn delete_broadcast(
        &mut self,
        request_uuid: &RequestUuid,
        neighbor_local_id: LocalNodeId,
    ) -> Result<(), Error>;
    fn count_broadcasts(&self, request_uuid: &RequestUuid) -> Result<usize, Error>;
    /// True iff a `BroadcastStatusEntry` for `request_uuid` exists whose
    /// `is_progress_pending` equals `pending`.
    fn has_pending_in_progress(
        &self,
        request_uuid: &RequestUuid,
        pending: bool,
    ) -> Result<bool, Error>;

    fn insert_route(&mut self, route: RouteEntry) -> Result<(), Error>;
    fn route(&self, discovery_uuid: &RequestUuid) -> Result<Option<RouteEntry>, Error>;
    /// Deletes the route, cascading to its usages and their backtracking
    /// rows.
    fn delete_route(&mut self, discovery_uuid: &RequestUuid) -> Result<(), Error>;

    fn insert_usage(&mut self, usage: RouteUsage) -> Result<(), Error>;
    fn touch_usage(&mut self, usage_uuid: &RequestUuid, now_ms: i64) -> Result<(), Error>;
    fn insert_backtracking(
        &mut self,
        usage_uuid: &RequestUuid,
        destination_local_id: LocalNodeId,
    ) -> Result<(), Error>;

    /// Joins `route_entry` with `route_usage`/`route_usage_backtracking`,
    /// restricted to open routes, and returns the row with the greatest
    /// `last_used_timestamp` whose destination matches either the route's
    /// own destination or a backtracking record's destination.
    fn most_recent_opened_route_to(
        &self,
        destination_local_id: LocalNodeId,
    ) -> Result<Option<(RouteEntry, Option<i64>)>, Error>;

    fn delete_stale_usages(
        &mut self,
        discovery_uuid: &RequestUuid,
        threshold_ms: i64,
    ) -> Result<(), Error>;

    /// Maintenance sweep: deletes every route whose newest usage (or, if it
    /// has never been used, whose route itself) is older than
    /// `threshold_ms`, cascading to its usage and backtracking rows.
    /// Returns the deleted routes' discovery uuids.
    fn reap_stale_routes(&mut self, threshold_ms: i64) -> Result<Vec<RequestUuid>, Error>;
}

/// sqlite-backed implementation of [`Store`].
pub struct Table {
    db: sql::Connection,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "routes::Table(..)")
    }
}

impl Table {
    const SCHEMA: &'static str = include_str!("schema.sql");

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

    fn parse_uuid(s: String) -> Result<RequestUuid, Error> {
        use std::str::FromStr;
        RequestUuid::from_str(&s).map_err(Error::from)
    }
}

impl Store for Table {
    fn insert_request(&mut self, entry: RouteRequestEntry) -> Result<(), Error> {
        self.db
            .prepare(
                "INSERT INTO route_request
                    (request_uuid, destination_local_id, previous_hop_local_id, remaining_hops_at_send, max_ttl_epoch_ms)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT DO NOTHING",
            )?
            .bind(1, entry.request_uuid.to_string().as_str())?
            .bind(2, entry.destination_local_id.0)?
            .bind(3, entry.previous_hop_local_id.map(|id| id.0))?
            .bind(4, entry.remaining_hops_at_send as i64)?
            .bind(5, entry.max_ttl_epoch_ms as i64)?
            .next()?;
        Ok(())
    }

    fn request(&self, request_uuid: &RequestUuid) -> Result<Option<RouteRequestEntry>, Error> {
        let mut stmt = self
            .db
            .prepare(
                "SELECT request_uuid, destination_local_id, previous_hop_local_id, remaining_hops_at_send, max_ttl_epoch_ms
                 FROM route_request WHERE request_uuid = ?",
            )?
            .bind(1, request_uuid.to_string().as_str())?
            .into_cursor();

        if let Some(Ok(row)) = stmt.next() {
            Ok(Some(RouteRequestEntry {
                request_uuid: Self::parse_uuid(row.get::<String, _>(0))?,
                destination_local_id: LocalNodeId(row.get::<i64, _>(1)),
                previous_hop_local_id: row.get::<Option<i64>, _>(2).map(LocalNodeId),
                remaining_hops_at_send: row.get::<i64, _>(3) as i32,
                max_ttl_epoch_ms: row.get::<i64, _>(4) as u64,
            }))
        } else {
            Ok(None)
        }
    }

    fn delete_request(&mut self, request_uuid: &RequestUuid) -> Result<(), Error> {
        self.db
            .prepare("DELETE FROM route_request WHERE request_uuid = ?")?
            .bind(1, request_uuid.to_string().as_str())?
            .next()?;
        Ok(())
    }

    fn insert_broadcast(
        &mut self,
        request_uuid: &RequestUuid,
        neighbor_local_id: LocalNodeId,
    ) -> Result<(), Error> {
        self.db
            .prepare(
                "INSERT INTO broadcast_status (request_uuid, neighbor_local_id, is_progress_pending)
                 VALUES (?, ?, 0)
                 ON CONFLICT DO NOTHING",
            )?
            .bind(1, request_uuid.to_string().as_str())?
            .bind(2, neighbor_local_id.0)?
            .next()?;
        Ok(())
    }

    fn set_broadcast_pending(
        &mut self,
        request_uuid: &RequestUuid,
        neighbor_local_id: LocalNodeId,
        pending: bool,
    ) -> Result<(), Error> {
        self.db
            .prepare(
                "UPDATE broadcast_status SET is_progress_pending = ?
                 WHERE request_uuid = ? AND neighbor_local_id = ?",
            )?
            .bind(1, i64::from(pending))?
            .bind(2, request_uuid.to_string().as_str())?
            .bind(3, neighbor_local_id.0)?
            .next()?;
        Ok(())
    }

    fn delete_broadcast(
        &mut self,
        request_uuid: &RequestUuid,
        neighbor_local_id: LocalNodeId,
    ) -> Result<(), Error> {
        self.db
            .prepare(
                "DELETE FROM broadcast_status WHERE request_uuid = ? AND neighbor_local_id = ?",
            )?
            .bind(1, request_uuid.to_string().as_str())?
            .bind(2, neighbor_local_id.0)?
            .next()?;
        Ok(())
    }

    fn count_broadcasts(&self, request_uuid: &RequestUuid) -> Result<usize, Error> {
        let mut stmt = self
            .db
            .prepare("SELECT COUNT(*) FROM broadcast_status WHERE request_uuid = ?")?
            .bind(1, request_uuid.to_string().as_str())?
            .into_cursor();

        let count = stmt
            .next()
            .and_then(|r| r.ok())
            .map(|row| row.get::<i64, _>(0))
            .unwrap_or(0);
        Ok(count as usize)
    }

    fn has_pending_in_progress(
        &self,
        request_uuid: &RequestUuid,
        pending: bool,
    ) -> Result<bool, Error> {
        let mut stmt = self
            .db
            .prepare(
                "SELECT 1 FROM broadcast_status
                 WHERE request_uuid = ? AND is_progress_pending = ? LIMIT 1",
            )?
            .bind(1, request_uuid.to_string().as_str())?
            .bind(2, i64::from(pending))?
            .into_cursor();
        Ok(stmt.next().is_some())
    }

    fn insert_route(&mut self, route: RouteEntry) -> Result<(), Error> {
        self.db
            .prepare(
                "INSERT INTO route_entry
                    (discovery_uuid, destination_local_id, next_hop_local_id,
                     previous_hop_local_id, hop_count, last_use_timestamp)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT (discovery_uuid) DO UPDATE SET
                    destination_local_id = excluded.destination_local_id,
                    next_hop_local_id = excluded.next_hop_local_id,
                    previous_hop_local_id = excluded.previous_hop_local_id,
                    hop_count = excluded.hop_count,
                    last_use_timestamp = excluded.last_use_timestamp",
            )?
            .bind(1, route.discovery_uuid.to_string().as_str())?
            .bind(2, route.destination_local_id.0)?
            .bind(3, route.next_hop_local_id.map(|id| id.0))?
            .bind(4, route.previous_hop_local_id.map(|id| id.0))?
            .bind(5, route.hop_count as i64)?
            .bind(6, route.last_use_timestamp)?
            .next()?;
        Ok(())
    }

    fn route(&self, discovery_uuid: &RequestUuid) -> Result<Option<RouteEntry>, Error> {
        let mut stmt = self
            .db
            .prepare(
                "SELECT discovery_uuid, destination_local_id, next_hop_local_id,
                        previous_hop_local_id, hop_count, last_use_timestamp
                 FROM route_entry WHERE discovery_uuid = ?",
            )?
            .bind(1, discovery_uuid.to_string().as_str())?
            .into_cursor();

        if let Some(Ok(row)) = stmt.next() {
            Ok(Some(Self::row_to_route(&row)?))
        } else {
            Ok(None)
        }
    }

    fn delete_route(&mut self, discovery_uuid: &RequestUuid) -> Result<(), Error> {
        self.db
            .prepare("DELETE FROM route_entry WHERE discovery_uuid = ?")?
            .bind(1, discovery_uuid.to_string().as_str())?
            .next()?;
        Ok(())
    }

    fn insert_usage(&mut self, usage: RouteUsage) -> Result<(), Error> {
        self.db
            .prepare(
                "INSERT INTO route_usage
                    (usage_request_uuid, route_entry_discovery_uuid, previous_hop_local_id, last_used_timestamp)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT DO NOTHING",
            )?
            .bind(1, usage.usage_request_uuid.to_string().as_str())?
            .bind(2, usage.route_entry_discovery_uuid.to_string().as_str())?
            .bind(3, usage.previous_hop_local_id.map(|id| id.0))?
            .bind(4, usage.last_used_timestamp)?
            .next()?;
        Ok(())
    }

    fn touch_usage(&mut self, usage_uuid: &RequestUuid, now_ms: i64) -> Result<(), Error> {
        self.db
            .prepare("UPDATE route_usage SET last_used_timestamp = ? WHERE usage_request_uuid = ?")?
            .bind(1, now_ms)?
            .bind(2, usage_uuid.to_string().as_str())?
            .next()?;
        Ok(())
    }

    fn insert_backtracking(
        &mut self,
        usage_uuid: &RequestUuid,
        destination_local_id: LocalNodeId,
    ) -> Result<(), Error> {
        self.db
            .prepare(
                "INSERT INTO route_usage_backtracking (usage_uuid, destination_local_id)
                 VALUES (?, ?)
                 ON CONFLICT DO NOTHING",
            )?
            .bind(1, usage_uuid.to_string().as_str())?
            .bind(2, destination_local_id.0)?
            .next()?;
        Ok(())
    }

    fn most_recent_opened_route_to(
        &self,
        destination_local_id: LocalNodeId,
    ) -> Result<Option<(RouteEntry, Option<i64>)>, Error> {
        let mut stmt = self
            .db
            .prepare(
                "SELECT r.discovery_uuid, r.destination_local_id, r.next_hop_local_id,
                        r.previous_hop_local_id, r.hop_count, r.last_use_timestamp,
                        u.last_used_timestamp
                 FROM route_entry r
                 LEFT JOIN route_usage u ON u.route_entry_discovery_uuid = r.discovery_uuid
                 LEFT JOIN route_usage_backtracking b ON b.usage_uuid = u.usage_request_uuid
                 WHERE r.next_hop_local_id IS NOT NULL
                   AND (r.destination_local_id = ? OR b.destination_local_id = ?)
                 ORDER BY u.last_used_timestamp DESC NULLS LAST
                 LIMIT 1",
            )?
            .bind(1, destination_local_id.0)?
            .bind(2, destination_local_id.0)?
            .into_cursor();

        if let Some(Ok(row)) = stmt.next() {
            let route = RouteEntry {
                discovery_uuid: Self::parse_uuid(row.get::<String, _>(0))?,
                destination_local_id: LocalNodeId(row.get::<i64, _>(1)),
                next_hop_local_id: row.get::<Option<i64>, _>(2).map(LocalNodeId),
                previous_hop_local_id: row.get::<Option<i64>, _>(3).map(LocalNodeId),
                hop_count: row.get::<i64, _>(4) as i32,
                last_use_timestamp: row.get::<Option<i64>, _>(5),
            };
            let last_used = row.get::<Option<i64>, _>(6);
            Ok(Some((route, last_used)))
        } else {
            Ok(None)
        }
    }

    fn delete_stale_usages(
        &mut self,
        discovery_uuid: &RequestUuid,
        threshold_ms: i64,
    ) -> Result<(), Error> {
        self.db
            .prepare(
                "DELETE FROM route_usage
                 WHERE route_entry_discovery_uuid = ?
                   AND (last_used_timestamp IS NULL OR last_used_timestamp < ?)",
            )?
            .bind(1, discovery_uuid.to_string().as_str())?
            .bind(2, threshold_ms)?
            .next()?;
        Ok(())
    }

    fn reap_stale_routes(&mut self, threshold_ms: i64) -> Result<Vec<RequestUuid>, Error> {
        let mut stmt = self
            .db
            .prepare(
                "SELECT r.discovery_uuid
                 FROM route_entry r
                 LEFT JOIN route_usage u ON u.route_entry_discovery_uuid = r.discovery_uuid
                 GROUP BY r.discovery_uuid
                 HAVING COALESCE(MAX(u.last_used_timestamp), -1) < ?",
            )?
            .bind(1, threshold_ms)?
            .into_cursor();

        let mut stale = Vec::new();
        while let Some(Ok(row)) = stmt.next() {
            stale.push(Self::parse_uuid(row.get::<String, _>(0))?);
        }
        drop(stmt);

        for uuid in &stale {
            self.delete_route(uuid)?;
        }
        Ok(stale)
    }
}

impl Table {
    fn row_to_route(row: &sql::Row) -> Result<RouteEntry, Error> {
        Ok(RouteEntry {
            discovery_uuid: Self::parse_uuid(row.get::<String, _>(0))?,
            destination_local_id: LocalNodeId(row.get::<i64, _>(1)),
            next_hop_local_id: row.get::<Option<i64>, _>(2).map(LocalNodeId),
            previous_hop_local_id: row.get::<Option<i64>, _>(3).map(LocalNodeId),
            hop_count: row.get::<i64, _>(4) as i32,
            last_use_timestamp: row.get::<Option<i64>, _>(5),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_fetch_request() {
        let mut db = Table::memory().unwrap();
        let uuid = RequestUuid::generate();
        db.insert_request(RouteRequestEntry {
            request_uuid: uuid,
            destination_local_id: LocalNodeId(42),
            previous_hop_local_id: None,
            remaining_hops_at_send: 10,
            max_ttl_epoch_ms: 9_999_999_999,
        })
        .unwrap();

        let fetched = db.request(&uuid).unwrap().unwrap();
        assert_eq!(fetched.destination_local_id, LocalNodeId(42));
        assert!(fetched.previous_hop_local_id.is_none());
    }

    #[test]
    fn broadcast_status_lifecycle() {
        let mut db = Table::memory().unwrap();
        let uuid = RequestUuid::generate();
        db.insert_request(RouteRequestEntry {
            request_uuid: uuid,
            destination_local_id: LocalNodeId(1),
            previous_hop_local_id: None,
            remaining_hops_at_send: 10,
            max_ttl_epoch_ms: 9_999_999_999,
        })
        .unwrap();

        db.insert_broadcast(&uuid, LocalNodeId(2)).unwrap();
        db.insert_broadcast(&uuid, LocalNodeId(3)).unwrap();
        assert_eq!(db.count_broadcasts(&uuid).unwrap(), 2);

        db.set_broadcast_pending(&uuid, LocalNodeId(2), true)
            .unwrap();
        assert!(db.has_pending_in_progress(&uuid, true).unwrap());

        db.delete_broadcast(&uuid, LocalNodeId(3)).unwrap();
        assert_eq!(db.count_broadcasts(&uuid).unwrap(), 1);
    }

    #[test]
    fn cascade_delete_request_removes_broadcast_rows() {
        let mut db = Table::memory().unwrap();
        let uuid = RequestUuid::generate();
        db.insert_request(RouteRequestEntry {
            request_uuid: uuid,
            destination_local_id: LocalNodeId(1),
            previous_hop_local_id: None,
            remaining_hops_at_send: 10,
            max_ttl_epoch_ms: 9_999_999_999,
        })
        .unwrap();
        db.insert_broadcast(&uuid, LocalNodeId(2)).unwrap();

        db.delete_request(&uuid).unwrap();
        assert_eq!(db.count_broadcasts(&uuid).unwrap(), 0);
    }

    #[test]
    fn cascade_delete_route_removes_usage_and_backtracking() {
        let mut db = Table::memory().unwrap();
        let discovery_uuid = RequestUuid::generate();
        let usage_uuid = RequestUuid::generate();

        db.insert_route(RouteEntry {
            discovery_uuid,
            destination_local_id: LocalNodeId(5),
            next_hop_local_id: Some(LocalNodeId(6)),
            previous_hop_local_id: None,
            hop_count: 1,
            last_use_timestamp: Some(1_000),
        })
        .unwrap();
        db.insert_usage(RouteUsage {
            usage_request_uuid: usage_uuid,
            route_entry_discovery_uuid: discovery_uuid,
            previous_hop_local_id: None,
            last_used_timestamp: Some(1_000),
        })
        .unwrap();
        db.insert_backtracking(&usage_uuid, LocalNodeId(9))
            .unwrap();

        db.delete_route(&discovery_uuid).unwrap();

        let (route, _) = db
            .most_recent_opened_route_to(LocalNodeId(5))
            .unwrap()
            .map_or((None, None), |(r, t)| (Some(r), t));
        assert!(route.is_none());
    }

    #[test]
    fn most_recent_opened_route_prefers_latest_usage() {
        let mut db = Table::memory().unwrap();

        let old_route = RequestUuid::generate();
        db.insert_route(RouteEntry {
            discovery_uuid: old_route,
            destination_local_id: LocalNodeId(7),
            next_hop_local_id: Some(LocalNodeId(8)),
            previous_hop_local_id: None,
            hop_count: 1,
            last_use_timestamp: Some(1_000),
        })
        .unwrap();
        db.insert_usage(RouteUsage {
            usage_request_uuid: RequestUuid::generate(),
            route_entry_discovery_uuid: old_route,
            previous_hop_local_id: None,
            last_used_timestamp: Some(1_000),
        })
        .unwrap();

        let new_route = RequestUuid::generate();
        db.insert_route(RouteEntry {
            discovery_uuid: new_route,
            destination_local_id: LocalNodeId(7),
            next_hop_local_id: Some(LocalNodeId(9)),
            previous_hop_local_id: None,
            hop_count: 2,
            last_use_timestamp: Some(5_000),
        })
        .unwrap();
        db.insert_usage(RouteUsage {
            usage_request_uuid: RequestUuid::generate(),
            route_entry_discovery_uuid: new_route,
            previous_hop_local_id: None,
            last_used_timestamp: Some(5_000),
        })
        .unwrap();

        let (route, _) = db.most_recent_opened_route_to(LocalNodeId(7)).unwrap().unwrap();
        assert_eq!(route.discovery_uuid, new_route);
    }

    #[test]
    fn backtracking_lets_reused_route_be_found_by_new_destination() {
        let mut db = Table::memory().unwrap();
        let route_uuid = RequestUuid::generate();
        let usage_uuid = RequestUuid::generate();

        db.insert_route(RouteEntry {
            discovery_uuid: route_uuid,
            destination_local_id: LocalNodeId(1),
            next_hop_local_id: Some(LocalNodeId(2)),
            previous_hop_local_id: None,
            hop_count: 1,
            last_use_timestamp: Some(1_000),
        })
        .unwrap();
        db.insert_usage(RouteUsage {
            usage_request_uuid: usage_uuid,
            route_entry_discovery_uuid: route_uuid,
            previous_hop_local_id: None,
            last_used_timestamp: Some(1_000),
        })
        .unwrap();
        db.insert_backtracking(&usage_uuid, LocalNodeId(99))
            .unwrap();

        let (route, _) = db
            .most_recent_opened_route_to(LocalNodeId(99))
            .unwrap()
            .unwrap();
        assert_eq!(route.discovery_uuid, route_uuid);
    }

    #[test]
    fn reap_stale_routes_deletes_only_inactive_routes() {
        let mut db = Table::memory().unwrap();
        let fresh = RequestUuid::generate();
        let stale = RequestUuid::generate();

        db.insert_route(RouteEntry {
            discovery_uuid: fresh,
            destination_local_id: LocalNodeId(1),
            next_hop_local_id: Some(LocalNodeId(2)),
            previous_hop_local_id: None,
            hop_count: 1,
            last_use_timestamp: Some(10_000),
        })
        .unwrap();
        db.insert_usage(RouteUsage {
            usage_request_uuid: RequestUuid::generate(),
            route_entry_discovery_uuid: fresh,
            previous_hop_local_id: None,
            last_used_timestamp: Some(10_000),
        })
        .unwrap();

        db.insert_route(RouteEntry {
            discovery_uuid: stale,
            destination_local_id: LocalNodeId(3),
            next_hop_local_id: Some(LocalNodeId(4)),
            previous_hop_local_id: None,
            hop_count: 1,
            last_use_timestamp: Some(1_000),
        })
        .unwrap();
        db.insert_usage(RouteUsage {
            usage_request_uuid: RequestUuid::generate(),
            route_entry_discovery_uuid: stale,
            previous_hop_local_id: None,
            last_used_timestamp: Some(1_000),
        })
        .unwrap();

        let deleted = db.reap_stale_routes(5_000).unwrap();
        assert_eq!(deleted, vec![stale]);
        assert!(db.route(&fresh).unwrap().is_some());
        assert!(db.route(&stale).unwrap().is_none());
    }
}
