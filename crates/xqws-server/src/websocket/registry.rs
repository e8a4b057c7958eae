//! Process-wide table of live connections.
//!
//! Lookups resolve ids to `Arc<Connection>` handles and release the map
//! before any write happens, so a slow or closed peer never holds up
//! registration, removal or other deliveries.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};
use xqws_core::ConnectionId;

use super::connection::Connection;
use crate::errors::{RegistryError, Result, SendError};
use crate::query::{OutputOptions, QueryValue};

/// Outcome of a fan-out delivery.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Connections the value was queued for.
    pub delivered: Vec<ConnectionId>,
    /// Registered connections whose write failed.
    pub failed: Vec<ConnectionId>,
    /// Requested ids with no registered connection.
    pub missing: Vec<ConnectionId>,
}

impl DeliveryReport {
    /// Number of successful deliveries.
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }
}

/// Every live connection by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    next_seq: AtomicU64,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh `ws-<n>` id not currently registered.
    pub fn next_id(&self) -> ConnectionId {
        loop {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
            let id = ConnectionId::from_sequence(seq);
            if !self.connections.contains_key(&id) {
                return id;
            }
        }
    }

    /// Insert a connection under its current id.
    pub fn register(&self, connection: Arc<Connection>) -> Result<ConnectionId> {
        let id = connection.id();
        match self.connections.entry(id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                let _ = slot.insert(connection);
                debug!(conn_id = %id, "connection registered");
                Ok(id)
            }
        }
    }

    /// Remove a connection. Absent ids are ignored.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(id).map(|(_, conn)| conn);
        if removed.is_some() {
            debug!(conn_id = %id, "connection unregistered");
        }
        removed
    }

    /// Resolve an id.
    pub fn lookup(&self, id: &ConnectionId) -> Result<Arc<Connection>> {
        self.connections
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    /// Move a connection to a new id.
    ///
    /// Fails with `DuplicateId` if `new` is taken and `NotFound` if `old` is
    /// not registered. On failure the connection keeps its old id.
    pub fn rekey(&self, old: &ConnectionId, new: ConnectionId) -> Result<()> {
        if *old == new {
            return self.lookup(old).map(|_| ());
        }
        if self.connections.contains_key(&new) {
            return Err(RegistryError::DuplicateId(new));
        }
        let (_, conn) = self
            .connections
            .remove(old)
            .ok_or_else(|| RegistryError::NotFound(old.clone()))?;

        let taken = match self.connections.entry(new.clone()) {
            Entry::Occupied(_) => true,
            Entry::Vacant(slot) => {
                conn.set_id(new.clone());
                let _ = slot.insert(conn.clone());
                false
            }
        };
        if taken {
            let _ = self.connections.insert(old.clone(), conn);
            return Err(RegistryError::DuplicateId(new));
        }
        debug!(old = %old, new = %new, "connection re-keyed");
        Ok(())
    }

    /// Snapshot of all registered ids.
    pub fn ids(&self) -> BTreeSet<ConnectionId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    /// Connections holding a subscription to `destination`.
    pub fn subscribers(&self, destination: &str) -> Vec<Arc<Connection>> {
        self.snapshot()
            .into_iter()
            .filter(|c| c.subscription_for(destination).is_some())
            .collect()
    }

    /// Point-to-point delivery.
    ///
    /// A connection that closed while still registered is reported as
    /// `NotFound`.
    pub fn send_to(
        &self,
        id: &ConnectionId,
        value: &QueryValue,
        options: &OutputOptions,
    ) -> Result<()> {
        let conn = self.lookup(id)?;
        conn.send(value, options).map_err(|e| match e {
            SendError::Closed => RegistryError::NotFound(id.clone()),
            other => RegistryError::Send(other),
        })
    }

    /// Deliver to every connection except `exclude`.
    pub fn broadcast(
        &self,
        value: &QueryValue,
        options: &OutputOptions,
        exclude: Option<&ConnectionId>,
    ) -> DeliveryReport {
        let targets = self
            .snapshot()
            .into_iter()
            .filter(|c| exclude.is_none_or(|x| c.id() != *x));
        deliver(targets, value, options, DeliveryReport::default())
    }

    /// Deliver to exactly the named connections; unknown ids are skipped.
    pub fn multicast(
        &self,
        value: &QueryValue,
        options: &OutputOptions,
        ids: &[ConnectionId],
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut targets = Vec::with_capacity(ids.len());
        let mut seen = BTreeSet::new();
        for id in ids {
            if !seen.insert(id) {
                continue;
            }
            match self.lookup(id) {
                Ok(conn) => targets.push(conn),
                Err(_) => report.missing.push(id.clone()),
            }
        }
        deliver(targets, value, options, report)
    }

    /// Deliver to everyone.
    pub fn emit(&self, value: &QueryValue, options: &OutputOptions) -> DeliveryReport {
        self.broadcast(value, options, None)
    }

    /// Deliver to every subscriber of `destination`.
    pub fn publish(
        &self,
        destination: &str,
        value: &QueryValue,
        options: &OutputOptions,
    ) -> DeliveryReport {
        let mut options = options.clone();
        options.destination = Some(destination.to_owned());
        deliver(
            self.subscribers(destination),
            value,
            &options,
            DeliveryReport::default(),
        )
    }

    /// Close and remove every connection. Returns how many were closed.
    pub fn close_all(&self, code: u16, reason: &str) -> usize {
        let connections = self.snapshot();
        let mut closed = 0;
        for conn in &connections {
            if conn.close(code, reason) {
                closed += 1;
            }
            let _ = self.unregister(&conn.id());
        }
        closed
    }
}

fn deliver(
    targets: impl IntoIterator<Item = Arc<Connection>>,
    value: &QueryValue,
    options: &OutputOptions,
    mut report: DeliveryReport,
) -> DeliveryReport {
    for conn in targets {
        let id = conn.id();
        match conn.send(value, options) {
            Ok(()) => report.delivered.push(id),
            Err(e) => {
                warn!(conn_id = %id, error = %e, "delivery failed, skipping recipient");
                report.failed.push(id);
            }
        }
    }
    report
}
