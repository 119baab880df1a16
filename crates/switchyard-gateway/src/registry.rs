//! Instance registry owned by the gateway.
//!
//! Three maps kept in lock-step: instance name -> owning connection, group
//! name -> member instances, and connection -> registered names (the reverse
//! index used for bulk cleanup). A fourth map tracks which instances each
//! connection holds a LOCK on, so cleanup can issue best-effort unlocks.
//!
//! All operations are synchronous; the gateway guards the registry with a
//! single mutex and never awaits while holding it, which keeps every
//! validate-then-apply sequence atomic.

use std::collections::HashMap;
use switchyard_core::{GatewayError, Result};

/// What `remove_connection` found for a closing connection.
#[derive(Debug, Default)]
pub struct ConnectionCleanup {
    /// Instance names the connection had registered, now removed.
    pub instances: Vec<String>,
    /// Instance names the connection held locks on, to be unlocked
    /// best-effort.
    pub locked: Vec<String>,
}

/// Registry mapping instance names to owning connections and groups.
#[derive(Debug, Default)]
pub struct Registry {
    instances: HashMap<String, u64>,
    groups: HashMap<String, Vec<String>>,
    by_connection: HashMap<u64, Vec<String>>,
    locks: HashMap<u64, Vec<String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a batch of `(instance_name, group_name)` pairs for a
    /// connection.
    ///
    /// The whole batch is validated before anything is applied; a single bad
    /// pair rejects the call with the registry unchanged.
    pub fn register(&mut self, conn_id: u64, pairs: &[(String, String)]) -> Result<()> {
        // Validate first, mutate after: one bad pair fails the whole batch.
        for (instance, group) in pairs {
            if instance.is_empty() || group.is_empty() {
                return Err(GatewayError::InvalidMessage {
                    message: "instance_name and group_name must be non-empty".to_string(),
                });
            }
            if self.instances.contains_key(instance) {
                return Err(GatewayError::InstanceAlreadyRegistered {
                    group: group.clone(),
                    name: instance.clone(),
                });
            }
        }
        // Duplicates within the batch itself.
        for (i, (instance, group)) in pairs.iter().enumerate() {
            if pairs[..i].iter().any(|(other, _)| other == instance) {
                return Err(GatewayError::InstanceAlreadyRegistered {
                    group: group.clone(),
                    name: instance.clone(),
                });
            }
        }

        for (instance, group) in pairs {
            self.instances.insert(instance.clone(), conn_id);
            self.groups
                .entry(group.clone())
                .or_default()
                .push(instance.clone());
            self.by_connection
                .entry(conn_id)
                .or_default()
                .push(instance.clone());
        }

        Ok(())
    }

    /// Deregister instances by name.
    ///
    /// Validated as a batch like `register`: an unknown name rejects the
    /// whole call.
    pub fn deregister(&mut self, names: &[String]) -> Result<()> {
        for name in names {
            if !self.instances.contains_key(name) {
                return Err(GatewayError::InstanceNotFound { name: name.clone() });
            }
        }

        for name in names {
            self.remove_instance(name);
        }

        Ok(())
    }

    fn remove_instance(&mut self, name: &str) {
        if let Some(conn_id) = self.instances.remove(name) {
            if let Some(owned) = self.by_connection.get_mut(&conn_id) {
                owned.retain(|n| n != name);
                if owned.is_empty() {
                    self.by_connection.remove(&conn_id);
                }
            }
        }
        // An empty group is removed entirely, never left dangling.
        self.groups.retain(|_, members| {
            members.retain(|n| n != name);
            !members.is_empty()
        });
    }

    /// Connection that currently owns an instance name.
    pub fn owner_of(&self, name: &str) -> Option<u64> {
        self.instances.get(name).copied()
    }

    /// All groups with at least one registered instance.
    pub fn groups(&self) -> &HashMap<String, Vec<String>> {
        &self.groups
    }

    /// Members of one group.
    pub fn list_group(&self, group: &str) -> Result<Vec<String>> {
        self.groups
            .get(group)
            .cloned()
            .ok_or_else(|| GatewayError::GroupNotFound {
                name: group.to_string(),
            })
    }

    /// Record that a connection holds a lock on an instance.
    pub fn record_lock(&mut self, conn_id: u64, name: &str) {
        let locks = self.locks.entry(conn_id).or_default();
        if !locks.iter().any(|n| n == name) {
            locks.push(name.to_string());
        }
    }

    /// Clear a previously recorded lock.
    pub fn clear_lock(&mut self, conn_id: u64, name: &str) {
        if let Some(locks) = self.locks.get_mut(&conn_id) {
            locks.retain(|n| n != name);
            if locks.is_empty() {
                self.locks.remove(&conn_id);
            }
        }
    }

    /// Remove everything a closing connection owned.
    ///
    /// Returns the instance names that were deregistered and the names the
    /// connection still held locks on.
    pub fn remove_connection(&mut self, conn_id: u64) -> ConnectionCleanup {
        let instances = self.by_connection.remove(&conn_id).unwrap_or_default();
        for name in &instances {
            self.instances.remove(name);
            self.groups.retain(|_, members| {
                members.retain(|n| n != name);
                !members.is_empty()
            });
        }

        let locked = self.locks.remove(&conn_id).unwrap_or_default();

        ConnectionCleanup { instances, locked }
    }

    /// Number of registered instances.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}
