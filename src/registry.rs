//! Name-to-id registries for stream names and event type names.
//!
//! Records on disk refer to streams and event types by compact `u32` ids. A
//! name gets its id the first time a transaction uses it; the transaction
//! carries a registration record ahead of its data records. Until that
//! transaction is written, the id is only *reserved* and can be given back.

use std::collections::HashMap;

use crate::error::Error;

/// Outcome of [`NameRegistry::get_or_reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameLookup {
    /// The name already has an id (registered, or reserved earlier in the
    /// same transaction).
    Existing(u32),
    /// The name was just given a new id; the caller must write a
    /// registration record for it.
    Reserved(u32),
}

impl NameLookup {
    /// The id, whichever way it was obtained.
    pub fn id(self) -> u32 {
        match self {
            NameLookup::Existing(id) | NameLookup::Reserved(id) => id,
        }
    }
}

/// Bidirectional name/id map with transactional reservations.
#[derive(Debug, Default)]
pub struct NameRegistry {
    ids: HashMap<String, u32>,
    /// Index is the id.
    names: Vec<String>,
    /// Number of trailing entries in `names` that are reservations.
    reserved: usize,
}

impl NameRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of `name`, if registered or reserved.
    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.ids.get(name).copied()
    }

    /// Name registered under `id`.
    pub fn name_of(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    /// Return the id of `name`, reserving the next free id if it has none.
    pub fn get_or_reserve(&mut self, name: &str) -> NameLookup {
        if let Some(id) = self.lookup(name) {
            return NameLookup::Existing(id);
        }
        let id = self.names.len() as u32;
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        self.reserved += 1;
        NameLookup::Reserved(id)
    }

    /// Keep every outstanding reservation. Called once the transaction that
    /// registers them is in the log.
    pub fn confirm_reservations(&mut self) {
        self.reserved = 0;
    }

    /// Drop every outstanding reservation.
    pub fn discard_reservations(&mut self) {
        for _ in 0..self.reserved {
            if let Some(name) = self.names.pop() {
                self.ids.remove(&name);
            }
        }
        self.reserved = 0;
    }

    /// Register `name` under `id` while replaying the log.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptRecord`] if `id` is not the next free id or the
    /// name is already registered.
    pub fn register(&mut self, id: u32, name: &str, position: i64) -> Result<(), Error> {
        if id as usize != self.names.len() || self.ids.contains_key(name) {
            return Err(Error::CorruptRecord {
                position,
                detail: format!(
                    "registration of '{name}' as id {id} conflicts with {} known names",
                    self.names.len()
                ),
            });
        }
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        Ok(())
    }

    /// Number of registered and reserved names.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the registry holds no names.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
