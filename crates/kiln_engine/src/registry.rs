//! Bidirectional id ↔ object table with keyed deduplication.
//!
//! Stored as an arena: a slot vector whose indices are the public ids, plus a
//! free list so ids are recycled, plus a side map from a dedup key to the id.
//! Registering a value whose key is already present returns the existing id
//! without storing the duplicate — this is what prevents a second GPU upload
//! of a resource sourced from the same logical asset identity.
//!
//! Ids are unique and stable for an entry's lifetime; a removed id answers
//! `get` with `None` until the slot is reused.

use std::collections::HashMap;

use crate::error::EngineError;

struct Entry<T> {
    value: T,
    key: Option<String>,
}

/// Capacity-bounded object registry.
pub struct Registry<T> {
    name: &'static str,
    slots: Vec<Option<Entry<T>>>,
    free: Vec<u32>,
    by_key: HashMap<String, u32>,
    capacity: usize,
}

impl<T> Registry<T> {
    /// `name` labels log and error messages; `capacity` bounds live entries.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            slots: Vec::new(),
            free: Vec::new(),
            by_key: HashMap::new(),
            capacity,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up the id registered under `key`, if any.
    pub fn find(&self, key: &str) -> Option<u32> {
        self.by_key.get(key).copied()
    }

    /// Whether an object with this dedup key is already registered.
    ///
    /// Callers use this to decide whether GPU-side initialization must run
    /// before registering: only the first logically-equal object is uploaded.
    pub fn is_registered(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    /// Registers `value`, returning its id.
    ///
    /// With a key that is already present, returns the existing id and drops
    /// `value`.  Exceeding capacity is an error for this registration only.
    pub fn register(&mut self, value: T, key: Option<String>) -> Result<u32, EngineError> {
        if let Some(k) = key.as_deref() {
            if let Some(existing) = self.by_key.get(k) {
                return Ok(*existing);
            }
        }
        if self.len() >= self.capacity {
            log::error!("registry '{}' at capacity ({})", self.name, self.capacity);
            return Err(EngineError::RegistryFull {
                name: self.name,
                capacity: self.capacity,
            });
        }
        let id = match self.free.pop() {
            Some(recycled) => recycled,
            None => {
                self.slots.push(None);
                (self.slots.len() - 1) as u32
            }
        };
        if let Some(k) = &key {
            self.by_key.insert(k.clone(), id);
        }
        self.slots[id as usize] = Some(Entry { value, key });
        Ok(id)
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.slots
            .get(id as usize)
            .and_then(|s| s.as_ref())
            .map(|e| &e.value)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slots
            .get_mut(id as usize)
            .and_then(|s| s.as_mut())
            .map(|e| &mut e.value)
    }

    /// Removes both mappings for `id`; subsequent `get` returns `None`.
    pub fn remove(&mut self, id: u32) -> Option<T> {
        let entry = self.slots.get_mut(id as usize).and_then(Option::take)?;
        if let Some(k) = &entry.key {
            self.by_key.remove(k);
        }
        self.free.push(id);
        Some(entry.value)
    }

    /// Ids of all live entries, in slot order.
    pub fn ids(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Removes and returns every live entry.  Used by the shutdown sweep.
    pub fn drain(&mut self) -> Vec<(u32, T)> {
        let ids = self.ids();
        ids.into_iter()
            .filter_map(|id| self.remove(id).map(|v| (id, v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_returns_existing_id() {
        let mut r = Registry::new("test", 8);
        let a = r.register("mesh-a", Some("assets/a".into())).unwrap();
        let b = r.register("mesh-a-again", Some("assets/a".into())).unwrap();
        assert_eq!(a, b);
        assert_eq!(r.len(), 1);
        // The duplicate was dropped, the original value kept.
        assert_eq!(r.get(a), Some(&"mesh-a"));
    }

    #[test]
    fn unkeyed_entries_never_dedup() {
        let mut r = Registry::new("test", 8);
        let a = r.register(1, None).unwrap();
        let b = r.register(1, None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn remove_clears_both_mappings() {
        let mut r = Registry::new("test", 8);
        let id = r.register(7, Some("seven".into())).unwrap();
        assert!(r.is_registered("seven"));
        assert_eq!(r.remove(id), Some(7));
        assert_eq!(r.get(id), None);
        assert!(!r.is_registered("seven"));
        // A new registration under the same key gets a fresh (recycled) slot.
        let id2 = r.register(8, Some("seven".into())).unwrap();
        assert_eq!(id2, id);
        assert_eq!(r.get(id2), Some(&8));
    }

    #[test]
    fn capacity_is_enforced_per_registration() {
        let mut r = Registry::new("test", 2);
        r.register('a', None).unwrap();
        r.register('b', None).unwrap();
        assert!(matches!(
            r.register('c', None),
            Err(EngineError::RegistryFull { capacity: 2, .. })
        ));
        // Existing entries are unaffected.
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn ids_are_recycled() {
        let mut r = Registry::new("test", 4);
        let a = r.register(0, None).unwrap();
        r.remove(a);
        let b = r.register(1, None).unwrap();
        assert_eq!(a, b);
    }
}
