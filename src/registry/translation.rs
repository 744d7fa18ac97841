use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::BusError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationEntry {
    pub remote_id: i32,
    pub name: String,
    /// `None` until the local side has registered the same name
    pub local_id: Option<i32>,
}

/// Maps one peer's ids (types or senders) to local ids, going through the names the peer
///  described. There is one table for types and one for senders per endpoint.
///
/// The table only lives as long as the peer session: it is cleared when the session drops, and
///  the peer re-describes all names after reconnecting.
#[derive(Debug)]
pub struct TranslationTable {
    entries: FxHashMap<i32, TranslationEntry>,
    capacity: usize,
}

impl TranslationTable {
    pub fn new(capacity: usize) -> TranslationTable {
        TranslationTable {
            entries: Default::default(),
            capacity,
        }
    }

    /// Records a peer's description. Re-describing a known id is allowed, and it replaces the
    ///  previous entry (which is a no-op if nothing changed).
    pub fn describe(&mut self, remote_id: i32, name: &str, local_id: Option<i32>) -> Result<(), BusError> {
        if remote_id < 0 {
            return Err(BusError::InvalidId(format!("remote id {} for {:?} is negative", remote_id, name)));
        }
        if !self.entries.contains_key(&remote_id) && self.entries.len() >= self.capacity {
            return Err(BusError::TableFull(format!("too many remote names ({}) describing {:?}", self.capacity, name)));
        }

        trace!("remote id {} is {:?}, local id {:?}", remote_id, name, local_id);
        self.entries.insert(remote_id, TranslationEntry {
            remote_id,
            name: name.to_string(),
            local_id,
        });
        Ok(())
    }

    /// The local id for a remote id, if the peer described it and it is known locally
    pub fn local_id(&self, remote_id: i32) -> Option<i32> {
        self.entries.get(&remote_id)
            .and_then(|e| e.local_id)
    }

    pub fn get(&self, remote_id: i32) -> Option<&TranslationEntry> {
        self.entries.get(&remote_id)
    }

    /// Retroactively maps a name the peer described before it was known locally. Returns the
    ///  number of entries that were fixed up.
    pub fn resolve_name(&mut self, name: &str, local_id: i32) -> usize {
        let mut num_resolved = 0;
        for e in self.entries.values_mut() {
            if e.local_id.is_none() && e.name == name {
                e.local_id = Some(local_id);
                num_resolved += 1;
            }
        }
        num_resolved
    }

    /// all entries, ordered by remote id
    pub fn entries(&self) -> Vec<&TranslationEntry> {
        let mut result = self.entries.values().collect::<Vec<_>>();
        result.sort_by_key(|e| e.remote_id);
        result
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_describe_and_translate() {
        let mut table = TranslationTable::new(10);
        table.describe(4, "Tracker0", Some(0)).unwrap();
        table.describe(7, "Button0", None).unwrap();

        assert_eq!(table.local_id(4), Some(0));
        assert_eq!(table.local_id(7), None);
        assert_eq!(table.local_id(5), None);
        assert_eq!(table.get(7).map(|e| e.name.as_str()), Some("Button0"));
    }

    #[test]
    fn test_redescribe_is_idempotent() {
        let mut table = TranslationTable::new(1);
        table.describe(4, "Tracker0", Some(0)).unwrap();
        table.describe(4, "Tracker0", Some(0)).unwrap();
        assert_eq!(table.len(), 1);
        assert!(matches!(table.describe(5, "Other", None), Err(BusError::TableFull(_))));
    }

    #[test]
    fn test_entries_are_ordered_by_remote_id() {
        let mut table = TranslationTable::new(10);
        table.describe(9, "b", None).unwrap();
        table.describe(2, "a", Some(0)).unwrap();

        let remote_ids = table.entries().iter().map(|e| e.remote_id).collect::<Vec<_>>();
        assert_eq!(remote_ids, vec![2, 9]);
    }

    #[test]
    fn test_resolve_name() {
        let mut table = TranslationTable::new(10);
        table.describe(1, "a", None).unwrap();
        table.describe(2, "b", None).unwrap();
        table.describe(3, "a", Some(9)).unwrap();

        assert_eq!(table.resolve_name("a", 5), 1);
        assert_eq!(table.local_id(1), Some(5));
        assert_eq!(table.local_id(2), None);
        assert_eq!(table.local_id(3), Some(9));
        assert_eq!(table.resolve_name("a", 5), 0);
    }

    #[test]
    fn test_clear() {
        let mut table = TranslationTable::new(10);
        table.describe(1, "a", Some(0)).unwrap();
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.local_id(1), None);
    }

    #[test]
    fn test_negative_remote_id() {
        let mut table = TranslationTable::new(10);
        assert!(matches!(table.describe(-1, "a", None), Err(BusError::InvalidId(_))));
    }
}
