//! Ordered write batches.

/// One batched write. A `None` value deletes the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchEntry {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// An ordered list of writes applied as a single versioned transition.
///
/// Entries are applied strictly in insertion order and are not deduplicated;
/// when a key appears more than once the later entry wins.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn new() -> Self {
        Batch::default()
    }

    /// Appends one entry.
    pub fn add(&mut self, key: Vec<u8>, value: Option<Vec<u8>>) {
        self.entries.push(BatchEntry { key, value });
    }

    /// Appends an insert or update.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.add(key, Some(value));
    }

    /// Appends a delete.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.add(key, None);
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IntoIterator for Batch {
    type Item = BatchEntry;
    type IntoIter = std::vec::IntoIter<BatchEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
