//! The in-memory record set and the page merge step.

use std::collections::HashMap;

use super::types::Record;

/// All known generations, keyed by id.
///
/// Insertion order is kept so that download batches and checkpoints are
/// produced in a stable order, but nothing depends on it.
#[derive(Debug, Clone, Default)]
pub struct RecordSet {
    records: Vec<Record>,
    index: HashMap<String, usize>,
}

impl RecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from stored records. Duplicate ids keep the first copy.
    pub fn from_records(records: Vec<Record>) -> Self {
        let mut set = Self::new();
        for record in records {
            if set.index.contains_key(&record.id) {
                tracing::warn!(id = %record.id, "Duplicate generation id in checkpoint, keeping first");
                continue;
            }
            set.index.insert(record.id.clone(), set.records.len());
            set.records.push(record);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Record> {
        match self.index.get(id) {
            Some(&i) => Some(&mut self.records[i]),
            None => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    /// Records whose assets have not had a full download pass yet.
    pub fn undownloaded(&self) -> impl Iterator<Item = &Record> {
        self.records.iter().filter(|r| !r.downloaded)
    }

    /// Merge one fetched page into the set.
    ///
    /// Stored records still `PENDING` upstream are dropped first so a later
    /// page can re-supply them in their final state. Fetched records whose
    /// id is already known are ignored; the rest are admitted with
    /// `downloaded = false` and a freshly built manifest.
    ///
    /// Returns the number of admitted records. Pagination must not use this
    /// count to detect the last page; it depends on the raw page length.
    pub fn merge_page(&mut self, page: Vec<Record>) -> usize {
        let before = self.records.len();
        self.records.retain(|r| !r.status.is_pending());
        let dropped = before - self.records.len();
        if dropped > 0 {
            self.rebuild_index();
            tracing::debug!(dropped, "Dropped pending generations before merge");
        }

        let mut admitted = 0usize;
        for record in page {
            if self.index.contains_key(&record.id) {
                continue;
            }
            let record = record.admit();
            self.index.insert(record.id.clone(), self.records.len());
            self.records.push(record);
            admitted += 1;
        }
        admitted
    }

    /// Clear the `downloaded` flag on every record with failed assets so the
    /// next download pass retries them. Returns the number of records reset.
    pub fn reset_failed(&mut self) -> usize {
        let mut count = 0;
        for record in &mut self.records {
            if record.downloaded && !record.failed_assets.is_empty() {
                record.downloaded = false;
                count += 1;
            }
        }
        count
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
    }
}
