//! In-memory ordered view of a library.
//!
//! The cache owns the [`HashIndex`] so both change through the same methods.
//! Structural changes (insert, remove, relocate) and edits to the sort key
//! mark the cache as needing a resort; the library writer resorts once per
//! mutation before publishing the snapshot.

use crate::error::{Result, ShelfError};
use crate::index::HashIndex;
use crate::types::{ModelRecord, Page, RecordFilter, SortKey, SortOrder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Tag with its occurrence count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCount {
    pub tag: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct LibraryCache {
    records: HashMap<PathBuf, Arc<ModelRecord>>,
    order: Vec<PathBuf>,
    sort: SortOrder,
    index: HashIndex,
    tag_counts: HashMap<String, usize>,
    base_models: BTreeMap<String, usize>,
    needs_resort: bool,
    resort_count: u64,
}

impl LibraryCache {
    pub fn new(sort: SortOrder) -> Self {
        Self {
            sort,
            ..Default::default()
        }
    }

    /// Build a sorted cache from stored records.
    pub fn from_records(records: impl IntoIterator<Item = ModelRecord>, sort: SortOrder) -> Result<Self> {
        let mut cache = Self::new(sort);
        for record in records {
            cache.insert(record)?;
        }
        cache.resort(None);
        cache.verify()?;
        Ok(cache)
    }

    // ========================================
    // Mutations
    // ========================================

    /// Add a record for a path that is not yet catalogued.
    pub fn insert(&mut self, record: ModelRecord) -> Result<()> {
        if self.records.contains_key(&record.path) {
            return Err(ShelfError::Conflict(format!(
                "{} is already catalogued",
                record.path.display()
            )));
        }
        self.attach(record);
        Ok(())
    }

    /// Insert or replace the record at `record.path`.
    ///
    /// Returns the replaced record, if any.
    pub fn upsert(&mut self, record: ModelRecord) -> Option<Arc<ModelRecord>> {
        let previous = self.detach(&record.path);
        self.attach(record);
        previous
    }

    /// Edit the record at `path` in place.
    ///
    /// The closure must not change the path; use [`relocate`] for moves.
    ///
    /// [`relocate`]: LibraryCache::relocate
    pub fn update<F>(&mut self, path: &Path, edit: F) -> Result<ModelRecord>
    where
        F: FnOnce(&mut ModelRecord),
    {
        let current = self
            .records
            .get(path)
            .ok_or_else(|| ShelfError::NotFound(path.display().to_string()))?;
        let mut next = ModelRecord::clone(current);
        edit(&mut next);
        if next.path != path {
            return Err(ShelfError::consistency(format!(
                "update of {} attempted to change its path",
                path.display()
            )));
        }

        let sort_changed = self.sort_field_changed(current, &next);
        let was_dirty = self.needs_resort;
        self.detach(path);
        self.attach(next.clone());
        // same path set, so only a sort-key edit invalidates the order
        self.needs_resort = was_dirty || sort_changed;
        Ok(next)
    }

    /// Remove the record at `path`.
    pub fn remove(&mut self, path: &Path) -> Option<Arc<ModelRecord>> {
        let removed = self.detach(path);
        if removed.is_some() {
            self.needs_resort = true;
        }
        removed
    }

    /// Move the record at `from` to `to`.
    pub fn relocate(&mut self, from: &Path, to: PathBuf) -> Result<ModelRecord> {
        if self.records.contains_key(&to) {
            return Err(ShelfError::Conflict(format!(
                "{} is already catalogued",
                to.display()
            )));
        }
        let previous = self
            .detach(from)
            .ok_or_else(|| ShelfError::NotFound(from.display().to_string()))?;
        let mut moved = ModelRecord::clone(&previous);
        moved.relocate(to);
        self.attach(moved.clone());
        Ok(moved)
    }

    /// Re-establish ordering, optionally switching the sort order.
    pub fn resort(&mut self, order: Option<SortOrder>) {
        if let Some(order) = order {
            self.sort = order;
        }
        let sort = self.sort;
        let records = &self.records;
        let mut paths: Vec<PathBuf> = records.keys().cloned().collect();
        paths.sort_by(|a, b| sort.compare(&records[a], &records[b]));
        self.order = paths;
        self.needs_resort = false;
        self.resort_count += 1;
    }

    /// Force the next commit to resort.
    pub fn invalidate_order(&mut self) {
        self.needs_resort = true;
    }

    pub fn needs_resort(&self) -> bool {
        self.needs_resort
    }

    /// Number of resorts performed over this cache's lifetime.
    pub fn resort_count(&self) -> u64 {
        self.resort_count
    }

    pub fn sort_order(&self) -> SortOrder {
        self.sort
    }

    fn attach(&mut self, record: ModelRecord) {
        self.index.add(record.path.clone(), record.hash.clone());
        for tag in &record.tags {
            *self.tag_counts.entry(tag.clone()).or_insert(0) += 1;
        }
        if let Some(base) = record.base_model() {
            *self.base_models.entry(base.to_string()).or_insert(0) += 1;
        }
        self.records.insert(record.path.clone(), Arc::new(record));
        self.needs_resort = true;
    }

    fn detach(&mut self, path: &Path) -> Option<Arc<ModelRecord>> {
        let record = self.records.remove(path)?;
        self.index.remove_by_path(path);
        for tag in &record.tags {
            decrement(&mut self.tag_counts, tag);
        }
        if let Some(base) = record.base_model() {
            if let Some(count) = self.base_models.get_mut(base) {
                *count -= 1;
                if *count == 0 {
                    self.base_models.remove(base);
                }
            }
        }
        Some(record)
    }

    fn sort_field_changed(&self, before: &ModelRecord, after: &ModelRecord) -> bool {
        match self.sort.key {
            SortKey::Name => before.display_name != after.display_name,
            SortKey::Date => before.modified != after.modified,
            SortKey::Size => before.size != after.size,
        }
    }

    // ========================================
    // Consistency
    // ========================================

    /// Check that `paths` agree between records and index.
    pub fn verify_paths<'a>(&self, paths: impl IntoIterator<Item = &'a PathBuf>) -> Result<()> {
        for path in paths {
            match self.records.get(path) {
                Some(record) if !self.index.is_bound(path, &record.hash) => {
                    return Err(ShelfError::consistency(format!(
                        "{} is cached with hash {} but the index disagrees",
                        path.display(),
                        record.hash
                    )));
                }
                None if self.index.contains_path(path) => {
                    return Err(ShelfError::consistency(format!(
                        "{} is indexed but not cached",
                        path.display()
                    )));
                }
                _ => {}
            }
        }
        if self.index.len() != self.records.len() {
            return Err(ShelfError::consistency(format!(
                "index holds {} paths but cache holds {} records",
                self.index.len(),
                self.records.len()
            )));
        }
        Ok(())
    }

    /// Full consistency check over every record.
    pub fn verify(&self) -> Result<()> {
        let paths: Vec<PathBuf> = self.records.keys().cloned().collect();
        self.verify_paths(&paths)
    }

    // ========================================
    // Queries
    // ========================================

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in snapshot order.
    pub fn iter(&self) -> impl Iterator<Item = &ModelRecord> {
        self.order
            .iter()
            .filter_map(|path| self.records.get(path).map(|r| r.as_ref()))
    }

    pub fn by_path(&self, path: &Path) -> Option<&ModelRecord> {
        self.records.get(path).map(|r| r.as_ref())
    }

    /// Every record holding content `hash`; empty when none does.
    pub fn by_hash(&self, hash: &str) -> Vec<&ModelRecord> {
        self.index
            .paths_for(hash)
            .map(|paths| paths.iter().filter_map(|p| self.by_path(p)).collect())
            .unwrap_or_default()
    }

    pub fn index(&self) -> &HashIndex {
        &self.index
    }

    /// One page of filtered records in snapshot order.
    pub fn page(&self, offset: usize, limit: usize, filter: &RecordFilter) -> Page {
        let mut total = 0;
        let mut items = Vec::new();
        for record in self.iter().filter(|r| filter.matches(r)) {
            if total >= offset && items.len() < limit {
                items.push(record.clone());
            }
            total += 1;
        }
        Page {
            items,
            total,
            offset,
            limit,
        }
    }

    /// Most frequent tags, ties broken alphabetically. `limit` must be 1..=100.
    pub fn top_tags(&self, limit: usize) -> Result<Vec<TagCount>> {
        if !(1..=100).contains(&limit) {
            return Err(ShelfError::Validation {
                field: "limit".into(),
                message: format!("{} is outside 1..=100", limit),
            });
        }
        let mut tags: Vec<TagCount> = self
            .tag_counts
            .iter()
            .map(|(tag, count)| TagCount {
                tag: tag.clone(),
                count: *count,
            })
            .collect();
        tags.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tag.cmp(&b.tag)));
        tags.truncate(limit);
        Ok(tags)
    }

    /// Distinct base models, sorted.
    pub fn base_models(&self) -> Vec<String> {
        self.base_models.keys().cloned().collect()
    }

    /// Hashes held by more than one path.
    pub fn duplicate_groups(&self) -> BTreeMap<String, BTreeSet<PathBuf>> {
        self.index.duplicate_groups()
    }

    /// File names shared by records with different content.
    ///
    /// Names compare case-insensitively; each group is keyed by the smallest
    /// original spelling.
    pub fn filename_conflicts(&self) -> BTreeMap<String, BTreeSet<PathBuf>> {
        let mut by_name: HashMap<String, Vec<&ModelRecord>> = HashMap::new();
        for record in self.records.values() {
            by_name
                .entry(record.file_name.to_lowercase())
                .or_default()
                .push(record);
        }
        by_name
            .into_iter()
            .filter(|(_, records)| {
                let hashes: BTreeSet<&str> = records.iter().map(|r| r.hash.as_str()).collect();
                hashes.len() > 1
            })
            .filter_map(|(_, records)| {
                let name = records.iter().map(|r| r.file_name.clone()).min()?;
                Some((name, records.iter().map(|r| r.path.clone()).collect()))
            })
            .collect()
    }
}

fn decrement(counts: &mut HashMap<String, usize>, key: &str) {
    if let Some(count) = counts.get_mut(key) {
        *count -= 1;
        if *count == 0 {
            counts.remove(key);
        }
    }
}
