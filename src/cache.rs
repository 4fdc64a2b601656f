//! Fixed-capacity LRU cache of image cells
//!
//! Entries live in a table allocated once at startup and are chained from most- to
//! least-recently-used through `next` indices, with [`NIL`] marking the end of the list.
//! Clean entries are always evicted before dirty ones. When every entry is dirty the whole
//! table is written back first; if the store refuses the writes the cache is exhausted.

use thiserror::Error;

use crate::image::ImageStore;
use crate::Cell;

/// End-of-list index
const NIL: u16 = u16::MAX;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("not enough memory: all {capacity} cache entries are dirty, cannot admit cell {address}")]
    Exhausted { address: Cell, capacity: usize },
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    address: Cell,
    dirty: bool,
    value: Cell,
    next: u16,
}

impl Entry {
    const EMPTY: Entry = Entry {
        address: 0,
        dirty: false,
        value: 0,
        next: NIL,
    };
}

/// Position of an entry in the list together with its predecessor
#[derive(Debug, Clone, Copy)]
struct Link {
    index: u16,
    prev: u16,
}

/// Result of walking the list for an address
struct Scan {
    found: Option<Link>,
    /// Least-recently-used clean entry seen before the walk stopped
    victim: Option<Link>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Writes dropped because the store already held the value
    pub elided: u64,
    pub evictions: u64,
    pub write_backs: u64,
}

pub struct CellCache<S> {
    store: S,
    entries: Box<[Entry]>,
    len: u16,
    head: u16,
    stats: CacheStats,
}

impl<S: ImageStore> CellCache<S> {
    /// Allocate a cache of `capacity` entries in front of `store`.
    ///
    /// # Panics
    ///
    /// If `capacity` is zero or does not fit below the end-of-list index.
    pub fn new(store: S, capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity < NIL as usize,
            "invalid cache capacity {capacity}"
        );
        CellCache {
            store,
            entries: vec![Entry::EMPTY; capacity].into_boxed_slice(),
            len: 0,
            head: NIL,
            stats: CacheStats::default(),
        }
    }

    pub fn get(&mut self, address: Cell) -> Result<Cell, CacheError> {
        let scan = self.scan(address);
        if let Some(link) = scan.found {
            self.stats.hits += 1;
            self.promote(link);
            return Ok(self.entry(link.index).value);
        }

        self.stats.misses += 1;
        let value = self.store.cell_get(address);
        self.admit(address, value, false, scan.victim)?;
        Ok(value)
    }

    pub fn put(&mut self, address: Cell, value: Cell) -> Result<(), CacheError> {
        let scan = self.scan(address);
        if let Some(link) = scan.found {
            self.stats.hits += 1;
            let entry = self.entry_mut(link.index);
            if entry.value != value {
                entry.value = value;
                entry.dirty = true;
            }
            self.promote(link);
            return Ok(());
        }

        self.stats.misses += 1;
        if self.store.cell_get(address) == value {
            self.stats.elided += 1;
            return Ok(());
        }
        self.admit(address, value, true, scan.victim)
    }

    /// Write every dirty entry back and flush the store.
    pub fn sync(&mut self) {
        self.write_back();
        self.store.sync();
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, address: Cell) -> bool {
        self.iter().any(|(cached, _, _)| cached == address)
    }

    /// `Some(dirty)` for a cached address
    pub fn is_dirty(&self, address: Cell) -> Option<bool> {
        self.iter()
            .find(|(cached, _, _)| *cached == address)
            .map(|(_, dirty, _)| dirty)
    }

    /// Entries as `(address, dirty, value)` from most to least recently used
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            entries: &self.entries,
            cursor: self.head,
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Release the store without syncing.
    pub fn into_store(self) -> S {
        self.store
    }

    fn entry(&self, index: u16) -> &Entry {
        &self.entries[index as usize]
    }

    fn entry_mut(&mut self, index: u16) -> &mut Entry {
        &mut self.entries[index as usize]
    }

    /// Walk from the most recently used entry, remembering the last clean entry passed.
    fn scan(&self, address: Cell) -> Scan {
        let mut scan = Scan {
            found: None,
            victim: None,
        };
        let mut prev = NIL;
        let mut cursor = self.head;
        while cursor != NIL {
            let entry = self.entry(cursor);
            if entry.address == address {
                scan.found = Some(Link {
                    index: cursor,
                    prev,
                });
                break;
            }
            if !entry.dirty {
                scan.victim = Some(Link {
                    index: cursor,
                    prev,
                });
            }
            prev = cursor;
            cursor = entry.next;
        }
        scan
    }

    fn unlink(&mut self, link: Link) {
        let next = self.entry(link.index).next;
        if link.prev == NIL {
            self.head = next;
        } else {
            self.entry_mut(link.prev).next = next;
        }
    }

    fn push_front(&mut self, index: u16) {
        let head = self.head;
        self.entry_mut(index).next = head;
        self.head = index;
    }

    fn promote(&mut self, link: Link) {
        if link.prev != NIL {
            self.unlink(link);
            self.push_front(link.index);
        }
    }

    fn admit(
        &mut self,
        address: Cell,
        value: Cell,
        dirty: bool,
        victim: Option<Link>,
    ) -> Result<(), CacheError> {
        let index = if self.len() < self.capacity() {
            self.len += 1;
            self.len - 1
        } else {
            let link = match victim {
                Some(link) => link,
                None => self.reclaim(address)?,
            };
            self.unlink(link);
            self.stats.evictions += 1;
            link.index
        };

        *self.entry_mut(index) = Entry {
            address,
            dirty,
            value,
            next: NIL,
        };
        self.push_front(index);
        Ok(())
    }

    /// Every entry is dirty: clean the table through the store and pick the LRU entry.
    fn reclaim(&mut self, address: Cell) -> Result<Link, CacheError> {
        self.write_back();
        self.scan(address).victim.ok_or(CacheError::Exhausted {
            address,
            capacity: self.capacity(),
        })
    }

    fn write_back(&mut self) {
        let len = self.len as usize;
        for entry in self.entries[..len].iter_mut().filter(|entry| entry.dirty) {
            if self.store.cell_put(entry.address, entry.value) {
                entry.dirty = false;
                self.stats.write_backs += 1;
            }
        }
    }
}

pub struct Iter<'a> {
    entries: &'a [Entry],
    cursor: u16,
}

impl Iterator for Iter<'_> {
    type Item = (Cell, bool, Cell);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.get(self.cursor as usize)?;
        self.cursor = entry.next;
        Some((entry.address, entry.dirty, entry.value))
    }
}
