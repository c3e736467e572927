// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Per-transaction read and write logs.
//!
//! Both logs are owned by exactly one thread. The write log is special in
//! that owned lock words point into it from the shared lock array, so its
//! backing storage must not move while any entry holds a stripe. The log is
//! therefore a fixed-capacity boxed slice; filling it up aborts the
//! transaction with `EXTEND_WS` and the rollback path doubles the capacity
//! once every stripe has been released again.

use crate::types::{TWord, Word};

/// One recorded invisible read: the stripe that was consulted and the
/// version it carried at read time.
pub(crate) struct ReadEntry {
    pub version: Word,
    pub stripe: usize,
}

/// Growable append-only read log, drained at every transaction start.
pub(crate) struct ReadSet {
    entries: Vec<ReadEntry>,
}

impl ReadSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn push(&mut self, version: Word, stripe: usize) {
        self.entries.push(ReadEntry { version, stripe });
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReadEntry> {
        self.entries.iter()
    }

    /// Linear scan; typical transactions are small enough that locality
    /// beats an index.
    pub fn has_stripe(&self, stripe: usize) -> bool {
        self.entries.iter().any(|entry| entry.stripe == stripe)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }
}

/// One buffered write. `next` chains entries whose addresses collide on the
/// same stripe; chains only ever link forward within the array, and only the
/// chain tail reopens the stripe at commit or rollback.
pub(crate) struct WriteEntry {
    pub addr: *const TWord,
    pub value: Word,
    pub mask: Word,
    /// Free version the stripe carried before acquisition; restored on
    /// rollback.
    pub version: Word,
    pub stripe: usize,
    pub next: Option<usize>,
}

// entry addresses are packed into lock words with the low bit as owner tag
const _: () = assert!(std::mem::align_of::<WriteEntry>() >= 2);

impl WriteEntry {
    fn vacant() -> Self {
        Self {
            addr: std::ptr::null(),
            value: 0,
            mask: 0,
            version: 0,
            stripe: 0,
            next: None,
        }
    }
}

/// Fixed-capacity write log.
pub(crate) struct WriteSet {
    entries: Box<[WriteEntry]>,
    pub nb_entries: usize,
    /// Number of entries with a non-zero mask, i.e. entries that will reach
    /// memory at commit.
    pub has_writes: usize,
}

impl WriteSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| WriteEntry::vacant()).collect(),
            nb_entries: 0,
            has_writes: 0,
        }
    }

    pub fn reset(&mut self) {
        self.nb_entries = 0;
        self.has_writes = 0;
    }

    pub fn is_full(&self) -> bool {
        self.nb_entries == self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Address of the slot the next [`append`](Self::append) will fill,
    /// suitable for packing into a lock word before the entry is populated.
    pub fn next_slot_addr(&self) -> usize {
        debug_assert!(!self.is_full());
        &self.entries[self.nb_entries] as *const WriteEntry as usize
    }

    pub fn append(&mut self, entry: WriteEntry) -> usize {
        let index = self.nb_entries;
        if entry.mask != 0 {
            self.has_writes += 1;
        }
        self.entries[index] = entry;
        self.nb_entries += 1;
        index
    }

    pub fn entry(&self, index: usize) -> &WriteEntry {
        &self.entries[index]
    }

    pub fn entry_mut(&mut self, index: usize) -> &mut WriteEntry {
        &mut self.entries[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteEntry> {
        self.entries[..self.nb_entries].iter()
    }

    /// Maps the entry address found in an owned lock word back into this
    /// set. `None` means the owner is a foreign transaction.
    pub fn index_of(&self, entry_addr: usize) -> Option<usize> {
        let base = self.entries.as_ptr() as usize;
        let end = base + self.entries.len() * std::mem::size_of::<WriteEntry>();

        if (base..end).contains(&entry_addr) {
            Some((entry_addr - base) / std::mem::size_of::<WriteEntry>())
        } else {
            None
        }
    }

    /// Doubles the capacity. Only sound while no lock word references the
    /// set, i.e. right after a rollback has reopened every stripe.
    pub fn grow(&mut self) {
        let doubled = self.entries.len() * 2;
        self.entries = (0..doubled).map(|_| WriteEntry::vacant()).collect();
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::{ReadSet, WriteEntry, WriteSet};
    use crate::types::TWord;

    fn entry_for(word: &TWord) -> WriteEntry {
        WriteEntry {
            addr: word,
            value: 1,
            mask: usize::MAX,
            version: 0,
            stripe: 0,
            next: None,
        }
    }

    #[test]
    fn test_read_set_scan() {
        let mut reads = ReadSet::with_capacity(4);
        reads.push(3, 17);
        reads.push(5, 99);

        assert!(reads.has_stripe(17));
        assert!(reads.has_stripe(99));
        assert!(!reads.has_stripe(42));

        reads.clear();
        assert_eq!(reads.len(), 0);
        assert!(!reads.has_stripe(17));
    }

    #[test]
    fn test_write_set_containment() {
        let word = TWord::new(0);
        let mut writes = WriteSet::with_capacity(4);

        let slot = writes.next_slot_addr();
        let index = writes.append(entry_for(&word));
        assert_eq!(writes.index_of(slot), Some(index));

        // an address outside the array is foreign
        assert_eq!(writes.index_of(0x10), None);
        let past_end = writes.next_slot_addr() + 4 * std::mem::size_of::<WriteEntry>();
        assert_eq!(writes.index_of(past_end), None);
    }

    #[test]
    fn test_write_set_fill_and_grow() {
        let word = TWord::new(0);
        let mut writes = WriteSet::with_capacity(2);

        writes.append(entry_for(&word));
        writes.append(entry_for(&word));
        assert!(writes.is_full());
        assert_eq!(writes.has_writes, 2);

        writes.grow();
        assert_eq!(writes.capacity(), 4);
        assert_eq!(writes.nb_entries, 0);
        assert_eq!(writes.has_writes, 0);
    }
}
