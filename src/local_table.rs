//! Thread-local write-set table: a small open-addressed hash that
//! coalesces a thread's dirtied cache lines into `cl_group_t` entries
//! before they are drained into a [`crate::log::Log`].
//!
//! Grounded on `original_source/include/localCLTable.hpp`. Accepting
//! occasional overflow buys O(1) amortized insert with no allocation on
//! the fast path (spec.md §4.2). A range insert that exactly covers one
//! or more whole cl-groups is stored as a single length-based slot
//! instead of setting 16 mask bits per group, matching the two `cl_group_t`
//! variants `CLGroup.hpp` defines.

use crate::cl_group::ClGroup;
use crate::config::{
    CACHE_LINE_SHIFT, GROUP_SIZE, GROUP_SIZE_SHIFT, GROUP_SHIFT, SEARCH_ITERS, TABLE_ENTRIES,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Ok,
    /// All `SEARCH_ITERS` probed slots held a different group; caller must
    /// drain the table (publish a log) and retry.
    Overflow,
}

#[derive(Debug, Clone, Copy)]
enum SlotKind {
    Mask(u64),
    /// A contiguous run of `length` whole cl-groups starting at this
    /// slot's `group_index`.
    Length(u64),
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    group_index: u64,
    kind: SlotKind,
}

/// Thread-local (never shared) coalescing table keyed by cl-group index.
#[derive(Debug, Clone)]
pub struct LocalClTable {
    table: Vec<Option<Slot>>,
    /// Optional staging buffer for range inserts (`LOCAL_CL_TABLE_BUFFER`).
    buffer: Vec<(u64, u64)>,
    use_buffer: bool,
}

impl LocalClTable {
    pub fn new(use_buffer: bool) -> Self {
        LocalClTable {
            table: vec![None; TABLE_ENTRIES],
            buffer: Vec::new(),
            use_buffer,
        }
    }

    /// Insert a single cache-line address. Idempotent: inserting the same
    /// address twice leaves the table in the same state as inserting it
    /// once.
    pub fn insert(&mut self, cl_addr: u64) -> InsertOutcome {
        let group_index = cl_addr >> GROUP_SHIFT;
        let position = (cl_addr >> CACHE_LINE_SHIFT) & (GROUP_SIZE - 1);
        let bit = 1u64 << position;
        let start = (group_index as usize) & (TABLE_ENTRIES - 1);

        for probe in 0..SEARCH_ITERS {
            let idx = (start + probe) % TABLE_ENTRIES;
            match &mut self.table[idx] {
                None => {
                    self.table[idx] = Some(Slot {
                        group_index,
                        kind: SlotKind::Mask(bit),
                    });
                    return InsertOutcome::Ok;
                }
                Some(slot) if slot.group_index == group_index => {
                    if let SlotKind::Mask(mask) = &mut slot.kind {
                        *mask |= bit;
                        return InsertOutcome::Ok;
                    }
                    // Same group already holds a whole-group length run;
                    // a single line within it is already implied dirty.
                    return InsertOutcome::Ok;
                }
                Some(_) => continue,
            }
        }
        InsertOutcome::Overflow
    }

    /// Insert a whole contiguous run of `length` cl-groups starting at
    /// `group_index`, as one length-based slot.
    fn insert_length_run(&mut self, group_index: u64, length: u64) -> InsertOutcome {
        let start = (group_index as usize) & (TABLE_ENTRIES - 1);
        for probe in 0..SEARCH_ITERS {
            let idx = (start + probe) % TABLE_ENTRIES;
            if self.table[idx].is_none() {
                self.table[idx] = Some(Slot {
                    group_index,
                    kind: SlotKind::Length(length),
                });
                return InsertOutcome::Ok;
            }
        }
        InsertOutcome::Overflow
    }

    /// Insert a `[begin, end)` range of cl-unit addresses. A sub-range
    /// that exactly covers one or more whole cl-groups becomes a single
    /// length-based entry; any remainder on either end is inserted line
    /// by line. Any overflow aborts immediately so the caller can drain
    /// and retry.
    pub fn range_insert(&mut self, begin_cl: u64, end_cl: u64) -> InsertOutcome {
        if self.use_buffer {
            self.buffer.push((begin_cl, end_cl));
            return InsertOutcome::Ok;
        }
        self.range_insert_direct(begin_cl, end_cl)
    }

    fn range_insert_direct(&mut self, begin_cl: u64, end_cl: u64) -> InsertOutcome {
        let mut addr = begin_cl;
        while addr < end_cl {
            let group_index = addr >> GROUP_SIZE_SHIFT;
            let group_start = group_index << GROUP_SIZE_SHIFT;
            let group_end = group_start + GROUP_SIZE;

            if addr == group_start && end_cl >= group_end {
                let mut run_length = 0u64;
                let mut probe_end = group_start;
                while probe_end + GROUP_SIZE <= end_cl {
                    run_length += 1;
                    probe_end += GROUP_SIZE;
                }
                if self.insert_length_run(group_index, run_length) == InsertOutcome::Overflow {
                    return InsertOutcome::Overflow;
                }
                addr = probe_end;
            } else {
                if self.insert(addr << CACHE_LINE_SHIFT) == InsertOutcome::Overflow {
                    return InsertOutcome::Overflow;
                }
                addr += 1;
            }
        }
        InsertOutcome::Ok
    }

    /// Drain the staged range-insert buffer into the table. Returns
    /// `Overflow` if the table filled up partway through; the caller
    /// should publish the table (drain it to a log) and retry.
    pub fn dump_buffer_to_table(&mut self) -> InsertOutcome {
        while let Some((begin, end)) = self.buffer.pop() {
            if self.range_insert_direct(begin, end) == InsertOutcome::Overflow {
                // put it back so the retry (after a publish clears the
                // table) picks up where we left off
                self.buffer.push((begin, end));
                return InsertOutcome::Overflow;
            }
        }
        InsertOutcome::Ok
    }

    pub fn has_buffered_ranges(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        for slot in self.table.iter_mut() {
            *slot = None;
        }
    }

    /// Yield all currently stored entries as `ClGroup`s, in unspecified
    /// order (spec.md §4.2).
    pub fn iter(&self) -> impl Iterator<Item = ClGroup> + '_ {
        self.table.iter().filter_map(|slot| {
            slot.map(|Slot { group_index, kind }| match kind {
                SlotKind::Mask(mask) => ClGroup::from_mask(group_index, mask),
                SlotKind::Length(length) => ClGroup::from_length(group_index, length),
            })
        })
    }

    pub fn is_empty(&self) -> bool {
        self.table.iter().all(|s| s.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_idempotent() {
        let mut t = LocalClTable::new(false);
        let addr = 3u64 << CACHE_LINE_SHIFT;
        assert_eq!(t.insert(addr), InsertOutcome::Ok);
        assert_eq!(t.insert(addr), InsertOutcome::Ok);
        let entries: Vec<_> = t.iter().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].mask16(), 0b1000);
    }

    #[test]
    fn insert_coalesces_same_group_different_lines() {
        let mut t = LocalClTable::new(false);
        let group_base = 9u64 << GROUP_SHIFT;
        t.insert(group_base + (0 << CACHE_LINE_SHIFT));
        t.insert(group_base + (2 << CACHE_LINE_SHIFT));
        let entries: Vec<_> = t.iter().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].group_index(), 9);
        assert_eq!(entries[0].mask16(), 0b0101);
    }

    #[test]
    fn overflow_when_all_probes_collide_with_other_groups() {
        let mut t = LocalClTable::new(false);
        // All of these hash to the same starting slot (group_index 0 mod
        // TABLE_ENTRIES) but are distinct groups, so the SEARCH_ITERS
        // probe sequence fills up without ever matching.
        let mut overflowed = false;
        for g in 0..(SEARCH_ITERS as u64 + 1) {
            let addr = (g * TABLE_ENTRIES as u64) << GROUP_SHIFT;
            if t.insert(addr) == InsertOutcome::Overflow {
                overflowed = true;
            }
        }
        assert!(overflowed);
    }

    #[test]
    fn clear_empties_table() {
        let mut t = LocalClTable::new(false);
        t.insert(1 << CACHE_LINE_SHIFT);
        assert!(!t.is_empty());
        t.clear();
        assert!(t.is_empty());
    }

    #[test]
    fn range_insert_covering_whole_groups_becomes_a_length_entry() {
        let mut t = LocalClTable::new(false);
        // 3 whole groups' worth of cl-units, group-aligned.
        t.range_insert(0, 3 * GROUP_SIZE);
        let entries: Vec<_> = t.iter().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].group_index(), 0);
        assert!(entries[0].is_length_based());
        assert_eq!(entries[0].length(), 3);
    }

    #[test]
    fn range_insert_with_unaligned_remainder_splits_length_and_mask_entries() {
        let mut t = LocalClTable::new(false);
        // One whole group (0..16) plus 2 extra lines into the next group.
        t.range_insert(0, GROUP_SIZE + 2);
        let entries: Vec<_> = t.iter().collect();
        assert_eq!(entries.len(), 2);
        let length_entry = entries.iter().find(|e| e.is_length_based()).unwrap();
        let mask_entry = entries.iter().find(|e| !e.is_length_based()).unwrap();
        assert_eq!(length_entry.group_index(), 0);
        assert_eq!(length_entry.length(), 1);
        assert_eq!(mask_entry.group_index(), 1);
        assert_eq!(mask_entry.mask16(), 0b11);
    }
}
