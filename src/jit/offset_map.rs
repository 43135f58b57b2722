//! Native offset → bytecode location table.
//!
//! Recorded while the compiler walks the blocks in order, so entries are
//! sorted by offset and lookup is a binary search for the last entry at or
//! before the queried offset.

use serde::Serialize;

/// What a range of machine code was generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Location {
    Prologue,
    Instruction { block: u32, index: u32 },
    Epilogue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OffsetMapEntry {
    pub native_offset: u32,
    pub location: Location,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OffsetMap {
    entries: Vec<OffsetMapEntry>,
}

impl OffsetMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that code from `native_offset` onward belongs to `location`.
    /// Offsets must be non-decreasing.
    pub fn record(&mut self, native_offset: usize, location: Location) {
        debug_assert!(
            self.entries.last().is_none_or(|e| e.native_offset as usize <= native_offset),
            "offset map entries out of order"
        );
        self.entries.push(OffsetMapEntry {
            native_offset: native_offset as u32,
            location,
        });
    }

    pub fn lookup(&self, native_offset: usize) -> Option<Location> {
        let end = self
            .entries
            .partition_point(|e| e.native_offset as usize <= native_offset);
        end.checked_sub(1).map(|i| self.entries[i].location)
    }

    pub fn entries(&self) -> &[OffsetMapEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> OffsetMap {
        let mut map = OffsetMap::new();
        map.record(0, Location::Prologue);
        map.record(20, Location::Instruction { block: 0, index: 0 });
        map.record(31, Location::Instruction { block: 0, index: 1 });
        map.record(40, Location::Instruction { block: 1, index: 0 });
        map.record(52, Location::Epilogue);
        map
    }

    #[test]
    fn test_lookup_inside_ranges() {
        let map = sample();
        assert_eq!(map.lookup(0), Some(Location::Prologue));
        assert_eq!(map.lookup(19), Some(Location::Prologue));
        assert_eq!(map.lookup(20), Some(Location::Instruction { block: 0, index: 0 }));
        assert_eq!(map.lookup(35), Some(Location::Instruction { block: 0, index: 1 }));
        assert_eq!(map.lookup(51), Some(Location::Instruction { block: 1, index: 0 }));
        assert_eq!(map.lookup(1000), Some(Location::Epilogue));
    }

    #[test]
    fn test_empty_map() {
        assert_eq!(OffsetMap::new().lookup(0), None);
    }
}
