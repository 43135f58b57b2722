//! Inline caches for property and variable lookups.
//!
//! Every cache cell belongs to one call site of one executable. Compiled code
//! reads the cells directly (hence the fixed layouts) and only trusts a cached
//! slot when the stored identity matches the live one exactly; on any mismatch
//! it calls the slow path, which re-resolves and overwrites the cell.

use std::cell::Cell;

use super::heap::Shape;

/// Observable state of a cache cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Nothing recorded yet; the next access takes the slow path.
    Uncached,
    /// An identity and slot are recorded; each access validates them.
    Populated,
}

/// Cache for named property access on objects (`GetById` / `PutById`).
#[repr(C)]
pub struct PropertyLookupCache {
    shape: Cell<*const Shape>,
    slot: Cell<u32>,
}

impl PropertyLookupCache {
    pub fn new() -> Self {
        Self {
            shape: Cell::new(std::ptr::null()),
            slot: Cell::new(0),
        }
    }

    pub const fn shape_offset() -> usize {
        std::mem::offset_of!(PropertyLookupCache, shape)
    }

    pub const fn slot_offset() -> usize {
        std::mem::offset_of!(PropertyLookupCache, slot)
    }

    pub fn state(&self) -> CacheState {
        if self.shape.get().is_null() {
            CacheState::Uncached
        } else {
            CacheState::Populated
        }
    }

    /// Cached slot if `shape` is the recorded shape.
    #[inline]
    pub fn check(&self, shape: *const Shape) -> Option<u32> {
        let cached = self.shape.get();
        if !cached.is_null() && std::ptr::eq(cached, shape) {
            Some(self.slot.get())
        } else {
            None
        }
    }

    pub fn update(&self, shape: *const Shape, slot: u32) {
        self.shape.set(shape);
        self.slot.set(slot);
    }

    pub fn reset(&self) {
        self.shape.set(std::ptr::null());
        self.slot.set(0);
    }
}

impl Default for PropertyLookupCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache for global object properties (`GetGlobal`). Also records the global
/// declarative environment's serial: a new top-level lexical binding with the
/// same name must shadow the cached property.
#[repr(C)]
pub struct GlobalVariableCache {
    shape: Cell<*const Shape>,
    slot: Cell<u32>,
    environment_serial: Cell<u64>,
}

impl GlobalVariableCache {
    pub fn new() -> Self {
        Self {
            shape: Cell::new(std::ptr::null()),
            slot: Cell::new(0),
            environment_serial: Cell::new(0),
        }
    }

    pub const fn shape_offset() -> usize {
        std::mem::offset_of!(GlobalVariableCache, shape)
    }

    pub const fn slot_offset() -> usize {
        std::mem::offset_of!(GlobalVariableCache, slot)
    }

    pub const fn environment_serial_offset() -> usize {
        std::mem::offset_of!(GlobalVariableCache, environment_serial)
    }

    pub fn state(&self) -> CacheState {
        if self.shape.get().is_null() {
            CacheState::Uncached
        } else {
            CacheState::Populated
        }
    }

    #[inline]
    pub fn check(&self, shape: *const Shape, environment_serial: u64) -> Option<u32> {
        let cached = self.shape.get();
        if !cached.is_null()
            && std::ptr::eq(cached, shape)
            && self.environment_serial.get() == environment_serial
        {
            Some(self.slot.get())
        } else {
            None
        }
    }

    pub fn update(&self, shape: *const Shape, slot: u32, environment_serial: u64) {
        self.shape.set(shape);
        self.slot.set(slot);
        self.environment_serial.set(environment_serial);
    }

    pub fn reset(&self) {
        self.shape.set(std::ptr::null());
        self.slot.set(0);
        self.environment_serial.set(0);
    }
}

impl Default for GlobalVariableCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache for lexical bindings (`GetVariable`): how many parent links to follow,
/// which binding slot to read, the serial of the environment the lookup
/// started from and the serial the target environment had.
///
/// Checking the origin serial ties an entry to one environment instance, so
/// a fresh scope that shadows the name never reuses it.
#[repr(C)]
pub struct EnvironmentCache {
    populated: Cell<u32>,
    hops: Cell<u32>,
    index: Cell<u32>,
    origin: Cell<u64>,
    serial: Cell<u64>,
}

/// A populated environment cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedBinding {
    pub hops: u32,
    pub index: u32,
    pub origin: u64,
    pub serial: u64,
}

impl EnvironmentCache {
    pub fn new() -> Self {
        Self {
            populated: Cell::new(0),
            hops: Cell::new(0),
            index: Cell::new(0),
            origin: Cell::new(0),
            serial: Cell::new(0),
        }
    }

    pub const fn populated_offset() -> usize {
        std::mem::offset_of!(EnvironmentCache, populated)
    }

    pub const fn hops_offset() -> usize {
        std::mem::offset_of!(EnvironmentCache, hops)
    }

    pub const fn index_offset() -> usize {
        std::mem::offset_of!(EnvironmentCache, index)
    }

    pub const fn origin_offset() -> usize {
        std::mem::offset_of!(EnvironmentCache, origin)
    }

    pub const fn serial_offset() -> usize {
        std::mem::offset_of!(EnvironmentCache, serial)
    }

    pub fn state(&self) -> CacheState {
        if self.populated.get() == 0 {
            CacheState::Uncached
        } else {
            CacheState::Populated
        }
    }

    pub fn entry(&self) -> Option<CachedBinding> {
        (self.populated.get() != 0).then(|| CachedBinding {
            hops: self.hops.get(),
            index: self.index.get(),
            origin: self.origin.get(),
            serial: self.serial.get(),
        })
    }

    pub fn update(&self, binding: CachedBinding) {
        self.hops.set(binding.hops);
        self.index.set(binding.index);
        self.origin.set(binding.origin);
        self.serial.set(binding.serial);
        self.populated.set(1);
    }

    pub fn reset(&self) {
        self.populated.set(0);
        self.hops.set(0);
        self.index.set(0);
        self.origin.set(0);
        self.serial.set(0);
    }
}

impl Default for EnvironmentCache {
    fn default() -> Self {
        Self::new()
    }
}

/// All cache cells of one executable. The boxed slices never move, so compiled
/// code may embed the address of a cell.
pub struct InlineCacheTable {
    property: Box<[PropertyLookupCache]>,
    global: Box<[GlobalVariableCache]>,
    environment: Box<[EnvironmentCache]>,
}

impl InlineCacheTable {
    pub fn new(property: usize, global: usize, environment: usize) -> Self {
        Self {
            property: (0..property).map(|_| PropertyLookupCache::new()).collect(),
            global: (0..global).map(|_| GlobalVariableCache::new()).collect(),
            environment: (0..environment).map(|_| EnvironmentCache::new()).collect(),
        }
    }

    pub fn property(&self, index: u32) -> Option<&PropertyLookupCache> {
        self.property.get(index as usize)
    }

    pub fn global(&self, index: u32) -> Option<&GlobalVariableCache> {
        self.global.get(index as usize)
    }

    pub fn environment(&self, index: u32) -> Option<&EnvironmentCache> {
        self.environment.get(index as usize)
    }

    pub fn property_count(&self) -> usize {
        self.property.len()
    }

    pub fn global_count(&self) -> usize {
        self.global.len()
    }

    pub fn environment_count(&self) -> usize {
        self.environment.len()
    }

    pub fn reset_environment(&self) {
        self.environment.iter().for_each(EnvironmentCache::reset);
    }

    /// Forget every recorded entry.
    pub fn reset(&self) {
        self.property.iter().for_each(PropertyLookupCache::reset);
        self.global.iter().for_each(GlobalVariableCache::reset);
        self.environment.iter().for_each(EnvironmentCache::reset);
    }
}

impl Default for InlineCacheTable {
    fn default() -> Self {
        Self::new(0, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_shape(addr: usize) -> *const Shape {
        addr as *const Shape
    }

    #[test]
    fn test_property_cache_uncached() {
        let ic = PropertyLookupCache::new();
        assert_eq!(ic.state(), CacheState::Uncached);
        assert_eq!(ic.check(std::ptr::null()), None);
        assert_eq!(ic.check(fake_shape(0x1000)), None);
    }

    #[test]
    fn test_property_cache_validates_identity() {
        let ic = PropertyLookupCache::new();
        ic.update(fake_shape(0x1000), 3);

        assert_eq!(ic.state(), CacheState::Populated);
        assert_eq!(ic.check(fake_shape(0x1000)), Some(3));
        assert_eq!(ic.check(fake_shape(0x2000)), None);

        // A miss does not evict; the slow path decides what to install.
        ic.update(fake_shape(0x2000), 1);
        assert_eq!(ic.check(fake_shape(0x1000)), None);
        assert_eq!(ic.check(fake_shape(0x2000)), Some(1));
    }

    #[test]
    fn test_global_cache_requires_matching_serial() {
        let ic = GlobalVariableCache::new();
        ic.update(fake_shape(0x1000), 2, 7);
        assert_eq!(ic.check(fake_shape(0x1000), 7), Some(2));
        assert_eq!(ic.check(fake_shape(0x1000), 8), None);
        ic.reset();
        assert_eq!(ic.state(), CacheState::Uncached);
    }

    #[test]
    fn test_environment_cache_entry() {
        let ic = EnvironmentCache::new();
        assert_eq!(ic.entry(), None);
        let binding = CachedBinding { hops: 2, index: 5, origin: 41, serial: 99 };
        ic.update(binding);
        assert_eq!(ic.entry(), Some(binding));
        ic.reset();
        assert_eq!(ic.state(), CacheState::Uncached);
    }

    #[test]
    fn test_table_cells_are_stable() {
        let table = InlineCacheTable::new(2, 1, 1);
        let first = table.property(0).unwrap() as *const PropertyLookupCache;
        table.property(1).unwrap().update(fake_shape(0x10), 0);
        assert_eq!(table.property(0).unwrap() as *const _, first);
        assert!(table.property(2).is_none());
        table.reset();
        assert_eq!(table.property(1).unwrap().state(), CacheState::Uncached);
    }
}
