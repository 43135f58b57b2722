//! Declarative lexical environments.

use std::cell::{Cell, RefCell};

use super::Value;
use super::heap::{Heap, PropertyKey, SlotStorage};

/// A scope of named bindings. Compiled code walks `parent` pointers and reads
/// `bindings` directly, so both sit at fixed offsets.
///
/// `serial` identifies the binding layout: it is replaced with a fresh,
/// heap-unique number whenever a binding is added or the environment is
/// tainted, which makes a cached (hops, index, serial) triple valid for
/// exactly one environment state.
#[repr(C)]
pub struct Environment {
    parent: *const Environment,
    bindings: SlotStorage,
    serial: Cell<u64>,
    names: RefCell<Vec<PropertyKey>>,
    mutable: RefCell<Vec<bool>>,
    tainted: Cell<bool>,
    crossed: Cell<bool>,
}

/// Where a name resolved to, relative to the environment it was looked up from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingLocation {
    pub hops: u32,
    pub index: u32,
}

impl Environment {
    pub(crate) fn new(parent: *const Environment, serial: u64) -> Self {
        Self {
            parent,
            bindings: SlotStorage::new(),
            serial: Cell::new(serial),
            names: RefCell::new(Vec::new()),
            mutable: RefCell::new(Vec::new()),
            tainted: Cell::new(false),
            crossed: Cell::new(false),
        }
    }

    pub const fn parent_offset() -> usize {
        std::mem::offset_of!(Environment, parent)
    }

    pub const fn bindings_offset() -> usize {
        std::mem::offset_of!(Environment, bindings)
    }

    pub const fn serial_offset() -> usize {
        std::mem::offset_of!(Environment, serial)
    }

    pub fn parent(&self) -> Option<&Environment> {
        // SAFETY: environments are owned by the heap.
        unsafe { self.parent.as_ref() }
    }

    pub fn serial(&self) -> u64 {
        self.serial.get()
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted.get()
    }

    /// Mark the environment as dynamically modified. Lookups through a tainted
    /// environment are never cached.
    pub fn taint(&self, heap: &Heap) {
        self.tainted.set(true);
        self.serial.set(heap.next_serial());
    }

    /// Record that a cached lookup walked past this environment. A binding
    /// declared here afterwards could shadow the cached one.
    pub fn mark_crossed(&self) {
        self.crossed.set(true);
    }

    pub fn was_crossed(&self) -> bool {
        self.crossed.get()
    }

    pub fn binding_index(&self, name: &str) -> Option<u32> {
        self.names
            .borrow()
            .iter()
            .position(|n| n.as_ref() == name)
            .map(|i| i as u32)
    }

    /// Declare a new, uninitialized binding (or return the existing one).
    pub fn declare(&self, heap: &Heap, name: &str, mutable: bool) -> u32 {
        if let Some(index) = self.binding_index(name) {
            return index;
        }
        self.names.borrow_mut().push(PropertyKey::from(name));
        self.mutable.borrow_mut().push(mutable);
        let index = self.bindings.push(Value::empty()) as u32;
        self.serial.set(heap.next_serial());
        index
    }

    pub fn get(&self, index: u32) -> Option<Value> {
        self.bindings.get(index as usize)
    }

    pub fn set(&self, index: u32, value: Value) -> bool {
        self.bindings.set(index as usize, value)
    }

    pub fn is_mutable(&self, index: u32) -> bool {
        self.mutable
            .borrow()
            .get(index as usize)
            .copied()
            .unwrap_or(false)
    }

    pub fn name(&self, index: u32) -> Option<PropertyKey> {
        self.names.borrow().get(index as usize).cloned()
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Resolve `name` by walking outward. The second element reports whether a
    /// tainted environment was crossed on the way.
    pub fn resolve(&self, name: &str) -> Option<(BindingLocation, bool)> {
        let mut environment = Some(self);
        let mut hops = 0;
        let mut tainted = false;
        while let Some(env) = environment {
            tainted |= env.is_tainted();
            if let Some(index) = env.binding_index(name) {
                return Some((BindingLocation { hops, index }, tainted));
            }
            environment = env.parent();
            hops += 1;
        }
        None
    }

    /// The environment `hops` levels out.
    pub fn ancestor(&self, hops: u32) -> Option<&Environment> {
        let mut environment = self;
        for _ in 0..hops {
            environment = environment.parent()?;
        }
        Some(environment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_changes_serial() {
        let heap = Heap::new();
        // SAFETY: the heap outlives the reference.
        let env = unsafe { &*heap.alloc_environment(std::ptr::null()) };
        let before = env.serial();
        let index = env.declare(&heap, "x", true);
        assert_eq!(index, 0);
        assert_ne!(env.serial(), before);
        assert_eq!(env.get(0), Some(Value::empty()));

        let serial = env.serial();
        assert_eq!(env.declare(&heap, "x", true), 0);
        assert_eq!(env.serial(), serial);
    }

    #[test]
    fn test_resolve_counts_hops() {
        let heap = Heap::new();
        let outer_ptr = heap.alloc_environment(std::ptr::null());
        // SAFETY: the heap outlives both references.
        let outer = unsafe { &*outer_ptr };
        let inner = unsafe { &*heap.alloc_environment(outer_ptr) };
        outer.declare(&heap, "a", true);
        outer.declare(&heap, "b", false);
        inner.declare(&heap, "c", true);

        let (location, tainted) = inner.resolve("b").unwrap();
        assert_eq!(location, BindingLocation { hops: 1, index: 1 });
        assert!(!tainted);
        assert!(inner.resolve("missing").is_none());
        assert!(!outer.is_mutable(1));

        outer.taint(&heap);
        let (_, tainted) = inner.resolve("a").unwrap();
        assert!(tainted);
    }

    #[test]
    fn test_serials_are_unique_across_environments() {
        let heap = Heap::new();
        let a = unsafe { &*heap.alloc_environment(std::ptr::null()) };
        let b = unsafe { &*heap.alloc_environment(std::ptr::null()) };
        a.declare(&heap, "x", true);
        b.declare(&heap, "x", true);
        assert_ne!(a.serial(), b.serial());
    }
}
