use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::NonNull;
use std::rc::Rc;

use num_bigint::BigInt;
use rustc_hash::FxHashMap;

use super::Value;
use super::bytecode::Executable;
use super::environment::Environment;
use super::realm::Builtin;

/// Property names are shared, immutable strings.
pub type PropertyKey = Rc<str>;

/// Past this many holes a store converts an array to sparse storage.
const MAX_DENSE_GAP: u32 = 1024;

// =============================================================================
// SlotStorage - growable Value array with a fixed layout
// =============================================================================

/// A growable array of values whose pointer and length sit at known offsets,
/// so compiled code can index it directly.
#[repr(C)]
pub struct SlotStorage {
    ptr: Cell<*mut Value>,
    len: Cell<u32>,
    capacity: Cell<u32>,
}

impl SlotStorage {
    pub fn new() -> Self {
        let mut empty = ManuallyDrop::new(Vec::<Value>::new());
        Self {
            ptr: Cell::new(empty.as_mut_ptr()),
            len: Cell::new(0),
            capacity: Cell::new(0),
        }
    }

    pub fn from_vec(values: Vec<Value>) -> Self {
        let storage = Self::new();
        storage.with_vec(|v| *v = values);
        storage
    }

    fn with_vec<R>(&self, f: impl FnOnce(&mut Vec<Value>) -> R) -> R {
        // SAFETY: the parts always come from a Vec<Value> that this storage
        // owns; they are written back before returning.
        let mut vec = ManuallyDrop::new(unsafe {
            Vec::from_raw_parts(
                self.ptr.get(),
                self.len.get() as usize,
                self.capacity.get() as usize,
            )
        });
        let result = f(&mut vec);
        self.ptr.set(vec.as_mut_ptr());
        self.len.set(vec.len() as u32);
        self.capacity.set(vec.capacity() as u32);
        result
    }

    pub fn len(&self) -> usize {
        self.len.get() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        if index < self.len() {
            // SAFETY: bounds checked against the live length.
            Some(unsafe { *self.ptr.get().add(index) })
        } else {
            None
        }
    }

    pub fn set(&self, index: usize, value: Value) -> bool {
        if index < self.len() {
            // SAFETY: bounds checked against the live length.
            unsafe { *self.ptr.get().add(index) = value };
            true
        } else {
            false
        }
    }

    pub fn push(&self, value: Value) -> usize {
        self.with_vec(|v| {
            v.push(value);
            v.len() - 1
        })
    }

    pub fn remove(&self, index: usize) -> Option<Value> {
        self.with_vec(|v| (index < v.len()).then(|| v.remove(index)))
    }

    pub fn resize(&self, len: usize, fill: Value) {
        self.with_vec(|v| v.resize(len, fill));
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.with_vec(|v| v.clone())
    }

    pub fn take(&self) -> Vec<Value> {
        self.with_vec(std::mem::take)
    }

    pub const fn ptr_offset() -> usize {
        std::mem::offset_of!(SlotStorage, ptr)
    }

    pub const fn len_offset() -> usize {
        std::mem::offset_of!(SlotStorage, len)
    }
}

impl Default for SlotStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SlotStorage {
    fn drop(&mut self) {
        self.with_vec(|v| {
            let owned = std::mem::take(v);
            drop(owned);
        });
    }
}

// =============================================================================
// Shape - immutable property layout
// =============================================================================

/// An immutable property layout. Objects that reached the same layout by the
/// same sequence of additions share a shape, so a shape pointer identifies a
/// layout for as long as the heap lives.
pub struct Shape {
    keys: Vec<PropertyKey>,
    lookup: FxHashMap<PropertyKey, u32>,
    transitions: RefCell<FxHashMap<PropertyKey, *const Shape>>,
    unique: bool,
}

impl Shape {
    fn root() -> Self {
        Self {
            keys: Vec::new(),
            lookup: FxHashMap::default(),
            transitions: RefCell::new(FxHashMap::default()),
            unique: false,
        }
    }

    fn with_keys(keys: Vec<PropertyKey>, unique: bool) -> Self {
        let lookup = keys
            .iter()
            .enumerate()
            .map(|(slot, key)| (key.clone(), slot as u32))
            .collect();
        Self {
            keys,
            lookup,
            transitions: RefCell::new(FxHashMap::default()),
            unique,
        }
    }

    pub fn lookup(&self, key: &str) -> Option<u32> {
        self.lookup.get(key).copied()
    }

    pub fn keys(&self) -> &[PropertyKey] {
        &self.keys
    }

    pub fn property_count(&self) -> usize {
        self.keys.len()
    }

    /// Unique shapes belong to a single object and never gain transitions.
    pub fn is_unique(&self) -> bool {
        self.unique
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shape")
            .field("keys", &self.keys)
            .field("unique", &self.unique)
            .finish()
    }
}

// =============================================================================
// Cells
// =============================================================================

pub struct PrimitiveString {
    value: Box<str>,
}

impl PrimitiveString {
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

pub struct BigIntCell {
    value: BigInt,
}

impl BigIntCell {
    pub fn value(&self) -> &BigInt {
        &self.value
    }
}

/// A getter/setter pair stored in a property slot under the accessor tag.
pub struct Accessor {
    pub getter: Cell<Value>,
    pub setter: Cell<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectClass {
    Ordinary = 0,
    Array = 1,
    Function = 2,
}

/// How an object's indexed properties are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IndexedKind {
    /// Dense `elements` storage; `length` is the element count.
    Simple = 0,
    /// Ordered map keyed by index; used once an array becomes too holey.
    Sparse = 1,
}

pub enum Callable {
    Bytecode {
        executable: Rc<Executable>,
        environment: *const Environment,
    },
    Builtin(Builtin),
}

#[repr(C)]
pub struct Object {
    shape: Cell<*const Shape>,
    named: SlotStorage,
    elements: SlotStorage,
    class: ObjectClass,
    indexed_kind: Cell<IndexedKind>,
    prototype: Cell<Option<ObjectRef>>,
    sparse: RefCell<BTreeMap<u32, Value>>,
    sparse_length: Cell<u32>,
    callable: Option<Callable>,
}

impl Object {
    pub const fn shape_offset() -> usize {
        std::mem::offset_of!(Object, shape)
    }

    pub const fn named_offset() -> usize {
        std::mem::offset_of!(Object, named)
    }

    pub const fn elements_offset() -> usize {
        std::mem::offset_of!(Object, elements)
    }

    pub const fn class_offset() -> usize {
        std::mem::offset_of!(Object, class)
    }

    pub const fn indexed_kind_offset() -> usize {
        std::mem::offset_of!(Object, indexed_kind)
    }

    pub fn shape(&self) -> &Shape {
        // SAFETY: shapes are owned by the heap and never freed before it.
        unsafe { &*self.shape.get() }
    }

    pub fn shape_ptr(&self) -> *const Shape {
        self.shape.get()
    }

    pub fn class(&self) -> ObjectClass {
        self.class
    }

    pub fn is_array(&self) -> bool {
        self.class == ObjectClass::Array
    }

    pub fn is_function(&self) -> bool {
        self.callable.is_some()
    }

    pub fn callable(&self) -> Option<&Callable> {
        self.callable.as_ref()
    }

    pub fn indexed_kind(&self) -> IndexedKind {
        self.indexed_kind.get()
    }

    pub fn prototype(&self) -> Option<ObjectRef> {
        self.prototype.get()
    }

    pub fn set_prototype(&self, prototype: Option<ObjectRef>) {
        self.prototype.set(prototype);
    }

    /// Own named property, by slot.
    pub fn get_own(&self, key: &str) -> Option<Value> {
        let slot = self.shape().lookup(key)?;
        self.named.get(slot as usize)
    }

    pub fn slot_value(&self, slot: u32) -> Option<Value> {
        self.named.get(slot as usize)
    }

    pub fn set_slot_value(&self, slot: u32, value: Value) -> bool {
        self.named.set(slot as usize, value)
    }

    pub fn own_keys(&self) -> Vec<PropertyKey> {
        self.shape().keys().to_vec()
    }

    // ----- indexed storage -----

    pub fn array_length(&self) -> u32 {
        match self.indexed_kind.get() {
            IndexedKind::Simple => self.elements.len() as u32,
            IndexedKind::Sparse => self.sparse_length.get(),
        }
    }

    /// Own indexed element; holes read as `None`.
    pub fn get_index(&self, index: u32) -> Option<Value> {
        match self.indexed_kind.get() {
            IndexedKind::Simple => self
                .elements
                .get(index as usize)
                .filter(|value| !value.is_empty()),
            IndexedKind::Sparse => self.sparse.borrow().get(&index).copied(),
        }
    }

    pub fn set_index(&self, index: u32, value: Value) {
        if self.indexed_kind.get() == IndexedKind::Simple {
            let len = self.elements.len() as u32;
            if index < len {
                self.elements.set(index as usize, value);
                return;
            }
            if index - len <= MAX_DENSE_GAP {
                self.elements.resize(index as usize, Value::empty());
                self.elements.push(value);
                return;
            }
            self.convert_to_sparse();
        }
        self.sparse.borrow_mut().insert(index, value);
        if index >= self.sparse_length.get() {
            self.sparse_length.set(index + 1);
        }
    }

    fn convert_to_sparse(&self) {
        let dense = self.elements.take();
        let mut sparse = self.sparse.borrow_mut();
        for (index, value) in dense.iter().enumerate() {
            if !value.is_empty() {
                sparse.insert(index as u32, *value);
            }
        }
        self.sparse_length.set(dense.len() as u32);
        self.indexed_kind.set(IndexedKind::Sparse);
    }

    /// Elements in index order, holes as undefined.
    pub fn elements(&self) -> Vec<Value> {
        (0..self.array_length())
            .map(|i| self.get_index(i).unwrap_or(Value::undefined()))
            .collect()
    }
}

/// A non-owning handle to a heap object.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef(NonNull<Object>);

impl ObjectRef {
    pub fn from_ptr(ptr: *mut Object) -> Option<Self> {
        NonNull::new(ptr).map(ObjectRef)
    }

    pub fn as_ptr(self) -> *const Object {
        self.0.as_ptr()
    }
}

impl Deref for ObjectRef {
    type Target = Object;

    fn deref(&self) -> &Object {
        // SAFETY: objects are owned by the heap and outlive every handle.
        unsafe { self.0.as_ref() }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:p})", self.0.as_ptr())
    }
}

// =============================================================================
// Heap
// =============================================================================

/// Owns every cell for the lifetime of the VM. Nothing is collected, so a raw
/// pointer to a shape, object or environment stays valid (and unique) until
/// the heap is dropped.
pub struct Heap {
    objects: RefCell<Vec<Box<Object>>>,
    strings: RefCell<Vec<Box<PrimitiveString>>>,
    bigints: RefCell<Vec<Box<BigIntCell>>>,
    accessors: RefCell<Vec<Box<Accessor>>>,
    shapes: RefCell<Vec<Box<Shape>>>,
    environments: RefCell<Vec<Box<Environment>>>,
    root_shape: *const Shape,
    next_serial: Cell<u64>,
}

impl Heap {
    pub fn new() -> Self {
        let root = Box::new(Shape::root());
        let root_shape = &*root as *const Shape;
        Self {
            objects: RefCell::new(Vec::new()),
            strings: RefCell::new(Vec::new()),
            bigints: RefCell::new(Vec::new()),
            accessors: RefCell::new(Vec::new()),
            shapes: RefCell::new(vec![root]),
            environments: RefCell::new(Vec::new()),
            root_shape,
            next_serial: Cell::new(1),
        }
    }

    fn alloc_shape(&self, shape: Shape) -> *const Shape {
        let shape = Box::new(shape);
        let ptr = &*shape as *const Shape;
        self.shapes.borrow_mut().push(shape);
        ptr
    }

    /// A fresh environment serial; never handed out twice.
    pub fn next_serial(&self) -> u64 {
        let serial = self.next_serial.get();
        self.next_serial.set(serial + 1);
        serial
    }

    fn alloc_object_with(
        &self,
        class: ObjectClass,
        prototype: Option<ObjectRef>,
        callable: Option<Callable>,
    ) -> ObjectRef {
        let mut object = Box::new(Object {
            shape: Cell::new(self.root_shape),
            named: SlotStorage::new(),
            elements: SlotStorage::new(),
            class,
            indexed_kind: Cell::new(IndexedKind::Simple),
            prototype: Cell::new(prototype),
            sparse: RefCell::new(BTreeMap::new()),
            sparse_length: Cell::new(0),
            callable,
        });
        let handle = ObjectRef(NonNull::from(&mut *object));
        self.objects.borrow_mut().push(object);
        handle
    }

    pub fn alloc_object(&self, prototype: Option<ObjectRef>) -> ObjectRef {
        self.alloc_object_with(ObjectClass::Ordinary, prototype, None)
    }

    pub fn alloc_array(&self, prototype: Option<ObjectRef>, elements: Vec<Value>) -> ObjectRef {
        let array = self.alloc_object_with(ObjectClass::Array, prototype, None);
        array.elements.with_vec(|v| *v = elements);
        array
    }

    pub fn alloc_function(&self, prototype: Option<ObjectRef>, callable: Callable) -> ObjectRef {
        self.alloc_object_with(ObjectClass::Function, prototype, Some(callable))
    }

    pub fn alloc_string(&self, value: &str) -> Value {
        let cell = Box::new(PrimitiveString { value: value.into() });
        let ptr = &*cell as *const PrimitiveString;
        self.strings.borrow_mut().push(cell);
        Value::string(ptr)
    }

    pub fn alloc_bigint(&self, value: BigInt) -> Value {
        let cell = Box::new(BigIntCell { value });
        let ptr = &*cell as *const BigIntCell;
        self.bigints.borrow_mut().push(cell);
        Value::bigint(ptr)
    }

    pub fn alloc_accessor(&self, getter: Value, setter: Value) -> Value {
        let cell = Box::new(Accessor {
            getter: Cell::new(getter),
            setter: Cell::new(setter),
        });
        let ptr = &*cell as *const Accessor;
        self.accessors.borrow_mut().push(cell);
        Value::accessor(ptr)
    }

    pub fn alloc_environment(&self, parent: *const Environment) -> *const Environment {
        let environment = Box::new(Environment::new(parent, self.next_serial()));
        let ptr = &*environment as *const Environment;
        self.environments.borrow_mut().push(environment);
        ptr
    }

    // ----- shape transitions -----

    /// Define or overwrite an own named property.
    pub fn put_own(&self, object: ObjectRef, key: &str, value: Value) {
        if let Some(slot) = object.shape().lookup(key) {
            object.named.set(slot as usize, value);
            return;
        }
        let next = self.transition(object.shape_ptr(), key);
        object.named.push(value);
        object.shape.set(next);
    }

    fn transition(&self, from: *const Shape, key: &str) -> *const Shape {
        // SAFETY: `from` is a live heap shape.
        let shape = unsafe { &*from };
        let mut keys = shape.keys.clone();
        keys.push(Rc::from(key));
        if shape.unique {
            return self.alloc_shape(Shape::with_keys(keys, true));
        }
        if let Some(&existing) = shape.transitions.borrow().get(key) {
            return existing;
        }
        let next = self.alloc_shape(Shape::with_keys(keys, false));
        shape.transitions.borrow_mut().insert(Rc::from(key), next);
        next
    }

    /// Remove an own named property. The object moves to a fresh unique shape
    /// so that no cache keyed on its previous layout can match again.
    pub fn delete_own(&self, object: ObjectRef, key: &str) -> bool {
        let Some(slot) = object.shape().lookup(key) else {
            return true;
        };
        let keys = object
            .shape()
            .keys()
            .iter()
            .filter(|k| k.as_ref() != key)
            .cloned()
            .collect();
        object.named.remove(slot as usize);
        object.shape.set(self.alloc_shape(Shape::with_keys(keys, true)));
        true
    }

    /// Give an object a layout-identical but distinct shape.
    pub fn reshape(&self, object: ObjectRef) {
        let keys = object.shape().keys().to_vec();
        object.shape.set(self.alloc_shape(Shape::with_keys(keys, true)));
    }

    pub fn object_count(&self) -> usize {
        self.objects.borrow().len()
    }

    pub fn shape_count(&self) -> usize {
        self.shapes.borrow().len()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_storage_grows() {
        let storage = SlotStorage::new();
        for i in 0..100 {
            storage.push(Value::int32(i));
        }
        assert_eq!(storage.len(), 100);
        assert_eq!(storage.get(42), Some(Value::int32(42)));
        assert_eq!(storage.get(100), None);
        assert!(storage.set(3, Value::null()));
        assert_eq!(storage.remove(3), Some(Value::null()));
        assert_eq!(storage.len(), 99);
    }

    #[test]
    fn test_shared_transitions() {
        let heap = Heap::new();
        let a = heap.alloc_object(None);
        let b = heap.alloc_object(None);
        heap.put_own(a, "x", Value::int32(1));
        heap.put_own(b, "x", Value::int32(2));
        assert_eq!(a.shape_ptr(), b.shape_ptr());
        heap.put_own(a, "y", Value::int32(3));
        assert_ne!(a.shape_ptr(), b.shape_ptr());
        assert_eq!(a.get_own("y"), Some(Value::int32(3)));
    }

    #[test]
    fn test_overwrite_keeps_shape() {
        let heap = Heap::new();
        let a = heap.alloc_object(None);
        heap.put_own(a, "x", Value::int32(1));
        let shape = a.shape_ptr();
        heap.put_own(a, "x", Value::int32(5));
        assert_eq!(a.shape_ptr(), shape);
        assert_eq!(a.get_own("x"), Some(Value::int32(5)));
    }

    #[test]
    fn test_delete_moves_to_unique_shape() {
        let heap = Heap::new();
        let a = heap.alloc_object(None);
        heap.put_own(a, "x", Value::int32(1));
        heap.put_own(a, "y", Value::int32(2));
        let before = a.shape_ptr();
        heap.delete_own(a, "x");
        assert_ne!(a.shape_ptr(), before);
        assert!(a.shape().is_unique());
        assert_eq!(a.get_own("x"), None);
        assert_eq!(a.get_own("y"), Some(Value::int32(2)));

        // Re-adding the same key does not resurrect a shared layout.
        heap.put_own(a, "x", Value::int32(3));
        let b = heap.alloc_object(None);
        heap.put_own(b, "y", Value::int32(0));
        heap.put_own(b, "x", Value::int32(0));
        assert_ne!(a.shape_ptr(), b.shape_ptr());
    }

    #[test]
    fn test_array_goes_sparse_on_large_gap() {
        let heap = Heap::new();
        let array = heap.alloc_array(None, vec![Value::int32(0)]);
        array.set_index(3, Value::int32(3));
        assert_eq!(array.indexed_kind(), IndexedKind::Simple);
        assert_eq!(array.array_length(), 4);
        assert_eq!(array.get_index(1), None);

        array.set_index(1_000_000, Value::int32(7));
        assert_eq!(array.indexed_kind(), IndexedKind::Sparse);
        assert_eq!(array.array_length(), 1_000_001);
        assert_eq!(array.get_index(3), Some(Value::int32(3)));
        assert_eq!(array.get_index(1_000_000), Some(Value::int32(7)));
    }
}
