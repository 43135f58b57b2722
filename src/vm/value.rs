//! NaN-boxed runtime values.
//!
//! Every value is a single 64-bit word. Doubles are stored as their raw IEEE
//! bits; everything else lives inside the quiet-NaN space and is identified by
//! the top 16 bits (the tag). Exactly one NaN bit pattern, [`CANONICAL_NAN_BITS`],
//! is a double: any NaN produced by arithmetic must be rewritten to it before
//! it is stored, otherwise it could collide with a tag.

use std::fmt;

use super::heap::{Accessor, BigIntCell, Object, ObjectRef, PrimitiveString};

pub const TAG_SHIFT: u64 = 48;
pub const PAYLOAD_MASK: u64 = (1 << TAG_SHIFT) - 1;

pub const BASE_TAG: u64 = 0x7FF8;
pub const BOOLEAN_TAG: u64 = 0x7FF9;
pub const INT32_TAG: u64 = 0x7FFA;
pub const EMPTY_TAG: u64 = 0x7FFB;
pub const ACCESSOR_TAG: u64 = 0x7FFC;
pub const UNDEFINED_TAG: u64 = 0x7FFE;
pub const NULL_TAG: u64 = 0x7FFF;
pub const OBJECT_TAG: u64 = 0xFFF9;
pub const STRING_TAG: u64 = 0xFFFA;
pub const BIGINT_TAG: u64 = 0xFFFC;

/// Mask that selects the "is this in the tagged NaN space" bits of a tag.
pub const NAN_SPACE_MASK: u64 = 0x7FF8;
/// Undefined and null differ only in the lowest tag bit.
pub const NULLISH_TAG_MASK: u64 = 0xFFFE;

pub const CANONICAL_NAN_BITS: u64 = BASE_TAG << TAG_SHIFT;

pub const SHIFTED_BOOLEAN_TAG: u64 = BOOLEAN_TAG << TAG_SHIFT;
pub const SHIFTED_INT32_TAG: u64 = INT32_TAG << TAG_SHIFT;
pub const SHIFTED_EMPTY_TAG: u64 = EMPTY_TAG << TAG_SHIFT;
pub const SHIFTED_UNDEFINED_TAG: u64 = UNDEFINED_TAG << TAG_SHIFT;
pub const SHIFTED_NULL_TAG: u64 = NULL_TAG << TAG_SHIFT;

/// A NaN-boxed value.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value(u64);

impl Value {
    pub const fn from_raw(bits: u64) -> Self {
        Value(bits)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn undefined() -> Self {
        Value(SHIFTED_UNDEFINED_TAG)
    }

    pub const fn null() -> Self {
        Value(SHIFTED_NULL_TAG)
    }

    /// The "no value" marker: uninitialized bindings, empty registers.
    pub const fn empty() -> Self {
        Value(SHIFTED_EMPTY_TAG)
    }

    pub const fn boolean(b: bool) -> Self {
        Value(SHIFTED_BOOLEAN_TAG | b as u64)
    }

    pub const fn int32(n: i32) -> Self {
        Value(SHIFTED_INT32_TAG | (n as u32 as u64))
    }

    /// Box a double without normalizing it to an int32.
    pub fn from_f64(f: f64) -> Self {
        if f.is_nan() {
            Value(CANONICAL_NAN_BITS)
        } else {
            Value(f.to_bits())
        }
    }

    /// Box a numeric result, preferring the int32 encoding when it is exact.
    pub fn number(f: f64) -> Self {
        if f.fract() == 0.0
            && f >= i32::MIN as f64
            && f <= i32::MAX as f64
            && !(f == 0.0 && f.is_sign_negative())
        {
            Value::int32(f as i32)
        } else {
            Value::from_f64(f)
        }
    }

    pub fn nan() -> Self {
        Value(CANONICAL_NAN_BITS)
    }

    pub(crate) fn from_cell(tag: u64, ptr: *const u8) -> Self {
        Value((tag << TAG_SHIFT) | (ptr as u64 & PAYLOAD_MASK))
    }

    pub fn object(object: ObjectRef) -> Self {
        Self::from_cell(OBJECT_TAG, object.as_ptr() as *const u8)
    }

    pub(crate) fn string(string: *const PrimitiveString) -> Self {
        Self::from_cell(STRING_TAG, string as *const u8)
    }

    pub(crate) fn bigint(bigint: *const BigIntCell) -> Self {
        Self::from_cell(BIGINT_TAG, bigint as *const u8)
    }

    pub(crate) fn accessor(accessor: *const Accessor) -> Self {
        Self::from_cell(ACCESSOR_TAG, accessor as *const u8)
    }

    #[inline]
    pub const fn tag(self) -> u64 {
        self.0 >> TAG_SHIFT
    }

    #[inline]
    pub const fn is_double(self) -> bool {
        let tag = self.tag();
        tag == BASE_TAG || (tag & NAN_SPACE_MASK) != NAN_SPACE_MASK
    }

    pub const fn is_int32(self) -> bool {
        self.tag() == INT32_TAG
    }

    pub const fn is_number(self) -> bool {
        self.is_int32() || self.is_double()
    }

    pub const fn is_boolean(self) -> bool {
        self.tag() == BOOLEAN_TAG
    }

    pub const fn is_empty(self) -> bool {
        self.tag() == EMPTY_TAG
    }

    pub const fn is_undefined(self) -> bool {
        self.tag() == UNDEFINED_TAG
    }

    pub const fn is_null(self) -> bool {
        self.tag() == NULL_TAG
    }

    pub const fn is_nullish(self) -> bool {
        (self.tag() & NULLISH_TAG_MASK) == UNDEFINED_TAG
    }

    pub const fn is_object(self) -> bool {
        self.tag() == OBJECT_TAG
    }

    pub const fn is_string(self) -> bool {
        self.tag() == STRING_TAG
    }

    pub const fn is_bigint(self) -> bool {
        self.tag() == BIGINT_TAG
    }

    pub const fn is_accessor(self) -> bool {
        self.tag() == ACCESSOR_TAG
    }

    pub const fn is_cell(self) -> bool {
        matches!(self.tag(), OBJECT_TAG | STRING_TAG | BIGINT_TAG | ACCESSOR_TAG)
    }

    pub const fn as_i32(self) -> i32 {
        self.0 as u32 as i32
    }

    pub const fn as_bool(self) -> bool {
        self.0 & 1 == 1
    }

    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    /// Numeric value of an int32 or double. Callers check [`Value::is_number`].
    pub fn as_number(self) -> f64 {
        if self.is_int32() {
            self.as_i32() as f64
        } else {
            self.as_f64()
        }
    }

    /// Cell pointer; the 48-bit payload is sign-extended from bit 47.
    #[inline]
    pub fn as_cell_ptr(self) -> *mut u8 {
        (((self.0 << 16) as i64) >> 16) as *mut u8
    }

    pub fn as_object(self) -> Option<ObjectRef> {
        if self.is_object() {
            ObjectRef::from_ptr(self.as_cell_ptr() as *mut Object)
        } else {
            None
        }
    }

    pub fn as_string(self) -> Option<&'static PrimitiveString> {
        if self.is_string() {
            // SAFETY: string cells live in the heap until the VM is dropped.
            Some(unsafe { &*(self.as_cell_ptr() as *const PrimitiveString) })
        } else {
            None
        }
    }

    pub fn as_bigint(self) -> Option<&'static BigIntCell> {
        if self.is_bigint() {
            // SAFETY: see `as_string`.
            Some(unsafe { &*(self.as_cell_ptr() as *const BigIntCell) })
        } else {
            None
        }
    }

    pub fn as_accessor(self) -> Option<&'static Accessor> {
        if self.is_accessor() {
            // SAFETY: see `as_string`.
            Some(unsafe { &*(self.as_cell_ptr() as *const Accessor) })
        } else {
            None
        }
    }

    pub fn is_function(self) -> bool {
        self.as_object().is_some_and(|o| o.is_function())
    }
}

/// SameValue: numeric values compare by mathematical value (with NaN equal to
/// itself and +0 distinct from -0), strings and bigints by content, everything
/// else by identity.
pub fn same_value(a: Value, b: Value) -> bool {
    if a.is_number() && b.is_number() {
        let (x, y) = (a.as_number(), b.as_number());
        if x.is_nan() && y.is_nan() {
            return true;
        }
        return x == y && x.is_sign_negative() == y.is_sign_negative();
    }
    if let (Some(x), Some(y)) = (a.as_string(), b.as_string()) {
        return x.as_str() == y.as_str();
    }
    if let (Some(x), Some(y)) = (a.as_bigint(), b.as_bigint()) {
        return x.value() == y.value();
    }
    a == b
}

impl Default for Value {
    fn default() -> Self {
        Value::undefined()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_double() {
            return write!(f, "Double({:?})", self.as_f64());
        }
        match self.tag() {
            INT32_TAG => write!(f, "Int32({})", self.as_i32()),
            BOOLEAN_TAG => write!(f, "Boolean({})", self.as_bool()),
            EMPTY_TAG => write!(f, "Empty"),
            UNDEFINED_TAG => write!(f, "Undefined"),
            NULL_TAG => write!(f, "Null"),
            STRING_TAG => match self.as_string() {
                Some(s) => write!(f, "String({:?})", s.as_str()),
                None => write!(f, "String(?)"),
            },
            BIGINT_TAG => match self.as_bigint() {
                Some(b) => write!(f, "BigInt({})", b.value()),
                None => write!(f, "BigInt(?)"),
            },
            OBJECT_TAG => write!(f, "Object({:p})", self.as_cell_ptr()),
            ACCESSOR_TAG => write!(f, "Accessor({:p})", self.as_cell_ptr()),
            tag => write!(f, "Unknown(tag={:#x}, bits={:#x})", tag, self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_discrimination() {
        assert!(Value::from_f64(1.5).is_double());
        assert!(Value::from_f64(-0.0).is_double());
        assert!(Value::from_f64(f64::INFINITY).is_double());
        assert!(Value::from_f64(f64::NEG_INFINITY).is_double());
        assert!(Value::nan().is_double());
        assert!(!Value::int32(1).is_double());
        assert!(!Value::undefined().is_double());
        assert!(!Value::null().is_double());
        assert!(!Value::empty().is_double());
        assert!(!Value::boolean(true).is_double());
    }

    #[test]
    fn test_every_nan_is_canonicalized() {
        let payload_nan = f64::from_bits(0x7FF8_0000_0000_0001);
        let negative_nan = f64::from_bits(0xFFF8_0000_0000_0000);
        let signaling_nan = f64::from_bits(0x7FF0_0000_0000_0001);
        let tag_collision = f64::from_bits(0x7FFA_0000_0000_0005);
        for nan in [payload_nan, negative_nan, signaling_nan, tag_collision, f64::NAN] {
            let value = Value::from_f64(nan);
            assert_eq!(value.raw(), CANONICAL_NAN_BITS);
            assert!(value.is_double());
            assert!(!value.is_int32());
        }
    }

    #[test]
    fn test_int32_round_trip() {
        for n in [0, 1, -1, i32::MAX, i32::MIN] {
            let value = Value::int32(n);
            assert!(value.is_int32());
            assert_eq!(value.as_i32(), n);
        }
    }

    #[test]
    fn test_number_normalization() {
        assert!(Value::number(3.0).is_int32());
        assert!(Value::number(-0.0).is_double());
        assert!(Value::number(2147483648.0).is_double());
        assert!(Value::number(0.5).is_double());
        assert_eq!(Value::from_f64(3.0).as_f64(), 3.0);
        assert!(Value::from_f64(3.0).is_double());
    }

    #[test]
    fn test_nullish() {
        assert!(Value::undefined().is_nullish());
        assert!(Value::null().is_nullish());
        assert!(!Value::boolean(false).is_nullish());
        assert!(!Value::empty().is_nullish());
    }

    #[test]
    fn test_pointer_payload_sign_extension() {
        let high = 0xFFFF_8000_0000_1000u64 as *const u8;
        let value = Value::from_cell(OBJECT_TAG, high);
        assert_eq!(value.tag(), OBJECT_TAG);
        assert_eq!(value.as_cell_ptr() as u64, 0xFFFF_8000_0000_1000);

        let low = 0x0000_7FFF_1234_5678u64 as *const u8;
        let value = Value::from_cell(STRING_TAG, low);
        assert_eq!(value.as_cell_ptr() as u64, 0x0000_7FFF_1234_5678);
    }

    #[test]
    fn test_same_value_numbers() {
        assert!(same_value(Value::int32(3), Value::from_f64(3.0)));
        assert!(same_value(Value::nan(), Value::nan()));
        assert!(!same_value(Value::from_f64(0.0), Value::from_f64(-0.0)));
        assert!(!same_value(Value::int32(1), Value::boolean(true)));
    }
}
