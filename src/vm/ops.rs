//! Abstract operations with full language semantics.
//!
//! The interpreter executes instructions with these directly; compiled code
//! reaches them through the slow-path helpers once a fast path has declined.
//! Either way the answer comes from here, which keeps the two tiers in
//! agreement.
//!
//! Language-level exceptions are values: every fallible operation returns a
//! [`Completion`], whose error side is the thrown value.

use std::cmp::Ordering;

use num_bigint::BigInt;
use num_traits::{FromPrimitive, ToPrimitive, Zero};
use tracing::trace;

use super::Value;
use super::bytecode::{BinaryOp, UnaryOp};
use super::environment::Environment;
use super::heap::{Callable, ObjectRef, PropertyKey};
use super::ic::{CachedBinding, EnvironmentCache, GlobalVariableCache, PropertyLookupCache};
use super::vm::Vm;

pub type Completion<T> = Result<T, Value>;

/// Largest exponent accepted for BigInt `**` and shifts.
const MAX_BIGINT_BITS: u64 = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    TypeError,
    ReferenceError,
    RangeError,
}

impl ErrorType {
    fn name(self) -> &'static str {
        match self {
            ErrorType::TypeError => "TypeError",
            ErrorType::ReferenceError => "ReferenceError",
            ErrorType::RangeError => "RangeError",
        }
    }
}

pub fn make_error(vm: &Vm, kind: ErrorType, message: &str) -> Value {
    let heap = vm.heap();
    let error = heap.alloc_object(Some(vm.realm().error_prototype()));
    heap.put_own(error, "name", heap.alloc_string(kind.name()));
    heap.put_own(error, "message", heap.alloc_string(message));
    Value::object(error)
}

pub fn throw<T>(vm: &Vm, kind: ErrorType, message: &str) -> Completion<T> {
    Err(make_error(vm, kind, message))
}

// =============================================================================
// Conversions
// =============================================================================

pub fn to_boolean(value: Value) -> bool {
    if value.is_boolean() {
        return value.as_bool();
    }
    if value.is_int32() {
        return value.as_i32() != 0;
    }
    if value.is_double() {
        let f = value.as_f64();
        return !(f == 0.0 || f.is_nan());
    }
    if let Some(s) = value.as_string() {
        return !s.as_str().is_empty();
    }
    if let Some(b) = value.as_bigint() {
        return !b.value().is_zero();
    }
    value.is_object()
}

/// Objects convert without running user code: errors render as
/// `Name: message`, arrays join their elements, functions show their name.
pub fn to_primitive(vm: &Vm, value: Value) -> Value {
    let Some(object) = value.as_object() else {
        return value;
    };
    let text = object_to_string(vm, object);
    vm.heap().alloc_string(&text)
}

fn object_to_string(vm: &Vm, object: ObjectRef) -> String {
    if let Some(callable) = object.callable() {
        return match callable {
            Callable::Bytecode { executable, .. } => format!("function {}", executable.name),
            Callable::Builtin(builtin) => format!("function {}", builtin.name()),
        };
    }
    if object.is_array() {
        return object
            .elements()
            .into_iter()
            .map(|element| {
                if element.is_nullish() {
                    String::new()
                } else {
                    to_string(vm, element)
                }
            })
            .collect::<Vec<_>>()
            .join(",");
    }
    if object.prototype() == Some(vm.realm().error_prototype()) {
        let field = |key| object.get_own(key).map(|v| to_string(vm, v)).unwrap_or_default();
        let message = field("message");
        return if message.is_empty() {
            field("name")
        } else {
            format!("{}: {}", field("name"), message)
        };
    }
    "[object Object]".to_string()
}

pub fn to_number(vm: &Vm, value: Value) -> Completion<f64> {
    if value.is_number() {
        return Ok(value.as_number());
    }
    if value.is_boolean() {
        return Ok(if value.as_bool() { 1.0 } else { 0.0 });
    }
    if value.is_undefined() || value.is_empty() {
        return Ok(f64::NAN);
    }
    if value.is_null() {
        return Ok(0.0);
    }
    if let Some(s) = value.as_string() {
        return Ok(string_to_number(s.as_str()));
    }
    if value.is_bigint() {
        return throw(vm, ErrorType::TypeError, "Cannot convert a BigInt value to a number");
    }
    to_number(vm, to_primitive(vm, value))
}

/// A number or a BigInt.
pub fn to_numeric(vm: &Vm, value: Value) -> Completion<Value> {
    let primitive = to_primitive(vm, value);
    if primitive.is_bigint() || primitive.is_number() {
        return Ok(primitive);
    }
    Ok(Value::number(to_number(vm, primitive)?))
}

pub fn f64_to_int32(f: f64) -> i32 {
    f64_to_uint32(f) as i32
}

pub fn f64_to_uint32(f: f64) -> u32 {
    if !f.is_finite() {
        return 0;
    }
    f.trunc().rem_euclid(4294967296.0) as u32
}

pub fn to_int32(vm: &Vm, value: Value) -> Completion<i32> {
    if value.is_int32() {
        return Ok(value.as_i32());
    }
    Ok(f64_to_int32(to_number(vm, value)?))
}

pub fn to_uint32(vm: &Vm, value: Value) -> Completion<u32> {
    if value.is_int32() {
        return Ok(value.as_i32() as u32);
    }
    Ok(f64_to_uint32(to_number(vm, value)?))
}

pub fn to_string(vm: &Vm, value: Value) -> String {
    if let Some(s) = value.as_string() {
        return s.as_str().to_string();
    }
    if value.is_int32() {
        return value.as_i32().to_string();
    }
    if value.is_double() {
        return number_to_string(value.as_f64());
    }
    if value.is_boolean() {
        return value.as_bool().to_string();
    }
    if value.is_undefined() {
        return "undefined".to_string();
    }
    if value.is_null() {
        return "null".to_string();
    }
    if let Some(b) = value.as_bigint() {
        return b.value().to_string();
    }
    if let Some(object) = value.as_object() {
        return object_to_string(vm, object);
    }
    String::new()
}

/// Rendering used by `print` and for uncaught exceptions.
pub fn to_display_string(vm: &Vm, value: Value) -> String {
    if value.is_empty() {
        return "<empty>".to_string();
    }
    if let Some(b) = value.as_bigint() {
        return format!("{}n", b.value());
    }
    to_string(vm, value)
}

pub fn to_property_key(vm: &Vm, value: Value) -> PropertyKey {
    if let Some(s) = value.as_string() {
        return PropertyKey::from(s.as_str());
    }
    PropertyKey::from(to_string(vm, value))
}

/// Shortest round-trip decimal, switching to exponent form outside
/// [1e-7, 1e21).
pub fn number_to_string(f: f64) -> String {
    if f.is_nan() {
        return "NaN".to_string();
    }
    if f == 0.0 {
        return "0".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    let magnitude = f.abs();
    if (1e-7..1e21).contains(&magnitude) {
        return format!("{}", f);
    }
    let formatted = format!("{:e}", f);
    match formatted.split_once('e') {
        Some((mantissa, exponent)) if !exponent.starts_with('-') => {
            format!("{}e+{}", mantissa, exponent)
        }
        _ => formatted,
    }
}

pub fn string_to_number(s: &str) -> f64 {
    let text = s.trim();
    if text.is_empty() {
        return 0.0;
    }
    match text {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    let radix = match text.get(..2) {
        Some("0x" | "0X") => Some(16),
        Some("0o" | "0O") => Some(8),
        Some("0b" | "0B") => Some(2),
        _ => None,
    };
    if let Some(radix) = radix {
        let digits = &text[2..];
        if digits.is_empty() {
            return f64::NAN;
        }
        return digits
            .chars()
            .try_fold(0.0, |acc: f64, c| c.to_digit(radix).map(|d| acc * radix as f64 + d as f64))
            .unwrap_or(f64::NAN);
    }
    let plausible = text
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'));
    if !plausible {
        return f64::NAN;
    }
    text.parse::<f64>().unwrap_or(f64::NAN)
}

fn string_to_bigint(s: &str) -> Option<BigInt> {
    let text = s.trim();
    if text.is_empty() {
        return Some(BigInt::zero());
    }
    text.parse::<BigInt>().ok()
}

/// Canonical array index (`"0"`, `"17"`, but not `"01"` or `"-1"`).
pub fn array_index(key: &str) -> Option<u32> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    if !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse::<u32>().ok().filter(|&index| index != u32::MAX)
}

pub fn typeof_string(value: Value) -> &'static str {
    if value.is_number() {
        "number"
    } else if value.is_boolean() {
        "boolean"
    } else if value.is_undefined() || value.is_empty() {
        "undefined"
    } else if value.is_string() {
        "string"
    } else if value.is_bigint() {
        "bigint"
    } else if value.is_function() {
        "function"
    } else {
        "object"
    }
}

// =============================================================================
// Operators
// =============================================================================

pub fn binary(vm: &Vm, op: BinaryOp, lhs: Value, rhs: Value) -> Completion<Value> {
    match op {
        BinaryOp::Add => add(vm, lhs, rhs),
        BinaryOp::Sub => arithmetic(vm, lhs, rhs, |a, b| a - b, |a, b| Ok(a - b)),
        BinaryOp::Mul => arithmetic(vm, lhs, rhs, |a, b| a * b, |a, b| Ok(a * b)),
        BinaryOp::Div => arithmetic(vm, lhs, rhs, |a, b| a / b, |a, b| {
            if b.is_zero() { Err("Division by zero") } else { Ok(a / b) }
        }),
        BinaryOp::Mod => arithmetic(vm, lhs, rhs, |a, b| a % b, |a, b| {
            if b.is_zero() { Err("Division by zero") } else { Ok(a % b) }
        }),
        BinaryOp::Exp => arithmetic(vm, lhs, rhs, exponentiate, |a, b| {
            if b < &BigInt::zero() {
                return Err("Exponent must be non-negative");
            }
            match b.to_u32() {
                Some(exponent) if (exponent as u64) < MAX_BIGINT_BITS => Ok(a.pow(exponent)),
                _ => Err("Maximum BigInt size exceeded"),
            }
        }),
        BinaryOp::BitwiseAnd => bitwise(vm, lhs, rhs, |a, b| a & b, |a, b| Ok(a & b)),
        BinaryOp::BitwiseOr => bitwise(vm, lhs, rhs, |a, b| a | b, |a, b| Ok(a | b)),
        BinaryOp::BitwiseXor => bitwise(vm, lhs, rhs, |a, b| a ^ b, |a, b| Ok(a ^ b)),
        BinaryOp::LeftShift => bitwise(
            vm,
            lhs,
            rhs,
            |a, b| a.wrapping_shl(b as u32 & 31),
            |a, b| shift_bigint(a, b),
        ),
        BinaryOp::RightShift => bitwise(
            vm,
            lhs,
            rhs,
            |a, b| a >> (b as u32 & 31),
            |a, b| shift_bigint(a, &-b),
        ),
        BinaryOp::UnsignedRightShift => {
            let (l, r) = (to_numeric(vm, lhs)?, to_numeric(vm, rhs)?);
            if l.is_bigint() || r.is_bigint() {
                return throw(vm, ErrorType::TypeError, "BigInts have no unsigned right shift, use >> instead");
            }
            let shifted = to_uint32(vm, l)? >> (to_uint32(vm, r)? & 31);
            Ok(Value::number(shifted as f64))
        }
        BinaryOp::LessThan => Ok(Value::boolean(compare(vm, lhs, rhs)? == Some(true))),
        BinaryOp::GreaterThan => Ok(Value::boolean(compare(vm, rhs, lhs)? == Some(true))),
        BinaryOp::LessThanEquals => Ok(Value::boolean(compare(vm, rhs, lhs)? == Some(false))),
        BinaryOp::GreaterThanEquals => Ok(Value::boolean(compare(vm, lhs, rhs)? == Some(false))),
        BinaryOp::LooselyEquals => Ok(Value::boolean(loosely_equals(vm, lhs, rhs))),
        BinaryOp::LooselyInequals => Ok(Value::boolean(!loosely_equals(vm, lhs, rhs))),
        BinaryOp::StrictlyEquals => Ok(Value::boolean(strictly_equals(lhs, rhs))),
        BinaryOp::StrictlyInequals => Ok(Value::boolean(!strictly_equals(lhs, rhs))),
    }
}

fn exponentiate(base: f64, exponent: f64) -> f64 {
    if exponent.is_nan() || (base.abs() == 1.0 && exponent.is_infinite()) {
        return f64::NAN;
    }
    base.powf(exponent)
}

fn shift_bigint(value: &BigInt, amount: &BigInt) -> Result<BigInt, &'static str> {
    let Some(amount) = amount.to_i64() else {
        return Err("Maximum BigInt size exceeded");
    };
    if amount.unsigned_abs() >= MAX_BIGINT_BITS {
        if amount < 0 {
            return Ok(if value < &BigInt::zero() { BigInt::from(-1) } else { BigInt::zero() });
        }
        return Err("Maximum BigInt size exceeded");
    }
    if amount >= 0 {
        Ok(value << amount as usize)
    } else {
        Ok(value >> (-amount) as usize)
    }
}

pub fn add(vm: &Vm, lhs: Value, rhs: Value) -> Completion<Value> {
    if lhs.is_number() && rhs.is_number() {
        return Ok(Value::number(lhs.as_number() + rhs.as_number()));
    }
    let (l, r) = (to_primitive(vm, lhs), to_primitive(vm, rhs));
    if l.is_string() || r.is_string() {
        let text = to_string(vm, l) + &to_string(vm, r);
        return Ok(vm.heap().alloc_string(&text));
    }
    arithmetic(vm, l, r, |a, b| a + b, |a, b| Ok(a + b))
}

fn arithmetic(
    vm: &Vm,
    lhs: Value,
    rhs: Value,
    number: impl FnOnce(f64, f64) -> f64,
    bigint: impl FnOnce(&BigInt, &BigInt) -> Result<BigInt, &'static str>,
) -> Completion<Value> {
    let (l, r) = (to_numeric(vm, lhs)?, to_numeric(vm, rhs)?);
    match (l.as_bigint(), r.as_bigint()) {
        (Some(a), Some(b)) => match bigint(a.value(), b.value()) {
            Ok(result) => Ok(vm.heap().alloc_bigint(result)),
            Err(message) => throw(vm, ErrorType::RangeError, message),
        },
        (None, None) => Ok(Value::number(number(l.as_number(), r.as_number()))),
        _ => throw(vm, ErrorType::TypeError, "Cannot mix BigInt and other types, use explicit conversions"),
    }
}

fn bitwise(
    vm: &Vm,
    lhs: Value,
    rhs: Value,
    number: impl FnOnce(i32, i32) -> i32,
    bigint: impl FnOnce(&BigInt, &BigInt) -> Result<BigInt, &'static str>,
) -> Completion<Value> {
    let (l, r) = (to_numeric(vm, lhs)?, to_numeric(vm, rhs)?);
    match (l.as_bigint(), r.as_bigint()) {
        (Some(a), Some(b)) => match bigint(a.value(), b.value()) {
            Ok(result) => Ok(vm.heap().alloc_bigint(result)),
            Err(message) => throw(vm, ErrorType::RangeError, message),
        },
        (None, None) => Ok(Value::int32(number(
            f64_to_int32(l.as_number()),
            f64_to_int32(r.as_number()),
        ))),
        _ => throw(vm, ErrorType::TypeError, "Cannot mix BigInt and other types, use explicit conversions"),
    }
}

/// `x < y`; `None` when the comparison is undefined (NaN involved).
fn compare(vm: &Vm, x: Value, y: Value) -> Completion<Option<bool>> {
    let (px, py) = (to_primitive(vm, x), to_primitive(vm, y));
    if let (Some(a), Some(b)) = (px.as_string(), py.as_string()) {
        return Ok(Some(a.as_str().encode_utf16().lt(b.as_str().encode_utf16())));
    }
    if let (Some(a), Some(b)) = (px.as_bigint(), py.as_string()) {
        return Ok(string_to_bigint(b.as_str()).map(|b| a.value() < &b));
    }
    if let (Some(a), Some(b)) = (px.as_string(), py.as_bigint()) {
        return Ok(string_to_bigint(a.as_str()).map(|a| &a < b.value()));
    }
    let (nx, ny) = (to_numeric(vm, px)?, to_numeric(vm, py)?);
    Ok(match (nx.as_bigint(), ny.as_bigint()) {
        (Some(a), Some(b)) => Some(a.value() < b.value()),
        (Some(a), None) => compare_bigint_number(a.value(), ny.as_number()).map(|o| o == Ordering::Less),
        (None, Some(b)) => {
            compare_bigint_number(b.value(), nx.as_number()).map(|o| o == Ordering::Greater)
        }
        (None, None) => {
            let (a, b) = (nx.as_number(), ny.as_number());
            if a.is_nan() || b.is_nan() { None } else { Some(a < b) }
        }
    })
}

/// Exact ordering of a BigInt against a double.
fn compare_bigint_number(big: &BigInt, number: f64) -> Option<Ordering> {
    if number.is_nan() {
        return None;
    }
    if number.is_infinite() {
        return Some(if number > 0.0 { Ordering::Less } else { Ordering::Greater });
    }
    let floor = BigInt::from_f64(number.floor())?;
    Some(match big.cmp(&floor) {
        Ordering::Equal if number.fract() != 0.0 => Ordering::Less,
        ordering => ordering,
    })
}

pub fn strictly_equals(lhs: Value, rhs: Value) -> bool {
    if lhs.is_number() && rhs.is_number() {
        return lhs.as_number() == rhs.as_number();
    }
    if let (Some(a), Some(b)) = (lhs.as_string(), rhs.as_string()) {
        return a.as_str() == b.as_str();
    }
    if let (Some(a), Some(b)) = (lhs.as_bigint(), rhs.as_bigint()) {
        return a.value() == b.value();
    }
    lhs == rhs
}

fn same_type(lhs: Value, rhs: Value) -> bool {
    (lhs.is_number() && rhs.is_number()) || (!lhs.is_double() && !rhs.is_double() && lhs.tag() == rhs.tag())
}

pub fn loosely_equals(vm: &Vm, lhs: Value, rhs: Value) -> bool {
    if same_type(lhs, rhs) {
        return strictly_equals(lhs, rhs);
    }
    if lhs.is_nullish() && rhs.is_nullish() {
        return true;
    }
    if lhs.is_nullish() || rhs.is_nullish() {
        return false;
    }
    if lhs.is_number() && rhs.is_string() {
        return lhs.as_number() == to_number(vm, rhs).unwrap_or(f64::NAN);
    }
    if lhs.is_string() && rhs.is_number() {
        return loosely_equals(vm, rhs, lhs);
    }
    if let (Some(a), Some(b)) = (lhs.as_bigint(), rhs.as_string()) {
        return string_to_bigint(b.as_str()).is_some_and(|b| &b == a.value());
    }
    if lhs.is_string() && rhs.is_bigint() {
        return loosely_equals(vm, rhs, lhs);
    }
    if lhs.is_boolean() {
        return loosely_equals(vm, Value::int32(lhs.as_bool() as i32), rhs);
    }
    if rhs.is_boolean() {
        return loosely_equals(vm, lhs, Value::int32(rhs.as_bool() as i32));
    }
    if lhs.is_object() && !rhs.is_object() {
        return loosely_equals(vm, to_primitive(vm, lhs), rhs);
    }
    if rhs.is_object() && !lhs.is_object() {
        return loosely_equals(vm, lhs, to_primitive(vm, rhs));
    }
    if let (Some(a), true) = (lhs.as_bigint(), rhs.is_number()) {
        return compare_bigint_number(a.value(), rhs.as_number()) == Some(Ordering::Equal);
    }
    if let (true, Some(b)) = (lhs.is_number(), rhs.as_bigint()) {
        return compare_bigint_number(b.value(), lhs.as_number()) == Some(Ordering::Equal);
    }
    false
}

pub fn unary(vm: &Vm, op: UnaryOp, value: Value) -> Completion<Value> {
    match op {
        UnaryOp::Not => Ok(Value::boolean(!to_boolean(value))),
        UnaryOp::Typeof => Ok(vm.heap().alloc_string(typeof_string(value))),
        UnaryOp::UnaryPlus => Ok(Value::number(to_number(vm, value)?)),
        UnaryOp::ToNumeric => to_numeric(vm, value),
        UnaryOp::UnaryMinus => {
            let numeric = to_numeric(vm, value)?;
            match numeric.as_bigint() {
                Some(b) => Ok(vm.heap().alloc_bigint(-b.value())),
                None => Ok(Value::number(-numeric.as_number())),
            }
        }
        UnaryOp::BitwiseNot => {
            let numeric = to_numeric(vm, value)?;
            match numeric.as_bigint() {
                Some(b) => Ok(vm.heap().alloc_bigint(!b.value())),
                None => Ok(Value::int32(!f64_to_int32(numeric.as_number()))),
            }
        }
        UnaryOp::Increment | UnaryOp::Decrement => {
            let delta = if op == UnaryOp::Increment { 1 } else { -1 };
            let numeric = to_numeric(vm, value)?;
            match numeric.as_bigint() {
                Some(b) => Ok(vm.heap().alloc_bigint(b.value() + delta)),
                None => Ok(Value::number(numeric.as_number() + delta as f64)),
            }
        }
    }
}

// =============================================================================
// Properties
// =============================================================================

fn describe_base(vm: &Vm, base: Value) -> String {
    to_display_string(vm, base)
}

fn read_slot(vm: &Vm, value: Value, receiver: Value) -> Completion<Value> {
    let Some(accessor) = value.as_accessor() else {
        return Ok(value);
    };
    let getter = accessor.getter.get();
    if getter.is_function() {
        call(vm, getter, receiver, &[], None)
    } else {
        Ok(Value::undefined())
    }
}

fn get_from_object(vm: &Vm, object: ObjectRef, receiver: Value, key: &str) -> Completion<Value> {
    let index = array_index(key);
    let mut current = Some(object);
    while let Some(o) = current {
        if let Some(index) = index {
            if let Some(value) = o.get_index(index) {
                return Ok(value);
            }
        } else if key == "length" && o.is_array() {
            return Ok(Value::number(o.array_length() as f64));
        }
        if let Some(value) = o.get_own(key) {
            return read_slot(vm, value, receiver);
        }
        current = o.prototype();
    }
    Ok(Value::undefined())
}

pub fn has_property(object: ObjectRef, key: &str) -> bool {
    let index = array_index(key);
    let mut current = Some(object);
    while let Some(o) = current {
        let own = match index {
            Some(index) => o.get_index(index).is_some(),
            None => (key == "length" && o.is_array()) || o.shape().lookup(key).is_some(),
        };
        if own {
            return true;
        }
        current = o.prototype();
    }
    false
}

pub fn get_property(vm: &Vm, base: Value, key: &str) -> Completion<Value> {
    if let Some(object) = base.as_object() {
        return get_from_object(vm, object, base, key);
    }
    if let Some(s) = base.as_string() {
        let units: Vec<u16> = s.as_str().encode_utf16().collect();
        if key == "length" {
            return Ok(Value::int32(units.len() as i32));
        }
        if let Some(unit) = array_index(key).and_then(|i| units.get(i as usize)) {
            let text = String::from_utf16_lossy(std::slice::from_ref(unit));
            return Ok(vm.heap().alloc_string(&text));
        }
        return Ok(Value::undefined());
    }
    if base.is_nullish() || base.is_empty() {
        let message = format!("Cannot read property '{}' of {}", key, describe_base(vm, base));
        return throw(vm, ErrorType::TypeError, &message);
    }
    Ok(Value::undefined())
}

pub fn put_property(vm: &Vm, base: Value, key: &str, value: Value) -> Completion<()> {
    let Some(object) = base.as_object() else {
        if base.is_nullish() || base.is_empty() {
            let message = format!("Cannot set property '{}' of {}", key, describe_base(vm, base));
            return throw(vm, ErrorType::TypeError, &message);
        }
        return Ok(());
    };
    if let Some(index) = array_index(key) {
        object.set_index(index, value);
        return Ok(());
    }
    if key == "length" && object.is_array() {
        return Ok(());
    }
    let mut current = Some(object);
    while let Some(o) = current {
        if let Some(existing) = o.get_own(key) {
            if let Some(accessor) = existing.as_accessor() {
                let setter = accessor.setter.get();
                if setter.is_function() {
                    call(vm, setter, base, &[value], None)?;
                }
                return Ok(());
            }
            break;
        }
        current = o.prototype();
    }
    vm.heap().put_own(object, key, value);
    Ok(())
}

pub fn get_by_id(vm: &Vm, base: Value, key: &str, cache: &PropertyLookupCache) -> Completion<Value> {
    if let Some(object) = base.as_object() {
        if let Some(value) = cache.check(object.shape_ptr()).and_then(|slot| object.slot_value(slot)) {
            if !value.is_accessor() {
                return Ok(value);
            }
        }
        if let Some(slot) = object.shape().lookup(key) {
            if let Some(value) = object.slot_value(slot).filter(|v| !v.is_accessor()) {
                trace!(key, slot, "populating property cache");
                cache.update(object.shape_ptr(), slot);
                return Ok(value);
            }
        }
    }
    get_property(vm, base, key)
}

pub fn put_by_id(
    vm: &Vm,
    base: Value,
    key: &str,
    value: Value,
    cache: &PropertyLookupCache,
) -> Completion<()> {
    if let Some(object) = base.as_object() {
        let own_data_slot = cache
            .check(object.shape_ptr())
            .or_else(|| object.shape().lookup(key))
            .filter(|&slot| object.slot_value(slot).is_some_and(|v| !v.is_accessor()));
        if let Some(slot) = own_data_slot {
            object.set_slot_value(slot, value);
            cache.update(object.shape_ptr(), slot);
            return Ok(());
        }
    }
    put_property(vm, base, key, value)
}

pub fn get_by_value(vm: &Vm, base: Value, key: Value) -> Completion<Value> {
    if let Some(object) = base.as_object() {
        if key.is_int32() && key.as_i32() >= 0 {
            if let Some(value) = object.get_index(key.as_i32() as u32) {
                return Ok(value);
            }
        }
    }
    let key = to_property_key(vm, key);
    get_property(vm, base, &key)
}

pub fn put_by_value(vm: &Vm, base: Value, key: Value, value: Value) -> Completion<()> {
    if let Some(object) = base.as_object() {
        if key.is_int32() && key.as_i32() >= 0 {
            object.set_index(key.as_i32() as u32, value);
            return Ok(());
        }
    }
    let key = to_property_key(vm, key);
    put_property(vm, base, &key, value)
}

pub fn delete_by_id(vm: &Vm, base: Value, key: &str) -> Completion<bool> {
    match base.as_object() {
        Some(object) => Ok(vm.heap().delete_own(object, key)),
        None if base.is_nullish() => {
            let message = format!("Cannot delete property '{}' of {}", key, describe_base(vm, base));
            throw(vm, ErrorType::TypeError, &message)
        }
        None => Ok(true),
    }
}

// =============================================================================
// Variables
// =============================================================================

fn uninitialized<T>(vm: &Vm, name: &str) -> Completion<T> {
    throw(vm, ErrorType::ReferenceError, &format!("Cannot access '{}' before initialization", name))
}

fn not_defined<T>(vm: &Vm, name: &str) -> Completion<T> {
    throw(vm, ErrorType::ReferenceError, &format!("'{}' is not defined", name))
}

pub fn get_variable(
    vm: &Vm,
    environment: &Environment,
    name: &str,
    cache: &EnvironmentCache,
) -> Completion<Value> {
    if let Some(binding) = cache.entry().filter(|b| b.origin == environment.serial()) {
        let cached = environment
            .ancestor(binding.hops)
            .filter(|env| env.serial() == binding.serial)
            .and_then(|env| env.get(binding.index))
            .filter(|value| !value.is_empty());
        if let Some(value) = cached {
            return Ok(value);
        }
    }
    let Some((location, tainted)) = environment.resolve(name) else {
        let global = vm.realm().global_object();
        if has_property(global, name) {
            return get_property(vm, Value::object(global), name);
        }
        return not_defined(vm, name);
    };
    let Some(target) = environment.ancestor(location.hops) else {
        return not_defined(vm, name);
    };
    let value = target.get(location.index).unwrap_or(Value::empty());
    if value.is_empty() {
        return uninitialized(vm, name);
    }
    if !tainted {
        let mut crossed = Some(environment);
        for _ in 0..location.hops {
            if let Some(env) = crossed {
                env.mark_crossed();
                crossed = env.parent();
            }
        }
        trace!(name, hops = location.hops, index = location.index, "populating environment cache");
        cache.update(CachedBinding {
            hops: location.hops,
            index: location.index,
            origin: environment.serial(),
            serial: target.serial(),
        });
    }
    Ok(value)
}

pub fn set_variable(
    vm: &Vm,
    environment: &Environment,
    name: &str,
    value: Value,
    initialize: bool,
) -> Completion<()> {
    let Some((location, _)) = environment.resolve(name) else {
        let global = Value::object(vm.realm().global_object());
        return put_property(vm, global, name, value);
    };
    let Some(target) = environment.ancestor(location.hops) else {
        return not_defined(vm, name);
    };
    if !initialize {
        if target.get(location.index).is_none_or(|v| v.is_empty()) {
            return uninitialized(vm, name);
        }
        if !target.is_mutable(location.index) {
            return throw(vm, ErrorType::TypeError, "Assignment to constant variable.");
        }
    }
    target.set(location.index, value);
    Ok(())
}

pub fn create_variable(vm: &Vm, environment: &Environment, name: &str, mutable: bool) {
    let before = environment.binding_count();
    environment.declare(vm.heap(), name, mutable);
    if environment.binding_count() != before && environment.was_crossed() {
        vm.invalidate_environment_caches();
    }
}

pub fn get_global(vm: &Vm, name: &str, cache: &GlobalVariableCache) -> Completion<Value> {
    let realm = vm.realm();
    let global = realm.global_object();
    let declarative = realm.global_environment();
    if let Some(slot) = cache.check(global.shape_ptr(), declarative.serial()) {
        if let Some(value) = global.slot_value(slot).filter(|v| !v.is_accessor()) {
            return Ok(value);
        }
    }
    if let Some(index) = declarative.binding_index(name) {
        let value = declarative.get(index).unwrap_or(Value::empty());
        if value.is_empty() {
            return uninitialized(vm, name);
        }
        return Ok(value);
    }
    if let Some(slot) = global.shape().lookup(name) {
        if let Some(value) = global.slot_value(slot).filter(|v| !v.is_accessor()) {
            trace!(name, slot, "populating global cache");
            cache.update(global.shape_ptr(), slot, declarative.serial());
            return Ok(value);
        }
    }
    if has_property(global, name) {
        return get_property(vm, Value::object(global), name);
    }
    not_defined(vm, name)
}

// =============================================================================
// Calls
// =============================================================================

pub fn call(
    vm: &Vm,
    callee: Value,
    this: Value,
    args: &[Value],
    expression: Option<&str>,
) -> Completion<Value> {
    let Some(function) = callee.as_object().filter(|o| o.is_function()) else {
        let shown = match expression {
            Some(expression) => expression.to_string(),
            None => to_display_string(vm, callee),
        };
        return throw(vm, ErrorType::TypeError, &format!("{} is not a function", shown));
    };
    vm.call_function(function, this, args)
}
