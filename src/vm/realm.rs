//! The global object, the global declarative environment and the builtin
//! functions.

use serde::{Deserialize, Serialize};

use super::Value;
use super::environment::Environment;
use super::heap::{Callable, Heap, ObjectRef};
use super::ops::{self, Completion};
use super::vm::Vm;

/// Native functions known to the bytecode. Compiled code compares a callee
/// against `Realm::builtins()[builtin as usize]` before taking an inline path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Builtin {
    MathAbs = 0,
    MathFloor = 1,
    MathCeil = 2,
    MathRound = 3,
    MathSqrt = 4,
    Print = 5,
}

impl Builtin {
    pub const ALL: [Builtin; 6] = [
        Builtin::MathAbs,
        Builtin::MathFloor,
        Builtin::MathCeil,
        Builtin::MathRound,
        Builtin::MathSqrt,
        Builtin::Print,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::MathAbs => "abs",
            Builtin::MathFloor => "floor",
            Builtin::MathCeil => "ceil",
            Builtin::MathRound => "round",
            Builtin::MathSqrt => "sqrt",
            Builtin::Print => "print",
        }
    }

    pub fn call(self, vm: &Vm, args: &[Value]) -> Completion<Value> {
        let math: fn(f64) -> f64 = match self {
            Builtin::MathAbs => f64::abs,
            Builtin::MathFloor => f64::floor,
            Builtin::MathCeil => f64::ceil,
            Builtin::MathRound => math_round,
            Builtin::MathSqrt => f64::sqrt,
            Builtin::Print => {
                let line = args
                    .iter()
                    .map(|&arg| ops::to_display_string(vm, arg))
                    .collect::<Vec<_>>()
                    .join(" ");
                vm.print(line);
                return Ok(Value::undefined());
            }
        };
        let x = match args.first() {
            Some(&arg) => ops::to_number(vm, arg)?,
            None => f64::NAN,
        };
        Ok(Value::number(math(x)))
    }
}

/// Rounds half up, keeping the sign of zero for inputs in [-0.5, 0].
fn math_round(x: f64) -> f64 {
    if !x.is_finite() || x == 0.0 {
        return x;
    }
    let floor = x.floor();
    let rounded = if x - floor >= 0.5 { floor + 1.0 } else { floor };
    if rounded == 0.0 && x.is_sign_negative() {
        -0.0
    } else {
        rounded
    }
}

pub struct Realm {
    global_object: ObjectRef,
    global_environment: *const Environment,
    object_prototype: ObjectRef,
    array_prototype: ObjectRef,
    function_prototype: ObjectRef,
    error_prototype: ObjectRef,
    builtins: Box<[Value]>,
}

impl Realm {
    pub fn new(heap: &Heap) -> Self {
        let object_prototype = heap.alloc_object(None);
        let array_prototype = heap.alloc_object(Some(object_prototype));
        let function_prototype = heap.alloc_object(Some(object_prototype));
        let error_prototype = heap.alloc_object(Some(object_prototype));
        let global_object = heap.alloc_object(Some(object_prototype));
        let global_environment = heap.alloc_environment(std::ptr::null());

        let builtins: Box<[Value]> = Builtin::ALL
            .iter()
            .map(|&builtin| {
                let function =
                    heap.alloc_function(Some(function_prototype), Callable::Builtin(builtin));
                heap.put_own(function, "name", heap.alloc_string(builtin.name()));
                Value::object(function)
            })
            .collect();

        let math = heap.alloc_object(Some(object_prototype));
        for builtin in [
            Builtin::MathAbs,
            Builtin::MathFloor,
            Builtin::MathCeil,
            Builtin::MathRound,
            Builtin::MathSqrt,
        ] {
            heap.put_own(math, builtin.name(), builtins[builtin.index()]);
        }
        heap.put_own(global_object, "Math", Value::object(math));
        heap.put_own(global_object, "print", builtins[Builtin::Print.index()]);
        heap.put_own(global_object, "globalThis", Value::object(global_object));
        heap.put_own(global_object, "NaN", Value::nan());
        heap.put_own(global_object, "Infinity", Value::from_f64(f64::INFINITY));
        heap.put_own(global_object, "undefined", Value::undefined());

        Self {
            global_object,
            global_environment,
            object_prototype,
            array_prototype,
            function_prototype,
            error_prototype,
            builtins,
        }
    }

    pub fn global_object(&self) -> ObjectRef {
        self.global_object
    }

    pub fn global_environment(&self) -> &Environment {
        // SAFETY: allocated from the heap that owns this realm.
        unsafe { &*self.global_environment }
    }

    pub fn global_environment_ptr(&self) -> *const Environment {
        self.global_environment
    }

    pub fn object_prototype(&self) -> ObjectRef {
        self.object_prototype
    }

    pub fn array_prototype(&self) -> ObjectRef {
        self.array_prototype
    }

    pub fn function_prototype(&self) -> ObjectRef {
        self.function_prototype
    }

    pub fn error_prototype(&self) -> ObjectRef {
        self.error_prototype
    }

    /// Builtin function objects, indexed by [`Builtin::index`].
    pub fn builtins(&self) -> &[Value] {
        &self.builtins
    }

    pub fn builtin(&self, builtin: Builtin) -> Value {
        self.builtins[builtin.index()]
    }

    /// Which builtin `value` is, by identity.
    pub fn builtin_for(&self, value: Value) -> Option<Builtin> {
        Builtin::ALL
            .into_iter()
            .find(|&builtin| self.builtins[builtin.index()] == value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_math_round() {
        assert_eq!(math_round(2.5), 3.0);
        assert_eq!(math_round(-2.5), -2.0);
        assert_eq!(math_round(0.49999999999999994), 0.0);
        assert!(math_round(-0.3).is_sign_negative());
        assert!(math_round(f64::NAN).is_nan());
    }

    #[test]
    fn test_builtin_table_matches_globals() {
        let heap = Heap::new();
        let realm = Realm::new(&heap);
        let math = realm.global_object().get_own("Math").and_then(Value::as_object).unwrap();
        assert_eq!(math.get_own("abs"), Some(realm.builtin(Builtin::MathAbs)));
        assert_eq!(realm.builtin_for(realm.builtin(Builtin::MathSqrt)), Some(Builtin::MathSqrt));
        assert_eq!(realm.builtin_for(Value::int32(0)), None);
    }
}
