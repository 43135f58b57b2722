//! Bytecode executables.
//!
//! The instruction set is accumulator based: binary operators combine a
//! register (the left-hand side) with the accumulator (the right-hand side)
//! and leave their result in the accumulator. Control flow is expressed as a
//! list of basic blocks, each ending in exactly one terminator; a block may
//! name a handler and/or finalizer block that receives control when an
//! exception is raised inside it.
//!
//! Executables are loaded from JSON (`ExecutableDef`) or assembled with
//! [`ExecutableBuilder`]; both paths go through the same validation.

use std::cell::{Cell, OnceCell};
use std::fmt;
use std::rc::Rc;

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Value;
use super::heap::PropertyKey;
use super::ic::InlineCacheTable;
use super::realm::Builtin;
use crate::jit::NativeExecutable;

/// Error type for malformed executables.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BytecodeError {
    #[error("executable `{0}` has no basic blocks")]
    NoBlocks(String),
    #[error("block {block} is empty")]
    EmptyBlock { block: u32 },
    #[error("block {block} does not end in a terminator")]
    MissingTerminator { block: u32 },
    #[error("block {block}: terminator at {offset} is not the last instruction")]
    TerminatorNotLast { block: u32, offset: u32 },
    #[error("block {block}: jump target {target} does not exist")]
    BadLabel { block: u32, target: u32 },
    #[error("block {block}: register {register} out of bounds (count {count})")]
    RegisterOutOfBounds { block: u32, register: u32, count: u32 },
    #[error("block {block}: local {index} out of bounds (count {count})")]
    LocalOutOfBounds { block: u32, index: u32, count: u32 },
    #[error("block {block}: {table} index {index} out of bounds")]
    TableIndexOutOfBounds { block: u32, table: &'static str, index: u32 },
    #[error("invalid bigint literal `{0}`")]
    InvalidBigInt(String),
    #[error("register count {0} is smaller than the reserved registers")]
    TooFewRegisters(u32),
}

// =============================================================================
// Operands
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Register(pub u32);

impl Register {
    pub const ACCUMULATOR: Register = Register(0);
    pub const EXCEPTION: Register = Register(1);
    pub const THIS: Register = Register(2);
    pub const RETURN_VALUE: Register = Register(3);
    pub const SAVED_RETURN_VALUE: Register = Register(4);
    pub const SAVED_EXCEPTION: Register = Register(5);

    /// Number of registers every frame reserves before user registers.
    pub const RESERVED_COUNT: u32 = 6;

    /// The `n`th general purpose register.
    pub const fn user(n: u32) -> Register {
        Register(Self::RESERVED_COUNT + n)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Register::ACCUMULATOR => write!(f, "acc"),
            Register::EXCEPTION => write!(f, "exception"),
            Register::THIS => write!(f, "this"),
            Register::RETURN_VALUE => write!(f, "return_value"),
            Register::SAVED_RETURN_VALUE => write!(f, "saved_return_value"),
            Register::SAVED_EXCEPTION => write!(f, "saved_exception"),
            Register(n) => write!(f, "r{}", n),
        }
    }
}

/// A basic block, by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(pub u32);

impl Label {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StringIndex(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentifierIndex(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Immediate {
    Undefined,
    Null,
    Boolean(bool),
    Int32(i32),
    Number(f64),
}

impl Immediate {
    pub fn to_value(self) -> Value {
        match self {
            Immediate::Undefined => Value::undefined(),
            Immediate::Null => Value::null(),
            Immediate::Boolean(b) => Value::boolean(b),
            Immediate::Int32(n) => Value::int32(n),
            Immediate::Number(f) => Value::from_f64(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Exp,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    LeftShift,
    RightShift,
    UnsignedRightShift,
    LessThan,
    LessThanEquals,
    GreaterThan,
    GreaterThanEquals,
    LooselyEquals,
    LooselyInequals,
    StrictlyEquals,
    StrictlyInequals,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 20] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Div,
        BinaryOp::Mod,
        BinaryOp::Exp,
        BinaryOp::BitwiseAnd,
        BinaryOp::BitwiseOr,
        BinaryOp::BitwiseXor,
        BinaryOp::LeftShift,
        BinaryOp::RightShift,
        BinaryOp::UnsignedRightShift,
        BinaryOp::LessThan,
        BinaryOp::LessThanEquals,
        BinaryOp::GreaterThan,
        BinaryOp::GreaterThanEquals,
        BinaryOp::LooselyEquals,
        BinaryOp::LooselyInequals,
        BinaryOp::StrictlyEquals,
        BinaryOp::StrictlyInequals,
    ];

    /// The instruction computing `lhs <op> accumulator`.
    pub fn instruction(self, lhs: Register) -> Instruction {
        match self {
            BinaryOp::Add => Instruction::Add { lhs },
            BinaryOp::Sub => Instruction::Sub { lhs },
            BinaryOp::Mul => Instruction::Mul { lhs },
            BinaryOp::Div => Instruction::Div { lhs },
            BinaryOp::Mod => Instruction::Mod { lhs },
            BinaryOp::Exp => Instruction::Exp { lhs },
            BinaryOp::BitwiseAnd => Instruction::BitwiseAnd { lhs },
            BinaryOp::BitwiseOr => Instruction::BitwiseOr { lhs },
            BinaryOp::BitwiseXor => Instruction::BitwiseXor { lhs },
            BinaryOp::LeftShift => Instruction::LeftShift { lhs },
            BinaryOp::RightShift => Instruction::RightShift { lhs },
            BinaryOp::UnsignedRightShift => Instruction::UnsignedRightShift { lhs },
            BinaryOp::LessThan => Instruction::LessThan { lhs },
            BinaryOp::LessThanEquals => Instruction::LessThanEquals { lhs },
            BinaryOp::GreaterThan => Instruction::GreaterThan { lhs },
            BinaryOp::GreaterThanEquals => Instruction::GreaterThanEquals { lhs },
            BinaryOp::LooselyEquals => Instruction::LooselyEquals { lhs },
            BinaryOp::LooselyInequals => Instruction::LooselyInequals { lhs },
            BinaryOp::StrictlyEquals => Instruction::StrictlyEquals { lhs },
            BinaryOp::StrictlyInequals => Instruction::StrictlyInequals { lhs },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Typeof,
    UnaryPlus,
    UnaryMinus,
    BitwiseNot,
    ToNumeric,
    Increment,
    Decrement,
}

impl UnaryOp {
    pub const ALL: [UnaryOp; 8] = [
        UnaryOp::Not,
        UnaryOp::Typeof,
        UnaryOp::UnaryPlus,
        UnaryOp::UnaryMinus,
        UnaryOp::BitwiseNot,
        UnaryOp::ToNumeric,
        UnaryOp::Increment,
        UnaryOp::Decrement,
    ];
}

// =============================================================================
// Instructions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Instruction {
    Load { src: Register },
    LoadImmediate { value: Immediate },
    Store { dst: Register },
    GetLocal { index: u32 },
    SetLocal { index: u32 },
    NewString { string: StringIndex },
    NewBigInt { string: StringIndex },
    NewObject,
    NewArray { first_element: Register, element_count: u32 },
    NewFunction { function: u32 },
    ResolveThisBinding,

    Add { lhs: Register },
    Sub { lhs: Register },
    Mul { lhs: Register },
    Div { lhs: Register },
    Mod { lhs: Register },
    Exp { lhs: Register },
    BitwiseAnd { lhs: Register },
    BitwiseOr { lhs: Register },
    BitwiseXor { lhs: Register },
    LeftShift { lhs: Register },
    RightShift { lhs: Register },
    UnsignedRightShift { lhs: Register },
    LessThan { lhs: Register },
    LessThanEquals { lhs: Register },
    GreaterThan { lhs: Register },
    GreaterThanEquals { lhs: Register },
    LooselyEquals { lhs: Register },
    LooselyInequals { lhs: Register },
    StrictlyEquals { lhs: Register },
    StrictlyInequals { lhs: Register },

    Not,
    Typeof,
    UnaryPlus,
    UnaryMinus,
    BitwiseNot,
    ToNumeric,
    Increment,
    Decrement,

    /// acc = acc.property
    GetById { property: IdentifierIndex, cache: u32 },
    /// base.property = acc
    PutById { base: Register, property: IdentifierIndex, cache: u32 },
    /// acc = delete acc.property
    DeleteById { property: IdentifierIndex },
    /// acc = base[acc]
    GetByValue { base: Register },
    /// base[property] = acc
    PutByValue { base: Register, property: Register },
    GetVariable { identifier: IdentifierIndex, cache: u32 },
    SetVariable { identifier: IdentifierIndex, initialize: bool },
    CreateVariable { identifier: IdentifierIndex, mutable: bool },
    GetGlobal { identifier: IdentifierIndex, cache: u32 },
    CreateLexicalEnvironment,
    LeaveLexicalEnvironment,

    Call {
        callee: Register,
        this_value: Register,
        first_argument: Register,
        argument_count: u32,
        #[serde(default)]
        builtin: Option<Builtin>,
        #[serde(default)]
        expression_string: Option<StringIndex>,
    },

    Jump { target: Label },
    JumpConditional { true_target: Label, false_target: Label },
    JumpNullish { true_target: Label, false_target: Label },
    JumpUndefined { true_target: Label, false_target: Label },
    EnterUnwindContext { entry: Label },
    LeaveUnwindContext,
    ContinuePendingUnwind { resume_target: Label },
    ScheduleJump { target: Label },
    Throw,
    ThrowIfNotObject,
    ThrowIfNullish,
    Return,
    Yield { continuation: Option<Label> },
    Await { continuation: Label },
}

impl Instruction {
    pub fn as_binary(&self) -> Option<(BinaryOp, Register)> {
        let (op, lhs) = match *self {
            Instruction::Add { lhs } => (BinaryOp::Add, lhs),
            Instruction::Sub { lhs } => (BinaryOp::Sub, lhs),
            Instruction::Mul { lhs } => (BinaryOp::Mul, lhs),
            Instruction::Div { lhs } => (BinaryOp::Div, lhs),
            Instruction::Mod { lhs } => (BinaryOp::Mod, lhs),
            Instruction::Exp { lhs } => (BinaryOp::Exp, lhs),
            Instruction::BitwiseAnd { lhs } => (BinaryOp::BitwiseAnd, lhs),
            Instruction::BitwiseOr { lhs } => (BinaryOp::BitwiseOr, lhs),
            Instruction::BitwiseXor { lhs } => (BinaryOp::BitwiseXor, lhs),
            Instruction::LeftShift { lhs } => (BinaryOp::LeftShift, lhs),
            Instruction::RightShift { lhs } => (BinaryOp::RightShift, lhs),
            Instruction::UnsignedRightShift { lhs } => (BinaryOp::UnsignedRightShift, lhs),
            Instruction::LessThan { lhs } => (BinaryOp::LessThan, lhs),
            Instruction::LessThanEquals { lhs } => (BinaryOp::LessThanEquals, lhs),
            Instruction::GreaterThan { lhs } => (BinaryOp::GreaterThan, lhs),
            Instruction::GreaterThanEquals { lhs } => (BinaryOp::GreaterThanEquals, lhs),
            Instruction::LooselyEquals { lhs } => (BinaryOp::LooselyEquals, lhs),
            Instruction::LooselyInequals { lhs } => (BinaryOp::LooselyInequals, lhs),
            Instruction::StrictlyEquals { lhs } => (BinaryOp::StrictlyEquals, lhs),
            Instruction::StrictlyInequals { lhs } => (BinaryOp::StrictlyInequals, lhs),
            _ => return None,
        };
        Some((op, lhs))
    }

    pub fn as_unary(&self) -> Option<UnaryOp> {
        Some(match self {
            Instruction::Not => UnaryOp::Not,
            Instruction::Typeof => UnaryOp::Typeof,
            Instruction::UnaryPlus => UnaryOp::UnaryPlus,
            Instruction::UnaryMinus => UnaryOp::UnaryMinus,
            Instruction::BitwiseNot => UnaryOp::BitwiseNot,
            Instruction::ToNumeric => UnaryOp::ToNumeric,
            Instruction::Increment => UnaryOp::Increment,
            Instruction::Decrement => UnaryOp::Decrement,
            _ => return None,
        })
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Jump { .. }
                | Instruction::JumpConditional { .. }
                | Instruction::JumpNullish { .. }
                | Instruction::JumpUndefined { .. }
                | Instruction::EnterUnwindContext { .. }
                | Instruction::ContinuePendingUnwind { .. }
                | Instruction::ScheduleJump { .. }
                | Instruction::Throw
                | Instruction::Return
                | Instruction::Yield { .. }
                | Instruction::Await { .. }
        )
    }

    /// Mnemonic, for logs and bail-out reasons.
    pub fn name(&self) -> &'static str {
        match self {
            Instruction::Load { .. } => "Load",
            Instruction::LoadImmediate { .. } => "LoadImmediate",
            Instruction::Store { .. } => "Store",
            Instruction::GetLocal { .. } => "GetLocal",
            Instruction::SetLocal { .. } => "SetLocal",
            Instruction::NewString { .. } => "NewString",
            Instruction::NewBigInt { .. } => "NewBigInt",
            Instruction::NewObject => "NewObject",
            Instruction::NewArray { .. } => "NewArray",
            Instruction::NewFunction { .. } => "NewFunction",
            Instruction::ResolveThisBinding => "ResolveThisBinding",
            Instruction::Add { .. } => "Add",
            Instruction::Sub { .. } => "Sub",
            Instruction::Mul { .. } => "Mul",
            Instruction::Div { .. } => "Div",
            Instruction::Mod { .. } => "Mod",
            Instruction::Exp { .. } => "Exp",
            Instruction::BitwiseAnd { .. } => "BitwiseAnd",
            Instruction::BitwiseOr { .. } => "BitwiseOr",
            Instruction::BitwiseXor { .. } => "BitwiseXor",
            Instruction::LeftShift { .. } => "LeftShift",
            Instruction::RightShift { .. } => "RightShift",
            Instruction::UnsignedRightShift { .. } => "UnsignedRightShift",
            Instruction::LessThan { .. } => "LessThan",
            Instruction::LessThanEquals { .. } => "LessThanEquals",
            Instruction::GreaterThan { .. } => "GreaterThan",
            Instruction::GreaterThanEquals { .. } => "GreaterThanEquals",
            Instruction::LooselyEquals { .. } => "LooselyEquals",
            Instruction::LooselyInequals { .. } => "LooselyInequals",
            Instruction::StrictlyEquals { .. } => "StrictlyEquals",
            Instruction::StrictlyInequals { .. } => "StrictlyInequals",
            Instruction::Not => "Not",
            Instruction::Typeof => "Typeof",
            Instruction::UnaryPlus => "UnaryPlus",
            Instruction::UnaryMinus => "UnaryMinus",
            Instruction::BitwiseNot => "BitwiseNot",
            Instruction::ToNumeric => "ToNumeric",
            Instruction::Increment => "Increment",
            Instruction::Decrement => "Decrement",
            Instruction::GetById { .. } => "GetById",
            Instruction::PutById { .. } => "PutById",
            Instruction::DeleteById { .. } => "DeleteById",
            Instruction::GetByValue { .. } => "GetByValue",
            Instruction::PutByValue { .. } => "PutByValue",
            Instruction::GetVariable { .. } => "GetVariable",
            Instruction::SetVariable { .. } => "SetVariable",
            Instruction::CreateVariable { .. } => "CreateVariable",
            Instruction::GetGlobal { .. } => "GetGlobal",
            Instruction::CreateLexicalEnvironment => "CreateLexicalEnvironment",
            Instruction::LeaveLexicalEnvironment => "LeaveLexicalEnvironment",
            Instruction::Call { .. } => "Call",
            Instruction::Jump { .. } => "Jump",
            Instruction::JumpConditional { .. } => "JumpConditional",
            Instruction::JumpNullish { .. } => "JumpNullish",
            Instruction::JumpUndefined { .. } => "JumpUndefined",
            Instruction::EnterUnwindContext { .. } => "EnterUnwindContext",
            Instruction::LeaveUnwindContext => "LeaveUnwindContext",
            Instruction::ContinuePendingUnwind { .. } => "ContinuePendingUnwind",
            Instruction::ScheduleJump { .. } => "ScheduleJump",
            Instruction::Throw => "Throw",
            Instruction::ThrowIfNotObject => "ThrowIfNotObject",
            Instruction::ThrowIfNullish => "ThrowIfNullish",
            Instruction::Return => "Return",
            Instruction::Yield { .. } => "Yield",
            Instruction::Await { .. } => "Await",
        }
    }

    fn labels(&self) -> Vec<Label> {
        match *self {
            Instruction::Jump { target } | Instruction::ScheduleJump { target } => vec![target],
            Instruction::JumpConditional { true_target, false_target }
            | Instruction::JumpNullish { true_target, false_target }
            | Instruction::JumpUndefined { true_target, false_target } => {
                vec![true_target, false_target]
            }
            Instruction::EnterUnwindContext { entry } => vec![entry],
            Instruction::ContinuePendingUnwind { resume_target } => vec![resume_target],
            Instruction::Yield { continuation } => continuation.into_iter().collect(),
            Instruction::Await { continuation } => vec![continuation],
            _ => Vec::new(),
        }
    }

    /// Every register this instruction reads or writes, ranges expanded to
    /// their last element.
    fn registers(&self) -> Vec<Register> {
        match *self {
            Instruction::Load { src } => vec![src],
            Instruction::Store { dst } => vec![dst],
            Instruction::NewArray { first_element, element_count } if element_count > 0 => {
                vec![first_element, Register(first_element.0 + element_count - 1)]
            }
            Instruction::PutById { base, .. } | Instruction::GetByValue { base } => vec![base],
            Instruction::PutByValue { base, property } => vec![base, property],
            Instruction::Call { callee, this_value, first_argument, argument_count, .. } => {
                let mut registers = vec![callee, this_value];
                if argument_count > 0 {
                    registers.push(first_argument);
                    registers.push(Register(first_argument.0 + argument_count - 1));
                }
                registers
            }
            _ => self.as_binary().map(|(_, lhs)| vec![lhs]).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicBlock {
    #[serde(default)]
    pub name: String,
    pub instructions: Vec<Instruction>,
    #[serde(default)]
    pub handler: Option<Label>,
    #[serde(default)]
    pub finalizer: Option<Label>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FunctionKind {
    #[default]
    Normal,
    Generator,
    Async,
}

// =============================================================================
// Executable
// =============================================================================

/// Serialized form of an executable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableDef {
    pub name: String,
    #[serde(default)]
    pub kind: FunctionKind,
    /// Total register count, reserved registers included.
    pub register_count: u32,
    #[serde(default)]
    pub local_names: Vec<String>,
    #[serde(default)]
    pub parameter_count: u32,
    pub basic_blocks: Vec<BasicBlock>,
    #[serde(default)]
    pub string_table: Vec<String>,
    #[serde(default)]
    pub identifier_table: Vec<String>,
    #[serde(default)]
    pub functions: Vec<ExecutableDef>,
}

pub struct Executable {
    pub name: String,
    pub kind: FunctionKind,
    pub register_count: u32,
    pub local_names: Vec<String>,
    pub parameter_count: u32,
    pub basic_blocks: Vec<BasicBlock>,
    pub string_table: Vec<String>,
    pub identifier_table: Vec<PropertyKey>,
    pub functions: Vec<Rc<Executable>>,
    bigints: Vec<Option<BigInt>>,
    caches: InlineCacheTable,
    native: OnceCell<Option<Rc<NativeExecutable>>>,
    call_count: Cell<u32>,
}

impl Executable {
    pub fn from_def(def: ExecutableDef) -> Result<Rc<Executable>, BytecodeError> {
        let functions = def
            .functions
            .into_iter()
            .map(Executable::from_def)
            .collect::<Result<Vec<_>, _>>()?;
        let mut executable = Executable {
            name: def.name,
            kind: def.kind,
            register_count: def.register_count,
            local_names: def.local_names,
            parameter_count: def.parameter_count,
            basic_blocks: def.basic_blocks,
            string_table: def.string_table,
            identifier_table: def.identifier_table.iter().map(|s| PropertyKey::from(s.as_str())).collect(),
            functions,
            bigints: Vec::new(),
            caches: InlineCacheTable::default(),
            native: OnceCell::new(),
            call_count: Cell::new(0),
        };
        let counts = executable.validate()?;
        executable.caches = InlineCacheTable::new(counts.property, counts.global, counts.environment);
        executable.bigints = executable.parse_bigints()?;
        Ok(Rc::new(executable))
    }

    pub fn from_json(json: &str) -> Result<Rc<Executable>, crate::error::VmError> {
        let def: ExecutableDef = serde_json::from_str(json)?;
        Ok(Executable::from_def(def)?)
    }

    pub fn to_def(&self) -> ExecutableDef {
        ExecutableDef {
            name: self.name.clone(),
            kind: self.kind,
            register_count: self.register_count,
            local_names: self.local_names.clone(),
            parameter_count: self.parameter_count,
            basic_blocks: self.basic_blocks.clone(),
            string_table: self.string_table.clone(),
            identifier_table: self.identifier_table.iter().map(|s| s.to_string()).collect(),
            functions: self.functions.iter().map(|f| f.to_def()).collect(),
        }
    }

    pub fn local_count(&self) -> u32 {
        self.local_names.len() as u32
    }

    pub fn caches(&self) -> &InlineCacheTable {
        &self.caches
    }

    pub fn identifier(&self, index: IdentifierIndex) -> &PropertyKey {
        &self.identifier_table[index.0 as usize]
    }

    pub fn string(&self, index: StringIndex) -> &str {
        &self.string_table[index.0 as usize]
    }

    /// The parsed literal for a `NewBigInt` string-table entry.
    pub fn bigint_literal(&self, index: StringIndex) -> Option<&BigInt> {
        self.bigints.get(index.0 as usize).and_then(Option::as_ref)
    }

    /// Count an invocation; returns the number of earlier ones.
    pub(crate) fn record_call(&self) -> u32 {
        let count = self.call_count.get();
        self.call_count.set(count.saturating_add(1));
        count
    }

    pub(crate) fn native_cell(&self) -> &OnceCell<Option<Rc<NativeExecutable>>> {
        &self.native
    }

    /// Compiled code, if compilation has been attempted and succeeded.
    pub fn native(&self) -> Option<Rc<NativeExecutable>> {
        self.native.get().cloned().flatten()
    }

    /// Blocks that some `Yield`/`Await` resumes into.
    pub fn continuation_blocks(&self) -> Vec<Label> {
        let mut labels: Vec<Label> = self
            .basic_blocks
            .iter()
            .flat_map(|block| block.instructions.last())
            .filter_map(|insn| match *insn {
                Instruction::Yield { continuation } => continuation,
                Instruction::Await { continuation } => Some(continuation),
                _ => None,
            })
            .collect();
        labels.sort_by_key(|l| l.0);
        labels.dedup();
        labels
    }

    fn parse_bigints(&self) -> Result<Vec<Option<BigInt>>, BytecodeError> {
        let mut parsed = vec![None; self.string_table.len()];
        for block in &self.basic_blocks {
            for insn in &block.instructions {
                if let Instruction::NewBigInt { string } = insn {
                    let text = &self.string_table[string.0 as usize];
                    let value = text
                        .parse::<BigInt>()
                        .map_err(|_| BytecodeError::InvalidBigInt(text.clone()))?;
                    parsed[string.0 as usize] = Some(value);
                }
            }
        }
        Ok(parsed)
    }

    /// Check structural well-formedness and bounds; returns the number of
    /// cache cells each kind needs.
    fn validate(&self) -> Result<CacheCounts, BytecodeError> {
        if self.basic_blocks.is_empty() {
            return Err(BytecodeError::NoBlocks(self.name.clone()));
        }
        if self.register_count < Register::RESERVED_COUNT {
            return Err(BytecodeError::TooFewRegisters(self.register_count));
        }
        let block_count = self.basic_blocks.len() as u32;
        let mut counts = CacheCounts::default();

        for (block_index, block) in self.basic_blocks.iter().enumerate() {
            let block_index = block_index as u32;
            let check_label = |label: Label| {
                if label.0 < block_count {
                    Ok(())
                } else {
                    Err(BytecodeError::BadLabel { block: block_index, target: label.0 })
                }
            };
            let Some(last) = block.instructions.last() else {
                return Err(BytecodeError::EmptyBlock { block: block_index });
            };
            if !last.is_terminator() {
                return Err(BytecodeError::MissingTerminator { block: block_index });
            }
            block.handler.map(check_label).transpose()?;
            block.finalizer.map(check_label).transpose()?;

            for (offset, insn) in block.instructions.iter().enumerate() {
                if insn.is_terminator() && offset + 1 != block.instructions.len() {
                    return Err(BytecodeError::TerminatorNotLast {
                        block: block_index,
                        offset: offset as u32,
                    });
                }
                for label in insn.labels() {
                    check_label(label)?;
                }
                for register in insn.registers() {
                    if register.0 >= self.register_count {
                        return Err(BytecodeError::RegisterOutOfBounds {
                            block: block_index,
                            register: register.0,
                            count: self.register_count,
                        });
                    }
                }
                self.validate_tables(block_index, insn, &mut counts)?;
            }
        }
        Ok(counts)
    }

    fn validate_tables(
        &self,
        block: u32,
        insn: &Instruction,
        counts: &mut CacheCounts,
    ) -> Result<(), BytecodeError> {
        let check = |table: &'static str, index: u32, len: usize| {
            if (index as usize) < len {
                Ok(())
            } else {
                Err(BytecodeError::TableIndexOutOfBounds { block, table, index })
            }
        };
        let identifiers = self.identifier_table.len();
        match *insn {
            Instruction::GetLocal { index } | Instruction::SetLocal { index } => {
                if index >= self.local_count() {
                    return Err(BytecodeError::LocalOutOfBounds {
                        block,
                        index,
                        count: self.local_count(),
                    });
                }
            }
            Instruction::NewString { string } | Instruction::NewBigInt { string } => {
                check("string", string.0, self.string_table.len())?;
            }
            Instruction::Call { expression_string: Some(string), .. } => {
                check("string", string.0, self.string_table.len())?;
            }
            Instruction::NewFunction { function } => {
                check("function", function, self.functions.len())?;
            }
            Instruction::GetById { property, cache } | Instruction::PutById { property, cache, .. } => {
                check("identifier", property.0, identifiers)?;
                counts.property = counts.property.max(cache as usize + 1);
            }
            Instruction::DeleteById { property } => check("identifier", property.0, identifiers)?,
            Instruction::GetVariable { identifier, cache } => {
                check("identifier", identifier.0, identifiers)?;
                counts.environment = counts.environment.max(cache as usize + 1);
            }
            Instruction::GetGlobal { identifier, cache } => {
                check("identifier", identifier.0, identifiers)?;
                counts.global = counts.global.max(cache as usize + 1);
            }
            Instruction::SetVariable { identifier, .. }
            | Instruction::CreateVariable { identifier, .. } => {
                check("identifier", identifier.0, identifiers)?;
            }
            _ => {}
        }
        Ok(())
    }
}

impl fmt::Debug for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executable")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("register_count", &self.register_count)
            .field("blocks", &self.basic_blocks.len())
            .finish()
    }
}

#[derive(Debug, Default)]
struct CacheCounts {
    property: usize,
    global: usize,
    environment: usize,
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles an executable block by block.
pub struct ExecutableBuilder {
    def: ExecutableDef,
    functions: Vec<Rc<Executable>>,
    next_property_cache: u32,
    next_global_cache: u32,
    next_environment_cache: u32,
}

impl ExecutableBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            def: ExecutableDef {
                name: name.to_string(),
                kind: FunctionKind::Normal,
                register_count: Register::RESERVED_COUNT,
                local_names: Vec::new(),
                parameter_count: 0,
                basic_blocks: Vec::new(),
                string_table: Vec::new(),
                identifier_table: Vec::new(),
                functions: Vec::new(),
            },
            functions: Vec::new(),
            next_property_cache: 0,
            next_global_cache: 0,
            next_environment_cache: 0,
        }
    }

    pub fn set_kind(&mut self, kind: FunctionKind) {
        self.def.kind = kind;
    }

    pub fn allocate_register(&mut self) -> Register {
        let register = Register(self.def.register_count);
        self.def.register_count += 1;
        register
    }

    /// Declare a local; parameters occupy the first locals in order.
    pub fn add_local(&mut self, name: &str) -> u32 {
        self.def.local_names.push(name.to_string());
        self.def.local_names.len() as u32 - 1
    }

    pub fn add_parameter(&mut self, name: &str) -> u32 {
        let index = self.add_local(name);
        self.def.parameter_count += 1;
        index
    }

    pub fn make_block(&mut self, name: &str) -> Label {
        self.def.basic_blocks.push(BasicBlock {
            name: name.to_string(),
            instructions: Vec::new(),
            handler: None,
            finalizer: None,
        });
        Label(self.def.basic_blocks.len() as u32 - 1)
    }

    pub fn set_handler(&mut self, block: Label, handler: Label) {
        self.def.basic_blocks[block.index()].handler = Some(handler);
    }

    pub fn set_finalizer(&mut self, block: Label, finalizer: Label) {
        self.def.basic_blocks[block.index()].finalizer = Some(finalizer);
    }

    pub fn emit(&mut self, block: Label, instruction: Instruction) {
        self.def.basic_blocks[block.index()].instructions.push(instruction);
    }

    pub fn string(&mut self, value: &str) -> StringIndex {
        let table = &mut self.def.string_table;
        let index = table.iter().position(|s| s == value).unwrap_or_else(|| {
            table.push(value.to_string());
            table.len() - 1
        });
        StringIndex(index as u32)
    }

    pub fn identifier(&mut self, name: &str) -> IdentifierIndex {
        let table = &mut self.def.identifier_table;
        let index = table.iter().position(|s| s == name).unwrap_or_else(|| {
            table.push(name.to_string());
            table.len() - 1
        });
        IdentifierIndex(index as u32)
    }

    pub fn property_cache(&mut self) -> u32 {
        self.next_property_cache += 1;
        self.next_property_cache - 1
    }

    pub fn global_cache(&mut self) -> u32 {
        self.next_global_cache += 1;
        self.next_global_cache - 1
    }

    pub fn environment_cache(&mut self) -> u32 {
        self.next_environment_cache += 1;
        self.next_environment_cache - 1
    }

    pub fn add_function(&mut self, function: Rc<Executable>) -> u32 {
        self.def.functions.push(function.to_def());
        self.functions.push(function);
        self.functions.len() as u32 - 1
    }

    pub fn build(self) -> Result<Rc<Executable>, BytecodeError> {
        let ExecutableBuilder { mut def, functions, .. } = self;
        def.functions.clear();
        let mut executable = Executable::from_def(def)?;
        // Nested executables are shared, not re-parsed copies.
        if let Some(executable) = Rc::get_mut(&mut executable) {
            executable.functions = functions;
        }
        Ok(executable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_block(instructions: Vec<Instruction>) -> ExecutableDef {
        ExecutableDef {
            name: "test".to_string(),
            kind: FunctionKind::Normal,
            register_count: Register::RESERVED_COUNT + 1,
            local_names: vec!["a".to_string()],
            parameter_count: 0,
            basic_blocks: vec![BasicBlock {
                name: "entry".to_string(),
                instructions,
                handler: None,
                finalizer: None,
            }],
            string_table: Vec::new(),
            identifier_table: vec!["x".to_string()],
            functions: Vec::new(),
        }
    }

    #[test]
    fn test_valid_executable_sizes_caches() {
        let exe = Executable::from_def(single_block(vec![
            Instruction::GetById { property: IdentifierIndex(0), cache: 2 },
            Instruction::GetVariable { identifier: IdentifierIndex(0), cache: 0 },
            Instruction::Return,
        ]))
        .unwrap();
        assert_eq!(exe.caches().property_count(), 3);
        assert_eq!(exe.caches().environment_count(), 1);
        assert_eq!(exe.caches().global_count(), 0);
    }

    #[test]
    fn test_missing_terminator() {
        let err = Executable::from_def(single_block(vec![Instruction::NewObject])).unwrap_err();
        assert_eq!(err, BytecodeError::MissingTerminator { block: 0 });
    }

    #[test]
    fn test_terminator_must_be_last() {
        let err = Executable::from_def(single_block(vec![Instruction::Return, Instruction::Return]))
            .unwrap_err();
        assert_eq!(err, BytecodeError::TerminatorNotLast { block: 0, offset: 0 });
    }

    #[test]
    fn test_register_bounds() {
        let err = Executable::from_def(single_block(vec![
            Instruction::Load { src: Register(7) },
            Instruction::Return,
        ]))
        .unwrap_err();
        assert!(matches!(err, BytecodeError::RegisterOutOfBounds { register: 7, .. }));

        let err = Executable::from_def(single_block(vec![
            Instruction::Call {
                callee: Register(6),
                this_value: Register(6),
                first_argument: Register(6),
                argument_count: 2,
                builtin: None,
                expression_string: None,
            },
            Instruction::Return,
        ]))
        .unwrap_err();
        assert!(matches!(err, BytecodeError::RegisterOutOfBounds { register: 7, .. }));
    }

    #[test]
    fn test_local_bounds() {
        let err = Executable::from_def(single_block(vec![
            Instruction::GetLocal { index: 1 },
            Instruction::Return,
        ]))
        .unwrap_err();
        assert_eq!(err, BytecodeError::LocalOutOfBounds { block: 0, index: 1, count: 1 });
    }

    #[test]
    fn test_bad_label() {
        let err = Executable::from_def(single_block(vec![Instruction::Jump { target: Label(4) }]))
            .unwrap_err();
        assert_eq!(err, BytecodeError::BadLabel { block: 0, target: 4 });
    }

    #[test]
    fn test_json_round_trip_shape() {
        let json = r#"{
            "name": "main",
            "register_count": 7,
            "basic_blocks": [{
                "instructions": [
                    {"op": "LoadImmediate", "value": {"type": "Int32", "value": 1}},
                    {"op": "Store", "dst": 6},
                    {"op": "Add", "lhs": 6},
                    {"op": "Return"}
                ]
            }]
        }"#;
        let exe = Executable::from_json(json).unwrap();
        assert_eq!(exe.basic_blocks[0].instructions.len(), 4);
        assert_eq!(
            exe.basic_blocks[0].instructions[2].as_binary(),
            Some((BinaryOp::Add, Register(6)))
        );
    }

    #[test]
    fn test_builder_dedupes_tables() {
        let mut b = ExecutableBuilder::new("f");
        let a = b.identifier("a");
        assert_eq!(b.identifier("a"), a);
        assert_ne!(b.identifier("b"), a);
        let entry = b.make_block("entry");
        b.emit(entry, Instruction::Return);
        let exe = b.build().unwrap();
        assert_eq!(exe.identifier_table.len(), 2);
    }
}
