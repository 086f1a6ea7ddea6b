use derive_more::derive::{From, Into};
use serde::{Deserialize, Serialize};

use crate::source::Location;

mod object;

pub use object::*;

macro_rules! opcodes {
    {
        $(($ident:ident, $name:literal, $width:literal),)*
    } => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum Opcode {
            $($ident,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[
                $(Opcode::$ident,)*
            ];

            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$ident => $name,)*
                }
            }

            /// Fixed number of cells the instruction occupies. For the jump
            /// table this is only the header; each case adds two more cells.
            pub fn width(self) -> usize {
                match self {
                    $(Opcode::$ident => $width,)*
                }
            }
        }
    };
}

opcodes! {
    (Halt, "halt", 1),
    (Pass, "pass", 1),
    (SystemCall, "syscall", 1),

    (Push, "push", 2),
    (Pop, "pop", 1),
    (Dup, "dup", 2),
    (Swap, "swap", 1),
    (Allocate, "alloc", 2),

    (Add, "add", 1),
    (Subtract, "sub", 1),
    (Multiply, "mul", 1),
    (Divide, "div", 1),
    (Mod, "mod", 1),
    (ShiftLeft, "shl", 1),
    (ShiftRight, "shr", 1),
    (And, "and", 1),
    (Or, "or", 1),
    (Xor, "xor", 1),
    (Not, "not", 1),

    (AddFloat, "addf", 1),
    (SubtractFloat, "subf", 1),
    (MultiplyFloat, "mulf", 1),
    (DivideFloat, "divf", 1),

    (ConvertToInteger, "cvti", 1),
    (ConvertToFloat, "cvtf", 1),

    (LoadZeroFlag, "ldzf", 1),
    (LoadCarryBorrowFlag, "ldcf", 1),
    (LoadMostSignificantBitFlag, "ldmsbf", 1),

    (LoadBaseStackPointer, "ldbp", 1),
    (SetBaseStackPointer, "stbp", 1),
    (LoadStackPointer, "ldsp", 1),
    (PushFrame, "pushf", 1),
    (PopFrame, "popf", 1),

    (Load, "load", 2),
    (Set, "set", 2),
    (CompoundSet, "cset", 2),

    (AbsoluteJump, "ajmp", 1),
    (RelativeJump, "rjmp", 2),
    (JumpTrue, "jmpt", 2),
    (JumpFalse, "jmpf", 2),
    (JumpTable, "jtab", 3),
}

impl Opcode {
    pub fn id(self) -> i64 {
        self as i64
    }

    pub fn from_id(id: i64) -> Option<Self> {
        usize::try_from(id)
            .ok()
            .and_then(|idx| Self::ALL.get(idx))
            .copied()
    }

    /// Jump kinds set the instruction pointer themselves.
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Opcode::AbsoluteJump
                | Opcode::RelativeJump
                | Opcode::JumpTrue
                | Opcode::JumpFalse
                | Opcode::JumpTable
        )
    }

    /// Address operands of these kinds are encoded relative to the
    /// instruction's own address.
    pub fn is_relative(self) -> bool {
        matches!(
            self,
            Opcode::RelativeJump | Opcode::JumpTrue | Opcode::JumpFalse
        )
    }

    /// The four arithmetic families, the only instructions that touch flags.
    pub fn sets_flags(self) -> bool {
        matches!(
            self,
            Opcode::Add
                | Opcode::Subtract
                | Opcode::Multiply
                | Opcode::Divide
                | Opcode::AddFloat
                | Opcode::SubtractFloat
                | Opcode::MultiplyFloat
                | Opcode::DivideFloat
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(From, Into, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WordIndex(usize);

#[derive(From, Into, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SymbolIndex(usize);

/// Contents of one machine cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
}

impl Default for Value {
    fn default() -> Self {
        Value::Int(0)
    }
}

impl Value {
    pub fn is_truthy(self) -> bool {
        match self {
            Value::Int(i) => i != 0,
            Value::Float(f) => f != 0.0,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:?}", x),
        }
    }
}

/// A forward-reference cell. Everything but `Word` and `Symbol` must be
/// gone by the time the loader sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Address {
    Word(WordIndex),
    Symbol(SymbolIndex),
    Reference(String),
    Unset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Immediate(Value),
    Address(Address),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    Halt,
    Pass,
    SystemCall,

    Push(Operand),
    Pop,
    Dup(i64),
    Swap,
    Allocate(i64),

    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    ShiftLeft,
    ShiftRight,
    And,
    Or,
    Xor,
    Not,

    AddFloat,
    SubtractFloat,
    MultiplyFloat,
    DivideFloat,

    ConvertToInteger,
    ConvertToFloat,

    LoadZeroFlag,
    LoadCarryBorrowFlag,
    LoadMostSignificantBitFlag,

    LoadBaseStackPointer,
    SetBaseStackPointer,
    LoadStackPointer,
    PushFrame,
    PopFrame,

    Load(i64),
    Set(i64),
    CompoundSet(i64),

    AbsoluteJump,
    RelativeJump(Address),
    JumpTrue(Address),
    JumpFalse(Address),
    JumpTable {
        default: Address,
        cases: Vec<(i64, Address)>,
    },
}

impl Instruction {
    pub fn push_int(value: i64) -> Self {
        Instruction::Push(Operand::Immediate(Value::Int(value)))
    }

    pub fn push_address(address: Address) -> Self {
        Instruction::Push(Operand::Address(address))
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::Halt => Opcode::Halt,
            Instruction::Pass => Opcode::Pass,
            Instruction::SystemCall => Opcode::SystemCall,
            Instruction::Push(_) => Opcode::Push,
            Instruction::Pop => Opcode::Pop,
            Instruction::Dup(_) => Opcode::Dup,
            Instruction::Swap => Opcode::Swap,
            Instruction::Allocate(_) => Opcode::Allocate,
            Instruction::Add => Opcode::Add,
            Instruction::Subtract => Opcode::Subtract,
            Instruction::Multiply => Opcode::Multiply,
            Instruction::Divide => Opcode::Divide,
            Instruction::Mod => Opcode::Mod,
            Instruction::ShiftLeft => Opcode::ShiftLeft,
            Instruction::ShiftRight => Opcode::ShiftRight,
            Instruction::And => Opcode::And,
            Instruction::Or => Opcode::Or,
            Instruction::Xor => Opcode::Xor,
            Instruction::Not => Opcode::Not,
            Instruction::AddFloat => Opcode::AddFloat,
            Instruction::SubtractFloat => Opcode::SubtractFloat,
            Instruction::MultiplyFloat => Opcode::MultiplyFloat,
            Instruction::DivideFloat => Opcode::DivideFloat,
            Instruction::ConvertToInteger => Opcode::ConvertToInteger,
            Instruction::ConvertToFloat => Opcode::ConvertToFloat,
            Instruction::LoadZeroFlag => Opcode::LoadZeroFlag,
            Instruction::LoadCarryBorrowFlag => Opcode::LoadCarryBorrowFlag,
            Instruction::LoadMostSignificantBitFlag => Opcode::LoadMostSignificantBitFlag,
            Instruction::LoadBaseStackPointer => Opcode::LoadBaseStackPointer,
            Instruction::SetBaseStackPointer => Opcode::SetBaseStackPointer,
            Instruction::LoadStackPointer => Opcode::LoadStackPointer,
            Instruction::PushFrame => Opcode::PushFrame,
            Instruction::PopFrame => Opcode::PopFrame,
            Instruction::Load(_) => Opcode::Load,
            Instruction::Set(_) => Opcode::Set,
            Instruction::CompoundSet(_) => Opcode::CompoundSet,
            Instruction::AbsoluteJump => Opcode::AbsoluteJump,
            Instruction::RelativeJump(_) => Opcode::RelativeJump,
            Instruction::JumpTrue(_) => Opcode::JumpTrue,
            Instruction::JumpFalse(_) => Opcode::JumpFalse,
            Instruction::JumpTable { .. } => Opcode::JumpTable,
        }
    }

    /// Cells occupied in the memory image.
    pub fn footprint(&self) -> usize {
        match self {
            Instruction::JumpTable { cases, .. } => Opcode::JumpTable.width() + 2 * cases.len(),
            other => other.opcode().width(),
        }
    }

    /// Every address operand, in encoding order.
    pub fn addresses(&self) -> Vec<&Address> {
        match self {
            Instruction::Push(Operand::Address(a))
            | Instruction::RelativeJump(a)
            | Instruction::JumpTrue(a)
            | Instruction::JumpFalse(a) => vec![a],
            Instruction::JumpTable { default, cases } => std::iter::once(default)
                .chain(cases.iter().map(|(_, a)| a))
                .collect(),
            _ => vec![],
        }
    }

    pub fn addresses_mut(&mut self) -> Vec<&mut Address> {
        match self {
            Instruction::Push(Operand::Address(a))
            | Instruction::RelativeJump(a)
            | Instruction::JumpTrue(a)
            | Instruction::JumpFalse(a) => vec![a],
            Instruction::JumpTable { default, cases } => std::iter::once(default)
                .chain(cases.iter_mut().map(|(_, a)| a))
                .collect(),
            _ => vec![],
        }
    }

    /// Encodes the instruction as it sits at address `at`. `resolve` maps an
    /// address operand to its absolute target.
    pub fn encode<E>(
        &self,
        at: i64,
        mut resolve: impl FnMut(&Address) -> Result<i64, E>,
    ) -> Result<Vec<Value>, E> {
        let opcode = self.opcode();
        let mut cells = vec![Value::Int(opcode.id())];
        let mut address = |a: &Address| -> Result<Value, E> {
            let target = resolve(a)?;
            Ok(Value::Int(if opcode.is_relative() {
                target - at
            } else {
                target
            }))
        };
        match self {
            Instruction::Push(Operand::Immediate(v)) => cells.push(*v),
            Instruction::Push(Operand::Address(a))
            | Instruction::RelativeJump(a)
            | Instruction::JumpTrue(a)
            | Instruction::JumpFalse(a) => cells.push(address(a)?),
            Instruction::Dup(n)
            | Instruction::Allocate(n)
            | Instruction::Load(n)
            | Instruction::Set(n)
            | Instruction::CompoundSet(n) => cells.push(Value::Int(*n)),
            Instruction::JumpTable { default, cases } => {
                cells.push(Value::Int(cases.len() as i64));
                cells.push(address(default)?);
                for (value, target) in cases {
                    cells.push(Value::Int(*value));
                    cells.push(address(target)?);
                }
            }
            _ => {}
        }
        debug_assert_eq!(cells.len(), self.footprint());
        Ok(cells)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Word(w) => write!(f, "@{}", usize::from(*w)),
            Address::Symbol(s) => write!(f, "sym#{}", usize::from(*s)),
            Address::Reference(name) => write!(f, "&{}", name),
            Address::Unset => write!(f, "<unset>"),
        }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.opcode())?;
        match self {
            Instruction::Push(Operand::Immediate(v)) => write!(f, " {}", v),
            Instruction::Push(Operand::Address(a))
            | Instruction::RelativeJump(a)
            | Instruction::JumpTrue(a)
            | Instruction::JumpFalse(a) => write!(f, " {}", a),
            Instruction::Dup(n)
            | Instruction::Allocate(n)
            | Instruction::Load(n)
            | Instruction::Set(n)
            | Instruction::CompoundSet(n) => write!(f, " {}", n),
            Instruction::JumpTable { default, cases } => {
                write!(f, " default={}", default)?;
                for (value, target) in cases {
                    write!(f, " {}=>{}", value, target)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// A data cell: a constant, or an address fixed up at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Value(Value),
    Address(Address),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InnerWord {
    Instruction(Instruction),
    Datum(Datum),
}

/// One element of the instruction/data arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub inner: InnerWord,
    pub location: Location,
}

impl Word {
    pub fn instruction(instruction: Instruction, location: Location) -> Self {
        Self {
            inner: InnerWord::Instruction(instruction),
            location,
        }
    }

    pub fn datum(datum: Datum, location: Location) -> Self {
        Self {
            inner: InnerWord::Datum(datum),
            location,
        }
    }

    pub fn as_instruction(&self) -> Option<&Instruction> {
        match &self.inner {
            InnerWord::Instruction(i) => Some(i),
            InnerWord::Datum(_) => None,
        }
    }

    pub fn footprint(&self) -> usize {
        match &self.inner {
            InnerWord::Instruction(i) => i.footprint(),
            InnerWord::Datum(_) => 1,
        }
    }

    pub fn addresses_mut(&mut self) -> Vec<&mut Address> {
        match &mut self.inner {
            InnerWord::Instruction(i) => i.addresses_mut(),
            InnerWord::Datum(Datum::Address(a)) => vec![a],
            InnerWord::Datum(Datum::Value(_)) => vec![],
        }
    }

    pub fn addresses(&self) -> Vec<&Address> {
        match &self.inner {
            InnerWord::Instruction(i) => i.addresses(),
            InnerWord::Datum(Datum::Address(a)) => vec![a],
            InnerWord::Datum(Datum::Value(_)) => vec![],
        }
    }
}

impl std::fmt::Display for Word {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            InnerWord::Instruction(i) => write!(f, "{}", i),
            InnerWord::Datum(Datum::Value(v)) => write!(f, ".cell {}", v),
            InnerWord::Datum(Datum::Address(a)) => write!(f, ".cell {}", a),
        }
    }
}
