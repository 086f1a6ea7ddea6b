use std::io::{Read, Write};

use itertools::Itertools;

use crate::{
    bytecode::{Executable, Opcode, Value},
    loader::{self, Image},
    source::Location,
};

mod kernel;
mod memory;
mod value;

pub use kernel::*;
pub use memory::*;
pub use value::*;

pub const DEFAULT_STACK_LIMIT: i64 = 1 << 16;

#[derive(Debug, thiserror::Error)]
pub enum InnerEvalError {
    #[error("operands must both be {expected}, got {left:?} and {right:?}")]
    OperandMismatch {
        expected: ValueType,
        left: Value,
        right: Value,
    },

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("invalid opcode {value}")]
    InvalidOpcode { value: Value },

    #[error("division by zero")]
    DivisionByZero,

    #[error("unknown system call {index}")]
    UnknownSystemCall { index: i64 },

    #[error("stack pointer {sp} crossed base pointer {bp}")]
    StackCorrupted { sp: i64, bp: i64 },

    #[error("stack overflow: sp {sp} beyond limit of {limit} cells")]
    StackOverflow { sp: i64, limit: i64 },

    #[error("pop from empty frame stack")]
    EmptyFrameStack,

    #[error("jump table selector must be an integer, got {value}")]
    InvalidJumpTableSelector { value: Value },

    #[error("step budget of {steps} exhausted")]
    StepBudgetExhausted { steps: u64 },

    #[error(transparent)]
    AddressOverflow(#[from] AddressOverflow),

    #[error("i/o failure in system call: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
#[error("At address {address}, {inner}")]
pub struct EvalError {
    pub address: i64,
    pub inner: InnerEvalError,
}

impl EvalError {
    pub fn into_user(self, image: &Image) -> UserEvalError {
        UserEvalError {
            address: self.address,
            location: image.location(self.address).cloned(),
            inner: self.inner,
        }
    }
}

#[derive(Debug)]
pub struct UserEvalError {
    pub address: i64,
    pub location: Option<Location>,
    pub inner: InnerEvalError,
}

impl std::fmt::Display for UserEvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.location {
            Some(location) => write!(f, "at {} (address {}): {}", location, self.address, self.inner),
            None => write!(f, "at address {}: {}", self.address, self.inner),
        }
    }
}

impl std::error::Error for UserEvalError {}

/// Registers, flags and the frame stack.
#[derive(Debug, Clone, PartialEq)]
pub struct Cpu {
    pub ip: i64,
    pub sp: i64,
    pub bp: i64,
    pub zero: bool,
    pub carry: bool,
    pub msb: bool,
    pub frames: Vec<(i64, i64)>,
    pub halted: bool,
}

impl Default for Cpu {
    fn default() -> Self {
        Cpu {
            ip: 0,
            sp: -1,
            bp: -1,
            zero: false,
            carry: false,
            msb: false,
            frames: vec![],
            halted: false,
        }
    }
}

impl Cpu {
    pub fn push(&mut self, memory: &mut Memory, value: Value) {
        memory.write(self.sp, value);
        self.sp -= 1;
    }

    pub fn pop(&mut self, memory: &Memory) -> Value {
        self.sp += 1;
        memory.read(self.sp)
    }

    pub fn pop_int(&mut self, memory: &Memory) -> Result<i64, InnerEvalError> {
        Ok(self.pop(memory).try_into()?)
    }

    /// Carry and sign are both taken from the sign of the result.
    fn set_flags(&mut self, result: Value) {
        let (zero, negative) = match result {
            Value::Int(i) => (i == 0, i < 0),
            Value::Float(f) => (f == 0.0, f < 0.0),
        };
        self.zero = zero;
        self.carry = negative;
        self.msb = negative;
    }
}

/// One instruction as it sits in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub opcode: Opcode,
    pub operands: Vec<Value>,
}

impl Decoded {
    pub fn width(&self) -> i64 {
        1 + self.operands.len() as i64
    }

    fn operand(&self, idx: usize) -> Result<i64, InnerEvalError> {
        Ok(self.operands[idx].try_into()?)
    }
}

impl std::fmt::Display for Decoded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.operands.is_empty() {
            write!(f, "{}", self.opcode)
        } else {
            write!(f, "{} {}", self.opcode, self.operands.iter().join(" "))
        }
    }
}

pub fn decode(memory: &Memory, ip: i64) -> Result<Decoded, InnerEvalError> {
    let head = memory.read(ip);
    let opcode = match head {
        Value::Int(id) => Opcode::from_id(id),
        Value::Float(_) => None,
    }
    .ok_or(InnerEvalError::InvalidOpcode { value: head })?;

    let count = if opcode == Opcode::JumpTable {
        let cases = memory.read_int(address_at(ip, 1)?)?.max(0);
        cases
            .checked_mul(2)
            .and_then(|c| c.checked_add(2))
            .ok_or(AddressOverflow { base: ip, offset: cases })?
    } else {
        opcode.width() as i64 - 1
    };
    address_at(ip, count)?;
    let operands = (1..=count).map(|i| memory.read(ip + i)).collect();
    Ok(Decoded { opcode, operands })
}

pub enum StepResult {
    Exit,
    Continue,
}

pub struct VmState {
    pub cpu: Cpu,
    pub memory: Memory,
    pub exit_status: Option<i64>,
}

pub struct Vm {
    pub cpu: Cpu,
    pub memory: Memory,
    pub kernel: Kernel,
    pub image: Image,
    system_calls: Vec<Handler>,
    stack_limit: i64,
}

impl Vm {
    /// Loads `exe` into a fresh address space.
    pub fn new(exe: &Executable) -> Result<Self, loader::Error> {
        let mut memory = Memory::default();
        let image = loader::load(exe, &mut memory)?;
        Ok(Self::with_image(image, memory))
    }

    pub fn with_image(image: Image, memory: Memory) -> Self {
        Vm {
            cpu: Cpu::default(),
            memory,
            kernel: Kernel::new(),
            image,
            system_calls: system_calls(),
            stack_limit: DEFAULT_STACK_LIMIT,
        }
    }

    pub fn with_stack_limit(mut self, cells: i64) -> Self {
        self.stack_limit = cells;
        self
    }

    pub fn with_stdin(mut self, stdin: impl Read + 'static) -> Self {
        self.kernel.set_stream(STDIN, Stream::Input(Box::new(stdin)));
        self
    }

    pub fn with_stdout(mut self, stdout: impl Write + 'static) -> Self {
        self.kernel.set_stream(STDOUT, Stream::Output(Box::new(stdout)));
        self
    }

    pub fn with_stderr(mut self, stderr: impl Write + 'static) -> Self {
        self.kernel.set_stream(STDERR, Stream::Output(Box::new(stderr)));
        self
    }

    /// Installs `handler` at `index`, growing the table with failing
    /// entries if needed.
    pub fn with_system_call(mut self, index: usize, handler: Handler) -> Self {
        if self.system_calls.len() <= index {
            self.system_calls.resize(index + 1, unregistered);
        }
        self.system_calls[index] = handler;
        self
    }

    pub fn save_state(&self) -> VmState {
        VmState {
            cpu: self.cpu.clone(),
            memory: self.memory.clone(),
            exit_status: self.kernel.exit_status,
        }
    }

    pub fn restore_state(&mut self, state: VmState) {
        self.cpu = state.cpu;
        self.memory = state.memory;
        self.kernel.exit_status = state.exit_status;
    }

    pub fn top_of_stack(&self) -> Value {
        self.memory.read(self.cpu.sp)
    }

    /// The status passed to `exit`, or else whatever `Halt` left on top.
    pub fn exit_value(&self) -> Value {
        match self.kernel.exit_status {
            Some(status) => Value::Int(status),
            None => self.top_of_stack(),
        }
    }

    /// Reads the cell `offset` past the start of a global.
    pub fn read_symbol(&self, name: &str, offset: i64) -> Option<Value> {
        self.image
            .symbol(name)
            .map(|at| self.memory.read(at + offset))
    }

    pub fn current(&self) -> Result<Decoded, EvalError> {
        decode(&self.memory, self.cpu.ip).map_err(|inner| EvalError {
            address: self.cpu.ip,
            inner,
        })
    }

    pub fn current_location(&self) -> Option<&Location> {
        self.image.location(self.cpu.ip)
    }

    pub fn step(&mut self) -> Result<StepResult, EvalError> {
        if self.cpu.halted {
            return Ok(StepResult::Exit);
        }
        let address = self.cpu.ip;
        if let Err(inner) = self.execute().and_then(|()| self.check_stack()) {
            self.kernel.release();
            return Err(EvalError { address, inner });
        }
        if self.cpu.halted {
            self.kernel.release();
            return Ok(StepResult::Exit);
        }
        Ok(StepResult::Continue)
    }

    pub fn run(&mut self) -> Result<(), EvalError> {
        loop {
            if let StepResult::Exit = self.step()? {
                return Ok(());
            }
        }
    }

    pub fn run_with_limit(&mut self, max_steps: u64) -> Result<(), EvalError> {
        for _ in 0..max_steps {
            if let StepResult::Exit = self.step()? {
                return Ok(());
            }
        }
        if self.cpu.halted {
            return Ok(());
        }
        self.kernel.release();
        Err(EvalError {
            address: self.cpu.ip,
            inner: InnerEvalError::StepBudgetExhausted { steps: max_steps },
        })
    }

    fn check_stack(&self) -> Result<(), InnerEvalError> {
        let Cpu { sp, bp, .. } = self.cpu;
        if sp > bp || bp > -1 {
            return Err(InnerEvalError::StackCorrupted { sp, bp });
        }
        if sp < -self.stack_limit {
            return Err(InnerEvalError::StackOverflow {
                sp,
                limit: self.stack_limit,
            });
        }
        Ok(())
    }

    fn execute(&mut self) -> Result<(), InnerEvalError> {
        let Vm {
            cpu,
            memory,
            kernel,
            system_calls,
            ..
        } = self;
        let decoded = decode(memory, cpu.ip)?;
        let here = cpu.ip;
        let mut next = address_at(here, decoded.width())?;

        match decoded.opcode {
            Opcode::Halt => {
                cpu.halted = true;
                next = here;
            }
            Opcode::Pass => {}
            Opcode::SystemCall => {
                let index = cpu.pop_int(memory)?;
                let handler = usize::try_from(index)
                    .ok()
                    .and_then(|i| system_calls.get(i))
                    .copied()
                    .ok_or(InnerEvalError::UnknownSystemCall { index })?;
                handler(cpu, memory, kernel)?;
                if cpu.halted {
                    next = here;
                }
            }

            Opcode::Push => cpu.push(memory, decoded.operands[0]),
            Opcode::Pop => {
                cpu.pop(memory);
            }
            Opcode::Dup => {
                let base = cpu.sp;
                for i in (1..=decoded.operand(0)?).rev() {
                    let value = memory.read(base + i);
                    cpu.push(memory, value);
                }
            }
            Opcode::Swap => {
                let a = cpu.pop(memory);
                let b = cpu.pop(memory);
                cpu.push(memory, a);
                cpu.push(memory, b);
            }
            Opcode::Allocate => {
                let cells = decoded.operand(0)?;
                cpu.sp = cpu.sp.checked_sub(cells).ok_or(AddressOverflow {
                    base: cpu.sp,
                    offset: cells.saturating_neg(),
                })?;
            }

            op @ (Opcode::Add
            | Opcode::Subtract
            | Opcode::Multiply
            | Opcode::Divide
            | Opcode::Mod
            | Opcode::ShiftLeft
            | Opcode::ShiftRight
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor) => {
                let right = cpu.pop(memory);
                let left = cpu.pop(memory);
                let (l, r) = match (left, right) {
                    (Value::Int(l), Value::Int(r)) => (l, r),
                    _ => {
                        return Err(InnerEvalError::OperandMismatch {
                            expected: ValueType::Int,
                            left,
                            right,
                        })
                    }
                };
                let result = Value::Int(integer_op(op, l, r)?);
                if op.sets_flags() {
                    cpu.set_flags(result);
                }
                cpu.push(memory, result);
            }
            Opcode::Not => {
                let v = cpu.pop_int(memory)?;
                cpu.push(memory, Value::Int(!v));
            }

            op @ (Opcode::AddFloat
            | Opcode::SubtractFloat
            | Opcode::MultiplyFloat
            | Opcode::DivideFloat) => {
                let right = cpu.pop(memory);
                let left = cpu.pop(memory);
                let (l, r) = match (left, right) {
                    (Value::Float(l), Value::Float(r)) => (l, r),
                    _ => {
                        return Err(InnerEvalError::OperandMismatch {
                            expected: ValueType::Float,
                            left,
                            right,
                        })
                    }
                };
                let result = Value::Float(match op {
                    Opcode::AddFloat => l + r,
                    Opcode::SubtractFloat => l - r,
                    Opcode::MultiplyFloat => l * r,
                    _ => l / r,
                });
                cpu.set_flags(result);
                cpu.push(memory, result);
            }

            Opcode::ConvertToInteger => {
                let v = match cpu.pop(memory) {
                    Value::Float(f) => Value::Int(f as i64),
                    v => v,
                };
                cpu.push(memory, v);
            }
            Opcode::ConvertToFloat => {
                let v = match cpu.pop(memory) {
                    Value::Int(i) => Value::Float(i as f64),
                    v => v,
                };
                cpu.push(memory, v);
            }

            Opcode::LoadZeroFlag => cpu.push(memory, cpu.zero.into()),
            Opcode::LoadCarryBorrowFlag => cpu.push(memory, cpu.carry.into()),
            Opcode::LoadMostSignificantBitFlag => cpu.push(memory, cpu.msb.into()),

            Opcode::LoadBaseStackPointer => cpu.push(memory, Value::Int(cpu.bp)),
            Opcode::SetBaseStackPointer => cpu.bp = cpu.pop_int(memory)?,
            Opcode::LoadStackPointer => {
                let sp = cpu.sp;
                cpu.push(memory, Value::Int(sp));
            }
            Opcode::PushFrame => cpu.frames.push((cpu.bp, cpu.sp)),
            Opcode::PopFrame => {
                let (bp, sp) = cpu.frames.pop().ok_or(InnerEvalError::EmptyFrameStack)?;
                cpu.bp = bp;
                cpu.sp = sp;
            }

            Opcode::Load => {
                let address = cpu.pop_int(memory)?;
                for i in 0..decoded.operand(0)? {
                    let value = memory.read(address_at(address, i)?);
                    cpu.push(memory, value);
                }
            }
            Opcode::Set => {
                let address = cpu.pop_int(memory)?;
                let values = pop_n(cpu, memory, decoded.operand(0)?);
                store(cpu, memory, address, &values)?;
            }
            Opcode::CompoundSet => {
                let values = pop_n(cpu, memory, decoded.operand(0)?);
                let address = cpu.pop_int(memory)?;
                store(cpu, memory, address, &values)?;
            }

            Opcode::AbsoluteJump => next = cpu.pop_int(memory)?,
            Opcode::RelativeJump => next = address_at(here, decoded.operand(0)?)?,
            Opcode::JumpTrue => {
                if cpu.pop(memory).is_truthy() {
                    next = address_at(here, decoded.operand(0)?)?;
                }
            }
            Opcode::JumpFalse => {
                if !cpu.pop(memory).is_truthy() {
                    next = address_at(here, decoded.operand(0)?)?;
                }
            }
            Opcode::JumpTable => {
                let selector = match cpu.pop(memory) {
                    Value::Int(i) => i,
                    value => return Err(InnerEvalError::InvalidJumpTableSelector { value }),
                };
                next = decoded.operand(1)?;
                for (value, target) in decoded.operands[2..].iter().tuples() {
                    if *value == Value::Int(selector) {
                        next = (*target).try_into()?;
                        break;
                    }
                }
            }
        }
        cpu.ip = next;
        Ok(())
    }
}

/// Fills gaps in the table. The popped index is still in the cell at `sp`.
fn unregistered(cpu: &mut Cpu, memory: &mut Memory, _: &mut Kernel) -> Result<(), InnerEvalError> {
    let index = memory.read_int(cpu.sp)?;
    Err(InnerEvalError::UnknownSystemCall { index })
}

fn integer_op(op: Opcode, l: i64, r: i64) -> Result<i64, InnerEvalError> {
    Ok(match op {
        Opcode::Add => l.wrapping_add(r),
        Opcode::Subtract => l.wrapping_sub(r),
        Opcode::Multiply => l.wrapping_mul(r),
        Opcode::Divide if r == 0 => return Err(InnerEvalError::DivisionByZero),
        Opcode::Divide => l.wrapping_div(r),
        Opcode::Mod if r == 0 => return Err(InnerEvalError::DivisionByZero),
        Opcode::Mod => l.wrapping_rem(r),
        Opcode::ShiftLeft => l.wrapping_shl(r as u32),
        Opcode::ShiftRight => l.wrapping_shr(r as u32),
        Opcode::And => l & r,
        Opcode::Or => l | r,
        _ => l ^ r,
    })
}

/// Pops `n` values and returns them in push order.
fn pop_n(cpu: &mut Cpu, memory: &Memory, n: i64) -> Vec<Value> {
    let mut values: Vec<Value> = (0..n).map(|_| cpu.pop(memory)).collect();
    values.reverse();
    values
}

fn store(
    cpu: &mut Cpu,
    memory: &mut Memory,
    address: i64,
    values: &[Value],
) -> Result<(), InnerEvalError> {
    memory.write_all(address, values)?;
    for v in values {
        cpu.push(memory, *v);
    }
    Ok(())
}
