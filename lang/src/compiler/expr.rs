use crate::{
    ast::{BinaryOp, Constant, ExprKind, Expression, UnaryOp},
    bytecode::{Address, Datum, Instruction, Operand, Value},
    ctype::CType,
    scope::{Binding, Scope},
    source::Location,
};

use super::{convert_constant, Compiler, Error, Sequence};

/// Instructions converting a value of type `from` into type `to`.
pub fn cast(from: &CType, to: &CType) -> Vec<Instruction> {
    let (from, to) = (from.decay(), to.decay());
    if from == to || to.is_void() {
        return vec![];
    }
    match (from.is_floating(), to.is_floating()) {
        (true, true) => vec![],
        (false, true) => vec![Instruction::ConvertToFloat],
        (true, false) => {
            let mut out = vec![Instruction::ConvertToInteger];
            out.extend(narrow(&CType::long(), &to));
            out
        }
        (false, false) => narrow(&from, &to),
    }
}

fn narrow(from: &CType, to: &CType) -> Vec<Instruction> {
    if !to.is_integral() {
        return vec![];
    }
    let (from_bits, to_bits) = (from.bits(), to.bits());
    if to_bits >= 64 {
        return vec![];
    }
    let widening = from.is_integral()
        && from_bits <= to_bits
        && (from.is_unsigned() == to.is_unsigned() || (from_bits < to_bits && from.is_unsigned()));
    if widening {
        return vec![];
    }
    if to.is_unsigned() {
        vec![
            Instruction::push_int((1i64 << to_bits) - 1),
            Instruction::And,
        ]
    } else {
        let shift = 64 - to_bits as i64;
        vec![
            Instruction::push_int(shift),
            Instruction::ShiftLeft,
            Instruction::push_int(shift),
            Instruction::ShiftRight,
        ]
    }
}

/// Cells an expression of this type leaves on the stack.
pub(crate) fn value_size(ty: &CType) -> usize {
    match ty {
        CType::Void => 0,
        CType::Array(..) | CType::Function(_) => 1,
        other => other.size(),
    }
}

fn zero_of(ty: &CType) -> Value {
    if ty.is_floating() {
        Value::Float(0.0)
    } else {
        Value::Int(0)
    }
}

fn arithmetic_instruction(op: BinaryOp, floating: bool) -> Option<Instruction> {
    let instruction = match (op, floating) {
        (BinaryOp::Add, false) => Instruction::Add,
        (BinaryOp::Subtract, false) => Instruction::Subtract,
        (BinaryOp::Multiply, false) => Instruction::Multiply,
        (BinaryOp::Divide, false) => Instruction::Divide,
        (BinaryOp::Mod, false) => Instruction::Mod,
        (BinaryOp::ShiftLeft, false) => Instruction::ShiftLeft,
        (BinaryOp::ShiftRight, false) => Instruction::ShiftRight,
        (BinaryOp::BitAnd, false) => Instruction::And,
        (BinaryOp::BitOr, false) => Instruction::Or,
        (BinaryOp::BitXor, false) => Instruction::Xor,
        (BinaryOp::Add, true) => Instruction::AddFloat,
        (BinaryOp::Subtract, true) => Instruction::SubtractFloat,
        (BinaryOp::Multiply, true) => Instruction::MultiplyFloat,
        (BinaryOp::Divide, true) => Instruction::DivideFloat,
        _ => return None,
    };
    Some(instruction)
}

/// Reads the flags left by a discarded subtraction.
fn comparison_flags(op: BinaryOp, unsigned: bool) -> Vec<Instruction> {
    let less = if unsigned {
        Instruction::LoadCarryBorrowFlag
    } else {
        Instruction::LoadMostSignificantBitFlag
    };
    match op {
        BinaryOp::Equal => vec![Instruction::LoadZeroFlag],
        BinaryOp::NotEqual => vec![
            Instruction::LoadZeroFlag,
            Instruction::push_int(1),
            Instruction::Xor,
        ],
        BinaryOp::LessThan => vec![less],
        BinaryOp::GreaterThan => vec![
            Instruction::LoadZeroFlag,
            Instruction::push_int(1),
            Instruction::Xor,
            less,
            Instruction::push_int(1),
            Instruction::Xor,
            Instruction::And,
        ],
        BinaryOp::LessEqual => vec![Instruction::LoadZeroFlag, less, Instruction::Or],
        BinaryOp::GreaterEqual => vec![less, Instruction::push_int(1), Instruction::Xor],
        _ => vec![],
    }
}

impl Compiler {
    pub fn expression(&mut self, expr: &Expression, scope: &Scope) -> Result<Sequence, Error> {
        let loc = &expr.location;
        let mut seq = vec![];
        match &expr.kind {
            ExprKind::Constant(c) => {
                let value = match *c {
                    Constant::Integer(i) => convert_constant(Value::Int(i), &expr.ty),
                    Constant::Float(f) => convert_constant(Value::Float(f), &expr.ty),
                };
                self.emit_into(&mut seq, [Instruction::Push(Operand::Immediate(value))], loc);
            }
            ExprKind::StringLiteral(s) => {
                let name = self.string_literal(s, loc);
                self.emit_into(
                    &mut seq,
                    [Instruction::push_address(Address::Reference(name))],
                    loc,
                );
            }
            ExprKind::Identifier(_) | ExprKind::Subscript { .. } => {
                seq = self.address(expr, scope)?;
                self.load(&mut seq, &expr.ty, loc);
            }
            ExprKind::Unary { op, operand } => {
                seq = self.unary(*op, operand, &expr.ty, scope, loc)?;
            }
            ExprKind::Binary { op, left, right } => {
                seq = if op.is_logical() {
                    self.logical(*op, left, right, scope, loc)?
                } else if op.is_comparison() {
                    self.comparison(*op, left, right, scope, loc)?
                } else {
                    self.arithmetic(*op, left, right, &expr.ty, scope, loc)?
                };
            }
            ExprKind::Assign { target, value } => {
                seq = self.expression(value, scope)?;
                self.emit_into(&mut seq, cast(&value.ty, &target.ty), loc);
                let lhs = self.expression(target, scope)?;
                let Some(Instruction::Load(n)) = lhs.last().and_then(|w| self.instruction(*w)).cloned()
                else {
                    return Err(Error::InvalidLvalue {
                        location: target.location.clone(),
                    });
                };
                if let Some(last) = lhs.last() {
                    self.replace(*last, Instruction::Set(n));
                }
                seq.extend(lhs);
            }
            ExprKind::CompoundAssign { op, target, value } => {
                seq = self.compound_assign(*op, target, value, scope, loc)?;
            }
            ExprKind::Cast(operand) => {
                seq = self.expression(operand, scope)?;
                if expr.ty.is_void() {
                    self.discard(&mut seq, &operand.ty, loc);
                } else {
                    self.emit_into(&mut seq, cast(&operand.ty, &expr.ty), loc);
                }
            }
            ExprKind::Conditional {
                condition,
                then,
                otherwise,
            } => {
                let otherwise_marker = self.marker(loc);
                let end = self.marker(loc);
                seq = self.expression(condition, scope)?;
                self.emit_into(
                    &mut seq,
                    [Instruction::JumpFalse(Address::Word(otherwise_marker))],
                    loc,
                );
                seq.extend(self.expression(then, scope)?);
                self.emit_into(&mut seq, cast(&then.ty, &expr.ty), loc);
                self.emit_into(&mut seq, [Instruction::RelativeJump(Address::Word(end))], loc);
                seq.push(otherwise_marker);
                seq.extend(self.expression(otherwise, scope)?);
                self.emit_into(&mut seq, cast(&otherwise.ty, &expr.ty), loc);
                seq.push(end);
            }
            ExprKind::Comma { left, right } => {
                seq = self.expression(left, scope)?;
                self.discard(&mut seq, &left.ty, loc);
                seq.extend(self.expression(right, scope)?);
            }
            ExprKind::Call { function, args } => {
                seq = self.call(function, args, scope, loc)?;
            }
            ExprKind::SystemCall { index, args } => {
                for arg in args {
                    seq.extend(self.expression(arg, scope)?);
                }
                self.emit_into(
                    &mut seq,
                    [Instruction::push_int(*index), Instruction::SystemCall],
                    loc,
                );
            }
        }
        Ok(seq)
    }

    /// Address stream of an lvalue, without the final load.
    fn address(&mut self, expr: &Expression, scope: &Scope) -> Result<Sequence, Error> {
        let loc = &expr.location;
        let mut seq = vec![];
        match &expr.kind {
            ExprKind::Identifier(name) => match scope.lookup(name) {
                Some(Binding::Local { offset, .. }) => {
                    let offset = *offset;
                    self.emit_into(
                        &mut seq,
                        [
                            Instruction::LoadBaseStackPointer,
                            Instruction::push_int(offset),
                            Instruction::Add,
                        ],
                        loc,
                    );
                }
                Some(Binding::Global { symbol, .. }) => {
                    let symbol = symbol.clone();
                    self.emit_into(
                        &mut seq,
                        [Instruction::push_address(Address::Reference(symbol))],
                        loc,
                    );
                }
                None => {
                    return Err(Error::UndeclaredIdentifier {
                        location: loc.clone(),
                        name: name.clone(),
                    })
                }
            },
            ExprKind::Unary {
                op: UnaryOp::Deref,
                operand,
            } => {
                seq = self.expression(operand, scope)?;
            }
            ExprKind::Subscript { array, index } => {
                let (pointer, offset) = if array.ty.decay().is_pointer() {
                    (array, index)
                } else {
                    (index, array)
                };
                seq = self.expression(pointer, scope)?;
                seq.extend(self.expression(offset, scope)?);
                self.emit_into(&mut seq, cast(&offset.ty, &CType::long()), loc);
                self.scale(&mut seq, &expr.ty, loc);
                self.emit_into(&mut seq, [Instruction::Add], loc);
            }
            _ => {
                return Err(Error::InvalidLvalue {
                    location: loc.clone(),
                })
            }
        }
        Ok(seq)
    }

    fn load(&mut self, seq: &mut Sequence, ty: &CType, location: &Location) {
        if ty.is_array() || ty.is_function() {
            return;
        }
        self.emit_into(seq, [Instruction::Load(ty.size() as i64)], location);
    }

    pub(crate) fn discard(&mut self, seq: &mut Sequence, ty: &CType, location: &Location) {
        let size = value_size(ty) as i64;
        if size > 0 {
            self.emit_into(seq, [Instruction::Allocate(-size)], location);
        }
    }

    /// Multiplies the integer on top of the stack by the size of `pointee`.
    fn scale(&mut self, seq: &mut Sequence, pointee: &CType, location: &Location) {
        let size = pointee.size().max(1) as i64;
        if size != 1 {
            self.emit_into(
                seq,
                [Instruction::push_int(size), Instruction::Multiply],
                location,
            );
        }
    }

    /// Operand coerced to 0 or 1.
    fn truth(&mut self, expr: &Expression, scope: &Scope) -> Result<Sequence, Error> {
        let mut seq = self.expression(expr, scope)?;
        if !expr.is_truth_valued() {
            let ty = expr.ty.decay();
            let subtract = if ty.is_floating() {
                Instruction::SubtractFloat
            } else {
                Instruction::Subtract
            };
            self.emit_into(
                &mut seq,
                [
                    Instruction::Push(Operand::Immediate(zero_of(&ty))),
                    subtract,
                    Instruction::Pop,
                ],
                &expr.location,
            );
            self.emit_into(
                &mut seq,
                comparison_flags(BinaryOp::NotEqual, false),
                &expr.location,
            );
        }
        Ok(seq)
    }

    fn logical(
        &mut self,
        op: BinaryOp,
        left: &Expression,
        right: &Expression,
        scope: &Scope,
        loc: &Location,
    ) -> Result<Sequence, Error> {
        let end = self.marker(loc);
        let mut seq = self.truth(left, scope)?;
        let jump = match op {
            BinaryOp::LogicalAnd => Instruction::JumpFalse(Address::Word(end)),
            _ => Instruction::JumpTrue(Address::Word(end)),
        };
        self.emit_into(&mut seq, [Instruction::Dup(1), jump, Instruction::Pop], loc);
        seq.extend(self.truth(right, scope)?);
        seq.push(end);
        Ok(seq)
    }

    fn comparison(
        &mut self,
        op: BinaryOp,
        left: &Expression,
        right: &Expression,
        scope: &Scope,
        loc: &Location,
    ) -> Result<Sequence, Error> {
        let common = CType::common(&left.ty, &right.ty);
        let mut seq = self.expression(left, scope)?;
        self.emit_into(&mut seq, cast(&left.ty, &common), loc);
        seq.extend(self.expression(right, scope)?);
        self.emit_into(&mut seq, cast(&right.ty, &common), loc);
        let subtract = if common.is_floating() {
            Instruction::SubtractFloat
        } else {
            Instruction::Subtract
        };
        self.emit_into(&mut seq, [subtract, Instruction::Pop], loc);
        self.emit_into(&mut seq, comparison_flags(op, common.is_unsigned()), loc);
        Ok(seq)
    }

    fn arithmetic(
        &mut self,
        op: BinaryOp,
        left: &Expression,
        right: &Expression,
        ty: &CType,
        scope: &Scope,
        loc: &Location,
    ) -> Result<Sequence, Error> {
        let (l, r) = (left.ty.decay(), right.ty.decay());
        let mut seq = self.expression(left, scope)?;

        if l.is_pointer() && r.is_pointer() && op == BinaryOp::Subtract {
            seq.extend(self.expression(right, scope)?);
            self.emit_into(&mut seq, [Instruction::Subtract], loc);
            let size = l.pointee().map(CType::size).unwrap_or(1).max(1) as i64;
            if size != 1 {
                self.emit_into(&mut seq, [Instruction::push_int(size), Instruction::Divide], loc);
            }
            return Ok(seq);
        }

        if ty.is_pointer() && matches!(op, BinaryOp::Add | BinaryOp::Subtract) {
            let pointee = ty.pointee().cloned().unwrap_or(CType::char());
            if !l.is_pointer() {
                self.emit_into(&mut seq, cast(&l, &CType::long()), loc);
                self.scale(&mut seq, &pointee, loc);
            }
            seq.extend(self.expression(right, scope)?);
            if !r.is_pointer() {
                self.emit_into(&mut seq, cast(&r, &CType::long()), loc);
                self.scale(&mut seq, &pointee, loc);
            }
            let instruction = if op == BinaryOp::Add {
                Instruction::Add
            } else {
                Instruction::Subtract
            };
            self.emit_into(&mut seq, [instruction], loc);
            return Ok(seq);
        }

        let Some(instruction) = arithmetic_instruction(op, ty.is_floating()) else {
            return Err(Error::UnsupportedNode {
                location: loc.clone(),
                what: format!("operator {:?} on {:?}", op, ty),
            });
        };
        self.emit_into(&mut seq, cast(&l, ty), loc);
        seq.extend(self.expression(right, scope)?);
        self.emit_into(&mut seq, cast(&r, ty), loc);
        self.emit_into(&mut seq, [instruction], loc);
        self.wrap_unsigned(&mut seq, ty, loc);
        Ok(seq)
    }

    /// Unsigned arithmetic is modular in the declared width. Signed results
    /// are left as computed.
    fn wrap_unsigned(&mut self, seq: &mut Sequence, ty: &CType, location: &Location) {
        if ty.is_integral() && ty.is_unsigned() {
            self.emit_into(seq, cast(&CType::long(), ty), location);
        }
    }

    fn compound_assign(
        &mut self,
        op: BinaryOp,
        target: &Expression,
        value: &Expression,
        scope: &Scope,
        loc: &Location,
    ) -> Result<Sequence, Error> {
        let mut seq = self.expression(target, scope)?;
        let Some(Instruction::Load(n)) = seq.last().and_then(|w| self.instruction(*w)).cloned() else {
            return Err(Error::InvalidLvalue {
                location: target.location.clone(),
            });
        };
        let dup = self.emit(Instruction::Dup(1), loc);
        seq.insert(seq.len() - 1, dup);

        let ty = &target.ty;
        if ty.is_pointer() && matches!(op, BinaryOp::Add | BinaryOp::Subtract) {
            let pointee = ty.pointee().cloned().unwrap_or(CType::char());
            seq.extend(self.expression(value, scope)?);
            self.emit_into(&mut seq, cast(&value.ty, &CType::long()), loc);
            self.scale(&mut seq, &pointee, loc);
            let instruction = if op == BinaryOp::Add {
                Instruction::Add
            } else {
                Instruction::Subtract
            };
            self.emit_into(&mut seq, [instruction], loc);
        } else {
            let common = if matches!(op, BinaryOp::ShiftLeft | BinaryOp::ShiftRight) {
                CType::common(ty, ty)
            } else {
                CType::common(ty, &value.ty)
            };
            let Some(instruction) = arithmetic_instruction(op, common.is_floating()) else {
                return Err(Error::UnsupportedNode {
                    location: loc.clone(),
                    what: format!("compound operator {:?} on {:?}", op, common),
                });
            };
            self.emit_into(&mut seq, cast(ty, &common), loc);
            seq.extend(self.expression(value, scope)?);
            self.emit_into(&mut seq, cast(&value.ty, &common), loc);
            self.emit_into(&mut seq, [instruction], loc);
            self.wrap_unsigned(&mut seq, &common, loc);
            self.emit_into(&mut seq, cast(&common, ty), loc);
        }
        self.emit_into(&mut seq, [Instruction::CompoundSet(n)], loc);
        Ok(seq)
    }

    fn unary(
        &mut self,
        op: UnaryOp,
        operand: &Expression,
        ty: &CType,
        scope: &Scope,
        loc: &Location,
    ) -> Result<Sequence, Error> {
        let mut seq = vec![];
        match op {
            UnaryOp::Negate => {
                let subtract = if ty.is_floating() {
                    Instruction::SubtractFloat
                } else {
                    Instruction::Subtract
                };
                self.emit_into(&mut seq, [Instruction::Push(Operand::Immediate(zero_of(ty)))], loc);
                seq.extend(self.expression(operand, scope)?);
                self.emit_into(&mut seq, cast(&operand.ty, ty), loc);
                self.emit_into(&mut seq, [subtract], loc);
                self.wrap_unsigned(&mut seq, ty, loc);
            }
            UnaryOp::Plus => {
                seq = self.expression(operand, scope)?;
                self.emit_into(&mut seq, cast(&operand.ty, ty), loc);
            }
            UnaryOp::BitNot => {
                if !ty.is_integral() {
                    return Err(Error::UnsupportedNode {
                        location: loc.clone(),
                        what: format!("bitwise not on {:?}", ty),
                    });
                }
                seq = self.expression(operand, scope)?;
                self.emit_into(&mut seq, cast(&operand.ty, ty), loc);
                self.emit_into(&mut seq, [Instruction::Not], loc);
                self.emit_into(&mut seq, cast(&CType::long(), ty), loc);
            }
            UnaryOp::LogicalNot => {
                let operand_ty = operand.ty.decay();
                let subtract = if operand_ty.is_floating() {
                    Instruction::SubtractFloat
                } else {
                    Instruction::Subtract
                };
                seq = self.expression(operand, scope)?;
                self.emit_into(
                    &mut seq,
                    [
                        Instruction::Push(Operand::Immediate(zero_of(&operand_ty))),
                        subtract,
                        Instruction::Pop,
                        Instruction::LoadZeroFlag,
                    ],
                    loc,
                );
            }
            UnaryOp::Deref => {
                seq = self.expression(operand, scope)?;
                self.load(&mut seq, ty, loc);
            }
            UnaryOp::AddressOf => {
                seq = self.address(operand, scope)?;
            }
            UnaryOp::PreIncrement | UnaryOp::PreDecrement => {
                let step = if op == UnaryOp::PreIncrement {
                    BinaryOp::Add
                } else {
                    BinaryOp::Subtract
                };
                seq = self.compound_assign(step, operand, &Expression::int(1), scope, loc)?;
            }
            UnaryOp::PostIncrement | UnaryOp::PostDecrement => {
                let (step, undo) = if op == UnaryOp::PostIncrement {
                    (BinaryOp::Add, BinaryOp::Subtract)
                } else {
                    (BinaryOp::Subtract, BinaryOp::Add)
                };
                seq = self.compound_assign(step, operand, &Expression::int(1), scope, loc)?;
                let target = operand.ty.decay();
                let (amount, floating) = if target.is_floating() {
                    (Value::Float(1.0), true)
                } else if let Some(pointee) = target.pointee() {
                    (Value::Int(pointee.size().max(1) as i64), false)
                } else {
                    (Value::Int(1), false)
                };
                let undo = arithmetic_instruction(undo, floating).unwrap_or(Instruction::Pass);
                self.emit_into(
                    &mut seq,
                    [Instruction::Push(Operand::Immediate(amount)), undo],
                    loc,
                );
                if target.is_integral() {
                    self.emit_into(&mut seq, cast(&CType::long(), &target), loc);
                }
            }
        }
        Ok(seq)
    }

    fn call(
        &mut self,
        function: &Expression,
        args: &[Expression],
        scope: &Scope,
        loc: &Location,
    ) -> Result<Sequence, Error> {
        let Some(ft) = function.ty.function_type().cloned() else {
            return Err(Error::UnsupportedNode {
                location: loc.clone(),
                what: format!("call through {:?}", function.ty),
            });
        };
        if args.len() != ft.params.len() {
            return Err(Error::ArgumentCount {
                location: loc.clone(),
                expected: ft.params.len(),
                found: args.len(),
            });
        }
        let ret_size = value_size(&ft.ret) as i64;
        let direct = match &function.kind {
            ExprKind::Identifier(name) => match scope.lookup(name) {
                Some(Binding::Global { symbol, ty }) if ty.is_function() => Some(symbol.clone()),
                _ => None,
            },
            _ => None,
        };

        let mut seq = vec![];
        if ret_size > 0 {
            self.emit_into(&mut seq, [Instruction::Allocate(ret_size)], loc);
        }
        self.emit_into(&mut seq, [Instruction::PushFrame], loc);
        for (arg, param) in args.iter().zip(&ft.params) {
            seq.extend(self.expression(arg, scope)?);
            self.emit_into(&mut seq, cast(&arg.ty, param), loc);
        }
        let marker = self.marker(loc);
        self.emit_into(
            &mut seq,
            [
                Instruction::LoadStackPointer,
                Instruction::push_int(1 + args.len() as i64),
                Instruction::Add,
                Instruction::push_address(Address::Word(marker)),
            ],
            loc,
        );
        match direct {
            Some(symbol) => self.emit_into(
                &mut seq,
                [
                    Instruction::LoadStackPointer,
                    Instruction::SetBaseStackPointer,
                    Instruction::RelativeJump(Address::Reference(symbol)),
                ],
                loc,
            ),
            None => {
                seq.extend(self.expression(function, scope)?);
                self.emit_into(
                    &mut seq,
                    [
                        Instruction::LoadStackPointer,
                        Instruction::push_int(1),
                        Instruction::Add,
                        Instruction::SetBaseStackPointer,
                        Instruction::AbsoluteJump,
                    ],
                    loc,
                );
            }
        }
        seq.push(marker);
        self.emit_into(&mut seq, [Instruction::PopFrame], loc);
        Ok(seq)
    }

    /// Evaluates a constant initializer at compile time.
    pub(crate) fn fold(&mut self, expr: &Expression, scope: &Scope) -> Option<Datum> {
        let datum = match &expr.kind {
            ExprKind::Constant(Constant::Integer(i)) => Datum::Value(Value::Int(*i)),
            ExprKind::Constant(Constant::Float(f)) => Datum::Value(Value::Float(*f)),
            ExprKind::StringLiteral(s) => {
                let name = self.string_literal(s, &expr.location);
                Datum::Address(Address::Reference(name))
            }
            ExprKind::Identifier(name) if expr.ty.is_array() || expr.ty.is_function() => {
                match scope.lookup(name)? {
                    Binding::Global { symbol, .. } => Datum::Address(Address::Reference(symbol.clone())),
                    Binding::Local { .. } => return None,
                }
            }
            ExprKind::Unary {
                op: UnaryOp::AddressOf,
                operand,
            } => match &operand.kind {
                ExprKind::Identifier(name) => match scope.lookup(name)? {
                    Binding::Global { symbol, .. } => {
                        Datum::Address(Address::Reference(symbol.clone()))
                    }
                    Binding::Local { .. } => return None,
                },
                _ => return None,
            },
            ExprKind::Unary {
                op: UnaryOp::Negate,
                operand,
            } => match self.fold(operand, scope)? {
                Datum::Value(Value::Int(i)) => Datum::Value(Value::Int(i.wrapping_neg())),
                Datum::Value(Value::Float(f)) => Datum::Value(Value::Float(-f)),
                Datum::Address(_) => return None,
            },
            ExprKind::Unary {
                op: UnaryOp::Plus,
                operand,
            } => self.fold(operand, scope)?,
            ExprKind::Cast(operand) => match self.fold(operand, scope)? {
                Datum::Value(v) => Datum::Value(convert_constant(v, &expr.ty)),
                address => address,
            },
            ExprKind::Binary { op, left, right } => {
                let (Datum::Value(Value::Int(l)), Datum::Value(Value::Int(r))) =
                    (self.fold(left, scope)?, self.fold(right, scope)?)
                else {
                    return None;
                };
                let value = match op {
                    BinaryOp::Add => l.wrapping_add(r),
                    BinaryOp::Subtract => l.wrapping_sub(r),
                    BinaryOp::Multiply => l.wrapping_mul(r),
                    BinaryOp::Divide if r != 0 => l.wrapping_div(r),
                    BinaryOp::Mod if r != 0 => l.wrapping_rem(r),
                    BinaryOp::ShiftLeft => l.wrapping_shl(r as u32),
                    BinaryOp::ShiftRight => l.wrapping_shr(r as u32),
                    BinaryOp::BitAnd => l & r,
                    BinaryOp::BitOr => l | r,
                    BinaryOp::BitXor => l ^ r,
                    _ => return None,
                };
                Datum::Value(convert_constant(Value::Int(value), &expr.ty))
            }
            _ => return None,
        };
        Some(datum)
    }
}
