use crate::{
    ast::{Declaration, Expression, ExprKind, Initializer, StmtKind, Statement},
    bytecode::{Address, Instruction, StorageClass},
    ctype::CType,
    scope::{Binding, Scope},
    source::Location,
};

use super::{
    cast, expr::value_size, resolved_type, Compiler, ControlContext, Error, PendingGoto,
    Sequence, SwitchFrame, Target,
};

impl Compiler {
    pub fn statement(
        &mut self,
        stmt: &Statement,
        scope: &mut Scope,
        ctx: &mut ControlContext,
    ) -> Result<Sequence, Error> {
        let loc = &stmt.location;
        let mut seq = vec![];
        match &stmt.kind {
            StmtKind::Empty => {}
            StmtKind::Expression(e) => {
                seq = self.expression(e, scope)?;
                self.discard(&mut seq, &e.ty, loc);
            }
            StmtKind::Declarations(decls) => {
                for decl in decls {
                    seq.extend(self.local(decl, scope, ctx)?);
                }
            }
            StmtKind::Compound(statements) => {
                seq = self.block(statements, scope, ctx, loc)?;
            }
            StmtKind::If {
                condition,
                then,
                otherwise,
            } => {
                let end = self.marker(loc);
                seq = self.expression(condition, scope)?;
                match otherwise {
                    Some(otherwise) => {
                        let otherwise_marker = self.marker(loc);
                        self.emit_into(
                            &mut seq,
                            [Instruction::JumpFalse(Address::Word(otherwise_marker))],
                            loc,
                        );
                        seq.extend(self.statement(then, scope, ctx)?);
                        self.emit_into(&mut seq, [Instruction::RelativeJump(Address::Word(end))], loc);
                        seq.push(otherwise_marker);
                        seq.extend(self.statement(otherwise, scope, ctx)?);
                    }
                    None => {
                        self.emit_into(&mut seq, [Instruction::JumpFalse(Address::Word(end))], loc);
                        seq.extend(self.statement(then, scope, ctx)?);
                    }
                }
                seq.push(end);
            }
            StmtKind::While { condition, body } => {
                let start = self.marker(loc);
                let end = self.marker(loc);
                seq.push(start);
                seq.extend(self.expression(condition, scope)?);
                self.emit_into(&mut seq, [Instruction::JumpFalse(Address::Word(end))], loc);
                seq.extend(self.loop_body(body, scope, ctx, end, start)?);
                self.emit_into(&mut seq, [Instruction::RelativeJump(Address::Word(start))], loc);
                seq.push(end);
            }
            StmtKind::DoWhile { body, condition } => {
                let start = self.marker(loc);
                let check = self.marker(loc);
                let end = self.marker(loc);
                seq.push(start);
                seq.extend(self.loop_body(body, scope, ctx, end, check)?);
                seq.push(check);
                seq.extend(self.expression(condition, scope)?);
                self.emit_into(&mut seq, [Instruction::JumpTrue(Address::Word(start))], loc);
                seq.push(end);
            }
            StmtKind::For {
                init,
                condition,
                step,
                body,
            } => {
                scope.push_scope();
                let saved = ctx.stack.offset();
                if let Some(init) = init {
                    seq.extend(self.statement(init, scope, ctx)?);
                }
                let start = self.marker(loc);
                let next = self.marker(loc);
                let end = self.marker(loc);
                seq.push(start);
                if let Some(condition) = condition {
                    seq.extend(self.expression(condition, scope)?);
                    self.emit_into(&mut seq, [Instruction::JumpFalse(Address::Word(end))], loc);
                }
                seq.extend(self.loop_body(body, scope, ctx, end, next)?);
                seq.push(next);
                if let Some(step) = step {
                    seq.extend(self.expression(step, scope)?);
                    self.discard(&mut seq, &step.ty, loc);
                }
                self.emit_into(&mut seq, [Instruction::RelativeJump(Address::Word(start))], loc);
                seq.push(end);
                scope.pop_scope();
                self.unwind(&mut seq, ctx, saved, loc);
            }
            StmtKind::Switch { selector, body } => {
                seq = self.switch(selector, body, scope, ctx, loc)?;
            }
            StmtKind::Case { value, body } => {
                let marker = self.marker(loc);
                let target = ctx.target(marker);
                let Some(frame) = ctx.switches.last_mut() else {
                    return Err(Error::CaseOutsideSwitch {
                        location: loc.clone(),
                    });
                };
                if !frame.add_case(*value, target) {
                    return Err(Error::DuplicateCase {
                        location: loc.clone(),
                        value: *value,
                    });
                }
                seq.push(marker);
                seq.extend(self.statement(body, scope, ctx)?);
            }
            StmtKind::Default(body) => {
                let marker = self.marker(loc);
                let target = ctx.target(marker);
                let Some(frame) = ctx.switches.last_mut() else {
                    return Err(Error::CaseOutsideSwitch {
                        location: loc.clone(),
                    });
                };
                if frame.default.replace(target).is_some() {
                    return Err(Error::DuplicateDefault {
                        location: loc.clone(),
                    });
                }
                seq.push(marker);
                seq.extend(self.statement(body, scope, ctx)?);
            }
            StmtKind::Break => {
                let Some(target) = ctx.breaks.last().copied() else {
                    return Err(Error::BreakOutsideLoop {
                        location: loc.clone(),
                    });
                };
                seq = self.jump_to(target, ctx, loc);
            }
            StmtKind::Continue => {
                let Some(target) = ctx.continues.last().copied() else {
                    return Err(Error::ContinueOutsideLoop {
                        location: loc.clone(),
                    });
                };
                seq = self.jump_to(target, ctx, loc);
            }
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    seq = self.expression(value, scope)?;
                    if ctx.return_type.is_void() {
                        self.discard(&mut seq, &value.ty, loc);
                    } else {
                        let ret = ctx.return_type.clone();
                        self.emit_into(&mut seq, cast(&value.ty, &ret), loc);
                        seq.extend(self.store_return_value(ret.size(), loc));
                    }
                }
                seq.extend(self.return_sequence(loc));
            }
            StmtKind::Goto(name) => {
                if let Some(label) = ctx.labels.get(name).copied() {
                    seq = self.jump_to(label, ctx, loc);
                } else {
                    let allocate = self.emit(Instruction::Allocate(0), loc);
                    let jump = self.emit(Instruction::RelativeJump(Address::Unset), loc);
                    seq.extend([allocate, jump]);
                    ctx.gotos.entry(name.clone()).or_default().push(PendingGoto {
                        allocate,
                        jump,
                        offset: ctx.stack.offset(),
                        location: loc.clone(),
                    });
                }
            }
            StmtKind::Label { name, body } => {
                if ctx.labels.contains_key(name) {
                    return Err(Error::DuplicateLabel {
                        location: loc.clone(),
                        name: name.clone(),
                    });
                }
                let marker = self.marker(loc);
                let target = ctx.target(marker);
                ctx.labels.insert(name.clone(), target);
                seq.push(marker);
                seq.extend(self.statement(body, scope, ctx)?);
            }
        }
        Ok(seq)
    }

    fn block(
        &mut self,
        statements: &[Statement],
        scope: &mut Scope,
        ctx: &mut ControlContext,
        loc: &Location,
    ) -> Result<Sequence, Error> {
        scope.push_scope();
        let saved = ctx.stack.offset();
        let mut seq = vec![];
        for statement in statements {
            match self.statement(statement, scope, ctx) {
                Ok(s) => seq.extend(s),
                Err(e) => {
                    scope.pop_scope();
                    return Err(e);
                }
            }
        }
        scope.pop_scope();
        self.unwind(&mut seq, ctx, saved, loc);
        Ok(seq)
    }

    /// Deallocates everything above `saved` and resets the model to it.
    fn unwind(&mut self, seq: &mut Sequence, ctx: &mut ControlContext, saved: i64, loc: &Location) {
        let adjustment = ctx.stack.adjustment_to(saved);
        if adjustment != 0 {
            self.emit_into(seq, [Instruction::Allocate(adjustment)], loc);
        }
        ctx.stack.restore(saved);
    }

    fn jump_to(&mut self, target: Target, ctx: &ControlContext, loc: &Location) -> Sequence {
        let mut seq = vec![];
        let adjustment = ctx.stack.adjustment_to(target.offset);
        if adjustment != 0 {
            self.emit_into(&mut seq, [Instruction::Allocate(adjustment)], loc);
        }
        self.emit_into(
            &mut seq,
            [Instruction::RelativeJump(Address::Word(target.marker))],
            loc,
        );
        seq
    }

    fn loop_body(
        &mut self,
        body: &Statement,
        scope: &mut Scope,
        ctx: &mut ControlContext,
        end: crate::bytecode::WordIndex,
        next: crate::bytecode::WordIndex,
    ) -> Result<Sequence, Error> {
        ctx.breaks.push(ctx.target(end));
        ctx.continues.push(ctx.target(next));
        let body = self.statement(body, scope, ctx);
        ctx.breaks.pop();
        ctx.continues.pop();
        body
    }

    fn switch(
        &mut self,
        selector: &Expression,
        body: &Statement,
        scope: &mut Scope,
        ctx: &mut ControlContext,
        loc: &Location,
    ) -> Result<Sequence, Error> {
        let mut seq = self.expression(selector, scope)?;
        self.emit_into(&mut seq, cast(&selector.ty, &CType::long()), loc);
        let table = self.emit(
            Instruction::JumpTable {
                default: Address::Unset,
                cases: vec![],
            },
            loc,
        );
        seq.push(table);
        let end = self.marker(loc);
        let base = ctx.stack.offset();

        ctx.switches.push(SwitchFrame::default());
        ctx.breaks.push(ctx.target(end));
        let generated = self.statement(body, scope, ctx);
        ctx.breaks.pop();
        let frame = ctx.switches.pop().unwrap_or_default();
        seq.extend(generated?);
        self.emit_into(&mut seq, [Instruction::RelativeJump(Address::Word(end))], loc);

        let cases = frame
            .cases
            .iter()
            .map(|(value, target)| (*value, self.case_entry(&mut seq, *target, base, loc)))
            .collect();
        let default = match frame.default {
            Some(target) => self.case_entry(&mut seq, target, base, loc),
            None => Address::Word(end),
        };
        self.replace(table, Instruction::JumpTable { default, cases });
        seq.push(end);
        Ok(seq)
    }

    /// Jump-table destination for a case label. Labels reached at another
    /// stack offset get a stub that adjusts the stack first.
    fn case_entry(&mut self, seq: &mut Sequence, target: Target, base: i64, loc: &Location) -> Address {
        if target.offset == base {
            return Address::Word(target.marker);
        }
        let stub = self.emit(Instruction::Allocate(base - target.offset), loc);
        let jump = self.emit(Instruction::RelativeJump(Address::Word(target.marker)), loc);
        seq.extend([stub, jump]);
        Address::Word(stub)
    }

    fn local(
        &mut self,
        decl: &Declaration,
        scope: &mut Scope,
        ctx: &mut ControlContext,
    ) -> Result<Sequence, Error> {
        let loc = &decl.location;
        let ty = resolved_type(&decl.ty, decl.initializer.as_ref());
        if ty.is_function() || decl.storage_class == StorageClass::Extern {
            scope.define(
                &decl.name,
                Binding::Global {
                    symbol: decl.name.clone(),
                    ty,
                },
            );
            return Ok(vec![]);
        }
        if decl.storage_class == StorageClass::Static {
            let symbol = self.static_local(decl, &ty, scope, ctx)?;
            scope.define(&decl.name, Binding::Global { symbol, ty });
            return Ok(vec![]);
        }

        let mut seq = vec![];
        let size = ty.size();
        match &decl.initializer {
            Some(Initializer::Expression(e)) if !ty.is_array() => {
                seq = self.expression(e, scope)?;
                self.emit_into(&mut seq, cast(&e.ty, &ty), loc);
                let offset = ctx.stack.allocate(1);
                scope.define(&decl.name, Binding::Local { offset, ty });
            }
            None => {
                self.emit_into(&mut seq, [Instruction::Allocate(size as i64)], loc);
                let offset = ctx.stack.allocate(size);
                scope.define(&decl.name, Binding::Local { offset, ty });
            }
            Some(init) => {
                self.emit_into(&mut seq, [Instruction::Allocate(size as i64)], loc);
                let offset = ctx.stack.allocate(size);
                let element = scalar_element(&ty);
                let mut values = vec![];
                flatten(&ty, init, &mut values);
                values.resize(size, Expression::constant(0, element.clone()));
                values.truncate(size);
                for (i, value) in values.iter().enumerate() {
                    seq.extend(self.expression(value, scope)?);
                    self.emit_into(&mut seq, cast(&value.ty, &element), loc);
                    self.emit_into(
                        &mut seq,
                        [
                            Instruction::LoadBaseStackPointer,
                            Instruction::push_int(offset + i as i64),
                            Instruction::Add,
                            Instruction::Set(1),
                            Instruction::Allocate(-(value_size(&element) as i64)),
                        ],
                        loc,
                    );
                }
                scope.define(&decl.name, Binding::Local { offset, ty });
            }
        }
        Ok(seq)
    }
}

fn scalar_element(ty: &CType) -> CType {
    match ty {
        CType::Array(elem, _) => scalar_element(elem),
        other => other.clone(),
    }
}

/// Flattens a (possibly nested) initializer into one expression per cell.
fn flatten(ty: &CType, init: &Initializer, out: &mut Vec<Expression>) {
    match (ty, init) {
        (CType::Array(elem, len), Initializer::List(items)) => {
            let start = out.len();
            for item in items.iter().take(*len) {
                flatten(elem, item, out);
            }
            out.resize(start + ty.size(), Expression::constant(0, scalar_element(elem)));
        }
        (CType::Array(elem, len), Initializer::Expression(e)) => {
            let start = out.len();
            if let ExprKind::StringLiteral(s) = &e.kind {
                out.extend(
                    s.chars()
                        .take(*len)
                        .map(|c| Expression::constant(c as i64, elem.as_ref().clone())),
                );
            } else {
                out.push(e.clone());
            }
            out.resize(start + ty.size(), Expression::constant(0, scalar_element(elem)));
        }
        (_, Initializer::Expression(e)) => out.push(e.clone()),
        (_, Initializer::List(items)) => match items.first() {
            Some(first) => flatten(ty, first, out),
            None => out.push(Expression::constant(0, ty.clone())),
        },
    }
}
