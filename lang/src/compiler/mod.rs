//! Lowers the typed tree into stack-machine words.
//!
//! Code is generated into a single arena per translation unit. A generator
//! returns a [`Sequence`] of handles into that arena; the order of the
//! handles, not the order of the arena, is the order of execution. Markers
//! (`Pass` words) can therefore be created before the code that precedes
//! them exists.

use typed_index_collections::TiVec;

use crate::{
    ast::{ExternalDeclaration, FunctionDefinition, Initializer, TranslationUnit},
    bytecode::{
        Address, Datum, Instruction, Object, StorageClass, Symbol, SymbolIndex, SymbolKind, Value,
        Word, WordIndex,
    },
    ctype::CType,
    scope::{Binding, Scope},
    source::Location,
};

mod expr;
mod stack;
mod stmt;

pub use expr::cast;
pub use stack::*;

pub type Sequence = Vec<WordIndex>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("At {location}, unsupported {what}")]
    UnsupportedNode { location: Location, what: String },
    #[error("At {location}, break outside of a loop or switch")]
    BreakOutsideLoop { location: Location },
    #[error("At {location}, continue outside of a loop")]
    ContinueOutsideLoop { location: Location },
    #[error("At {location}, case label outside of a switch")]
    CaseOutsideSwitch { location: Location },
    #[error("At {location}, duplicate case value {value}")]
    DuplicateCase { location: Location, value: i64 },
    #[error("At {location}, multiple default labels in one switch")]
    DuplicateDefault { location: Location },
    #[error("At {location}, malformed left-hand side")]
    InvalidLvalue { location: Location },
    #[error("At {location}, label {name} not found")]
    UnresolvedLabel { location: Location, name: String },
    #[error("At {location}, label {name:?} already defined")]
    DuplicateLabel { location: Location, name: String },
    #[error("At {location}, {name} not declared")]
    UndeclaredIdentifier { location: Location, name: String },
    #[error("At {location}, call passes {found} arguments to a function taking {expected}")]
    ArgumentCount {
        location: Location,
        expected: usize,
        found: usize,
    },
    #[error("At {location}, initializer of {name} is not constant")]
    NonConstantInitializer { location: Location, name: String },
}

/// Compiles one translation unit into an object.
pub fn unit(tu: &TranslationUnit) -> Result<Object, Error> {
    let mut compiler = Compiler::new(&tu.name);
    let mut scope = Scope::new();
    for item in &tu.items {
        match item {
            ExternalDeclaration::Declaration(decl) => compiler.global(decl, &mut scope)?,
            ExternalDeclaration::Function(f) => compiler.function(f, &mut scope)?,
        }
    }
    Ok(compiler.finish())
}

pub struct Compiler {
    unit: String,
    words: TiVec<WordIndex, Word>,
    symbols: TiVec<SymbolIndex, Symbol>,
    strings: usize,
}

impl Compiler {
    pub fn new(unit: &str) -> Self {
        Self {
            unit: unit.to_owned(),
            words: TiVec::new(),
            symbols: TiVec::new(),
            strings: 0,
        }
    }

    pub fn words(&self) -> &TiVec<WordIndex, Word> {
        &self.words
    }

    pub fn finish(self) -> Object {
        Object {
            name: self.unit,
            words: self.words,
            symbols: self.symbols,
        }
    }

    pub(crate) fn emit(&mut self, instruction: Instruction, location: &Location) -> WordIndex {
        self.words
            .push_and_get_key(Word::instruction(instruction, location.clone()))
    }

    pub(crate) fn emit_into(
        &mut self,
        seq: &mut Sequence,
        instructions: impl IntoIterator<Item = Instruction>,
        location: &Location,
    ) {
        for instruction in instructions {
            let idx = self.emit(instruction, location);
            seq.push(idx);
        }
    }

    pub(crate) fn marker(&mut self, location: &Location) -> WordIndex {
        self.emit(Instruction::Pass, location)
    }

    pub(crate) fn instruction(&self, idx: WordIndex) -> Option<&Instruction> {
        self.words.get(idx).and_then(Word::as_instruction)
    }

    pub(crate) fn replace(&mut self, idx: WordIndex, instruction: Instruction) {
        if let Some(word) = self.words.get_mut(idx) {
            word.inner = crate::bytecode::InnerWord::Instruction(instruction);
        }
    }

    fn datum(&mut self, datum: Datum, location: &Location) -> WordIndex {
        self.words
            .push_and_get_key(Word::datum(datum, location.clone()))
    }

    fn link_name(&self, name: &str, storage_class: StorageClass) -> String {
        match storage_class {
            StorageClass::Static => format!("{}::{}", self.unit, name),
            _ => name.to_owned(),
        }
    }

    fn global(&mut self, decl: &crate::ast::Declaration, scope: &mut Scope) -> Result<(), Error> {
        let ty = resolved_type(&decl.ty, decl.initializer.as_ref());
        let symbol = self.link_name(&decl.name, decl.storage_class);
        scope.define(
            &decl.name,
            Binding::Global {
                symbol: symbol.clone(),
                ty: ty.clone(),
            },
        );

        if ty.is_function() {
            self.symbols.push(Symbol {
                name: symbol,
                body: vec![],
                size: 0,
                storage_class: decl.storage_class,
                kind: SymbolKind::Code,
                location: decl.location.clone(),
            });
            return Ok(());
        }

        let body = match (&decl.initializer, decl.storage_class) {
            (_, StorageClass::Extern) => vec![],
            (None, StorageClass::Unspecified) => vec![],
            (None, StorageClass::Static) => self.zeros(ty.size(), &decl.location),
            (Some(init), _) => {
                let cells = self.static_cells(&ty, init, scope, &decl.name, &decl.location)?;
                cells
                    .into_iter()
                    .map(|d| self.datum(d, &decl.location))
                    .collect()
            }
        };
        self.symbols.push(Symbol {
            name: symbol,
            body,
            size: ty.size(),
            storage_class: decl.storage_class,
            kind: SymbolKind::Data,
            location: decl.location.clone(),
        });
        Ok(())
    }

    /// A unit-private zero-initialised data symbol for a `static` local.
    pub(crate) fn static_local(
        &mut self,
        decl: &crate::ast::Declaration,
        ty: &CType,
        scope: &Scope,
        ctx: &mut ControlContext,
    ) -> Result<String, Error> {
        let name = format!(
            "{}::{}::{}.{}",
            self.unit, ctx.function, decl.name, ctx.statics
        );
        ctx.statics += 1;
        let body = match &decl.initializer {
            None => self.zeros(ty.size(), &decl.location),
            Some(init) => {
                let cells = self.static_cells(ty, init, scope, &decl.name, &decl.location)?;
                cells
                    .into_iter()
                    .map(|d| self.datum(d, &decl.location))
                    .collect()
            }
        };
        self.symbols.push(Symbol {
            name: name.clone(),
            body,
            size: ty.size(),
            storage_class: StorageClass::Static,
            kind: SymbolKind::Data,
            location: decl.location.clone(),
        });
        Ok(name)
    }

    fn zeros(&mut self, cells: usize, location: &Location) -> Vec<WordIndex> {
        (0..cells)
            .map(|_| self.datum(Datum::Value(Value::Int(0)), location))
            .collect()
    }

    /// Emits a string literal as a static data symbol and returns its name.
    pub(crate) fn string_literal(&mut self, value: &str, location: &Location) -> String {
        let name = format!("{}::.str{}", self.unit, self.strings);
        self.strings += 1;
        let body: Vec<WordIndex> = value
            .chars()
            .map(|c| c as i64)
            .chain(std::iter::once(0))
            .map(|c| self.datum(Datum::Value(Value::Int(c)), location))
            .collect();
        self.symbols.push(Symbol {
            name: name.clone(),
            size: body.len(),
            body,
            storage_class: StorageClass::Static,
            kind: SymbolKind::Data,
            location: location.clone(),
        });
        name
    }

    fn static_cells(
        &mut self,
        ty: &CType,
        init: &Initializer,
        scope: &Scope,
        name: &str,
        location: &Location,
    ) -> Result<Vec<Datum>, Error> {
        let mut cells = match (ty, init) {
            (CType::Array(elem, _), Initializer::List(items)) => {
                let mut cells = vec![];
                for item in items {
                    cells.extend(self.static_cells(elem, item, scope, name, location)?);
                }
                cells
            }
            (CType::Array(elem, _), Initializer::Expression(e)) if elem.is_integral() => {
                match &e.kind {
                    crate::ast::ExprKind::StringLiteral(s) => s
                        .chars()
                        .map(|c| Datum::Value(Value::Int(c as i64)))
                        .collect(),
                    _ => {
                        return Err(Error::NonConstantInitializer {
                            location: location.clone(),
                            name: name.to_owned(),
                        })
                    }
                }
            }
            (_, Initializer::List(items)) => match items.first() {
                Some(first) => self.static_cells(ty, first, scope, name, location)?,
                None => vec![],
            },
            (_, Initializer::Expression(e)) => {
                let folded = self.fold(e, scope).ok_or_else(|| Error::NonConstantInitializer {
                    location: location.clone(),
                    name: name.to_owned(),
                })?;
                vec![match folded {
                    Datum::Value(v) => Datum::Value(convert_constant(v, ty)),
                    address => address,
                }]
            }
        };
        cells.resize(ty.size().max(1), Datum::Value(Value::Int(0)));
        cells.truncate(ty.size().max(1));
        Ok(cells)
    }

    fn function(&mut self, f: &FunctionDefinition, scope: &mut Scope) -> Result<(), Error> {
        let symbol = self.link_name(&f.name, f.storage_class);
        scope.define(
            &f.name,
            Binding::Global {
                symbol: symbol.clone(),
                ty: f.ty.clone(),
            },
        );
        let Some(ft) = f.ty.function_type() else {
            return Err(Error::UnsupportedNode {
                location: f.location.clone(),
                what: format!("function type {:?}", f.ty),
            });
        };

        let mut ctx = ControlContext::new(&f.name, ft.ret.as_ref().clone());
        scope.push_scope();
        let n = ft.params.len();
        for (i, (name, ty)) in f.params.iter().zip(&ft.params).enumerate() {
            scope.define(
                name,
                Binding::Local {
                    offset: 3 + (n - 1 - i) as i64,
                    ty: ty.decay(),
                },
            );
        }
        let body = self.statement(&f.body, scope, &mut ctx);
        scope.pop_scope();
        let mut body = body?;
        body.extend(self.implicit_return(&ctx.return_type, &f.location));
        self.reconcile_gotos(&mut ctx)?;

        let size = body
            .iter()
            .filter_map(|w| self.words.get(*w))
            .map(Word::footprint)
            .sum();
        self.symbols.push(Symbol {
            name: symbol,
            body,
            size,
            storage_class: f.storage_class,
            kind: SymbolKind::Code,
            location: f.location.clone(),
        });
        Ok(())
    }

    /// Loads the return address at `bp+1` and jumps to it.
    pub(crate) fn return_sequence(&mut self, location: &Location) -> Sequence {
        let mut seq = vec![];
        self.emit_into(
            &mut seq,
            [
                Instruction::LoadBaseStackPointer,
                Instruction::push_int(1),
                Instruction::Add,
                Instruction::Load(1),
                Instruction::AbsoluteJump,
            ],
            location,
        );
        seq
    }

    /// Stores the value on top of the stack through the return-slot pointer
    /// at `bp+2`, then drops it.
    pub(crate) fn store_return_value(&mut self, size: usize, location: &Location) -> Sequence {
        let mut seq = vec![];
        self.emit_into(
            &mut seq,
            [
                Instruction::LoadBaseStackPointer,
                Instruction::push_int(2),
                Instruction::Add,
                Instruction::Load(1),
                Instruction::Set(size as i64),
                Instruction::Allocate(-(size as i64)),
            ],
            location,
        );
        seq
    }

    fn implicit_return(&mut self, return_type: &CType, location: &Location) -> Sequence {
        let mut seq = vec![];
        if !return_type.is_void() {
            let zero = if return_type.is_floating() {
                Value::Float(0.0)
            } else {
                Value::Int(0)
            };
            self.emit_into(
                &mut seq,
                [Instruction::Push(crate::bytecode::Operand::Immediate(zero))],
                location,
            );
            seq.extend(self.store_return_value(return_type.size(), location));
        }
        seq.extend(self.return_sequence(location));
        seq
    }

    /// Patches every forward goto of the function just generated.
    pub fn reconcile_gotos(&mut self, ctx: &mut ControlContext) -> Result<(), Error> {
        for (name, gotos) in std::mem::take(&mut ctx.gotos) {
            let Some(label) = ctx.labels.get(&name).copied() else {
                let location = gotos
                    .first()
                    .map(|g| g.location.clone())
                    .unwrap_or_default();
                return Err(Error::UnresolvedLabel { location, name });
            };
            for goto in gotos {
                self.replace(goto.allocate, Instruction::Allocate(goto.offset - label.offset));
                self.replace(goto.jump, Instruction::RelativeJump(Address::Word(label.marker)));
            }
        }
        Ok(())
    }
}

/// Completes `T x[] = ...` from its initializer.
pub(crate) fn resolved_type(ty: &CType, init: Option<&Initializer>) -> CType {
    match (ty, init) {
        (CType::Array(elem, 0), Some(Initializer::List(items))) => {
            CType::Array(elem.clone(), items.len())
        }
        (CType::Array(elem, 0), Some(Initializer::Expression(e))) => match &e.kind {
            crate::ast::ExprKind::StringLiteral(s) => CType::Array(elem.clone(), s.chars().count() + 1),
            _ => ty.clone(),
        },
        _ => ty.clone(),
    }
}

/// Folds a constant into the representation of `ty`.
pub(crate) fn convert_constant(value: Value, ty: &CType) -> Value {
    match (value, ty.is_floating()) {
        (Value::Int(i), true) => Value::Float(i as f64),
        (Value::Float(f), false) => Value::Int(narrow_constant(f as i64, ty)),
        (Value::Int(i), false) => Value::Int(narrow_constant(i, ty)),
        (v @ Value::Float(_), true) => v,
    }
}

pub(crate) fn narrow_constant(value: i64, ty: &CType) -> i64 {
    let bits = ty.bits();
    if !ty.is_integral() || bits >= 64 {
        return value;
    }
    if ty.is_unsigned() {
        value & ((1i64 << bits) - 1)
    } else {
        let shift = 64 - bits;
        (value << shift) >> shift
    }
}

#[cfg(test)]
mod tests;
