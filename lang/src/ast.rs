//! Typed syntax tree handed over by a front end.
//!
//! Nodes arrive already type-checked: every expression carries its resolved
//! type. The constructors below compute those types the way a checker would,
//! which is enough for tests and small front ends.

use crate::{bytecode::StorageClass, ctype::CType, source::Location};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    Integer(i64),
    Float(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Plus,
    BitNot,
    LogicalNot,
    Deref,
    AddressOf,
    PreIncrement,
    PreDecrement,
    PostIncrement,
    PostDecrement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    ShiftLeft,
    ShiftRight,
    BitAnd,
    BitOr,
    BitXor,
    LessThan,
    GreaterThan,
    LessEqual,
    GreaterEqual,
    Equal,
    NotEqual,
    LogicalAnd,
    LogicalOr,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::LessThan
                | BinaryOp::GreaterThan
                | BinaryOp::LessEqual
                | BinaryOp::GreaterEqual
                | BinaryOp::Equal
                | BinaryOp::NotEqual
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::LogicalAnd | BinaryOp::LogicalOr)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Constant(Constant),
    StringLiteral(String),
    Identifier(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Assign {
        target: Box<Expression>,
        value: Box<Expression>,
    },
    CompoundAssign {
        op: BinaryOp,
        target: Box<Expression>,
        value: Box<Expression>,
    },
    Cast(Box<Expression>),
    Conditional {
        condition: Box<Expression>,
        then: Box<Expression>,
        otherwise: Box<Expression>,
    },
    Comma {
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Subscript {
        array: Box<Expression>,
        index: Box<Expression>,
    },
    Call {
        function: Box<Expression>,
        args: Vec<Expression>,
    },
    /// A request to the kernel table; evaluates to one integer.
    SystemCall {
        index: i64,
        args: Vec<Expression>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub kind: ExprKind,
    pub ty: CType,
    pub location: Location,
}

impl Expression {
    pub fn new(kind: ExprKind, ty: CType) -> Self {
        Self {
            kind,
            ty,
            location: Location::default(),
        }
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn int(value: i64) -> Self {
        Self::constant(value, CType::int())
    }

    pub fn constant(value: i64, ty: CType) -> Self {
        Self::new(ExprKind::Constant(Constant::Integer(value)), ty)
    }

    pub fn float(value: f64) -> Self {
        Self::new(ExprKind::Constant(Constant::Float(value)), CType::Double)
    }

    pub fn string(value: &str) -> Self {
        Self::new(
            ExprKind::StringLiteral(value.to_owned()),
            CType::array_of(CType::char(), value.chars().count() + 1),
        )
    }

    pub fn ident(name: &str, ty: CType) -> Self {
        Self::new(ExprKind::Identifier(name.to_owned()), ty)
    }

    pub fn unary(op: UnaryOp, operand: Expression) -> Self {
        let ty = match op {
            UnaryOp::LogicalNot => CType::int(),
            UnaryOp::Deref => operand.ty.pointee().cloned().unwrap_or(CType::int()),
            UnaryOp::AddressOf => CType::pointer_to(operand.ty.clone()),
            UnaryOp::Negate | UnaryOp::Plus | UnaryOp::BitNot => {
                CType::common(&operand.ty, &operand.ty)
            }
            _ => operand.ty.clone(),
        };
        Self::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            ty,
        )
    }

    pub fn binary(op: BinaryOp, left: Expression, right: Expression) -> Self {
        let (l, r) = (left.ty.decay(), right.ty.decay());
        let ty = if op.is_comparison() || op.is_logical() {
            CType::int()
        } else if matches!(op, BinaryOp::ShiftLeft | BinaryOp::ShiftRight) {
            CType::common(&l, &l)
        } else if op == BinaryOp::Subtract && l.is_pointer() && r.is_pointer() {
            CType::long()
        } else if matches!(op, BinaryOp::Add | BinaryOp::Subtract) && l.is_pointer() {
            l
        } else if op == BinaryOp::Add && r.is_pointer() {
            r
        } else {
            CType::common(&l, &r)
        };
        Self::new(
            ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            ty,
        )
    }

    pub fn assign(target: Expression, value: Expression) -> Self {
        let ty = target.ty.clone();
        Self::new(
            ExprKind::Assign {
                target: Box::new(target),
                value: Box::new(value),
            },
            ty,
        )
    }

    pub fn compound_assign(op: BinaryOp, target: Expression, value: Expression) -> Self {
        let ty = target.ty.clone();
        Self::new(
            ExprKind::CompoundAssign {
                op,
                target: Box::new(target),
                value: Box::new(value),
            },
            ty,
        )
    }

    pub fn cast(operand: Expression, ty: CType) -> Self {
        Self::new(ExprKind::Cast(Box::new(operand)), ty)
    }

    pub fn conditional(condition: Expression, then: Expression, otherwise: Expression) -> Self {
        let ty = if then.ty.decay().is_pointer() || then.ty.is_void() {
            then.ty.decay()
        } else {
            CType::common(&then.ty, &otherwise.ty)
        };
        Self::new(
            ExprKind::Conditional {
                condition: Box::new(condition),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            },
            ty,
        )
    }

    pub fn comma(left: Expression, right: Expression) -> Self {
        let ty = right.ty.clone();
        Self::new(
            ExprKind::Comma {
                left: Box::new(left),
                right: Box::new(right),
            },
            ty,
        )
    }

    pub fn subscript(array: Expression, index: Expression) -> Self {
        let ty = array.ty.pointee().cloned().unwrap_or(CType::int());
        Self::new(
            ExprKind::Subscript {
                array: Box::new(array),
                index: Box::new(index),
            },
            ty,
        )
    }

    pub fn call(function: Expression, args: Vec<Expression>) -> Self {
        let ty = function
            .ty
            .function_type()
            .map(|f| f.ret.as_ref().clone())
            .unwrap_or(CType::int());
        Self::new(
            ExprKind::Call {
                function: Box::new(function),
                args,
            },
            ty,
        )
    }

    pub fn syscall(index: i64, args: Vec<Expression>) -> Self {
        Self::new(ExprKind::SystemCall { index, args }, CType::int())
    }

    /// Whether the expression already evaluates to exactly 0 or 1.
    pub fn is_truth_valued(&self) -> bool {
        match &self.kind {
            ExprKind::Binary { op, .. } => op.is_comparison() || op.is_logical(),
            ExprKind::Unary {
                op: UnaryOp::LogicalNot,
                ..
            } => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Initializer {
    Expression(Expression),
    List(Vec<Initializer>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub name: String,
    pub ty: CType,
    pub storage_class: StorageClass,
    pub initializer: Option<Initializer>,
    pub location: Location,
}

impl Declaration {
    pub fn new(name: &str, ty: CType) -> Self {
        Self {
            name: name.to_owned(),
            ty,
            storage_class: StorageClass::Unspecified,
            initializer: None,
            location: Location::default(),
        }
    }

    pub fn init(mut self, value: Expression) -> Self {
        self.initializer = Some(Initializer::Expression(value));
        self
    }

    pub fn init_list(mut self, values: Vec<Expression>) -> Self {
        self.initializer = Some(Initializer::List(
            values.into_iter().map(Initializer::Expression).collect(),
        ));
        self
    }

    pub fn storage(mut self, storage_class: StorageClass) -> Self {
        self.storage_class = storage_class;
        self
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = location;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Empty,
    Expression(Expression),
    Declarations(Vec<Declaration>),
    Compound(Vec<Statement>),
    If {
        condition: Expression,
        then: Box<Statement>,
        otherwise: Option<Box<Statement>>,
    },
    While {
        condition: Expression,
        body: Box<Statement>,
    },
    DoWhile {
        body: Box<Statement>,
        condition: Expression,
    },
    For {
        init: Option<Box<Statement>>,
        condition: Option<Expression>,
        step: Option<Expression>,
        body: Box<Statement>,
    },
    Switch {
        selector: Expression,
        body: Box<Statement>,
    },
    Case {
        value: i64,
        body: Box<Statement>,
    },
    Default(Box<Statement>),
    Break,
    Continue,
    Return(Option<Expression>),
    Goto(String),
    Label {
        name: String,
        body: Box<Statement>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StmtKind,
    pub location: Location,
}

impl Statement {
    pub fn new(kind: StmtKind) -> Self {
        Self {
            kind,
            location: Location::default(),
        }
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn empty() -> Self {
        Self::new(StmtKind::Empty)
    }

    pub fn expr(expression: Expression) -> Self {
        Self::new(StmtKind::Expression(expression))
    }

    pub fn declare(declarations: Vec<Declaration>) -> Self {
        Self::new(StmtKind::Declarations(declarations))
    }

    pub fn compound(statements: Vec<Statement>) -> Self {
        Self::new(StmtKind::Compound(statements))
    }

    pub fn if_else(condition: Expression, then: Statement, otherwise: Option<Statement>) -> Self {
        Self::new(StmtKind::If {
            condition,
            then: Box::new(then),
            otherwise: otherwise.map(Box::new),
        })
    }

    pub fn while_loop(condition: Expression, body: Statement) -> Self {
        Self::new(StmtKind::While {
            condition,
            body: Box::new(body),
        })
    }

    pub fn do_while(body: Statement, condition: Expression) -> Self {
        Self::new(StmtKind::DoWhile {
            body: Box::new(body),
            condition,
        })
    }

    pub fn for_loop(
        init: Option<Statement>,
        condition: Option<Expression>,
        step: Option<Expression>,
        body: Statement,
    ) -> Self {
        Self::new(StmtKind::For {
            init: init.map(Box::new),
            condition,
            step,
            body: Box::new(body),
        })
    }

    pub fn switch(selector: Expression, body: Statement) -> Self {
        Self::new(StmtKind::Switch {
            selector,
            body: Box::new(body),
        })
    }

    pub fn case(value: i64, body: Statement) -> Self {
        Self::new(StmtKind::Case {
            value,
            body: Box::new(body),
        })
    }

    pub fn default(body: Statement) -> Self {
        Self::new(StmtKind::Default(Box::new(body)))
    }

    pub fn break_() -> Self {
        Self::new(StmtKind::Break)
    }

    pub fn continue_() -> Self {
        Self::new(StmtKind::Continue)
    }

    pub fn ret(value: Option<Expression>) -> Self {
        Self::new(StmtKind::Return(value))
    }

    pub fn goto(label: &str) -> Self {
        Self::new(StmtKind::Goto(label.to_owned()))
    }

    pub fn label(name: &str, body: Statement) -> Self {
        Self::new(StmtKind::Label {
            name: name.to_owned(),
            body: Box::new(body),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub ty: CType,
    pub params: Vec<String>,
    pub storage_class: StorageClass,
    pub body: Statement,
    pub location: Location,
}

impl FunctionDefinition {
    pub fn new(name: &str, ty: CType, params: &[&str], body: Statement) -> Self {
        Self {
            name: name.to_owned(),
            ty,
            params: params.iter().map(|p| (*p).to_owned()).collect(),
            storage_class: StorageClass::Unspecified,
            body,
            location: Location::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExternalDeclaration {
    Declaration(Declaration),
    Function(FunctionDefinition),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranslationUnit {
    pub name: String,
    pub items: Vec<ExternalDeclaration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_resolve_types() {
        let p = Expression::ident("p", CType::pointer_to(CType::int()));
        let sum = Expression::binary(BinaryOp::Add, p.clone(), Expression::int(1));
        assert_eq!(sum.ty, CType::pointer_to(CType::int()));

        let diff = Expression::binary(BinaryOp::Subtract, p.clone(), p.clone());
        assert_eq!(diff.ty, CType::long());

        let cmp = Expression::binary(BinaryOp::LessThan, Expression::float(1.0), Expression::int(2));
        assert_eq!(cmp.ty, CType::int());
        assert!(cmp.is_truth_valued());

        let deref = Expression::unary(UnaryOp::Deref, p);
        assert_eq!(deref.ty, CType::int());

        let s = Expression::string("hi");
        assert_eq!(s.ty, CType::array_of(CType::char(), 3));
    }
}
