use crate::{
    ast::{
        BinaryOp, Declaration, Expression, ExternalDeclaration, FunctionDefinition, Statement,
        TranslationUnit, UnaryOp,
    },
    bytecode::{Address, Instruction, InnerWord, Object, StorageClass, SymbolKind},
    ctype::CType,
    source::Location,
};

use super::{unit, Error};

fn int_main(body: Vec<Statement>) -> ExternalDeclaration {
    ExternalDeclaration::Function(FunctionDefinition::new(
        "main",
        CType::function(CType::int(), vec![]),
        &[],
        Statement::compound(body),
    ))
}

fn compile(items: Vec<ExternalDeclaration>) -> Result<Object, Error> {
    unit(&TranslationUnit {
        name: "t.c".to_owned(),
        items,
    })
}

fn code(object: &Object, name: &str) -> Vec<Instruction> {
    let symbol = object
        .symbols
        .iter()
        .find(|s| s.name == name)
        .expect("symbol exists");
    symbol
        .body
        .iter()
        .filter_map(|w| object.words[*w].as_instruction().cloned())
        .collect()
}

fn x() -> Expression {
    Expression::ident("x", CType::int())
}

#[test]
fn break_and_continue_need_an_enclosing_loop() {
    let err = compile(vec![int_main(vec![
        Statement::break_().at(Location::new("t.c", 3, 5))
    ])])
    .expect_err("break outside loop");
    assert!(matches!(&err, Error::BreakOutsideLoop { location } if location.line == 3));
    assert_eq!(err.to_string(), "At t.c:3:5, break outside of a loop or switch");

    assert!(matches!(
        compile(vec![int_main(vec![Statement::continue_()])]),
        Err(Error::ContinueOutsideLoop { .. })
    ));

    // A switch catches break but not continue.
    let in_switch = Statement::switch(Expression::int(1), Statement::continue_());
    assert!(matches!(
        compile(vec![int_main(vec![in_switch])]),
        Err(Error::ContinueOutsideLoop { .. })
    ));
}

#[test]
fn case_labels_need_a_switch() {
    assert!(matches!(
        compile(vec![int_main(vec![Statement::case(1, Statement::empty())])]),
        Err(Error::CaseOutsideSwitch { .. })
    ));
    assert!(matches!(
        compile(vec![int_main(vec![Statement::default(Statement::empty())])]),
        Err(Error::CaseOutsideSwitch { .. })
    ));
}

#[test]
fn duplicate_case_values_and_defaults() {
    let body = Statement::compound(vec![
        Statement::case(4, Statement::break_()),
        Statement::case(4, Statement::break_()),
    ]);
    assert!(matches!(
        compile(vec![int_main(vec![Statement::switch(Expression::int(4), body)])]),
        Err(Error::DuplicateCase { value: 4, .. })
    ));

    let body = Statement::compound(vec![
        Statement::default(Statement::break_()),
        Statement::default(Statement::break_()),
    ]);
    assert!(matches!(
        compile(vec![int_main(vec![Statement::switch(Expression::int(4), body)])]),
        Err(Error::DuplicateDefault { .. })
    ));
}

#[test]
fn labels_must_be_unique_and_resolved() {
    let twice = vec![
        Statement::label("l", Statement::empty()),
        Statement::label("l", Statement::empty()),
    ];
    assert!(matches!(
        compile(vec![int_main(twice)]),
        Err(Error::DuplicateLabel { name, .. }) if name == "l"
    ));

    let missing = vec![Statement::goto("nowhere").at(Location::new("t.c", 9, 1))];
    let err = compile(vec![int_main(missing)]).expect_err("unresolved");
    assert!(matches!(&err, Error::UnresolvedLabel { name, location } if name == "nowhere" && location.line == 9));
}

#[test]
fn assignment_needs_an_lvalue() {
    let assign = Expression::assign(Expression::int(1), Expression::int(2));
    assert!(matches!(
        compile(vec![int_main(vec![Statement::expr(assign)])]),
        Err(Error::InvalidLvalue { .. })
    ));

    let address_of_constant = Expression::unary(UnaryOp::AddressOf, Expression::int(3));
    assert!(matches!(
        compile(vec![int_main(vec![Statement::expr(address_of_constant)])]),
        Err(Error::InvalidLvalue { .. })
    ));
}

#[test]
fn identifiers_must_be_declared() {
    assert!(matches!(
        compile(vec![int_main(vec![Statement::expr(x())])]),
        Err(Error::UndeclaredIdentifier { name, .. }) if name == "x"
    ));
}

#[test]
fn static_initializers_must_fold() {
    let items = vec![
        ExternalDeclaration::Declaration(Declaration::new("x", CType::int()).init(Expression::int(1))),
        ExternalDeclaration::Declaration(Declaration::new("y", CType::int()).init(x())),
    ];
    assert!(matches!(
        compile(items),
        Err(Error::NonConstantInitializer { name, .. }) if name == "y"
    ));

    let folded = Expression::binary(BinaryOp::Multiply, Expression::int(6), Expression::int(7));
    let object = compile(vec![ExternalDeclaration::Declaration(
        Declaration::new("z", CType::char()).init(Expression::binary(BinaryOp::Add, folded, Expression::int(256))),
    )])
    .expect("folds");
    let z = object.find_symbol("z").expect("defined");
    let cell = object.symbols[z].body[0];
    assert!(matches!(
        &object.words[cell].inner,
        InnerWord::Datum(crate::bytecode::Datum::Value(crate::bytecode::Value::Int(42)))
    ));
}

#[test]
fn file_scope_symbols_are_classified() {
    let items = vec![
        ExternalDeclaration::Declaration(Declaration::new("tentative", CType::int())),
        ExternalDeclaration::Declaration(
            Declaration::new("elsewhere", CType::int()).storage(StorageClass::Extern),
        ),
        ExternalDeclaration::Declaration(
            Declaration::new("hidden", CType::array_of(CType::int(), 3)).storage(StorageClass::Static),
        ),
        ExternalDeclaration::Declaration(Declaration::new(
            "proto",
            CType::function(CType::int(), vec![CType::int()]),
        )),
    ];
    let object = compile(items).expect("compiles");
    let by_name = |name: &str| {
        object
            .symbols
            .iter()
            .find(|s| s.name == name)
            .expect("symbol exists")
    };

    assert!(by_name("tentative").is_tentative());
    assert_eq!(by_name("tentative").size, 1);
    assert!(by_name("elsewhere").is_declaration());
    let hidden = by_name("t.c::hidden");
    assert_eq!(hidden.body.len(), 3);
    assert_eq!(hidden.storage_class, StorageClass::Static);
    let proto = by_name("proto");
    assert_eq!(proto.kind, SymbolKind::Code);
    assert!(proto.is_declaration());
}

#[test]
fn string_literals_become_private_data() {
    let s = Expression::string("hi");
    let object = compile(vec![int_main(vec![Statement::expr(s)])]).expect("compiles");
    let literal = object
        .symbols
        .iter()
        .find(|s| s.name == "t.c::.str0")
        .expect("literal symbol");
    assert_eq!(literal.size, 3);
    assert_eq!(literal.storage_class, StorageClass::Static);
    assert!(code(&object, "main").contains(&Instruction::push_address(Address::Reference(
        "t.c::.str0".to_owned()
    ))));
}

#[test]
fn static_locals_get_unit_private_names() {
    let counter = Declaration::new("count", CType::int())
        .storage(StorageClass::Static)
        .init(Expression::int(5));
    let object = compile(vec![int_main(vec![Statement::declare(vec![counter])])]).expect("compiles");
    let symbol = object
        .symbols
        .iter()
        .find(|s| s.name == "t.c::main::count.0")
        .expect("static local");
    assert_eq!(symbol.body.len(), 1);
    assert!(!code(&object, "main").contains(&Instruction::Allocate(1)));
}

#[test]
fn forward_goto_is_patched_with_the_label_depth() {
    let body = vec![
        Statement::compound(vec![
            Statement::declare(vec![Declaration::new("x", CType::int()).init(Expression::int(1))]),
            Statement::goto("out"),
        ]),
        Statement::label("out", Statement::ret(Some(Expression::int(0)))),
    ];
    let object = compile(vec![int_main(body)]).expect("compiles");
    let main = code(&object, "main");

    assert!(main.iter().all(|i| i.addresses().iter().all(|a| **a != Address::Unset)));
    let patched = main.windows(2).any(|w| {
        matches!(
            w,
            [Instruction::Allocate(-1), Instruction::RelativeJump(Address::Word(_))]
        )
    });
    assert!(patched, "{:?}", main);
}

#[test]
fn void_functions_end_with_the_return_sequence() {
    let f = ExternalDeclaration::Function(FunctionDefinition::new(
        "f",
        CType::function(CType::Void, vec![]),
        &[],
        Statement::compound(vec![]),
    ));
    let object = compile(vec![f]).expect("compiles");
    assert_eq!(
        code(&object, "f"),
        vec![
            Instruction::LoadBaseStackPointer,
            Instruction::push_int(1),
            Instruction::Add,
            Instruction::Load(1),
            Instruction::AbsoluteJump,
        ]
    );
}

#[test]
fn parameters_sit_above_the_return_slot() {
    let f = ExternalDeclaration::Function(FunctionDefinition::new(
        "second",
        CType::function(CType::int(), vec![CType::int(), CType::int()]),
        &["a", "b"],
        Statement::ret(Some(Expression::ident("b", CType::int()))),
    ));
    let object = compile(vec![f]).expect("compiles");
    let body = code(&object, "second");
    assert_eq!(
        &body[..4],
        &[
            Instruction::LoadBaseStackPointer,
            Instruction::push_int(3),
            Instruction::Add,
            Instruction::Load(1),
        ]
    );
}

#[test]
fn direct_calls_reference_the_callee_by_name() {
    let callee_ty = CType::function(CType::int(), vec![]);
    let items = vec![
        ExternalDeclaration::Declaration(Declaration::new("g", callee_ty.clone())),
        int_main(vec![Statement::ret(Some(Expression::call(
            Expression::ident("g", callee_ty),
            vec![],
        )))]),
    ];
    let object = compile(items).expect("compiles");
    let main = code(&object, "main");
    assert_eq!(main[0], Instruction::Allocate(1));
    assert_eq!(main[1], Instruction::PushFrame);
    assert!(main.contains(&Instruction::RelativeJump(Address::Reference("g".to_owned()))));
}

#[test]
fn calls_must_match_the_declared_arity() {
    let callee_ty = CType::function(CType::int(), vec![CType::int()]);
    let call = |args: Vec<Expression>| {
        compile(vec![
            ExternalDeclaration::Declaration(Declaration::new("f", callee_ty.clone())),
            int_main(vec![Statement::ret(Some(
                Expression::call(Expression::ident("f", callee_ty.clone()), args)
                    .at(Location::new("t.c", 5, 9)),
            ))]),
        ])
    };

    let err = call(vec![Expression::int(1), Expression::int(2)]).expect_err("too many");
    assert!(matches!(
        &err,
        Error::ArgumentCount { expected: 1, found: 2, location } if location.line == 5
    ));
    assert!(matches!(call(vec![]), Err(Error::ArgumentCount { expected: 1, found: 0, .. })));
    assert!(call(vec![Expression::int(1)]).is_ok());
}
