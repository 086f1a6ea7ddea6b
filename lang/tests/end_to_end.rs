use std::{cell::RefCell, io::Write, rc::Rc};

use stackc::{
    ast::{
        BinaryOp, Declaration, Expression, ExternalDeclaration, FunctionDefinition, Statement,
        TranslationUnit, UnaryOp,
    },
    bytecode::{Archive, Executable, StorageClass, Value},
    compiler::{self, Compiler, ControlContext},
    ctype::CType,
    linker,
    scope::Scope,
    source::Location,
    vm::{InnerEvalError, StepResult, Vm},
};

fn int() -> CType {
    CType::int()
}

fn var(name: &str) -> Expression {
    Expression::ident(name, int())
}

fn num(value: i64) -> Expression {
    Expression::int(value)
}

fn bin(op: BinaryOp, left: Expression, right: Expression) -> Expression {
    Expression::binary(op, left, right)
}

fn local(name: &str, value: Expression) -> Statement {
    Statement::declare(vec![Declaration::new(name, int()).init(value)])
}

fn set(name: &str, value: Expression) -> Statement {
    Statement::expr(Expression::assign(var(name), value))
}

fn ret(value: Expression) -> Statement {
    Statement::ret(Some(value))
}

fn int_fn(params: usize) -> CType {
    CType::function(int(), vec![int(); params])
}

fn call(name: &str, args: Vec<Expression>) -> Expression {
    Expression::call(Expression::ident(name, int_fn(args.len())), args)
}

fn function(name: &str, params: &[&str], body: Vec<Statement>) -> ExternalDeclaration {
    ExternalDeclaration::Function(FunctionDefinition::new(
        name,
        int_fn(params.len()),
        params,
        Statement::compound(body),
    ))
}

fn prototype(name: &str, params: usize) -> ExternalDeclaration {
    ExternalDeclaration::Declaration(Declaration::new(name, int_fn(params)))
}

fn global(decl: Declaration) -> ExternalDeclaration {
    ExternalDeclaration::Declaration(decl)
}

fn unit(name: &str, items: Vec<ExternalDeclaration>) -> TranslationUnit {
    TranslationUnit {
        name: name.to_owned(),
        items,
    }
}

fn build(units: &[TranslationUnit], archives: &[Archive]) -> Executable {
    let objects: Vec<_> = units
        .iter()
        .map(|u| compiler::unit(u).expect("compiles"))
        .collect();
    linker::executable(&objects, archives, "main").expect("links")
}

fn run_program(units: &[TranslationUnit]) -> Vm {
    let mut vm = Vm::new(&build(units, &[])).expect("loads");
    vm.run().expect("runs");
    vm
}

fn exit_of_units(units: &[TranslationUnit]) -> i64 {
    let vm = run_program(units);
    assert_eq!((vm.cpu.sp, vm.cpu.bp), (-1, -1));
    match vm.exit_value() {
        Value::Int(i) => i,
        v => panic!("non-integer exit value {}", v),
    }
}

fn exit_of(body: Vec<Statement>) -> i64 {
    exit_of_units(&[unit("main.c", vec![function("main", &[], body)])])
}

/// Generates a bare statement, lays it out on its own and runs it.
fn snippet(stmt: Statement) -> Vm {
    let mut compiler = Compiler::new("snippet.c");
    let mut scope = Scope::new();
    let mut ctx = ControlContext::new("snippet", CType::Void);
    let seq = compiler
        .statement(&stmt, &mut scope, &mut ctx)
        .expect("generates");
    compiler.reconcile_gotos(&mut ctx).expect("labels resolve");
    let exe = linker::assemble(compiler.words(), &seq).expect("assembles");
    let mut vm = Vm::new(&exe).expect("loads");
    vm.run().expect("runs");
    vm
}

#[derive(Clone, Default)]
struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn factorial() -> ExternalDeclaration {
    function(
        "fact",
        &["n"],
        vec![
            Statement::if_else(bin(BinaryOp::LessEqual, var("n"), num(1)), ret(num(1)), None),
            ret(bin(
                BinaryOp::Multiply,
                var("n"),
                call("fact", vec![bin(BinaryOp::Subtract, var("n"), num(1))]),
            )),
        ],
    )
}

#[test]
fn stack_pointer_never_crosses_base_pointer() {
    let program = unit(
        "fact.c",
        vec![
            factorial(),
            function(
                "main",
                &[],
                vec![
                    local("total", num(0)),
                    Statement::for_loop(
                        Some(local("i", num(1))),
                        Some(bin(BinaryOp::LessEqual, var("i"), num(5))),
                        Some(Expression::unary(UnaryOp::PostIncrement, var("i"))),
                        Statement::compound(vec![
                            local("f", call("fact", vec![var("i")])),
                            Statement::expr(Expression::compound_assign(
                                BinaryOp::Add,
                                var("total"),
                                var("f"),
                            )),
                        ]),
                    ),
                    ret(var("total")),
                ],
            ),
        ],
    );
    let mut vm = Vm::new(&build(&[program], &[])).expect("loads");
    let mut steps = 0;
    loop {
        assert!(vm.cpu.sp <= vm.cpu.bp, "sp {} above bp {}", vm.cpu.sp, vm.cpu.bp);
        match vm.step().expect("steps") {
            StepResult::Continue => steps += 1,
            StepResult::Exit => break,
        }
    }
    assert!(steps > 100);
    assert_eq!(vm.exit_value(), Value::Int(1 + 2 + 6 + 24 + 120));
    assert_eq!((vm.cpu.sp, vm.cpu.bp), (-1, -1));
    assert!(vm.cpu.frames.is_empty());
}

#[test]
fn subtraction_sets_zero_and_borrow() {
    for (a, b) in [(5, 5), (3, 9), (9, 3), (-4, -4), (-8, 2)] {
        let vm = snippet(Statement::expr(bin(BinaryOp::Subtract, num(a), num(b))));
        assert_eq!(vm.cpu.zero, a == b, "{} - {}", a, b);
        assert_eq!(vm.cpu.carry, a - b < 0, "{} - {}", a, b);
        assert_eq!(vm.cpu.msb, a - b < 0, "{} - {}", a, b);
    }
}

const COMPARISONS: [BinaryOp; 6] = [
    BinaryOp::LessThan,
    BinaryOp::GreaterThan,
    BinaryOp::LessEqual,
    BinaryOp::GreaterEqual,
    BinaryOp::Equal,
    BinaryOp::NotEqual,
];

fn native<T: PartialOrd>(op: BinaryOp, a: T, b: T) -> i64 {
    let result = match op {
        BinaryOp::LessThan => a < b,
        BinaryOp::GreaterThan => a > b,
        BinaryOp::LessEqual => a <= b,
        BinaryOp::GreaterEqual => a >= b,
        BinaryOp::Equal => a == b,
        _ => a != b,
    };
    result as i64
}

fn compare(ty: CType, op: BinaryOp, a: i64, b: i64) -> i64 {
    let typed = |name: &str| Expression::ident(name, ty.clone());
    exit_of(vec![
        Statement::declare(vec![
            Declaration::new("a", ty.clone()).init(Expression::constant(a, ty.clone())),
            Declaration::new("b", ty.clone()).init(Expression::constant(b, ty.clone())),
        ]),
        ret(bin(op, typed("a"), typed("b"))),
    ])
}

#[test]
fn signed_comparisons_match_native() {
    let values = [i32::MIN as i64, -7, 0, 1, i32::MAX as i64];
    for op in COMPARISONS {
        for a in values {
            for b in values {
                assert_eq!(
                    compare(int(), op, a, b),
                    native(op, a, b),
                    "{} {:?} {}",
                    a,
                    op,
                    b
                );
            }
        }
    }
}

#[test]
fn unsigned_comparisons_match_native() {
    let values: [u32; 5] = [0, 1, 7, 4_000_000_000, u32::MAX];
    for op in COMPARISONS {
        for a in values {
            for b in values {
                assert_eq!(
                    compare(CType::unsigned_int(), op, a as i64, b as i64),
                    native(op, a, b),
                    "{} {:?} {}",
                    a,
                    op,
                    b
                );
            }
        }
    }
}

#[test]
fn logical_operators_short_circuit() {
    let divide_by_zero = || bin(BinaryOp::Divide, num(1), var("zero"));
    let body = vec![
        local("zero", num(0)),
        local("n", num(0)),
        Statement::expr(bin(BinaryOp::LogicalAnd, num(0), divide_by_zero())),
        Statement::expr(bin(BinaryOp::LogicalOr, num(7), divide_by_zero())),
        Statement::expr(bin(
            BinaryOp::LogicalAnd,
            num(0),
            Expression::assign(var("n"), num(1)),
        )),
        Statement::expr(bin(
            BinaryOp::LogicalOr,
            num(1),
            Expression::assign(var("n"), num(2)),
        )),
        Statement::expr(bin(
            BinaryOp::LogicalAnd,
            num(3),
            Expression::assign(var("n"), bin(BinaryOp::Add, var("n"), num(10))),
        )),
        ret(bin(
            BinaryOp::Add,
            bin(BinaryOp::Multiply, var("n"), num(10)),
            bin(BinaryOp::LogicalOr, num(0), num(5)),
        )),
    ];
    assert_eq!(exit_of(body), 101);
}

fn goto_round_trip() -> Statement {
    Statement::compound(vec![
        local("a", num(1)),
        Statement::goto("L"),
        Statement::compound(vec![local("b", num(2))]),
        Statement::label("L", set("a", bin(BinaryOp::Add, var("a"), num(1)))),
    ])
}

#[test]
fn forward_goto_skips_block_and_keeps_depth() {
    let vm = snippet(goto_round_trip());
    assert_eq!(vm.cpu.sp, -1);
    assert_eq!(vm.top_of_stack(), Value::Int(2));

    assert_eq!(exit_of(vec![goto_round_trip(), ret(num(0))]), 0);
    assert_eq!(
        exit_of(vec![
            local("a", num(1)),
            Statement::compound(vec![local("b", num(2)), Statement::goto("L")]),
            Statement::label("L", set("a", bin(BinaryOp::Add, var("a"), num(1)))),
            ret(var("a")),
        ]),
        2
    );
}

#[test]
fn backward_goto_loops() {
    let body = vec![
        local("n", num(0)),
        Statement::label(
            "again",
            set("n", bin(BinaryOp::Add, var("n"), num(1))),
        ),
        Statement::compound(vec![
            local("limit", num(4)),
            Statement::if_else(
                bin(BinaryOp::LessThan, var("n"), var("limit")),
                Statement::goto("again"),
                None,
            ),
        ]),
        ret(var("n")),
    ];
    assert_eq!(exit_of(body), 4);
}

#[test]
fn tentative_definitions_coalesce_to_the_largest() {
    let table = |len| Declaration::new("table", CType::array_of(int(), len));
    let table_ref = || Expression::ident("table", CType::array_of(int(), 8));
    let element = |i| Expression::subscript(table_ref(), num(i));

    let small = unit(
        "small.c",
        vec![
            global(table(4)),
            function(
                "fill",
                &[],
                vec![
                    Statement::expr(Expression::assign(element(3), num(7))),
                    ret(num(0)),
                ],
            ),
        ],
    );
    let large = unit(
        "large.c",
        vec![
            global(table(8)),
            prototype("fill", 0),
            function(
                "main",
                &[],
                vec![
                    Statement::expr(Expression::assign(element(7), num(5))),
                    Statement::expr(call("fill", vec![])),
                    ret(bin(BinaryOp::Add, element(3), element(7))),
                ],
            ),
        ],
    );

    let exe = build(&[small.clone(), large.clone()], &[]);
    let tables: Vec<_> = exe.symbols.iter().filter(|s| s.name == "table").collect();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].size, 8);
    assert_eq!(tables[0].body.len(), 8);

    assert_eq!(exit_of_units(&[small, large]), 12);
}

#[test]
fn compound_assignment_snippet_leaves_sum() {
    let vm = snippet(Statement::compound(vec![
        Statement::declare(vec![
            Declaration::new("a", int()).init(num(10)),
            Declaration::new("b", int()).init(num(1)),
        ]),
        Statement::expr(Expression::compound_assign(BinaryOp::Add, var("a"), var("b"))),
    ]));
    assert_eq!(vm.cpu.sp, -1);
    assert_eq!(vm.top_of_stack(), Value::Int(11));
}

#[test]
fn undefined_symbol_is_reported_with_its_user() {
    let program = unit(
        "main.c",
        vec![
            prototype("missing", 0),
            function(
                "main",
                &[],
                vec![ret(call("missing", vec![]).at(Location::new("main.c", 4, 12)))],
            ),
        ],
    );
    let object = compiler::unit(&program).expect("compiles");
    let err = linker::executable(&[object], &[], "main").expect_err("missing symbol");
    assert!(
        matches!(&err, linker::Error::UndefinedSymbol { name, location } if name == "missing" && location.line == 4),
        "{}",
        err
    );
}

#[test]
fn return_values_are_cast_into_the_callers_slot() {
    let char_fn = CType::function(CType::char(), vec![int()]);
    let program = unit(
        "call.c",
        vec![
            ExternalDeclaration::Function(FunctionDefinition::new(
                "truncate",
                char_fn.clone(),
                &["v"],
                ret(var("v")),
            )),
            function("add", &["a", "b"], vec![ret(bin(BinaryOp::Add, var("a"), var("b")))]),
            function(
                "main",
                &[],
                vec![
                    local("before", num(7)),
                    local(
                        "t",
                        Expression::call(Expression::ident("truncate", char_fn), vec![num(300)]),
                    ),
                    local("s", call("add", vec![num(2), num(40)])),
                    ret(bin(
                        BinaryOp::Add,
                        bin(BinaryOp::Multiply, var("before"), num(1000)),
                        bin(BinaryOp::Add, bin(BinaryOp::Multiply, var("t"), num(100)), var("s")),
                    )),
                ],
            ),
        ],
    );
    assert_eq!(exit_of_units(&[program]), 7000 + 4400 + 42);
}

#[test]
fn calls_through_function_pointers() {
    let pointer = CType::pointer_to(int_fn(2));
    let program = unit(
        "indirect.c",
        vec![
            function("sub", &["a", "b"], vec![ret(bin(BinaryOp::Subtract, var("a"), var("b")))]),
            function(
                "main",
                &[],
                vec![
                    Statement::declare(vec![
                        Declaration::new("f", pointer.clone()).init(Expression::ident("sub", int_fn(2)))
                    ]),
                    ret(Expression::call(
                        Expression::ident("f", pointer),
                        vec![num(10), num(3)],
                    )),
                ],
            ),
        ],
    );
    assert_eq!(exit_of_units(&[program]), 7);
}

#[test]
fn recursion() {
    let program = unit(
        "fact.c",
        vec![
            factorial(),
            function("main", &[], vec![ret(call("fact", vec![num(10)]))]),
        ],
    );
    assert_eq!(exit_of_units(&[program]), 3_628_800);
}

#[test]
fn loops_with_break_and_continue() {
    let sum_of_odd_squares = vec![
        local("s", num(0)),
        Statement::for_loop(
            Some(local("i", num(0))),
            Some(bin(BinaryOp::LessThan, var("i"), num(10))),
            Some(Expression::unary(UnaryOp::PostIncrement, var("i"))),
            Statement::compound(vec![
                local("sq", bin(BinaryOp::Multiply, var("i"), var("i"))),
                Statement::if_else(
                    bin(BinaryOp::Equal, bin(BinaryOp::Mod, var("i"), num(2)), num(0)),
                    Statement::continue_(),
                    None,
                ),
                Statement::expr(Expression::compound_assign(BinaryOp::Add, var("s"), var("sq"))),
            ]),
        ),
        ret(var("s")),
    ];
    assert_eq!(exit_of(sum_of_odd_squares), 1 + 9 + 25 + 49 + 81);

    let count_to_five = vec![
        local("n", num(0)),
        Statement::while_loop(
            num(1),
            Statement::compound(vec![
                local("step", num(1)),
                set("n", bin(BinaryOp::Add, var("n"), var("step"))),
                Statement::if_else(bin(BinaryOp::Equal, var("n"), num(5)), Statement::break_(), None),
            ]),
        ),
        ret(var("n")),
    ];
    assert_eq!(exit_of(count_to_five), 5);

    let countdown = vec![
        local("n", num(10)),
        Statement::do_while(
            set("n", bin(BinaryOp::Subtract, var("n"), num(3))),
            bin(BinaryOp::GreaterThan, var("n"), num(0)),
        ),
        ret(var("n")),
    ];
    assert_eq!(exit_of(countdown), -2);
}

fn switch_on(x: i64) -> i64 {
    exit_of(vec![
        local("x", num(x)),
        local("r", num(0)),
        Statement::switch(
            var("x"),
            Statement::compound(vec![
                Statement::case(1, set("r", num(10))),
                Statement::break_(),
                Statement::case(2, set("r", num(20))),
                Statement::case(3, Statement::expr(Expression::compound_assign(
                    BinaryOp::Add,
                    var("r"),
                    num(3),
                ))),
                Statement::break_(),
                local("t", num(0)),
                Statement::case(4, set("t", num(40))),
                set("r", var("t")),
                Statement::break_(),
                Statement::default(set("r", num(-1))),
            ]),
        ),
        ret(var("r")),
    ])
}

#[test]
fn switch_dispatch_fallthrough_and_default() {
    assert_eq!(switch_on(1), 10);
    assert_eq!(switch_on(2), 23);
    assert_eq!(switch_on(3), 3);
    assert_eq!(switch_on(4), 40);
    assert_eq!(switch_on(9), -1);
}

#[test]
fn pointers_and_arrays() {
    let int_ptr = CType::pointer_to(int());
    let p = || Expression::ident("p", int_ptr.clone());
    let arr = || Expression::ident("arr", CType::array_of(int(), 3));
    let body = vec![
        Statement::declare(vec![Declaration::new("arr", CType::array_of(int(), 3))
            .init_list(vec![num(1), num(2), num(3)])]),
        Statement::declare(vec![Declaration::new("p", int_ptr.clone()).init(arr())]),
        Statement::expr(Expression::unary(UnaryOp::PostIncrement, p())),
        Statement::expr(Expression::assign(Expression::unary(UnaryOp::Deref, p()), num(20))),
        ret(bin(
            BinaryOp::Add,
            bin(
                BinaryOp::Add,
                Expression::subscript(arr(), num(0)),
                Expression::subscript(arr(), num(1)),
            ),
            bin(
                BinaryOp::Add,
                Expression::unary(UnaryOp::Deref, bin(BinaryOp::Add, p(), num(1))),
                Expression::cast(
                    bin(
                        BinaryOp::Subtract,
                        Expression::unary(UnaryOp::AddressOf, Expression::subscript(arr(), num(2))),
                        Expression::unary(UnaryOp::AddressOf, Expression::subscript(arr(), num(0))),
                    ),
                    int(),
                ),
            ),
        )),
    ];
    assert_eq!(exit_of(body), 1 + 20 + 3 + 2);
}

#[test]
fn strings_and_character_arrays() {
    let body = vec![
        Statement::declare(vec![Declaration::new("s", CType::array_of(CType::char(), 0))
            .init(Expression::string("abc"))]),
        ret(bin(
            BinaryOp::Add,
            Expression::subscript(Expression::ident("s", CType::array_of(CType::char(), 4)), num(1)),
            Expression::subscript(Expression::ident("s", CType::array_of(CType::char(), 4)), num(3)),
        )),
    ];
    assert_eq!(exit_of(body), b'b' as i64);

    let greeting = CType::pointer_to(CType::char());
    let program = unit(
        "greeting.c",
        vec![
            global(Declaration::new("g", greeting.clone()).init(Expression::string("hey"))),
            function(
                "main",
                &[],
                vec![ret(Expression::subscript(Expression::ident("g", greeting), num(2)))],
            ),
        ],
    );
    assert_eq!(exit_of_units(&[program]), b'y' as i64);
}

#[test]
fn write_system_call_reaches_stdout() {
    let program = unit(
        "hello.c",
        vec![function(
            "main",
            &[],
            vec![ret(Expression::syscall(
                4,
                vec![num(1), Expression::string("hi\n"), num(3)],
            ))],
        )],
    );
    let out = SharedBuffer::default();
    let mut vm = Vm::new(&build(&[program], &[]))
        .expect("loads")
        .with_stdout(out.clone());
    vm.run().expect("runs");
    assert_eq!(out.0.borrow().as_slice(), b"hi\n");
    assert_eq!(vm.exit_value(), Value::Int(3));
}

#[test]
fn exit_system_call_stops_the_program() {
    let body = vec![
        Statement::expr(Expression::syscall(0, vec![num(9)])),
        ret(num(1)),
    ];
    let vm = run_program(&[unit("exit.c", vec![function("main", &[], body)])]);
    assert!(vm.cpu.halted);
    assert_eq!(vm.exit_value(), Value::Int(9));
}

#[test]
fn static_locals_persist_across_calls() {
    let program = unit(
        "counter.c",
        vec![
            function(
                "next",
                &[],
                vec![
                    Statement::declare(vec![Declaration::new("n", int())
                        .storage(StorageClass::Static)
                        .init(num(0))]),
                    set("n", bin(BinaryOp::Add, var("n"), num(1))),
                    ret(var("n")),
                ],
            ),
            function(
                "main",
                &[],
                vec![
                    Statement::expr(call("next", vec![])),
                    Statement::expr(call("next", vec![])),
                    ret(call("next", vec![])),
                ],
            ),
        ],
    );
    assert_eq!(exit_of_units(&[program]), 3);
}

#[test]
fn globals_floats_and_unsigned_wraparound() {
    let program = unit(
        "mixed.c",
        vec![
            global(Declaration::new("base", int()).init(num(40))),
            function(
                "main",
                &[],
                vec![
                    Statement::declare(vec![Declaration::new("half", CType::Double).init(Expression::float(1.5))]),
                    Statement::declare(vec![
                        Declaration::new("u", CType::unsigned_int()).init(num(0))
                    ]),
                    Statement::expr(Expression::assign(
                        Expression::ident("u", CType::unsigned_int()),
                        bin(BinaryOp::Subtract, Expression::ident("u", CType::unsigned_int()), num(1)),
                    )),
                    ret(bin(
                        BinaryOp::Add,
                        bin(
                            BinaryOp::Add,
                            var("base"),
                            Expression::cast(
                                bin(
                                    BinaryOp::Multiply,
                                    Expression::ident("half", CType::Double),
                                    Expression::float(4.0),
                                ),
                                int(),
                            ),
                        ),
                        bin(
                            BinaryOp::Equal,
                            Expression::ident("u", CType::unsigned_int()),
                            Expression::constant(u32::MAX as i64, CType::unsigned_int()),
                        ),
                    )),
                ],
            ),
        ],
    );
    assert_eq!(exit_of_units(&[program]), 40 + 6 + 1);
}

#[test]
fn unsigned_negation_wraps() {
    let unsigned = CType::unsigned_int;
    let x = || Expression::ident("x", unsigned());
    let negated = || Expression::unary(UnaryOp::Negate, x());
    let declare_x = || {
        Statement::declare(vec![
            Declaration::new("x", unsigned()).init(Expression::constant(1, unsigned()))
        ])
    };

    assert_eq!(
        exit_of(vec![
            declare_x(),
            ret(bin(
                BinaryOp::GreaterThan,
                negated(),
                Expression::constant(5, unsigned()),
            )),
        ]),
        1
    );
    assert_eq!(
        exit_of(vec![
            declare_x(),
            Statement::declare(vec![Declaration::new("y", unsigned()).init(negated())]),
            ret(bin(
                BinaryOp::Equal,
                Expression::ident("y", unsigned()),
                Expression::constant(u32::MAX as i64, unsigned()),
            )),
        ]),
        1
    );
    assert_eq!(
        exit_of(vec![
            local("s", num(1)),
            ret(bin(
                BinaryOp::LessThan,
                Expression::unary(UnaryOp::Negate, var("s")),
                num(0),
            )),
        ]),
        1
    );
}

#[test]
fn conditional_expression_picks_one_branch() {
    let pick = |x| {
        exit_of(vec![
            local("x", num(x)),
            ret(Expression::conditional(
                bin(BinaryOp::GreaterThan, var("x"), num(3)),
                num(10),
                num(20),
            )),
        ])
    };
    assert_eq!(pick(5), 10);
    assert_eq!(pick(1), 20);
}

#[test]
fn archives_supply_only_what_is_needed() {
    let library = unit(
        "lib.c",
        vec![
            function("triple", &["x"], vec![ret(bin(BinaryOp::Multiply, var("x"), num(3)))]),
            function("unused", &[], vec![ret(num(0))]),
        ],
    );
    let archive = linker::library(vec![compiler::unit(&library).expect("compiles")]);
    let archive = Archive::from_bytes(&archive.to_bytes().expect("serializes")).expect("decodes");

    let program = unit(
        "main.c",
        vec![
            prototype("triple", 1),
            function("main", &[], vec![ret(call("triple", vec![num(5)]))]),
        ],
    );
    let exe = build(&[program], &[archive]);
    assert!(exe.find_symbol("triple").is_some());
    assert!(exe.find_symbol("unused").is_none());

    let mut vm = Vm::new(&exe).expect("loads");
    vm.run().expect("runs");
    assert_eq!(vm.exit_value(), Value::Int(15));
}

#[test]
fn runtime_errors_point_at_source() {
    let body = vec![
        local("zero", num(0)),
        ret(bin(BinaryOp::Divide, num(1), var("zero")).at(Location::new("div.c", 3, 12))),
    ];
    let exe = build(&[unit("div.c", vec![function("main", &[], body)])], &[]);
    let mut vm = Vm::new(&exe).expect("loads");
    let err = vm.run().expect_err("divides by zero");
    assert!(matches!(err.inner, InnerEvalError::DivisionByZero));
    let user = err.into_user(&vm.image);
    assert_eq!(user.location, Some(Location::new("div.c", 3, 12)));
}

#[test]
fn executables_survive_serialization() {
    let exe = build(
        &[unit("main.c", vec![function("main", &[], vec![ret(num(5))])])],
        &[],
    );
    let restored = Executable::from_bytes(&exe.to_bytes().expect("serializes")).expect("decodes");
    assert_eq!(restored, exe);
    let mut vm = Vm::new(&restored).expect("loads");
    vm.run().expect("runs");
    assert_eq!(vm.exit_value(), Value::Int(5));
}
