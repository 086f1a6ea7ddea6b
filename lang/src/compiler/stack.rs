use std::collections::{BTreeMap, BTreeSet};

use crate::{bytecode::WordIndex, ctype::CType, source::Location};

/// Compile-time model of the runtime stack pointer, as an offset from the
/// base pointer. Zero on function entry; allocations make it more negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stack {
    offset: i64,
}

impl Stack {
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Reserves `cells` and returns the bp-relative offset of the lowest one.
    pub fn allocate(&mut self, cells: usize) -> i64 {
        self.offset -= cells as i64;
        self.offset + 1
    }

    /// Argument for the `Allocate` that moves the stack from here back to
    /// `target`.
    pub fn adjustment_to(&self, target: i64) -> i64 {
        self.offset - target
    }

    pub fn restore(&mut self, target: i64) {
        self.offset = target;
    }
}

/// A jump destination together with the stack offset it expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub marker: WordIndex,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct PendingGoto {
    pub allocate: WordIndex,
    pub jump: WordIndex,
    pub offset: i64,
    pub location: Location,
}

#[derive(Debug, Clone, Default)]
pub struct SwitchFrame {
    pub cases: Vec<(i64, Target)>,
    pub default: Option<Target>,
    seen: BTreeSet<i64>,
}

impl SwitchFrame {
    /// Returns false if the value was already taken.
    pub fn add_case(&mut self, value: i64, target: Target) -> bool {
        if !self.seen.insert(value) {
            return false;
        }
        self.cases.push((value, target));
        true
    }
}

/// Per-function state threaded through statement generation.
#[derive(Debug, Clone)]
pub struct ControlContext {
    pub function: String,
    pub return_type: CType,
    pub stack: Stack,
    pub breaks: Vec<Target>,
    pub continues: Vec<Target>,
    pub switches: Vec<SwitchFrame>,
    pub labels: BTreeMap<String, Target>,
    pub gotos: BTreeMap<String, Vec<PendingGoto>>,
    pub statics: usize,
}

impl ControlContext {
    pub fn new(function: &str, return_type: CType) -> Self {
        Self {
            function: function.to_owned(),
            return_type,
            stack: Stack::default(),
            breaks: vec![],
            continues: vec![],
            switches: vec![],
            labels: BTreeMap::new(),
            gotos: BTreeMap::new(),
            statics: 0,
        }
    }

    pub fn target(&self, marker: WordIndex) -> Target {
        Target {
            marker,
            offset: self.stack.offset(),
        }
    }
}
