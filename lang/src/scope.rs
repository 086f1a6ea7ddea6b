use std::collections::BTreeMap;

use crate::ctype::CType;

/// What an identifier refers to during code generation.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// A cell at `offset` from the base pointer.
    Local { offset: i64, ty: CType },
    /// A linked symbol, referred to by its link-time name.
    Global { symbol: String, ty: CType },
}

/// Chain of namespaces, innermost last. The outermost one is file scope.
#[derive(Debug, Clone)]
pub struct Scope {
    namespaces: Vec<BTreeMap<String, Binding>>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    pub fn new() -> Self {
        Self {
            namespaces: vec![BTreeMap::new()],
        }
    }

    pub fn push_scope(&mut self) {
        self.namespaces.push(BTreeMap::new());
    }

    pub fn pop_scope(&mut self) {
        if self.namespaces.len() > 1 {
            self.namespaces.pop();
        }
    }

    pub fn depth(&self) -> usize {
        self.namespaces.len()
    }

    pub fn define(&mut self, name: &str, binding: Binding) {
        if let Some(ns) = self.namespaces.last_mut() {
            ns.insert(name.to_owned(), binding);
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        self.namespaces.iter().rev().find_map(|ns| ns.get(name))
    }
}
