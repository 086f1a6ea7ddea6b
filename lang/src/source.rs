use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// A position in a source file, as reported by the front end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub line: usize,
    pub col: usize,
}

impl Location {
    pub fn new(file: impl Into<String>, line: usize, col: usize) -> Self {
        Self {
            file: file.into(),
            line,
            col,
        }
    }

    /// Location for words the toolchain synthesizes itself (start-up code, padding).
    pub fn generated(name: &str) -> Self {
        Self {
            file: name.to_owned(),
            line: 0,
            col: 0,
        }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.file.is_empty() {
            return write!(f, "<unknown>:{}:{}", self.line, self.col);
        }
        f.write_fmt(format_args!("{}:{}:{}", self.file, self.line, self.col))
    }
}
