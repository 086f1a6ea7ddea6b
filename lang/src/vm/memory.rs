use std::collections::BTreeMap;

use crate::bytecode::Value;

use super::{ConversionError, InnerEvalError};

#[derive(Debug, thiserror::Error)]
#[error("address {base} + {offset} is outside the address space")]
pub struct AddressOverflow {
    pub base: i64,
    pub offset: i64,
}

/// The cell `offset` past `base`.
pub fn address_at(base: i64, offset: i64) -> Result<i64, AddressOverflow> {
    base.checked_add(offset).ok_or(AddressOverflow { base, offset })
}

/// Sparse, signed address space. Cells that were never written read as
/// integer zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Memory {
    cells: BTreeMap<i64, Value>,
}

impl Memory {
    pub fn read(&self, address: i64) -> Value {
        self.cells.get(&address).copied().unwrap_or_default()
    }

    pub fn read_int(&self, address: i64) -> Result<i64, ConversionError> {
        self.read(address).try_into()
    }

    pub fn write(&mut self, address: i64, value: Value) {
        self.cells.insert(address, value);
    }

    pub fn write_all(&mut self, start: i64, values: &[Value]) -> Result<(), AddressOverflow> {
        for (i, value) in values.iter().enumerate() {
            self.write(address_at(start, i as i64)?, *value);
        }
        Ok(())
    }

    /// Reads a NUL-terminated string stored one character per cell.
    pub fn read_string(&self, address: i64, limit: usize) -> Result<String, InnerEvalError> {
        let mut out = String::new();
        for i in 0..limit as i64 {
            let c = self.read_int(address_at(address, i)?)?;
            if c == 0 {
                break;
            }
            out.push(char::from_u32(c as u32).unwrap_or(char::REPLACEMENT_CHARACTER));
        }
        Ok(out)
    }

    /// Written cells with addresses in `from..to`.
    pub fn range(&self, from: i64, to: i64) -> impl Iterator<Item = (i64, Value)> + '_ {
        self.cells.range(from..to).map(|(a, v)| (*a, *v))
    }
}
