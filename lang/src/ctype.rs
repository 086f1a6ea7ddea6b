//! The slice of the C type system the backend queries.
//!
//! Every scalar (integers of any width, floating types, pointers) occupies
//! exactly one memory cell; aggregates are measured in cells too.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IntegerKind {
    Char,
    Short,
    Int,
    Long,
    LongLong,
}

impl IntegerKind {
    pub fn bits(self) -> u32 {
        match self {
            IntegerKind::Char => 8,
            IntegerKind::Short => 16,
            IntegerKind::Int => 32,
            IntegerKind::Long | IntegerKind::LongLong => 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionType {
    pub ret: Box<CType>,
    pub params: Vec<CType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CType {
    Void,
    Integer { kind: IntegerKind, signed: bool },
    Float,
    Double,
    Pointer(Box<CType>),
    Array(Box<CType>, usize),
    Function(FunctionType),
}

impl CType {
    pub fn int() -> Self {
        CType::Integer {
            kind: IntegerKind::Int,
            signed: true,
        }
    }

    pub fn unsigned_int() -> Self {
        CType::Integer {
            kind: IntegerKind::Int,
            signed: false,
        }
    }

    pub fn char() -> Self {
        CType::Integer {
            kind: IntegerKind::Char,
            signed: true,
        }
    }

    pub fn long() -> Self {
        CType::Integer {
            kind: IntegerKind::Long,
            signed: true,
        }
    }

    pub fn pointer_to(ty: CType) -> Self {
        CType::Pointer(Box::new(ty))
    }

    pub fn array_of(ty: CType, len: usize) -> Self {
        CType::Array(Box::new(ty), len)
    }

    pub fn function(ret: CType, params: Vec<CType>) -> Self {
        CType::Function(FunctionType {
            ret: Box::new(ret),
            params,
        })
    }

    /// Size in memory cells.
    pub fn size(&self) -> usize {
        match self {
            CType::Void | CType::Function(_) => 0,
            CType::Integer { .. } | CType::Float | CType::Double | CType::Pointer(_) => 1,
            CType::Array(elem, len) => elem.size() * len,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, CType::Void)
    }

    pub fn is_integral(&self) -> bool {
        matches!(self, CType::Integer { .. })
    }

    pub fn is_floating(&self) -> bool {
        matches!(self, CType::Float | CType::Double)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, CType::Pointer(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, CType::Array(..))
    }

    pub fn is_function(&self) -> bool {
        matches!(self, CType::Function(_))
    }

    /// Comparisons on unsigned operands read the carry/borrow flag; pointers
    /// compare as unsigned addresses.
    pub fn is_unsigned(&self) -> bool {
        match self {
            CType::Integer { signed, .. } => !signed,
            CType::Pointer(_) => true,
            _ => false,
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            CType::Integer { kind, .. } => kind.bits(),
            _ => 64,
        }
    }

    /// Element type of a pointer or array.
    pub fn pointee(&self) -> Option<&CType> {
        match self {
            CType::Pointer(ty) | CType::Array(ty, _) => Some(ty),
            _ => None,
        }
    }

    pub fn function_type(&self) -> Option<&FunctionType> {
        match self {
            CType::Function(f) => Some(f),
            CType::Pointer(ty) => match ty.as_ref() {
                CType::Function(f) => Some(f),
                _ => None,
            },
            _ => None,
        }
    }

    /// Array-to-pointer and function-to-pointer conversion.
    pub fn decay(&self) -> CType {
        match self {
            CType::Array(elem, _) => CType::Pointer(elem.clone()),
            CType::Function(_) => CType::Pointer(Box::new(self.clone())),
            other => other.clone(),
        }
    }

    fn promote(&self) -> CType {
        match self {
            CType::Integer { kind, .. } if *kind < IntegerKind::Int => CType::int(),
            other => other.clone(),
        }
    }

    /// The usual arithmetic conversions. Pointers win over integers so that
    /// pointer comparisons stay unsigned.
    pub fn common(a: &CType, b: &CType) -> CType {
        let (a, b) = (a.decay(), b.decay());
        if a.is_pointer() {
            return a;
        }
        if b.is_pointer() {
            return b;
        }
        if matches!(a, CType::Double) || matches!(b, CType::Double) {
            return CType::Double;
        }
        if a.is_floating() || b.is_floating() {
            return CType::Float;
        }
        let (a, b) = (a.promote(), b.promote());
        match (&a, &b) {
            (
                CType::Integer {
                    kind: ka,
                    signed: sa,
                },
                CType::Integer {
                    kind: kb,
                    signed: sb,
                },
            ) => {
                if sa == sb {
                    return if ka >= kb { a.clone() } else { b.clone() };
                }
                let (unsigned_kind, signed_kind) = if *sa { (*kb, *ka) } else { (*ka, *kb) };
                if unsigned_kind >= signed_kind {
                    CType::Integer {
                        kind: unsigned_kind,
                        signed: false,
                    }
                } else if signed_kind.bits() > unsigned_kind.bits() {
                    CType::Integer {
                        kind: signed_kind,
                        signed: true,
                    }
                } else {
                    CType::Integer {
                        kind: signed_kind,
                        signed: false,
                    }
                }
            }
            _ => a.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_in_cells() {
        assert_eq!(CType::int().size(), 1);
        assert_eq!(CType::Double.size(), 1);
        assert_eq!(CType::array_of(CType::int(), 8).size(), 8);
        assert_eq!(CType::array_of(CType::array_of(CType::char(), 3), 5).size(), 15);
        assert_eq!(CType::Void.size(), 0);
    }

    #[test]
    fn common_type_follows_usual_conversions() {
        assert_eq!(CType::common(&CType::char(), &CType::char()), CType::int());
        assert_eq!(
            CType::common(&CType::int(), &CType::unsigned_int()),
            CType::unsigned_int()
        );
        assert_eq!(
            CType::common(&CType::long(), &CType::unsigned_int()),
            CType::long()
        );
        assert_eq!(CType::common(&CType::int(), &CType::Double), CType::Double);
        assert_eq!(CType::common(&CType::Float, &CType::int()), CType::Float);

        let ptr = CType::pointer_to(CType::int());
        assert_eq!(CType::common(&CType::int(), &ptr), ptr);
        assert!(CType::common(&ptr, &ptr).is_unsigned());
    }

    #[test]
    fn arrays_decay_to_pointers() {
        let arr = CType::array_of(CType::int(), 4);
        assert_eq!(arr.decay(), CType::pointer_to(CType::int()));
        assert_eq!(arr.pointee(), Some(&CType::int()));
    }
}
