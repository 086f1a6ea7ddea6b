use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use typed_index_collections::TiVec;

use crate::source::Location;

use super::{Address, SymbolIndex, Word, WordIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolKind {
    Code,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StorageClass {
    #[default]
    Unspecified,
    Static,
    Extern,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub body: Vec<WordIndex>,
    /// Size in cells. Code symbols report their footprint.
    pub size: usize,
    pub storage_class: StorageClass,
    pub kind: SymbolKind,
    pub location: Location,
}

impl Symbol {
    /// `int x;` at file scope: storage requested, nothing defined yet.
    pub fn is_tentative(&self) -> bool {
        self.kind == SymbolKind::Data
            && self.body.is_empty()
            && self.storage_class == StorageClass::Unspecified
    }

    /// `extern` declarations and prototypes name a symbol without providing it.
    pub fn is_declaration(&self) -> bool {
        self.storage_class == StorageClass::Extern
            || (self.kind == SymbolKind::Code && self.body.is_empty())
    }

    pub fn is_definition(&self) -> bool {
        !self.is_tentative() && !self.is_declaration()
    }
}

/// The output of compiling one translation unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Object {
    pub name: String,
    pub words: TiVec<WordIndex, Word>,
    pub symbols: TiVec<SymbolIndex, Symbol>,
}

impl Object {
    pub fn find_symbol(&self, name: &str) -> Option<SymbolIndex> {
        self.symbols
            .iter_enumerated()
            .find_map(|(i, s)| if s.name == name && !s.is_declaration() { Some(i) } else { None })
    }
}

#[derive(Serialize, Deserialize)]
struct ObjectSerde {
    name: String,
    words: Vec<Word>,
    symbols: Vec<Symbol>,
}

impl Serialize for Object {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let serde_repr = ObjectSerde {
            name: self.name.clone(),
            words: self.words.iter().cloned().collect(),
            symbols: self.symbols.iter().cloned().collect(),
        };
        serde_repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Object {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let serde_repr = ObjectSerde::deserialize(deserializer)?;
        Ok(Object {
            name: serde_repr.name,
            words: serde_repr.words.into_iter().collect(),
            symbols: serde_repr.symbols.into_iter().collect(),
        })
    }
}

/// A library of objects with an eagerly built name index.
#[derive(Debug, Clone, Default)]
pub struct Archive {
    pub objects: Vec<Object>,
    index: BTreeMap<String, (usize, SymbolIndex)>,
}

impl Archive {
    pub fn new(objects: Vec<Object>) -> Self {
        let mut index = BTreeMap::new();
        for (object_idx, object) in objects.iter().enumerate() {
            for (symbol_idx, symbol) in object.symbols.iter_enumerated() {
                if symbol.is_declaration() {
                    continue;
                }
                index
                    .entry(symbol.name.clone())
                    .or_insert((object_idx, symbol_idx));
            }
        }
        Archive { objects, index }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn find(&self, name: &str) -> Option<(&Object, SymbolIndex)> {
        let (object_idx, symbol_idx) = self.index.get(name)?;
        Some((&self.objects[*object_idx], *symbol_idx))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

#[derive(Serialize, Deserialize)]
struct ArchiveSerde {
    objects: Vec<Object>,
}

impl Serialize for Archive {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let serde_repr = ArchiveSerde {
            objects: self.objects.clone(),
        };
        serde_repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Archive {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let serde_repr = ArchiveSerde::deserialize(deserializer)?;
        Ok(Archive::new(serde_repr.objects))
    }
}

/// A fully linked program. `words` is in layout order: the loader places
/// them consecutively from address 0.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Executable {
    pub words: TiVec<WordIndex, Word>,
    pub symbols: TiVec<SymbolIndex, Symbol>,
    pub entry: Option<SymbolIndex>,
    /// The cell whose address is the start of the heap.
    pub heap_start: Option<WordIndex>,
}

impl Executable {
    pub fn find_symbol(&self, name: &str) -> Option<SymbolIndex> {
        self.symbols
            .iter_enumerated()
            .find_map(|(i, s)| if s.name == name { Some(i) } else { None })
    }

    /// Names of references the linker left behind, if any.
    pub fn unlinked(&self) -> Vec<&str> {
        self.words
            .iter()
            .flat_map(|w| w.addresses())
            .filter_map(|a| match a {
                Address::Reference(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

#[derive(Serialize, Deserialize)]
struct ExecutableSerde {
    words: Vec<Word>,
    symbols: Vec<Symbol>,
    entry: Option<SymbolIndex>,
    heap_start: Option<WordIndex>,
}

impl Serialize for Executable {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let serde_repr = ExecutableSerde {
            words: self.words.iter().cloned().collect(),
            symbols: self.symbols.iter().cloned().collect(),
            entry: self.entry,
            heap_start: self.heap_start,
        };
        serde_repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Executable {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let serde_repr = ExecutableSerde::deserialize(deserializer)?;
        Ok(Executable {
            words: serde_repr.words.into_iter().collect(),
            symbols: serde_repr.symbols.into_iter().collect(),
            entry: serde_repr.entry,
            heap_start: serde_repr.heap_start,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Datum, Instruction, Value};

    fn data(name: &str, body: Vec<WordIndex>, storage_class: StorageClass) -> Symbol {
        Symbol {
            name: name.to_owned(),
            size: body.len().max(1),
            body,
            storage_class,
            kind: SymbolKind::Data,
            location: Location::default(),
        }
    }

    #[test]
    fn symbol_classification() {
        let tentative = data("x", vec![], StorageClass::Unspecified);
        assert!(tentative.is_tentative());
        assert!(!tentative.is_definition());

        let external = data("x", vec![], StorageClass::Extern);
        assert!(external.is_declaration());

        let defined = data("x", vec![WordIndex::from(0)], StorageClass::Unspecified);
        assert!(defined.is_definition());

        let prototype = Symbol {
            kind: SymbolKind::Code,
            ..data("f", vec![], StorageClass::Unspecified)
        };
        assert!(prototype.is_declaration());
        assert!(!prototype.is_tentative());
    }

    #[test]
    fn archive_survives_serialization_and_reindexes() {
        let mut object = Object {
            name: "lib".to_owned(),
            ..Object::default()
        };
        let w = object.words.push_and_get_key(Word::datum(
            Datum::Value(Value::Int(42)),
            Location::default(),
        ));
        object
            .symbols
            .push(data("answer", vec![w], StorageClass::Unspecified));
        object
            .symbols
            .push(data("elsewhere", vec![], StorageClass::Extern));
        object.words.push(Word::instruction(Instruction::Halt, Location::default()));

        let archive = Archive::new(vec![object]);
        let bytes = archive.to_bytes().expect("serializes");
        let restored = Archive::from_bytes(&bytes).expect("deserializes");

        assert!(restored.contains("answer"));
        assert!(!restored.contains("elsewhere"));
        let (obj, sym) = restored.find("answer").expect("indexed");
        assert_eq!(obj.symbols[sym].body, vec![w]);
        assert_eq!(restored.objects, archive.objects);
    }
}
