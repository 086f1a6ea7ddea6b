use std::{
    collections::{BTreeMap, VecDeque},
    path::{Path, PathBuf},
};

use itertools::Itertools;
use typed_index_collections::TiVec;

use crate::{
    bytecode::{
        Address, Archive, Datum, Executable, Instruction, Object, StorageClass, Symbol,
        SymbolIndex, SymbolKind, Value, Word, WordIndex,
    },
    source::Location,
};

/// Data symbol holding the next free heap address.
pub const HEAP_POINTER: &str = "__heap_ptr__";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("At {location}, undefined symbol {name}")]
    UndefinedSymbol { location: Location, name: String },
    #[error("At {location}, {name:?} already defined")]
    AlreadyDefined { location: Location, name: String },
    #[error("At {location}, tentative declaration of {name} needs {tentative} cells but its definition has {defined}")]
    TentativeConflict {
        location: Location,
        name: String,
        tentative: usize,
        defined: usize,
    },
    #[error("At {location}, {name} refers to a word outside its own body")]
    DanglingWord { location: Location, name: String },
    #[error("could not access archive {path:?}: {source}")]
    ArchiveIo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not decode archive {path:?}: {source}")]
    ArchiveDecode {
        path: PathBuf,
        source: postcard::Error,
    },
}

/// Symbols merged from objects and archives, every reference resolved.
#[derive(Debug, Clone, Default)]
pub struct Linked {
    pub words: TiVec<WordIndex, Word>,
    pub symbols: TiVec<SymbolIndex, Symbol>,
    pub index: BTreeMap<String, SymbolIndex>,
}

#[derive(Debug, Default)]
pub struct Linker {
    words: TiVec<WordIndex, Word>,
    symbols: TiVec<SymbolIndex, Symbol>,
    index: BTreeMap<String, SymbolIndex>,
    /// First referencing site of every name seen so far.
    references: BTreeMap<String, Location>,
    worklist: VecDeque<String>,
}

impl Linker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `name` as needed even if nothing references it.
    pub fn require(&mut self, name: &str, location: Location) {
        self.note_reference(name, &location);
    }

    fn note_reference(&mut self, name: &str, location: &Location) {
        if !self.references.contains_key(name) {
            self.references.insert(name.to_owned(), location.clone());
            self.worklist.push_back(name.to_owned());
        }
    }

    pub fn add_object(&mut self, object: &Object) -> Result<(), Error> {
        for symbol_idx in object.symbols.keys() {
            self.import(object, symbol_idx)?;
        }
        Ok(())
    }

    /// Copies one symbol's body into the program, renumbering its words.
    fn import(&mut self, object: &Object, symbol_idx: SymbolIndex) -> Result<(), Error> {
        let symbol = &object.symbols[symbol_idx];
        if symbol.is_declaration() {
            return Ok(());
        }
        let dangling = || Error::DanglingWord {
            location: symbol.location.clone(),
            name: symbol.name.clone(),
        };

        let mut remap = BTreeMap::new();
        for old in &symbol.body {
            let word = object.words.get(*old).ok_or_else(dangling)?;
            remap.insert(*old, self.words.push_and_get_key(word.clone()));
        }
        let body: Vec<WordIndex> = symbol.body.iter().map(|old| remap[old]).collect();

        let mut referenced = vec![];
        for new in &body {
            let word = &mut self.words[*new];
            let location = word.location.clone();
            for address in word.addresses_mut() {
                match address {
                    Address::Word(old) => {
                        *address = Address::Word(*remap.get(old).ok_or_else(dangling)?);
                    }
                    Address::Reference(name) => referenced.push((name.clone(), location.clone())),
                    Address::Symbol(_) | Address::Unset => {}
                }
            }
        }
        for (name, location) in referenced {
            self.note_reference(&name, &location);
        }

        self.insert(Symbol {
            body,
            ..symbol.clone()
        })
    }

    fn insert(&mut self, symbol: Symbol) -> Result<(), Error> {
        let Some(&existing_idx) = self.index.get(&symbol.name) else {
            let name = symbol.name.clone();
            let idx = self.symbols.push_and_get_key(symbol);
            self.index.insert(name, idx);
            return Ok(());
        };
        let existing = &mut self.symbols[existing_idx];
        match (existing.is_tentative(), symbol.is_tentative()) {
            (true, true) => {
                existing.size = existing.size.max(symbol.size);
            }
            (false, true) => {
                if symbol.size > existing.size {
                    return Err(Error::TentativeConflict {
                        location: symbol.location,
                        name: symbol.name,
                        tentative: symbol.size,
                        defined: existing.size,
                    });
                }
            }
            (true, false) => {
                if existing.size > symbol.size {
                    return Err(Error::TentativeConflict {
                        location: symbol.location,
                        name: symbol.name,
                        tentative: existing.size,
                        defined: symbol.size,
                    });
                }
                *existing = symbol;
            }
            (false, false) => {
                return Err(Error::AlreadyDefined {
                    location: symbol.location,
                    name: symbol.name,
                });
            }
        }
        Ok(())
    }

    /// Pulls every still-missing name out of the archives, in order.
    pub fn resolve(&mut self, archives: &[Archive]) -> Result<(), Error> {
        while let Some(name) = self.worklist.pop_front() {
            if self.index.contains_key(&name) {
                continue;
            }
            match archives.iter().find_map(|a| a.find(&name)) {
                Some((object, symbol_idx)) => self.import(object, symbol_idx)?,
                None => {
                    return Err(Error::UndefinedSymbol {
                        location: self.references.get(&name).cloned().unwrap_or_default(),
                        name,
                    })
                }
            }
        }
        Ok(())
    }

    /// Rewrites every named reference to its symbol handle.
    pub fn finish(mut self) -> Result<Linked, Error> {
        for word in self.words.iter_mut() {
            let location = word.location.clone();
            for address in word.addresses_mut() {
                if let Address::Reference(name) = address {
                    let Some(idx) = self.index.get(name.as_str()) else {
                        return Err(Error::UndefinedSymbol {
                            location,
                            name: name.clone(),
                        });
                    };
                    *address = Address::Symbol(*idx);
                }
            }
        }
        Ok(Linked {
            words: self.words,
            symbols: self.symbols,
            index: self.index,
        })
    }
}

/// Merges objects, pulling missing symbols from the archives.
pub fn link(objects: &[Object], archives: &[Archive]) -> Result<Linked, Error> {
    let mut linker = Linker::new();
    for object in objects {
        linker.add_object(object)?;
    }
    linker.resolve(archives)?;
    linker.finish()
}

/// Links a complete program that starts at `entry`, wrapped in the start-up
/// and shutdown code.
pub fn executable(objects: &[Object], archives: &[Archive], entry: &str) -> Result<Executable, Error> {
    let start = Location::generated("<start>");
    let mut linker = Linker::new();
    let heap_cell = linker
        .words
        .push_and_get_key(Word::datum(Datum::Value(Value::Int(0)), start.clone()));
    linker.insert(Symbol {
        name: HEAP_POINTER.to_owned(),
        body: vec![heap_cell],
        size: 1,
        storage_class: StorageClass::Unspecified,
        kind: SymbolKind::Data,
        location: start.clone(),
    })?;
    linker.require(entry, start.clone());
    for object in objects {
        linker.add_object(object)?;
    }
    linker.resolve(archives)?;
    let linked = linker.finish()?;
    layout(linked, entry)
}

fn layout(linked: Linked, entry: &str) -> Result<Executable, Error> {
    let start = Location::generated("<start>");
    let Some(&entry_idx) = linked.index.get(entry) else {
        return Err(Error::UndefinedSymbol {
            location: start,
            name: entry.to_owned(),
        });
    };
    let heap_idx = linked.index.get(HEAP_POINTER).copied();

    let mut words: TiVec<WordIndex, Word> = TiVec::new();
    let emit = |words: &mut TiVec<WordIndex, Word>, instruction: Instruction| {
        words.push_and_get_key(Word::instruction(instruction, start.clone()))
    };

    let mut placeholders = vec![];
    if let Some(heap_idx) = heap_idx {
        placeholders.push(emit(&mut words, Instruction::push_address(Address::Unset)));
        emit(&mut words, Instruction::push_address(Address::Symbol(heap_idx)));
        emit(&mut words, Instruction::Set(1));
        emit(&mut words, Instruction::Allocate(-1));
    }
    emit(&mut words, Instruction::push_int(0));
    emit(&mut words, Instruction::PushFrame);
    emit(&mut words, Instruction::LoadStackPointer);
    emit(&mut words, Instruction::push_int(1));
    emit(&mut words, Instruction::Add);
    let return_address = emit(&mut words, Instruction::push_address(Address::Unset));
    emit(&mut words, Instruction::LoadStackPointer);
    emit(&mut words, Instruction::SetBaseStackPointer);
    emit(&mut words, Instruction::RelativeJump(Address::Symbol(entry_idx)));

    let mut symbols = linked.symbols.clone();
    let mut remap = BTreeMap::new();
    for (idx, symbol) in linked.symbols.iter_enumerated() {
        if symbol.is_tentative() {
            continue;
        }
        let body = symbol
            .body
            .iter()
            .map(|old| {
                let new = words.push_and_get_key(linked.words[*old].clone());
                remap.insert(*old, new);
                new
            })
            .collect_vec();
        symbols[idx].body = body;
    }
    for new in remap.values() {
        let word = &mut words[*new];
        let location = word.location.clone();
        for address in word.addresses_mut() {
            if let Address::Word(old) = address {
                let Some(moved) = remap.get(old) else {
                    return Err(Error::DanglingWord {
                        location,
                        name: entry.to_owned(),
                    });
                };
                *address = Address::Word(*moved);
            }
        }
    }

    for symbol in symbols.iter_mut().filter(|s| s.is_tentative()) {
        symbol.body = (0..symbol.size)
            .map(|_| {
                words.push_and_get_key(Word::datum(
                    Datum::Value(Value::Int(0)),
                    symbol.location.clone(),
                ))
            })
            .collect();
    }

    let clean = emit(&mut words, Instruction::Pass);
    emit(&mut words, Instruction::PopFrame);
    emit(&mut words, Instruction::Allocate(-1));
    emit(&mut words, Instruction::Halt);
    let heap_start = words.push_and_get_key(Word::datum(Datum::Value(Value::Int(0)), start.clone()));

    words[return_address] = Word::instruction(
        Instruction::push_address(Address::Word(clean)),
        start.clone(),
    );
    for placeholder in placeholders {
        words[placeholder] = Word::instruction(
            Instruction::push_address(Address::Word(heap_start)),
            start.clone(),
        );
    }

    Ok(Executable {
        words,
        symbols,
        entry: Some(entry_idx),
        heap_start: Some(heap_start),
    })
}

/// Lays out a bare instruction sequence as a program of its own, ending in
/// `Halt`. Useful for running generated snippets in isolation.
pub fn assemble(arena: &TiVec<WordIndex, Word>, sequence: &[WordIndex]) -> Result<Executable, Error> {
    let snippet = Location::generated("<snippet>");
    let mut words: TiVec<WordIndex, Word> = TiVec::new();
    let mut remap = BTreeMap::new();
    for old in sequence {
        let word = arena.get(*old).ok_or_else(|| Error::DanglingWord {
            location: snippet.clone(),
            name: "<snippet>".to_owned(),
        })?;
        remap.insert(*old, words.push_and_get_key(word.clone()));
    }
    for word in words.iter_mut() {
        let location = word.location.clone();
        for address in word.addresses_mut() {
            if let Address::Word(old) = address {
                let Some(moved) = remap.get(old) else {
                    return Err(Error::DanglingWord {
                        location,
                        name: "<snippet>".to_owned(),
                    });
                };
                *address = Address::Word(*moved);
            }
        }
    }
    words.push(Word::instruction(Instruction::Halt, snippet));
    Ok(Executable {
        words,
        ..Executable::default()
    })
}

/// Bundles objects into an archive.
pub fn library(objects: Vec<Object>) -> Archive {
    Archive::new(objects)
}

pub fn read_archive(path: &Path) -> Result<Archive, Error> {
    let bytes = std::fs::read(path).map_err(|source| Error::ArchiveIo {
        path: path.to_owned(),
        source,
    })?;
    Archive::from_bytes(&bytes).map_err(|source| Error::ArchiveDecode {
        path: path.to_owned(),
        source,
    })
}
