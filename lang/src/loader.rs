use std::collections::BTreeMap;

use typed_index_collections::TiVec;

use crate::{
    bytecode::{Address, Datum, Executable, InnerWord, Opcode, SymbolIndex, Value, WordIndex},
    source::Location,
    vm::{AddressOverflow, Memory},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("At {location}, symbol {name} has no cells")]
    EmptySymbol { location: Location, name: String },
    #[error("At {location}, no such symbol {symbol:?}")]
    UnknownSymbol {
        location: Location,
        symbol: SymbolIndex,
    },
    #[error("At {location}, word {word:?} was never placed")]
    UnplacedWord { location: Location, word: WordIndex },
    #[error("At {location}, jump target was never patched")]
    UnpatchedAddress { location: Location },
    #[error("At {location}, reference to {name} was never linked")]
    UnlinkedReference { location: Location, name: String },
    #[error("At {location}, {inner}")]
    OutOfAddressSpace {
        location: Location,
        inner: AddressOverflow,
    },
}

/// Where everything landed in memory.
#[derive(Debug, Clone, Default)]
pub struct Image {
    pub addresses: TiVec<WordIndex, i64>,
    pub symbols: BTreeMap<String, i64>,
    pub entry: Option<i64>,
    pub heap_start: i64,
    /// One past the trailing `Halt`.
    pub end: i64,
    pub debug: BTreeMap<i64, Location>,
}

impl Image {
    pub fn symbol(&self, name: &str) -> Option<i64> {
        self.symbols.get(name).copied()
    }

    /// Source location of the word starting at `address`.
    pub fn location(&self, address: i64) -> Option<&Location> {
        self.debug.get(&address)
    }
}

/// Places the executable from address 0 and encodes it into `memory`.
pub fn load(exe: &Executable, memory: &mut Memory) -> Result<Image, Error> {
    let mut addresses: TiVec<WordIndex, i64> = TiVec::new();
    let mut next = 0i64;
    for word in exe.words.iter() {
        addresses.push(next);
        next += word.footprint() as i64;
    }
    let halt = next;

    let first_cells: TiVec<SymbolIndex, Option<i64>> = exe
        .symbols
        .iter()
        .map(|s| s.body.first().and_then(|w| addresses.get(*w)).copied())
        .collect();

    let resolve = |address: &Address, location: &Location| -> Result<i64, Error> {
        match address {
            Address::Word(w) => addresses.get(*w).copied().ok_or_else(|| Error::UnplacedWord {
                location: location.clone(),
                word: *w,
            }),
            Address::Symbol(s) => match first_cells.get(*s) {
                Some(Some(at)) => Ok(*at),
                Some(None) => Err(Error::EmptySymbol {
                    location: location.clone(),
                    name: exe.symbols[*s].name.clone(),
                }),
                None => Err(Error::UnknownSymbol {
                    location: location.clone(),
                    symbol: *s,
                }),
            },
            Address::Unset => Err(Error::UnpatchedAddress {
                location: location.clone(),
            }),
            Address::Reference(name) => Err(Error::UnlinkedReference {
                location: location.clone(),
                name: name.clone(),
            }),
        }
    };

    let mut debug = BTreeMap::new();
    for (idx, word) in exe.words.iter_enumerated() {
        let at = addresses[idx];
        let cells = match &word.inner {
            InnerWord::Instruction(instruction) => {
                instruction.encode(at, |a| resolve(a, &word.location))?
            }
            InnerWord::Datum(Datum::Value(v)) => vec![*v],
            InnerWord::Datum(Datum::Address(a)) => vec![Value::Int(resolve(a, &word.location)?)],
        };
        memory
            .write_all(at, &cells)
            .map_err(|inner| Error::OutOfAddressSpace {
                location: word.location.clone(),
                inner,
            })?;
        debug.insert(at, word.location.clone());
    }
    memory.write(halt, Value::Int(Opcode::Halt.id()));

    let symbols = exe
        .symbols
        .iter_enumerated()
        .filter_map(|(idx, s)| first_cells[idx].map(|at| (s.name.clone(), at)))
        .collect();
    let entry = exe.entry.and_then(|e| first_cells.get(e).copied().flatten());
    let heap_start = match exe.heap_start {
        Some(w) => addresses.get(w).copied().ok_or_else(|| Error::UnplacedWord {
            location: Location::generated("<start>"),
            word: w,
        })?,
        None => halt + 1,
    };

    Ok(Image {
        addresses,
        symbols,
        entry,
        heap_start,
        end: halt + 1,
        debug,
    })
}
