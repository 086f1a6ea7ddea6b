use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{stderr, stdin, stdout, Read, Write},
};

use crate::bytecode::Value;

use super::{address_at, Cpu, InnerEvalError, Memory};

/// A system call. Arguments are popped with the last one on top, and exactly
/// one integer result is pushed.
pub type Handler = fn(&mut Cpu, &mut Memory, &mut Kernel) -> Result<(), InnerEvalError>;

pub const STDIN: i64 = 0;
pub const STDOUT: i64 = 1;
pub const STDERR: i64 = 2;

/// Longest path `open` will read out of memory.
const MAX_PATH: usize = 4096;

/// Host buffer size for `read` and `write`. A larger `read` returns short.
pub const MAX_TRANSFER: usize = 1 << 16;

/// The pre-registered table, in index order.
pub fn system_calls() -> Vec<Handler> {
    vec![exit, open, close, read, write]
}

pub fn system_call_name(index: i64) -> Option<&'static str> {
    ["exit", "open", "close", "read", "write"]
        .get(usize::try_from(index).ok()?)
        .copied()
}

pub enum Stream {
    Input(Box<dyn Read>),
    Output(Box<dyn Write>),
    File(File),
}

impl Stream {
    fn read(&mut self, buf: &mut [u8]) -> Option<std::io::Result<usize>> {
        match self {
            Stream::Input(r) => Some(r.read(buf)),
            Stream::File(f) => Some(f.read(buf)),
            Stream::Output(_) => None,
        }
    }

    fn write(&mut self, buf: &[u8]) -> Option<std::io::Result<()>> {
        match self {
            Stream::Output(w) => Some(w.write_all(buf)),
            Stream::File(f) => Some(f.write_all(buf)),
            Stream::Input(_) => None,
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Output(w) => w.flush(),
            Stream::File(f) => f.flush(),
            Stream::Input(_) => Ok(()),
        }
    }
}

/// Open handles and the exit status of the running program.
pub struct Kernel {
    streams: BTreeMap<i64, Stream>,
    next_handle: i64,
    pub exit_status: Option<i64>,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    pub fn new() -> Self {
        let mut streams = BTreeMap::new();
        streams.insert(STDIN, Stream::Input(Box::new(stdin())));
        streams.insert(STDOUT, Stream::Output(Box::new(stdout())));
        streams.insert(STDERR, Stream::Output(Box::new(stderr())));
        Kernel {
            streams,
            next_handle: STDERR + 1,
            exit_status: None,
        }
    }

    pub fn set_stream(&mut self, handle: i64, stream: Stream) {
        self.streams.insert(handle, stream);
    }

    pub fn is_open(&self, handle: i64) -> bool {
        self.streams.contains_key(&handle)
    }

    fn install(&mut self, stream: Stream) -> i64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.streams.insert(handle, stream);
        handle
    }

    /// Flushes and drops every open handle.
    pub fn release(&mut self) {
        for (_, mut stream) in std::mem::take(&mut self.streams) {
            // Nothing left to report a failed flush to.
            let _ = stream.flush();
        }
    }
}

fn exit(cpu: &mut Cpu, memory: &mut Memory, kernel: &mut Kernel) -> Result<(), InnerEvalError> {
    let status = cpu.pop_int(memory)?;
    kernel.exit_status = Some(status);
    cpu.halted = true;
    cpu.push(memory, Value::Int(0));
    Ok(())
}

fn open(cpu: &mut Cpu, memory: &mut Memory, kernel: &mut Kernel) -> Result<(), InnerEvalError> {
    let mode = cpu.pop_int(memory)?;
    let path = cpu.pop_int(memory)?;
    let path = memory.read_string(path, MAX_PATH)?;

    let mut options = OpenOptions::new();
    match mode {
        0 => options.read(true),
        1 => options.write(true).create(true).truncate(true),
        2 => options.append(true).create(true),
        _ => {
            cpu.push(memory, Value::Int(-1));
            return Ok(());
        }
    };
    let result = match options.open(&path) {
        Ok(file) => kernel.install(Stream::File(file)),
        Err(_) => -1,
    };
    cpu.push(memory, Value::Int(result));
    Ok(())
}

fn close(cpu: &mut Cpu, memory: &mut Memory, kernel: &mut Kernel) -> Result<(), InnerEvalError> {
    let handle = cpu.pop_int(memory)?;
    let result = match kernel.streams.remove(&handle) {
        Some(mut stream) => {
            stream.flush()?;
            0
        }
        None => -1,
    };
    cpu.push(memory, Value::Int(result));
    Ok(())
}

fn read(cpu: &mut Cpu, memory: &mut Memory, kernel: &mut Kernel) -> Result<(), InnerEvalError> {
    let count = cpu.pop_int(memory)?.clamp(0, MAX_TRANSFER as i64) as usize;
    let buffer = cpu.pop_int(memory)?;
    let handle = cpu.pop_int(memory)?;

    let mut bytes = vec![0u8; count];
    let result = match kernel.streams.get_mut(&handle).and_then(|s| s.read(&mut bytes)) {
        Some(n) => {
            let n = n?;
            let cells: Vec<Value> = bytes[..n].iter().map(|b| Value::Int(*b as i64)).collect();
            memory.write_all(buffer, &cells)?;
            n as i64
        }
        None => -1,
    };
    cpu.push(memory, Value::Int(result));
    Ok(())
}

fn write(cpu: &mut Cpu, memory: &mut Memory, kernel: &mut Kernel) -> Result<(), InnerEvalError> {
    let count = cpu.pop_int(memory)?.max(0);
    let buffer = cpu.pop_int(memory)?;
    let handle = cpu.pop_int(memory)?;

    let Some(stream) = kernel.streams.get_mut(&handle) else {
        cpu.push(memory, Value::Int(-1));
        return Ok(());
    };
    let mut bytes = Vec::with_capacity(MAX_TRANSFER.min(count as usize));
    let mut done = 0;
    while done < count {
        let chunk = (count - done).min(MAX_TRANSFER as i64);
        bytes.clear();
        for i in done..done + chunk {
            bytes.push(memory.read_int(address_at(buffer, i)?)? as u8);
        }
        match stream.write(&bytes) {
            Some(written) => written?,
            None => {
                cpu.push(memory, Value::Int(-1));
                return Ok(());
            }
        }
        done += chunk;
    }
    cpu.push(memory, Value::Int(count));
    Ok(())
}
