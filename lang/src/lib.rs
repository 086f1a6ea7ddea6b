pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod ctype;
pub mod linker;
pub mod loader;
pub mod scope;
pub mod source;
pub mod vm;
