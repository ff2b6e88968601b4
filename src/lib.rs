//! Compile-time core of a Lisp-family runtime.
//!
//! [`Compiler`] turns syntax trees into [`Code`] objects, deciding for every
//! lexical reference whether it is a local slot or a closure upvalue.
//! [`pack`] stores code objects and trees as bytes and links them back into
//! a live environment.

pub mod bytecode;
pub mod config;
pub mod lang;
pub mod pack;

pub use bytecode::{Code, CompileError, Compiler};
pub use config::CompileOptions;
pub use lang::env::{Environment, GlobalEnv};
pub use pack::{PackError, pack_code, pack_exprs, unpack_code, unpack_exprs};
