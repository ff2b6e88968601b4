//! # Input side of the compiler
//!
//! Syntax trees as handed over by the reader, the constant data they carry,
//! and the global environment that names are resolved against.
//!
//! ## Conventions
//!
//! - Positions are 1-based `file:line:column`.
//! - A symbol containing `/` is namespace-qualified and never names a local.

pub mod env;
pub mod literal;
pub mod node;
pub mod reader;
pub mod symbol;
