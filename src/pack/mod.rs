//! Binary persistence for compiled code and syntax trees.
//!
//! Layout of an artifact:
//!
//! ```text
//! "KNDL" u16:version
//! u16:count  (u16:index u16:len bytes)*          string table
//! u32:count  (tag u16:ns? u16:name)*             binding table
//! root node                                      Code or Exprs
//! ```
//!
//! Numbers are big-endian. Vars and types are stored by name and re-resolved
//! against the environment passed to the unpack call, so an artifact can only
//! be loaded where every namespace, Var and type it mentions already exists.

mod code;
mod expr;
mod session;
mod wire;

use std::sync::Arc;

use tracing::debug;

use crate::bytecode::ir::Code;
use crate::lang::env::GlobalEnv;
use crate::lang::node::Expr;
use crate::lang::reader::ReadError;

pub use session::{PackEnv, PackHeader};
pub use wire::Tag;

pub const MAGIC: &[u8; 4] = b"KNDL";
pub const FORMAT_VERSION: u16 = 1;

#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("unexpected end of input ({0} bytes)")]
    Truncated(usize),

    #[error("unknown tag 0x{tag:02x} at byte {at}")]
    UnknownTag { tag: u8, at: usize },

    #[error("expected {expected:?} node at byte {at}, found {found:?}")]
    UnexpectedTag { expected: Tag, found: Tag, at: usize },

    #[error("invalid boolean byte 0x{byte:02x} at byte {at}")]
    BadBool { byte: u8, at: usize },

    #[error("not a packed artifact (bad magic)")]
    BadMagic,

    #[error("unsupported format version {0} (this build reads {})", FORMAT_VERSION)]
    UnsupportedVersion(u16),

    #[error("string index {0} out of range")]
    StringIndex(u16),

    #[error("binding index {0} out of range")]
    BindingIndex(u32),

    #[error("invalid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("unreadable literal: {0}")]
    Literal(#[from] ReadError),

    #[error("bad instruction stream: {0}")]
    Instructions(String),

    #[error("more than 65536 distinct strings in one artifact")]
    TooManyStrings,

    #[error("{0} too large to pack")]
    TooLarge(&'static str),

    #[error("namespace '{0}' is not loaded")]
    MissingNamespace(String),

    #[error("no var {ns}/{name} in the target environment")]
    MissingVar { ns: String, name: String },

    #[error("no type '{0}' in the target environment")]
    MissingType(String),

    #[error("{0} trailing bytes after the root node")]
    TrailingBytes(usize),

    #[error("literal {0} does not read back as itself")]
    Unprintable(String),

    #[error("nodes nested deeper than {} levels at byte {0}", wire::MAX_DEPTH)]
    TooDeep(usize),

    #[error("malformed code object: {0}")]
    Malformed(String),
}

/// Header, tables, then the already-written body.
fn assemble(env: &PackEnv, body: wire::Writer) -> Result<Vec<u8>, PackError> {
    let mut out = wire::Writer::new();
    out.bytes(MAGIC);
    out.u16(FORMAT_VERSION);
    env.write_tables(&mut out)?;
    out.bytes(&body.into_bytes());
    Ok(out.into_bytes())
}

fn open<'a>(bytes: &'a [u8], env: &dyn GlobalEnv) -> Result<(wire::Reader<'a>, PackHeader), PackError> {
    let mut r = wire::Reader::new(bytes);
    if r.take(MAGIC.len()).map_err(|_| PackError::BadMagic)? != MAGIC {
        return Err(PackError::BadMagic);
    }
    let version = r.u16()?;
    if version != FORMAT_VERSION {
        return Err(PackError::UnsupportedVersion(version));
    }
    let header = PackHeader::read(&mut r, env)?;
    Ok((r, header))
}

pub fn pack_code(code: &Code) -> Result<Vec<u8>, PackError> {
    let mut env = PackEnv::new();
    let mut body = wire::Writer::new();
    code::write_code(&mut body, &mut env, code)?;

    let bytes = assemble(&env, body)?;
    debug!(
        bytes = bytes.len(),
        strings = env.string_count(),
        bindings = env.global_count(),
        "packed code"
    );
    Ok(bytes)
}

/// Rebuild a code object, linking its globals against `env`.
pub fn unpack_code(bytes: &[u8], env: &dyn GlobalEnv) -> Result<Arc<Code>, PackError> {
    let (mut r, header) = open(bytes, env)?;
    let code = code::read_code(&mut r, &header)?;
    r.finish()?;
    debug!(bytes = bytes.len(), "unpacked code");
    Ok(code)
}

pub fn pack_exprs(exprs: &[Expr]) -> Result<Vec<u8>, PackError> {
    let mut env = PackEnv::new();
    let mut body = wire::Writer::new();
    body.tag(Tag::Exprs);
    expr::write_exprs(&mut body, &mut env, exprs)?;

    let bytes = assemble(&env, body)?;
    debug!(bytes = bytes.len(), forms = exprs.len(), strings = env.string_count(), "packed forms");
    Ok(bytes)
}

pub fn unpack_exprs(bytes: &[u8], env: &dyn GlobalEnv) -> Result<Vec<Expr>, PackError> {
    let (mut r, header) = open(bytes, env)?;
    r.expect(Tag::Exprs)?;
    let exprs = expr::read_exprs(&mut r, &header)?;
    r.finish()?;
    debug!(bytes = bytes.len(), forms = exprs.len(), "unpacked forms");
    Ok(exprs)
}
