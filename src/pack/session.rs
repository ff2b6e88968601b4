//! Per-session string and binding tables.
//!
//! [`PackEnv`] assigns compact indices while writing; [`PackHeader`] is the
//! decoded form of the same tables, with every global already resolved
//! against the target environment.

use std::collections::HashMap;
use std::sync::Arc;

use lasso::{Key, Rodeo};

use super::PackError;
use super::wire::{Reader, Tag, Writer};
use crate::bytecode::ir::GlobalRef;
use crate::lang::env::GlobalEnv;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum GlobalKey {
    Var { ns: u16, name: u16 },
    Type { name: u16 },
}

/// Write-side session tables.
#[derive(Default)]
pub struct PackEnv {
    strings: Rodeo,
    globals: Vec<GlobalKey>,
    global_index: HashMap<GlobalKey, u32>,
}

impl PackEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `s`, interning it on first sight.
    pub fn string(&mut self, s: &str) -> Result<u16, PackError> {
        let key = self.strings.get_or_intern(s);
        u16::try_from(key.into_usize()).map_err(|_| PackError::TooManyStrings)
    }

    /// Index of a global reference, adding it to the binding table on first sight.
    pub fn global(&mut self, global: &GlobalRef) -> Result<u32, PackError> {
        let key = match global {
            GlobalRef::Var(var) => GlobalKey::Var {
                ns: self.string(&var.ns)?,
                name: self.string(&var.name)?,
            },
            GlobalRef::Type(ty) => GlobalKey::Type {
                name: self.string(&ty.name)?,
            },
        };
        if let Some(&idx) = self.global_index.get(&key) {
            return Ok(idx);
        }
        let idx = u32::try_from(self.globals.len()).map_err(|_| PackError::TooLarge("binding table"))?;
        self.globals.push(key);
        self.global_index.insert(key, idx);
        Ok(idx)
    }

    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    pub fn global_count(&self) -> usize {
        self.globals.len()
    }

    /// String table followed by binding table.
    pub fn write_tables(&self, w: &mut Writer) -> Result<(), PackError> {
        let count = u16::try_from(self.strings.len()).map_err(|_| PackError::TooManyStrings)?;
        w.u16(count);
        for (key, s) in self.strings.iter() {
            let idx = u16::try_from(key.into_usize()).map_err(|_| PackError::TooManyStrings)?;
            let len = u16::try_from(s.len()).map_err(|_| PackError::TooLarge("string"))?;
            w.u16(idx);
            w.u16(len);
            w.bytes(s.as_bytes());
        }

        w.count(self.globals.len(), "binding table")?;
        for key in &self.globals {
            match *key {
                GlobalKey::Var { ns, name } => {
                    w.tag(Tag::GlobalVar);
                    w.u16(ns);
                    w.u16(name);
                }
                GlobalKey::Type { name } => {
                    w.tag(Tag::GlobalType);
                    w.u16(name);
                }
            }
        }
        Ok(())
    }
}

/// Read-side session tables.
#[derive(Debug)]
pub struct PackHeader {
    strings: Vec<Arc<str>>,
    globals: Vec<GlobalRef>,
}

impl PackHeader {
    /// Read both tables and resolve every binding against `env`. Any name the
    /// environment lacks fails the whole load.
    pub fn read(r: &mut Reader<'_>, env: &dyn GlobalEnv) -> Result<Self, PackError> {
        let count = r.u16()? as usize;
        let mut strings = Vec::with_capacity(count);
        for expected in 0..count {
            let idx = r.u16()?;
            if idx as usize != expected {
                return Err(PackError::StringIndex(idx));
            }
            let len = r.u16()? as usize;
            let text = std::str::from_utf8(r.take(len)?)?;
            strings.push(Arc::from(text));
        }

        let mut header = PackHeader {
            strings,
            globals: Vec::new(),
        };

        let count = r.count(3)?;
        header.globals.reserve(count);
        for _ in 0..count {
            let global = match r.tag()? {
                Tag::GlobalVar => {
                    let ns = header.string(r.u16()?)?;
                    let name = header.string(r.u16()?)?;
                    if !env.has_namespace(&ns) {
                        return Err(PackError::MissingNamespace(ns.to_string()));
                    }
                    let var = env.find_var(&ns, &name).ok_or_else(|| PackError::MissingVar {
                        ns: ns.to_string(),
                        name: name.to_string(),
                    })?;
                    GlobalRef::Var(var)
                }
                Tag::GlobalType => {
                    let name = header.string(r.u16()?)?;
                    let ty = env
                        .find_type(&name)
                        .ok_or_else(|| PackError::MissingType(name.to_string()))?;
                    GlobalRef::Type(ty)
                }
                other => {
                    return Err(PackError::UnexpectedTag {
                        expected: Tag::GlobalVar,
                        found: other,
                        at: r.pos() - 1,
                    });
                }
            };
            header.globals.push(global);
        }
        Ok(header)
    }

    pub fn string(&self, idx: u16) -> Result<Arc<str>, PackError> {
        self.strings
            .get(idx as usize)
            .cloned()
            .ok_or(PackError::StringIndex(idx))
    }

    pub fn global(&self, idx: u32) -> Result<GlobalRef, PackError> {
        self.globals
            .get(idx as usize)
            .cloned()
            .ok_or(PackError::BindingIndex(idx))
    }
}
