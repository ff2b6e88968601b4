use std::sync::Arc;

use crate::bytecode::op::{Instr, UNASSIGNED, VarOperand};
use crate::lang::env::{TypeRef, VarRef};
use crate::lang::literal::Literal;

/// A global the code refers to by name: a Var, or a host type for `catch`.
#[derive(Debug, Clone, PartialEq)]
pub enum GlobalRef {
    Var(VarRef),
    Type(TypeRef),
}

impl std::fmt::Display for GlobalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GlobalRef::Var(var) => write!(f, "{}", var),
            GlobalRef::Type(ty) => write!(f, "{}", ty.name),
        }
    }
}

/// A call site that an evaluator may attach an inline cache to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub argc: u16,
    pub line: u32,
    pub column: u32,
}

/// Sorted (instruction offset, source line) pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineTable {
    entries: Vec<(u32, u32)>,
}

impl LineTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from stored entries; offsets must be non-decreasing.
    pub fn from_entries(entries: Vec<(u32, u32)>) -> Option<Self> {
        entries
            .windows(2)
            .all(|w| w[0].0 <= w[1].0)
            .then_some(LineTable { entries })
    }

    /// Note that instructions from `offset` on come from `line`.
    pub fn record(&mut self, offset: u32, line: u32) {
        match self.entries.last_mut() {
            Some(last) if last.1 == line => {}
            Some(last) if last.0 == offset => last.1 = line,
            Some(last) if last.0 > offset => {}
            _ => self.entries.push((offset, line)),
        }
    }

    /// Make sure offset 0 maps to a line.
    pub fn cover_origin(&mut self, line: u32) {
        if self.entries.first().is_none_or(|first| first.0 != 0) {
            self.entries.insert(0, (0, line));
        }
    }

    /// Line of the greatest recorded offset <= `ip`.
    pub fn lookup(&self, ip: u32) -> Option<u32> {
        let i = self.entries.partition_point(|(offset, _)| *offset <= ip);
        (i > 0).then(|| self.entries[i - 1].1)
    }

    pub fn entries(&self) -> &[(u32, u32)] {
        &self.entries
    }
}

/// Instructions in `start..end` were expanded from a macro defined in another file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroRegion {
    pub start: u32,
    pub end: u32,
    pub filename: Arc<str>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLoc {
    pub filename: Arc<str>,
    pub line: u32,
}

impl std::fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.filename, self.line)
    }
}

/// Everything an instruction operand can point into.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodeData {
    pub literals: Vec<Literal>,
    pub codes: Vec<Arc<Code>>,
    pub globals: Vec<GlobalRef>,
    pub call_sites: Vec<CallSite>,
    pub operands: Vec<VarOperand>,
    pub instrs: Vec<Instr>,
}

/// A compiled function body or top-level unit.
///
/// Code objects are finished bottom-up and never change afterwards; closures
/// share them through `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct Code {
    pub name: Option<Arc<str>>,
    pub arity: u16,
    pub variadic: bool,

    /// Local slots needed by one activation (params included).
    pub frame_size: u32,

    /// Upvalues copied from the enclosing closure at instantiation.
    pub imported_upvalues: u32,
    /// Imported plus own bindings promoted to upvalues.
    pub total_upvalues: u32,
    /// Names of the imported upvalues, in upvalue order.
    pub upvalue_names: Vec<Arc<str>>,
    /// Names of this function's own promoted bindings, following the imports.
    pub promoted_names: Vec<Arc<str>>,
    /// Promoted parameters: (argument slot, upvalue index).
    pub param_upvalues: Vec<(u32, u32)>,

    pub filename: Arc<str>,
    pub lines: LineTable,
    pub macro_regions: Vec<MacroRegion>,

    pub data: CodeData,
}

impl Code {
    pub fn promoted_upvalues(&self) -> u32 {
        self.total_upvalues - self.imported_upvalues
    }

    /// Name of upvalue `index`, whether imported or promoted here.
    pub fn upvalue_name(&self, index: u32) -> Option<&str> {
        let index = index as usize;
        match index.checked_sub(self.upvalue_names.len()) {
            None => self.upvalue_names.get(index).map(|n| &**n),
            Some(own) => self.promoted_names.get(own).map(|n| &**n),
        }
    }

    pub fn line_at(&self, ip: u32) -> Option<u32> {
        self.lines.lookup(ip)
    }

    /// Source location for diagnostics, preferring macro provenance.
    pub fn source_at(&self, ip: u32) -> Option<SourceLoc> {
        if let Some(region) = self
            .macro_regions
            .iter()
            .rev()
            .find(|r| r.start <= ip && ip < r.end)
        {
            return Some(SourceLoc {
                filename: region.filename.clone(),
                line: region.line,
            });
        }
        self.line_at(ip).map(|line| SourceLoc {
            filename: self.filename.clone(),
            line,
        })
    }

    /// Operand table entry behind a `Var` or `Capture` instruction.
    pub fn operand_at(&self, ip: usize) -> Option<&VarOperand> {
        match self.data.instrs.get(ip)? {
            Instr::Var(idx) | Instr::Capture(idx) => self.data.operands.get(*idx as usize),
            _ => None,
        }
    }

    /// Check the structural invariants of this code object and its children.
    /// Returns a description of the first violation.
    pub fn check(&self) -> Result<(), String> {
        self.check_shallow()?;
        self.data.codes.iter().try_for_each(|child| child.check())
    }

    /// Like [`Code::check`], without descending into nested code.
    pub fn check_shallow(&self) -> Result<(), String> {
        if self.imported_upvalues > self.total_upvalues {
            return Err(format!(
                "imported upvalues {} exceed total {}",
                self.imported_upvalues, self.total_upvalues
            ));
        }
        if self.upvalue_names.len() != self.imported_upvalues as usize {
            return Err("upvalue name count differs from imported upvalue count".to_string());
        }
        if self.promoted_names.len() != self.promoted_upvalues() as usize {
            return Err("promoted name count differs from promoted upvalue count".to_string());
        }
        if !self.data.instrs.is_empty() && self.lines.lookup(0).is_none() {
            return Err("line table does not cover offset 0".to_string());
        }
        for operand in &self.data.operands {
            if operand.index == UNASSIGNED {
                return Err("unassigned upvalue operand".to_string());
            }
            let limit = if operand.op.is_upvalue() {
                self.total_upvalues
            } else {
                self.frame_size
            };
            if operand.index >= limit {
                return Err(format!(
                    "{} {} out of range (limit {})",
                    operand.op.mnemonic(),
                    operand.index,
                    limit
                ));
            }
        }
        for (slot, index) in &self.param_upvalues {
            if *slot >= self.frame_size || *index >= self.total_upvalues {
                return Err(format!("bad promoted parameter ({}, {})", slot, index));
            }
        }
        for (ip, instr) in self.data.instrs.iter().enumerate() {
            let in_range = match instr {
                Instr::Const(i) => (*i as usize) < self.data.literals.len(),
                Instr::Var(i) | Instr::Capture(i) => (*i as usize) < self.data.operands.len(),
                Instr::Global(i) | Instr::VarObject(i) | Instr::Define(i) | Instr::Declare(i) => {
                    (*i as usize) < self.data.globals.len()
                }
                Instr::Catch { ty, .. } => (*ty as usize) < self.data.globals.len(),
                Instr::Closure(i) => (*i as usize) < self.data.codes.len(),
                Instr::Call(i) => (*i as usize) < self.data.call_sites.len(),
                _ => true,
            };
            if !in_range {
                return Err(format!("{:?} at {} has a dangling index", instr, ip));
            }
            let jump = match instr {
                Instr::Jump(o) | Instr::JumpIfFalse(o) | Instr::EnterTry(o) => Some(*o),
                Instr::Catch { skip, .. } => Some(*skip),
                _ => None,
            };
            if let Some(offset) = jump {
                let target = ip as i64 + offset as i64;
                if target < 0 || target >= self.data.instrs.len() as i64 {
                    return Err(format!("{:?} at {} jumps outside the code", instr, ip));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_table_lookup_greatest_offset() {
        let mut lines = LineTable::new();
        lines.record(0, 3);
        lines.record(2, 3);
        lines.record(4, 5);
        lines.record(9, 7);

        assert_eq!(lines.entries(), &[(0, 3), (4, 5), (9, 7)]);
        assert_eq!(lines.lookup(0), Some(3));
        assert_eq!(lines.lookup(3), Some(3));
        assert_eq!(lines.lookup(4), Some(5));
        assert_eq!(lines.lookup(100), Some(7));
    }

    #[test]
    fn test_line_table_same_offset_overwrites() {
        let mut lines = LineTable::new();
        lines.record(0, 1);
        lines.record(0, 2);
        assert_eq!(lines.entries(), &[(0, 2)]);
    }

    #[test]
    fn test_line_table_cover_origin() {
        let mut lines = LineTable::new();
        assert_eq!(lines.lookup(0), None);
        lines.record(3, 8);
        lines.cover_origin(1);
        assert_eq!(lines.lookup(0), Some(1));
        assert_eq!(lines.lookup(3), Some(8));
    }

    #[test]
    fn test_from_entries_rejects_unsorted() {
        assert!(LineTable::from_entries(vec![(0, 1), (5, 2)]).is_some());
        assert!(LineTable::from_entries(vec![(5, 1), (0, 2)]).is_none());
    }

    fn empty_code() -> Code {
        Code {
            name: None,
            arity: 0,
            variadic: false,
            frame_size: 0,
            imported_upvalues: 0,
            total_upvalues: 0,
            upvalue_names: Vec::new(),
            promoted_names: Vec::new(),
            param_upvalues: Vec::new(),
            filename: Arc::from("a.kdl"),
            lines: LineTable::new(),
            macro_regions: Vec::new(),
            data: CodeData::default(),
        }
    }

    #[test]
    fn test_source_at_prefers_macro_region() {
        let mut code = empty_code();
        code.lines.record(0, 10);
        code.macro_regions.push(MacroRegion {
            start: 2,
            end: 5,
            filename: Arc::from("macros.kdl"),
            line: 42,
        });

        assert_eq!(code.source_at(1).unwrap().to_string(), "a.kdl:10");
        assert_eq!(code.source_at(2).unwrap().to_string(), "macros.kdl:42");
        assert_eq!(code.source_at(5).unwrap().to_string(), "a.kdl:10");
    }

    #[test]
    fn test_check_flags_unassigned_operand() {
        use crate::bytecode::op::VarOp;

        let mut code = empty_code();
        code.total_upvalues = 1;
        code.promoted_names.push(Arc::from("x"));
        code.data.operands.push(VarOperand {
            op: VarOp::LoadUpvalue,
            index: UNASSIGNED,
        });
        assert!(code.check().unwrap_err().contains("unassigned"));

        code.data.operands[0].index = 0;
        assert!(code.check().is_ok());

        code.promoted_names.clear();
        assert!(code.check().unwrap_err().contains("promoted name count"));
    }

    #[test]
    fn test_upvalue_name_spans_imports_and_promoted() {
        let mut code = empty_code();
        code.imported_upvalues = 1;
        code.total_upvalues = 3;
        code.upvalue_names.push(Arc::from("n"));
        code.promoted_names.extend([Arc::from("a"), Arc::from("b")]);

        assert_eq!(code.upvalue_name(0), Some("n"));
        assert_eq!(code.upvalue_name(2), Some("b"));
        assert_eq!(code.upvalue_name(3), None);
        assert!(code.check().is_ok());
    }
}
