//! Compile-time scopes and closure conversion.
//!
//! Frames live in an arena indexed by plain ids; parents are optional ids and
//! the chain of open functions is a stack of ids. A binding starts out as a
//! local slot. When a nested function looks it up, it is marked
//! upvalue-pending, and every function between the definer and the requester
//! gets its own import entry. Nothing is renumbered until the owning function
//! closes: only then are upvalue indices assigned and the recorded use sites in
//! the operand table rewritten.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::bytecode::compile_error::CompileError;
use crate::bytecode::op::{OperandIdx, UNASSIGNED, VarOp, VarOperand};

pub type BindingId = usize;
pub type ScopeId = usize;
pub type FnId = usize;

/// Storage class of a binding. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Storage {
    Local,
    UpvaluePending,
    UpvalueResolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingOrigin {
    Param,
    /// `let`, `loop` or catch binding.
    Local,
    /// Relay of a binding owned by the enclosing function.
    Import(BindingId),
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub name: Arc<str>,
    pub slot: u32,
    pub owner: FnId,
    pub storage: Storage,
    pub upvalue_index: Option<u32>,
    pub origin: BindingOrigin,
    uses: Vec<OperandIdx>,
}

impl Binding {
    /// Operand table entries that read or write this binding.
    pub fn uses(&self) -> &[OperandIdx] {
        &self.uses
    }
}

/// Where `recur` jumps to and which bindings it rebinds.
#[derive(Debug, Clone)]
pub struct RecurTarget {
    pub start: usize,
    pub bindings: Vec<BindingId>,
}

#[derive(Debug)]
pub struct ScopeFrame {
    pub parent: Option<ScopeId>,
    pub owner: FnId,
    pub start: u32,
    pub size: u32,
    pub recur: Option<RecurTarget>,
    names: HashMap<Arc<str>, BindingId>,
    declared: Vec<BindingId>,
}

#[derive(Debug)]
pub struct FunctionFrame {
    pub parent: Option<FnId>,
    pub root: ScopeId,
    pub top: ScopeId,
    pub imports: Vec<BindingId>,
    pub params: Vec<BindingId>,
    /// Own non-parameter bindings captured by nested functions.
    pub promoted: Vec<BindingId>,
    pub arity: u16,
    pub live_slots: u32,
    pub peak_slots: u32,
    pub operands: Vec<VarOperand>,
    closed: bool,
}

/// What a closed function hands to its code object and to its parent.
#[derive(Debug)]
pub struct ClosedFunction {
    pub frame_size: u32,
    pub operands: Vec<VarOperand>,
    /// (name, binding in the parent function to capture from), in upvalue order.
    pub imports: Vec<(Arc<str>, BindingId)>,
    pub total_upvalues: u32,
    pub param_upvalues: Vec<(u32, u32)>,
    /// Names of the function's own promoted bindings, in upvalue order.
    pub promoted_names: Vec<Arc<str>>,
}

#[derive(Debug, Default)]
pub struct Frames {
    bindings: Vec<Binding>,
    scopes: Vec<ScopeFrame>,
    functions: Vec<FunctionFrame>,
    stack: Vec<FnId>,
}

impl Frames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn binding(&self, id: BindingId) -> &Binding {
        &self.bindings[id]
    }

    pub fn function(&self, id: FnId) -> &FunctionFrame {
        &self.functions[id]
    }

    pub fn scope(&self, id: ScopeId) -> &ScopeFrame {
        &self.scopes[id]
    }

    /// Every function frame created so far, in creation order.
    pub fn functions(&self) -> impl Iterator<Item = (FnId, &FunctionFrame)> {
        self.functions.iter().enumerate()
    }

    /// Bindings named `name`, in creation order.
    pub fn bindings_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = (BindingId, &'a Binding)> {
        self.bindings
            .iter()
            .enumerate()
            .filter(move |(_, b)| &*b.name == name)
    }

    pub fn current(&self) -> Result<FnId, CompileError> {
        self.stack
            .last()
            .copied()
            .ok_or_else(|| CompileError::internal("no open function frame"))
    }

    fn new_scope(&mut self, parent: Option<ScopeId>, owner: FnId, start: u32) -> ScopeId {
        self.scopes.push(ScopeFrame {
            parent,
            owner,
            start,
            size: 0,
            recur: None,
            names: HashMap::new(),
            declared: Vec::new(),
        });
        self.scopes.len() - 1
    }

    /// Open a function frame nested in the current one (if any).
    pub fn push_function(&mut self, arity: u16) -> FnId {
        let id = self.functions.len();
        let parent = self.stack.last().copied();
        let root = self.new_scope(None, id, 0);
        self.functions.push(FunctionFrame {
            parent,
            root,
            top: root,
            imports: Vec::new(),
            params: Vec::new(),
            promoted: Vec::new(),
            arity,
            live_slots: 0,
            peak_slots: 0,
            operands: Vec::new(),
            closed: false,
        });
        self.stack.push(id);
        id
    }

    pub fn push_scope(&mut self) -> Result<ScopeId, CompileError> {
        let fn_id = self.current()?;
        let (top, start) = {
            let f = &self.functions[fn_id];
            (f.top, f.live_slots)
        };
        let id = self.new_scope(Some(top), fn_id, start);
        self.functions[fn_id].top = id;
        Ok(id)
    }

    /// Pop the innermost block scope, returning its slots and handing its
    /// captured bindings to the function for index assignment.
    pub fn pop_scope(&mut self) -> Result<(), CompileError> {
        let fn_id = self.current()?;
        let top = self.functions[fn_id].top;
        let parent = self.scopes[top]
            .parent
            .ok_or_else(|| CompileError::internal("attempt to pop a function's root scope"))?;
        self.retire_scope(fn_id, top);
        let size = self.scopes[top].size;
        let f = &mut self.functions[fn_id];
        f.live_slots -= size;
        f.top = parent;
        Ok(())
    }

    fn retire_scope(&mut self, fn_id: FnId, scope: ScopeId) {
        let pending: Vec<BindingId> = self.scopes[scope]
            .declared
            .iter()
            .copied()
            .filter(|&b| {
                let binding = &self.bindings[b];
                binding.origin == BindingOrigin::Local && binding.storage == Storage::UpvaluePending
            })
            .collect();
        self.functions[fn_id].promoted.extend(pending);
    }

    fn new_binding(&mut self, name: &str, origin: BindingOrigin) -> Result<BindingId, CompileError> {
        let fn_id = self.current()?;
        let top = self.functions[fn_id].top;
        let slot = self.functions[fn_id].live_slots;

        let id = self.bindings.len();
        let name: Arc<str> = Arc::from(name);
        self.bindings.push(Binding {
            name: name.clone(),
            slot,
            owner: fn_id,
            storage: Storage::Local,
            upvalue_index: None,
            origin,
            uses: Vec::new(),
        });

        let scope = &mut self.scopes[top];
        scope.names.insert(name, id);
        scope.declared.push(id);
        scope.size += 1;

        let f = &mut self.functions[fn_id];
        f.live_slots += 1;
        f.peak_slots = f.peak_slots.max(f.live_slots);
        Ok(id)
    }

    /// Declare a parameter of the current function. Params come before any
    /// other declaration, so they occupy slots `0..arity`.
    pub fn declare_param(&mut self, name: &str) -> Result<BindingId, CompileError> {
        let fn_id = self.current()?;
        if self.functions[fn_id].top != self.functions[fn_id].root {
            return Err(CompileError::internal("parameter declared inside a block scope"));
        }
        let id = self.new_binding(name, BindingOrigin::Param)?;
        self.functions[fn_id].params.push(id);
        Ok(id)
    }

    /// Declare a `let`/`loop`/catch name in the innermost scope, shadowing any
    /// earlier binding of the same name.
    pub fn declare(&mut self, name: &str) -> Result<BindingId, CompileError> {
        self.new_binding(name, BindingOrigin::Local)
    }

    fn lookup_scopes(&self, fn_id: FnId, name: &str) -> Option<BindingId> {
        let mut scope = Some(self.functions[fn_id].top);
        while let Some(id) = scope {
            let frame = &self.scopes[id];
            if let Some(&b) = frame.names.get(name) {
                return Some(b);
            }
            scope = frame.parent;
        }
        None
    }

    /// Resolve `name` lexically from the current function outwards.
    ///
    /// A hit in an enclosing function marks the binding as captured and
    /// threads an import through every function in between. `None` means the
    /// name must be a global.
    pub fn resolve(&mut self, name: &str) -> Result<Option<BindingId>, CompileError> {
        let fn_id = self.current()?;
        Ok(self.resolve_in(fn_id, name))
    }

    fn resolve_in(&mut self, fn_id: FnId, name: &str) -> Option<BindingId> {
        if let Some(b) = self.lookup_scopes(fn_id, name) {
            return Some(b);
        }
        let parent = self.functions[fn_id].parent?;
        let outer = self.resolve_in(parent, name)?;
        self.mark_captured(outer);
        Some(self.import(fn_id, outer))
    }

    fn mark_captured(&mut self, id: BindingId) {
        let binding = &mut self.bindings[id];
        if binding.storage == Storage::Local {
            binding.storage = Storage::UpvaluePending;
            trace!(name = %binding.name, fn_id = binding.owner, "binding promoted to upvalue");
        }
    }

    /// Install a relay of `outer` in `fn_id`'s root scope.
    fn import(&mut self, fn_id: FnId, outer: BindingId) -> BindingId {
        let id = self.bindings.len();
        let name = self.bindings[outer].name.clone();
        self.bindings.push(Binding {
            name: name.clone(),
            slot: UNASSIGNED,
            owner: fn_id,
            storage: Storage::UpvaluePending,
            upvalue_index: None,
            origin: BindingOrigin::Import(outer),
            uses: Vec::new(),
        });
        let root = self.functions[fn_id].root;
        self.scopes[root].names.insert(name, id);
        self.functions[fn_id].imports.push(id);
        id
    }

    /// Record a read or write of `id` in the current function's operand table,
    /// optimistic about its storage class.
    pub fn emit_access(&mut self, id: BindingId, write: bool) -> Result<OperandIdx, CompileError> {
        let fn_id = self.current()?;
        let binding = &self.bindings[id];
        if binding.owner != fn_id {
            return Err(CompileError::internal(format!(
                "binding '{}' accessed outside its function",
                binding.name
            )));
        }
        let operand = match (binding.storage, write) {
            (Storage::Local, false) => VarOperand { op: VarOp::LoadLocal, index: binding.slot },
            (Storage::Local, true) => VarOperand { op: VarOp::StoreLocal, index: binding.slot },
            (_, false) => VarOperand {
                op: VarOp::LoadUpvalue,
                index: binding.upvalue_index.unwrap_or(UNASSIGNED),
            },
            (_, true) => VarOperand {
                op: VarOp::StoreUpvalue,
                index: binding.upvalue_index.unwrap_or(UNASSIGNED),
            },
        };

        let operands = &mut self.functions[fn_id].operands;
        let idx = operands.len() as OperandIdx;
        operands.push(operand);
        self.bindings[id].uses.push(idx);
        Ok(idx)
    }

    /// Mark the innermost scope as a `recur` target.
    pub fn set_recur_target(&mut self, start: usize, bindings: Vec<BindingId>) -> Result<(), CompileError> {
        let fn_id = self.current()?;
        let top = self.functions[fn_id].top;
        self.scopes[top].recur = Some(RecurTarget { start, bindings });
        Ok(())
    }

    /// Nearest `recur` target within the current function.
    pub fn recur_target(&self) -> Result<Option<RecurTarget>, CompileError> {
        let fn_id = self.current()?;
        let mut scope = Some(self.functions[fn_id].top);
        while let Some(id) = scope {
            if let Some(target) = &self.scopes[id].recur {
                return Ok(Some(target.clone()));
            }
            scope = self.scopes[id].parent;
        }
        Ok(None)
    }

    /// Close the current function: assign upvalue indices (imports first,
    /// then captured params in order, then captured locals in declaration
    /// order) and patch every recorded use site.
    pub fn close_function(&mut self) -> Result<ClosedFunction, CompileError> {
        let fn_id = self.current()?;
        {
            let f = &self.functions[fn_id];
            if f.closed {
                return Err(CompileError::internal("function frame closed twice"));
            }
            if f.top != f.root {
                return Err(CompileError::internal("function closed with open block scopes"));
            }
        }
        let root = self.functions[fn_id].root;
        self.retire_scope(fn_id, root);

        let f = &self.functions[fn_id];
        let mut order: Vec<BindingId> = f.imports.clone();
        order.extend(
            f.params
                .iter()
                .copied()
                .filter(|&b| self.bindings[b].storage == Storage::UpvaluePending),
        );
        let mut promoted = f.promoted.clone();
        promoted.sort_unstable();
        promoted.dedup();
        order.extend(promoted);
        let promoted_names: Vec<Arc<str>> = order[f.imports.len()..]
            .iter()
            .map(|&b| self.bindings[b].name.clone())
            .collect();

        let mut param_upvalues = Vec::new();
        for (index, &id) in order.iter().enumerate() {
            let index = index as u32;
            let binding = &mut self.bindings[id];
            binding.storage = Storage::UpvalueResolved;
            binding.upvalue_index = Some(index);
            if binding.origin == BindingOrigin::Param {
                param_upvalues.push((binding.slot, index));
            }
            let uses = binding.uses.clone();
            let operands = &mut self.functions[fn_id].operands;
            for use_site in uses {
                let operand = &mut operands[use_site as usize];
                operand.op = operand.op.to_upvalue();
                operand.index = index;
            }
        }

        let f = &mut self.functions[fn_id];
        f.closed = true;
        if let Some(bad) = f.operands.iter().find(|o| o.index == UNASSIGNED) {
            return Err(CompileError::internal(format!(
                "{} left without an index at close",
                bad.op.mnemonic()
            )));
        }
        let operands = std::mem::take(&mut f.operands);
        let frame_size = f.peak_slots;
        let imports = f
            .imports
            .iter()
            .map(|&b| match self.bindings[b].origin {
                BindingOrigin::Import(outer) => Ok((self.bindings[b].name.clone(), outer)),
                _ => Err(CompileError::internal("import list holds a non-import binding")),
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.stack.pop();

        Ok(ClosedFunction {
            frame_size,
            operands,
            imports,
            total_upvalues: order.len() as u32,
            param_upvalues,
            promoted_names,
        })
    }
}
