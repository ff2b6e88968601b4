use serde::{Deserialize, Serialize};

// =============================================================================
// OP - Bytecode instructions
// =============================================================================

/// Index into a code object's literal pool.
pub type LitIdx = u32;
/// Index into a code object's operand table.
pub type OperandIdx = u32;
/// Index into a code object's global reference table.
pub type GlobalIdx = u32;
/// Index into a code object's nested code list.
pub type CodeIdx = u32;
/// Index into a code object's call-site table.
pub type CallSiteIdx = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instr {
    // literals
    Const(LitIdx),
    Nil,

    /// Read or write a lexical binding; the operand table entry says which.
    Var(OperandIdx),

    // globals
    Global(GlobalIdx),
    /// Push the Var object itself.
    VarObject(GlobalIdx),
    /// Pop a value and make it the root of a global Var.
    Define(GlobalIdx),
    /// Declare a global Var without a value.
    Declare(GlobalIdx),

    // closures
    /// Start building a closure over nested code; followed by one `Capture`
    /// per imported upvalue of that code, in upvalue order.
    Closure(CodeIdx),
    Capture(OperandIdx),
    /// Combine the top `n` arity closures into one function value.
    MakeFn(u16),

    Call(CallSiteIdx),

    // ==========================================================================
    // Control flow: relative jumps, offset is added to the current ip.
    // ==========================================================================
    Jump(i32),
    JumpIfFalse(i32),

    // stack
    Pop,
    Return,

    // collections
    MakeVector(u32),
    MakeMap(u32),
    MakeSet(u32),
    WithMeta,

    // exceptions
    Throw,
    /// Install a handler at ip + offset.
    EnterTry(i32),
    ExitTry,
    /// If the exception on the stack is an instance of the type global,
    /// continue; otherwise jump by `skip`.
    Catch {
        ty: GlobalIdx,
        skip: i32,
    },
    Rethrow,
}

/// How a `Var` instruction touches its binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarOp {
    LoadLocal,
    StoreLocal,
    LoadUpvalue,
    StoreUpvalue,
}

impl VarOp {
    pub fn is_write(self) -> bool {
        matches!(self, VarOp::StoreLocal | VarOp::StoreUpvalue)
    }

    pub fn is_upvalue(self) -> bool {
        matches!(self, VarOp::LoadUpvalue | VarOp::StoreUpvalue)
    }

    /// The upvalue form of this access. Upvalue forms map to themselves.
    pub fn to_upvalue(self) -> VarOp {
        match self {
            VarOp::LoadLocal | VarOp::LoadUpvalue => VarOp::LoadUpvalue,
            VarOp::StoreLocal | VarOp::StoreUpvalue => VarOp::StoreUpvalue,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            VarOp::LoadLocal => "LOAD_LOCAL",
            VarOp::StoreLocal => "STORE_LOCAL",
            VarOp::LoadUpvalue => "LOAD_UPVALUE",
            VarOp::StoreUpvalue => "STORE_UPVALUE",
        }
    }
}

/// Placeholder index of an upvalue access whose index is assigned when the
/// owning function closes.
pub const UNASSIGNED: u32 = u32::MAX;

/// One entry of the operand table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarOperand {
    pub op: VarOp,
    pub index: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_upvalue_keeps_direction() {
        assert_eq!(VarOp::LoadLocal.to_upvalue(), VarOp::LoadUpvalue);
        assert_eq!(VarOp::StoreLocal.to_upvalue(), VarOp::StoreUpvalue);
        assert_eq!(VarOp::LoadUpvalue.to_upvalue(), VarOp::LoadUpvalue);
        assert!(VarOp::StoreUpvalue.is_write());
        assert!(!VarOp::LoadLocal.is_upvalue());
    }

    #[test]
    fn test_instr_postcard_stream() {
        let ops = vec![
            Instr::Const(3),
            Instr::Var(0),
            Instr::Catch { ty: 1, skip: -4 },
            Instr::Jump(-12),
            Instr::Return,
        ];
        let bytes = postcard::to_allocvec(&ops).unwrap();
        let back: Vec<Instr> = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, ops);
    }
}
