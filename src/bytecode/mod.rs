pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod ir;
pub mod op;
pub mod scope;

pub use compile::Compiler;
pub use compile_error::CompileError;
pub use ir::Code;
pub use op::Instr;
