//! Code objects on the wire.
//!
//! Scalar metadata and tables are written field by field; the instruction
//! stream is a postcard blob, since `Instr` already derives serde.

use std::sync::Arc;

use super::PackError;
use super::expr::{read_literal_text, write_literal};
use super::session::{PackEnv, PackHeader};
use super::wire::{Reader, Tag, Writer};
use crate::bytecode::ir::{CallSite, Code, CodeData, LineTable, MacroRegion};
use crate::bytecode::op::{Instr, VarOp, VarOperand};

fn var_op_byte(op: VarOp) -> u8 {
    match op {
        VarOp::LoadLocal => 0,
        VarOp::StoreLocal => 1,
        VarOp::LoadUpvalue => 2,
        VarOp::StoreUpvalue => 3,
    }
}

fn var_op_from(byte: u8, at: usize) -> Result<VarOp, PackError> {
    match byte {
        0 => Ok(VarOp::LoadLocal),
        1 => Ok(VarOp::StoreLocal),
        2 => Ok(VarOp::LoadUpvalue),
        3 => Ok(VarOp::StoreUpvalue),
        other => Err(PackError::UnknownTag { tag: other, at }),
    }
}

pub(super) fn write_code(w: &mut Writer, env: &mut PackEnv, code: &Code) -> Result<(), PackError> {
    w.descend()?;
    let result = write_fields(w, env, code);
    w.ascend();
    result
}

fn write_fields(w: &mut Writer, env: &mut PackEnv, code: &Code) -> Result<(), PackError> {
    w.tag(Tag::Code);

    match &code.name {
        Some(name) => {
            w.bool(true);
            w.u16(env.string(name)?);
        }
        None => w.bool(false),
    }
    w.u16(code.arity);
    w.bool(code.variadic);
    w.u32(code.frame_size);
    w.u32(code.imported_upvalues);
    w.u32(code.total_upvalues);

    w.count(code.upvalue_names.len(), "upvalue names")?;
    for name in &code.upvalue_names {
        w.u16(env.string(name)?);
    }
    w.count(code.promoted_names.len(), "promoted names")?;
    for name in &code.promoted_names {
        w.u16(env.string(name)?);
    }
    w.count(code.param_upvalues.len(), "promoted parameters")?;
    for &(slot, index) in &code.param_upvalues {
        w.u32(slot);
        w.u32(index);
    }

    w.u16(env.string(&code.filename)?);
    let lines = code.lines.entries();
    w.count(lines.len(), "line table")?;
    for &(offset, line) in lines {
        w.u32(offset);
        w.u32(line);
    }
    w.count(code.macro_regions.len(), "macro regions")?;
    for region in &code.macro_regions {
        w.u32(region.start);
        w.u32(region.end);
        w.u16(env.string(&region.filename)?);
        w.u32(region.line);
    }

    let data = &code.data;
    w.count(data.literals.len(), "literal pool")?;
    for lit in &data.literals {
        write_literal(w, lit)?;
    }
    w.count(data.codes.len(), "nested code")?;
    for child in &data.codes {
        write_code(w, env, child)?;
    }
    w.count(data.globals.len(), "global references")?;
    for global in &data.globals {
        let idx = env.global(global)?;
        w.u32(idx);
    }
    w.count(data.call_sites.len(), "call sites")?;
    for site in &data.call_sites {
        w.u16(site.argc);
        w.u32(site.line);
        w.u32(site.column);
    }
    w.count(data.operands.len(), "operand table")?;
    for operand in &data.operands {
        w.u8(var_op_byte(operand.op));
        w.u32(operand.index);
    }

    let instrs = postcard::to_allocvec(&data.instrs).map_err(|e| PackError::Instructions(e.to_string()))?;
    w.blob(&instrs, "instruction stream")
}

pub(super) fn read_code(r: &mut Reader<'_>, header: &PackHeader) -> Result<Arc<Code>, PackError> {
    r.descend()?;
    let result = read_fields(r, header);
    r.ascend();
    result
}

fn read_fields(r: &mut Reader<'_>, header: &PackHeader) -> Result<Arc<Code>, PackError> {
    r.expect(Tag::Code)?;

    let name = match r.bool()? {
        true => Some(header.string(r.u16()?)?),
        false => None,
    };
    let arity = r.u16()?;
    let variadic = r.bool()?;
    let frame_size = r.u32()?;
    let imported_upvalues = r.u32()?;
    let total_upvalues = r.u32()?;

    let count = r.count(2)?;
    let upvalue_names = (0..count)
        .map(|_| header.string(r.u16()?))
        .collect::<Result<Vec<_>, _>>()?;
    let count = r.count(2)?;
    let promoted_names = (0..count)
        .map(|_| header.string(r.u16()?))
        .collect::<Result<Vec<_>, _>>()?;
    let count = r.count(8)?;
    let param_upvalues = (0..count)
        .map(|_| Ok((r.u32()?, r.u32()?)))
        .collect::<Result<Vec<_>, PackError>>()?;

    let filename = header.string(r.u16()?)?;
    let count = r.count(8)?;
    let entries = (0..count)
        .map(|_| Ok((r.u32()?, r.u32()?)))
        .collect::<Result<Vec<_>, PackError>>()?;
    let lines = LineTable::from_entries(entries).ok_or_else(|| PackError::Malformed("line table is not sorted".to_string()))?;
    let count = r.count(14)?;
    let macro_regions = (0..count)
        .map(|_| {
            Ok(MacroRegion {
                start: r.u32()?,
                end: r.u32()?,
                filename: header.string(r.u16()?)?,
                line: r.u32()?,
            })
        })
        .collect::<Result<Vec<_>, PackError>>()?;

    let count = r.count(4)?;
    let literals = (0..count)
        .map(|_| read_literal_text(r))
        .collect::<Result<Vec<_>, _>>()?;
    let count = r.count(1)?;
    let codes = (0..count)
        .map(|_| read_code(r, header))
        .collect::<Result<Vec<_>, _>>()?;
    let count = r.count(4)?;
    let globals = (0..count)
        .map(|_| header.global(r.u32()?))
        .collect::<Result<Vec<_>, _>>()?;
    let count = r.count(10)?;
    let call_sites = (0..count)
        .map(|_| {
            Ok(CallSite {
                argc: r.u16()?,
                line: r.u32()?,
                column: r.u32()?,
            })
        })
        .collect::<Result<Vec<_>, PackError>>()?;
    let count = r.count(5)?;
    let operands = (0..count)
        .map(|_| {
            let at = r.pos();
            Ok(VarOperand {
                op: var_op_from(r.u8()?, at)?,
                index: r.u32()?,
            })
        })
        .collect::<Result<Vec<_>, PackError>>()?;

    let instrs: Vec<Instr> = postcard::from_bytes(r.blob()?).map_err(|e| PackError::Instructions(e.to_string()))?;

    let code = Code {
        name,
        arity,
        variadic,
        frame_size,
        imported_upvalues,
        total_upvalues,
        upvalue_names,
        promoted_names,
        param_upvalues,
        filename,
        lines,
        macro_regions,
        data: CodeData {
            literals,
            codes,
            globals,
            call_sites,
            operands,
            instrs,
        },
    };
    // children were checked as they were read
    code.check_shallow().map_err(PackError::Malformed)?;
    Ok(Arc::new(code))
}
