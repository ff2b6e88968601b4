//! Syntax-tree nodes on the wire.

use super::PackError;
use super::session::{PackEnv, PackHeader};
use super::wire::{Reader, Tag, Writer};
use crate::lang::literal::Literal;
use crate::lang::node::{Catch, Expr, ExprKind, FnArity, Pos};
use crate::lang::reader::{self, read_literal};
use crate::lang::symbol::Symbol;

fn tag_of(kind: &ExprKind) -> Tag {
    match kind {
        ExprKind::Literal(_) => Tag::Literal,
        ExprKind::Vector(_) => Tag::Vector,
        ExprKind::Map(_) => Tag::Map,
        ExprKind::Set(_) => Tag::Set,
        ExprKind::Symbol(_) => Tag::Symbol,
        ExprKind::VarRef(_) => Tag::VarRef,
        ExprKind::If { .. } => Tag::If,
        ExprKind::Do(_) => Tag::Do,
        ExprKind::Def { .. } => Tag::Def,
        ExprKind::Let { .. } => Tag::Let,
        ExprKind::Loop { .. } => Tag::Loop,
        ExprKind::Recur(_) => Tag::Recur,
        ExprKind::Fn { .. } => Tag::Fn,
        ExprKind::Call { .. } => Tag::Call,
        ExprKind::Meta { .. } => Tag::Meta,
        ExprKind::Throw(_) => Tag::Throw,
        ExprKind::Try { .. } => Tag::Try,
    }
}

// -----------------------------------------------------------------------------
// shared field codecs
// -----------------------------------------------------------------------------

pub(super) fn write_pos(w: &mut Writer, env: &mut PackEnv, pos: &Pos) -> Result<(), PackError> {
    w.u16(env.string(&pos.filename)?);
    w.u32(pos.line);
    w.u32(pos.column);
    Ok(())
}

pub(super) fn read_pos(r: &mut Reader<'_>, header: &PackHeader) -> Result<Pos, PackError> {
    Ok(Pos {
        filename: header.string(r.u16()?)?,
        line: r.u32()?,
        column: r.u32()?,
    })
}

pub(super) fn write_symbol(w: &mut Writer, env: &mut PackEnv, sym: &Symbol) -> Result<(), PackError> {
    match &sym.ns {
        Some(ns) => {
            w.bool(true);
            w.u16(env.string(ns)?);
        }
        None => w.bool(false),
    }
    w.u16(env.string(&sym.name)?);
    Ok(())
}

pub(super) fn read_symbol(r: &mut Reader<'_>, header: &PackHeader) -> Result<Symbol, PackError> {
    let ns = match r.bool()? {
        true => Some(header.string(r.u16()?)?),
        false => None,
    };
    Ok(Symbol {
        ns,
        name: header.string(r.u16()?)?,
    })
}

/// Literals travel as their printed form, so only ones that read back as
/// themselves can be packed.
pub(super) fn write_literal(w: &mut Writer, lit: &Literal) -> Result<(), PackError> {
    if lit.depth() > reader::MAX_DEPTH {
        return Err(PackError::TooDeep(w.position()));
    }
    if !lit.is_readable() {
        return Err(PackError::Unprintable(format!("{:?}", lit)));
    }
    w.blob(lit.to_string().as_bytes(), "literal")
}

pub(super) fn read_literal_text(r: &mut Reader<'_>) -> Result<Literal, PackError> {
    let text = std::str::from_utf8(r.blob()?)?;
    Ok(read_literal(text)?)
}

// -----------------------------------------------------------------------------
// nodes
// -----------------------------------------------------------------------------

pub(super) fn write_exprs(w: &mut Writer, env: &mut PackEnv, exprs: &[Expr]) -> Result<(), PackError> {
    w.count(exprs.len(), "expression list")?;
    exprs.iter().try_for_each(|e| write_expr(w, env, e))
}

fn write_opt(w: &mut Writer, env: &mut PackEnv, expr: Option<&Expr>) -> Result<(), PackError> {
    match expr {
        Some(e) => {
            w.bool(true);
            write_expr(w, env, e)
        }
        None => {
            w.bool(false);
            Ok(())
        }
    }
}

fn write_bindings(w: &mut Writer, env: &mut PackEnv, bindings: &[(Symbol, Expr)]) -> Result<(), PackError> {
    w.count(bindings.len(), "binding vector")?;
    for (name, init) in bindings {
        write_symbol(w, env, name)?;
        write_expr(w, env, init)?;
    }
    Ok(())
}

pub(super) fn write_expr(w: &mut Writer, env: &mut PackEnv, expr: &Expr) -> Result<(), PackError> {
    w.descend()?;
    let result = write_node(w, env, expr);
    w.ascend();
    result
}

fn write_node(w: &mut Writer, env: &mut PackEnv, expr: &Expr) -> Result<(), PackError> {
    w.tag(tag_of(&expr.kind));
    write_pos(w, env, &expr.pos)?;

    match &expr.kind {
        ExprKind::Literal(lit) => write_literal(w, lit)?,
        ExprKind::Vector(items) | ExprKind::Set(items) | ExprKind::Do(items) | ExprKind::Recur(items) => {
            write_exprs(w, env, items)?
        }
        ExprKind::Map(entries) => {
            w.count(entries.len(), "map")?;
            for (k, v) in entries {
                write_expr(w, env, k)?;
                write_expr(w, env, v)?;
            }
        }
        ExprKind::Symbol(sym) | ExprKind::VarRef(sym) => write_symbol(w, env, sym)?,
        ExprKind::If {
            cond,
            then,
            otherwise,
        } => {
            write_expr(w, env, cond)?;
            write_expr(w, env, then)?;
            write_opt(w, env, otherwise.as_deref())?;
        }
        ExprKind::Def { name, value, meta } => {
            write_symbol(w, env, name)?;
            write_opt(w, env, value.as_deref())?;
            write_opt(w, env, meta.as_deref())?;
        }
        ExprKind::Let { bindings, body } | ExprKind::Loop { bindings, body } => {
            write_bindings(w, env, bindings)?;
            write_exprs(w, env, body)?;
        }
        ExprKind::Fn { name, arities } => {
            match name {
                Some(name) => {
                    w.bool(true);
                    write_symbol(w, env, name)?;
                }
                None => w.bool(false),
            }
            w.count(arities.len(), "arity list")?;
            for arity in arities {
                w.count(arity.params.len(), "parameter list")?;
                for param in &arity.params {
                    write_symbol(w, env, param)?;
                }
                w.bool(arity.variadic);
                write_exprs(w, env, &arity.body)?;
            }
        }
        ExprKind::Call { callee, args } => {
            write_expr(w, env, callee)?;
            write_exprs(w, env, args)?;
        }
        ExprKind::Meta { meta, expr } => {
            write_expr(w, env, meta)?;
            write_expr(w, env, expr)?;
        }
        ExprKind::Throw(e) => write_expr(w, env, e)?,
        ExprKind::Try {
            body,
            catches,
            finally,
        } => {
            write_exprs(w, env, body)?;
            w.count(catches.len(), "catch list")?;
            for clause in catches {
                write_symbol(w, env, &clause.ty)?;
                write_symbol(w, env, &clause.binding)?;
                write_exprs(w, env, &clause.body)?;
            }
            match finally {
                Some(forms) => {
                    w.bool(true);
                    write_exprs(w, env, forms)?;
                }
                None => w.bool(false),
            }
        }
    }
    Ok(())
}

/// Smallest encoding of a node: tag plus position.
const MIN_EXPR_SIZE: usize = 11;

pub(super) fn read_exprs(r: &mut Reader<'_>, header: &PackHeader) -> Result<Vec<Expr>, PackError> {
    let count = r.count(MIN_EXPR_SIZE)?;
    (0..count).map(|_| read_expr(r, header)).collect()
}

fn read_opt(r: &mut Reader<'_>, header: &PackHeader) -> Result<Option<Box<Expr>>, PackError> {
    Ok(match r.bool()? {
        true => Some(Box::new(read_expr(r, header)?)),
        false => None,
    })
}

fn read_bindings(r: &mut Reader<'_>, header: &PackHeader) -> Result<Vec<(Symbol, Expr)>, PackError> {
    let count = r.count(3 + MIN_EXPR_SIZE)?;
    (0..count)
        .map(|_| Ok((read_symbol(r, header)?, read_expr(r, header)?)))
        .collect()
}

pub(super) fn read_expr(r: &mut Reader<'_>, header: &PackHeader) -> Result<Expr, PackError> {
    r.descend()?;
    let result = read_node(r, header);
    r.ascend();
    result
}

fn read_node(r: &mut Reader<'_>, header: &PackHeader) -> Result<Expr, PackError> {
    let at = r.pos();
    let tag = r.tag()?;
    let pos = read_pos(r, header)?;

    let kind = match tag {
        Tag::Literal => ExprKind::Literal(read_literal_text(r)?),
        Tag::Vector => ExprKind::Vector(read_exprs(r, header)?),
        Tag::Set => ExprKind::Set(read_exprs(r, header)?),
        Tag::Do => ExprKind::Do(read_exprs(r, header)?),
        Tag::Recur => ExprKind::Recur(read_exprs(r, header)?),
        Tag::Map => {
            let count = r.count(2 * MIN_EXPR_SIZE)?;
            let entries = (0..count)
                .map(|_| Ok((read_expr(r, header)?, read_expr(r, header)?)))
                .collect::<Result<Vec<_>, PackError>>()?;
            ExprKind::Map(entries)
        }
        Tag::Symbol => ExprKind::Symbol(read_symbol(r, header)?),
        Tag::VarRef => ExprKind::VarRef(read_symbol(r, header)?),
        Tag::If => ExprKind::If {
            cond: Box::new(read_expr(r, header)?),
            then: Box::new(read_expr(r, header)?),
            otherwise: read_opt(r, header)?,
        },
        Tag::Def => ExprKind::Def {
            name: read_symbol(r, header)?,
            value: read_opt(r, header)?,
            meta: read_opt(r, header)?,
        },
        Tag::Let => ExprKind::Let {
            bindings: read_bindings(r, header)?,
            body: read_exprs(r, header)?,
        },
        Tag::Loop => ExprKind::Loop {
            bindings: read_bindings(r, header)?,
            body: read_exprs(r, header)?,
        },
        Tag::Fn => {
            let name = match r.bool()? {
                true => Some(read_symbol(r, header)?),
                false => None,
            };
            let count = r.count(9)?;
            let mut arities = Vec::with_capacity(count);
            for _ in 0..count {
                let n = r.count(3)?;
                let params = (0..n)
                    .map(|_| read_symbol(r, header))
                    .collect::<Result<Vec<_>, _>>()?;
                arities.push(FnArity {
                    params,
                    variadic: r.bool()?,
                    body: read_exprs(r, header)?,
                });
            }
            ExprKind::Fn { name, arities }
        }
        Tag::Call => ExprKind::Call {
            callee: Box::new(read_expr(r, header)?),
            args: read_exprs(r, header)?,
        },
        Tag::Meta => ExprKind::Meta {
            meta: Box::new(read_expr(r, header)?),
            expr: Box::new(read_expr(r, header)?),
        },
        Tag::Throw => ExprKind::Throw(Box::new(read_expr(r, header)?)),
        Tag::Try => {
            let body = read_exprs(r, header)?;
            let count = r.count(10)?;
            let mut catches = Vec::with_capacity(count);
            for _ in 0..count {
                catches.push(Catch {
                    ty: read_symbol(r, header)?,
                    binding: read_symbol(r, header)?,
                    body: read_exprs(r, header)?,
                });
            }
            let finally = match r.bool()? {
                true => Some(read_exprs(r, header)?),
                false => None,
            };
            ExprKind::Try {
                body,
                catches,
                finally,
            }
        }
        Tag::Code | Tag::Exprs | Tag::GlobalVar | Tag::GlobalType => {
            return Err(PackError::UnexpectedTag {
                expected: Tag::Literal,
                found: tag,
                at,
            });
        }
    };
    Ok(Expr { pos, kind })
}
