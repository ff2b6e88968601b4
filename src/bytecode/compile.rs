use std::{collections::HashSet, sync::Arc};

use tracing::{debug, warn};

use crate::{
    bytecode::{
        compile_error::CompileError,
        ir::{CallSite, Code, CodeData, GlobalRef, LineTable, MacroRegion},
        op::{CallSiteIdx, CodeIdx, GlobalIdx, Instr, LitIdx},
        scope::{BindingId, Frames},
    },
    config::CompileOptions,
    lang::{
        env::{GlobalEnv, VarRef},
        literal::Literal,
        node::{Catch, Expr, ExprKind, FnArity, Pos},
        symbol::Symbol,
    },
};

/// Emission state for the code object of one open function.
struct CodeBuilder {
    name: Option<Arc<str>>,
    arity: u16,
    variadic: bool,
    filename: Arc<str>,
    /// File whose forms are local; forms from anywhere else are macro output.
    source: Arc<str>,
    first_line: u32,
    data: CodeData,
    lines: LineTable,
    macro_regions: Vec<MacroRegion>,
    /// Nesting depth inside a region from another file.
    foreign_depth: u32,
}

impl CodeBuilder {
    fn new(
        name: Option<Arc<str>>,
        arity: u16,
        variadic: bool,
        filename: Arc<str>,
        source: Arc<str>,
        first_line: u32,
    ) -> Self {
        CodeBuilder {
            name,
            arity,
            variadic,
            filename,
            source,
            first_line,
            data: CodeData::default(),
            lines: LineTable::new(),
            macro_regions: Vec::new(),
            foreign_depth: 0,
        }
    }

    fn ip(&self) -> usize {
        self.data.instrs.len()
    }

    fn emit(&mut self, instr: Instr) -> usize {
        self.data.instrs.push(instr);
        self.data.instrs.len() - 1
    }

    fn add_literal(&mut self, lit: &Literal) -> LitIdx {
        if let Some(i) = self.data.literals.iter().position(|l| l == lit) {
            return i as LitIdx;
        }
        self.data.literals.push(lit.clone());
        (self.data.literals.len() - 1) as LitIdx
    }

    fn add_global(&mut self, global: GlobalRef) -> GlobalIdx {
        if let Some(i) = self.data.globals.iter().position(|g| *g == global) {
            return i as GlobalIdx;
        }
        self.data.globals.push(global);
        (self.data.globals.len() - 1) as GlobalIdx
    }

    fn add_code(&mut self, code: Arc<Code>) -> CodeIdx {
        self.data.codes.push(code);
        (self.data.codes.len() - 1) as CodeIdx
    }

    fn add_call_site(&mut self, site: CallSite) -> CallSiteIdx {
        self.data.call_sites.push(site);
        (self.data.call_sites.len() - 1) as CallSiteIdx
    }

    /// Point the jump emitted at `at` to the current ip.
    fn patch_jump(&mut self, at: usize) -> Result<(), CompileError> {
        let offset = self.ip() as i32 - at as i32;
        match &mut self.data.instrs[at] {
            Instr::Jump(o) | Instr::JumpIfFalse(o) | Instr::EnterTry(o) => *o = offset,
            Instr::Catch { skip, .. } => *skip = offset,
            other => {
                return Err(CompileError::internal(format!(
                    "cannot patch non-jump instruction {:?}",
                    other
                )));
            }
        }
        Ok(())
    }
}

/// Compiles syntax trees into [`Code`] objects, one unit at a time.
///
/// Globals are resolved through the injected [`GlobalEnv`]; everything
/// lexical is handled by the frame arena in [`Frames`].
pub struct Compiler<'env> {
    env: &'env dyn GlobalEnv,
    options: CompileOptions,
    frames: Frames,
    builders: Vec<CodeBuilder>,
    /// Vars defined so far in the current unit.
    defined: HashSet<(Arc<str>, Arc<str>)>,
}

impl<'env> Compiler<'env> {
    pub fn new(env: &'env dyn GlobalEnv, options: CompileOptions) -> Self {
        Self {
            env,
            options,
            frames: Frames::new(),
            builders: Vec::new(),
            defined: HashSet::new(),
        }
    }

    /// Frame arena of the most recent unit, kept for inspection.
    pub fn frames(&self) -> &Frames {
        &self.frames
    }

    /// Compile a top-level unit. The resulting code takes no arguments and
    /// returns the value of the last form.
    pub fn compile_unit(&mut self, exprs: &[Expr]) -> Result<Arc<Code>, CompileError> {
        self.frames = Frames::new();
        self.builders.clear();
        self.defined.clear();

        let source: Option<Arc<str>> = exprs.first().map(|e| e.pos.filename.clone());
        let filename: Arc<str> = match (&self.options.filename, &source) {
            (Some(name), _) => Arc::from(name.as_str()),
            (None, Some(first)) => first.clone(),
            (None, None) => Arc::from("<unknown>"),
        };
        let source = source.unwrap_or_else(|| filename.clone());
        let line = exprs.first().map_or(1, |e| e.pos.line);

        self.frames.push_function(0);
        self.builders
            .push(CodeBuilder::new(None, 0, false, filename, source, line));
        self.compile_body(exprs)?;
        self.builder()?.emit(Instr::Return);

        let (code, imports) = self.finish_function()?;
        if !imports.is_empty() {
            return Err(CompileError::internal("top-level unit imported upvalues"));
        }
        Ok(code)
    }

    fn builder(&mut self) -> Result<&mut CodeBuilder, CompileError> {
        self.builders
            .last_mut()
            .ok_or_else(|| CompileError::internal("no code builder"))
    }

    fn emit(&mut self, instr: Instr) -> Result<usize, CompileError> {
        Ok(self.builder()?.emit(instr))
    }

    /// Close the current function and build its code object. Also returns
    /// the parent bindings its imported upvalues are captured from.
    fn finish_function(&mut self) -> Result<(Arc<Code>, Vec<(Arc<str>, BindingId)>), CompileError> {
        let closed = self.frames.close_function()?;
        let mut b = self
            .builders
            .pop()
            .ok_or_else(|| CompileError::internal("no code builder to finish"))?;
        b.lines.cover_origin(b.first_line);

        let code = Code {
            name: b.name,
            arity: b.arity,
            variadic: b.variadic,
            frame_size: closed.frame_size,
            imported_upvalues: closed.imports.len() as u32,
            total_upvalues: closed.total_upvalues,
            upvalue_names: closed.imports.iter().map(|(name, _)| name.clone()).collect(),
            promoted_names: closed.promoted_names,
            param_upvalues: closed.param_upvalues,
            filename: b.filename,
            lines: b.lines,
            macro_regions: b.macro_regions,
            data: CodeData {
                operands: closed.operands,
                ..b.data
            },
        };
        debug!(
            name = code.name.as_deref().unwrap_or("<unit>"),
            frame_size = code.frame_size,
            imported = code.imported_upvalues,
            total_upvalues = code.total_upvalues,
            instrs = code.data.instrs.len(),
            "closed function frame"
        );
        Ok((Arc::new(code), closed.imports))
    }

    fn compile_body(&mut self, exprs: &[Expr]) -> Result<(), CompileError> {
        if exprs.is_empty() {
            self.emit(Instr::Nil)?;
            return Ok(());
        }
        for (i, expr) in exprs.iter().enumerate() {
            if i > 0 {
                self.emit(Instr::Pop)?;
            }
            self.compile_expr(expr)?;
        }
        Ok(())
    }

    /// Compile one node; leaves exactly one value on the stack unless control
    /// leaves through `recur` or `throw`.
    fn compile_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        let record_lines = self.options.record_lines;
        let track_macros = self.options.track_macro_regions;

        let b = self.builder()?;
        let start = b.ip() as u32;
        let native = expr.pos.filename == b.source;
        if record_lines && native {
            b.lines.record(start, expr.pos.line);
        }
        let foreign = track_macros && !native && b.foreign_depth == 0;
        if foreign {
            b.foreign_depth += 1;
        }

        let result = self.compile_kind(expr);

        if foreign {
            let b = self.builder()?;
            b.foreign_depth -= 1;
            let end = b.ip() as u32;
            if end > start {
                b.macro_regions.push(MacroRegion {
                    start,
                    end,
                    filename: expr.pos.filename.clone(),
                    line: expr.pos.line,
                });
            }
        }
        result
    }

    fn compile_kind(&mut self, expr: &Expr) -> Result<(), CompileError> {
        let pos = &expr.pos;
        match &expr.kind {
            ExprKind::Literal(Literal::Nil) => {
                self.emit(Instr::Nil)?;
            }
            ExprKind::Literal(lit) => {
                let idx = self.builder()?.add_literal(lit);
                self.emit(Instr::Const(idx))?;
            }

            ExprKind::Vector(items) => {
                self.compile_all(items)?;
                self.emit(Instr::MakeVector(items.len() as u32))?;
            }
            ExprKind::Set(items) => {
                self.compile_all(items)?;
                self.emit(Instr::MakeSet(items.len() as u32))?;
            }
            ExprKind::Map(entries) => {
                for (k, v) in entries {
                    self.compile_expr(k)?;
                    self.compile_expr(v)?;
                }
                self.emit(Instr::MakeMap(entries.len() as u32))?;
            }

            ExprKind::Symbol(sym) => self.compile_symbol(sym, pos)?,

            ExprKind::VarRef(sym) => {
                let var = self.resolve_global(sym, pos)?;
                let idx = self.builder()?.add_global(GlobalRef::Var(var));
                self.emit(Instr::VarObject(idx))?;
            }

            ExprKind::If {
                cond,
                then,
                otherwise,
            } => {
                self.compile_expr(cond)?;
                let to_else = self.emit(Instr::JumpIfFalse(0))?;
                self.compile_expr(then)?;
                let to_end = self.emit(Instr::Jump(0))?;
                self.builder()?.patch_jump(to_else)?;
                match otherwise {
                    Some(e) => self.compile_expr(e)?,
                    None => {
                        self.emit(Instr::Nil)?;
                    }
                }
                self.builder()?.patch_jump(to_end)?;
            }

            ExprKind::Do(body) => self.compile_body(body)?,

            ExprKind::Def { name, value, meta } => self.compile_def(name, value.as_deref(), meta.as_deref(), pos)?,

            ExprKind::Let { bindings, body } => self.compile_let(bindings, body, false, pos)?,
            ExprKind::Loop { bindings, body } => self.compile_let(bindings, body, true, pos)?,
            ExprKind::Recur(args) => self.compile_recur(args, pos)?,

            ExprKind::Fn { name, arities } => self.compile_fn(name.as_ref(), arities, pos)?,

            ExprKind::Call { callee, args } => {
                self.compile_expr(callee)?;
                self.compile_all(args)?;
                let argc = u16::try_from(args.len()).map_err(|_| {
                    CompileError::invalid("call", format!("{} arguments is too many", args.len()), pos, None)
                })?;
                let site = self.builder()?.add_call_site(CallSite {
                    argc,
                    line: pos.line,
                    column: pos.column,
                });
                self.emit(Instr::Call(site))?;
            }

            ExprKind::Meta { meta, expr } => {
                self.compile_expr(expr)?;
                self.compile_expr(meta)?;
                self.emit(Instr::WithMeta)?;
            }

            ExprKind::Throw(e) => {
                self.compile_expr(e)?;
                self.emit(Instr::Throw)?;
            }

            ExprKind::Try {
                body,
                catches,
                finally,
            } => self.compile_try(body, catches, finally.as_deref())?,
        }
        Ok(())
    }

    fn compile_all(&mut self, exprs: &[Expr]) -> Result<(), CompileError> {
        exprs.iter().try_for_each(|e| self.compile_expr(e))
    }

    fn resolve_global(&self, sym: &Symbol, pos: &Pos) -> Result<VarRef, CompileError> {
        self.env.resolve_var(sym).ok_or_else(|| match &sym.ns {
            Some(ns) => CompileError::unresolved_qualified(sym, ns, pos),
            None => CompileError::unresolved(sym, pos),
        })
    }

    fn compile_symbol(&mut self, sym: &Symbol, pos: &Pos) -> Result<(), CompileError> {
        if !sym.is_qualified() {
            if let Some(binding) = self.frames.resolve(&sym.name)? {
                return self.load(binding);
            }
        }
        let var = self.resolve_global(sym, pos)?;
        let idx = self.builder()?.add_global(GlobalRef::Var(var));
        self.emit(Instr::Global(idx))?;
        Ok(())
    }

    fn load(&mut self, binding: BindingId) -> Result<(), CompileError> {
        let operand = self.frames.emit_access(binding, false)?;
        self.emit(Instr::Var(operand))?;
        Ok(())
    }

    fn store(&mut self, binding: BindingId) -> Result<(), CompileError> {
        let operand = self.frames.emit_access(binding, true)?;
        self.emit(Instr::Var(operand))?;
        Ok(())
    }

    fn compile_def(
        &mut self,
        name: &Symbol,
        value: Option<&Expr>,
        meta: Option<&Expr>,
        pos: &Pos,
    ) -> Result<(), CompileError> {
        let var = self.env.intern_var(name).map_err(|source| CompileError::Environment {
            source,
            pos: pos.clone(),
        })?;
        if !self.defined.insert((var.ns.clone(), var.name.clone())) {
            warn!(var = %var, at = %pos, "var defined more than once in one unit");
        }

        let idx = self.builder()?.add_global(GlobalRef::Var(var));
        match value {
            Some(v) => {
                self.compile_expr(v)?;
                self.emit(Instr::Define(idx))?;
            }
            None => {
                self.emit(Instr::Declare(idx))?;
            }
        }
        self.emit(Instr::VarObject(idx))?;
        if let Some(m) = meta {
            self.compile_expr(m)?;
            self.emit(Instr::WithMeta)?;
        }
        Ok(())
    }

    fn compile_let(
        &mut self,
        bindings: &[(Symbol, Expr)],
        body: &[Expr],
        is_loop: bool,
        pos: &Pos,
    ) -> Result<(), CompileError> {
        let form = if is_loop { "loop" } else { "let" };
        self.frames.push_scope()?;

        let mut bound = Vec::with_capacity(bindings.len());
        for (name, init) in bindings {
            if name.is_qualified() {
                return Err(CompileError::invalid(
                    form,
                    format!("cannot bind qualified name '{}'", name),
                    pos,
                    Some("local names must not carry a namespace"),
                ));
            }
            self.compile_expr(init)?;
            let binding = self.frames.declare(&name.name)?;
            self.store(binding)?;
            bound.push(binding);
        }

        if is_loop {
            let start = self.builder()?.ip();
            self.frames.set_recur_target(start, bound)?;
        }
        self.compile_body(body)?;
        self.frames.pop_scope()
    }

    fn compile_recur(&mut self, args: &[Expr], pos: &Pos) -> Result<(), CompileError> {
        let target = self
            .frames
            .recur_target()?
            .ok_or_else(|| CompileError::recur_outside_loop(pos))?;
        if args.len() != target.bindings.len() {
            return Err(CompileError::RecurArity {
                expected: target.bindings.len(),
                got: args.len(),
                pos: pos.clone(),
            });
        }

        self.compile_all(args)?;
        for &binding in target.bindings.iter().rev() {
            self.store(binding)?;
        }
        let ip = self.builder()?.ip();
        self.emit(Instr::Jump(target.start as i32 - ip as i32))?;
        Ok(())
    }

    fn check_arities(arities: &[FnArity], pos: &Pos) -> Result<(), CompileError> {
        if arities.is_empty() {
            return Err(CompileError::invalid("fn", "no arities given", pos, None));
        }
        let variadic: Vec<&FnArity> = arities.iter().filter(|a| a.variadic).collect();
        if variadic.len() > 1 {
            return Err(CompileError::invalid(
                "fn",
                "more than one variadic arity",
                pos,
                Some("keep a single arity with a rest parameter"),
            ));
        }
        if variadic.iter().any(|a| a.params.is_empty()) {
            return Err(CompileError::invalid("fn", "variadic arity without a rest parameter", pos, None));
        }

        let mut seen = HashSet::new();
        for arity in arities.iter().filter(|a| !a.variadic) {
            if !seen.insert(arity.params.len()) {
                return Err(CompileError::invalid(
                    "fn",
                    format!("duplicate arity {}", arity.params.len()),
                    pos,
                    None,
                ));
            }
        }
        if let Some(param) = arities.iter().flat_map(|a| &a.params).find(|p| p.is_qualified()) {
            return Err(CompileError::invalid(
                "fn",
                format!("cannot use qualified name '{}' as a parameter", param),
                pos,
                None,
            ));
        }
        Ok(())
    }

    fn compile_fn(&mut self, name: Option<&Symbol>, arities: &[FnArity], pos: &Pos) -> Result<(), CompileError> {
        Self::check_arities(arities, pos)?;
        let count = u16::try_from(arities.len())
            .map_err(|_| CompileError::invalid("fn", "too many arities", pos, None))?;

        for arity in arities {
            let (code, imports) = self.compile_arity(name, arity, pos)?;
            let idx = self.builder()?.add_code(code);
            self.emit(Instr::Closure(idx))?;
            for (_, outer) in imports {
                let operand = self.frames.emit_access(outer, false)?;
                self.emit(Instr::Capture(operand))?;
            }
        }
        self.emit(Instr::MakeFn(count))?;
        Ok(())
    }

    fn compile_arity(
        &mut self,
        name: Option<&Symbol>,
        arity: &FnArity,
        pos: &Pos,
    ) -> Result<(Arc<Code>, Vec<(Arc<str>, BindingId)>), CompileError> {
        let n = u16::try_from(arity.params.len())
            .map_err(|_| CompileError::invalid("fn", "too many parameters", pos, None))?;
        let parent = self.builder()?;
        let (filename, source) = (parent.filename.clone(), parent.source.clone());

        self.frames.push_function(n);
        self.builders.push(CodeBuilder::new(
            name.map(|s| Arc::from(s.to_string())),
            n,
            arity.variadic,
            filename,
            source,
            pos.line,
        ));

        let mut params = Vec::with_capacity(arity.params.len());
        for param in &arity.params {
            params.push(self.frames.declare_param(&param.name)?);
        }
        self.frames.set_recur_target(0, params)?;

        self.compile_body(&arity.body)?;
        self.emit(Instr::Return)?;
        self.finish_function()
    }

    /// Layout:
    ///
    /// ```text
    ///         ENTER_TRY handler
    ///         <body>
    ///         EXIT_TRY
    ///         <finally> POP
    ///         JUMP end
    /// handler:
    ///         CATCH ty, next        ; per clause
    ///         STORE e
    ///         <clause body>
    ///         <finally> POP
    ///         JUMP end
    /// next:   ...
    ///         <finally> POP
    ///         RETHROW
    /// end:
    /// ```
    fn compile_try(&mut self, body: &[Expr], catches: &[Catch], finally: Option<&[Expr]>) -> Result<(), CompileError> {
        let mut to_end = Vec::new();

        let enter = self.emit(Instr::EnterTry(0))?;
        self.compile_body(body)?;
        self.emit(Instr::ExitTry)?;
        self.compile_finally(finally)?;
        to_end.push(self.emit(Instr::Jump(0))?);

        self.builder()?.patch_jump(enter)?;
        for clause in catches {
            let ty = self.env.resolve_type(&clause.ty).ok_or_else(|| CompileError::UnknownType {
                name: clause.ty.to_string(),
                pos: clause.body.first().map_or_else(|| self.unit_pos(), |e| e.pos.clone()),
            })?;
            let ty = self.builder()?.add_global(GlobalRef::Type(ty));
            let check = self.emit(Instr::Catch { ty, skip: 0 })?;

            self.frames.push_scope()?;
            let binding = self.frames.declare(&clause.binding.name)?;
            self.store(binding)?;
            self.compile_body(&clause.body)?;
            self.frames.pop_scope()?;

            self.compile_finally(finally)?;
            to_end.push(self.emit(Instr::Jump(0))?);
            self.builder()?.patch_jump(check)?;
        }
        self.compile_finally(finally)?;
        self.emit(Instr::Rethrow)?;

        let b = self.builder()?;
        for at in to_end {
            b.patch_jump(at)?;
        }
        Ok(())
    }

    fn compile_finally(&mut self, finally: Option<&[Expr]>) -> Result<(), CompileError> {
        if let Some(forms) = finally {
            self.compile_body(forms)?;
            self.emit(Instr::Pop)?;
        }
        Ok(())
    }

    fn unit_pos(&self) -> Pos {
        match self.builders.last() {
            Some(b) => Pos {
                filename: b.filename.clone(),
                line: b.first_line,
                column: 1,
            },
            None => Pos::new("<unknown>", 1, 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::{VarOp, VarOperand};
    use crate::bytecode::scope::Storage;
    use crate::lang::env::Environment;
    use crate::lang::node::build::{call, def, fn1, int, let_, loop_, sym};

    fn pos() -> Pos {
        Pos::new("core.kdl", 1, 1)
    }

    fn at(line: u32) -> Pos {
        Pos::new("core.kdl", line, 1)
    }

    fn env() -> Environment {
        let env = Environment::new("user");
        env.define("core", "+");
        env.define("core", "<");
        env.refer("user", "core").unwrap();
        env.define_type("Exception");
        env
    }

    fn compile(env: &Environment, exprs: &[Expr]) -> Arc<Code> {
        let code = Compiler::new(env, CompileOptions::default())
            .compile_unit(exprs)
            .unwrap();
        code.check().unwrap();
        code
    }

    fn operand(code: &Code, ip: usize) -> VarOperand {
        *code.operand_at(ip).unwrap()
    }

    #[test]
    fn test_literals_are_deduplicated() {
        let env = env();
        let p = pos();
        let code = compile(&env, &[int(&p, 7), int(&p, 7), build_nil(&p)]);

        assert_eq!(code.data.literals, vec![Literal::Int(7)]);
        assert_eq!(
            code.data.instrs,
            vec![
                Instr::Const(0),
                Instr::Pop,
                Instr::Const(0),
                Instr::Pop,
                Instr::Nil,
                Instr::Return
            ]
        );
    }

    fn build_nil(p: &Pos) -> Expr {
        Expr::new(p.clone(), ExprKind::Literal(Literal::Nil))
    }

    #[test]
    fn test_empty_unit_returns_nil() {
        let env = env();
        let code = compile(&env, &[]);
        assert_eq!(code.data.instrs, vec![Instr::Nil, Instr::Return]);
        assert_eq!(&*code.filename, "<unknown>");
    }

    #[test]
    fn test_param_captured_by_inner_fn() {
        let env = env();
        let p = pos();
        let unit = compile(&env, &[fn1(&p, &["x"], vec![fn1(&p, &[], vec![sym(&p, "x")])])]);

        let outer = &unit.data.codes[0];
        assert_eq!(outer.frame_size, 1);
        assert_eq!(outer.imported_upvalues, 0);
        assert_eq!(outer.total_upvalues, 1);
        assert_eq!(outer.param_upvalues, vec![(0, 0)]);
        assert_eq!(
            outer.data.instrs,
            vec![Instr::Closure(0), Instr::Capture(0), Instr::MakeFn(1), Instr::Return]
        );
        assert_eq!(
            operand(outer, 1),
            VarOperand {
                op: VarOp::LoadUpvalue,
                index: 0
            }
        );

        let inner = &outer.data.codes[0];
        assert_eq!(inner.imported_upvalues, 1);
        assert_eq!(inner.total_upvalues, 1);
        assert_eq!(inner.upvalue_names, vec![Arc::<str>::from("x")]);
        assert_eq!(inner.data.instrs, vec![Instr::Var(0), Instr::Return]);
        assert_eq!(
            operand(inner, 0),
            VarOperand {
                op: VarOp::LoadUpvalue,
                index: 0
            }
        );
    }

    #[test]
    fn test_reads_before_capture_are_rewritten() {
        let env = env();
        let p = pos();
        // (fn [x] (+ x 1) (fn [] x))
        let f = fn1(
            &p,
            &["x"],
            vec![
                call(&p, sym(&p, "+"), vec![sym(&p, "x"), int(&p, 1)]),
                fn1(&p, &[], vec![sym(&p, "x")]),
            ],
        );
        let unit = compile(&env, &[f]);
        let outer = &unit.data.codes[0];

        // GLOBAL +, VAR x, CONST 1, CALL
        assert_eq!(outer.data.instrs[1], Instr::Var(0));
        assert_eq!(
            operand(outer, 1),
            VarOperand {
                op: VarOp::LoadUpvalue,
                index: 0
            }
        );
        assert!(outer.data.operands.iter().all(|o| o.op.is_upvalue()));
    }

    #[test]
    fn test_three_levels_relay_once_per_function() {
        let env = env();
        let p = pos();
        // (fn [] (let [v 1] (fn [] (fn [] v))))
        let innermost = fn1(&p, &[], vec![sym(&p, "v")]);
        let middle = fn1(&p, &[], vec![innermost]);
        let outer = fn1(&p, &[], vec![let_(&p, vec![("v", int(&p, 1))], vec![middle])]);

        let mut compiler = Compiler::new(&env, CompileOptions::default());
        let unit = compiler.compile_unit(&[outer]).unwrap();
        unit.check().unwrap();

        let outer = &unit.data.codes[0];
        let middle = &outer.data.codes[0];
        let innermost = &middle.data.codes[0];
        assert_eq!(outer.total_upvalues, 1);
        assert_eq!(outer.imported_upvalues, 0);
        assert_eq!(middle.imported_upvalues, 1);
        assert_eq!(middle.total_upvalues, 1);
        assert_eq!(innermost.imported_upvalues, 1);

        let frames = compiler.frames();
        let v: Vec<_> = frames.bindings_named("v").collect();
        assert_eq!(v.len(), 3);
        assert!(v.iter().all(|(_, b)| b.storage == Storage::UpvalueResolved));
        assert!(frames.functions().all(|(_, f)| f.imports.len() <= 1));
    }

    #[test]
    fn test_no_capture_keeps_everything_local() {
        let env = env();
        let p = pos();
        let f = fn1(
            &p,
            &["a", "b"],
            vec![let_(
                &p,
                vec![("c", call(&p, sym(&p, "+"), vec![sym(&p, "a"), sym(&p, "b")]))],
                vec![sym(&p, "c")],
            )],
        );

        let mut compiler = Compiler::new(&env, CompileOptions::default());
        let unit = compiler.compile_unit(&[f]).unwrap();
        let code = &unit.data.codes[0];

        assert_eq!(code.total_upvalues, 0);
        assert_eq!(code.frame_size, 3);
        assert!(code.data.operands.iter().all(|o| !o.op.is_upvalue()));
        for (_, binding) in ["a", "b", "c"]
            .iter()
            .flat_map(|n| compiler.frames().bindings_named(*n))
        {
            assert_eq!(binding.storage, Storage::Local);
        }
    }

    #[test]
    fn test_let_binding_captured_by_closure() {
        let env = env();
        let p = pos();
        // (let [a 1 b 2] (fn [] b))
        let expr = let_(
            &p,
            vec![("a", int(&p, 1)), ("b", int(&p, 2))],
            vec![fn1(&p, &[], vec![sym(&p, "b")])],
        );
        let unit = compile(&env, &[expr]);

        assert_eq!(unit.total_upvalues, 1);
        assert_eq!(unit.frame_size, 2);
        // CONST 1, STORE a, CONST 2, STORE b
        assert_eq!(
            operand(&unit, 1),
            VarOperand {
                op: VarOp::StoreLocal,
                index: 0
            }
        );
        assert_eq!(
            operand(&unit, 3),
            VarOperand {
                op: VarOp::StoreUpvalue,
                index: 0
            }
        );
    }

    #[test]
    fn test_unresolved_symbol_reports_position() {
        let env = env();
        let err = Compiler::new(&env, CompileOptions::default())
            .compile_unit(&[sym(&at(4), "nope")])
            .unwrap_err();

        assert!(matches!(err, CompileError::Unresolved { .. }));
        assert_eq!(err.pos().unwrap().line, 4);
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_qualified_symbol_skips_lexical_scope() {
        let env = env();
        let p = pos();
        let expr = let_(&p, vec![("+", int(&p, 1))], vec![sym(&p, "core/+")]);
        let unit = compile(&env, &[expr]);

        assert!(unit.data.instrs.contains(&Instr::Global(0)));
        assert_eq!(unit.data.globals[0].to_string(), "#'core/+");

        let err = Compiler::new(&env, CompileOptions::default())
            .compile_unit(&[sym(&p, "str/join")])
            .unwrap_err();
        assert!(err.to_string().contains("hint: namespace 'str'"));
    }

    #[test]
    fn test_def_interns_and_reuses_global() {
        let env = env();
        let p = pos();
        let unit = compile(
            &env,
            &[def(&p, "answer", int(&p, 42)), sym(&p, "answer")],
        );

        assert!(env.find_var("user", "answer").is_some());
        assert_eq!(unit.data.globals.len(), 1);
        assert_eq!(
            unit.data.instrs,
            vec![
                Instr::Const(0),
                Instr::Define(0),
                Instr::VarObject(0),
                Instr::Pop,
                Instr::Global(0),
                Instr::Return
            ]
        );
    }

    #[test]
    fn test_def_in_foreign_namespace_fails() {
        let env = env();
        let p = pos();
        let expr = Expr::new(
            p.clone(),
            ExprKind::Def {
                name: Symbol::qualified("core", "x"),
                value: None,
                meta: None,
            },
        );
        let err = Compiler::new(&env, CompileOptions::default())
            .compile_unit(&[expr])
            .unwrap_err();
        assert!(matches!(err, CompileError::Environment { .. }));
    }

    #[test]
    fn test_loop_recur_jumps_back() {
        let env = env();
        let p = pos();
        // (loop [i 0] (if (< i 10) (recur (+ i 1)) i))
        let body = Expr::new(
            p.clone(),
            ExprKind::If {
                cond: Box::new(call(&p, sym(&p, "<"), vec![sym(&p, "i"), int(&p, 10)])),
                then: Box::new(Expr::new(
                    p.clone(),
                    ExprKind::Recur(vec![call(&p, sym(&p, "+"), vec![sym(&p, "i"), int(&p, 1)])]),
                )),
                otherwise: Some(Box::new(sym(&p, "i"))),
            },
        );
        let unit = compile(&env, &[loop_(&p, vec![("i", int(&p, 0))], vec![body])]);

        let instrs = &unit.data.instrs;
        let start = 2;
        let (jump_ip, offset) = instrs
            .iter()
            .enumerate()
            .find_map(|(ip, i)| match i {
                Instr::Jump(o) if *o < 0 => Some((ip, *o)),
                _ => None,
            })
            .unwrap();
        assert_eq!((jump_ip as i32 + offset) as usize, start);
        assert_eq!(
            operand(&unit, jump_ip - 1),
            VarOperand {
                op: VarOp::StoreLocal,
                index: 0
            }
        );
    }

    #[test]
    fn test_recur_errors() {
        let env = env();
        let p = pos();
        let recur = |n: usize| Expr::new(p.clone(), ExprKind::Recur((0..n).map(|i| int(&p, i as i64)).collect()));

        let err = Compiler::new(&env, CompileOptions::default())
            .compile_unit(&[recur(0)])
            .unwrap_err();
        assert!(matches!(err, CompileError::RecurOutsideLoop { .. }));

        let err = Compiler::new(&env, CompileOptions::default())
            .compile_unit(&[fn1(&p, &["a"], vec![recur(2)])])
            .unwrap_err();
        assert!(matches!(err, CompileError::RecurArity { expected: 1, got: 2, .. }));
    }

    #[test]
    fn test_bad_arities_rejected() {
        let env = env();
        let p = pos();
        let arity = |n: usize, variadic: bool| FnArity {
            params: (0..n).map(|i| Symbol::new(&format!("p{}", i))).collect(),
            variadic,
            body: vec![],
        };
        let fn_of = |arities: Vec<FnArity>| {
            Expr::new(
                p.clone(),
                ExprKind::Fn {
                    name: None,
                    arities,
                },
            )
        };

        for bad in [
            vec![],
            vec![arity(1, true), arity(2, true)],
            vec![arity(0, true)],
            vec![arity(1, false), arity(1, false)],
        ] {
            let err = Compiler::new(&env, CompileOptions::default())
                .compile_unit(&[fn_of(bad)])
                .unwrap_err();
            assert!(matches!(err, CompileError::InvalidForm { .. }), "{}", err);
        }

        let unit = compile(&env, &[fn_of(vec![arity(0, false), arity(2, true)])]);
        assert_eq!(unit.data.codes.len(), 2);
        assert!(unit.data.codes[1].variadic);
        assert!(unit.data.instrs.contains(&Instr::MakeFn(2)));
    }

    #[test]
    fn test_named_fn_records_name() {
        let env = env();
        let p = pos();
        let f = Expr::new(
            p.clone(),
            ExprKind::Fn {
                name: Some(Symbol::new("step")),
                arities: vec![FnArity {
                    params: vec![],
                    variadic: false,
                    body: vec![int(&p, 1)],
                }],
            },
        );
        let unit = compile(&env, &[f]);
        assert_eq!(unit.data.codes[0].name.as_deref(), Some("step"));
    }

    #[test]
    fn test_line_table_follows_forms() {
        let env = env();
        let unit = compile(&env, &[int(&at(1), 1), int(&at(3), 2), int(&at(3), 3), int(&at(7), 4)]);

        assert_eq!(unit.line_at(0), Some(1));
        assert_eq!(unit.line_at(2), Some(3));
        assert_eq!(unit.line_at(4), Some(3));
        assert_eq!(unit.line_at(6), Some(7));
        assert_eq!(unit.lines.entries(), &[(0, 1), (2, 3), (6, 7)]);
    }

    #[test]
    fn test_filename_override_keeps_forms_local() {
        let env = env();
        let src = |line| Pos::new("src/core.kdl", line, 1);
        let f = fn1(&src(9), &[], vec![int(&src(10), 3)]);
        let unit = Compiler::new(&env, CompileOptions::default().with_filename("core.kdl"))
            .compile_unit(&[int(&src(1), 1), int(&src(5), 2), f])
            .unwrap();

        assert_eq!(&*unit.filename, "core.kdl");
        assert!(unit.macro_regions.is_empty());
        assert_eq!(unit.lines.entries(), &[(0, 1), (2, 5), (4, 9)]);
        assert_eq!(unit.line_at(4), Some(9));

        let inner = &unit.data.codes[0];
        assert_eq!(&*inner.filename, "core.kdl");
        assert!(inner.macro_regions.is_empty());
        assert_eq!(inner.line_at(0), Some(10));
    }

    #[test]
    fn test_lines_off_still_cover_origin() {
        let env = env();
        let options = CompileOptions {
            record_lines: false,
            ..CompileOptions::default()
        };
        let unit = Compiler::new(&env, options)
            .compile_unit(&[int(&at(5), 1), int(&at(9), 2)])
            .unwrap();
        assert_eq!(unit.lines.entries(), &[(0, 5)]);
    }

    #[test]
    fn test_macro_region_for_foreign_forms() {
        let env = env();
        let foreign = Pos::new("macros.kdl", 40, 3);
        let expanded = call(
            &foreign,
            sym(&foreign, "+"),
            vec![int(&at(2), 1), int(&foreign, 2)],
        );
        let unit = compile(&env, &[int(&at(1), 0), expanded]);

        assert_eq!(unit.macro_regions.len(), 1);
        let region = &unit.macro_regions[0];
        assert_eq!((region.start, region.end), (2, 6));
        assert_eq!(unit.source_at(3).unwrap().to_string(), "macros.kdl:40");
        assert_eq!(unit.source_at(0).unwrap().to_string(), "core.kdl:1");
    }

    #[test]
    fn test_try_catch_finally_layout() {
        let env = env();
        let p = pos();
        let expr = Expr::new(
            p.clone(),
            ExprKind::Try {
                body: vec![int(&p, 1)],
                catches: vec![Catch {
                    ty: Symbol::new("Exception"),
                    binding: Symbol::new("e"),
                    body: vec![fn1(&p, &[], vec![sym(&p, "e")])],
                }],
                finally: Some(vec![int(&p, 9)]),
            },
        );
        let unit = compile(&env, &[expr]);

        let instrs = &unit.data.instrs;
        assert!(matches!(instrs[0], Instr::EnterTry(_)));
        assert!(instrs.contains(&Instr::ExitTry));
        assert!(instrs.contains(&Instr::Rethrow));
        assert_eq!(unit.total_upvalues, 1);
        assert!(matches!(unit.data.globals[0], GlobalRef::Type(_)));

        // every jump lands inside the code
        for (ip, instr) in instrs.iter().enumerate() {
            let offset = match instr {
                Instr::Jump(o) | Instr::JumpIfFalse(o) | Instr::EnterTry(o) => *o,
                Instr::Catch { skip, .. } => *skip,
                _ => continue,
            };
            let target = ip as i32 + offset;
            assert!(target > 0 && (target as usize) < instrs.len());
        }
    }

    #[test]
    fn test_unknown_catch_type() {
        let env = env();
        let p = pos();
        let expr = Expr::new(
            p.clone(),
            ExprKind::Try {
                body: vec![int(&p, 1)],
                catches: vec![Catch {
                    ty: Symbol::new("Oops"),
                    binding: Symbol::new("e"),
                    body: vec![],
                }],
                finally: None,
            },
        );
        let err = Compiler::new(&env, CompileOptions::default())
            .compile_unit(&[expr])
            .unwrap_err();
        assert!(matches!(err, CompileError::UnknownType { .. }));
    }

    #[test]
    fn test_compiling_twice_is_deterministic() {
        let env = env();
        let p = pos();
        let tree = fn1(
            &p,
            &["a", "b"],
            vec![let_(
                &p,
                vec![("c", sym(&p, "a"))],
                vec![fn1(&p, &["d"], vec![call(&p, sym(&p, "+"), vec![sym(&p, "c"), sym(&p, "b"), sym(&p, "d")])])],
            )],
        );

        let first = compile(&env, std::slice::from_ref(&tree));
        let second = compile(&env, &[tree]);
        assert_eq!(first, second);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::lang::env::Environment;
    use crate::lang::node::build::{call, fn1, int, let_, sym};
    use proptest::prelude::*;

    const NAMES: [&str; 3] = ["a", "b", "c"];

    /// Trees over a handful of names that are also globals, so every
    /// reference resolves one way or the other.
    fn arb_expr() -> impl Strategy<Value = Expr> {
        let p = Pos::new("gen.kdl", 1, 1);
        let leaf = prop_oneof![
            (0i64..4).prop_map({
                let p = p.clone();
                move |n| int(&p, n)
            }),
            prop::sample::select(NAMES.to_vec()).prop_map({
                let p = p.clone();
                move |n| sym(&p, n)
            }),
        ];
        leaf.prop_recursive(4, 32, 3, move |inner| {
            let p1 = p.clone();
            let p2 = p.clone();
            let p3 = p.clone();
            prop_oneof![
                (prop::sample::select(NAMES.to_vec()), inner.clone(), inner.clone())
                    .prop_map(move |(n, init, body)| let_(&p1, vec![(n, init)], vec![body])),
                (prop::sample::subsequence(NAMES.to_vec(), 0..3), inner.clone())
                    .prop_map(move |(params, body)| fn1(&p2, &params, vec![body])),
                (inner.clone(), prop::collection::vec(inner, 0..3))
                    .prop_map(move |(callee, args)| call(&p3, callee, args)),
            ]
        })
    }

    fn env() -> Environment {
        let env = Environment::new("user");
        for name in NAMES {
            env.define("user", name);
        }
        env
    }

    proptest! {
        #[test]
        fn test_compile_is_deterministic_and_well_formed(tree in arb_expr()) {
            let env = env();
            let first = Compiler::new(&env, CompileOptions::default())
                .compile_unit(std::slice::from_ref(&tree))
                .unwrap();
            let second = Compiler::new(&env, CompileOptions::default())
                .compile_unit(&[tree])
                .unwrap();

            prop_assert_eq!(first.check(), Ok(()));
            prop_assert_eq!(first, second);
        }
    }
}
