use crate::bytecode::ir::Code;
use crate::bytecode::op::Instr;

/// Print disassembly of a code object and everything nested in it
pub fn print_code(code: &Code) {
    print!("{}", disassemble(code));
}

/// Disassemble a code object (and its nested code, indented) into text
pub fn disassemble(code: &Code) -> String {
    let mut out = String::new();
    write_code(&mut out, code, 0);
    out
}

fn write_code(out: &mut String, code: &Code, indent: usize) {
    let prefix = "  ".repeat(indent);
    let name = code.name.as_deref().unwrap_or(if indent == 0 { "<unit>" } else { "<fn>" });
    let rule = format!("{}════════════════════════════════════════\n", prefix);

    out.push_str(&rule);
    out.push_str(&format!(
        "{} {} /{}{}\n",
        prefix,
        name,
        code.arity,
        if code.variadic { "+" } else { "" }
    ));
    out.push_str(&format!(
        "{} {} instructions, frame {}, upvalues {} ({} imported)\n",
        prefix,
        code.data.instrs.len(),
        code.frame_size,
        code.total_upvalues,
        code.imported_upvalues
    ));
    if !code.upvalue_names.is_empty() {
        out.push_str(&format!("{} imports: {}\n", prefix, code.upvalue_names.join(" ")));
    }
    if !code.promoted_names.is_empty() {
        out.push_str(&format!("{} promoted: {}\n", prefix, code.promoted_names.join(" ")));
    }
    out.push_str(&rule);

    let jump_targets = collect_jump_targets(&code.data.instrs);
    let mut last_line = None;

    for (ip, instr) in code.data.instrs.iter().enumerate() {
        if jump_targets.contains(&ip) {
            out.push_str(&format!("{}      ┌──────────────────────────────────\n", prefix));
        }

        let line = code.line_at(ip as u32);
        let line_col = match line {
            Some(l) if line != last_line => format!("{:>4}", l),
            _ => "   |".to_string(),
        };
        last_line = line;

        let marker = if jump_targets.contains(&ip) { "► " } else { "  " };
        out.push_str(&format!(
            "{}{:04} {} {}{}\n",
            prefix,
            ip,
            line_col,
            marker,
            format_instr(code, instr, ip)
        ));
    }
    out.push('\n');

    for child in &code.data.codes {
        write_code(out, child, indent + 1);
    }
}

fn collect_jump_targets(instrs: &[Instr]) -> Vec<usize> {
    let mut targets = Vec::new();

    for (ip, instr) in instrs.iter().enumerate() {
        let offset = match instr {
            Instr::Jump(offset) | Instr::JumpIfFalse(offset) | Instr::EnterTry(offset) => Some(*offset),
            Instr::Catch { skip, .. } => Some(*skip),
            _ => None,
        };

        if let Some(offset) = offset {
            let target = (ip as i64 + offset as i64) as usize;
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
    }

    targets
}

fn jump_text(mnemonic: &str, offset: i32, ip: usize) -> String {
    let target = (ip as i64 + offset as i64) as usize;
    let direction = if offset < 0 { "↑" } else { "↓" };
    format!("{:<12}{:+} {} (→ {:04})", mnemonic, offset, direction, target)
}

fn format_instr(code: &Code, instr: &Instr, ip: usize) -> String {
    let data = &code.data;
    let global = |i: &u32| {
        data.globals
            .get(*i as usize)
            .map_or_else(|| format!("<bad global {}>", i), |g| g.to_string())
    };

    match instr {
        Instr::Const(i) => {
            let lit = data
                .literals
                .get(*i as usize)
                .map_or_else(|| "<bad literal>".to_string(), |l| l.to_string());
            format!("CONST       {:<4} ; {}", i, lit)
        }
        Instr::Nil => "NIL".to_string(),

        Instr::Var(i) | Instr::Capture(i) => {
            let head = if matches!(instr, Instr::Capture(_)) { "CAPTURE " } else { "" };
            match data.operands.get(*i as usize) {
                Some(operand) => {
                    let text = format!("{}{} {}", head, operand.op.mnemonic(), operand.index);
                    match code.upvalue_name(operand.index).filter(|_| operand.op.is_upvalue()) {
                        Some(name) => format!("{:<20}; {}", text, name),
                        None => text,
                    }
                }
                None => format!("{}<bad operand {}>", head, i),
            }
        }

        Instr::Global(i) => format!("GLOBAL      {:<4} ; {}", i, global(i)),
        Instr::VarObject(i) => format!("VAR         {:<4} ; {}", i, global(i)),
        Instr::Define(i) => format!("DEFINE      {:<4} ; {}", i, global(i)),
        Instr::Declare(i) => format!("DECLARE     {:<4} ; {}", i, global(i)),

        Instr::Closure(i) => {
            let child = data.codes.get(*i as usize);
            let imports = child.map_or(0, |c| c.imported_upvalues);
            format!("CLOSURE     {:<4} ; {} capture(s)", i, imports)
        }
        Instr::MakeFn(n) => format!("MAKE_FN     {:<4} ; ( closure*{} -- fn )", n, n),

        Instr::Call(i) => match data.call_sites.get(*i as usize) {
            Some(site) => format!("CALL        {:<4} ; argc {} at {}:{}", i, site.argc, site.line, site.column),
            None => format!("CALL        <bad call site {}>", i),
        },

        Instr::Jump(offset) => jump_text("JUMP", *offset, ip),
        Instr::JumpIfFalse(offset) => jump_text("JUMP_FALSE", *offset, ip),

        Instr::Pop => "POP".to_string(),
        Instr::Return => "RETURN".to_string(),

        Instr::MakeVector(n) => format!("MAKE_VECTOR {:<4} ; ( x*{} -- vec )", n, n),
        Instr::MakeMap(n) => format!("MAKE_MAP    {:<4} ; ( k v *{} -- map )", n, n),
        Instr::MakeSet(n) => format!("MAKE_SET    {:<4} ; ( x*{} -- set )", n, n),
        Instr::WithMeta => "WITH_META   ; ( x meta -- x' )".to_string(),

        Instr::Throw => "THROW".to_string(),
        Instr::EnterTry(offset) => jump_text("ENTER_TRY", *offset, ip),
        Instr::ExitTry => "EXIT_TRY".to_string(),
        Instr::Catch { ty, skip } => format!("{} ; {}", jump_text("CATCH", *skip, ip), global(ty)),
        Instr::Rethrow => "RETHROW".to_string(),
    }
}
