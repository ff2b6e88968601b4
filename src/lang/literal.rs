use std::fmt::Write as _;

use super::reader::{reads_as_keyword, reads_as_symbol};
use super::symbol::Symbol;

/// Constant data that can sit in a code object's literal pool.
///
/// Literals only ever leave the process in their printed form (see
/// [`crate::lang::reader::read_literal`]), so `Display` must produce text the
/// reader accepts back.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Char(char),
    Keyword(Symbol),

    /// Quoted symbol: `'foo`.
    Symbol(Symbol),

    List(Vec<Literal>),
    Vector(Vec<Literal>),
    Map(Vec<(Literal, Literal)>),
    Set(Vec<Literal>),
}

impl Literal {
    pub fn type_name(&self) -> &'static str {
        match self {
            Literal::Nil => "nil",
            Literal::Bool(_) => "bool",
            Literal::Int(_) => "int",
            Literal::Float(_) => "double",
            Literal::Str(_) => "string",
            Literal::Char(_) => "char",
            Literal::Keyword(_) => "keyword",
            Literal::Symbol(_) => "symbol",
            Literal::List(_) => "list",
            Literal::Vector(_) => "vector",
            Literal::Map(_) => "map",
            Literal::Set(_) => "set",
        }
    }

    /// Whether the printed form reads back as this literal.
    pub fn is_readable(&self) -> bool {
        match self {
            Literal::Keyword(sym) => reads_as_keyword(sym),
            Literal::Symbol(sym) => reads_as_symbol(sym),
            Literal::List(items) | Literal::Vector(items) | Literal::Set(items) => {
                items.iter().all(Literal::is_readable)
            }
            Literal::Map(entries) => entries.iter().all(|(k, v)| k.is_readable() && v.is_readable()),
            _ => true,
        }
    }

    /// Collection nesting, counting the literal itself.
    pub fn depth(&self) -> usize {
        match self {
            Literal::List(items) | Literal::Vector(items) | Literal::Set(items) => {
                1 + items.iter().map(Literal::depth).max().unwrap_or(0)
            }
            Literal::Map(entries) => {
                1 + entries
                    .iter()
                    .map(|(k, v)| k.depth().max(v.depth()))
                    .max()
                    .unwrap_or(0)
            }
            _ => 1,
        }
    }
}

pub(crate) fn char_name(c: char) -> Option<&'static str> {
    match c {
        '\n' => Some("newline"),
        ' ' => Some("space"),
        '\t' => Some("tab"),
        '\r' => Some("return"),
        '\u{8}' => Some("backspace"),
        '\u{c}' => Some("formfeed"),
        _ => None,
    }
}

fn write_seq(
    f: &mut std::fmt::Formatter<'_>,
    open: &str,
    close: &str,
    items: &[Literal],
) -> std::fmt::Result {
    f.write_str(open)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_char(' ')?;
        }
        write!(f, "{}", item)?;
    }
    f.write_str(close)
}

impl std::fmt::Display for Literal {
    /// Format a literal in the runtime's readable syntax.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Literal::Nil => write!(f, "nil"),
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::Int(n) => write!(f, "{}", n),
            Literal::Float(x) if x.is_nan() => write!(f, "##NaN"),
            Literal::Float(x) if x.is_infinite() => {
                write!(f, "{}", if *x > 0.0 { "##Inf" } else { "##-Inf" })
            }
            // Debug gives the shortest text that parses back to the same bits.
            Literal::Float(x) => write!(f, "{:?}", x),
            Literal::Str(s) => {
                f.write_char('"')?;
                for ch in s.chars() {
                    match ch {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        '\t' => f.write_str("\\t")?,
                        '\r' => f.write_str("\\r")?,
                        '\0' => f.write_str("\\0")?,
                        c => f.write_char(c)?,
                    }
                }
                f.write_char('"')
            }
            Literal::Char(c) => match char_name(*c) {
                Some(name) => write!(f, "\\{}", name),
                None => write!(f, "\\{}", c),
            },
            Literal::Keyword(sym) => write!(f, ":{}", sym),
            Literal::Symbol(sym) => write!(f, "{}", sym),
            Literal::List(items) => write_seq(f, "(", ")", items),
            Literal::Vector(items) => write_seq(f, "[", "]", items),
            Literal::Set(items) => write_seq(f, "#{", "}", items),
            Literal::Map(entries) => {
                f.write_char('{')?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{} {}", k, v)?;
                }
                f.write_char('}')
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars_print() {
        assert_eq!(Literal::Nil.to_string(), "nil");
        assert_eq!(Literal::Int(-42).to_string(), "-42");
        assert_eq!(Literal::Float(1.0).to_string(), "1.0");
        assert_eq!(Literal::Float(f64::NEG_INFINITY).to_string(), "##-Inf");
        assert_eq!(Literal::Char('\n').to_string(), "\\newline");
        assert_eq!(Literal::Char('a').to_string(), "\\a");
    }

    #[test]
    fn test_string_escapes() {
        let lit = Literal::Str("say \"hi\"\n".to_string());
        assert_eq!(lit.to_string(), r#""say \"hi\"\n""#);
    }

    #[test]
    fn test_collections_print() {
        let lit = Literal::Map(vec![
            (
                Literal::Keyword(Symbol::new("a")),
                Literal::Vector(vec![Literal::Int(1), Literal::Int(2)]),
            ),
            (
                Literal::Keyword(Symbol::qualified("user", "b")),
                Literal::Set(vec![Literal::Bool(true)]),
            ),
        ]);
        assert_eq!(lit.to_string(), "{:a [1 2], :user/b #{true}}");
        assert_eq!(lit.depth(), 3);
        assert!(lit.is_readable());
    }

    #[test]
    fn test_symbol_named_like_a_scalar_is_not_readable() {
        assert!(!Literal::Symbol(Symbol::new("nil")).is_readable());
        assert!(!Literal::Vector(vec![Literal::Int(1), Literal::Symbol(Symbol::new("12"))]).is_readable());
        assert!(Literal::Symbol(Symbol::new("twelve")).is_readable());
    }
}
