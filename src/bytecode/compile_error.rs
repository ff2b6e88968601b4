use crate::lang::env::EnvError;
use crate::lang::node::Pos;

fn hint_line(hint: &Option<String>) -> String {
    match hint {
        Some(h) => format!("\n  hint: {}", h),
        None => String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    /// A name bound neither lexically nor in the global environment
    #[error("compile error: {pos}: unable to resolve symbol '{name}'{}", hint_line(.hint))]
    Unresolved {
        name: String,
        pos: Pos,
        hint: Option<String>,
    },

    /// A form that's valid but appeared in an invalid shape or position
    #[error("compile error: {pos}: {node_type}: {reason}{}", hint_line(.hint))]
    InvalidForm {
        node_type: String,
        reason: String,
        pos: Pos,
        hint: Option<String>,
    },

    #[error("compile error: {pos}: recur outside of loop or fn{}", hint_line(.hint))]
    RecurOutsideLoop { pos: Pos, hint: Option<String> },

    #[error("compile error: {pos}: recur expects {expected} arguments, got {got}")]
    RecurArity { expected: usize, got: usize, pos: Pos },

    #[error("compile error: {pos}: unknown type '{name}' in catch clause")]
    UnknownType { name: String, pos: Pos },

    #[error("compile error: {pos}: {source}")]
    Environment { source: EnvError, pos: Pos },

    /// Internal compiler error (shouldn't happen in normal use)
    #[error("compile error: internal error: {0}")]
    Internal(String),
}

impl CompileError {
    pub fn unresolved(name: impl std::fmt::Display, pos: &Pos) -> Self {
        CompileError::Unresolved {
            name: name.to_string(),
            pos: pos.clone(),
            hint: None,
        }
    }

    /// Unresolved qualified name: point at the namespace part.
    pub fn unresolved_qualified(name: impl std::fmt::Display, ns: &str, pos: &Pos) -> Self {
        CompileError::Unresolved {
            name: name.to_string(),
            pos: pos.clone(),
            hint: Some(format!(
                "namespace '{}' must define it before this unit is compiled",
                ns
            )),
        }
    }

    pub fn invalid(
        node_type: &str,
        reason: impl Into<String>,
        pos: &Pos,
        hint: Option<&str>,
    ) -> Self {
        CompileError::InvalidForm {
            node_type: node_type.to_string(),
            reason: reason.into(),
            pos: pos.clone(),
            hint: hint.map(str::to_string),
        }
    }

    pub fn recur_outside_loop(pos: &Pos) -> Self {
        CompileError::RecurOutsideLoop {
            pos: pos.clone(),
            hint: Some("recur must appear inside a loop body or a fn body".to_string()),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal(msg.into())
    }

    /// Source position for rendering a diagnostic, if the error has one.
    pub fn pos(&self) -> Option<&Pos> {
        match self {
            CompileError::Unresolved { pos, .. }
            | CompileError::InvalidForm { pos, .. }
            | CompileError::RecurOutsideLoop { pos, .. }
            | CompileError::RecurArity { pos, .. }
            | CompileError::UnknownType { pos, .. }
            | CompileError::Environment { pos, .. } => Some(pos),
            CompileError::Internal(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos() -> Pos {
        Pos::new("core.kdl", 12, 5)
    }

    #[test]
    fn test_unresolved_display() {
        let err = CompileError::unresolved("frob", &pos());

        let msg = err.to_string();
        assert!(msg.starts_with("compile error:"));
        assert!(msg.contains("core.kdl:12:5"));
        assert!(msg.contains("frob"));
        assert!(!msg.contains("hint"));
    }

    #[test]
    fn test_unresolved_qualified_has_hint() {
        let err = CompileError::unresolved_qualified("str/join", "str", &pos());

        let msg = err.to_string();
        assert!(msg.contains("str/join"));
        assert!(msg.contains("\n  hint: namespace 'str'"));
    }

    #[test]
    fn test_invalid_form_display() {
        let err = CompileError::invalid("fn", "two variadic arities", &pos(), Some("keep one"));

        let msg = err.to_string();
        assert!(msg.contains("fn: two variadic arities"));
        assert!(msg.contains("hint: keep one"));
    }

    #[test]
    fn test_recur_errors() {
        let err = CompileError::recur_outside_loop(&pos());
        assert!(err.to_string().contains("recur outside"));
        assert!(err.to_string().contains("hint"));

        let err = CompileError::RecurArity {
            expected: 2,
            got: 1,
            pos: pos(),
        };
        assert!(err.to_string().contains("expects 2 arguments, got 1"));
    }

    #[test]
    fn test_environment_error_wraps_source() {
        let err = CompileError::Environment {
            source: EnvError::NoSuchNamespace("x".to_string()),
            pos: pos(),
        };
        assert!(err.to_string().contains("no namespace named 'x'"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_internal_has_no_position() {
        let err = CompileError::internal("something went wrong");

        assert!(err.pos().is_none());
        assert!(err.to_string().contains("internal error: something went wrong"));
    }
}
