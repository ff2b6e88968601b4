use std::sync::Arc;

/// A possibly namespace-qualified name: `x` or `core/map`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol {
    pub ns: Option<Arc<str>>,
    pub name: Arc<str>,
}

impl Symbol {
    pub fn new(name: &str) -> Self {
        Symbol {
            ns: None,
            name: Arc::from(name),
        }
    }

    pub fn qualified(ns: &str, name: &str) -> Self {
        Symbol {
            ns: Some(Arc::from(ns)),
            name: Arc::from(name),
        }
    }

    /// Split `ns/name` at the first slash. A lone `/` is the division symbol.
    pub fn parse(text: &str) -> Self {
        match text.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Symbol::qualified(ns, name),
            _ => Symbol::new(text),
        }
    }

    pub fn is_qualified(&self) -> bool {
        self.ns.is_some()
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.ns {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_and_qualified() {
        assert_eq!(Symbol::parse("x"), Symbol::new("x"));
        assert_eq!(Symbol::parse("core/map"), Symbol::qualified("core", "map"));
        assert_eq!(Symbol::parse("/"), Symbol::new("/"));
        assert_eq!(Symbol::parse("core//"), Symbol::qualified("core", "/"));
    }

    #[test]
    fn test_display() {
        assert_eq!(Symbol::qualified("user", "f").to_string(), "user/f");
        assert_eq!(Symbol::new("f").to_string(), "f");
    }
}
