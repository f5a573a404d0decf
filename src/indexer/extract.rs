use crate::model::SymbolKind;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolInput {
    pub kind: SymbolKind,
    pub name: String,
    pub qualname: String,
    pub start_line: i64,
    pub end_line: i64,
    pub start_byte: i64,
    pub end_byte: i64,
    pub fingerprint: String,
    pub docstring: Option<String>,
    pub comment: Option<String>,
    pub complexity: i64,
}

/// Syntactic shape of a call's callee expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    /// `f(...)`
    Name(String),
    /// `a.b.c(...)` with a receiver made only of plain names.
    Attribute { receiver: String, attr: String },
    /// Subscripts, call results, lambdas and anything else.
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    /// Innermost enclosing function or method.
    pub caller: String,
    /// Enclosing function scopes, innermost first (includes `caller`).
    pub scopes: Vec<String>,
    /// Class owning the nearest enclosing method, for `self`/`cls` receivers.
    pub method_class: Option<String>,
    pub target: CallTarget,
    pub raw: String,
    pub line: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractedFile {
    pub module: String,
    pub symbols: Vec<SymbolInput>,
    pub calls: Vec<CallSite>,
    /// Local name -> every dotted path an import statement bound it to.
    pub imports: BTreeMap<String, Vec<String>>,
    /// Class qualname -> base class expressions in declaration order.
    pub class_bases: BTreeMap<String, Vec<String>>,
    /// Function qualname -> names its body binds other than by `def`/`class`:
    /// parameters and assignment, loop, `with`/`except` and walrus targets.
    pub local_bindings: BTreeMap<String, BTreeSet<String>>,
    /// Module-level names bound by assignment, loops or `with`/`except`.
    pub module_bindings: BTreeSet<String>,
}

impl ExtractedFile {
    pub fn symbol(&self, qualname: &str) -> Option<&SymbolInput> {
        self.symbols.iter().find(|s| s.qualname == qualname)
    }

    /// True when `name` is a local variable of function `scope`.
    pub fn binds(&self, scope: &str, name: &str) -> bool {
        self.local_bindings
            .get(scope)
            .is_some_and(|names| names.contains(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    pub line: i64,
    pub message: String,
}

impl std::fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Qualified name of a definition nested under `scope` inside `module`.
pub fn member_qualname(module: &str, scope: &[String], name: &str) -> String {
    if scope.is_empty() {
        format!("{module}:{name}")
    } else {
        format!("{module}:{}.{name}", scope.join("."))
    }
}

/// Split `pkg.mod:Class.method` into (`pkg.mod`, `Class.method`).
pub fn split_qualname(qualname: &str) -> (&str, Option<&str>) {
    match qualname.split_once(':') {
        Some((module, path)) => (module, Some(path)),
        None => (qualname, None),
    }
}
