use crate::indexer::extract::{CallSite, CallTarget, ExtractedFile, split_qualname};
use crate::model::SymbolKind;
use std::collections::{BTreeMap, HashMap};

/// Names a bare call never binds to repository code without an import.
const PYTHON_BUILTINS: &[&str] = &[
    "__import__", "abs", "all", "any", "ascii", "bin", "bool", "breakpoint", "bytearray", "bytes",
    "callable", "chr", "classmethod", "compile", "complex", "delattr", "dict", "dir", "divmod",
    "enumerate", "eval", "exec", "filter", "float", "format", "frozenset", "getattr", "globals",
    "hasattr", "hash", "help", "hex", "id", "input", "int", "isinstance", "issubclass", "iter",
    "len", "list", "locals", "map", "max", "memoryview", "min", "next", "object", "oct", "open",
    "ord", "pow", "print", "property", "range", "repr", "reversed", "round", "set", "setattr",
    "slice", "sorted", "staticmethod", "str", "sum", "super", "tuple", "type", "vars", "zip",
];

/// Every symbol visible to the resolver, keyed by qualified name.
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    kinds: HashMap<String, SymbolKind>,
    /// Short name -> module-level classes and functions carrying it.
    top_level: HashMap<String, Vec<String>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, qualname: impl Into<String>, kind: SymbolKind) {
        let qualname = qualname.into();
        if let (_, Some(member)) = split_qualname(&qualname) {
            if kind != SymbolKind::Module && !member.contains('.') {
                let named = self.top_level.entry(member.to_string()).or_default();
                if !named.contains(&qualname) {
                    named.push(qualname.clone());
                }
            }
        }
        self.kinds.insert(qualname, kind);
    }

    pub fn kind(&self, qualname: &str) -> Option<SymbolKind> {
        self.kinds.get(qualname).copied()
    }

    pub fn contains(&self, qualname: &str) -> bool {
        self.kinds.contains_key(qualname)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    fn is_module(&self, dotted: &str) -> bool {
        self.kind(dotted) == Some(SymbolKind::Module)
    }

    /// Call targets are functions, methods and classes; never modules.
    fn callable(&self, qualname: &str) -> Option<String> {
        match self.kind(qualname) {
            Some(SymbolKind::Module) | None => None,
            Some(_) => Some(qualname.to_string()),
        }
    }

    /// The one module-level definition named `name` across the repository.
    fn unique_top_level(&self, name: &str) -> Outcome {
        if PYTHON_BUILTINS.contains(&name) {
            return Outcome::Missing;
        }
        match self.top_level.get(name) {
            Some(candidates) => Outcome::from_candidates(candidates.clone()),
            None => Outcome::Missing,
        }
    }

    /// Resolve `pkg.mod.Class.attr` by taking the longest prefix that names
    /// a module and treating the remainder as a member path.
    pub fn resolve_dotted(&self, dotted: &str) -> Option<String> {
        let parts: Vec<&str> = dotted.split('.').filter(|p| !p.is_empty()).collect();
        for split in (1..=parts.len()).rev() {
            let module = parts[..split].join(".");
            if !self.is_module(&module) {
                continue;
            }
            if split == parts.len() {
                return None;
            }
            let member = parts[split..].join(".");
            return self.callable(&format!("{module}:{member}"));
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Resolution {
    Resolved(String),
    Unresolved(String),
}

impl Resolution {
    pub fn qualname(&self) -> Option<&str> {
        match self {
            Resolution::Resolved(qualname) => Some(qualname),
            Resolution::Unresolved(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEdge {
    pub caller: String,
    pub resolution: Resolution,
    pub raw: String,
    pub line: i64,
    /// More than one static binding claimed the callee name.
    pub ambiguous: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResolveStats {
    pub resolved: usize,
    pub unresolved: usize,
    pub ambiguous: usize,
}

enum Outcome {
    Found(String),
    Missing,
    Ambiguous,
}

impl Outcome {
    fn from_candidates(mut candidates: Vec<String>) -> Self {
        candidates.sort();
        candidates.dedup();
        match candidates.len() {
            0 => Outcome::Missing,
            1 => Outcome::Found(candidates.remove(0)),
            _ => Outcome::Ambiguous,
        }
    }
}

/// Resolve every call site of one file against the complete symbol table.
/// Edges are deduplicated per (caller, callee), keeping the earliest line.
pub fn resolve_file(file: &ExtractedFile, table: &SymbolTable) -> (Vec<ResolvedEdge>, ResolveStats) {
    let resolver = FileResolver { file, table };
    let mut edges: BTreeMap<(String, Resolution), ResolvedEdge> = BTreeMap::new();
    for call in &file.calls {
        let (resolution, ambiguous) = match resolver.resolve(call) {
            Outcome::Found(qualname) => (Resolution::Resolved(qualname), false),
            Outcome::Missing => (Resolution::Unresolved(call.raw.clone()), false),
            Outcome::Ambiguous => (Resolution::Unresolved(call.raw.clone()), true),
        };
        let key = (call.caller.clone(), resolution.clone());
        match edges.get_mut(&key) {
            Some(existing) => {
                if call.line < existing.line {
                    existing.line = call.line;
                }
            }
            None => {
                edges.insert(
                    key,
                    ResolvedEdge {
                        caller: call.caller.clone(),
                        resolution,
                        raw: call.raw.clone(),
                        line: call.line,
                        ambiguous,
                    },
                );
            }
        }
    }

    let mut stats = ResolveStats::default();
    let mut out: Vec<ResolvedEdge> = edges.into_values().collect();
    out.sort_by(|a, b| {
        a.caller
            .cmp(&b.caller)
            .then(a.line.cmp(&b.line))
            .then(a.resolution.cmp(&b.resolution))
    });
    for edge in &out {
        match edge.resolution {
            Resolution::Resolved(_) => stats.resolved += 1,
            Resolution::Unresolved(_) => stats.unresolved += 1,
        }
        if edge.ambiguous {
            stats.ambiguous += 1;
        }
    }
    (out, stats)
}

struct FileResolver<'a> {
    file: &'a ExtractedFile,
    table: &'a SymbolTable,
}

impl FileResolver<'_> {
    fn resolve(&self, call: &CallSite) -> Outcome {
        match &call.target {
            CallTarget::Name(name) => self.resolve_name(name, &call.scopes),
            CallTarget::Attribute { receiver, attr } => {
                if matches!(receiver.as_str(), "self" | "cls") {
                    if let Some(class) = &call.method_class {
                        return self.resolve_self_attr(class, attr);
                    }
                }
                let head = receiver.split('.').next().unwrap_or(receiver);
                if call.scopes.iter().any(|scope| self.file.binds(scope, head)) {
                    return Outcome::Missing;
                }
                self.resolve_attribute(receiver, attr)
            }
            CallTarget::Dynamic => Outcome::Missing,
        }
    }

    fn resolve_name(&self, name: &str, scopes: &[String]) -> Outcome {
        // A name bound by a parameter or assignment holds a runtime value.
        for scope in scopes {
            let nested = self.table.callable(&format!("{scope}.{name}"));
            match (nested, self.file.binds(scope, name)) {
                (Some(_), true) => return Outcome::Ambiguous,
                (Some(found), false) => return Outcome::Found(found),
                (None, true) => return Outcome::Missing,
                (None, false) => {}
            }
        }
        let local = self
            .table
            .callable(&format!("{}:{name}", self.file.module));
        let imported = self.file.imports.get(name);
        let assigned = self.file.module_bindings.contains(name);
        match (local, imported, assigned) {
            (Some(_), Some(_), _) | (Some(_), None, true) | (None, Some(_), true) => {
                Outcome::Ambiguous
            }
            (None, None, true) => Outcome::Missing,
            (Some(local), None, false) => Outcome::Found(local),
            (None, Some(paths), false) => Outcome::from_candidates(
                paths
                    .iter()
                    .filter_map(|path| self.table.resolve_dotted(path))
                    .collect(),
            ),
            (None, None, false) => self.table.unique_top_level(name),
        }
    }

    /// `self.attr()` binds to the enclosing class, then to its first base.
    fn resolve_self_attr(&self, class: &str, attr: &str) -> Outcome {
        if let Some(found) = self.table.callable(&format!("{class}.{attr}")) {
            return Outcome::Found(found);
        }
        let Some(base) = self
            .file
            .class_bases
            .get(class)
            .and_then(|bases| bases.first())
        else {
            return Outcome::Missing;
        };
        let Outcome::Found(base_class) = self.resolve_class_expr(base) else {
            return Outcome::Missing;
        };
        match self.table.callable(&format!("{base_class}.{attr}")) {
            Some(found) => Outcome::Found(found),
            None => Outcome::Missing,
        }
    }

    fn resolve_class_expr(&self, expr: &str) -> Outcome {
        let (head, rest) = match expr.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (expr, None),
        };
        if rest.is_none() {
            let local = format!("{}:{head}", self.file.module);
            if self.table.kind(&local) == Some(SymbolKind::Class) {
                return Outcome::Found(local);
            }
        }
        let Some(paths) = self.file.imports.get(head) else {
            return Outcome::Missing;
        };
        let candidates = paths
            .iter()
            .filter_map(|path| {
                let dotted = match rest {
                    Some(rest) => format!("{path}.{rest}"),
                    None => path.clone(),
                };
                self.table.resolve_dotted(&dotted)
            })
            .filter(|qualname| self.table.kind(qualname) == Some(SymbolKind::Class))
            .collect();
        Outcome::from_candidates(candidates)
    }

    fn resolve_attribute(&self, receiver: &str, attr: &str) -> Outcome {
        let (head, rest) = match receiver.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (receiver, None),
        };
        let local = if rest.is_none() {
            let class = format!("{}:{head}", self.file.module);
            if self.table.kind(&class) == Some(SymbolKind::Class) {
                self.table.callable(&format!("{class}.{attr}"))
            } else {
                None
            }
        } else {
            None
        };
        let imported = self.file.imports.get(head);
        match (local, imported) {
            (Some(_), Some(_)) => Outcome::Ambiguous,
            (Some(local), None) => Outcome::Found(local),
            (None, Some(paths)) => Outcome::from_candidates(
                paths
                    .iter()
                    .filter_map(|path| {
                        let dotted = match rest {
                            Some(rest) => format!("{path}.{rest}.{attr}"),
                            None => format!("{path}.{attr}"),
                        };
                        self.table.resolve_dotted(&dotted)
                    })
                    .collect(),
            ),
            (None, None) => Outcome::Missing,
        }
    }
}

/// Last dotted segment of a raw callee, used to spot calls a newly added
/// symbol might now satisfy.
pub fn raw_tail(raw: &str) -> &str {
    raw.rsplit('.').next().unwrap_or(raw).trim()
}

/// Short name of a qualified symbol name (`pkg.mod:C.m` -> `m`).
pub fn short_name(qualname: &str) -> &str {
    match split_qualname(qualname) {
        (_, Some(path)) => path.rsplit('.').next().unwrap_or(path),
        (module, None) => module.rsplit('.').next().unwrap_or(module),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::python::PythonExtractor;

    fn extract(source: &str, rel_path: &str) -> ExtractedFile {
        PythonExtractor::new()
            .unwrap()
            .extract(source, rel_path)
            .unwrap()
    }

    fn table_for(files: &[&ExtractedFile]) -> SymbolTable {
        let mut table = SymbolTable::new();
        for file in files {
            for symbol in &file.symbols {
                table.insert(symbol.qualname.clone(), symbol.kind);
            }
        }
        table
    }

    fn targets(edges: &[ResolvedEdge], caller: &str) -> Vec<Resolution> {
        edges
            .iter()
            .filter(|e| e.caller == caller)
            .map(|e| e.resolution.clone())
            .collect()
    }

    #[test]
    fn resolves_imports_locals_and_nested_scopes() {
        let b = extract("def g():\n    pass\n", "b.py");
        let a = extract(
            "from b import g\nimport b as bee\n\ndef h():\n    pass\n\ndef f():\n    def inner():\n        h()\n    g()\n    bee.g()\n    inner()\n    print('x')\n",
            "a.py",
        );
        let table = table_for(&[&a, &b]);
        let (edges, stats) = resolve_file(&a, &table);
        assert_eq!(
            targets(&edges, "a:f"),
            vec![
                Resolution::Resolved("b:g".to_string()),
                Resolution::Resolved("a:f.inner".to_string()),
                Resolution::Unresolved("print".to_string()),
            ]
        );
        assert_eq!(
            targets(&edges, "a:f.inner"),
            vec![Resolution::Resolved("a:h".to_string())]
        );
        assert_eq!(stats.unresolved, 1);
    }

    #[test]
    fn self_calls_use_class_then_first_base() {
        let base = extract("class Base:\n    def ping(self):\n        pass\n", "base.py");
        let child = extract(
            "from base import Base\n\nclass Child(Base, metaclass=Meta):\n    def run(self):\n        self.ping()\n        self.run()\n        self.nope()\n",
            "child.py",
        );
        let table = table_for(&[&base, &child]);
        let (edges, _) = resolve_file(&child, &table);
        assert_eq!(
            targets(&edges, "child:Child.run"),
            vec![
                Resolution::Resolved("base:Base.ping".to_string()),
                Resolution::Resolved("child:Child.run".to_string()),
                Resolution::Unresolved("self.nope".to_string()),
            ]
        );
    }

    #[test]
    fn local_definition_and_import_of_same_name_is_ambiguous() {
        let b = extract("def g():\n    pass\n", "b.py");
        let a = extract(
            "from b import g\n\ndef g():\n    pass\n\ndef f():\n    g()\n",
            "a.py",
        );
        let table = table_for(&[&a, &b]);
        let (edges, stats) = resolve_file(&a, &table);
        assert_eq!(
            targets(&edges, "a:f"),
            vec![Resolution::Unresolved("g".to_string())]
        );
        assert_eq!(stats.ambiguous, 1);
    }

    #[test]
    fn repeated_calls_collapse_to_first_line() {
        let a = extract("def g():\n    pass\n\ndef f():\n    g()\n    g()\n", "a.py");
        let table = table_for(&[&a]);
        let (edges, stats) = resolve_file(&a, &table);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].line, 5);
        assert_eq!(stats.resolved, 1);
    }

    #[test]
    fn unimported_name_binds_to_unique_top_level_definition() {
        let b = extract("def g():\n    pass\n\ndef run():\n    pass\n", "b.py");
        let c = extract("def run():\n    pass\n\ndef open():\n    pass\n", "c.py");
        let a = extract("def f():\n    g()\n    run()\n    open()\n", "a.py");
        let table = table_for(&[&a, &b, &c]);
        let (edges, stats) = resolve_file(&a, &table);
        assert_eq!(
            targets(&edges, "a:f"),
            vec![
                Resolution::Resolved("b:g".to_string()),
                Resolution::Unresolved("run".to_string()),
                Resolution::Unresolved("open".to_string()),
            ]
        );
        assert_eq!(stats.ambiguous, 1);
    }

    #[test]
    fn locally_bound_names_never_take_the_fallback() {
        let b = extract("def handler(x):\n    pass\n\ndef sink():\n    pass\n", "b.py");
        let a = extract(
            "import b\n\nsink = b.sink\n\ndef apply(handler, items):\n    for x in items:\n        handler(x)\n    sink()\n\ndef twice(b):\n    b.handler()\n\ndef local():\n    cb = pick()\n    cb()\n\ndef cb():\n    pass\n\ndef pick():\n    pass\n\ndef shadowed(cb):\n    cb()\n",
            "a.py",
        );
        let table = table_for(&[&a, &b]);
        let (edges, _) = resolve_file(&a, &table);
        assert_eq!(
            targets(&edges, "a:apply"),
            vec![
                Resolution::Unresolved("handler".to_string()),
                Resolution::Unresolved("sink".to_string()),
            ]
        );
        assert_eq!(
            targets(&edges, "a:twice"),
            vec![Resolution::Unresolved("b.handler".to_string())]
        );
        assert_eq!(
            targets(&edges, "a:local"),
            vec![
                Resolution::Resolved("a:pick".to_string()),
                Resolution::Unresolved("cb".to_string()),
            ]
        );
        assert_eq!(
            targets(&edges, "a:shadowed"),
            vec![Resolution::Unresolved("cb".to_string())]
        );
    }

    #[test]
    fn dotted_paths_never_resolve_to_modules() {
        let mut table = SymbolTable::new();
        table.insert("pkg", SymbolKind::Module);
        table.insert("pkg.sub", SymbolKind::Module);
        table.insert("pkg.sub:run", SymbolKind::Function);
        assert_eq!(table.resolve_dotted("pkg.sub.run").as_deref(), Some("pkg.sub:run"));
        assert_eq!(table.resolve_dotted("pkg.sub"), None);
        assert_eq!(table.resolve_dotted("pkg.missing"), None);
    }

    #[test]
    fn short_names() {
        assert_eq!(short_name("pkg.mod:C.m"), "m");
        assert_eq!(short_name("pkg.mod"), "mod");
        assert_eq!(raw_tail("self.client.get"), "get");
    }
}
