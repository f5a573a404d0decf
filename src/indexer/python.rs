use crate::error::{Error, Result};
use crate::indexer::extract::{
    CallSite, CallTarget, ExtractedFile, ParseFailure, SymbolInput, member_qualname,
};
use crate::metrics;
use crate::model::SymbolKind;
use crate::util;
use std::collections::BTreeSet;
use std::path::Path;
use tree_sitter::{Node, Parser};

/// Raw callee text kept for diagnostics is capped at this many bytes.
const MAX_RAW_CALLEE_BYTES: usize = 200;

#[derive(Clone)]
struct Context {
    module: String,
    base_package: Vec<String>,
    /// Names of enclosing classes and functions, outermost first.
    scope: Vec<String>,
    /// Qualnames of enclosing functions, outermost first.
    fn_scopes: Vec<String>,
    /// Class whose body directly contains the current node.
    in_class: Option<String>,
    method_class: Option<String>,
}

pub struct PythonExtractor {
    parser: Parser,
}

impl PythonExtractor {
    pub fn new() -> Result<Self> {
        let mut parser = Parser::new();
        let language = tree_sitter_python::LANGUAGE;
        parser
            .set_language(&language.into())
            .map_err(|err| Error::Config(format!("python grammar: {err}")))?;
        Ok(Self { parser })
    }

    /// Parse one file. Files with syntax errors produce a `ParseFailure`
    /// instead of a partial outline.
    pub fn extract(
        &mut self,
        source: &str,
        rel_path: &str,
    ) -> std::result::Result<ExtractedFile, ParseFailure> {
        let module = module_name_from_rel_path(rel_path);
        let tree = self.parser.parse(source, None).ok_or_else(|| ParseFailure {
            line: 1,
            message: "parser produced no tree".to_string(),
        })?;
        let root = tree.root_node();
        if root.has_error() {
            return Err(first_syntax_error(root));
        }

        let mut output = ExtractedFile {
            module: module.clone(),
            ..Default::default()
        };
        output.symbols.push(SymbolInput {
            kind: SymbolKind::Module,
            name: module.rsplit('.').next().unwrap_or(&module).to_string(),
            qualname: module.clone(),
            start_line: 1,
            end_line: line_count(source),
            start_byte: 0,
            end_byte: source.len() as i64,
            fingerprint: util::content_hash(source.as_bytes()),
            docstring: extract_docstring(root, source),
            comment: None,
            complexity: metrics::complexity(root),
        });
        let ctx = Context {
            module,
            base_package: base_package_parts(rel_path),
            scope: Vec::new(),
            fn_scopes: Vec::new(),
            in_class: None,
            method_class: None,
        };
        walk_children(root, &ctx, source, &mut output);
        Ok(output)
    }
}

pub fn module_name_from_rel_path(rel_path: &str) -> String {
    let path = Path::new(rel_path);
    let mut parts: Vec<String> = path
        .components()
        .filter_map(|comp| comp.as_os_str().to_str().map(|s| s.to_string()))
        .collect();
    if parts.is_empty() {
        return "__init__".to_string();
    }
    let file = parts.pop().unwrap_or_default();
    let stem = Path::new(&file)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(&file)
        .to_string();
    if stem != "__init__" {
        parts.push(stem);
    }
    if parts.is_empty() {
        "__init__".to_string()
    } else {
        parts.join(".")
    }
}

fn walk_node(node: Node<'_>, ctx: &Context, source: &str, output: &mut ExtractedFile) {
    match node.kind() {
        "decorated_definition" => {
            let mut definition = None;
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                if child.kind() == "decorator" {
                    walk_node(child, ctx, source, output);
                } else {
                    definition = Some(child);
                }
            }
            if let Some(definition) = definition {
                handle_definition(definition, node, ctx, source, output);
            }
        }
        "function_definition" | "async_function_definition" | "class_definition" => {
            handle_definition(node, node, ctx, source, output);
        }
        "import_statement" | "import_from_statement" => {
            let text = node_text(node, source);
            for (local, path) in parse_import_bindings(&text, &ctx.base_package) {
                let paths = output.imports.entry(local).or_default();
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        "assignment" | "augmented_assignment" | "for_statement" => {
            if let Some(left) = node.child_by_field_name("left") {
                record_targets(left, ctx, source, output, true);
            }
            walk_children(node, ctx, source, output);
        }
        // Comprehension variables stay inside the comprehension.
        "for_in_clause" => {
            if let Some(left) = node.child_by_field_name("left") {
                record_targets(left, ctx, source, output, false);
            }
            walk_children(node, ctx, source, output);
        }
        "named_expression" => {
            if let Some(name) = node.child_by_field_name("name") {
                record_targets(name, ctx, source, output, true);
            }
            walk_children(node, ctx, source, output);
        }
        "as_pattern" | "except_clause" => {
            if let Some(alias) = node.child_by_field_name("alias") {
                record_targets(alias, ctx, source, output, true);
            }
            walk_children(node, ctx, source, output);
        }
        "lambda" => {
            if let Some(parameters) = node.child_by_field_name("parameters") {
                add_bindings(ctx, parameter_names(parameters, source), output, false);
            }
            walk_children(node, ctx, source, output);
        }
        "call" => {
            handle_call(node, ctx, source, output);
            walk_children(node, ctx, source, output);
        }
        _ => walk_children(node, ctx, source, output),
    }
}

fn record_targets(
    node: Node<'_>,
    ctx: &Context,
    source: &str,
    output: &mut ExtractedFile,
    leaks_to_module: bool,
) {
    let mut names = BTreeSet::new();
    target_names(node, source, &mut names);
    add_bindings(ctx, names, output, leaks_to_module);
}

/// Class bodies bind attributes, which bare names inside methods never see.
fn add_bindings(
    ctx: &Context,
    names: impl IntoIterator<Item = String>,
    output: &mut ExtractedFile,
    leaks_to_module: bool,
) {
    if ctx.in_class.is_some() {
        return;
    }
    match ctx.fn_scopes.last() {
        Some(scope) => output
            .local_bindings
            .entry(scope.clone())
            .or_default()
            .extend(names),
        None if leaks_to_module => output.module_bindings.extend(names),
        None => {}
    }
}

/// Plain names bound by an assignment target; attribute and subscript
/// targets bind nothing.
fn target_names(node: Node<'_>, source: &str, names: &mut BTreeSet<String>) {
    match node.kind() {
        "identifier" => {
            names.insert(node_text(node, source));
        }
        "attribute" | "subscript" => {}
        _ => {
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                target_names(child, source, names);
            }
        }
    }
}

fn parameter_names(parameters: Node<'_>, source: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut cursor = parameters.walk();
    for child in parameters.named_children(&mut cursor) {
        match child.kind() {
            "identifier" => names.push(node_text(child, source)),
            "default_parameter" | "typed_default_parameter" => {
                if let Some(name) = child.child_by_field_name("name") {
                    let mut bound = BTreeSet::new();
                    target_names(name, source, &mut bound);
                    names.extend(bound);
                }
            }
            "typed_parameter" | "list_splat_pattern" | "dictionary_splat_pattern" => {
                names.extend(parameter_names(child, source));
            }
            _ => {}
        }
    }
    names
}

fn walk_children(node: Node<'_>, ctx: &Context, source: &str, output: &mut ExtractedFile) {
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        walk_node(child, ctx, source, output);
    }
}

/// `outer` is the decorated wrapper when present; spans and fingerprints
/// cover the decorators too.
fn handle_definition(
    node: Node<'_>,
    outer: Node<'_>,
    ctx: &Context,
    source: &str,
    output: &mut ExtractedFile,
) {
    let Some(name_node) = node.child_by_field_name("name") else {
        return;
    };
    let name = node_text(name_node, source);
    if name.is_empty() {
        return;
    }
    let qualname = member_qualname(&ctx.module, &ctx.scope, &name);
    let is_class = node.kind() == "class_definition";
    let kind = if is_class {
        SymbolKind::Class
    } else if ctx.in_class.is_some() {
        SymbolKind::Method
    } else {
        SymbolKind::Function
    };

    forget_definition(output, &qualname);
    output.symbols.push(SymbolInput {
        kind,
        name: name.clone(),
        qualname: qualname.clone(),
        start_line: outer.start_position().row as i64 + 1,
        end_line: outer.end_position().row as i64 + 1,
        start_byte: outer.start_byte() as i64,
        end_byte: outer.end_byte() as i64,
        fingerprint: util::content_hash(
            util::slice_bytes(source, outer.start_byte(), outer.end_byte()).as_bytes(),
        ),
        docstring: node
            .child_by_field_name("body")
            .and_then(|body| extract_docstring(body, source)),
        comment: leading_comment(outer, source),
        complexity: metrics::complexity(node),
    });

    let mut next_ctx = ctx.clone();
    next_ctx.scope.push(name);
    if is_class {
        let mut bases = Vec::new();
        if let Some(superclasses) = node.child_by_field_name("superclasses") {
            let mut cursor = superclasses.walk();
            for child in superclasses.named_children(&mut cursor) {
                if child.kind() == "keyword_argument" || child.kind() == "comment" {
                    continue;
                }
                bases.push(node_text(child, source));
            }
            walk_node(superclasses, ctx, source, output);
        }
        output.class_bases.insert(qualname.clone(), bases);
        next_ctx.in_class = Some(qualname);
        next_ctx.method_class = None;
    } else {
        if let Some(parameters) = node.child_by_field_name("parameters") {
            output
                .local_bindings
                .entry(qualname.clone())
                .or_default()
                .extend(parameter_names(parameters, source));
            walk_node(parameters, ctx, source, output);
        }
        if kind == SymbolKind::Method {
            next_ctx.method_class = ctx.in_class.clone();
        }
        next_ctx.in_class = None;
        next_ctx.fn_scopes.push(qualname);
    }
    if let Some(body) = node.child_by_field_name("body") {
        walk_children(body, &next_ctx, source, output);
    }
}

/// A later definition with the same qualified name replaces the earlier one,
/// together with everything nested in it.
fn forget_definition(output: &mut ExtractedFile, qualname: &str) {
    let nested = format!("{qualname}.");
    let shadowed = |candidate: &str| candidate == qualname || candidate.starts_with(&nested);
    if !output.symbols.iter().any(|s| shadowed(&s.qualname)) {
        return;
    }
    output.symbols.retain(|s| !shadowed(&s.qualname));
    output.calls.retain(|call| !shadowed(&call.caller));
    output.class_bases.retain(|class, _| !shadowed(class));
    output.local_bindings.retain(|scope, _| !shadowed(scope));
}

fn handle_call(node: Node<'_>, ctx: &Context, source: &str, output: &mut ExtractedFile) {
    let Some(caller) = ctx.fn_scopes.last() else {
        return;
    };
    let Some(function) = node.child_by_field_name("function") else {
        return;
    };
    let raw = util::truncate_str_bytes(
        &util::squash_whitespace(&node_text(function, source)),
        MAX_RAW_CALLEE_BYTES,
    );
    if raw.is_empty() {
        return;
    }
    let target = match function.kind() {
        "identifier" => CallTarget::Name(raw.clone()),
        "attribute" => {
            let receiver = function
                .child_by_field_name("object")
                .and_then(|object| dotted_chain(object, source));
            let attr = function
                .child_by_field_name("attribute")
                .map(|attr| node_text(attr, source));
            match (receiver, attr) {
                (Some(receiver), Some(attr)) if !attr.is_empty() => {
                    CallTarget::Attribute { receiver, attr }
                }
                _ => CallTarget::Dynamic,
            }
        }
        _ => CallTarget::Dynamic,
    };
    output.calls.push(CallSite {
        caller: caller.clone(),
        scopes: ctx.fn_scopes.iter().rev().cloned().collect(),
        method_class: ctx.method_class.clone(),
        target,
        raw,
        line: node.start_position().row as i64 + 1,
    });
}

/// `a`, `a.b`, `a.b.c` built only from identifiers; anything else is dynamic.
fn dotted_chain(node: Node<'_>, source: &str) -> Option<String> {
    match node.kind() {
        "identifier" => Some(node_text(node, source)),
        "attribute" => {
            let object = dotted_chain(node.child_by_field_name("object")?, source)?;
            let attr = node.child_by_field_name("attribute")?;
            if attr.kind() != "identifier" {
                return None;
            }
            Some(format!("{object}.{}", node_text(attr, source)))
        }
        _ => None,
    }
}

fn first_syntax_error(root: Node<'_>) -> ParseFailure {
    fn find(node: Node<'_>) -> Option<ParseFailure> {
        if node.is_error() {
            return Some(ParseFailure {
                line: node.start_position().row as i64 + 1,
                message: "syntax error".to_string(),
            });
        }
        if node.is_missing() {
            return Some(ParseFailure {
                line: node.start_position().row as i64 + 1,
                message: format!("missing {}", node.kind()),
            });
        }
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if child.has_error() || child.is_missing() {
                if let Some(found) = find(child) {
                    return Some(found);
                }
            }
        }
        None
    }
    find(root).unwrap_or_else(|| ParseFailure {
        line: 1,
        message: "syntax error".to_string(),
    })
}

fn node_text(node: Node<'_>, source: &str) -> String {
    util::slice_bytes(source, node.start_byte(), node.end_byte())
        .trim()
        .to_string()
}

fn extract_docstring(node: Node<'_>, source: &str) -> Option<String> {
    let mut cursor = node.walk();
    let first = node
        .named_children(&mut cursor)
        .find(|child| child.kind() != "comment")?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let string_node = first.named_child(0)?;
    if string_node.kind() != "string" {
        return None;
    }
    let raw = node_text(string_node, source);
    let doc = unquote_string_literal(&raw).unwrap_or(raw);
    let doc = doc.trim();
    if doc.is_empty() {
        None
    } else {
        Some(doc.to_string())
    }
}

fn unquote_string_literal(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut idx = 0;
    for (offset, ch) in trimmed.char_indices() {
        if ch.is_ascii_alphabetic() {
            idx = offset + ch.len_utf8();
        } else {
            break;
        }
    }
    let rest = &trimmed[idx..];
    if rest.starts_with("'''") && rest.ends_with("'''") && rest.len() >= 6 {
        return Some(rest[3..rest.len() - 3].to_string());
    }
    if rest.starts_with("\"\"\"") && rest.ends_with("\"\"\"") && rest.len() >= 6 {
        return Some(rest[3..rest.len() - 3].to_string());
    }
    if rest.starts_with('"') && rest.ends_with('"') && rest.len() >= 2 {
        return Some(rest[1..rest.len() - 1].to_string());
    }
    if rest.starts_with('\'') && rest.ends_with('\'') && rest.len() >= 2 {
        return Some(rest[1..rest.len() - 1].to_string());
    }
    None
}

/// Contiguous `#` lines directly above a definition, at its indentation.
fn leading_comment(node: Node<'_>, source: &str) -> Option<String> {
    let column = node.start_position().column;
    let mut expected_row = node.start_position().row;
    let mut lines = Vec::new();
    let mut current = node.prev_sibling();
    while let Some(prev) = current {
        if prev.kind() != "comment"
            || prev.start_position().column != column
            || prev.end_position().row + 1 != expected_row
        {
            break;
        }
        let text = node_text(prev, source);
        lines.push(text.trim_start_matches('#').trim().to_string());
        expected_row = prev.start_position().row;
        current = prev.prev_sibling();
    }
    lines.retain(|line| !line.is_empty());
    if lines.is_empty() {
        return None;
    }
    lines.reverse();
    Some(lines.join("\n"))
}

/// Local bindings introduced by one import statement as (name, dotted path).
fn parse_import_bindings(text: &str, base_package: &[String]) -> Vec<(String, String)> {
    let cleaned: String = text
        .lines()
        .map(|line| line.split('#').next().unwrap_or(""))
        .collect::<Vec<_>>()
        .join(" ")
        .replace(['(', ')', '\\'], " ");
    let cleaned = cleaned.trim().trim_end_matches(';');
    let mut bindings = Vec::new();
    if let Some(rest) = cleaned.strip_prefix("import ") {
        for part in rest.split(',') {
            let tokens: Vec<&str> = part.split_whitespace().collect();
            match tokens.as_slice() {
                [path, "as", alias] => bindings.push((alias.to_string(), path.to_string())),
                [path] => {
                    let head = path.split('.').next().unwrap_or(path);
                    bindings.push((head.to_string(), head.to_string()));
                }
                _ => {}
            }
        }
        return bindings;
    }
    let Some(rest) = cleaned.strip_prefix("from ") else {
        return bindings;
    };
    let Some((module, names)) = rest.split_once(" import ") else {
        return bindings;
    };
    let Some(base) = absolutize_module(module.trim(), base_package) else {
        return bindings;
    };
    for part in names.split(',') {
        let tokens: Vec<&str> = part.split_whitespace().collect();
        let (name, alias) = match tokens.as_slice() {
            [name, "as", alias] => (*name, *alias),
            [name] => (*name, *name),
            _ => continue,
        };
        if name == "*" {
            continue;
        }
        let path = if base.is_empty() {
            name.to_string()
        } else {
            format!("{base}.{name}")
        };
        bindings.push((alias.to_string(), path));
    }
    bindings
}

/// Package that relative imports in `rel_path` are anchored to.
fn base_package_parts(rel_path: &str) -> Vec<String> {
    let module = module_name_from_rel_path(rel_path);
    let is_init = Path::new(rel_path)
        .file_stem()
        .and_then(|s| s.to_str())
        == Some("__init__");
    let parts: Vec<&str> = module
        .split('.')
        .filter(|part| !part.is_empty() && *part != "__init__")
        .collect();
    let keep = if is_init {
        parts.len()
    } else {
        parts.len().saturating_sub(1)
    };
    parts[..keep].iter().map(|part| part.to_string()).collect()
}

fn absolutize_module(candidate: &str, base_package: &[String]) -> Option<String> {
    if candidate.is_empty() {
        return None;
    }
    if !candidate.starts_with('.') {
        return Some(candidate.to_string());
    }
    let dot_count = candidate.chars().take_while(|ch| *ch == '.').count();
    let rest = &candidate[dot_count..];
    let up = dot_count - 1;
    if up > base_package.len() {
        return None;
    }
    let mut parts: Vec<String> = base_package[..base_package.len() - up].to_vec();
    parts.extend(
        rest.split('.')
            .filter(|part| !part.is_empty())
            .map(str::to_string),
    );
    Some(parts.join("."))
}

fn line_count(source: &str) -> i64 {
    let count = source.lines().count();
    if count == 0 { 1 } else { count as i64 }
}
