use tree_sitter::Node;

/// Node kinds that open one extra path through a body.
const DECISION_KINDS: &[&str] = &[
    "if_statement",
    "elif_clause",
    "for_statement",
    "while_statement",
    "except_clause",
    "except_group_clause",
    "case_clause",
    "boolean_operator",
    "conditional_expression",
    "for_in_clause",
    "if_clause",
];

const NESTED_DEFINITION_KINDS: &[&str] = &[
    "function_definition",
    "async_function_definition",
    "class_definition",
    "decorated_definition",
];

/// Cyclomatic complexity of the body rooted at `node`: 1 plus one per
/// decision point. Nested definitions are measured on their own and do
/// not contribute to their parent.
pub fn complexity(node: Node<'_>) -> i64 {
    let mut total = 1;
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        total += decisions(child);
    }
    total
}

fn decisions(node: Node<'_>) -> i64 {
    let kind = node.kind();
    if NESTED_DEFINITION_KINDS.contains(&kind) {
        return 0;
    }
    let mut count = i64::from(DECISION_KINDS.contains(&kind));
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        count += decisions(child);
    }
    count
}
