use ttmm::indexer::python::PythonExtractor;

fn complexity_of(source: &str, qualname: &str) -> i64 {
    let mut extractor = PythonExtractor::new().unwrap();
    let extracted = extractor.extract(source, "mod.py").unwrap();
    extracted.symbol(qualname).unwrap().complexity
}

#[test]
fn python_complexity_counts() {
    let source = r#"
def func(x, y):
    if x and y:
        return 1
    elif x:
        return 2
    return 3
"#;
    assert_eq!(complexity_of(source, "mod:func"), 4);
}

#[test]
fn straight_line_body_is_one_and_each_if_adds_one() {
    let plain = "def f(x):\n    y = x + 1\n    return y\n";
    let one_if = "def f(x):\n    y = x + 1\n    if y:\n        y = 0\n    return y\n";
    assert_eq!(complexity_of(plain, "mod:f"), 1);
    assert_eq!(complexity_of(one_if, "mod:f"), 2);
}

#[test]
fn loops_handlers_comprehensions_and_matches_count() {
    let source = r#"
def busy(items, mode):
    total = 0
    for item in items:
        while item > 0:
            item -= 1
    try:
        total = sum(x for x in items if x)
    except ValueError:
        total = -1
    value = 1 if total else 0
    match mode:
        case "a":
            pass
        case _:
            pass
    return total or value
"#;
    // for, while, except, comprehension for + if, conditional, 2 cases, `or`
    assert_eq!(complexity_of(source, "mod:busy"), 10);
}

#[test]
fn nested_definitions_are_measured_separately() {
    let source = r#"
class Service:
    def handle(self, request):
        def check(value):
            if value:
                return True
            return False

        if request:
            return check(request)
        return None
"#;
    assert_eq!(complexity_of(source, "mod:Service.handle"), 2);
    assert_eq!(complexity_of(source, "mod:Service.handle.check"), 2);
    assert_eq!(complexity_of(source, "mod:Service"), 1);
}
