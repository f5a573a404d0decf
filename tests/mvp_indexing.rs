use std::path::{Path, PathBuf};
use std::sync::Arc;
use ttmm::git_mining::{ChurnSource, StaticChurn};
use ttmm::indexer::Indexer;
use ttmm::workspace::{Workspace, WorkspaceOptions, default_db_path};
use ttmm::{Callee, EdgeFilter, Error, Provenance, SymbolKind};

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn copy_dir(src: &Path, dst: &Path) {
    std::fs::create_dir_all(dst).unwrap();
    for entry in std::fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let path = entry.path();
        let target = dst.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_dir(&path, &target);
        } else {
            std::fs::copy(&path, &target).unwrap();
        }
    }
}

fn setup_repo(fixture: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    copy_dir(&fixture_path(fixture), dir.path());
    dir
}

fn open(root: &Path) -> Workspace {
    let churn: Arc<dyn ChurnSource> = Arc::new(StaticChurn::default());
    Workspace::open_with_churn(root, WorkspaceOptions::default(), churn).unwrap()
}

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

fn callee_labels(ws: &Workspace, symbol: &str) -> Vec<String> {
    ws.callees(symbol, EdgeFilter::Static)
        .unwrap()
        .iter()
        .map(|edge| edge.callee.label().to_string())
        .collect()
}

#[test]
fn python_indexing_is_deterministic() {
    let repo_a = setup_repo("py_mvp");
    let mut ws_a = open(repo_a.path());
    ws_a.index().unwrap();

    let repo_b = setup_repo("py_mvp");
    let mut ws_b = open(repo_b.path());
    ws_b.index().unwrap();

    assert_eq!(ws_a.digest().unwrap(), ws_b.digest().unwrap());
}

#[test]
fn fixture_resolves_imports_self_calls_and_bases() {
    let repo = setup_repo("py_mvp");
    let mut ws = open(repo.path());
    let stats = ws.index().unwrap();
    assert_eq!(stats.scanned, 3);
    assert_eq!(stats.indexed, 3);
    assert!(stats.parse_errors.is_empty());

    assert_eq!(
        callee_labels(&ws, "app.service:create_user"),
        vec!["app.models:User", "user.save", "range", "app.service:log"]
    );
    assert_eq!(
        callee_labels(&ws, "app.models:User.save"),
        vec!["ValueError", "store.write", "app.models:User.validate"]
    );
    assert_eq!(
        callee_labels(&ws, "Admin.promote"),
        vec!["app.models:User.save"]
    );

    let callers = ws.callers("app.models:User.save", EdgeFilter::All).unwrap();
    let names: Vec<&str> = callers
        .iter()
        .filter_map(|edge| edge.caller.as_ref().map(|c| c.qualname.as_str()))
        .collect();
    assert_eq!(names, vec!["app.models:Admin.promote"]);

    let init = ws.symbol("app.models:User.__init__").unwrap();
    assert_eq!(init.kind, SymbolKind::Method);
    let user = ws.symbol("app.models:User").unwrap();
    assert_eq!(user.docstring.as_deref(), Some("A registered user."));
    let save = ws.symbol("User.save").unwrap();
    assert_eq!(save.comment.as_deref(), Some("Persist the user record."));
    assert_eq!(save.complexity, 2);
}

#[test]
fn reindex_without_changes_is_a_noop() {
    let repo = setup_repo("py_mvp");
    let mut ws = open(repo.path());
    ws.index().unwrap();
    let digest = ws.digest().unwrap();
    let generation = ws.db().generation().unwrap();

    let stats = ws.index().unwrap();
    assert_eq!(stats.indexed, 0);
    assert_eq!(stats.skipped, stats.scanned);
    assert_eq!(stats.reresolved, 0);
    assert_eq!(ws.digest().unwrap(), digest);
    assert_eq!(ws.db().generation().unwrap(), generation);
}

#[test]
fn two_file_scenario_resolves_and_updates_only_the_changed_file() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.py", "def f():\n    return g()\n");
    write(dir.path(), "b.py", "def g():\n    return 1\n");
    let mut ws = open(dir.path());
    let stats = ws.index().unwrap();
    assert_eq!(stats.edges, 1);
    assert_eq!(stats.unresolved_calls, 0);

    let functions: Vec<String> = ws
        .db()
        .list_stored_symbols()
        .unwrap()
        .into_iter()
        .filter(|symbol| symbol.kind == SymbolKind::Function)
        .map(|symbol| symbol.qualname)
        .collect();
    assert_eq!(functions, vec!["a:f".to_string(), "b:g".to_string()]);
    let edges = ws.callees("a:f", EdgeFilter::All).unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].provenance, Provenance::Static);
    assert_eq!(edges[0].callee.label(), "b:g");

    let f_before = ws.symbol("a:f").unwrap();
    let g_before = ws.symbol("b:g").unwrap();

    write(dir.path(), "a.py", "def f():\n    x = 1\n    return g()\n");
    let stats = ws.index().unwrap();
    assert_eq!(stats.indexed, 1);
    assert_eq!(stats.skipped, 1);

    let f_after = ws.symbol("a:f").unwrap();
    let g_after = ws.symbol("b:g").unwrap();
    assert_ne!(f_after.fingerprint, f_before.fingerprint);
    assert_eq!(f_after.end_line, 3);
    assert_eq!(g_after, g_before);
    assert_eq!(callee_labels(&ws, "a:f"), vec!["b:g"]);
}

#[test]
fn removed_and_restored_targets_are_re_resolved() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.py", "def f():\n    return g()\n");
    write(dir.path(), "b.py", "def g():\n    return 1\n");
    let mut ws = open(dir.path());
    ws.index().unwrap();

    std::fs::remove_file(dir.path().join("b.py")).unwrap();
    let stats = ws.index().unwrap();
    assert_eq!(stats.removed, 1);
    assert!(matches!(ws.symbol("b:g"), Err(Error::SymbolNotFound(_))));
    let edges = ws.callees("a:f", EdgeFilter::Static).unwrap();
    assert_eq!(
        edges[0].callee,
        Callee::Unresolved {
            raw: "g".to_string()
        }
    );
    assert_eq!(stats.unresolved_calls, 1);

    write(dir.path(), "b.py", "def g():\n    return 1\n");
    let stats = ws.index().unwrap();
    assert_eq!(stats.indexed, 1);
    assert_eq!(stats.reresolved, 1);
    assert_eq!(callee_labels(&ws, "a:f"), vec!["b:g"]);

    // Same state as a fresh index of the same tree.
    let fresh_db = tempfile::tempdir().unwrap();
    let churn: Arc<dyn ChurnSource> = Arc::new(StaticChurn::default());
    let mut fresh = Workspace::open_with_churn(
        dir.path(),
        WorkspaceOptions {
            db_path: Some(fresh_db.path().join("fresh.sqlite")),
            ..WorkspaceOptions::default()
        },
        churn,
    )
    .unwrap();
    fresh.index().unwrap();
    assert_eq!(fresh.digest().unwrap(), ws.digest().unwrap());
}

#[test]
fn second_definition_makes_name_binding_ambiguous() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.py", "def f():\n    return g()\n");
    write(dir.path(), "b.py", "def g():\n    return 1\n");
    let mut ws = open(dir.path());
    ws.index().unwrap();

    write(dir.path(), "c.py", "def g():\n    return 2\n");
    let stats = ws.index().unwrap();
    assert_eq!(stats.reresolved, 1);
    assert_eq!(callee_labels(&ws, "a:f"), vec!["g"]);

    std::fs::remove_file(dir.path().join("c.py")).unwrap();
    ws.index().unwrap();
    assert_eq!(callee_labels(&ws, "a:f"), vec!["b:g"]);
}

#[test]
fn parameter_names_do_not_bind_to_same_named_definitions() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "a.py",
        "def apply(handler, items):\n    for x in items:\n        handler(x)\n",
    );
    write(dir.path(), "b.py", "def handler(x):\n    return x\n");
    let mut ws = open(dir.path());
    let stats = ws.index().unwrap();
    let edges = ws.callees("a:apply", EdgeFilter::Static).unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(
        edges[0].callee,
        Callee::Unresolved {
            raw: "handler".to_string()
        }
    );
    assert_eq!(stats.unresolved_calls, 1);
    assert!(ws.callers("b:handler", EdgeFilter::All).unwrap().is_empty());
}

#[test]
fn parse_errors_are_recorded_and_the_run_continues() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "good.py", "def ok():\n    return 1\n");
    write(dir.path(), "bad.py", "def broken(:\n    return 1\n");
    let mut ws = open(dir.path());
    let stats = ws.index().unwrap();
    assert_eq!(stats.parse_errors.len(), 1);
    assert_eq!(stats.parse_errors[0].path, "bad.py");
    assert!(stats.parse_errors[0].message.starts_with("line 1"));
    assert!(ws.symbol("good:ok").is_ok());
    assert!(ws.symbol("bad:broken").is_err());

    let stats = ws.index().unwrap();
    assert_eq!(stats.parse_errors.len(), 1);

    write(dir.path(), "bad.py", "def broken():\n    return 1\n");
    let stats = ws.index().unwrap();
    assert!(stats.parse_errors.is_empty());
    assert!(ws.symbol("bad:broken").is_ok());
}

#[test]
fn edges_always_reference_existing_symbols() {
    let repo = setup_repo("py_mvp");
    let mut ws = open(repo.path());
    ws.index().unwrap();
    std::fs::remove_file(repo.path().join("app").join("models.py")).unwrap();
    ws.index().unwrap();

    let conn = ws.db().read_conn().unwrap();
    let count = |sql: &str| -> i64 { conn.query_row(sql, [], |row| row.get(0)).unwrap() };
    assert_eq!(
        count(
            "SELECT COUNT(*) FROM edges e LEFT JOIN symbols s ON s.id = e.caller_symbol_id
             WHERE s.id IS NULL"
        ),
        0
    );
    assert_eq!(
        count(
            "SELECT COUNT(*) FROM edges e LEFT JOIN symbols s ON s.id = e.callee_symbol_id
             WHERE e.callee_symbol_id IS NOT NULL AND s.id IS NULL"
        ),
        0
    );
    assert_eq!(
        count("SELECT COUNT(*) FROM edges WHERE callee_symbol_id IS NULL AND callee_qualname IS NOT NULL"),
        0
    );
    assert_eq!(count("SELECT COUNT(*) FROM symbols WHERE qualname LIKE 'app.models%'"), 0);
    assert_eq!(
        callee_labels(&ws, "create_user"),
        vec!["User", "user.save", "range", "app.service:log", "models.User"]
    );
}

#[test]
fn concurrent_writer_is_rejected_without_changes() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.py", "def f():\n    pass\n");
    let mut ws = open(dir.path());

    let blocker = rusqlite::Connection::open(default_db_path(ws.root())).unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE").unwrap();
    let err = ws.index().unwrap_err();
    assert!(matches!(err, Error::StoreConcurrency { .. }));
    assert!(err.is_retryable());
    assert!(ws.db().latest_run().unwrap().is_none());

    blocker.execute_batch("ROLLBACK").unwrap();
    ws.index().unwrap();
    assert!(ws.symbol("a:f").is_ok());
}

#[test]
fn newer_schema_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.py", "def f():\n    pass\n");
    drop(open(dir.path()));

    let conn = rusqlite::Connection::open(default_db_path(dir.path())).unwrap();
    conn.execute("UPDATE meta SET value = '7' WHERE key = 'schema_version'", [])
        .unwrap();
    drop(conn);

    let churn: Arc<dyn ChurnSource> = Arc::new(StaticChurn::default());
    match Workspace::open_with_churn(dir.path(), WorkspaceOptions::default(), churn) {
        Err(Error::IncompatibleSchema { found, .. }) => assert_eq!(found, 7),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("expected an incompatible schema error"),
    }
}

#[test]
fn missing_root_is_a_scan_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope");
    let err = Indexer::new(missing.clone(), missing.join("db.sqlite"))
        .err()
        .unwrap();
    assert!(matches!(err, Error::Scan { .. }));
    assert!(err.to_string().contains("nope"));
}
