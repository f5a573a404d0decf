use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use ttmm::git_mining::{ChurnSource, StaticChurn};
use ttmm::workspace::{Workspace, WorkspaceOptions};

const BRANCHY: &str = "def branchy(x):\n    if x:\n        return 1\n    if x > 2:\n        return 2\n    return 3\n";
const PLAIN: &str = "def plain():\n    return 0\n";

fn write(root: &Path, rel: &str, contents: &str) {
    std::fs::write(root.join(rel), contents).unwrap();
}

fn open_with(root: &Path, churn: StaticChurn) -> Workspace {
    let churn: Arc<dyn ChurnSource> = Arc::new(churn);
    Workspace::open_with_churn(root, WorkspaceOptions::default(), churn).unwrap()
}

fn ranking(ws: &Workspace) -> Vec<(String, i64)> {
    ws.hotspots(100)
        .unwrap()
        .into_iter()
        .map(|hotspot| (hotspot.symbol.qualname, hotspot.rank))
        .collect()
}

#[test]
fn complexity_only_ranking_without_churn() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.py", BRANCHY);
    write(dir.path(), "b.py", PLAIN);
    write(dir.path(), "c.py", "class Model:\n    def run(self):\n        return 1\n");
    let mut ws = open_with(dir.path(), StaticChurn::default());
    let stats = ws.index().unwrap();
    assert_eq!(stats.hotspots, 3);

    let hotspots = ws.hotspots(10).unwrap();
    assert_eq!(hotspots[0].symbol.qualname, "a:branchy");
    assert_eq!(hotspots[0].complexity, 3);
    assert_eq!(hotspots[0].churn, 0);
    assert_eq!(hotspots[0].score, 3.0);
    // Equal scores fall back to qualname order; classes are not ranked.
    assert_eq!(
        ranking(&ws),
        vec![
            ("a:branchy".to_string(), 1),
            ("b:plain".to_string(), 2),
            ("c:Model.run".to_string(), 3),
        ]
    );
    assert_eq!(ws.hotspots(1).unwrap().len(), 1);
}

#[test]
fn churn_amplifies_complexity() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.py", BRANCHY);
    write(dir.path(), "b.py", PLAIN);
    let mut ws = open_with(dir.path(), StaticChurn::new([("b.py", 16)]));
    ws.index().unwrap();

    let hotspots = ws.hotspots(10).unwrap();
    assert_eq!(hotspots[0].symbol.qualname, "b:plain");
    assert_eq!(hotspots[0].churn, 16);
    assert_eq!(hotspots[0].score, 5.0);
    assert_eq!(hotspots[1].symbol.qualname, "a:branchy");
    assert_eq!(hotspots[1].rank, 2);
}

#[test]
fn hotspot_rows_are_replaced_on_reindex() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.py", BRANCHY);
    write(dir.path(), "b.py", PLAIN);
    let mut ws = open_with(dir.path(), StaticChurn::default());
    ws.index().unwrap();
    let first = ranking(&ws);
    ws.index().unwrap();
    assert_eq!(ranking(&ws), first);

    std::fs::remove_file(dir.path().join("a.py")).unwrap();
    ws.index().unwrap();
    assert_eq!(ranking(&ws), vec![("b:plain".to_string(), 1)]);
}

#[test]
fn untracked_root_indexes_with_zero_churn() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.py", BRANCHY);
    let mut ws = Workspace::open(dir.path()).unwrap();
    let stats = ws.index().unwrap();
    if stats.vcs_available {
        // The temp dir sits inside someone's work tree; nothing to assert.
        return;
    }
    let hotspots = ws.hotspots(10).unwrap();
    assert_eq!(hotspots.len(), 1);
    assert_eq!(hotspots[0].churn, 0);
}

fn git(root: &Path, args: &[&str]) -> bool {
    Command::new("git")
        .args(["-c", "user.name=ttmm", "-c", "user.email=ttmm@example.com"])
        .args(args)
        .current_dir(root)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

#[test]
fn git_history_feeds_churn() {
    let dir = tempfile::tempdir().unwrap();
    if !git(dir.path(), &["init", "-q"]) {
        return;
    }
    write(dir.path(), "a.py", PLAIN);
    write(dir.path(), "b.py", BRANCHY);
    assert!(git(dir.path(), &["add", "."]));
    assert!(git(dir.path(), &["commit", "-q", "-m", "one"]));
    write(dir.path(), "a.py", "def plain():\n    return 1\n");
    assert!(git(dir.path(), &["commit", "-q", "-am", "two"]));
    write(dir.path(), "a.py", "def plain():\n    return 2\n");
    assert!(git(dir.path(), &["commit", "-q", "-am", "three"]));

    let mut ws = Workspace::open(dir.path()).unwrap();
    let stats = ws.index().unwrap();
    assert!(stats.vcs_available);
    let hotspots = ws.hotspots(10).unwrap();
    let plain = hotspots
        .iter()
        .find(|hotspot| hotspot.symbol.qualname == "a:plain")
        .unwrap();
    assert_eq!(plain.churn, 3);
    assert_eq!(plain.score, 1.0 + 3f64.sqrt());
    let branchy = hotspots
        .iter()
        .find(|hotspot| hotspot.symbol.qualname == "b:branchy")
        .unwrap();
    assert_eq!(branchy.churn, 1);
    assert_eq!(branchy.score, 6.0);
}

fn churn_of(ws: &Workspace, qualname: &str) -> i64 {
    ws.hotspots(100)
        .unwrap()
        .into_iter()
        .find(|hotspot| hotspot.symbol.qualname == qualname)
        .map(|hotspot| hotspot.churn)
        .unwrap()
}

#[test]
fn churn_is_reread_on_every_index_run() {
    let dir = tempfile::tempdir().unwrap();
    if !git(dir.path(), &["init", "-q"]) {
        return;
    }
    write(dir.path(), "a.py", PLAIN);
    assert!(git(dir.path(), &["add", "."]));
    assert!(git(dir.path(), &["commit", "-q", "-m", "one"]));

    let mut ws = Workspace::open(dir.path()).unwrap();
    ws.index().unwrap();
    assert_eq!(churn_of(&ws, "a:plain"), 1);

    for n in 2..=4 {
        write(dir.path(), "a.py", &format!("def plain():\n    return {n}\n"));
        assert!(git(dir.path(), &["commit", "-q", "-am", "again"]));
    }
    ws.index().unwrap();
    assert_eq!(churn_of(&ws, "a:plain"), 4);

    // Change and revert: the tree matches the last run, history does not.
    write(dir.path(), "a.py", "def plain():\n    return 5\n");
    assert!(git(dir.path(), &["commit", "-q", "-am", "change"]));
    write(dir.path(), "a.py", "def plain():\n    return 4\n");
    assert!(git(dir.path(), &["commit", "-q", "-am", "revert"]));
    let stats = ws.index().unwrap();
    assert_eq!(stats.indexed, 0);
    assert_eq!(churn_of(&ws, "a:plain"), 6);
}

#[test]
fn non_ascii_paths_keep_their_churn() {
    let dir = tempfile::tempdir().unwrap();
    if !git(dir.path(), &["init", "-q"]) {
        return;
    }
    write(dir.path(), "über.py", PLAIN);
    assert!(git(dir.path(), &["add", "."]));
    assert!(git(dir.path(), &["commit", "-q", "-m", "one"]));
    write(dir.path(), "über.py", "def plain():\n    return 1\n");
    assert!(git(dir.path(), &["commit", "-q", "-am", "two"]));

    let mut ws = Workspace::open(dir.path()).unwrap();
    ws.index().unwrap();
    assert_eq!(churn_of(&ws, "über:plain"), 2);
}
