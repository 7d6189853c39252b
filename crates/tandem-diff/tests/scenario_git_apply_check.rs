//! Scenario: diff validation against a real working tree.
//!
//! Spins up a throwaway git repository in a tempdir and checks both
//! directions: a diff built against the tree applies cleanly, and a diff
//! referencing content the tree does not have is rejected with the git
//! stderr captured. Skips when git is unavailable on PATH.

use std::path::Path;
use std::process::Command;

use tandem_diff::{discover_repo_root, validate_diff};

fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "test")
        .env("GIT_AUTHOR_EMAIL", "test@localhost")
        .env("GIT_COMMITTER_NAME", "test")
        .env("GIT_COMMITTER_EMAIL", "test@localhost")
        .output()
        .expect("run git");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
}

fn git_available() -> bool {
    Command::new("git").arg("--version").output().is_ok()
}

fn init_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    git(dir.path(), &["init", "-q"]);
    std::fs::write(dir.path().join("hello.txt"), "one\ntwo\nthree\n").unwrap();
    git(dir.path(), &["add", "."]);
    git(dir.path(), &["commit", "-q", "-m", "seed"]);
    dir
}

const APPLIES: &str = "\
--- a/hello.txt
+++ b/hello.txt
@@ -1,3 +1,4 @@
 one
 two
 three
+four
";

const DOES_NOT_APPLY: &str = "\
--- a/hello.txt
+++ b/hello.txt
@@ -1,3 +1,3 @@
 one
-MISSING LINE
+replacement
 three
";

#[tokio::test]
async fn clean_diff_passes_check() {
    if !git_available() {
        eprintln!("git not on PATH; skipping");
        return;
    }
    let repo = init_repo();
    let check = validate_diff(APPLIES, repo.path()).await.unwrap();
    assert!(check.valid, "expected clean apply, got: {}", check.detail);
    assert!(check.detail.is_empty());
}

#[tokio::test]
async fn drifted_diff_fails_with_stderr_detail() {
    if !git_available() {
        eprintln!("git not on PATH; skipping");
        return;
    }
    let repo = init_repo();
    let check = validate_diff(DOES_NOT_APPLY, repo.path()).await.unwrap();
    assert!(!check.valid);
    assert!(
        !check.detail.is_empty(),
        "invalid diff must carry the git stderr"
    );
}

#[tokio::test]
async fn repo_root_discovery_from_subdirectory() {
    if !git_available() {
        eprintln!("git not on PATH; skipping");
        return;
    }
    let repo = init_repo();
    let sub = repo.path().join("nested");
    std::fs::create_dir(&sub).unwrap();

    let root = discover_repo_root(&sub).await.unwrap();
    assert_eq!(
        root.canonicalize().unwrap(),
        repo.path().canonicalize().unwrap()
    );
}

#[tokio::test]
async fn repo_root_discovery_fails_outside_a_repo() {
    if !git_available() {
        eprintln!("git not on PATH; skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    assert!(discover_repo_root(dir.path()).await.is_err());
}
