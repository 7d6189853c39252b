//! Unified-diff validation and affected-file extraction.
//!
//! The broker never applies a diff. Validation delegates to `git apply
//! --check` with the diff piped on stdin (argv form, never a shell string);
//! affected-file extraction is a small header parser that degrades to an
//! empty list instead of failing the enclosing operation.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use tandem_schemas::{AffectedFile, FileOperation};

/// Outcome of `git apply --check`.
#[derive(Debug, Clone)]
pub struct DiffCheck {
    pub valid: bool,
    /// stderr of the check, verbatim, when invalid; empty when valid.
    pub detail: String,
}

/// Run `git apply --check` in `cwd` with `diff` on stdin.
///
/// Exit code 0 means the diff applies cleanly to the working tree. A nonzero
/// exit is not an error of this function; the stderr is captured so callers
/// can surface it to the proposer.
pub async fn validate_diff(diff: &str, cwd: &Path) -> Result<DiffCheck> {
    let mut child = Command::new("git")
        .args(["apply", "--check"])
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawn git apply --check")?;

    {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("git apply stdin unavailable"))?;
        stdin
            .write_all(diff.as_bytes())
            .await
            .context("write diff to git apply stdin")?;
        if !diff.ends_with('\n') {
            stdin.write_all(b"\n").await.context("terminate diff")?;
        }
        // Close stdin so git sees EOF.
    }

    let out = child
        .wait_with_output()
        .await
        .context("wait for git apply --check")?;

    if out.status.success() {
        Ok(DiffCheck {
            valid: true,
            detail: String::new(),
        })
    } else {
        let detail = String::from_utf8_lossy(&out.stderr).trim().to_string();
        debug!(detail = %detail, "diff failed git apply --check");
        Ok(DiffCheck {
            valid: false,
            detail,
        })
    }
}

/// Discover the repository root via `git rev-parse --show-toplevel`.
///
/// Called once at startup; the returned path is the cwd for every later
/// validation. Failure here is reported, not fatal; the broker runs with
/// diff validation returning a well-defined error instead.
pub async fn discover_repo_root(start: &Path) -> Result<PathBuf> {
    let out = Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .current_dir(start)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("run git rev-parse --show-toplevel")?;

    if !out.status.success() {
        return Err(anyhow!(
            "git rev-parse --show-toplevel failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }

    let path = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if path.is_empty() {
        return Err(anyhow!("git rev-parse returned an empty repository root"));
    }
    Ok(PathBuf::from(path))
}

/// Parse a unified diff into its affected-file list.
///
/// Recognizes `diff --git` sections plus `new file mode` / `deleted file
/// mode` markers; `+`/`-` body lines are counted per file (header lines
/// `+++`/`---` excluded). Anything unrecognizable yields an empty list;
/// the caller stores `[]` and the review proceeds without file metadata.
pub fn extract_affected_files(diff: &str) -> Vec<AffectedFile> {
    let mut files: Vec<AffectedFile> = Vec::new();
    let mut current: Option<AffectedFile> = None;
    let mut in_hunk = false;

    for line in diff.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            if let Some(f) = current.take() {
                files.push(f);
            }
            in_hunk = false;
            let Some(path) = parse_git_header_path(rest) else {
                // Malformed section header: give up on the whole parse.
                return Vec::new();
            };
            current = Some(AffectedFile {
                path,
                operation: FileOperation::Modify,
                added: 0,
                removed: 0,
            });
        } else if line.starts_with("new file mode") {
            if let Some(f) = current.as_mut() {
                f.operation = FileOperation::Create;
            }
        } else if line.starts_with("deleted file mode") {
            if let Some(f) = current.as_mut() {
                f.operation = FileOperation::Delete;
            }
        } else if line.starts_with("@@") {
            in_hunk = true;
        } else if in_hunk {
            if let Some(f) = current.as_mut() {
                if line.starts_with('+') && !line.starts_with("+++") {
                    f.added += 1;
                } else if line.starts_with('-') && !line.starts_with("---") {
                    f.removed += 1;
                }
            }
        }
    }

    if let Some(f) = current.take() {
        files.push(f);
    }
    files
}

/// Serialized form stored on the review row. `"[]"` on any parse failure.
pub fn affected_files_json(diff: &str) -> String {
    let files = extract_affected_files(diff);
    serde_json::to_string(&files).unwrap_or_else(|_| "[]".to_string())
}

/// Extract the post-image path from `a/<path> b/<path>`.
fn parse_git_header_path(rest: &str) -> Option<String> {
    // Paths with spaces are quoted; keep the common unquoted case simple and
    // treat quoted headers as a split on `" "`.
    if rest.starts_with('"') {
        let mut parts = rest.split("\" \"");
        let _a = parts.next()?;
        let b = parts.next()?.trim_end_matches('"');
        return b.strip_prefix("b/").map(|p| p.to_string());
    }
    let mut parts = rest.split_whitespace();
    let _a = parts.next()?;
    let b = parts.next()?;
    b.strip_prefix("b/").map(|p| p.to_string())
}
