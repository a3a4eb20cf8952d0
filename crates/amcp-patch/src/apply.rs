use std::path::{Path, PathBuf};

use crate::parser::{FileOp, Hunk, Patch};
use crate::PatchError;

/// A validated filesystem mutation, ready to commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedOp {
    Write { path: PathBuf, content: String },
    Remove { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileOutcome {
    Created { path: String },
    Deleted { path: String },
    Updated { path: String },
    Renamed { from: String, to: String },
}

/// Validate every operation against the filesystem and produce the staged
/// writes. Nothing is touched on disk; any failure aborts the whole patch.
pub fn stage(patch: &Patch, base_dir: &Path) -> Result<(Vec<StagedOp>, Vec<FileOutcome>), PatchError> {
    let mut staged = Vec::new();
    let mut outcomes = Vec::new();

    for op in &patch.ops {
        match op {
            FileOp::Add { path, content } => {
                let full = resolve_path(base_dir, path)?;
                let mut text = content.join("\n");
                if !content.is_empty() {
                    text.push('\n');
                }
                staged.push(StagedOp::Write {
                    path: full,
                    content: text,
                });
                outcomes.push(FileOutcome::Created { path: path.clone() });
            }
            FileOp::Delete { path } => {
                let full = resolve_path(base_dir, path)?;
                if !full.is_file() {
                    return Err(PatchError::Apply {
                        path: path.clone(),
                        message: "file not found for deletion".to_string(),
                        searched: Vec::new(),
                    });
                }
                staged.push(StagedOp::Remove { path: full });
                outcomes.push(FileOutcome::Deleted { path: path.clone() });
            }
            FileOp::Update {
                path,
                move_to,
                hunks,
            } => {
                let full = resolve_path(base_dir, path)?;
                let original =
                    std::fs::read_to_string(&full).map_err(|source| PatchError::Io {
                        path: path.clone(),
                        source,
                    })?;

                let updated = apply_hunks(&original, hunks, path)?;

                match move_to {
                    Some(target) => {
                        let target_full = resolve_path(base_dir, target)?;
                        staged.push(StagedOp::Write {
                            path: target_full,
                            content: updated,
                        });
                        staged.push(StagedOp::Remove { path: full });
                        outcomes.push(FileOutcome::Renamed {
                            from: path.clone(),
                            to: target.clone(),
                        });
                    }
                    None => {
                        staged.push(StagedOp::Write {
                            path: full,
                            content: updated,
                        });
                        outcomes.push(FileOutcome::Updated { path: path.clone() });
                    }
                }
            }
        }
    }

    Ok((staged, outcomes))
}

/// Stage and commit. Because staging validated every hunk, commit failures
/// can only be IO errors, which surface with the offending path.
pub fn apply(patch: &Patch, base_dir: &Path) -> Result<Vec<FileOutcome>, PatchError> {
    let (staged, outcomes) = stage(patch, base_dir)?;

    for op in staged {
        match op {
            StagedOp::Write { path, content } => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|source| PatchError::Io {
                        path: parent.display().to_string(),
                        source,
                    })?;
                }
                std::fs::write(&path, content).map_err(|source| PatchError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
            }
            StagedOp::Remove { path } => {
                std::fs::remove_file(&path).map_err(|source| PatchError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
            }
        }
    }

    Ok(outcomes)
}

fn resolve_path(base_dir: &Path, path: &str) -> Result<PathBuf, PatchError> {
    if path.starts_with('/') || Path::new(path).is_absolute() {
        return Err(PatchError::Apply {
            path: path.to_string(),
            message: "absolute paths are not allowed".to_string(),
            searched: Vec::new(),
        });
    }

    let mut clean = path;
    while let Some(rest) = clean.strip_prefix("./") {
        clean = rest;
    }

    if Path::new(clean)
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(PatchError::Apply {
            path: path.to_string(),
            message: "paths may not traverse outside the patch root".to_string(),
            searched: Vec::new(),
        });
    }

    Ok(base_dir.join(clean))
}

fn apply_hunks(original: &str, hunks: &[Hunk], path: &str) -> Result<String, PatchError> {
    let had_trailing_newline = original.ends_with('\n');
    let mut lines: Vec<String> = original.lines().map(str::to_string).collect();

    // Hunks apply in file order: each search starts where the previous
    // replacement ended.
    let mut cursor = 0;
    for hunk in hunks {
        cursor = apply_hunk(&mut lines, hunk, cursor, path)?;
    }

    let mut result = lines.join("\n");
    if had_trailing_newline || !result.is_empty() {
        result.push('\n');
    }
    Ok(result)
}

fn apply_hunk(
    lines: &mut Vec<String>,
    hunk: &Hunk,
    cursor: usize,
    path: &str,
) -> Result<usize, PatchError> {
    let search_start = narrow_by_anchors(lines, hunk, cursor);
    let old: Vec<&str> = hunk.old_lines();

    if old.is_empty() {
        // Additions only: insert after the anchor line, or append at EOF.
        let insert_at = if hunk.anchors.is_empty() {
            lines.len()
        } else {
            search_start.min(lines.len()).saturating_add(
                if search_start < lines.len() { 1 } else { 0 },
            )
        };
        let new: Vec<String> = hunk.new_lines().iter().map(|s| s.to_string()).collect();
        let count = new.len();
        lines.splice(insert_at..insert_at, new);
        return Ok(insert_at + count);
    }

    // Whitespace-significant exact match, required to be unique within the
    // narrowed region.
    let mut matches = Vec::new();
    let end = lines.len().saturating_sub(old.len() - 1);
    for i in search_start..end {
        if old.iter().enumerate().all(|(j, l)| lines[i + j] == *l) {
            matches.push(i);
        }
    }

    let searched: Vec<String> = old.iter().take(5).map(|s| s.to_string()).collect();
    match matches.len() {
        0 => Err(PatchError::Apply {
            path: path.to_string(),
            message: "hunk context not found".to_string(),
            searched,
        }),
        1 => {
            let pos = matches[0];
            let new: Vec<String> = hunk.new_lines().iter().map(|s| s.to_string()).collect();
            let count = new.len();
            lines.splice(pos..pos + old.len(), new);
            Ok(pos + count)
        }
        n => Err(PatchError::Apply {
            path: path.to_string(),
            message: format!("hunk context is ambiguous ({n} matches)"),
            searched,
        }),
    }
}

/// Each anchor, in order, advances the search region to the first line at
/// or after the current position that contains it.
fn narrow_by_anchors(lines: &[String], hunk: &Hunk, cursor: usize) -> usize {
    let mut start = cursor;
    for anchor in &hunk.anchors {
        let anchor = anchor.trim();
        if let Some(found) = lines[start.min(lines.len())..]
            .iter()
            .position(|line| line.contains(anchor))
        {
            start += found;
        }
    }
    start
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    fn read(dir: &Path, name: &str) -> String {
        std::fs::read_to_string(dir.join(name)).unwrap()
    }

    #[test]
    fn add_creates_file_with_parents() {
        let dir = tempfile::tempdir().unwrap();
        let patch = parse(
            "*** Begin Patch\n*** Add File: nested/dir/new.txt\n+hello\n+world\n*** End Patch\n",
        )
        .unwrap();

        let outcomes = apply(&patch, dir.path()).unwrap();
        assert_eq!(
            outcomes,
            vec![FileOutcome::Created {
                path: "nested/dir/new.txt".to_string()
            }]
        );
        assert_eq!(read(dir.path(), "nested/dir/new.txt"), "hello\nworld\n");
    }

    #[test]
    fn delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "old.txt", "bye\n");
        let patch = parse("*** Begin Patch\n*** Delete File: old.txt\n*** End Patch\n").unwrap();

        let outcomes = apply(&patch, dir.path()).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(!dir.path().join("old.txt").exists());
    }

    #[test]
    fn update_replaces_matched_span() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.rs", "fn main() {\n    let x = 1;\n    let y = 2;\n}\n");
        let patch = parse(
            "*** Begin Patch\n*** Update File: main.rs\n@@ fn main\n     let x = 1;\n-    let y = 2;\n+    let y = 3;\n*** End Patch\n",
        )
        .unwrap();

        apply(&patch, dir.path()).unwrap();
        assert_eq!(
            read(dir.path(), "main.rs"),
            "fn main() {\n    let x = 1;\n    let y = 3;\n}\n"
        );
    }

    #[test]
    fn anchors_disambiguate_repeated_context() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "twins.rs",
            "fn first() {\n    ret();\n}\nfn second() {\n    ret();\n}\n",
        );
        let patch = parse(
            "*** Begin Patch\n*** Update File: twins.rs\n@@ fn second\n-    ret();\n+    other();\n*** End Patch\n",
        )
        .unwrap();

        apply(&patch, dir.path()).unwrap();
        assert_eq!(
            read(dir.path(), "twins.rs"),
            "fn first() {\n    ret();\n}\nfn second() {\n    other();\n}\n"
        );
    }

    #[test]
    fn ambiguous_match_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "dup.rs", "same();\nsame();\n");
        let patch = parse(
            "*** Begin Patch\n*** Update File: dup.rs\n@@\n-same();\n+other();\n*** End Patch\n",
        )
        .unwrap();

        let err = apply(&patch, dir.path()).unwrap_err();
        match err {
            PatchError::Apply { message, .. } => assert!(message.contains("ambiguous")),
            other => panic!("expected apply error, got {other:?}"),
        }
        // No partial write happened.
        assert_eq!(read(dir.path(), "dup.rs"), "same();\nsame();\n");
    }

    #[test]
    fn missing_context_reports_searched_lines() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.rs", "actual content\n");
        let patch = parse(
            "*** Begin Patch\n*** Update File: a.rs\n@@\n-imaginary line\n+whatever\n*** End Patch\n",
        )
        .unwrap();

        let err = apply(&patch, dir.path()).unwrap_err();
        match err {
            PatchError::Apply { searched, .. } => {
                assert_eq!(searched, vec!["imaginary line".to_string()])
            }
            other => panic!("expected apply error, got {other:?}"),
        }
    }

    #[test]
    fn failing_later_op_stages_out_earlier_ones() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "ok.rs", "fine\n");
        let patch = parse(
            "*** Begin Patch\n*** Update File: ok.rs\n@@\n-fine\n+better\n*** Update File: missing.rs\n@@\n-gone\n+there\n*** End Patch\n",
        )
        .unwrap();

        assert!(apply(&patch, dir.path()).is_err());
        // The valid first op must not have been committed.
        assert_eq!(read(dir.path(), "ok.rs"), "fine\n");
    }

    #[test]
    fn rename_moves_content() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "before.rs", "keep\nchange me\n");
        let patch = parse(
            "*** Begin Patch\n*** Update File: before.rs\n*** Move to: after.rs\n@@\n keep\n-change me\n+changed\n*** End Patch\n",
        )
        .unwrap();

        let outcomes = apply(&patch, dir.path()).unwrap();
        assert_eq!(
            outcomes,
            vec![FileOutcome::Renamed {
                from: "before.rs".to_string(),
                to: "after.rs".to_string()
            }]
        );
        assert!(!dir.path().join("before.rs").exists());
        assert_eq!(read(dir.path(), "after.rs"), "keep\nchanged\n");
    }

    #[test]
    fn absolute_and_escaping_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let abs = parse("*** Begin Patch\n*** Add File: /etc/passwd\n+x\n*** End Patch\n").unwrap();
        assert!(apply(&abs, dir.path()).is_err());

        let escape =
            parse("*** Begin Patch\n*** Add File: ../outside.txt\n+x\n*** End Patch\n").unwrap();
        assert!(apply(&escape, dir.path()).is_err());
    }

    #[test]
    fn hunks_apply_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "two.rs", "alpha\nmiddle\nbeta\n");
        let patch = parse(
            "*** Begin Patch\n*** Update File: two.rs\n@@\n-alpha\n+ALPHA\n@@\n-beta\n+BETA\n*** End Patch\n",
        )
        .unwrap();

        apply(&patch, dir.path()).unwrap();
        assert_eq!(read(dir.path(), "two.rs"), "ALPHA\nmiddle\nBETA\n");
    }

    #[test]
    fn additions_are_reversible() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "r.rs", "one\ntwo\n");

        let forward = parse(
            "*** Begin Patch\n*** Update File: r.rs\n@@\n one\n+inserted\n two\n*** End Patch\n",
        )
        .unwrap();
        apply(&forward, dir.path()).unwrap();
        assert_eq!(read(dir.path(), "r.rs"), "one\ninserted\ntwo\n");

        let reverse = parse(
            "*** Begin Patch\n*** Update File: r.rs\n@@\n one\n-inserted\n two\n*** End Patch\n",
        )
        .unwrap();
        apply(&reverse, dir.path()).unwrap();
        assert_eq!(read(dir.path(), "r.rs"), "one\ntwo\n");
    }
}
