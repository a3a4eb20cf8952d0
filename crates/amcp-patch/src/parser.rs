use once_cell::sync::Lazy;
use regex::Regex;

use crate::PatchError;

static BEGIN_PATCH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\*\*\*\s*Begin\s*Patch\s*$").unwrap());
static END_PATCH: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\*\*\*\s*End\s*Patch\s*$").unwrap());
static ADD_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\*\*\*\s*Add\s*File:\s*(.+?)\s*$").unwrap());
static DELETE_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\*\*\*\s*Delete\s*File:\s*(.+?)\s*$").unwrap());
static UPDATE_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\*\*\*\s*Update\s*File:\s*(.+?)\s*$").unwrap());
static MOVE_TO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\*\*\*\s*Move\s*to:\s*(.+?)\s*$").unwrap());
static END_OF_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\*\*\*\s*End\s*of\s*File\s*$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Context,
    Delete,
    Insert,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HunkLine {
    pub kind: LineKind,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Hunk {
    pub anchors: Vec<String>,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    /// Context and delete lines, in order: the sequence that must exist in
    /// the target file.
    pub fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| l.kind != LineKind::Insert)
            .map(|l| l.text.as_str())
            .collect()
    }

    /// Context and insert lines, in order: the replacement sequence.
    pub fn new_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| l.kind != LineKind::Delete)
            .map(|l| l.text.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOp {
    Add {
        path: String,
        content: Vec<String>,
    },
    Delete {
        path: String,
    },
    Update {
        path: String,
        move_to: Option<String>,
        hunks: Vec<Hunk>,
    },
}

impl FileOp {
    pub fn path(&self) -> &str {
        match self {
            FileOp::Add { path, .. } | FileOp::Delete { path } | FileOp::Update { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Patch {
    pub ops: Vec<FileOp>,
}

/// Parse the framed patch text. Unknown content between operations is
/// skipped; a missing frame is an error.
pub fn parse(patch_text: &str) -> Result<Patch, PatchError> {
    let lines: Vec<&str> = patch_text.lines().collect();
    let mut patch = Patch::default();

    let mut i = 0;
    while i < lines.len() {
        if BEGIN_PATCH.is_match(lines[i].trim()) {
            i += 1;
            break;
        }
        i += 1;
    }
    if i > lines.len() || (i == lines.len() && !lines.iter().any(|l| BEGIN_PATCH.is_match(l.trim())))
    {
        return Err(PatchError::Parse("no '*** Begin Patch' found".to_string()));
    }

    while i < lines.len() {
        let line = lines[i].trim();

        if END_PATCH.is_match(line) {
            return Ok(patch);
        }

        if let Some(caps) = ADD_FILE.captures(line) {
            let (op, next) = parse_add(&lines, i + 1, caps[1].to_string());
            patch.ops.push(op);
            i = next;
        } else if let Some(caps) = DELETE_FILE.captures(line) {
            patch.ops.push(FileOp::Delete {
                path: caps[1].to_string(),
            });
            i += 1;
        } else if let Some(caps) = UPDATE_FILE.captures(line) {
            let (op, next) = parse_update(&lines, i + 1, caps[1].to_string())?;
            patch.ops.push(op);
            i = next;
        } else {
            i += 1;
        }
    }

    Err(PatchError::Parse("no '*** End Patch' found".to_string()))
}

fn is_op_boundary(line: &str) -> bool {
    END_PATCH.is_match(line)
        || ADD_FILE.is_match(line)
        || DELETE_FILE.is_match(line)
        || UPDATE_FILE.is_match(line)
}

fn parse_add(lines: &[&str], start: usize, path: String) -> (FileOp, usize) {
    let mut content = Vec::new();
    let mut i = start;

    while i < lines.len() {
        let line = lines[i];
        if is_op_boundary(line.trim()) {
            break;
        }
        if let Some(text) = line.strip_prefix('+') {
            content.push(text.to_string());
        }
        i += 1;
    }

    (FileOp::Add { path, content }, i)
}

fn parse_update(lines: &[&str], start: usize, path: String) -> Result<(FileOp, usize), PatchError> {
    let mut move_to = None;
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut current: Option<Hunk> = None;
    let mut i = start;

    if i < lines.len() {
        if let Some(caps) = MOVE_TO.captures(lines[i].trim()) {
            move_to = Some(caps[1].to_string());
            i += 1;
        }
    }

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim();

        if is_op_boundary(trimmed) {
            break;
        }
        if END_OF_FILE.is_match(trimmed) {
            i += 1;
            continue;
        }

        if let Some(anchor) = trimmed.strip_prefix("@@") {
            let anchor = anchor.trim();
            // An `@@` line after diff lines starts a new hunk.
            let start_new = current.as_ref().is_some_and(|h| !h.lines.is_empty());
            if start_new {
                hunks.extend(current.take());
            }
            let hunk = current.get_or_insert_with(Hunk::default);
            if !anchor.is_empty() {
                hunk.anchors.push(anchor.to_string());
            }
            i += 1;
            continue;
        }

        let kind = match line.chars().next() {
            Some(' ') => Some(LineKind::Context),
            Some('-') => Some(LineKind::Delete),
            Some('+') => Some(LineKind::Insert),
            _ => None,
        };

        if let Some(kind) = kind {
            let hunk = current.get_or_insert_with(Hunk::default);
            hunk.lines.push(HunkLine {
                kind,
                text: line[1..].to_string(),
            });
        }
        i += 1;
    }

    hunks.extend(current.take());

    if hunks.is_empty() {
        return Err(PatchError::Parse(format!(
            "update for {path} contains no hunks"
        )));
    }

    Ok((
        FileOp::Update {
            path,
            move_to,
            hunks,
        },
        i,
    ))
}

/// Canonical rendering of a parsed patch. `parse(render(parse(p)))` is
/// identical to `parse(p)`.
pub fn render(patch: &Patch) -> String {
    let mut out = String::from("*** Begin Patch\n");

    for op in &patch.ops {
        match op {
            FileOp::Add { path, content } => {
                out.push_str(&format!("*** Add File: {path}\n"));
                for line in content {
                    out.push_str(&format!("+{line}\n"));
                }
            }
            FileOp::Delete { path } => {
                out.push_str(&format!("*** Delete File: {path}\n"));
            }
            FileOp::Update {
                path,
                move_to,
                hunks,
            } => {
                out.push_str(&format!("*** Update File: {path}\n"));
                if let Some(target) = move_to {
                    out.push_str(&format!("*** Move to: {target}\n"));
                }
                for hunk in hunks {
                    if hunk.anchors.is_empty() {
                        out.push_str("@@\n");
                    }
                    for anchor in &hunk.anchors {
                        out.push_str(&format!("@@ {anchor}\n"));
                    }
                    for line in &hunk.lines {
                        let prefix = match line.kind {
                            LineKind::Context => ' ',
                            LineKind::Delete => '-',
                            LineKind::Insert => '+',
                        };
                        out.push_str(&format!("{prefix}{}\n", line.text));
                    }
                }
            }
        }
    }

    out.push_str("*** End Patch\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"*** Begin Patch
*** Add File: docs/note.md
+# Note
+first line
*** Update File: src/lib.rs
@@ fn main
 let x = 1;
-let y = 2;
+let y = 3;
 println!("{x}{y}");
*** Delete File: old.txt
*** End Patch
"#;

    #[test]
    fn parses_all_op_kinds() {
        let patch = parse(SAMPLE).unwrap();
        assert_eq!(patch.ops.len(), 3);

        match &patch.ops[0] {
            FileOp::Add { path, content } => {
                assert_eq!(path, "docs/note.md");
                assert_eq!(content, &vec!["# Note".to_string(), "first line".to_string()]);
            }
            other => panic!("expected add, got {other:?}"),
        }

        match &patch.ops[1] {
            FileOp::Update { path, hunks, .. } => {
                assert_eq!(path, "src/lib.rs");
                assert_eq!(hunks.len(), 1);
                assert_eq!(hunks[0].anchors, vec!["fn main".to_string()]);
                assert_eq!(hunks[0].old_lines().len(), 3);
                assert_eq!(hunks[0].new_lines().len(), 3);
            }
            other => panic!("expected update, got {other:?}"),
        }

        assert!(matches!(&patch.ops[2], FileOp::Delete { path } if path == "old.txt"));
    }

    #[test]
    fn move_to_is_parsed() {
        let text = "*** Begin Patch\n*** Update File: a.rs\n*** Move to: b.rs\n@@\n-old\n+new\n*** End Patch\n";
        let patch = parse(text).unwrap();
        match &patch.ops[0] {
            FileOp::Update { move_to, .. } => assert_eq!(move_to.as_deref(), Some("b.rs")),
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn multiple_anchors_accumulate_on_one_hunk() {
        let text = "*** Begin Patch\n*** Update File: a.rs\n@@ impl Foo\n@@ fn bar\n-old\n+new\n*** End Patch\n";
        let patch = parse(text).unwrap();
        match &patch.ops[0] {
            FileOp::Update { hunks, .. } => {
                assert_eq!(hunks.len(), 1);
                assert_eq!(hunks[0].anchors.len(), 2);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn anchor_after_diff_lines_starts_new_hunk() {
        let text = "*** Begin Patch\n*** Update File: a.rs\n@@ one\n-a\n+b\n@@ two\n-c\n+d\n*** End Patch\n";
        let patch = parse(text).unwrap();
        match &patch.ops[0] {
            FileOp::Update { hunks, .. } => assert_eq!(hunks.len(), 2),
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn missing_frame_is_an_error() {
        assert!(parse("*** Add File: a\n+x\n").is_err());
        assert!(parse("*** Begin Patch\n*** Add File: a\n+x\n").is_err());
    }

    #[test]
    fn empty_update_is_an_error() {
        let text = "*** Begin Patch\n*** Update File: a.rs\n*** End Patch\n";
        assert!(matches!(parse(text), Err(PatchError::Parse(_))));
    }

    #[test]
    fn render_round_trips() {
        let parsed = parse(SAMPLE).unwrap();
        let rendered = render(&parsed);
        let reparsed = parse(&rendered).unwrap();
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn render_round_trips_anchorless_hunks() {
        let text = "*** Begin Patch\n*** Update File: a.rs\n@@\n x\n-old\n+new\n*** End Patch\n";
        let parsed = parse(text).unwrap();
        let reparsed = parse(&render(&parsed)).unwrap();
        assert_eq!(parsed, reparsed);
    }
}
