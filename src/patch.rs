use crate::actuator::Actuator;
use crate::types::{ActionError, ActionErrorCode, ActionResult};

const SEARCH_OPEN: &str = "<<<<<<< SEARCH";
const INSERT_OPEN: &str = "<<<<<<< INSERT_AFTER";
const DIVIDER: &str = "=======";
const REPLACE_CLOSE: &str = ">>>>>>> REPLACE";
const INSERT_CLOSE: &str = ">>>>>>> INSERT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffBlockKind {
    Replace,
    Insert,
}

impl DiffBlockKind {
    fn open_marker(self) -> &'static str {
        match self {
            Self::Replace => SEARCH_OPEN,
            Self::Insert => INSERT_OPEN,
        }
    }

    fn close_marker(self) -> &'static str {
        match self {
            Self::Replace => REPLACE_CLOSE,
            Self::Insert => INSERT_CLOSE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Insert => "insert",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffBlock {
    pub kind: DiffBlockKind,
    pub search: Vec<String>,
    pub payload: Vec<String>,
}

impl DiffBlock {
    fn changed_lines(&self) -> usize {
        self.search.len().max(self.payload.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffSummary {
    pub blocks: usize,
    pub changed_lines: usize,
    pub byte_delta: i64,
}

/// Whitespace at either end of a line is incidental; everything between
/// must match exactly.
pub fn match_line(file_line: &str, search_line: &str) -> bool {
    file_line.trim() == search_line.trim()
}

/// Extracts SEARCH/REPLACE and INSERT_AFTER/INSERT blocks in document order.
/// Text outside blocks and blocks missing their closing marker are ignored.
pub fn parse_diff_blocks(diff_text: &str) -> Vec<DiffBlock> {
    let lines = diff_text.lines().collect::<Vec<_>>();
    let mut blocks = Vec::new();
    let mut idx = 0usize;

    while idx < lines.len() {
        let kind = match lines[idx].trim() {
            marker if marker == SEARCH_OPEN => DiffBlockKind::Replace,
            marker if marker == INSERT_OPEN => DiffBlockKind::Insert,
            _ => {
                idx += 1;
                continue;
            }
        };
        match parse_block_body(&lines, idx + 1, kind) {
            Some((block, next)) => {
                blocks.push(block);
                idx = next;
            }
            None => idx += 1,
        }
    }
    blocks
}

fn parse_block_body(lines: &[&str], start: usize, kind: DiffBlockKind) -> Option<(DiffBlock, usize)> {
    let mut search = Vec::new();
    let mut idx = start;
    loop {
        let line = lines.get(idx)?;
        let trimmed = line.trim();
        if trimmed == DIVIDER {
            idx += 1;
            break;
        }
        if trimmed == SEARCH_OPEN || trimmed == INSERT_OPEN {
            return None;
        }
        search.push((*line).to_owned());
        idx += 1;
    }

    let mut payload = Vec::new();
    loop {
        let line = lines.get(idx)?;
        let trimmed = line.trim();
        if trimmed == kind.close_marker() {
            idx += 1;
            break;
        }
        if trimmed == kind.open_marker() {
            return None;
        }
        payload.push((*line).to_owned());
        idx += 1;
    }

    Some((
        DiffBlock {
            kind,
            search,
            payload,
        },
        idx,
    ))
}

/// First index where `search` matches a contiguous run of `lines`.
pub fn find_block(lines: &[String], search: &[String]) -> Option<usize> {
    if search.is_empty() || lines.len() < search.len() {
        return None;
    }
    let max_start = lines.len() - search.len();
    (0..=max_start).find(|&start| {
        search
            .iter()
            .enumerate()
            .all(|(offset, wanted)| match_line(&lines[start + offset], wanted))
    })
}

pub fn apply_block(lines: &mut Vec<String>, block: &DiffBlock) -> ActionResult<()> {
    let Some(start) = find_block(lines, &block.search) else {
        return Err(ActionError::new(
            ActionErrorCode::PatternNotFound,
            format!(
                "{} search text not found:\n{}",
                block.kind.as_str(),
                block.search.join("\n")
            ),
        ));
    };
    let end = start + block.search.len();
    match block.kind {
        DiffBlockKind::Replace => {
            lines.splice(start..end, block.payload.iter().cloned());
        }
        DiffBlockKind::Insert => {
            lines.splice(end..end, block.payload.iter().cloned());
        }
    }
    Ok(())
}

/// Applies every block to `content`, last block first. Pure; no I/O.
pub fn apply_blocks(content: &str, blocks: &[DiffBlock]) -> ActionResult<String> {
    let mut lines = content.split('\n').map(ToOwned::to_owned).collect::<Vec<_>>();
    for block in blocks.iter().rev() {
        apply_block(&mut lines, block)?;
    }
    Ok(lines.join("\n"))
}

/// Reads `path`, applies the diff and writes the result back as one
/// whole-file write. Both steps go through the actuator's permission gate.
pub async fn apply_file_diff(
    actuator: &mut Actuator,
    path: &str,
    diff_text: &str,
) -> ActionResult<DiffSummary> {
    let blocks = parse_diff_blocks(diff_text);
    if blocks.is_empty() {
        return Err(ActionError::malformed(
            "diff contains no SEARCH/REPLACE or INSERT_AFTER blocks",
        ));
    }
    let original = actuator.read(path).await?;
    let updated = apply_blocks(&original, &blocks)?;
    actuator.write(path, &updated).await?;

    Ok(DiffSummary {
        blocks: blocks.len(),
        changed_lines: blocks.iter().map(DiffBlock::changed_lines).sum(),
        byte_delta: updated.len() as i64 - original.len() as i64,
    })
}

/// Renders what `apply_file_diff` would change without writing. Problems are
/// returned as text because this is display-only.
pub async fn preview_file_diff(actuator: &mut Actuator, path: &str, diff_text: &str) -> String {
    let blocks = parse_diff_blocks(diff_text);
    if blocks.is_empty() {
        return format!(
            "Preview of {}: no SEARCH/REPLACE or INSERT_AFTER blocks found",
            path.trim()
        );
    }
    let content = match actuator.read(path).await {
        Ok(content) => content,
        Err(err) => return format!("Preview of {} failed: {err}", path.trim()),
    };
    let lines = content.split('\n').map(ToOwned::to_owned).collect::<Vec<_>>();

    let mut rendered = format!("Preview of {} ({} block(s)):", path.trim(), blocks.len());
    for (index, block) in blocks.iter().enumerate() {
        let location = match find_block(&lines, &block.search) {
            Some(start) => format!("matches line {}", start + 1),
            None => "NOT FOUND in file".to_owned(),
        };
        rendered.push_str(&format!(
            "\n\nBlock {} ({}, {location}):",
            index + 1,
            block.kind.as_str()
        ));
        match block.kind {
            DiffBlockKind::Replace => {
                for line in &block.search {
                    rendered.push_str(&format!("\n- {line}"));
                }
                for line in &block.payload {
                    rendered.push_str(&format!("\n+ {line}"));
                }
            }
            DiffBlockKind::Insert => {
                for line in &block.search {
                    rendered.push_str(&format!("\n  {line}"));
                }
                for line in &block.payload {
                    rendered.push_str(&format!("\n+ {line}"));
                }
            }
        }
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::{
        apply_block, apply_blocks, apply_file_diff, parse_diff_blocks, preview_file_diff,
        DiffBlock, DiffBlockKind,
    };
    use crate::actuator::tests::{actuator_with, temp_workspace};
    use crate::security::gate::tests::ScriptedChooser;
    use crate::security::gate::PermissionChoice;
    use crate::types::ActionErrorCode;

    fn lines(text: &str) -> Vec<String> {
        text.split('\n').map(ToOwned::to_owned).collect()
    }

    #[test]
    fn parses_both_block_kinds_in_document_order() {
        let diff = "intro text\n\
<<<<<<< SEARCH\nfn a() {}\n=======\nfn a(x: u8) {}\n>>>>>>> REPLACE\n\
between\n\
<<<<<<< INSERT_AFTER\nuse std::fs;\n=======\nuse std::io;\n>>>>>>> INSERT\n\
<<<<<<< SEARCH\nold\n=======\n>>>>>>> REPLACE";
        let blocks = parse_diff_blocks(diff);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].kind, DiffBlockKind::Replace);
        assert_eq!(blocks[0].search, vec!["fn a() {}"]);
        assert_eq!(blocks[0].payload, vec!["fn a(x: u8) {}"]);
        assert_eq!(blocks[1].kind, DiffBlockKind::Insert);
        assert_eq!(blocks[1].search, vec!["use std::fs;"]);
        assert_eq!(blocks[1].payload, vec!["use std::io;"]);
        assert!(blocks[2].payload.is_empty());
    }

    #[test]
    fn unterminated_or_mismatched_blocks_are_skipped() {
        let diff = "<<<<<<< SEARCH\na\n=======\nb\n\
<<<<<<< SEARCH\nc\n=======\nd\n>>>>>>> REPLACE\n\
<<<<<<< INSERT_AFTER\ne\n=======\nf\n>>>>>>> REPLACE";
        let blocks = parse_diff_blocks(diff);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].search, vec!["c"]);
    }

    #[test]
    fn replace_matches_with_trimmed_lines_only() {
        let mut file = lines("fn main() {\n    let x = 1;\n}\n");
        let block = DiffBlock {
            kind: DiffBlockKind::Replace,
            search: vec!["let x = 1;   ".to_owned()],
            payload: vec!["    let x = 2;".to_owned()],
        };
        apply_block(&mut file, &block).expect("apply");
        assert_eq!(file.join("\n"), "fn main() {\n    let x = 2;\n}\n");

        let inner = DiffBlock {
            kind: DiffBlockKind::Replace,
            search: vec!["let  x = 2;".to_owned()],
            payload: vec![],
        };
        let err = apply_block(&mut file, &inner).expect_err("inner whitespace matters");
        assert_eq!(err.code, ActionErrorCode::PatternNotFound);
        assert!(err.message.contains("let  x = 2;"));
    }

    #[test]
    fn insert_lands_after_anchor() {
        let mut file = lines("a\nb\nc");
        let block = DiffBlock {
            kind: DiffBlockKind::Insert,
            search: vec!["a".to_owned(), "b".to_owned()],
            payload: vec!["b2".to_owned(), "b3".to_owned()],
        };
        apply_block(&mut file, &block).expect("insert");
        assert_eq!(file, lines("a\nb\nb2\nb3\nc"));
    }

    #[test]
    fn first_match_wins_and_empty_search_is_not_found() {
        let mut file = lines("x\nx\n");
        let block = DiffBlock {
            kind: DiffBlockKind::Replace,
            search: vec!["x".to_owned()],
            payload: vec!["y".to_owned()],
        };
        apply_block(&mut file, &block).expect("apply");
        assert_eq!(file.join("\n"), "y\nx\n");

        let empty = DiffBlock {
            kind: DiffBlockKind::Insert,
            search: vec![],
            payload: vec!["z".to_owned()],
        };
        let err = apply_block(&mut file, &empty).expect_err("empty search");
        assert_eq!(err.code, ActionErrorCode::PatternNotFound);
    }

    #[test]
    fn blocks_apply_last_first() {
        let blocks = parse_diff_blocks(
            "<<<<<<< SEARCH\nx\n=======\ny\n>>>>>>> REPLACE\n\
<<<<<<< SEARCH\ny\n=======\nz\n>>>>>>> REPLACE",
        );
        // Reverse order: y->z finds nothing yet, so the whole diff fails.
        let err = apply_blocks("x\n", &blocks).expect_err("reverse order");
        assert_eq!(err.code, ActionErrorCode::PatternNotFound);

        let blocks = parse_diff_blocks(
            "<<<<<<< SEARCH\ny\n=======\nz\n>>>>>>> REPLACE\n\
<<<<<<< SEARCH\nx\n=======\ny\n>>>>>>> REPLACE",
        );
        assert_eq!(apply_blocks("x\n", &blocks).expect("apply"), "z\n");
    }

    #[tokio::test]
    async fn file_diff_roundtrip_and_second_application_fails() {
        let root = temp_workspace("patch");
        std::fs::write(root.join("lib.js"), "foo()\n").expect("seed");
        let mut actuator = actuator_with(
            root.clone(),
            ScriptedChooser::always(PermissionChoice::Allow),
        );
        let diff = "<<<<<<< SEARCH\nfoo()\n=======\nfoo(x)\n>>>>>>> REPLACE";

        let summary = apply_file_diff(&mut actuator, "lib.js", diff)
            .await
            .expect("apply");
        assert_eq!(summary.blocks, 1);
        assert_eq!(summary.changed_lines, 1);
        assert_eq!(summary.byte_delta, 1);
        assert_eq!(
            std::fs::read_to_string(root.join("lib.js")).expect("read"),
            "foo(x)\n"
        );

        let err = apply_file_diff(&mut actuator, "lib.js", diff)
            .await
            .expect_err("second application");
        assert_eq!(err.code, ActionErrorCode::PatternNotFound);
        assert_eq!(
            std::fs::read_to_string(root.join("lib.js")).expect("read"),
            "foo(x)\n"
        );
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn failing_block_leaves_file_untouched() {
        let root = temp_workspace("patch-partial");
        std::fs::write(root.join("a.txt"), "one\ntwo\n").expect("seed");
        let mut actuator = actuator_with(
            root.clone(),
            ScriptedChooser::always(PermissionChoice::Allow),
        );
        let diff = "<<<<<<< SEARCH\none\n=======\nONE\n>>>>>>> REPLACE\n\
<<<<<<< SEARCH\nthree\n=======\nTHREE\n>>>>>>> REPLACE";
        let err = apply_file_diff(&mut actuator, "a.txt", diff)
            .await
            .expect_err("missing block");
        assert_eq!(err.code, ActionErrorCode::PatternNotFound);
        assert_eq!(
            std::fs::read_to_string(root.join("a.txt")).expect("read"),
            "one\ntwo\n"
        );
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn diff_without_blocks_is_malformed() {
        let root = temp_workspace("patch-empty");
        let chooser = ScriptedChooser::always(PermissionChoice::Allow);
        let mut actuator = actuator_with(root.clone(), chooser.clone());
        let err = apply_file_diff(&mut actuator, "a.txt", "just prose")
            .await
            .expect_err("no blocks");
        assert_eq!(err.code, ActionErrorCode::MalformedParams);
        assert_eq!(chooser.prompt_count(), 0);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn preview_never_writes_and_reports_problems_inline() {
        let root = temp_workspace("preview");
        std::fs::write(root.join("a.txt"), "alpha\nbeta\n").expect("seed");
        let chooser = ScriptedChooser::always(PermissionChoice::Allow);
        let mut actuator = actuator_with(root.clone(), chooser.clone());
        let diff = "<<<<<<< SEARCH\nbeta\n=======\nBETA\n>>>>>>> REPLACE\n\
<<<<<<< INSERT_AFTER\ngamma\n=======\ndelta\n>>>>>>> INSERT";

        let preview = preview_file_diff(&mut actuator, "a.txt", diff).await;
        assert!(preview.contains("Block 1 (replace, matches line 2)"));
        assert!(preview.contains("- beta"));
        assert!(preview.contains("+ BETA"));
        assert!(preview.contains("Block 2 (insert, NOT FOUND in file)"));
        assert_eq!(
            std::fs::read_to_string(root.join("a.txt")).expect("read"),
            "alpha\nbeta\n"
        );
        assert!(chooser
            .seen
            .lock()
            .expect("seen")
            .iter()
            .all(|prompt| prompt.description.starts_with("Read file")));

        let missing = preview_file_diff(&mut actuator, "missing.txt", diff).await;
        assert!(missing.contains("failed"));
        let _ = std::fs::remove_dir_all(root);
    }
}
