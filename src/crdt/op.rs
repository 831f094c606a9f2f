// model = "claude-opus-4-5"
// created = "2026-01-30"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

//! Edit operations for string tag values.
//!
//! An edit is an ordered list of operations that walk the text from the
//! start, describing what the issuer intended against the text it had seen:
//!
//! - Preserve: "skip the next n characters"
//! - Insert: "insert this text here"
//! - Delete: "remove the next n characters"
//!
//! Offsets are in characters, not bytes. The issuer's version vector pins
//! down which text the offsets refer to, so a concurrent remote insert
//! earlier in the document does not shift this edit's targets.

use serde::Deserialize;
use serde::Serialize;

use super::primitives::VersionVector;

/// One step of an edit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditOp {
    Preserve(u64),
    Insert(String),
    Delete(u64),
}

/// An edit to a string tag, issued against a known version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEdit {
    /// What the issuer had seen when it produced the edit.
    #[serde(default)]
    pub version: VersionVector,
    pub ops: Vec<EditOp>,
    /// Set when the edit is applied on behalf of a remote collaborator.
    #[serde(default)]
    pub is_remote: bool,
}

impl TagEdit {
    /// Create a local edit.
    pub fn new(version: VersionVector, ops: Vec<EditOp>) -> TagEdit {
        return TagEdit {
            version,
            ops,
            is_remote: false,
        };
    }

    /// Create an edit applied on behalf of a remote collaborator.
    pub fn remote(version: VersionVector, ops: Vec<EditOp>) -> TagEdit {
        return TagEdit {
            version,
            ops,
            is_remote: true,
        };
    }

    /// Insert `text` at character offset `at`.
    pub fn insert(version: VersionVector, at: u64, text: impl Into<String>) -> TagEdit {
        let mut ops = Vec::new();
        if at > 0 {
            ops.push(EditOp::Preserve(at));
        }
        ops.push(EditOp::Insert(text.into()));
        return TagEdit::new(version, ops);
    }

    /// Delete `len` characters starting at character offset `at`.
    pub fn delete(version: VersionVector, at: u64, len: u64) -> TagEdit {
        let mut ops = Vec::new();
        if at > 0 {
            ops.push(EditOp::Preserve(at));
        }
        ops.push(EditOp::Delete(len));
        return TagEdit::new(version, ops);
    }

    /// Apply the edit to a plain string, ignoring the version.
    ///
    /// Out-of-range preserves and deletes are clamped to the end.
    pub fn apply_to_str(&self, text: &str) -> String {
        let chars: Vec<char> = text.chars().collect();
        let mut result = String::with_capacity(text.len());
        let mut index = 0usize;
        for op in &self.ops {
            match op {
                EditOp::Preserve(n) => {
                    let end = clamped_end(index, *n, chars.len());
                    result.extend(&chars[index..end]);
                    index = end;
                }
                EditOp::Insert(inserted) => {
                    result.push_str(inserted);
                }
                EditOp::Delete(n) => {
                    index = clamped_end(index, *n, chars.len());
                }
            }
        }
        result.extend(&chars[index..]);
        return result;
    }
}

fn clamped_end(index: usize, count: u64, len: usize) -> usize {
    let count = usize::try_from(count).unwrap_or(usize::MAX);
    return index.saturating_add(count).min(len);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_builder() {
        let edit = TagEdit::insert(VersionVector::new(), 2, "X");
        assert_eq!(edit.ops, vec![EditOp::Preserve(2), EditOp::Insert("X".to_string())]);
        assert!(!edit.is_remote);
    }

    #[test]
    fn apply_to_plain_string() {
        let edit = TagEdit::new(VersionVector::new(), vec![
            EditOp::Preserve(1),
            EditOp::Delete(1),
            EditOp::Insert("ZZ".to_string()),
        ]);
        assert_eq!(edit.apply_to_str("abc"), "aZZc");
    }

    #[test]
    fn apply_counts_characters_not_bytes() {
        let edit = TagEdit::insert(VersionVector::new(), 1, "!");
        assert_eq!(edit.apply_to_str("héllo"), "h!éllo");
    }

    #[test]
    fn apply_clamps_out_of_range() {
        let edit = TagEdit::new(VersionVector::new(), vec![EditOp::Preserve(10), EditOp::Delete(3), EditOp::Insert("x".to_string())]);
        assert_eq!(edit.apply_to_str("ab"), "abx");
    }

    #[test]
    fn apply_saturates_huge_counts() {
        let preserve = TagEdit::new(VersionVector::new(), vec![EditOp::Preserve(1), EditOp::Preserve(u64::MAX)]);
        assert_eq!(preserve.apply_to_str("abc"), "abc");

        let delete = TagEdit::new(VersionVector::new(), vec![EditOp::Preserve(1), EditOp::Delete(u64::MAX), EditOp::Insert("!".to_string())]);
        assert_eq!(delete.apply_to_str("abc"), "a!");
    }

    #[test]
    fn wire_shape() {
        let edit = TagEdit::remote(VersionVector::new().with("a", 2), vec![EditOp::Insert("hi".to_string())]);
        let json = serde_json::to_value(&edit).unwrap();
        assert_eq!(json, serde_json::json!({ "version": { "a": 2 }, "ops": [{ "insert": "hi" }], "is_remote": true }));
    }
}
