//! Visual editor edit actions.
//!
//! The editor sends "replace this value with that one near line N". The
//! action is resolved against the file's current content and becomes an
//! editor-priority change whose base is that content.

use serde::{Deserialize, Serialize};

use super::{NewChange, QueueError};
use crate::core::ProjectId;

/// 1-based position in a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub line: usize,
    #[serde(default)]
    pub column: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditAction {
    pub file_path: String,
    pub old_value: String,
    pub new_value: String,
    #[serde(default)]
    pub location: Option<SourceLocation>,
}

impl EditAction {
    /// Replace the occurrence of `old_value` nearest the location's line
    /// (the first one when no location is given).
    pub fn apply(&self, current: &str) -> Result<String, QueueError> {
        if self.old_value.is_empty() {
            return Err(QueueError::Conflict(format!(
                "{}: empty value to replace",
                self.file_path
            )));
        }

        let offsets: Vec<usize> = current
            .match_indices(&self.old_value)
            .map(|(offset, _)| offset)
            .collect();

        let offset = match (self.location, offsets.as_slice()) {
            (_, []) => {
                return Err(QueueError::Conflict(format!(
                    "{}: `{}` not found",
                    self.file_path, self.old_value
                )));
            }
            (None, [first, ..]) => *first,
            (Some(location), _) => nearest(current, &offsets, location),
        };

        let mut out = String::with_capacity(current.len() + self.new_value.len());
        out.push_str(&current[..offset]);
        out.push_str(&self.new_value);
        out.push_str(&current[offset + self.old_value.len()..]);
        Ok(out)
    }

    /// Resolve against `current` into an editor change based on it.
    pub fn into_change(self, project_id: ProjectId, current: &str) -> Result<NewChange, QueueError> {
        let content = self.apply(current)?;
        Ok(NewChange::editor(
            project_id,
            self.file_path,
            content,
            current.to_owned(),
        ))
    }
}

/// Offset whose line (then column) is closest to `location`; ties keep the earlier one.
fn nearest(text: &str, offsets: &[usize], location: SourceLocation) -> usize {
    let mut best = offsets[0];
    let mut best_distance = (usize::MAX, usize::MAX);
    for &offset in offsets {
        let before = &text[..offset];
        let line = before.matches('\n').count() + 1;
        let column = before.rfind('\n').map_or(offset, |nl| offset - nl - 1) + 1;
        let distance = (
            line.abs_diff(location.line),
            location.column.map_or(0, |c| column.abs_diff(c)),
        );
        if distance < best_distance {
            best = offset;
            best_distance = distance;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChangeKind, Priority};

    const SOURCE: &str = "<h1 class=\"red\">A</h1>\n<p class=\"red\">B</p>\n<p class=\"red\">C</p>\n";

    fn action(line: Option<usize>) -> EditAction {
        EditAction {
            file_path: "src/App.tsx".into(),
            old_value: "red".into(),
            new_value: "blue".into(),
            location: line.map(|line| SourceLocation { line, column: None }),
        }
    }

    #[test]
    fn test_first_occurrence_without_location() {
        let out = action(None).apply(SOURCE).unwrap();
        assert!(out.starts_with("<h1 class=\"blue\">"));
        assert_eq!(out.matches("red").count(), 2);
    }

    #[test]
    fn test_nearest_line_wins() {
        let out = action(Some(3)).apply(SOURCE).unwrap();
        assert_eq!(out.lines().nth(2), Some("<p class=\"blue\">C</p>"));
        assert_eq!(out.lines().nth(1), Some("<p class=\"red\">B</p>"));

        let out = action(Some(40)).apply(SOURCE).unwrap();
        assert_eq!(out.lines().nth(2), Some("<p class=\"blue\">C</p>"));
    }

    #[test]
    fn test_column_breaks_ties() {
        let action = EditAction {
            file_path: "a.css".into(),
            old_value: "1px".into(),
            new_value: "2px".into(),
            location: Some(SourceLocation {
                line: 1,
                column: Some(20),
            }),
        };
        let out = action.apply("margin: 1px; padding: 1px;").unwrap();
        assert_eq!(out, "margin: 1px; padding: 2px;");
    }

    #[test]
    fn test_missing_value_is_conflict() {
        let mut edit = action(None);
        edit.old_value = "green".into();
        assert!(matches!(edit.apply(SOURCE), Err(QueueError::Conflict(_))));

        edit.old_value.clear();
        assert!(edit.apply(SOURCE).is_err());
    }

    #[test]
    fn test_into_change_is_editor_priority_with_base() {
        let change = action(Some(2))
            .into_change(ProjectId::new("a"), SOURCE)
            .unwrap();
        assert_eq!(change.priority, Priority::EDITOR);
        assert_eq!(change.kind, ChangeKind::Update);
        assert_eq!(change.base.as_deref(), Some(SOURCE));
        assert!(change.content.unwrap().contains("<p class=\"blue\">B</p>"));
    }

    #[test]
    fn test_deserialize_from_editor_payload() {
        let edit: EditAction = serde_json::from_str(
            r#"{"file_path":"src/App.tsx","old_value":"a","new_value":"b","location":{"line":3}}"#,
        )
        .unwrap();
        assert_eq!(edit.location, Some(SourceLocation { line: 3, column: None }));
    }
}
