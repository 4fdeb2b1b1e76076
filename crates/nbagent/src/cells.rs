//! Cell data model and table rendering.
//!
//! Cells cross the collaborator boundary as [`CellRecord`]s (raw source string,
//! nbformat-shaped output JSON) and reach callers as [`CellPayload`]s with
//! line-normalized source and normalized outputs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;
use crate::outputs::OutputItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellType {
    Code,
    Markdown,
    Raw,
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellType::Code => write!(f, "code"),
            CellType::Markdown => write!(f, "markdown"),
            CellType::Raw => write!(f, "raw"),
        }
    }
}

impl FromStr for CellType {
    type Err = ToolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code" => Ok(CellType::Code),
            "markdown" => Ok(CellType::Markdown),
            "raw" => Ok(CellType::Raw),
            other => Err(ToolError::InvalidCellType(other.to_string())),
        }
    }
}

/// Raw cell state as reported by a document collaborator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellRecord {
    pub cell_type: String,
    pub source: String,
    pub outputs: Vec<Value>,
    pub execution_count: Option<i64>,
}

/// Caller-facing cell view with normalized source and outputs.
#[derive(Debug, Clone, Serialize)]
pub struct CellPayload {
    pub index: usize,
    #[serde(rename = "type")]
    pub cell_type: String,
    pub source: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<OutputItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<i64>,
}

/// Split source into lines, keeping each line's trailing newline except on the
/// last line. This matches the interchange convention where multi-line source
/// is stored as a list of newline-terminated strings.
pub fn source_lines(source: &str) -> Vec<String> {
    if source.is_empty() {
        return Vec::new();
    }
    let mut lines: Vec<String> = source.split_inclusive('\n').map(str::to_owned).collect();
    if let Some(last) = lines.last_mut() {
        if last.ends_with('\n') {
            last.pop();
            if last.ends_with('\r') {
                last.pop();
            }
        }
    }
    lines
}

/// First line of a source string, truncated for table display.
fn first_line_preview(source: &str) -> String {
    let first = source.lines().next().unwrap_or("");
    if first.chars().count() > 50 {
        let truncated: String = first.chars().take(47).collect();
        format!("{truncated}...")
    } else {
        first.to_string()
    }
}

fn execution_count_column(record: &CellRecord) -> String {
    if record.cell_type == "code" {
        match record.execution_count {
            Some(n) => n.to_string(),
            None => "None".to_string(),
        }
    } else {
        "N/A".to_string()
    }
}

const TABLE_HEADER: &str = "Index\tType\tCount\tFirst Line";

/// Render all cells as a tab-separated table.
pub fn format_cell_table(records: &[CellRecord]) -> String {
    if records.is_empty() {
        return "Notebook is empty, no cells found.".to_string();
    }

    let mut lines = vec![TABLE_HEADER.to_string(), "-".repeat(60)];
    for (i, record) in records.iter().enumerate() {
        lines.push(format!(
            "{i}\t{}\t{}\t{}",
            record.cell_type,
            execution_count_column(record),
            first_line_preview(&record.source)
        ));
    }
    lines.join("\n")
}

/// Render a window of up to five cells on each side of `target_index`, with
/// the target row marked. Used by insert responses so the caller sees where
/// the new cell landed.
pub fn surrounding_cells_info(records: &[CellRecord], target_index: usize) -> String {
    if records.is_empty() {
        return "Notebook is now empty, no cells remaining".to_string();
    }

    let start = target_index.saturating_sub(5);
    let end = (target_index + 6).min(records.len());

    let mut lines = vec![TABLE_HEADER.to_string(), "-".repeat(60)];
    for (i, record) in records.iter().enumerate().take(end).skip(start) {
        let marker = if i == target_index { " <- inserted" } else { "" };
        lines.push(format!(
            "{i}\t{}\t{}\t{}{marker}",
            record.cell_type,
            execution_count_column(record),
            first_line_preview(&record.source)
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cell_type_round_trips() {
        assert_eq!("code".parse::<CellType>().unwrap(), CellType::Code);
        assert_eq!(CellType::Markdown.to_string(), "markdown");
        assert!(matches!(
            "figure".parse::<CellType>(),
            Err(ToolError::InvalidCellType(t)) if t == "figure"
        ));
    }

    #[test]
    fn source_lines_keep_inner_newlines() {
        assert_eq!(source_lines("a\nb\nc"), vec!["a\n", "b\n", "c"]);
        assert_eq!(source_lines("a\nb\n"), vec!["a\n", "b"]);
        assert_eq!(source_lines("single"), vec!["single"]);
        assert!(source_lines("").is_empty());
    }

    #[test]
    fn empty_notebook_table() {
        assert_eq!(format_cell_table(&[]), "Notebook is empty, no cells found.");
    }

    #[test]
    fn markdown_cells_show_na_count() {
        let records = vec![CellRecord {
            cell_type: "markdown".into(),
            source: "# Title".into(),
            outputs: vec![],
            execution_count: None,
        }];
        let table = format_cell_table(&records);
        let row = table.lines().nth(2).unwrap();
        assert_eq!(row, "0\tmarkdown\tN/A\t# Title");
    }

    #[test]
    fn code_cells_show_count_or_none() {
        let records = vec![
            CellRecord {
                cell_type: "code".into(),
                source: "1+1".into(),
                outputs: vec![json!({"output_type": "execute_result"})],
                execution_count: Some(3),
            },
            CellRecord {
                cell_type: "code".into(),
                source: "x".into(),
                ..Default::default()
            },
        ];
        let table = format_cell_table(&records);
        assert!(table.contains("0\tcode\t3\t1+1"));
        assert!(table.contains("1\tcode\tNone\tx"));
    }

    #[test]
    fn long_first_lines_are_truncated() {
        let records = vec![CellRecord {
            cell_type: "code".into(),
            source: "x".repeat(80),
            ..Default::default()
        }];
        let table = format_cell_table(&records);
        let row = table.lines().nth(2).unwrap();
        assert!(row.ends_with("..."));
        assert!(row.len() < 80);
    }

    #[test]
    fn surrounding_info_marks_target() {
        let records: Vec<CellRecord> = (0..12)
            .map(|i| CellRecord {
                cell_type: "code".into(),
                source: format!("cell {i}"),
                ..Default::default()
            })
            .collect();
        let info = surrounding_cells_info(&records, 8);
        assert!(info.contains("8\tcode\tNone\tcell 8 <- inserted"));
        // Window is bounded to five rows on each side.
        assert!(!info.contains("cell 2"));
        assert!(info.contains("cell 3"));
    }
}
