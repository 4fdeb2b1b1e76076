//! Cell-level tools: insert, overwrite, delete, read, list.
//!
//! Every operation resolves the current session's document fresh, validates
//! indices against that resolution, and applies at most one structural change.

use std::str::FromStr;

use super::{CellIndexArgs, InsertCellArgs, OverwriteCellArgs, ToolOutput, Toolbox};
use crate::cells::{
    format_cell_table, source_lines, surrounding_cells_info, CellPayload, CellRecord, CellType,
};
use crate::backend::traits::DocChange;
use crate::error::ToolError;
use crate::outputs::safe_extract_outputs;
use crate::retry::{with_connection_retry, DEFAULT_MAX_ATTEMPTS};

/// Validate an index against the just-resolved cell count, `[0, n)`.
pub(crate) fn check_index(index: i64, cell_count: usize) -> Result<usize, ToolError> {
    if index < 0 || index as usize >= cell_count {
        return Err(ToolError::IndexOutOfRange { index, cell_count });
    }
    Ok(index as usize)
}

/// Map an insertion index, where -1 means append, into `[0, n]`.
pub(crate) fn check_insert_index(index: i64, cell_count: usize) -> Result<usize, ToolError> {
    if index == -1 {
        return Ok(cell_count);
    }
    if index < 0 || index as usize > cell_count {
        return Err(ToolError::IndexOutOfRange { index, cell_count });
    }
    Ok(index as usize)
}

fn cell_payload(record: CellRecord, index: usize, allow_images: bool) -> CellPayload {
    let outputs = (record.cell_type == "code")
        .then(|| safe_extract_outputs(&record.outputs, allow_images));
    CellPayload {
        index,
        cell_type: record.cell_type,
        source: source_lines(&record.source),
        outputs,
        execution_count: record.execution_count,
    }
}

impl Toolbox {
    pub(crate) async fn list_cells(&self) -> Result<ToolOutput, ToolError> {
        with_connection_retry("list_cells", DEFAULT_MAX_ATTEMPTS, || async {
            let (_, doc) = self.resolve_current().await?;
            let records = doc.cells().await?;
            Ok(ToolOutput::Message(format_cell_table(&records)))
        })
        .await
    }

    pub(crate) async fn read_cell(&self, args: CellIndexArgs) -> Result<ToolOutput, ToolError> {
        with_connection_retry("read_cell", DEFAULT_MAX_ATTEMPTS, || async {
            let (_, doc) = self.resolve_current().await?;
            let cell_count = doc.cell_count().await?;
            let index = check_index(args.cell_index, cell_count)?;
            let record = doc
                .cell(index)
                .await?
                .ok_or(ToolError::IndexOutOfRange {
                    index: args.cell_index,
                    cell_count,
                })?;
            Ok(ToolOutput::Cell(cell_payload(
                record,
                index,
                self.ctx.config.allow_img_output,
            )))
        })
        .await
    }

    pub(crate) async fn read_cells(&self) -> Result<ToolOutput, ToolError> {
        with_connection_retry("read_cells", DEFAULT_MAX_ATTEMPTS, || async {
            let (_, doc) = self.resolve_current().await?;
            let payloads = doc
                .cells()
                .await?
                .into_iter()
                .enumerate()
                .map(|(i, record)| cell_payload(record, i, self.ctx.config.allow_img_output))
                .collect();
            Ok(ToolOutput::Cells(payloads))
        })
        .await
    }

    pub(crate) async fn insert_cell(&self, args: InsertCellArgs) -> Result<ToolOutput, ToolError> {
        let cell_type = CellType::from_str(&args.cell_type)?;
        with_connection_retry("insert_cell", DEFAULT_MAX_ATTEMPTS, || async {
            let (_, doc) = self.resolve_current().await?;
            let actual = check_insert_index(args.cell_index, doc.cell_count().await?)?;

            doc.apply(DocChange::InsertCell {
                index: actual,
                cell_type: cell_type.to_string(),
                source: args.cell_source.clone(),
            })
            .await?;

            let records = doc.cells().await?;
            Ok(ToolOutput::Message(format!(
                "Cell inserted successfully at index {actual} ({cell_type})!\n\nCurrent Surrounding Cells:\n{}",
                surrounding_cells_info(&records, actual)
            )))
        })
        .await
    }

    pub(crate) async fn overwrite_cell_source(
        &self,
        args: OverwriteCellArgs,
    ) -> Result<ToolOutput, ToolError> {
        with_connection_retry("overwrite_cell_source", DEFAULT_MAX_ATTEMPTS, || async {
            let (_, doc) = self.resolve_current().await?;
            let index = check_index(args.cell_index, doc.cell_count().await?)?;

            doc.apply(DocChange::SetSource {
                index,
                source: args.cell_source.clone(),
            })
            .await?;

            Ok(ToolOutput::Message(format!(
                "Cell {index} overwritten successfully - use an execute tool to run it if it is code."
            )))
        })
        .await
    }

    pub(crate) async fn delete_cell(&self, args: CellIndexArgs) -> Result<ToolOutput, ToolError> {
        with_connection_retry("delete_cell", DEFAULT_MAX_ATTEMPTS, || async {
            let (_, doc) = self.resolve_current().await?;
            let index = check_index(args.cell_index, doc.cell_count().await?)?;
            let cell_type = doc
                .cell(index)
                .await?
                .map(|record| record.cell_type)
                .unwrap_or_else(|| "unknown".to_string());

            doc.apply(DocChange::DeleteCell { index }).await?;

            Ok(ToolOutput::Message(format!(
                "Cell {index} ({cell_type}) deleted successfully."
            )))
        })
        .await
    }
}
