//! Execution tools: the three cell strategies plus inline code.
//!
//! Execution is never retried on connection loss; a retry could submit the
//! same code twice. The engine owns timeout, cancellation, interrupt, and the
//! kernel-idle wait.

use std::time::Duration;

use super::{
    ExecuteCellArgs, ExecuteCellStreamingArgs, ExecuteIpythonArgs, InsertExecuteArgs, ToolOutput,
    Toolbox,
};
use crate::backend::traits::DocChange;
use crate::engine::{ExecutionRequest, Strategy};
use crate::error::ToolError;
use crate::outputs::OutputItem;
use crate::registry::Session;
use crate::tools::edit::check_insert_index;

impl Toolbox {
    fn execute_timeout(&self, requested: Option<u64>) -> u64 {
        requested.unwrap_or(self.ctx.config.execute_timeout.as_secs())
    }

    /// The current session's kernel, replaced if it no longer reports alive.
    async fn alive_kernel(
        &self,
        session: &Session,
    ) -> Result<crate::backend::traits::KernelHandle, ToolError> {
        let backend = self.ctx.select_backend();
        self.registry
            .ensure_kernel_alive(&session.name, backend.kernels.as_ref(), || async {
                self.start_kernel(&backend).await
            })
            .await
    }

    async fn run_cell_strategy(
        &self,
        cell_index: i64,
        timeout_seconds: u64,
        strategy: Strategy,
        progress_interval: u64,
    ) -> Result<Vec<OutputItem>, ToolError> {
        let (session, doc) = self.resolve_current().await?;
        let kernel = self.alive_kernel(&session).await?;

        let mut request =
            ExecutionRequest::new(Duration::from_secs(timeout_seconds), strategy);
        request.progress_interval = progress_interval;
        self.engine
            .execute_cell(&doc, cell_index, &kernel, &request)
            .await
    }

    pub(crate) async fn execute_cell_simple_timeout(
        &self,
        args: ExecuteCellArgs,
    ) -> Result<ToolOutput, ToolError> {
        let outputs = self
            .run_cell_strategy(
                args.cell_index,
                self.execute_timeout(args.timeout_seconds),
                Strategy::BoundedWait,
                5,
            )
            .await?;
        Ok(ToolOutput::Outputs(outputs))
    }

    pub(crate) async fn execute_cell_with_progress(
        &self,
        args: ExecuteCellArgs,
    ) -> Result<ToolOutput, ToolError> {
        match self
            .run_cell_strategy(
                args.cell_index,
                self.execute_timeout(args.timeout_seconds),
                Strategy::ForcedSync,
                5,
            )
            .await
        {
            Ok(outputs) => Ok(ToolOutput::Outputs(outputs)),
            // The forced-sync strategy reports timeouts as typed errors; this
            // tool surfaces the partial outputs with a marker instead.
            Err(ToolError::ExecutionTimeout { seconds, partial }) => {
                let mut outputs = partial;
                outputs.push(OutputItem::text(format!(
                    "[TIMEOUT ERROR: Execution exceeded {seconds} seconds]"
                )));
                Ok(ToolOutput::Outputs(outputs))
            }
            Err(other) => Err(other),
        }
    }

    pub(crate) async fn execute_cell_streaming(
        &self,
        args: ExecuteCellStreamingArgs,
    ) -> Result<ToolOutput, ToolError> {
        let outputs = self
            .run_cell_strategy(
                args.cell_index,
                self.execute_timeout(args.timeout_seconds),
                Strategy::ProgressStream,
                args.progress_interval,
            )
            .await?;
        Ok(ToolOutput::Outputs(outputs))
    }

    pub(crate) async fn insert_execute_code_cell(
        &self,
        args: InsertExecuteArgs,
    ) -> Result<ToolOutput, ToolError> {
        let (session, doc) = self.resolve_current().await?;
        let actual = check_insert_index(args.cell_index, doc.cell_count().await?)?;

        doc.apply(DocChange::InsertCell {
            index: actual,
            cell_type: "code".to_string(),
            source: args.cell_source.clone(),
        })
        .await?;

        let kernel = self.alive_kernel(&session).await?;
        let request = ExecutionRequest::new(
            Duration::from_secs(self.execute_timeout(args.timeout_seconds)),
            Strategy::BoundedWait,
        );
        let outputs = self
            .engine
            .execute_cell(&doc, actual as i64, &kernel, &request)
            .await?;
        Ok(ToolOutput::Outputs(outputs))
    }

    pub(crate) async fn execute_ipython(
        &self,
        args: ExecuteIpythonArgs,
    ) -> Result<ToolOutput, ToolError> {
        let session = self.current_session().await?;
        let kernel = self.alive_kernel(&session).await?;
        let outputs = self
            .engine
            .execute_inline(
                &kernel,
                &args.code,
                Duration::from_secs(args.timeout_seconds),
            )
            .await?;
        Ok(ToolOutput::Outputs(outputs))
    }
}
