//! Workflow execution and scheduling surface.

use std::collections::HashMap;

use tokio::sync::mpsc;

use weft_types::{
    ScheduleRun, WeftError, WorkflowExecution, WorkflowPattern, WorkflowProgress, WorkflowSchedule,
};

use crate::WeftServer;

impl WeftServer {
    /// `ExecuteWorkflow`: run a pattern to completion.
    pub async fn execute_workflow(
        &self,
        pattern: &WorkflowPattern,
        variables: &HashMap<String, String>,
    ) -> Result<WorkflowExecution, WeftError> {
        self.executor()?.execute(pattern, variables).await
    }

    /// `StreamWorkflow`: run a pattern while streaming progress records.
    pub async fn stream_workflow(
        &self,
        pattern: &WorkflowPattern,
        variables: &HashMap<String, String>,
    ) -> Result<(String, mpsc::Receiver<WorkflowProgress>), WeftError> {
        self.executor()?.execute_streaming(pattern, variables).await
    }

    /// Look up one execution record.
    pub fn get_execution(&self, execution_id: &str) -> Result<WorkflowExecution, WeftError> {
        self.executions
            .get(execution_id)
            .ok_or_else(|| WeftError::NotFound(format!("execution {execution_id:?}")))
    }

    /// All retained execution records.
    pub fn list_executions(&self) -> Vec<WorkflowExecution> {
        self.executions.list()
    }

    /// `ScheduleWorkflow`.
    pub async fn schedule_workflow(
        &self,
        workflow_name: &str,
        cron_expr: &str,
        variables: HashMap<String, String>,
    ) -> Result<WorkflowSchedule, WeftError> {
        self.scheduler()?.schedule(workflow_name, cron_expr, variables).await
    }

    /// `UpdateScheduledWorkflow`.
    pub async fn update_scheduled_workflow(
        &self,
        schedule_id: &str,
        cron_expr: Option<&str>,
        variables: Option<HashMap<String, String>>,
    ) -> Result<WorkflowSchedule, WeftError> {
        self.scheduler()?.update(schedule_id, cron_expr, variables).await
    }

    /// `GetScheduledWorkflow`.
    pub async fn get_scheduled_workflow(
        &self,
        schedule_id: &str,
    ) -> Result<WorkflowSchedule, WeftError> {
        self.scheduler()?.get(schedule_id).await
    }

    /// `ListScheduledWorkflows`.
    pub async fn list_scheduled_workflows(&self) -> Result<Vec<WorkflowSchedule>, WeftError> {
        self.scheduler()?.list().await
    }

    /// `DeleteScheduledWorkflow`.
    pub async fn delete_scheduled_workflow(&self, schedule_id: &str) -> Result<(), WeftError> {
        self.scheduler()?.delete(schedule_id).await
    }

    /// `TriggerScheduledWorkflow`: immediate run outside the cron cadence.
    pub async fn trigger_scheduled_workflow(
        &self,
        schedule_id: &str,
    ) -> Result<WorkflowExecution, WeftError> {
        self.scheduler()?.trigger(schedule_id).await
    }

    /// `PauseSchedule`.
    pub async fn pause_schedule(&self, schedule_id: &str) -> Result<(), WeftError> {
        self.scheduler()?.pause(schedule_id).await
    }

    /// `ResumeSchedule`.
    pub async fn resume_schedule(&self, schedule_id: &str) -> Result<(), WeftError> {
        self.scheduler()?.resume(schedule_id).await
    }

    /// `GetScheduleHistory`.
    pub async fn get_schedule_history(
        &self,
        schedule_id: &str,
    ) -> Result<Vec<ScheduleRun>, WeftError> {
        self.scheduler()?.history(schedule_id).await
    }
}
