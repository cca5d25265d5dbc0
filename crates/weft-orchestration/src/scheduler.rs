//! Scheduler facade over the external cron engine.
//!
//! The facade owns RPC semantics: expression validation, id shape,
//! YAML-sourced immutability. Tick generation and schedule persistence stay
//! behind the [`CronEngine`] trait.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use weft_types::{
    CronEngine, PatternLibrary, ScheduleRun, WeftError, WorkflowExecution, WorkflowSchedule,
};

use crate::WorkflowExecutor;

/// Facade bridging cron-driven triggers to the workflow executor.
pub struct SchedulerFacade {
    engine: Arc<dyn CronEngine>,
    patterns: Arc<dyn PatternLibrary>,
    executor: Arc<WorkflowExecutor>,
}

impl SchedulerFacade {
    /// Create a facade.
    pub fn new(
        engine: Arc<dyn CronEngine>,
        patterns: Arc<dyn PatternLibrary>,
        executor: Arc<WorkflowExecutor>,
    ) -> Self {
        Self { engine, patterns, executor }
    }

    /// Create a schedule. The id takes the shape
    /// `rpc-<workflow-name>-<unix-seconds>-<nanos>`.
    pub async fn schedule(
        &self,
        workflow_name: &str,
        cron_expr: &str,
        variables: HashMap<String, String>,
    ) -> Result<WorkflowSchedule, WeftError> {
        if workflow_name.is_empty() {
            return Err(WeftError::InvalidArgument("workflow name must not be empty".into()));
        }
        if self.patterns.get(workflow_name).is_none() {
            return Err(WeftError::NotFound(format!("workflow pattern {workflow_name:?}")));
        }
        validate_cron(cron_expr)?;

        let now = Utc::now();
        let schedule = WorkflowSchedule {
            id: format!("rpc-{workflow_name}-{}-{}", now.timestamp(), now.timestamp_subsec_nanos()),
            workflow_name: workflow_name.to_string(),
            cron_expr: cron_expr.to_string(),
            variables,
            yaml_path: String::new(),
            paused: false,
            created_at: now,
        };
        self.engine
            .upsert(schedule.clone())
            .await
            .map_err(|err| WeftError::Internal(err.to_string()))?;
        info!(schedule = %schedule.id, workflow = %workflow_name, "schedule created");
        Ok(schedule)
    }

    /// Update a schedule's expression and/or variables. YAML-sourced
    /// schedules are immutable via RPC.
    pub async fn update(
        &self,
        schedule_id: &str,
        cron_expr: Option<&str>,
        variables: Option<HashMap<String, String>>,
    ) -> Result<WorkflowSchedule, WeftError> {
        let mut schedule = self.load(schedule_id).await?;
        if schedule.is_yaml_sourced() {
            return Err(WeftError::FailedPrecondition(format!(
                "schedule {schedule_id} is YAML-sourced ({}) and cannot be updated via RPC",
                schedule.yaml_path
            )));
        }
        if let Some(expr) = cron_expr {
            validate_cron(expr)?;
            schedule.cron_expr = expr.to_string();
        }
        if let Some(vars) = variables {
            schedule.variables = vars;
        }
        self.engine
            .upsert(schedule.clone())
            .await
            .map_err(|err| WeftError::Internal(err.to_string()))?;
        Ok(schedule)
    }

    /// Load one schedule.
    pub async fn get(&self, schedule_id: &str) -> Result<WorkflowSchedule, WeftError> {
        self.load(schedule_id).await
    }

    /// All schedules.
    pub async fn list(&self) -> Result<Vec<WorkflowSchedule>, WeftError> {
        self.engine.list().await.map_err(|err| WeftError::Internal(err.to_string()))
    }

    /// Delete a schedule. YAML-sourced schedules are immutable via RPC.
    pub async fn delete(&self, schedule_id: &str) -> Result<(), WeftError> {
        let schedule = self.load(schedule_id).await?;
        if schedule.is_yaml_sourced() {
            return Err(WeftError::FailedPrecondition(format!(
                "schedule {schedule_id} is YAML-sourced ({}) and cannot be deleted via RPC",
                schedule.yaml_path
            )));
        }
        self.engine.remove(schedule_id).await.map_err(|err| WeftError::Internal(err.to_string()))
    }

    /// Run a schedule's workflow immediately, outside its cron cadence.
    pub async fn trigger(&self, schedule_id: &str) -> Result<WorkflowExecution, WeftError> {
        let schedule = self.load(schedule_id).await?;
        let pattern = self.patterns.get(&schedule.workflow_name).ok_or_else(|| {
            WeftError::NotFound(format!("workflow pattern {:?}", schedule.workflow_name))
        })?;
        self.executor.execute(&pattern, &schedule.variables).await
    }

    /// Pause a schedule.
    pub async fn pause(&self, schedule_id: &str) -> Result<(), WeftError> {
        self.load(schedule_id).await?;
        self.engine
            .set_paused(schedule_id, true)
            .await
            .map_err(|err| WeftError::Internal(err.to_string()))
    }

    /// Resume a paused schedule.
    pub async fn resume(&self, schedule_id: &str) -> Result<(), WeftError> {
        self.load(schedule_id).await?;
        self.engine
            .set_paused(schedule_id, false)
            .await
            .map_err(|err| WeftError::Internal(err.to_string()))
    }

    /// Run history of a schedule, most recent first.
    pub async fn history(&self, schedule_id: &str) -> Result<Vec<ScheduleRun>, WeftError> {
        self.load(schedule_id).await?;
        self.engine.history(schedule_id).await.map_err(|err| WeftError::Internal(err.to_string()))
    }

    async fn load(&self, schedule_id: &str) -> Result<WorkflowSchedule, WeftError> {
        if schedule_id.is_empty() {
            return Err(WeftError::InvalidArgument("schedule id must not be empty".into()));
        }
        self.engine
            .get(schedule_id)
            .await
            .map_err(|err| WeftError::Internal(err.to_string()))?
            .ok_or_else(|| WeftError::NotFound(format!("schedule {schedule_id:?}")))
    }
}

fn validate_cron(expr: &str) -> Result<(), WeftError> {
    cron::Schedule::from_str(expr)
        .map(|_| ())
        .map_err(|err| WeftError::InvalidArgument(format!("invalid cron expression {expr:?}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockAgentBuilder, MockDirectory};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use weft_runtime::{ExecutionStore, MemoryPatternLibrary};
    use weft_types::{
        Agent, ExecutionStatus, Orchestrator, PatternStep, ProgressCallback, WorkflowPattern,
    };

    #[derive(Default)]
    struct MemoryCronEngine {
        schedules: Mutex<HashMap<String, WorkflowSchedule>>,
        runs: Mutex<Vec<ScheduleRun>>,
    }

    #[async_trait]
    impl CronEngine for MemoryCronEngine {
        async fn upsert(&self, schedule: WorkflowSchedule) -> Result<()> {
            self.schedules.lock().unwrap().insert(schedule.id.clone(), schedule);
            Ok(())
        }
        async fn get(&self, id: &str) -> Result<Option<WorkflowSchedule>> {
            Ok(self.schedules.lock().unwrap().get(id).cloned())
        }
        async fn list(&self) -> Result<Vec<WorkflowSchedule>> {
            Ok(self.schedules.lock().unwrap().values().cloned().collect())
        }
        async fn remove(&self, id: &str) -> Result<()> {
            self.schedules.lock().unwrap().remove(id);
            Ok(())
        }
        async fn set_paused(&self, id: &str, paused: bool) -> Result<()> {
            if let Some(schedule) = self.schedules.lock().unwrap().get_mut(id) {
                schedule.paused = paused;
            }
            Ok(())
        }
        async fn history(&self, id: &str) -> Result<Vec<ScheduleRun>> {
            Ok(self
                .runs
                .lock()
                .unwrap()
                .iter()
                .filter(|run| run.schedule_id == id)
                .cloned()
                .collect())
        }
    }

    struct NoopOrchestrator;

    #[async_trait]
    impl Orchestrator for NoopOrchestrator {
        async fn run(
            &self,
            _execution_id: &str,
            _pattern: &WorkflowPattern,
            _agents: HashMap<String, Arc<dyn Agent>>,
            _progress: Option<ProgressCallback>,
        ) -> Result<serde_json::Value> {
            Ok(serde_json::json!({"done": true}))
        }
    }

    fn facade() -> (SchedulerFacade, Arc<MemoryCronEngine>) {
        let engine = Arc::new(MemoryCronEngine::default());
        let patterns = Arc::new(MemoryPatternLibrary::new());
        patterns.put(WorkflowPattern {
            name: "report".into(),
            description: None,
            steps: vec![PatternStep {
                id: "s".into(),
                agent: "researcher".into(),
                prompt: "go".into(),
                depends_on: vec![],
            }],
        });
        let directory = Arc::new(MockDirectory::new());
        directory.add(MockAgentBuilder::new("researcher").build());
        let executor = Arc::new(WorkflowExecutor::new(
            Arc::new(NoopOrchestrator),
            directory,
            Arc::new(ExecutionStore::default()),
        ));
        (SchedulerFacade::new(engine.clone(), patterns, executor), engine)
    }

    #[tokio::test]
    async fn test_schedule_id_shape_and_validation() {
        let (facade, _) = facade();
        let schedule =
            facade.schedule("report", "0 0 * * * *", HashMap::new()).await.unwrap();
        assert!(schedule.id.starts_with("rpc-report-"));
        assert_eq!(schedule.id.split('-').count(), 4);
        assert!(!schedule.is_yaml_sourced());

        assert!(matches!(
            facade.schedule("report", "not a cron", HashMap::new()).await,
            Err(WeftError::InvalidArgument(_))
        ));
        assert!(matches!(
            facade.schedule("ghost", "0 0 * * * *", HashMap::new()).await,
            Err(WeftError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_yaml_sourced_schedules_are_immutable() {
        let (facade, engine) = facade();
        engine
            .upsert(WorkflowSchedule {
                id: "yaml-1".into(),
                workflow_name: "report".into(),
                cron_expr: "0 0 * * * *".into(),
                variables: HashMap::new(),
                yaml_path: "schedules/report.yaml".into(),
                paused: false,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(matches!(
            facade.update("yaml-1", Some("0 30 * * * *"), None).await,
            Err(WeftError::FailedPrecondition(_))
        ));
        assert!(matches!(
            facade.delete("yaml-1").await,
            Err(WeftError::FailedPrecondition(_))
        ));
        // Unchanged after the rejected mutations.
        let schedule = facade.get("yaml-1").await.unwrap();
        assert_eq!(schedule.cron_expr, "0 0 * * * *");
    }

    #[tokio::test]
    async fn test_update_pause_resume_delete() {
        let (facade, _) = facade();
        let schedule = facade.schedule("report", "0 0 * * * *", HashMap::new()).await.unwrap();

        let updated = facade.update(&schedule.id, Some("0 30 * * * *"), None).await.unwrap();
        assert_eq!(updated.cron_expr, "0 30 * * * *");

        facade.pause(&schedule.id).await.unwrap();
        assert!(facade.get(&schedule.id).await.unwrap().paused);
        facade.resume(&schedule.id).await.unwrap();
        assert!(!facade.get(&schedule.id).await.unwrap().paused);

        facade.delete(&schedule.id).await.unwrap();
        assert!(matches!(facade.get(&schedule.id).await, Err(WeftError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_trigger_runs_workflow() {
        let (facade, _) = facade();
        let schedule = facade.schedule("report", "0 0 * * * *", HashMap::new()).await.unwrap();
        let record = facade.trigger(&schedule.id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.pattern_name, "report");
    }
}
