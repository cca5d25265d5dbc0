//! Workflow execution against the external orchestrator.
//!
//! The executor owns the control-plane half of a run: it validates and
//! interpolates the pattern, resolves the referenced agents, records the
//! execution, and forwards orchestrator progress to streaming clients. The
//! pattern semantics themselves live behind the [`Orchestrator`] trait.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use weft_runtime::{validate_pattern, ExecutionStore};
use weft_types::{
    Agent, AgentDirectory, ExecutionStatus, Orchestrator, ProgressCallback, WeftError,
    WorkflowExecution, WorkflowPattern, WorkflowProgress,
};

/// Buffer of one workflow progress stream.
pub const WORKFLOW_PROGRESS_BUFFER: usize = 32;

/// Bridges patterns to the external orchestrator and records executions.
#[derive(Clone)]
pub struct WorkflowExecutor {
    orchestrator: Arc<dyn Orchestrator>,
    directory: Arc<dyn AgentDirectory>,
    store: Arc<ExecutionStore>,
}

impl WorkflowExecutor {
    /// Create an executor.
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        directory: Arc<dyn AgentDirectory>,
        store: Arc<ExecutionStore>,
    ) -> Self {
        Self { orchestrator, directory, store }
    }

    /// The execution record store.
    pub fn store(&self) -> &Arc<ExecutionStore> {
        &self.store
    }

    /// Run a pattern to completion and return its final record.
    pub async fn execute(
        &self,
        pattern: &WorkflowPattern,
        variables: &HashMap<String, String>,
    ) -> Result<WorkflowExecution, WeftError> {
        let (execution_id, resolved, agents) = self.prepare(pattern, variables).await?;
        match self.orchestrator.run(&execution_id, &resolved, agents, None).await {
            Ok(result) => {
                self.store.finish(&execution_id, ExecutionStatus::Completed, None, Some(result));
                info!(execution = %execution_id, pattern = %pattern.name, "workflow completed");
            }
            Err(err) => {
                self.store.finish(
                    &execution_id,
                    ExecutionStatus::Failed,
                    Some(err.to_string()),
                    None,
                );
                warn!(execution = %execution_id, error = %err, "workflow failed");
            }
        }
        self.store
            .get(&execution_id)
            .ok_or_else(|| WeftError::Internal(format!("execution {execution_id} vanished")))
    }

    /// Run a pattern while streaming progress records. The first record is a
    /// 0% start marker, followed by a 10% "loading agents" stage,
    /// orchestrator-emitted events (partial results included), and a final
    /// 100% record.
    pub async fn execute_streaming(
        &self,
        pattern: &WorkflowPattern,
        variables: &HashMap<String, String>,
    ) -> Result<(String, mpsc::Receiver<WorkflowProgress>), WeftError> {
        validate_pattern(pattern)?;
        let execution_id = Uuid::new_v4().to_string();
        self.store.begin(&execution_id, &pattern.name);

        let (tx, rx) = mpsc::channel(WORKFLOW_PROGRESS_BUFFER);
        let _ = tx
            .send(WorkflowProgress {
                execution_id: execution_id.clone(),
                stage: "starting".into(),
                percent: 0,
                partial_result: None,
            })
            .await;

        let executor = self.clone();
        let pattern = pattern.clone();
        let variables = variables.clone();
        let task_execution_id = execution_id.clone();
        tokio::spawn(async move {
            let _ = tx
                .send(WorkflowProgress {
                    execution_id: task_execution_id.clone(),
                    stage: "loading agents".into(),
                    percent: 10,
                    partial_result: None,
                })
                .await;
            let resolved = pattern.interpolate(&variables);
            let agents = match executor.load_agents(&resolved).await {
                Ok(agents) => agents,
                Err(err) => {
                    executor.store.finish(
                        &task_execution_id,
                        ExecutionStatus::Failed,
                        Some(err.to_string()),
                        None,
                    );
                    let _ = tx
                        .send(WorkflowProgress {
                            execution_id: task_execution_id.clone(),
                            stage: format!("failed: {err}"),
                            percent: 100,
                            partial_result: None,
                        })
                        .await;
                    return;
                }
            };

            // Orchestrator events are forwarded without blocking the run.
            let progress_tx = tx.clone();
            let callback: ProgressCallback = Arc::new(move |progress: WorkflowProgress| {
                let _ = progress_tx.try_send(progress);
            });

            let run = executor
                .orchestrator
                .run(&task_execution_id, &resolved, agents, Some(callback))
                .await;
            let final_record = match run {
                Ok(result) => {
                    executor.store.finish(
                        &task_execution_id,
                        ExecutionStatus::Completed,
                        None,
                        Some(result.clone()),
                    );
                    WorkflowProgress {
                        execution_id: task_execution_id.clone(),
                        stage: "completed".into(),
                        percent: 100,
                        partial_result: Some(result),
                    }
                }
                Err(err) => {
                    executor.store.finish(
                        &task_execution_id,
                        ExecutionStatus::Failed,
                        Some(err.to_string()),
                        None,
                    );
                    WorkflowProgress {
                        execution_id: task_execution_id.clone(),
                        stage: format!("failed: {err}"),
                        percent: 100,
                        partial_result: None,
                    }
                }
            };
            let _ = tx.send(final_record).await;
        });

        Ok((execution_id, rx))
    }

    async fn prepare(
        &self,
        pattern: &WorkflowPattern,
        variables: &HashMap<String, String>,
    ) -> Result<(String, WorkflowPattern, HashMap<String, Arc<dyn Agent>>), WeftError> {
        validate_pattern(pattern)?;
        let execution_id = Uuid::new_v4().to_string();
        self.store.begin(&execution_id, &pattern.name);

        let resolved = pattern.interpolate(variables);
        match self.load_agents(&resolved).await {
            Ok(agents) => Ok((execution_id, resolved, agents)),
            Err(err) => {
                self.store.finish(
                    &execution_id,
                    ExecutionStatus::Failed,
                    Some(err.to_string()),
                    None,
                );
                Err(err)
            }
        }
    }

    async fn load_agents(
        &self,
        pattern: &WorkflowPattern,
    ) -> Result<HashMap<String, Arc<dyn Agent>>, WeftError> {
        let mut agents = HashMap::new();
        for agent_id in pattern.agent_ids() {
            let agent = self
                .directory
                .lookup(&agent_id)
                .await
                .ok_or_else(|| WeftError::NotFound(format!("agent {agent_id:?}")))?;
            agents.insert(agent_id, agent);
        }
        Ok(agents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockAgentBuilder, MockDirectory};
    use async_trait::async_trait;
    use weft_types::PatternStep;

    struct EchoOrchestrator {
        fail: bool,
    }

    #[async_trait]
    impl Orchestrator for EchoOrchestrator {
        async fn run(
            &self,
            execution_id: &str,
            pattern: &WorkflowPattern,
            agents: HashMap<String, Arc<dyn Agent>>,
            progress: Option<ProgressCallback>,
        ) -> anyhow::Result<serde_json::Value> {
            if self.fail {
                anyhow::bail!("orchestrator exploded");
            }
            if let Some(progress) = progress {
                progress(WorkflowProgress {
                    execution_id: execution_id.to_string(),
                    stage: "halfway".into(),
                    percent: 50,
                    partial_result: Some(serde_json::json!({"step": 1})),
                });
            }
            Ok(serde_json::json!({
                "pattern": pattern.name,
                "agents": agents.len(),
                "first_prompt": pattern.steps[0].prompt,
            }))
        }
    }

    fn pattern() -> WorkflowPattern {
        WorkflowPattern {
            name: "report".into(),
            description: None,
            steps: vec![PatternStep {
                id: "gather".into(),
                agent: "researcher".into(),
                prompt: "research {{topic}}".into(),
                depends_on: vec![],
            }],
        }
    }

    fn executor(fail: bool) -> Arc<WorkflowExecutor> {
        let directory = Arc::new(MockDirectory::new());
        directory.add(MockAgentBuilder::new("researcher").build());
        Arc::new(WorkflowExecutor::new(
            Arc::new(EchoOrchestrator { fail }),
            directory,
            Arc::new(ExecutionStore::default()),
        ))
    }

    #[tokio::test]
    async fn test_execute_interpolates_and_completes() {
        let executor = executor(false);
        let variables = HashMap::from([("topic".to_string(), "weather".to_string())]);

        let record = executor.execute(&pattern(), &variables).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.result.as_ref().unwrap()["first_prompt"], "research weather");
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_execute_marks_failure() {
        let executor = executor(true);
        let record = executor.execute(&pattern(), &HashMap::new()).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.error.as_ref().unwrap().contains("orchestrator exploded"));
    }

    #[tokio::test]
    async fn test_unknown_agent_fails_before_run() {
        let executor = Arc::new(WorkflowExecutor::new(
            Arc::new(EchoOrchestrator { fail: false }),
            Arc::new(MockDirectory::new()),
            Arc::new(ExecutionStore::default()),
        ));
        let err = executor.execute(&pattern(), &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, WeftError::NotFound(_)));
        // The record exists and is marked failed.
        let records = executor.store().list();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_streaming_emits_stage_sequence() {
        let executor = executor(false);
        let (execution_id, mut rx) =
            executor.execute_streaming(&pattern(), &HashMap::new()).await.unwrap();

        let mut stages = Vec::new();
        while let Some(progress) = rx.recv().await {
            assert_eq!(progress.execution_id, execution_id);
            stages.push((progress.stage.clone(), progress.percent));
        }
        assert_eq!(stages[0], ("starting".to_string(), 0));
        assert_eq!(stages[1], ("loading agents".to_string(), 10));
        assert!(stages.iter().any(|(stage, percent)| stage == "halfway" && *percent == 50));
        assert_eq!(stages.last().unwrap(), &("completed".to_string(), 100));

        assert_eq!(executor.store().get(&execution_id).unwrap().status, ExecutionStatus::Completed);
    }
}
