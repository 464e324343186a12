//! Client API for managing workflow instances
//!
//! `WorkflowClient` is the entry point an outer layer (HTTP handlers, CLIs)
//! uses to create, signal, inspect and cancel instances. Task execution
//! itself happens in the [`WorkerPool`](crate::worker::WorkerPool).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::engine::{ExecutorError, WorkflowExecutor};
use crate::persistence::{WorkflowInfo, WorkflowStatus};
use crate::workflow::{HistoryEvent, Workflow, WorkflowError};

/// Externally visible state of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub status: WorkflowStatus,
    pub result: Option<Value>,
    pub last_error: Option<WorkflowError>,
}

impl From<WorkflowInfo> for InstanceStatus {
    fn from(info: WorkflowInfo) -> Self {
        Self {
            status: info.status,
            result: info.result,
            last_error: info.error,
        }
    }
}

#[derive(Clone)]
pub struct WorkflowClient {
    executor: Arc<WorkflowExecutor>,
}

impl WorkflowClient {
    pub fn new(executor: Arc<WorkflowExecutor>) -> Self {
        Self { executor }
    }

    /// Create an instance of a registered workflow type
    ///
    /// Fails with `DefinitionNotFound` when `workflow_type` is unknown.
    #[instrument(skip(self, input))]
    pub async fn create_instance(
        &self,
        workflow_type: &str,
        input: Value,
    ) -> Result<Uuid, ExecutorError> {
        let workflow_id = self.executor.start_workflow(workflow_type, input).await?;
        info!(%workflow_id, %workflow_type, "instance created");
        Ok(workflow_id)
    }

    /// Typed variant of [`create_instance`](Self::create_instance)
    pub async fn create<W: Workflow>(&self, input: W::Input) -> Result<Uuid, ExecutorError> {
        self.executor.start::<W>(input).await
    }

    /// Deliver a signal and advance the instance
    ///
    /// The signal is buffered when the instance is not waiting on `name`
    /// yet. A failed inline resume is left to the queued resume task.
    #[instrument(skip(self, payload))]
    pub async fn signal_instance(
        &self,
        workflow_id: Uuid,
        name: &str,
        payload: Value,
    ) -> Result<(), ExecutorError> {
        self.executor.signal(workflow_id, name, payload).await?;

        if let Err(e) = self.executor.resume(workflow_id).await {
            warn!(%workflow_id, error = %e, "inline resume after signal failed");
        }
        Ok(())
    }

    pub async fn get_instance_status(
        &self,
        workflow_id: Uuid,
    ) -> Result<InstanceStatus, ExecutorError> {
        let info = self.executor.store().get_workflow_info(workflow_id).await?;
        Ok(info.into())
    }

    /// Cancel a running instance
    #[instrument(skip(self))]
    pub async fn cancel_instance(&self, workflow_id: Uuid, reason: &str) -> Result<(), ExecutorError> {
        self.executor.cancel(workflow_id, reason).await
    }

    pub async fn get_history(&self, workflow_id: Uuid) -> Result<Vec<HistoryEvent>, ExecutorError> {
        self.executor.history(workflow_id).await
    }

    /// List instances, optionally filtered by status
    pub async fn list_instances(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowInfo>, ExecutorError> {
        Ok(self.executor.store().list_workflows(status).await?)
    }

    pub fn executor(&self) -> &Arc<WorkflowExecutor> {
        &self.executor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::WorkflowRegistry;
    use crate::persistence::{InMemoryWorkflowEventStore, CANCELED_ERROR_CODE};
    use crate::workflow::{WorkflowContext, WorkflowEvent, WorkflowResult};
    use serde_json::json;

    /// Echoes the payload of the first "go" signal
    struct EchoWorkflow;

    impl Workflow for EchoWorkflow {
        const TYPE: &'static str = "echo";
        type Input = ();
        type Output = Value;

        fn run(&self, ctx: &mut WorkflowContext, _input: ()) -> WorkflowResult<Value> {
            let signal = ctx.receive("go")?;
            Ok(signal.payload)
        }
    }

    fn client() -> WorkflowClient {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let mut registry = WorkflowRegistry::new();
        registry.register(EchoWorkflow);
        WorkflowClient::new(Arc::new(WorkflowExecutor::new(store, registry)))
    }

    #[tokio::test]
    async fn test_create_and_signal_instance() {
        let client = client();

        let id = client.create_instance("echo", json!(null)).await.unwrap();
        let status = client.get_instance_status(id).await.unwrap();
        assert_eq!(status.status, WorkflowStatus::Running);
        assert!(status.result.is_none());

        client
            .signal_instance(id, "go", json!({"n": 1}))
            .await
            .unwrap();

        let status = client.get_instance_status(id).await.unwrap();
        assert_eq!(status.status, WorkflowStatus::Completed);
        assert_eq!(status.result, Some(json!({"n": 1})));
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_create_unknown_definition() {
        let client = client();

        let result = client.create_instance("nope", json!({})).await;

        assert!(matches!(result, Err(ExecutorError::DefinitionNotFound(_))));
        assert!(client.list_instances(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_signal_unknown_instance() {
        let client = client();

        let result = client.signal_instance(Uuid::now_v7(), "go", json!(1)).await;

        assert!(matches!(result, Err(ExecutorError::WorkflowNotFound(_))));
    }

    #[tokio::test]
    async fn test_signal_completed_instance() {
        let client = client();
        let id = client.create::<EchoWorkflow>(()).await.unwrap();
        client.signal_instance(id, "go", json!(1)).await.unwrap();

        let result = client.signal_instance(id, "go", json!(2)).await;

        assert!(matches!(result, Err(ExecutorError::WorkflowCompleted(w)) if w == id));
    }

    #[tokio::test]
    async fn test_cancel_instance() {
        let client = client();
        let id = client.create::<EchoWorkflow>(()).await.unwrap();

        client.cancel_instance(id, "user request").await.unwrap();

        let status = client.get_instance_status(id).await.unwrap();
        assert_eq!(status.status, WorkflowStatus::Canceled);
        let error = status.last_error.unwrap();
        assert_eq!(error.message, "user request");
        assert_eq!(error.code.as_deref(), Some(CANCELED_ERROR_CODE));

        let history = client.get_history(id).await.unwrap();
        assert!(matches!(
            history.last().map(|e| &e.event),
            Some(WorkflowEvent::WorkflowCanceled { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_instances_by_status() {
        let client = client();
        let done = client.create::<EchoWorkflow>(()).await.unwrap();
        let waiting = client.create::<EchoWorkflow>(()).await.unwrap();
        client.signal_instance(done, "go", json!(true)).await.unwrap();

        let running = client
            .list_instances(Some(WorkflowStatus::Running))
            .await
            .unwrap();
        let completed = client
            .list_instances(Some(WorkflowStatus::Completed))
            .await
            .unwrap();

        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, waiting);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, done);
        assert_eq!(client.list_instances(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_history_of_unknown_instance() {
        let client = client();

        let result = client.get_history(Uuid::now_v7()).await;

        assert!(matches!(result, Err(ExecutorError::WorkflowNotFound(_))));
    }
}
