use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{RunnableError, WorkflowEngine, WorkflowExecutionRunnable};
use crate::backends::MasterBackend;
use crate::dispatch::{ExecuteDispatcher, ExecutionContext};
use crate::events::{StateEvent, StateEventType, TaskStateEvent};
use crate::messages::proto::{MessageKind, TaskDispatchRequest, TaskKillRequest, TaskKillResponse};
use crate::models::{
    StopPath, TaskExecutionStatus, TaskInstance, WorkflowDag, WorkflowExecutionStatus,
    WorkflowInstance,
};
use crate::rpc::RpcClient;

/// Collaborators shared by every runnable on this master.
#[derive(Clone)]
pub struct RunnableContext {
    pub backend: Arc<dyn MasterBackend>,
    pub dispatcher: Arc<ExecuteDispatcher>,
    pub rpc_client: Arc<RpcClient>,
    pub engine: WorkflowEngine,
    /// Address workers report state changes to.
    pub master_address: String,
    /// Delay before re-trying tasks that could not be dispatched.
    pub dispatch_retry_interval: Duration,
    pub kill_timeout: Duration,
    /// Cancelled when the master shuts down; stops every driver and pending
    /// wake-up.
    pub shutdown: CancellationToken,
}

struct ExecutionState {
    instance: WorkflowInstance,
    dag: WorkflowDag,
    /// Keyed by task code.
    tasks: HashMap<i64, TaskInstance>,
    /// Task instance id to task code.
    task_codes: HashMap<i64, i64>,
    processed_keys: HashSet<String>,
    wake_scheduled: bool,
}

struct Shared {
    id: i64,
    state: Mutex<ExecutionState>,
    status: watch::Sender<WorkflowExecutionStatus>,
    mailbox: mpsc::UnboundedSender<StateEvent>,
    finished: CancellationToken,
    context: RunnableContext,
}

/// Drives one workflow instance: dispatches ready tasks, reacts to task state
/// changes in arrival order, and carries pause and stop requests through to
/// the workers.
pub struct WorkflowExecuteRunnable {
    shared: Arc<Shared>,
    mailbox_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<StateEvent>>>,
}

impl WorkflowExecuteRunnable {
    /// `tasks` are previously persisted task instances, e.g. when recovering;
    /// rows for codes missing from `dag` are ignored.
    pub fn new(
        instance: WorkflowInstance,
        dag: WorkflowDag,
        tasks: Vec<TaskInstance>,
        context: RunnableContext,
    ) -> Self {
        let id = instance.id;
        let mut by_code = HashMap::with_capacity(tasks.len());
        let mut task_codes = HashMap::with_capacity(tasks.len());
        for task in tasks {
            if dag.node(task.task_code).is_none() {
                continue;
            }
            task_codes.insert(task.id, task.task_code);
            by_code.insert(task.task_code, task);
        }
        let (status, _) = watch::channel(instance.status);
        let (mailbox, mailbox_rx) = mpsc::unbounded_channel();
        let finished = context.shutdown.child_token();
        let state = ExecutionState {
            instance,
            dag,
            tasks: by_code,
            task_codes,
            processed_keys: HashSet::new(),
            wake_scheduled: false,
        };
        Self {
            shared: Arc::new(Shared {
                id,
                state: Mutex::new(state),
                status,
                mailbox,
                finished,
                context,
            }),
            mailbox_rx: std::sync::Mutex::new(Some(mailbox_rx)),
        }
    }

    pub fn subscribe_status(&self) -> watch::Receiver<WorkflowExecutionStatus> {
        self.shared.status.subscribe()
    }

    pub async fn instance(&self) -> WorkflowInstance {
        self.shared.state.lock().await.instance.clone()
    }

    pub async fn task_instances(&self) -> Vec<TaskInstance> {
        let state = self.shared.state.lock().await;
        let mut tasks: Vec<TaskInstance> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|task| task.id);
        tasks
    }

    fn spawn_driver(&self) {
        let Some(mailbox) = self.mailbox_rx.lock().expect("mailbox poisoned").take() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { shared.drive(mailbox).await });
    }
}

#[async_trait]
impl WorkflowExecutionRunnable for WorkflowExecuteRunnable {
    fn workflow_instance_id(&self) -> i64 {
        self.shared.id
    }

    fn status(&self) -> WorkflowExecutionStatus {
        *self.shared.status.borrow()
    }

    async fn start(&self) -> Result<(), RunnableError> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        let status = state.instance.status;
        if !matches!(
            status,
            WorkflowExecutionStatus::Submitted
                | WorkflowExecutionStatus::WaitToRun
                | WorkflowExecutionStatus::SerialWait
        ) {
            return Err(RunnableError::IllegalState {
                id: shared.id,
                operation: "start",
                status,
            });
        }
        shared
            .transition(&mut state, WorkflowExecutionStatus::Running)
            .await?;
        self.spawn_driver();
        if let Err(err) = shared.advance(&mut state).await {
            error!(workflow_instance_id = shared.id, ?err, "failed to advance after start");
            shared.schedule_wake_up(&mut state);
        }
        Ok(())
    }

    async fn pause(&self) -> Result<(), RunnableError> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        let status = state.instance.status;
        if status != WorkflowExecutionStatus::Running {
            return Err(RunnableError::IllegalState {
                id: shared.id,
                operation: "pause",
                status,
            });
        }
        shared
            .transition(&mut state, WorkflowExecutionStatus::ReadyPause)
            .await?;
        shared.settle(&mut state).await
    }

    async fn resume(&self) -> Result<(), RunnableError> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        let status = state.instance.status;
        if !matches!(
            status,
            WorkflowExecutionStatus::Paused | WorkflowExecutionStatus::ReadyPause
        ) {
            return Err(RunnableError::IllegalState {
                id: shared.id,
                operation: "resume",
                status,
            });
        }
        shared
            .transition(&mut state, WorkflowExecutionStatus::Running)
            .await?;
        if let Err(err) = shared.advance(&mut state).await {
            error!(workflow_instance_id = shared.id, ?err, "failed to advance after resume");
            shared.schedule_wake_up(&mut state);
        }
        Ok(())
    }

    async fn kill(&self) -> Result<(), RunnableError> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        let status = state.instance.status;
        match status.stop_path() {
            None => Err(RunnableError::IllegalState {
                id: shared.id,
                operation: "stop",
                status,
            }),
            Some(StopPath::DirectDb) => {
                shared
                    .transition(&mut state, WorkflowExecutionStatus::Stopped)
                    .await
            }
            Some(StopPath::Live) => {
                if status != WorkflowExecutionStatus::ReadyStop {
                    shared
                        .transition(&mut state, WorkflowExecutionStatus::ReadyStop)
                        .await?;
                }
                shared.kill_active_tasks(&mut state).await;
                shared.settle(&mut state).await
            }
        }
    }

    fn submit_event(&self, event: StateEvent) -> Result<(), RunnableError> {
        self.shared
            .mailbox
            .send(event)
            .map_err(|_| RunnableError::MailboxClosed(self.shared.id))
    }
}

impl Shared {
    async fn drive(self: Arc<Self>, mut mailbox: mpsc::UnboundedReceiver<StateEvent>) {
        loop {
            tokio::select! {
                biased;
                _ = self.finished.cancelled() => break,
                next = mailbox.recv() => {
                    let Some(event) = next else { break };
                    let mut state = self.state.lock().await;
                    if let Err(err) = self.handle_event(&mut state, event).await {
                        metrics::counter!("flowmaster_events_failed_total").increment(1);
                        error!(workflow_instance_id = self.id, ?err, "failed to handle state event");
                    }
                }
            }
        }
        debug!(workflow_instance_id = self.id, "runnable driver stopped");
    }

    /// Persist `status` first; the in-memory instance only changes once the
    /// store accepted the update.
    async fn transition(
        &self,
        state: &mut ExecutionState,
        status: WorkflowExecutionStatus,
    ) -> Result<(), RunnableError> {
        let mut next = state.instance.clone();
        next.status = status;
        if status.is_terminal() {
            next.end_time = Some(Utc::now());
        }
        if !self.context.backend.update_workflow_instance(&next).await? {
            return Err(RunnableError::PersistFailed {
                entity: "workflow instance",
                id: self.id,
                status: status.to_string(),
            });
        }
        let previous = state.instance.status;
        state.instance = next;
        self.status.send_replace(status);
        info!(
            workflow_instance_id = self.id,
            from = %previous,
            to = %status,
            "workflow status changed"
        );
        if status.is_terminal() {
            self.finished.cancel();
            self.context.engine.finalize_workflow(self.id);
        }
        Ok(())
    }

    async fn save_task(
        &self,
        state: &mut ExecutionState,
        task: TaskInstance,
    ) -> Result<(), RunnableError> {
        if !self.context.backend.update_task_instance(&task).await? {
            return Err(RunnableError::PersistFailed {
                entity: "task instance",
                id: task.id,
                status: task.status.to_string(),
            });
        }
        state.tasks.insert(task.task_code, task);
        Ok(())
    }

    async fn handle_event(
        &self,
        state: &mut ExecutionState,
        event: StateEvent,
    ) -> Result<(), RunnableError> {
        let key = event.key();
        if !key.is_empty() && !state.processed_keys.insert(key.to_string()) {
            metrics::counter!("flowmaster_events_duplicate_total").increment(1);
            debug!(workflow_instance_id = self.id, key, "ignoring duplicate state event");
            return Ok(());
        }
        match event {
            StateEvent::Workflow(event) => {
                if event.event_type == StateEventType::WakeUp {
                    state.wake_scheduled = false;
                }
                self.advance(state).await
            }
            StateEvent::Task(event) => self.on_task_event(state, event).await,
        }
    }

    async fn on_task_event(
        &self,
        state: &mut ExecutionState,
        event: TaskStateEvent,
    ) -> Result<(), RunnableError> {
        let Some(&code) = state.task_codes.get(&event.task_instance_id) else {
            warn!(
                workflow_instance_id = self.id,
                task_instance_id = event.task_instance_id,
                "state event for unknown task"
            );
            return Ok(());
        };
        let Some(mut task) = state.tasks.get(&code).cloned() else {
            return Ok(());
        };
        if task.status.is_finished() {
            debug!(
                task_instance_id = task.id,
                status = %task.status,
                "ignoring event for finished task"
            );
            return Ok(());
        }

        let now = Utc::now();
        let running = state.instance.status == WorkflowExecutionStatus::Running;
        match event.status {
            TaskExecutionStatus::Submitted => Ok(()),
            TaskExecutionStatus::Dispatched => {
                if task.status != TaskExecutionStatus::Submitted {
                    return Ok(());
                }
                task.status = TaskExecutionStatus::Dispatched;
                self.save_task(state, task).await
            }
            TaskExecutionStatus::Running => {
                task.status = TaskExecutionStatus::Running;
                task.start_time.get_or_insert(now);
                self.save_task(state, task).await
            }
            TaskExecutionStatus::Success => {
                task.status = TaskExecutionStatus::Success;
                task.end_time = Some(now);
                self.save_task(state, task).await?;
                self.advance(state).await
            }
            TaskExecutionStatus::Failure if running && task.retry_times < task.max_retry_times => {
                reset_for_retry(&mut task);
                self.save_task(state, task).await?;
                self.dispatch_task(state, code).await
            }
            TaskExecutionStatus::Failure | TaskExecutionStatus::Killed => {
                task.status = event.status;
                task.end_time = Some(now);
                self.save_task(state, task).await?;
                if running {
                    self.kill_active_tasks(state).await;
                    self.transition(state, WorkflowExecutionStatus::Failure)
                        .await
                } else {
                    self.settle(state).await
                }
            }
        }
    }

    /// Complete the instance or dispatch every task whose upstreams all
    /// succeeded.
    async fn advance(&self, state: &mut ExecutionState) -> Result<(), RunnableError> {
        match state.instance.status {
            WorkflowExecutionStatus::Running => {}
            WorkflowExecutionStatus::ReadyPause | WorkflowExecutionStatus::ReadyStop => {
                return self.settle(state).await;
            }
            _ => return Ok(()),
        }

        // Failures reported while pausing were left for the resumed run.
        let mut failed: Vec<TaskInstance> = state
            .tasks
            .values()
            .filter(|task| {
                matches!(
                    task.status,
                    TaskExecutionStatus::Failure | TaskExecutionStatus::Killed
                )
            })
            .cloned()
            .collect();
        failed.sort_by_key(|task| task.id);
        for mut task in failed {
            if task.status == TaskExecutionStatus::Failure
                && task.retry_times < task.max_retry_times
            {
                reset_for_retry(&mut task);
                self.save_task(state, task).await?;
            } else {
                warn!(
                    workflow_instance_id = self.id,
                    task_instance_id = task.id,
                    status = %task.status,
                    "task ended without success, failing workflow"
                );
                self.kill_active_tasks(state).await;
                return self
                    .transition(state, WorkflowExecutionStatus::Failure)
                    .await;
            }
        }

        let succeeded = |tasks: &HashMap<i64, TaskInstance>, code: &i64| {
            tasks
                .get(code)
                .is_some_and(|task| task.status == TaskExecutionStatus::Success)
        };
        if state
            .dag
            .nodes()
            .iter()
            .all(|node| succeeded(&state.tasks, &node.code))
        {
            return self
                .transition(state, WorkflowExecutionStatus::Success)
                .await;
        }

        let ready: Vec<i64> = state
            .dag
            .nodes()
            .iter()
            .filter(|node| {
                node.upstream_codes
                    .iter()
                    .all(|upstream| succeeded(&state.tasks, upstream))
                    && state
                        .tasks
                        .get(&node.code)
                        .is_none_or(|task| task.status == TaskExecutionStatus::Submitted)
            })
            .map(|node| node.code)
            .collect();
        for code in ready {
            self.dispatch_task(state, code).await?;
        }
        Ok(())
    }

    /// Leave a pausing or stopping instance once no task is active.
    async fn settle(&self, state: &mut ExecutionState) -> Result<(), RunnableError> {
        if state.tasks.values().any(|task| task.status.is_active()) {
            return Ok(());
        }
        match state.instance.status {
            WorkflowExecutionStatus::ReadyPause => {
                self.transition(state, WorkflowExecutionStatus::Paused)
                    .await
            }
            WorkflowExecutionStatus::ReadyStop => {
                self.transition(state, WorkflowExecutionStatus::Stopped)
                    .await
            }
            _ => Ok(()),
        }
    }

    async fn dispatch_task(&self, state: &mut ExecutionState, code: i64) -> Result<(), RunnableError> {
        let mut task = match state.tasks.get(&code) {
            Some(task) => task.clone(),
            None => {
                let Some(node) = state.dag.node(code) else {
                    return Ok(());
                };
                let mut task =
                    TaskInstance::from_node(self.id, node, &state.instance.worker_group);
                task.id = self.context.backend.create_task_instance(&task).await?;
                state.task_codes.insert(task.id, code);
                state.tasks.insert(code, task.clone());
                task
            }
        };

        let mut ctx = ExecutionContext::for_worker(self.dispatch_request(&task));
        match self.context.dispatcher.dispatch(&mut ctx).await {
            Ok(true) => {
                task.status = TaskExecutionStatus::Dispatched;
                task.host = ctx.host.map(|host| host.address);
                self.save_task(state, task).await
            }
            Ok(false) => {
                debug!(
                    task_instance_id = task.id,
                    host = ?ctx.host.map(|host| host.address),
                    "task not dispatched, retrying later"
                );
                self.schedule_wake_up(state);
                Ok(())
            }
            Err(err) => {
                warn!(task_instance_id = task.id, ?err, "dispatch failed, retrying later");
                self.schedule_wake_up(state);
                Ok(())
            }
        }
    }

    fn dispatch_request(&self, task: &TaskInstance) -> TaskDispatchRequest {
        TaskDispatchRequest {
            task_instance_id: task.id,
            workflow_instance_id: self.id,
            task_code: task.task_code,
            task_version: task.task_version,
            task_name: task.name.clone(),
            task_type: task.task_type.clone(),
            worker_group: task.worker_group.clone(),
            master_host: self.context.master_address.clone(),
            retry_times: task.retry_times,
            task_params: HashMap::new(),
        }
    }

    /// Ask every worker holding an active task to kill it, all at once. Tasks
    /// are marked killed whatever the workers answer so a dead worker cannot
    /// block the stop.
    async fn kill_active_tasks(&self, state: &mut ExecutionState) {
        let active: Vec<TaskInstance> = state
            .tasks
            .values()
            .filter(|task| task.status.is_active())
            .cloned()
            .collect();
        let requests = active.iter().filter_map(|task| {
            let host = task.host.as_deref()?;
            Some(self.send_kill(task.id, host))
        });
        futures::future::join_all(requests).await;

        for mut task in active {
            task.status = TaskExecutionStatus::Killed;
            task.end_time = Some(Utc::now());
            let task_instance_id = task.id;
            if let Err(err) = self.save_task(state, task).await {
                warn!(task_instance_id, ?err, "failed to persist killed task");
            }
        }
    }

    async fn send_kill(&self, task_instance_id: i64, host: &str) {
        let request = TaskKillRequest {
            task_instance_id,
            workflow_instance_id: self.id,
        };
        let response = self
            .context
            .rpc_client
            .call::<_, TaskKillResponse>(
                host,
                MessageKind::TaskKillRequest,
                &request,
                MessageKind::TaskKillResponse,
                self.context.kill_timeout,
            )
            .await;
        match response {
            Ok(response) if response.success => debug!(task_instance_id, host, "task killed"),
            Ok(response) => warn!(
                task_instance_id,
                host,
                message = %response.message,
                "worker refused kill"
            ),
            Err(err) => warn!(task_instance_id, host, ?err, "kill request failed"),
        }
        metrics::counter!("flowmaster_task_kills_total").increment(1);
    }

    fn schedule_wake_up(&self, state: &mut ExecutionState) {
        if state.wake_scheduled {
            return;
        }
        state.wake_scheduled = true;
        let mailbox = self.mailbox.clone();
        let finished = self.finished.clone();
        let id = self.id;
        let delay = self.context.dispatch_retry_interval;
        tokio::spawn(async move {
            tokio::select! {
                _ = finished.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = mailbox.send(StateEvent::wake_up(id));
                }
            }
        });
    }
}

/// Queue `task` for another attempt.
fn reset_for_retry(task: &mut TaskInstance) {
    task.retry_times += 1;
    task.status = TaskExecutionStatus::Submitted;
    task.host = None;
    task.start_time = None;
    task.end_time = None;
    info!(
        task_instance_id = task.id,
        retry_times = task.retry_times,
        max_retry_times = task.max_retry_times,
        "retrying failed task"
    );
}
