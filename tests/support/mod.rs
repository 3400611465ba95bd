//! Shared harness: one or more masters and a fake worker wired through the
//! in-memory transport.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use flowmaster::command::FixedMetricsCollector;
use flowmaster::messages::{decode_payload, envelope};
use flowmaster::models::{
    Command, CommandType, Host, TaskInstance, TaskNode, WorkflowDag, WorkflowExecutionStatus,
    WorkflowInstance,
};
use flowmaster::proto::{
    Envelope, MessageKind, StateChangeAck, StateChangeNotification, TaskDispatchRequest,
    TaskDispatchResponse, TaskKillRequest, TaskKillResponse,
};
use flowmaster::rpc::{InMemoryTransport, RpcClient, RpcHandler};
use flowmaster::{Config, MasterCoordinator, MemoryBackend};

pub const MASTER: &str = "master-1:5678";
pub const WORKER: &str = "worker-1:1234";
pub const WAIT: Duration = Duration::from_secs(5);

/// What the fake worker does with a dispatched task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    Fail,
    /// Report RUNNING and never finish.
    Hang,
}

pub struct FakeWorker {
    client: Arc<RpcClient>,
    outcomes: Mutex<HashMap<i64, Outcome>>,
    dispatches: Mutex<Vec<TaskDispatchRequest>>,
    kills: Mutex<Vec<TaskKillRequest>>,
    accepting: AtomicBool,
    answering_kills: AtomicBool,
}

impl FakeWorker {
    pub fn new(transport: &InMemoryTransport) -> Arc<Self> {
        Arc::new(Self {
            client: Arc::new(RpcClient::new(
                Arc::new(transport.clone()),
                Duration::from_secs(2),
            )),
            outcomes: Mutex::new(HashMap::new()),
            dispatches: Mutex::new(Vec::new()),
            kills: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
            answering_kills: AtomicBool::new(true),
        })
    }

    pub fn set_outcome(&self, task_code: i64, outcome: Outcome) {
        self.outcomes.lock().unwrap().insert(task_code, outcome);
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// When off, kill requests are recorded but never answered.
    pub fn set_answering_kills(&self, answering: bool) {
        self.answering_kills.store(answering, Ordering::SeqCst);
    }

    pub fn dispatches(&self) -> Vec<TaskDispatchRequest> {
        self.dispatches.lock().unwrap().clone()
    }

    pub fn dispatched_codes(&self) -> Vec<i64> {
        self.dispatches()
            .iter()
            .map(|request| request.task_code)
            .collect()
    }

    pub fn kills(&self) -> Vec<TaskKillRequest> {
        self.kills.lock().unwrap().clone()
    }

    /// Report `status` for `request` back to its master, retrying until the
    /// master acknowledges it.
    pub async fn report(&self, request: &TaskDispatchRequest, status: &str) {
        report(&self.client, request, status).await;
    }

    fn outcome(&self, task_code: i64) -> Outcome {
        self.outcomes
            .lock()
            .unwrap()
            .get(&task_code)
            .copied()
            .unwrap_or(Outcome::Succeed)
    }
}

async fn report(client: &RpcClient, request: &TaskDispatchRequest, status: &str) {
    let notification = StateChangeNotification {
        source_workflow_instance_id: request.workflow_instance_id,
        dest_workflow_instance_id: request.workflow_instance_id,
        dest_task_instance_id: request.task_instance_id,
        source_status: status.to_string(),
        key: format!(
            "{}-{}-{}",
            request.task_instance_id, request.retry_times, status
        ),
    };
    for _ in 0..100 {
        let acked = client
            .call::<_, StateChangeAck>(
                &request.master_host,
                MessageKind::StateChangeNotification,
                &notification,
                MessageKind::StateChangeAck,
                Duration::from_secs(1),
            )
            .await;
        if acked.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("master never acknowledged {status} for {}", request.task_instance_id);
}

#[async_trait]
impl RpcHandler for FakeWorker {
    async fn handle(&self, request: Envelope) -> Option<Envelope> {
        if let Ok(dispatch) =
            decode_payload::<TaskDispatchRequest>(&request, MessageKind::TaskDispatchRequest)
        {
            self.dispatches.lock().unwrap().push(dispatch.clone());
            let accepted = self.accepting.load(Ordering::SeqCst);
            if accepted {
                let outcome = self.outcome(dispatch.task_code);
                let client = Arc::clone(&self.client);
                let dispatch = dispatch.clone();
                tokio::spawn(async move {
                    report(&client, &dispatch, "RUNNING").await;
                    match outcome {
                        Outcome::Succeed => report(&client, &dispatch, "SUCCESS").await,
                        Outcome::Fail => report(&client, &dispatch, "FAILURE").await,
                        Outcome::Hang => {}
                    }
                });
            }
            return Some(envelope(
                request.request_id,
                MessageKind::TaskDispatchResponse,
                &TaskDispatchResponse {
                    task_instance_id: dispatch.task_instance_id,
                    accepted,
                    message: String::new(),
                },
            ));
        }
        if let Ok(kill) = decode_payload::<TaskKillRequest>(&request, MessageKind::TaskKillRequest)
        {
            self.kills.lock().unwrap().push(kill.clone());
            if !self.answering_kills.load(Ordering::SeqCst) {
                return None;
            }
            return Some(envelope(
                request.request_id,
                MessageKind::TaskKillResponse,
                &TaskKillResponse {
                    task_instance_id: kill.task_instance_id,
                    success: true,
                    message: String::new(),
                },
            ));
        }
        None
    }
}

/// Config for an in-process master with short intervals.
pub fn master_config(address: &str) -> Config {
    Config {
        advertise_addr: address.to_string(),
        rpc_server_enabled: false,
        rpc_timeout: Duration::from_secs(2),
        rpc_sweep_interval: Duration::from_millis(100),
        host_refresh_interval: Duration::from_millis(50),
        dispatch_retry_interval: Duration::from_millis(50),
        event_shards: 2,
        command: flowmaster::config::CommandConfig {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        },
        ..Config::default()
    }
}

pub struct Cluster {
    pub backend: MemoryBackend,
    pub transport: InMemoryTransport,
    pub worker: Arc<FakeWorker>,
    pub masters: Vec<MasterCoordinator>,
}

impl Cluster {
    /// Backend with one registered worker and no masters yet.
    pub fn new() -> Self {
        let backend = MemoryBackend::new();
        backend.add_host(Host::new(WORKER, 100, "default"));
        let transport = InMemoryTransport::new();
        let worker = FakeWorker::new(&transport);
        transport.register(WORKER, Arc::clone(&worker) as Arc<dyn RpcHandler>);
        Self {
            backend,
            transport,
            worker,
            masters: Vec::new(),
        }
    }

    pub async fn start_master(&mut self, config: Config) -> &MasterCoordinator {
        let address = config.advertise_addr.clone();
        let master = MasterCoordinator::start(
            config,
            Arc::new(self.backend.clone()),
            Arc::new(self.transport.clone()),
            Arc::new(FixedMetricsCollector::default()),
        )
        .await
        .expect("master starts");
        self.transport.register(address, master.rpc_handler());
        self.masters.push(master);
        self.masters.last().expect("just pushed")
    }

    pub fn master(&self) -> &MasterCoordinator {
        &self.masters[0]
    }

    pub async fn shutdown(self) {
        for master in self.masters {
            master.shutdown().await;
        }
    }

    pub async fn wait_for_status(
        &self,
        workflow_instance_id: i64,
        status: WorkflowExecutionStatus,
    ) -> WorkflowInstance {
        wait_until(|| {
            self.backend
                .workflow_instance(workflow_instance_id)
                .filter(|instance| instance.status == status)
        })
        .await
        .unwrap_or_else(|| {
            panic!(
                "instance {workflow_instance_id} never reached {status}, now {:?}",
                self.backend
                    .workflow_instance(workflow_instance_id)
                    .map(|instance| instance.status)
            )
        })
    }

    pub fn tasks_of(&self, workflow_instance_id: i64) -> Vec<TaskInstance> {
        self.backend
            .task_instances()
            .into_iter()
            .filter(|task| task.workflow_instance_id == workflow_instance_id)
            .collect()
    }

    /// Instances currently stored, found by scanning the shared id sequence.
    pub fn instances(&self) -> Vec<WorkflowInstance> {
        (1..=200)
            .filter_map(|id| self.backend.workflow_instance(id))
            .collect()
    }
}

/// Poll `probe` every 10ms until it yields a value or [`WAIT`] elapses.
pub async fn wait_until<T>(mut probe: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(value) = probe() {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn task(code: i64, upstream: &[i64], max_retry_times: u32) -> TaskNode {
    TaskNode {
        code,
        version: 1,
        name: format!("task-{code}"),
        task_type: "SHELL".to_string(),
        worker_group: String::new(),
        upstream_codes: upstream.to_vec(),
        max_retry_times,
    }
}

pub fn dag(nodes: Vec<TaskNode>) -> WorkflowDag {
    WorkflowDag::new(nodes).expect("valid dag")
}

pub fn start_command(id: i64, definition_code: i64) -> Command {
    Command {
        id,
        command_type: CommandType::Start,
        workflow_definition_code: definition_code,
        workflow_definition_version: 1,
        workflow_instance_id: None,
        worker_group: "default".to_string(),
        params: Value::Null,
        created_at: Utc::now(),
    }
}
