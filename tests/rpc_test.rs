//! RPC round trips over real TCP sockets.

mod support;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use flowmaster::command::FixedMetricsCollector;
use flowmaster::messages::{envelope, error_envelope};
use flowmaster::proto::{
    ControlAction, Envelope, MessageKind, TaskDispatchRequest, TaskDispatchResponse,
    WorkflowControlRequest, WorkflowControlResponse,
};
use flowmaster::rpc::{RpcClient, RpcError, RpcHandler, RpcServer, TcpTransport};
use flowmaster::{Config, MasterCoordinator, MemoryBackend};

/// Accepts every dispatch; task 13 gets an error and task 99 is answered
/// late.
struct WorkerStub;

#[async_trait]
impl RpcHandler for WorkerStub {
    async fn handle(&self, request: Envelope) -> Option<Envelope> {
        let dispatch: TaskDispatchRequest =
            flowmaster::messages::decode_payload(&request, MessageKind::TaskDispatchRequest)
                .ok()?;
        match dispatch.task_instance_id {
            13 => return Some(error_envelope(request.request_id, "worker is draining")),
            99 => tokio::time::sleep(Duration::from_millis(300)).await,
            _ => {}
        }
        Some(envelope(
            request.request_id,
            MessageKind::TaskDispatchResponse,
            &TaskDispatchResponse {
                task_instance_id: dispatch.task_instance_id,
                accepted: true,
                message: String::new(),
            },
        ))
    }
}

fn dispatch(task_instance_id: i64) -> TaskDispatchRequest {
    TaskDispatchRequest {
        task_instance_id,
        workflow_instance_id: 1,
        task_code: 10,
        task_version: 1,
        task_name: "extract".to_string(),
        task_type: "SHELL".to_string(),
        worker_group: "default".to_string(),
        master_host: "127.0.0.1:5678".to_string(),
        retry_times: 0,
        task_params: Default::default(),
    }
}

async fn call(
    client: &RpcClient,
    host: &str,
    task_instance_id: i64,
    timeout: Duration,
) -> Result<TaskDispatchResponse, RpcError> {
    client
        .call(
            host,
            MessageKind::TaskDispatchRequest,
            &dispatch(task_instance_id),
            MessageKind::TaskDispatchResponse,
            timeout,
        )
        .await
}

#[tokio::test]
async fn tcp_round_trip_correlates_concurrent_requests() {
    let server = RpcServer::start("127.0.0.1:0".parse().unwrap(), Arc::new(WorkerStub))
        .await
        .expect("server binds");
    let host = server.addr().to_string();
    let client = RpcClient::new(Arc::new(TcpTransport::default()), Duration::from_secs(2));

    let (first, second, third) = tokio::join!(
        call(&client, &host, 1, Duration::from_secs(2)),
        call(&client, &host, 2, Duration::from_secs(2)),
        call(&client, &host, 3, Duration::from_secs(2)),
    );
    assert_eq!(first.expect("first").task_instance_id, 1);
    assert_eq!(second.expect("second").task_instance_id, 2);
    assert_eq!(third.expect("third").task_instance_id, 3);
    assert!(client.pending().is_empty());

    let err = call(&client, &host, 13, Duration::from_secs(2))
        .await
        .expect_err("remote error");
    assert!(matches!(err, RpcError::Remote(ref message) if message == "worker is draining"));

    server.shutdown().await;
}

#[tokio::test]
async fn late_response_times_out_and_is_dropped() {
    let server = RpcServer::start("127.0.0.1:0".parse().unwrap(), Arc::new(WorkerStub))
        .await
        .expect("server binds");
    let host = server.addr().to_string();
    let client = RpcClient::new(Arc::new(TcpTransport::default()), Duration::from_secs(2));

    let err = call(&client, &host, 99, Duration::from_millis(50))
        .await
        .expect_err("times out");
    assert!(matches!(err, RpcError::Timeout { .. }));
    assert!(client.pending().is_empty());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(client.pending().is_empty(), "late response resolves nothing");
    let ok = call(&client, &host, 5, Duration::from_secs(2))
        .await
        .expect("connection still usable");
    assert_eq!(ok.task_instance_id, 5);

    server.shutdown().await;
}

#[tokio::test]
async fn unreachable_host_fails_to_connect() {
    let client = RpcClient::new(
        Arc::new(TcpTransport::new(Duration::from_millis(200))),
        Duration::from_secs(1),
    );
    let err = call(&client, "127.0.0.1:1", 1, Duration::from_millis(200))
        .await
        .expect_err("nothing listens on port 1");
    assert!(matches!(err, RpcError::Connect { .. }));
    assert!(client.pending().is_empty());
}

#[tokio::test]
async fn master_serves_control_requests_over_tcp() {
    let config = Config {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        advertise_addr: "master-tcp:5678".to_string(),
        ..support::master_config("master-tcp:5678")
    };
    let master = MasterCoordinator::start(
        Config {
            rpc_server_enabled: true,
            ..config
        },
        Arc::new(MemoryBackend::new()),
        Arc::new(TcpTransport::default()),
        Arc::new(FixedMetricsCollector::default()),
    )
    .await
    .expect("master starts");
    let addr = master.server_addr().expect("server enabled").to_string();

    let client = RpcClient::new(Arc::new(TcpTransport::default()), Duration::from_secs(2));
    let reply: WorkflowControlResponse = client
        .call(
            &addr,
            MessageKind::WorkflowControlRequest,
            &WorkflowControlRequest {
                workflow_instance_id: 999,
                action: ControlAction::Stop as i32,
            },
            MessageKind::WorkflowControlResponse,
            Duration::from_secs(2),
        )
        .await
        .expect("control reply");
    assert!(!reply.success);
    assert_eq!(reply.message, "WorkflowExecuteRunnable not found: [id=999]");

    master.shutdown().await;
}
