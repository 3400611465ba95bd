use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{StateEvent, StateEventPipeline};
use crate::engine::WorkflowEngine;
use crate::messages::proto::{
    ControlAction, Envelope, MessageKind, StateChangeAck, StateChangeNotification,
    WorkflowControlRequest, WorkflowControlResponse,
};
use crate::messages::{decode_payload, envelope, error_envelope};
use crate::rpc::RpcHandler;

/// Inbound RPC surface of a master: state change reports from workers and
/// peers, and control requests for workflows this master owns.
pub struct MasterRpcHandler {
    pipeline: Arc<StateEventPipeline>,
    engine: WorkflowEngine,
}

impl MasterRpcHandler {
    pub fn new(pipeline: Arc<StateEventPipeline>, engine: WorkflowEngine) -> Self {
        Self { pipeline, engine }
    }

    async fn on_state_change(&self, request: &Envelope) -> Envelope {
        let notification: StateChangeNotification =
            match decode_payload(request, MessageKind::StateChangeNotification) {
                Ok(notification) => notification,
                Err(err) => return error_envelope(request.request_id, err.to_string()),
            };
        let event = match StateEvent::from_notification(&notification) {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    workflow_instance_id = notification.dest_workflow_instance_id,
                    ?err,
                    "rejecting state change"
                );
                return error_envelope(request.request_id, err.to_string());
            }
        };
        if let Err(err) = self.pipeline.submit(event).await {
            return error_envelope(request.request_id, err.to_string());
        }
        envelope(
            request.request_id,
            MessageKind::StateChangeAck,
            &StateChangeAck {
                key: notification.key,
            },
        )
    }

    async fn on_control(&self, request: &Envelope) -> Envelope {
        let control: WorkflowControlRequest =
            match decode_payload(request, MessageKind::WorkflowControlRequest) {
                Ok(control) => control,
                Err(err) => return error_envelope(request.request_id, err.to_string()),
            };
        let id = control.workflow_instance_id;
        let result = match ControlAction::try_from(control.action) {
            Ok(ControlAction::Pause) => self.engine.pause_workflow(id).await,
            Ok(ControlAction::Stop) => self.engine.stop_workflow(id).await,
            _ => {
                return error_envelope(
                    request.request_id,
                    format!("unsupported control action {}", control.action),
                );
            }
        };
        let (success, message) = match result {
            Ok(()) => (true, String::new()),
            Err(err) => {
                debug!(workflow_instance_id = id, ?err, "control request refused");
                (false, err.to_string())
            }
        };
        envelope(
            request.request_id,
            MessageKind::WorkflowControlResponse,
            &WorkflowControlResponse {
                workflow_instance_id: id,
                success,
                message,
            },
        )
    }
}

#[async_trait]
impl RpcHandler for MasterRpcHandler {
    async fn handle(&self, request: Envelope) -> Option<Envelope> {
        let kind = MessageKind::try_from(request.kind).unwrap_or(MessageKind::Unspecified);
        let response = match kind {
            MessageKind::StateChangeNotification => self.on_state_change(&request).await,
            MessageKind::WorkflowControlRequest => self.on_control(&request).await,
            MessageKind::Heartbeat => request,
            _ => {
                warn!(kind = request.kind, "unsupported message kind");
                error_envelope(
                    request.request_id,
                    format!("unsupported message kind {}", request.kind),
                )
            }
        };
        Some(response)
    }
}
