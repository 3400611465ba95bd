//! Wire messages exchanged between masters and workers, plus encode/decode
//! helpers.
//!
//! Every frame on the wire is an [`proto::Envelope`]; the `kind` tag tells the
//! receiver which payload message is carried in `payload`. Responses echo the
//! `request_id` of the request they answer.

use prost::Message;
use thiserror::Error;

pub mod proto {
    use std::collections::HashMap;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Envelope {
        #[prost(uint64, tag = "1")]
        pub request_id: u64,
        #[prost(enumeration = "MessageKind", tag = "2")]
        pub kind: i32,
        #[prost(bytes = "vec", tag = "3")]
        pub payload: Vec<u8>,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum MessageKind {
        Unspecified = 0,
        TaskDispatchRequest = 1,
        TaskDispatchResponse = 2,
        TaskKillRequest = 3,
        TaskKillResponse = 4,
        StateChangeNotification = 5,
        StateChangeAck = 6,
        WorkflowControlRequest = 7,
        WorkflowControlResponse = 8,
        Error = 9,
        Heartbeat = 10,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TaskDispatchRequest {
        #[prost(int64, tag = "1")]
        pub task_instance_id: i64,
        #[prost(int64, tag = "2")]
        pub workflow_instance_id: i64,
        #[prost(int64, tag = "3")]
        pub task_code: i64,
        #[prost(int32, tag = "4")]
        pub task_version: i32,
        #[prost(string, tag = "5")]
        pub task_name: String,
        #[prost(string, tag = "6")]
        pub task_type: String,
        #[prost(string, tag = "7")]
        pub worker_group: String,
        /// Address workers report state changes back to.
        #[prost(string, tag = "8")]
        pub master_host: String,
        #[prost(uint32, tag = "9")]
        pub retry_times: u32,
        #[prost(map = "string, string", tag = "10")]
        pub task_params: HashMap<String, String>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TaskDispatchResponse {
        #[prost(int64, tag = "1")]
        pub task_instance_id: i64,
        #[prost(bool, tag = "2")]
        pub accepted: bool,
        #[prost(string, tag = "3")]
        pub message: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TaskKillRequest {
        #[prost(int64, tag = "1")]
        pub task_instance_id: i64,
        #[prost(int64, tag = "2")]
        pub workflow_instance_id: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TaskKillResponse {
        #[prost(int64, tag = "1")]
        pub task_instance_id: i64,
        #[prost(bool, tag = "2")]
        pub success: bool,
        #[prost(string, tag = "3")]
        pub message: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StateChangeNotification {
        #[prost(int64, tag = "1")]
        pub source_workflow_instance_id: i64,
        #[prost(int64, tag = "2")]
        pub dest_workflow_instance_id: i64,
        /// Zero when the notification targets the workflow itself.
        #[prost(int64, tag = "3")]
        pub dest_task_instance_id: i64,
        #[prost(string, tag = "4")]
        pub source_status: String,
        /// Idempotency key; redeliveries carry the same key.
        #[prost(string, tag = "5")]
        pub key: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StateChangeAck {
        #[prost(string, tag = "1")]
        pub key: String,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum ControlAction {
        Unspecified = 0,
        Pause = 1,
        Stop = 2,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct WorkflowControlRequest {
        #[prost(int64, tag = "1")]
        pub workflow_instance_id: i64,
        #[prost(enumeration = "ControlAction", tag = "2")]
        pub action: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct WorkflowControlResponse {
        #[prost(int64, tag = "1")]
        pub workflow_instance_id: i64,
        #[prost(bool, tag = "2")]
        pub success: bool,
        #[prost(string, tag = "3")]
        pub message: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ErrorResponse {
        #[prost(string, tag = "1")]
        pub message: String,
    }
}

/// Errors that can occur during message encoding/decoding
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("unexpected message kind {actual:?}, expected {expected:?}")]
    UnexpectedKind {
        expected: proto::MessageKind,
        actual: i32,
    },
    #[error("Channel closed")]
    ChannelClosed,
}

pub fn encode_message<M: Message>(msg: &M) -> Vec<u8> {
    msg.encode_to_vec()
}

pub fn decode_message<M>(bytes: &[u8]) -> Result<M, MessageError>
where
    M: Message + Default,
{
    M::decode(bytes).map_err(MessageError::from)
}

/// Decode the payload of `envelope`, checking that it carries `expected`.
pub fn decode_payload<M>(
    envelope: &proto::Envelope,
    expected: proto::MessageKind,
) -> Result<M, MessageError>
where
    M: Message + Default,
{
    if envelope.kind != expected as i32 {
        return Err(MessageError::UnexpectedKind {
            expected,
            actual: envelope.kind,
        });
    }
    decode_message(&envelope.payload)
}

pub fn envelope<M: Message>(
    request_id: u64,
    kind: proto::MessageKind,
    payload: &M,
) -> proto::Envelope {
    proto::Envelope {
        request_id,
        kind: kind as i32,
        payload: encode_message(payload),
    }
}

/// Build an `Error` envelope answering `request_id`.
pub fn error_envelope(request_id: u64, message: impl Into<String>) -> proto::Envelope {
    envelope(
        request_id,
        proto::MessageKind::Error,
        &proto::ErrorResponse {
            message: message.into(),
        },
    )
}
