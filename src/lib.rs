//! Flowmaster - master-side engine of a distributed DAG workflow scheduler.
//!
//! A master claims commands from its id slot, turns each into a workflow
//! runnable, dispatches ready tasks to workers and reacts to the state
//! changes they report back.

pub mod backends;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod events;
pub mod messages;
pub mod models;
pub mod observability;
pub mod rpc;

pub use backends::{MasterBackend, MemoryBackend, PostgresBackend};
pub use config::Config;
pub use coordinator::MasterCoordinator;
pub use engine::{EngineError, WorkflowEngine};
pub use messages::{MessageError, proto};
pub use observability::obs;
