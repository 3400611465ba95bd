//! Backend implementations for master persistence and discovery.

mod base;
mod memory;
mod postgres;

pub use base::{
    BackendError, BackendResult, CommandBackend, ErrorCommand, MasterBackend, RegistryBackend,
    WorkflowDefinitionBackend, WorkflowInstanceBackend,
};
pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;
