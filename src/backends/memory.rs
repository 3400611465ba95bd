//! In-memory backend for tests and single-process deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use super::base::{
    BackendError, BackendResult, CommandBackend, ErrorCommand, RegistryBackend,
    WorkflowDefinitionBackend, WorkflowInstanceBackend,
};
use crate::command::SlotPredicate;
use crate::models::{
    Command, CommandType, Host, TaskInstance, WorkflowDag, WorkflowExecutionStatus,
    WorkflowInstance,
};

type DagKey = (i64, i32);

/// Backend that keeps every table in memory.
#[derive(Clone)]
pub struct MemoryBackend {
    commands: Arc<Mutex<BTreeMap<i64, Command>>>,
    error_commands: Arc<Mutex<Vec<ErrorCommand>>>,
    workflow_instances: Arc<Mutex<HashMap<i64, WorkflowInstance>>>,
    task_instances: Arc<Mutex<BTreeMap<i64, TaskInstance>>>,
    dags: Arc<Mutex<HashMap<DagKey, WorkflowDag>>>,
    hosts: Arc<Mutex<BTreeMap<String, Vec<Host>>>>,
    masters: Arc<Mutex<Vec<String>>>,
    next_id: Arc<AtomicI64>,
    reject_updates: Arc<AtomicBool>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            commands: Arc::new(Mutex::new(BTreeMap::new())),
            error_commands: Arc::new(Mutex::new(Vec::new())),
            workflow_instances: Arc::new(Mutex::new(HashMap::new())),
            task_instances: Arc::new(Mutex::new(BTreeMap::new())),
            dags: Arc::new(Mutex::new(HashMap::new())),
            hosts: Arc::new(Mutex::new(BTreeMap::new())),
            masters: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicI64::new(1)),
            reject_updates: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn insert_command(&self, command: Command) {
        self.commands
            .lock()
            .expect("commands poisoned")
            .insert(command.id, command);
    }

    pub fn pending_command_ids(&self) -> Vec<i64> {
        self.commands
            .lock()
            .expect("commands poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub fn error_commands(&self) -> Vec<ErrorCommand> {
        self.error_commands
            .lock()
            .expect("error commands poisoned")
            .clone()
    }

    pub fn register_dag(&self, code: i64, version: i32, dag: WorkflowDag) {
        self.dags
            .lock()
            .expect("dags poisoned")
            .insert((code, version), dag);
    }

    pub fn insert_workflow_instance(&self, instance: WorkflowInstance) {
        self.workflow_instances
            .lock()
            .expect("workflow instances poisoned")
            .insert(instance.id, instance);
    }

    pub fn workflow_instance(&self, id: i64) -> Option<WorkflowInstance> {
        self.workflow_instances
            .lock()
            .expect("workflow instances poisoned")
            .get(&id)
            .cloned()
    }

    /// Seed a task row as-is, keeping its id.
    pub fn insert_task_instance(&self, task: TaskInstance) {
        self.task_instances
            .lock()
            .expect("task instances poisoned")
            .insert(task.id, task);
    }

    pub fn task_instances(&self) -> Vec<TaskInstance> {
        self.task_instances
            .lock()
            .expect("task instances poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn add_host(&self, host: Host) {
        let mut hosts = self.hosts.lock().expect("hosts poisoned");
        let group = hosts.entry(host.worker_group.clone()).or_default();
        group.retain(|existing| existing.address != host.address);
        group.push(host);
    }

    pub fn remove_host(&self, address: &str) {
        let mut hosts = self.hosts.lock().expect("hosts poisoned");
        for group in hosts.values_mut() {
            group.retain(|existing| existing.address != address);
        }
    }

    pub fn set_masters(&self, masters: Vec<String>) {
        *self.masters.lock().expect("masters poisoned") = masters;
    }

    /// Make every instance/task update report that no row changed.
    pub fn set_reject_updates(&self, reject: bool) {
        self.reject_updates.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkflowInstanceBackend for MemoryBackend {
    async fn get_workflow_instance(&self, id: i64) -> BackendResult<Option<WorkflowInstance>> {
        Ok(self.workflow_instance(id))
    }

    async fn update_workflow_instance(&self, instance: &WorkflowInstance) -> BackendResult<bool> {
        if self.reject_updates.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let mut guard = self
            .workflow_instances
            .lock()
            .expect("workflow instances poisoned");
        match guard.get_mut(&instance.id) {
            Some(stored) => {
                *stored = instance.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_task_instance(&self, task: &TaskInstance) -> BackendResult<i64> {
        let id = self.allocate_id();
        let mut stored = task.clone();
        stored.id = id;
        self.task_instances
            .lock()
            .expect("task instances poisoned")
            .insert(id, stored);
        Ok(id)
    }

    async fn update_task_instance(&self, task: &TaskInstance) -> BackendResult<bool> {
        if self.reject_updates.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let mut guard = self.task_instances.lock().expect("task instances poisoned");
        match guard.get_mut(&task.id) {
            Some(stored) => {
                *stored = task.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_task_instances(
        &self,
        workflow_instance_id: i64,
    ) -> BackendResult<Vec<TaskInstance>> {
        Ok(self
            .task_instances
            .lock()
            .expect("task instances poisoned")
            .values()
            .filter(|task| task.workflow_instance_id == workflow_instance_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CommandBackend for MemoryBackend {
    async fn list_pending_commands(
        &self,
        slot: SlotPredicate,
        limit: usize,
    ) -> BackendResult<Vec<Command>> {
        Ok(self
            .commands
            .lock()
            .expect("commands poisoned")
            .values()
            .filter(|command| slot.matches(command.id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create_workflow_instance(
        &self,
        command: &Command,
        host: &str,
    ) -> BackendResult<WorkflowInstance> {
        let mut commands = self.commands.lock().expect("commands poisoned");
        if !commands.contains_key(&command.id) {
            return Err(BackendError::Message(format!(
                "command {} already consumed",
                command.id
            )));
        }
        let mut instances = self
            .workflow_instances
            .lock()
            .expect("workflow instances poisoned");
        let now = Utc::now();

        let instance = match (command.command_type, command.workflow_instance_id) {
            (CommandType::Recover | CommandType::Rerun, Some(existing_id)) => {
                let Some(existing) = instances.get_mut(&existing_id) else {
                    return Err(BackendError::Message(format!(
                        "workflow instance {existing_id} not found for command {}",
                        command.id
                    )));
                };
                let masters = self.masters.lock().expect("masters poisoned");
                if let Some(owner) = live_owner(existing, host, &masters) {
                    return Err(BackendError::Message(format!(
                        "workflow instance {existing_id} is {} on live master {owner}",
                        existing.status
                    )));
                }
                drop(masters);
                existing.status = WorkflowExecutionStatus::Submitted;
                existing.command_type = command.command_type;
                existing.host = Some(host.to_string());
                existing.restart_time = Some(now);
                existing.end_time = None;
                existing.clone()
            }
            _ => {
                let instance = WorkflowInstance {
                    id: self.allocate_id(),
                    workflow_definition_code: command.workflow_definition_code,
                    workflow_definition_version: command.workflow_definition_version,
                    status: WorkflowExecutionStatus::Submitted,
                    command_type: command.command_type,
                    host: Some(host.to_string()),
                    worker_group: command.worker_group.clone(),
                    start_time: Some(now),
                    end_time: None,
                    restart_time: None,
                };
                instances.insert(instance.id, instance.clone());
                instance
            }
        };
        commands.remove(&command.id);
        Ok(instance)
    }

    async fn fail_workflow_instance(
        &self,
        command: &Command,
        workflow_instance_id: i64,
        message: &str,
    ) -> BackendResult<()> {
        if let Some(instance) = self
            .workflow_instances
            .lock()
            .expect("workflow instances poisoned")
            .get_mut(&workflow_instance_id)
        {
            instance.status = WorkflowExecutionStatus::Failure;
            instance.end_time = Some(Utc::now());
        }
        self.move_to_error_command(command, message).await
    }

    async fn move_to_error_command(&self, command: &Command, message: &str) -> BackendResult<()> {
        self.commands
            .lock()
            .expect("commands poisoned")
            .remove(&command.id);
        self.error_commands
            .lock()
            .expect("error commands poisoned")
            .push(ErrorCommand {
                command: command.clone(),
                message: message.to_string(),
                failed_at: Utc::now(),
            });
        Ok(())
    }
}

/// Master other than `host` that still owns the non-terminal `instance`.
fn live_owner<'a>(
    instance: &'a WorkflowInstance,
    host: &str,
    masters: &[String],
) -> Option<&'a str> {
    if instance.status.is_terminal() {
        return None;
    }
    instance
        .host
        .as_deref()
        .filter(|owner| *owner != host && masters.iter().any(|master| master == owner))
}

#[async_trait]
impl WorkflowDefinitionBackend for MemoryBackend {
    async fn load_dag(&self, code: i64, version: i32) -> BackendResult<WorkflowDag> {
        self.dags
            .lock()
            .expect("dags poisoned")
            .get(&(code, version))
            .cloned()
            .ok_or_else(|| {
                BackendError::Message(format!("workflow definition {code}:{version} not found"))
            })
    }
}

#[async_trait]
impl RegistryBackend for MemoryBackend {
    async fn list_worker_groups(&self) -> BackendResult<Vec<String>> {
        Ok(self
            .hosts
            .lock()
            .expect("hosts poisoned")
            .keys()
            .cloned()
            .collect())
    }

    async fn list_hosts(&self, worker_group: &str) -> BackendResult<Vec<Host>> {
        Ok(self
            .hosts
            .lock()
            .expect("hosts poisoned")
            .get(worker_group)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_masters(&self) -> BackendResult<Vec<String>> {
        Ok(self.masters.lock().expect("masters poisoned").clone())
    }

    async fn register_master(&self, address: &str) -> BackendResult<()> {
        let mut masters = self.masters.lock().expect("masters poisoned");
        if !masters.iter().any(|existing| existing == address) {
            masters.push(address.to_string());
        }
        Ok(())
    }
}
