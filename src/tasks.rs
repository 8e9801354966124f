//! Long-running task state machine (MCP tasks system).
//!
//! `working -> completed | failed | cancelled`, transitions monotonic, and a
//! terminal state is final. Terminal tasks stick around for a retention
//! window so polling clients can still collect results; tasks belonging to
//! an evicted session are purged with it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorData;
use crate::model::{JsonObject, RequestId, TaskStatus};
use crate::session::SessionId;

/// Terminal tasks are kept at least this long for result polling.
pub const TASK_RETENTION: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub session_id: SessionId,
    pub request_id: Option<RequestId>,
    pub tool_name: String,
    pub status: TaskStatus,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    terminal_at: Option<Instant>,
    pub result: Option<Value>,
    pub error: Option<ErrorData>,
    pub message: Option<String>,
    /// Cooperative cancel signal for the in-flight handler.
    pub ct: CancellationToken,
}

impl Task {
    /// Wire representation used by `tasks/get`, `tasks/list`, and the
    /// `notifications/tasks/status` payload.
    pub fn to_wire(&self) -> Value {
        let mut obj = JsonObject::new();
        obj.insert("taskId".into(), Value::from(self.id.clone()));
        obj.insert(
            "status".into(),
            serde_json::to_value(self.status).unwrap_or(Value::Null),
        );
        obj.insert("toolName".into(), Value::from(self.tool_name.clone()));
        obj.insert("createdAt".into(), Value::from(unix_secs(self.created_at)));
        obj.insert("updatedAt".into(), Value::from(unix_secs(self.updated_at)));
        if let Some(result) = &self.result {
            obj.insert("result".into(), result.clone());
        }
        if let Some(error) = &self.error {
            obj.insert(
                "error".into(),
                serde_json::to_value(error).unwrap_or(Value::Null),
            );
        }
        if let Some(message) = &self.message {
            obj.insert("message".into(), Value::from(message.clone()));
        }
        Value::Object(obj)
    }
}

fn unix_secs(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TaskError {
    #[error("Unknown task: {0}")]
    Unknown(String),
    #[error("Task {id} is not yet complete (status: working)")]
    NotTerminal { id: String },
    #[error("Task {id} is already in terminal state")]
    AlreadyTerminal { id: String },
}

type StatusCallback = Box<dyn Fn(&Task) + Send + Sync>;

/// Owns the task store. Emits a status callback after every state
/// transition; the protocol handler wires it to
/// `notifications/tasks/status` fan-out.
pub struct TaskManager {
    tasks: Mutex<HashMap<String, Task>>,
    on_status: Mutex<Option<StatusCallback>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            on_status: Mutex::new(None),
        }
    }

    pub fn set_on_status(&self, callback: impl Fn(&Task) + Send + Sync + 'static) {
        *self.on_status.lock().unwrap() = Some(Box::new(callback));
    }

    fn emit_status(&self, task: &Task) {
        if let Some(callback) = self.on_status.lock().unwrap().as_ref() {
            callback(task);
        }
    }

    /// Create a task in `working` state and return it. Also sweeps terminal
    /// tasks past the retention window.
    pub fn create(
        &self,
        session_id: SessionId,
        tool_name: &str,
        request_id: Option<RequestId>,
    ) -> Task {
        let id = uuid::Uuid::new_v4().simple().to_string()[..16].to_owned();
        let now = SystemTime::now();
        let task = Task {
            id: id.clone(),
            session_id,
            request_id,
            tool_name: tool_name.to_owned(),
            status: TaskStatus::Working,
            created_at: now,
            updated_at: now,
            terminal_at: None,
            result: None,
            error: None,
            message: None,
            ct: CancellationToken::new(),
        };
        let mut tasks = self.tasks.lock().unwrap();
        Self::sweep_retention_locked(&mut tasks);
        tasks.insert(id, task.clone());
        task
    }

    fn transition(
        &self,
        id: &str,
        apply: impl FnOnce(&mut Task),
    ) -> Result<Task, TaskError> {
        let task = {
            let mut tasks = self.tasks.lock().unwrap();
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| TaskError::Unknown(id.to_owned()))?;
            if task.status.is_terminal() {
                return Err(TaskError::AlreadyTerminal { id: id.to_owned() });
            }
            apply(task);
            task.updated_at = SystemTime::now();
            task.terminal_at = Some(Instant::now());
            task.clone()
        };
        self.emit_status(&task);
        Ok(task)
    }

    /// `working -> completed`.
    pub fn set_result(&self, id: &str, result: Value) -> Result<Task, TaskError> {
        self.transition(id, |task| {
            task.status = TaskStatus::Completed;
            task.result = Some(result);
        })
    }

    /// `working -> failed`.
    pub fn set_error(&self, id: &str, error: ErrorData) -> Result<Task, TaskError> {
        self.transition(id, |task| {
            task.status = TaskStatus::Failed;
            task.error = Some(error);
        })
    }

    /// `working -> cancelled`. Fires the task's cancellation token so the
    /// in-flight handler can unwind.
    pub fn cancel(&self, id: &str) -> Result<Task, TaskError> {
        let task = self.transition(id, |task| {
            task.status = TaskStatus::Cancelled;
            task.ct.cancel();
        })?;
        Ok(task)
    }

    pub fn get(&self, id: &str) -> Result<Task, TaskError> {
        self.tasks
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| TaskError::Unknown(id.to_owned()))
    }

    /// Result payload; only valid once terminal.
    pub fn result(&self, id: &str) -> Result<Task, TaskError> {
        let task = self.get(id)?;
        if !task.status.is_terminal() {
            return Err(TaskError::NotTerminal { id: id.to_owned() });
        }
        Ok(task)
    }

    /// Tasks belonging to one session, creation order.
    pub fn list(&self, session_id: &str) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.session_id.as_ref() == session_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Drop everything belonging to an evicted session, cancelling whatever
    /// is still in flight.
    pub fn purge_session(&self, session_id: &str) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|_, task| {
            if task.session_id.as_ref() == session_id {
                task.ct.cancel();
                false
            } else {
                true
            }
        });
    }

    fn sweep_retention_locked(tasks: &mut HashMap<String, Task>) {
        tasks.retain(|_, task| match task.terminal_at {
            Some(at) => at.elapsed() < TASK_RETENTION,
            None => true,
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        for task in tasks.values() {
            task.ct.cancel();
        }
        tasks.clear();
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn manager() -> TaskManager {
        TaskManager::new()
    }

    fn session() -> SessionId {
        SessionId::from("session-1")
    }

    #[test]
    fn test_lifecycle_working_to_completed() {
        let tasks = manager();
        let task = tasks.create(session(), "long_tool", None);
        assert_eq!(task.status, TaskStatus::Working);

        let done = tasks
            .set_result(&task.id, serde_json::json!({"answer": 42}))
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);

        let result = tasks.result(&task.id).unwrap();
        assert_eq!(result.result, Some(serde_json::json!({"answer": 42})));
    }

    #[test]
    fn test_terminal_state_is_final() {
        let tasks = manager();
        let task = tasks.create(session(), "long_tool", None);
        tasks.set_result(&task.id, Value::Null).unwrap();

        assert_eq!(
            tasks.set_error(&task.id, ErrorData::internal_error()),
            Err(TaskError::AlreadyTerminal { id: task.id.clone() })
        );
        assert_eq!(
            tasks.cancel(&task.id),
            Err(TaskError::AlreadyTerminal { id: task.id.clone() })
        );
        assert_eq!(tasks.get(&task.id).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_result_requires_terminal_state() {
        let tasks = manager();
        let task = tasks.create(session(), "long_tool", None);
        assert_eq!(
            tasks.result(&task.id),
            Err(TaskError::NotTerminal { id: task.id.clone() })
        );
    }

    #[test]
    fn test_cancel_fires_token() {
        let tasks = manager();
        let task = tasks.create(session(), "long_tool", None);
        let ct = task.ct.clone();
        assert!(!ct.is_cancelled());
        let cancelled = tasks.cancel(&task.id).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(ct.is_cancelled());
    }

    #[test]
    fn test_status_callback_fires_on_transition() {
        let tasks = manager();
        let notifications = Arc::new(AtomicUsize::new(0));
        let counter = notifications.clone();
        tasks.set_on_status(move |task| {
            assert!(task.status.is_terminal());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let task = tasks.create(session(), "long_tool", None);
        tasks.set_result(&task.id, Value::Null).unwrap();
        assert_eq!(notifications.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_purge_session_cancels_and_removes() {
        let tasks = manager();
        let mine = tasks.create(session(), "a", None);
        let other = tasks.create(SessionId::from("session-2"), "b", None);
        tasks.purge_session("session-1");
        assert!(mine.ct.is_cancelled());
        assert!(matches!(tasks.get(&mine.id), Err(TaskError::Unknown(_))));
        assert!(tasks.get(&other.id).is_ok());
    }

    #[test]
    fn test_list_is_scoped_to_session() {
        let tasks = manager();
        tasks.create(session(), "a", None);
        tasks.create(session(), "b", None);
        tasks.create(SessionId::from("session-2"), "c", None);
        assert_eq!(tasks.list("session-1").len(), 2);
        assert_eq!(tasks.list("session-2").len(), 1);
    }

    #[test]
    fn test_wire_shape() {
        let tasks = manager();
        let task = tasks.create(session(), "long_tool", Some(RequestId::Number(7)));
        let wire = task.to_wire();
        assert_eq!(wire["taskId"], task.id);
        assert_eq!(wire["status"], "working");
        assert_eq!(wire["toolName"], "long_tool");
        assert!(wire["createdAt"].is_f64());
    }
}
