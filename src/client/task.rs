//! Tracked jobs and their lifecycle.
//!
//! A [`Task`] is the caller-owned handle to one submitted job. The
//! client keeps only weak back-references (by job handle, and FIFO per
//! connection while the submit awaits `JOB_CREATED`), so dropping a
//! `Task` silently stops tracking it.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use bytes::Bytes;

use crate::session::ConnId;

/// Job priority, mapped to the SUBMIT_JOB command family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Dispatched after all other priorities.
    Low,
    /// The default queue.
    #[default]
    Normal,
    /// Dispatched before all other priorities.
    High,
}

/// Calendar schedule for SUBMIT_JOB_SCHED, cron-style fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarTime {
    /// Minute, 0–59.
    pub minute: u8,
    /// Hour, 0–23.
    pub hour: u8,
    /// Day of month, 1–31.
    pub day_of_month: u8,
    /// Month, 1–12.
    pub month: u8,
    /// Day of week, 0–6 with 0 = Sunday.
    pub day_of_week: u8,
}

/// When and how a submitted job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubmitMode {
    /// Run as soon as a worker grabs it; terminal `WORK_*` pushes are
    /// delivered on the originating connection.
    #[default]
    Foreground,
    /// Detached: observed only through `GET_STATUS` until the server
    /// forgets the job.
    Background,
    /// Background, eligible to run at the given Unix timestamp.
    Epoch(u64),
    /// Background, eligible to run on a calendar schedule.
    Calendar(CalendarTime),
}

impl SubmitMode {
    /// Foreground jobs receive terminal pushes; everything else is
    /// polled.
    #[inline]
    pub fn is_foreground(self) -> bool {
        matches!(self, SubmitMode::Foreground)
    }
}

/// Server-assigned job handle: opaque ASCII, unique per server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(String);

impl JobHandle {
    pub(crate) fn new(handle: String) -> Self {
        Self(handle)
    }

    /// Handle as text.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Handle as the bytes that go on the wire.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Submitted but not yet acknowledged; no handle bound.
    Pending,
    /// `JOB_CREATED` bound a handle.
    Created,
    /// Terminal: the result payload arrived.
    Complete,
    /// Terminal: the server reported failure.
    Failed,
    /// Terminal: the worker raised an exception.
    Exception,
}

impl TaskState {
    /// True for the three terminal states.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Complete | TaskState::Failed | TaskState::Exception
        )
    }
}

/// Point-in-time status of a background job, from `STATUS_RES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStatus {
    /// Whether the server still has a record of the job. `false` is
    /// the status-poll loop's termination signal.
    pub known: bool,
    /// Whether a worker is currently running the job.
    pub running: bool,
    /// Progress numerator, as reported by the worker.
    pub numerator: u32,
    /// Progress denominator.
    pub denominator: u32,
}

pub(crate) struct TaskInner {
    pub function: String,
    pub unique: String,
    pub priority: Priority,
    pub mode: SubmitMode,
    pub conn: Option<ConnId>,
    pub handle: Option<JobHandle>,
    pub state: TaskState,
    pub known: bool,
    pub running: bool,
    pub numerator: u32,
    pub denominator: u32,
    pub result: Option<Bytes>,
    pub exception: Option<Bytes>,
    pub data: Vec<Bytes>,
}

pub(crate) type TaskRef = Weak<RefCell<TaskInner>>;

/// Caller-owned handle to a submitted job.
#[derive(Clone)]
pub struct Task {
    inner: Rc<RefCell<TaskInner>>,
}

impl Task {
    pub(crate) fn new(
        function: String,
        unique: String,
        priority: Priority,
        mode: SubmitMode,
        conn: ConnId,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(TaskInner {
                function,
                unique,
                priority,
                mode,
                conn: Some(conn),
                handle: None,
                state: TaskState::Pending,
                known: false,
                running: false,
                numerator: 0,
                denominator: 0,
                result: None,
                exception: None,
                data: Vec::new(),
            })),
        }
    }

    pub(crate) fn downgrade(&self) -> TaskRef {
        Rc::downgrade(&self.inner)
    }

    /// Function name the job was submitted under.
    pub fn function(&self) -> String {
        self.inner.borrow().function.clone()
    }

    /// Unique id the job was submitted under.
    pub fn unique(&self) -> String {
        self.inner.borrow().unique.clone()
    }

    /// Submit priority.
    pub fn priority(&self) -> Priority {
        self.inner.borrow().priority
    }

    /// Submit mode.
    pub fn mode(&self) -> SubmitMode {
        self.inner.borrow().mode
    }

    /// Connection the submit went out on.
    pub fn connection(&self) -> Option<ConnId> {
        self.inner.borrow().conn
    }

    /// Server-assigned handle, once `JOB_CREATED` has bound one.
    pub fn handle(&self) -> Option<JobHandle> {
        self.inner.borrow().handle.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.inner.borrow().state
    }

    /// True once the task reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Last observed progress fraction.
    pub fn progress(&self) -> (u32, u32) {
        let inner = self.inner.borrow();
        (inner.numerator, inner.denominator)
    }

    /// Whether the server still knows the job (from the last status
    /// observation).
    pub fn is_known(&self) -> bool {
        self.inner.borrow().known
    }

    /// Whether a worker was running the job at the last observation.
    pub fn is_running(&self) -> bool {
        self.inner.borrow().running
    }

    /// Take the `WORK_COMPLETE` result payload, if any.
    pub fn take_result(&self) -> Option<Bytes> {
        self.inner.borrow_mut().result.take()
    }

    /// Take the `WORK_EXCEPTION` payload, if any.
    pub fn take_exception(&self) -> Option<Bytes> {
        self.inner.borrow_mut().exception.take()
    }

    /// Take the intermediate `WORK_DATA` chunks received so far.
    pub fn take_data(&self) -> Vec<Bytes> {
        std::mem::take(&mut self.inner.borrow_mut().data)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Task")
            .field("function", &inner.function)
            .field("unique", &inner.unique)
            .field("handle", &inner.handle)
            .field("state", &inner.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(
            "reverse".to_string(),
            "uid-1".to_string(),
            Priority::Normal,
            SubmitMode::Background,
            ConnId::default(),
        )
    }

    #[test]
    fn test_new_task_is_pending() {
        let task = task();
        assert_eq!(task.state(), TaskState::Pending);
        assert!(task.handle().is_none());
        assert!(!task.is_finished());
        assert_eq!(task.progress(), (0, 0));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Complete.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Exception.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Created.is_terminal());
    }

    #[test]
    fn test_weak_tracking_drops_with_task() {
        let task = task();
        let weak = task.downgrade();
        assert!(weak.upgrade().is_some());
        drop(task);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_foreground_predicate() {
        assert!(SubmitMode::Foreground.is_foreground());
        assert!(!SubmitMode::Background.is_foreground());
        assert!(!SubmitMode::Epoch(0).is_foreground());
    }

    #[test]
    fn test_take_result_consumes() {
        let task = task();
        task.inner.borrow_mut().result = Some(Bytes::from_static(b"!olleH"));
        assert_eq!(task.take_result().unwrap(), Bytes::from_static(b"!olleH"));
        assert!(task.take_result().is_none());
    }

    #[test]
    fn test_job_handle_text() {
        let handle = JobHandle::new("H:lap:1".to_string());
        assert_eq!(handle.as_str(), "H:lap:1");
        assert_eq!(handle.as_bytes(), b"H:lap:1");
        assert_eq!(handle.to_string(), "H:lap:1");
    }
}
