//! Client: job submission, status polling, and push dispatch.
//!
//! The client wraps a [`Session`] and layers the pending-job tables on
//! top of it: a FIFO per connection for submits awaiting `JOB_CREATED`,
//! a handle-keyed table for bound jobs, and an in-flight table for
//! status polls. All tables hold weak task references; the caller owns
//! every [`Task`].
//!
//! Two completion models share the same machinery:
//!
//! - blocking (default): [`Client::do_work`] and
//!   [`Client::do_background`] run to their outcome.
//! - cooperative: [`Client::add_task`] plus a
//!   `run_tasks` / `wait` / `run_tasks` loop driven by the caller,
//!   using the canonical `should_continue` predicate.

mod task;

pub use task::{CalendarTime, JobHandle, JobStatus, Priority, SubmitMode, Task, TaskState};

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;

use task::{TaskInner, TaskRef};

use crate::error::{Error, Result};
use crate::hooks::Verbosity;
use crate::protocol::{Command, Packet};
use crate::session::{ConnId, Session, SessionOption};

/// Callback for `WORK_DATA` / `WORK_WARNING` pushes.
pub type WorkFn = Box<dyn FnMut(&JobHandle, &[u8])>;

/// Submit options beyond function name and workload.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Unique id for server-side coalescing; generated when absent.
    pub unique: Option<String>,
    /// Queue priority.
    pub priority: Priority,
    /// Foreground, background, epoch, or calendar submit.
    pub mode: SubmitMode,
    /// Pin the submit to one connection instead of round-robin.
    pub conn: Option<ConnId>,
}

enum StatusSlot {
    InFlight(ConnId),
    Done(JobStatus),
}

/// A job-queue client over one session.
pub struct Client {
    session: Session,
    next_conn: usize,
    tasks: Vec<TaskRef>,
    by_handle: HashMap<JobHandle, TaskRef>,
    awaiting_created: HashMap<ConnId, VecDeque<TaskRef>>,
    status_polls: HashMap<JobHandle, StatusSlot>,
    on_data: Option<WorkFn>,
    on_warning: Option<WorkFn>,
}

impl Client {
    /// Create a client with a fresh default session.
    pub fn new() -> Self {
        Self::with_session(Session::new())
    }

    /// Create a client over an existing session.
    pub fn with_session(session: Session) -> Self {
        Self {
            session,
            next_conn: 0,
            tasks: Vec::new(),
            by_handle: HashMap::new(),
            awaiting_created: HashMap::new(),
            status_polls: HashMap::new(),
            on_data: None,
            on_warning: None,
        }
    }

    /// The underlying session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Mutable access to the underlying session.
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Register a job server; lazy-connected on first send.
    pub fn add_server(&mut self, host: impl Into<String>, port: u16) -> ConnId {
        self.session.add_server(host, port)
    }

    /// Set the session poll timeout; −1 means infinite.
    pub fn set_timeout(&mut self, timeout_ms: i32) {
        self.session.set_timeout(timeout_ms);
    }

    /// Toggle a session option.
    pub fn set_option(&mut self, option: SessionOption, value: bool) {
        self.session.set_option(option, value);
    }

    /// Ping every server with `workload` and verify the echoes.
    pub fn echo(&mut self, workload: &[u8]) -> Result<()> {
        self.session.echo(workload)
    }

    /// Install the `WORK_DATA` callback.
    pub fn set_data_fn(&mut self, f: WorkFn) {
        self.on_data = Some(f);
    }

    /// Install the `WORK_WARNING` callback.
    pub fn set_warning_fn(&mut self, f: WorkFn) {
        self.on_warning = Some(f);
    }

    // ------------------------------------------------------------------
    // Submit
    // ------------------------------------------------------------------

    /// Submit a job and start tracking it.
    ///
    /// The submit packet is queued and flushed best-effort; the task is
    /// not considered submitted until `JOB_CREATED` binds a handle. In
    /// cooperative mode drive the task with [`Client::run_tasks`].
    pub fn add_task(
        &mut self,
        function: &str,
        workload: impl Into<Bytes>,
        options: TaskOptions,
    ) -> Result<Task> {
        if self.session.con_count() == 0 {
            self.session
                .set_error("gearman_client_add_task", "no servers configured");
            return Err(Error::NotConnected);
        }

        let unique = options.unique.unwrap_or_else(generate_unique);
        let command = submit_command(options.priority, options.mode);
        let packet = build_submit_packet(command, function, &unique, options.mode, workload.into())?;

        let conn = match options.conn.filter(|id| self.session.connection(*id).is_some()) {
            Some(id) => id,
            None => self.pick_connection(),
        };

        let task = Task::new(
            function.to_string(),
            unique,
            options.priority,
            options.mode,
            conn,
        );
        self.tasks.push(task.downgrade());
        self.awaiting_created
            .entry(conn)
            .or_default()
            .push_back(task.downgrade());

        self.session.track_packet();
        match self.session.send_packet(conn, packet, true) {
            Ok(()) | Err(Error::IoWait) => Ok(task),
            Err(e) => {
                self.session.untrack_packet();
                self.session.capture_errno(&e);
                self.session
                    .set_error("gearman_client_add_task", &e.to_string());
                Err(e)
            }
        }
    }

    fn pick_connection(&mut self) -> ConnId {
        let ids = self.session.conn_ids();
        let id = ids[self.next_conn % ids.len()];
        self.next_conn = self.next_conn.wrapping_add(1);
        id
    }

    /// Submit and block until the task reaches a terminal state.
    /// Inspect the returned task for the outcome and result payload.
    pub fn do_work(
        &mut self,
        function: &str,
        workload: impl Into<Bytes>,
        priority: Priority,
    ) -> Result<Task> {
        let task = self.add_task(
            function,
            workload,
            TaskOptions {
                priority,
                mode: SubmitMode::Foreground,
                ..TaskOptions::default()
            },
        )?;
        self.run_blocking(|client| client.run_tasks())?;
        Ok(task)
    }

    /// Submit detached work and block until the server assigns a
    /// handle. A foreground `mode` is treated as plain background.
    pub fn do_background(
        &mut self,
        function: &str,
        workload: impl Into<Bytes>,
        priority: Priority,
        mode: SubmitMode,
    ) -> Result<JobHandle> {
        let mode = match mode {
            SubmitMode::Foreground => SubmitMode::Background,
            other => other,
        };
        let task = self.add_task(
            function,
            workload,
            TaskOptions {
                priority,
                mode,
                ..TaskOptions::default()
            },
        )?;
        self.run_blocking(|client| client.run_tasks())?;
        task.handle().ok_or(Error::UnknownState)
    }

    // ------------------------------------------------------------------
    // Cooperative pump
    // ------------------------------------------------------------------

    /// Drive every tracked task forward.
    ///
    /// Returns `Ok` when all live tasks are settled: terminal for
    /// foreground tasks, handle-bound for the rest. In cooperative mode
    /// returns `IoWait` once every connection would block; call
    /// `Session::wait` and retry.
    pub fn run_tasks(&mut self) -> Result<()> {
        loop {
            self.prune_tasks();

            if let Err(e) = self.session.flush_all() {
                if !e.is_io_wait() {
                    return self.fail("gearman_client_run_tasks", e);
                }
            }

            while let Some(id) = self.session.ready() {
                self.pump_conn(id)?;
            }

            if self.all_settled() {
                return Ok(());
            }

            let expecting = self.expecting_conns();
            if expecting.is_empty() {
                // Unsettled tasks whose connections are gone can never
                // make progress.
                self.session.set_error(
                    "gearman_client_run_tasks",
                    "tracked tasks have no driveable connection",
                );
                return Err(Error::NoActiveFds);
            }
            for id in expecting {
                self.pump_conn(id)?;
            }

            if self.all_settled() {
                return Ok(());
            }
            if self.session.is_non_blocking() {
                return Err(Error::IoWait);
            }
        }
    }

    /// Receive and dispatch packets on one connection until it settles
    /// or would block.
    fn pump_conn(&mut self, id: ConnId) -> Result<()> {
        loop {
            if !self.conn_expects(id) {
                return Ok(());
            }
            match self.session.recv_packet(id) {
                Ok(packet) => {
                    if let Err(e) = self.process_packet(id, packet) {
                        return self.fail("gearman_client_run_tasks", e);
                    }
                }
                Err(Error::IoWait) => return Ok(()),
                Err(e) => return self.fail("gearman_client_run_tasks", e),
            }
        }
    }

    fn fail<T>(&mut self, tag: &str, e: Error) -> Result<T> {
        self.session.capture_errno(&e);
        self.session.set_error(tag, &e.to_string());
        Err(e)
    }

    /// Connections that still owe this client a packet.
    fn expecting_conns(&self) -> Vec<ConnId> {
        self.session
            .conn_ids()
            .into_iter()
            .filter(|id| self.conn_expects(*id))
            .collect()
    }

    fn conn_expects(&self, id: ConnId) -> bool {
        if self
            .awaiting_created
            .get(&id)
            .is_some_and(|queue| !queue.is_empty())
        {
            return true;
        }
        if self.status_polls.values().any(
            |slot| matches!(slot, StatusSlot::InFlight(conn) if *conn == id),
        ) {
            return true;
        }
        self.by_handle.values().any(|weak| {
            weak.upgrade().is_some_and(|task| {
                let task = task.borrow();
                task.conn == Some(id) && task.mode.is_foreground() && !task.state.is_terminal()
            })
        })
    }

    fn all_settled(&self) -> bool {
        self.tasks.iter().all(|weak| match weak.upgrade() {
            None => true,
            Some(task) => {
                let task = task.borrow();
                if task.mode.is_foreground() {
                    task.state.is_terminal()
                } else {
                    task.state != TaskState::Pending
                }
            }
        })
    }

    fn prune_tasks(&mut self) {
        // The per-connection FIFO queues are intentionally not pruned:
        // a dead entry still matches the JOB_CREATED the server owes,
        // keeping later binds aligned.
        self.tasks.retain(|weak| weak.strong_count() > 0);
        self.by_handle.retain(|_, weak| weak.strong_count() > 0);
    }

    // ------------------------------------------------------------------
    // Status polling
    // ------------------------------------------------------------------

    /// Poll the status of a job by handle.
    ///
    /// `known == false` means the server no longer has a record of the
    /// job; that is the poll loop's termination signal. Resumable in
    /// cooperative mode: on `IoWait`, `wait()` and call again with the
    /// same handle.
    pub fn job_status(&mut self, handle: &JobHandle) -> Result<JobStatus> {
        if let Some(StatusSlot::Done(status)) = self.status_polls.get(handle) {
            let status = *status;
            self.status_polls.remove(handle);
            return Ok(status);
        }

        if !self.status_polls.contains_key(handle) {
            if self.session.con_count() == 0 {
                self.session
                    .set_error("gearman_client_job_status", "no servers configured");
                return Err(Error::NotConnected);
            }

            let conn = self
                .by_handle
                .get(handle)
                .and_then(|weak| weak.upgrade())
                .and_then(|task| task.borrow().conn)
                .filter(|id| self.session.connection(*id).is_some())
                .unwrap_or_else(|| self.pick_connection());

            let packet = Packet::request(Command::GetStatus, &[handle.as_bytes()], Bytes::new())?;
            self.session.track_packet();
            match self.session.send_packet(conn, packet, true) {
                Ok(()) | Err(Error::IoWait) => {}
                Err(e) => {
                    self.session.untrack_packet();
                    return self.fail("gearman_client_job_status", e);
                }
            }
            self.status_polls
                .insert(handle.clone(), StatusSlot::InFlight(conn));
        }

        self.pump_status(handle)
    }

    fn pump_status(&mut self, handle: &JobHandle) -> Result<JobStatus> {
        loop {
            match self.status_polls.get(handle) {
                Some(StatusSlot::Done(status)) => {
                    let status = *status;
                    self.status_polls.remove(handle);
                    return Ok(status);
                }
                Some(StatusSlot::InFlight(conn)) => {
                    let conn = *conn;
                    if let Err(e) = self.session.flush_all() {
                        if !e.is_io_wait() {
                            self.status_polls.remove(handle);
                            return self.fail("gearman_client_job_status", e);
                        }
                    }
                    match self.session.recv_packet(conn) {
                        Ok(packet) => {
                            if let Err(e) = self.process_packet(conn, packet) {
                                self.status_polls.remove(handle);
                                return self.fail("gearman_client_job_status", e);
                            }
                        }
                        Err(Error::IoWait) => return Err(Error::IoWait),
                        Err(e) => {
                            self.status_polls.remove(handle);
                            return self.fail("gearman_client_job_status", e);
                        }
                    }
                }
                None => return Err(Error::UnknownState),
            }
        }
    }

    // ------------------------------------------------------------------
    // Push dispatch
    // ------------------------------------------------------------------

    /// Dispatch one inbound packet: bind `JOB_CREATED`, route `WORK_*`
    /// pushes by handle, resolve status polls, surface `ERROR`.
    fn process_packet(&mut self, conn: ConnId, mut packet: Packet) -> Result<()> {
        match packet.command() {
            Command::JobCreated => {
                let handle = JobHandle::new(packet.arg_str(0)?.to_string());
                if handle.as_str().is_empty() {
                    self.session
                        .set_error("gearman_client_run_tasks", "empty job handle");
                    return Err(Error::InvalidPacket);
                }
                self.bind_created(conn, handle);
                Ok(())
            }

            Command::WorkStatus => {
                let handle = JobHandle::new(packet.arg_str(0)?.to_string());
                let numerator = packet.arg_u32(1)?;
                let denominator = packet.arg_u32(2)?;
                match self.task_for(&handle) {
                    Some(task) => {
                        let mut task = task.borrow_mut();
                        task.known = true;
                        task.running = true;
                        task.numerator = numerator;
                        task.denominator = denominator;
                    }
                    None => self.drop_push(Command::WorkStatus, &handle),
                }
                Ok(())
            }

            Command::WorkData => {
                let handle = JobHandle::new(packet.arg_str(0)?.to_string());
                let data = packet.take_data();
                match self.task_for(&handle) {
                    Some(task) => {
                        if let Some(f) = self.on_data.as_mut() {
                            f(&handle, &data);
                        }
                        task.borrow_mut().data.push(data);
                    }
                    None => self.drop_push(Command::WorkData, &handle),
                }
                Ok(())
            }

            Command::WorkWarning => {
                let handle = JobHandle::new(packet.arg_str(0)?.to_string());
                let data = packet.take_data();
                match self.task_for(&handle) {
                    Some(_) => {
                        if let Some(f) = self.on_warning.as_mut() {
                            f(&handle, &data);
                        }
                    }
                    None => self.drop_push(Command::WorkWarning, &handle),
                }
                Ok(())
            }

            Command::WorkComplete => {
                let handle = JobHandle::new(packet.arg_str(0)?.to_string());
                let data = packet.take_data();
                match self.task_for(&handle) {
                    Some(task) => {
                        {
                            let mut task = task.borrow_mut();
                            task.result = Some(data);
                            task.state = TaskState::Complete;
                            task.running = false;
                            task.known = false;
                        }
                        self.by_handle.remove(&handle);
                    }
                    None => self.drop_push(Command::WorkComplete, &handle),
                }
                Ok(())
            }

            Command::WorkFail => {
                let handle = JobHandle::new(packet.arg_str(0)?.to_string());
                match self.task_for(&handle) {
                    Some(task) => {
                        {
                            let mut task = task.borrow_mut();
                            task.state = TaskState::Failed;
                            task.running = false;
                            task.known = false;
                        }
                        self.by_handle.remove(&handle);
                    }
                    None => self.drop_push(Command::WorkFail, &handle),
                }
                Ok(())
            }

            Command::WorkException => {
                let handle = JobHandle::new(packet.arg_str(0)?.to_string());
                let data = packet.take_data();
                match self.task_for(&handle) {
                    Some(task) => {
                        {
                            let mut task = task.borrow_mut();
                            task.exception = Some(data);
                            task.state = TaskState::Exception;
                            task.running = false;
                            task.known = false;
                        }
                        self.by_handle.remove(&handle);
                    }
                    None => self.drop_push(Command::WorkException, &handle),
                }
                Ok(())
            }

            Command::StatusRes => {
                let handle = JobHandle::new(packet.arg_str(0)?.to_string());
                let status = JobStatus {
                    known: packet.arg_u32(1)? != 0,
                    running: packet.arg_u32(2)? != 0,
                    numerator: packet.arg_u32(3)?,
                    denominator: packet.arg_u32(4)?,
                };

                if let Some(task) = self.task_for(&handle) {
                    let mut task = task.borrow_mut();
                    task.known = status.known;
                    task.running = status.running;
                    task.numerator = status.numerator;
                    task.denominator = status.denominator;
                }
                if let Some(slot) = self.status_polls.get_mut(&handle) {
                    if matches!(slot, StatusSlot::InFlight(_)) {
                        *slot = StatusSlot::Done(status);
                        self.session.untrack_packet();
                    }
                }
                Ok(())
            }

            Command::Error => {
                let code = packet.arg_str(0)?.to_string();
                let text = packet.arg_str(1)?.to_string();
                Err(Error::ServerError { code, text })
            }

            // Anything else cannot legally reach the client role.
            other => {
                self.session.log(
                    Verbosity::Debug,
                    &format!("unexpected {other} packet in client role"),
                );
                Err(Error::UnknownState)
            }
        }
    }

    fn bind_created(&mut self, conn: ConnId, handle: JobHandle) {
        // One JOB_CREATED consumes exactly one queue entry, dead or
        // alive, to keep later binds aligned with the server's FIFO.
        let popped = self.awaiting_created.entry(conn).or_default().pop_front();
        match popped {
            None => {
                self.session.log(
                    Verbosity::Debug,
                    &format!("JOB_CREATED with no waiting submit: {handle}"),
                );
            }
            Some(weak) => match weak.upgrade() {
                None => {
                    self.session.log(
                        Verbosity::Debug,
                        &format!("JOB_CREATED for dropped task: {handle}"),
                    );
                    self.session.untrack_packet();
                }
                Some(task) => {
                    {
                        let mut task = task.borrow_mut();
                        task.handle = Some(handle.clone());
                        task.state = TaskState::Created;
                        task.known = true;
                    }
                    self.by_handle.insert(handle, weak);
                    self.session.untrack_packet();
                }
            },
        }
    }

    fn task_for(&mut self, handle: &JobHandle) -> Option<std::rc::Rc<std::cell::RefCell<TaskInner>>> {
        match self.by_handle.get(handle) {
            Some(weak) => match weak.upgrade() {
                Some(task) => Some(task),
                None => {
                    self.by_handle.remove(handle);
                    None
                }
            },
            None => None,
        }
    }

    fn drop_push(&self, command: Command, handle: &JobHandle) {
        self.session.log(
            Verbosity::Debug,
            &format!("{command} for unknown job handle {handle}, dropped"),
        );
    }

    /// Run a closure in blocking mode, restoring the stored mode on
    /// every exit path.
    fn run_blocking<T>(&mut self, f: impl FnOnce(&mut Client) -> Result<T>) -> Result<T> {
        self.session.push_blocking();
        let result = f(self);
        self.session.pop_non_blocking();
        result
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session", &self.session)
            .field("tracked_tasks", &self.tasks.len())
            .field("bound_handles", &self.by_handle.len())
            .finish()
    }
}

fn submit_command(priority: Priority, mode: SubmitMode) -> Command {
    match mode {
        SubmitMode::Epoch(_) => Command::SubmitJobEpoch,
        SubmitMode::Calendar(_) => Command::SubmitJobSched,
        SubmitMode::Background => match priority {
            Priority::Low => Command::SubmitJobLowBg,
            Priority::Normal => Command::SubmitJobBg,
            Priority::High => Command::SubmitJobHighBg,
        },
        SubmitMode::Foreground => match priority {
            Priority::Low => Command::SubmitJobLow,
            Priority::Normal => Command::SubmitJob,
            Priority::High => Command::SubmitJobHigh,
        },
    }
}

fn build_submit_packet(
    command: Command,
    function: &str,
    unique: &str,
    mode: SubmitMode,
    workload: Bytes,
) -> Result<Packet> {
    let mut args: Vec<Vec<u8>> = vec![function.as_bytes().to_vec(), unique.as_bytes().to_vec()];
    match mode {
        SubmitMode::Epoch(when) => args.push(when.to_string().into_bytes()),
        SubmitMode::Calendar(at) => {
            args.push(at.minute.to_string().into_bytes());
            args.push(at.hour.to_string().into_bytes());
            args.push(at.day_of_month.to_string().into_bytes());
            args.push(at.month.to_string().into_bytes());
            args.push(at.day_of_week.to_string().into_bytes());
        }
        SubmitMode::Foreground | SubmitMode::Background => {}
    }
    let refs: Vec<&[u8]> = args.iter().map(|a| a.as_slice()).collect();
    Packet::request(command, &refs, workload)
}

/// Fallback unique id: system time mixed with the process id.
fn generate_unique() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = std::process::id() as u64;
    format!("{:016x}", nanos.wrapping_mul(0x517cc1b727220a95) ^ pid)
}
