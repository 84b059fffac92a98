//! SessionCore (C4): the state machine and concurrency model around one
//! PTY-attached process.
//!
//! One reader thread blocks on `PtyHost::read`, feeding output to the
//! recording writer, the terminal model, and any live subscribers (all
//! under one lock, see `RecordingState`, so a newly-registered subscriber's
//! replay-then-live cutover is gapless). One writer thread drains a command
//! channel in receive order, giving FIFO-per-session ordering for `/input`
//! and `/resize` without needing a `select()` loop shared with the reader.
//! A third, short-lived thread implements the graceful-then-forceful kill
//! protocol when asked to terminate the session.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jiff::Timestamp;
use nix::sys::signal::Signal;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::heuristics::InputDetectionHeuristics;
use crate::protocol::{CreateSessionRequest, SessionInfo, SessionStatus};
use crate::pty::{PtyHost, DEFAULT_TERM};
use crate::recording::RecordingWriter;
use crate::terminal::{BufferSnapshot, TerminalModel};

const GRACE_PERIOD: Duration = Duration::from_secs(3);
const HARD_KILL_DEADLINE: Duration = Duration::from_secs(10);
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

/// One message pushed to a live `/stream` subscriber.
#[derive(Debug, Clone)]
pub enum SubscriberMsg {
    /// A raw recording-event JSON line, ready to wrap in an SSE `data:` frame.
    Event(String),
    Exit(i32),
}

enum Command {
    Input(Vec<u8>),
    Resize(u16, u16),
}

/// Recording file append and subscriber fan-out share one lock so a new
/// subscriber's "replay up to file length L, then go live" boundary can
/// never race a concurrent producer write (see module docs).
struct RecordingState {
    writer: RecordingWriter,
    subscribers: Vec<SyncSender<SubscriberMsg>>,
}

impl RecordingState {
    fn publish(&mut self, msg: &SubscriberMsg) {
        self.subscribers.retain_mut(|tx| match tx.try_send(msg.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("subscriber channel full, dropping slow consumer");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

pub struct SessionDirs {
    pub root: PathBuf,
}

impl SessionDirs {
    pub fn new(control_path: &Path, id: &str) -> Self {
        Self {
            root: control_path.join(id),
        }
    }

    pub fn meta_path(&self) -> PathBuf {
        self.root.join("meta.json")
    }

    pub fn stream_out_path(&self) -> PathBuf {
        self.root.join("stream.out")
    }

    pub fn stdin_fifo_path(&self) -> PathBuf {
        self.root.join("stdin.fifo")
    }

    pub fn exit_path(&self) -> PathBuf {
        self.root.join("exit")
    }
}

pub struct Session {
    pub id: String,
    dirs: SessionDirs,
    host: Arc<PtyHost>,
    terminal: Mutex<TerminalModel>,
    recording: Mutex<RecordingState>,
    heuristics: Mutex<InputDetectionHeuristics>,
    command_tx: Sender<Command>,
    status: Mutex<SessionStatus>,
    exit_code: AtomicI32,
    killed: AtomicBool,
    recording_truncated: AtomicBool,
    started_at: Timestamp,
    command: Vec<String>,
    working_dir: String,
    env: HashMap<String, String>,
    name: String,
    term: String,
}

const NO_EXIT_CODE: i32 = i32::MIN;

impl Session {
    pub fn create(control_path: &Path, req: CreateSessionRequest) -> Result<Arc<Self>> {
        let mut req = req;
        if req.command.is_empty() {
            return Err(Error::BadRequest("command must not be empty".to_string()));
        }
        if let Some(dir) = &req.working_dir {
            if !Path::new(dir).is_dir() {
                return Err(Error::BadRequest(format!("working directory does not exist: {dir}")));
            }
        }

        // When this server process was itself invoked as a child wrapper
        // attaching to an existing session (`TTY_SESSION_ID` set on our own
        // environment), record it into this session's `env` map for the
        // wrapper's own bookkeeping; the core never acts on it otherwise.
        if let Ok(wrapper_session_id) = std::env::var("TTY_SESSION_ID") {
            req.env
                .entry("TTY_SESSION_ID".to_string())
                .or_insert(wrapper_session_id);
        }

        let id = Uuid::new_v4().to_string();
        let dirs = SessionDirs::new(control_path, &id);
        fs::create_dir_all(&dirs.root)?;

        let working_dir = req
            .working_dir
            .unwrap_or_else(|| std::env::current_dir().map_or_else(|_| "/".to_string(), |p| p.to_string_lossy().into_owned()));
        let term = req.term.unwrap_or_else(|| DEFAULT_TERM.to_string());
        let name = req.name.unwrap_or_else(|| {
            req.command[0]
                .rsplit('/')
                .next()
                .unwrap_or("session")
                .to_string()
        });

        nix::unistd::mkfifo(&dirs.stdin_fifo_path(), nix::sys::stat::Mode::S_IRUSR | nix::sys::stat::Mode::S_IWUSR)
            .or_else(|err| if err == nix::errno::Errno::EEXIST { Ok(()) } else { Err(err) })?;

        let host = PtyHost::spawn(&req.command, &req.env, Some(&working_dir), req.width, req.height, &term)
            .map_err(|err| Error::SpawnFailure(err.to_string()))?;
        let pid = host.pid();

        let writer = RecordingWriter::create(
            &dirs.stream_out_path(),
            &id,
            req.width,
            req.height,
            &req.command,
            Some(name.clone()),
            req.env.clone(),
        )?;

        let (command_tx, command_rx) = mpsc::channel();

        let session = Arc::new(Self {
            id: id.clone(),
            dirs,
            host: Arc::new(host),
            terminal: Mutex::new(TerminalModel::new(req.height, req.width)),
            recording: Mutex::new(RecordingState {
                writer,
                subscribers: Vec::new(),
            }),
            heuristics: Mutex::new(InputDetectionHeuristics::new()),
            command_tx,
            status: Mutex::new(SessionStatus::Running),
            exit_code: AtomicI32::new(NO_EXIT_CODE),
            killed: AtomicBool::new(false),
            recording_truncated: AtomicBool::new(false),
            started_at: Timestamp::now(),
            command: req.command,
            working_dir,
            env: req.env,
            name,
            term,
        });

        session.write_meta(Some(pid as u32))?;
        Self::spawn_reader_thread(&session);
        Self::spawn_writer_thread(&session, command_rx);
        Self::spawn_stdin_fifo_thread(&session);

        info!(session_id = %session.id, pid, "session spawned");
        Ok(session)
    }

    fn write_meta(&self, pid: Option<u32>) -> Result<()> {
        let status = *self.status.lock().unwrap();
        let exit_code = match self.exit_code.load(Ordering::SeqCst) {
            NO_EXIT_CODE => None,
            code => Some(code),
        };
        let (rows, cols) = self.terminal.lock().unwrap().size();
        let info = SessionInfo {
            id: self.id.clone(),
            command: self.command.clone(),
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            width: cols,
            height: rows,
            term: self.term.clone(),
            name: self.name.clone(),
            started_at: self.started_at,
            status,
            exit_code,
            pid: if status == SessionStatus::Running { pid } else { None },
            waiting: self.heuristics.lock().unwrap().clone().check_waiting_for_input(),
            recording_truncated: self.recording_truncated.load(Ordering::SeqCst),
        };

        let json = serde_json::to_string_pretty(&info)?;
        let temp = NamedTempFile::new_in(&self.dirs.root)?;
        fs::write(temp.path(), json)?;
        temp.persist(self.dirs.meta_path())
            .map_err(|err| Error::IoFailure(err.to_string()))?;
        Ok(())
    }

    pub fn info(&self) -> Result<SessionInfo> {
        let status = *self.status.lock().unwrap();
        let exit_code = match self.exit_code.load(Ordering::SeqCst) {
            NO_EXIT_CODE => None,
            code => Some(code),
        };
        let (rows, cols) = self.terminal.lock().unwrap().size();
        Ok(SessionInfo {
            id: self.id.clone(),
            command: self.command.clone(),
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            width: cols,
            height: rows,
            term: self.term.clone(),
            name: self.name.clone(),
            started_at: self.started_at,
            status,
            exit_code,
            pid: (status == SessionStatus::Running).then_some(self.host.pid() as u32),
            waiting: self.heuristics.lock().unwrap().clone().check_waiting_for_input(),
            recording_truncated: self.recording_truncated.load(Ordering::SeqCst),
        })
    }

    fn spawn_reader_thread(session: &Arc<Self>) {
        let session = Arc::clone(session);
        std::thread::spawn(move || session.reader_loop());
    }

    fn reader_loop(self: Arc<Self>) {
        let mut buf = [0u8; 4096];
        loop {
            let n = match self.host.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    warn!(session_id = %self.id, %err, "pty read failed");
                    break;
                }
            };

            let data = &buf[..n];
            self.terminal.lock().unwrap().feed(data);
            self.heuristics.lock().unwrap().record_output(data);

            let mut recording = self.recording.lock().unwrap();
            match recording.writer.write_output(data) {
                Ok(Some(line)) => recording.publish(&SubscriberMsg::Event(line)),
                Ok(None) => {} // whole chunk buffered as an incomplete trailing UTF-8 sequence
                Err(err) => {
                    warn!(session_id = %self.id, %err, "failed to persist output event");
                    self.recording_truncated.store(true, Ordering::SeqCst);
                }
            }
            drop(recording);
        }

        self.finalize_exit();
    }

    fn finalize_exit(&self) {
        let exit_code = self.host.wait().unwrap_or(1);
        self.exit_code.store(exit_code, Ordering::SeqCst);
        *self.status.lock().unwrap() = SessionStatus::Exited;

        let mut recording = self.recording.lock().unwrap();
        match recording.writer.flush_pending_output() {
            Ok(Some(line)) => recording.publish(&SubscriberMsg::Event(line)),
            Ok(None) => {}
            Err(err) => warn!(session_id = %self.id, %err, "failed to flush pending output"),
        }
        match recording.writer.write_exit(exit_code) {
            Ok(line) => recording.publish(&SubscriberMsg::Event(line)),
            Err(err) => warn!(session_id = %self.id, %err, "failed to persist exit marker"),
        }
        recording.publish(&SubscriberMsg::Exit(exit_code));
        drop(recording);

        let _ = fs::write(self.dirs.exit_path(), exit_code.to_string());
        let _ = self.write_meta(Some(self.host.pid() as u32));

        info!(session_id = %self.id, exit_code, "session exited");
    }

    fn spawn_writer_thread(session: &Arc<Self>, rx: Receiver<Command>) {
        let session = Arc::clone(session);
        std::thread::spawn(move || {
            for command in rx {
                match command {
                    Command::Input(bytes) => {
                        session.heuristics.lock().unwrap().record_input();
                        if let Err(err) = session.host.write(&bytes) {
                            debug!(session_id = %session.id, %err, "write to pty failed, session likely exited");
                            continue;
                        }
                        let mut recording = session.recording.lock().unwrap();
                        if let Err(err) = recording.writer.write_input(&bytes) {
                            warn!(session_id = %session.id, %err, "failed to persist input event");
                            session.recording_truncated.store(true, Ordering::SeqCst);
                        }
                        drop(recording);
                    }
                    Command::Resize(cols, rows) => {
                        let unchanged = session.terminal.lock().unwrap().size() == (rows, cols);
                        if unchanged {
                            continue;
                        }
                        session.terminal.lock().unwrap().resize(rows, cols);
                        if let Err(err) = session.host.resize(cols, rows) {
                            debug!(session_id = %session.id, %err, "resize failed, session likely exited");
                        }
                        let mut recording = session.recording.lock().unwrap();
                        match recording.writer.write_resize(cols, rows) {
                            Ok(line) => recording.publish(&SubscriberMsg::Event(line)),
                            Err(err) => {
                                warn!(session_id = %session.id, %err, "failed to persist resize event");
                                session.recording_truncated.store(true, Ordering::SeqCst);
                            }
                        }
                        drop(recording);
                    }
                }
            }
        });
    }

    fn spawn_stdin_fifo_thread(session: &Arc<Self>) {
        let session = Arc::clone(session);
        let path = session.dirs.stdin_fifo_path();
        std::thread::spawn(move || {
            // open read+write so the FIFO never sees a writer-side EOF and
            // reads block for data instead of spinning.
            let Ok(mut file) = std::fs::File::options().read(true).write(true).open(&path) else {
                return;
            };
            let mut buf = [0u8; 4096];
            loop {
                match file.read(&mut buf) {
                    Ok(0) => std::thread::sleep(Duration::from_millis(50)),
                    Ok(n) => {
                        let _ = session.command_tx.send(Command::Input(buf[..n].to_vec()));
                    }
                    Err(_) => break,
                }
                if *session.status.lock().unwrap() == SessionStatus::Exited {
                    break;
                }
            }
        });
    }

    pub fn send_input(&self, bytes: Vec<u8>) -> Result<()> {
        if *self.status.lock().unwrap() == SessionStatus::Exited {
            return Err(Error::Conflict(format!("session {} has exited", self.id)));
        }
        self.command_tx
            .send(Command::Input(bytes))
            .map_err(|_| Error::IoFailure("session writer thread is gone".to_string()))
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if *self.status.lock().unwrap() == SessionStatus::Exited {
            return Err(Error::Conflict(format!("session {} has exited", self.id)));
        }
        self.command_tx
            .send(Command::Resize(cols, rows))
            .map_err(|_| Error::IoFailure("session writer thread is gone".to_string()))
    }

    /// Implements the graceful-then-forceful kill protocol: `SIGTERM`, a
    /// grace period, escalation to `SIGKILL`, and a hard deadline after
    /// which the session is force-marked exited even if the process
    /// somehow never reaps. Runs on a detached thread so the HTTP handler
    /// that initiated it can respond immediately.
    pub fn kill(session: &Arc<Self>) -> Result<()> {
        if session.killed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if *session.status.lock().unwrap() == SessionStatus::Exited {
            return Ok(());
        }

        session.host.signal(Signal::SIGTERM)?;
        let session = Arc::clone(session);
        std::thread::spawn(move || {
            let deadline = std::time::Instant::now() + HARD_KILL_DEADLINE;
            let grace_until = std::time::Instant::now() + GRACE_PERIOD;

            while std::time::Instant::now() < grace_until {
                if matches!(session.host.try_wait(), Ok(Some(_))) {
                    return;
                }
                std::thread::sleep(Duration::from_millis(50));
            }

            if matches!(session.host.try_wait(), Ok(None)) {
                let _ = session.host.signal(Signal::SIGKILL);
            }
            // Deliberately no wildcard-pid reap here: this process hosts many
            // sessions concurrently and a `waitpid(-1, ...)` could steal
            // another session's child exit status out from under its own
            // reader thread. Each session reaps exactly its own child via
            // `PtyHost::wait` once the reader loop sees EOF.

            while std::time::Instant::now() < deadline {
                if *session.status.lock().unwrap() == SessionStatus::Exited {
                    return;
                }
                std::thread::sleep(Duration::from_millis(50));
            }

            // Hard deadline exceeded: the reader thread should have seen
            // EOF by now; if it somehow hasn't, force the bookkeeping so
            // callers never see a session stuck "running" forever.
            if *session.status.lock().unwrap() != SessionStatus::Exited {
                warn!(session_id = %session.id, "hard kill deadline exceeded, forcing exited state");
                session.exit_code.store(137, Ordering::SeqCst);
                *session.status.lock().unwrap() = SessionStatus::Exited;
                let _ = fs::write(session.dirs.exit_path(), "137");
                let _ = session.write_meta(None);
            }
        });
        Ok(())
    }

    pub fn snapshot(&self) -> BufferSnapshot {
        self.terminal.lock().unwrap().snapshot(0)
    }

    pub fn terminal_snapshot(&self, viewport_y: u16) -> BufferSnapshot {
        self.terminal.lock().unwrap().snapshot(viewport_y)
    }

    pub fn lines(&self) -> Vec<String> {
        self.terminal.lock().unwrap().lines()
    }

    pub fn cursor_position(&self) -> (u16, u16, bool) {
        self.terminal.lock().unwrap().cursor_position()
    }

    /// Registers a live subscriber and returns the replay lines (header line
    /// first, then recording events written before registration, oldest
    /// first) alongside the channel that will receive everything written
    /// from here on. The boundary between the two is gapless because the
    /// on-disk read and the subscriber registration both happen while
    /// holding the same lock the producer holds while it writes (see
    /// `reader_loop`) — the file is read *before* the lock is released, so
    /// no line can be both replayed here and published to the channel.
    pub fn subscribe(&self) -> Result<(Vec<String>, Receiver<SubscriberMsg>)> {
        let mut recording = self.recording.lock().unwrap();
        let content = fs::read_to_string(self.dirs.stream_out_path())?;
        let replay: Vec<String> = content.lines().map(str::to_string).collect();

        let (tx, rx) = mpsc::sync_channel(SUBSCRIBER_CHANNEL_CAPACITY);
        recording.subscribers.push(tx);
        drop(recording);

        Ok((replay, rx))
    }

    pub fn is_exited(&self) -> bool {
        *self.status.lock().unwrap() == SessionStatus::Exited
    }

    pub fn pid(&self) -> i32 {
        self.host.pid()
    }

    pub fn control_dirs(&self) -> &SessionDirs {
        &self.dirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_session(control_path: &Path, command: Vec<String>) -> Arc<Session> {
        Session::create(
            control_path,
            CreateSessionRequest {
                command,
                working_dir: None,
                env: HashMap::new(),
                width: 80,
                height: 24,
                term: None,
                name: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn spawns_and_captures_output() {
        let dir = TempDir::new().unwrap();
        let session = create_test_session(dir.path(), vec!["/bin/echo".to_string(), "hi".to_string()]);

        for _ in 0..50 {
            if session.is_exited() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        assert!(session.is_exited());
        let lines = session.lines();
        assert!(lines.iter().any(|l| l.contains("hi")));
    }

    #[test]
    fn control_directory_layout_matches_contract() {
        let dir = TempDir::new().unwrap();
        let session = create_test_session(dir.path(), vec!["/bin/echo".to_string(), "x".to_string()]);
        let dirs = session.control_dirs();
        assert!(dirs.meta_path().ends_with("meta.json"));
        assert!(dirs.stream_out_path().exists());
        assert!(dirs.stdin_fifo_path().exists());
    }

    #[test]
    fn subscribe_then_input_produces_gapless_replay_plus_live() {
        let dir = TempDir::new().unwrap();
        let session = create_test_session(dir.path(), vec!["/bin/cat".to_string()]);

        session.send_input(b"abc\n".to_vec()).unwrap();
        std::thread::sleep(Duration::from_millis(150));

        let (replay, rx) = session.subscribe().unwrap();
        assert!(!replay.is_empty());

        let _ = Session::kill(&session);
        let got_exit = (0..100).any(|_| {
            if let Ok(SubscriberMsg::Exit(_)) = rx.recv_timeout(Duration::from_millis(100)) {
                return true;
            }
            false
        });
        assert!(got_exit);
    }
}
