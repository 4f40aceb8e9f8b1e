//! Terminal multiplexer: one PTY process per session, one session per
//! connection.
//!
//! PTY reads run on a dedicated thread per session and are bridged into a
//! Tokio task that fans output out to subscribers and the session's output
//! analyzer. Sessions leave the map when their process exits.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use portable_pty::{Child, CommandBuilder, PtySize, native_pty_system};
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, info, warn};

use super::session::TerminalSession;
use super::types::{
    MultiplexerConfig, MultiplexerStats, SessionHandle, SessionSpec, TerminalError,
    TerminalEvent, WriteOutcome,
};

const READ_BUFFER_BYTES: usize = 4096;

type SessionMap = Arc<RwLock<HashMap<String, Arc<TerminalSession>>>>;
type ConnectionMap = Arc<RwLock<HashMap<String, String>>>;

/// Messages from a PTY reader thread.
enum PtyMessage {
    Data(Vec<u8>),
    Exited {
        code: Option<u32>,
        signal: Option<String>,
    },
}

/// Incremental UTF-8 decoding that holds back sequences split across reads.
#[derive(Default)]
struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    if let Some(len) = e.error_len() {
                        out.push(char::REPLACEMENT_CHARACTER);
                        self.pending.drain(..valid + len);
                    } else {
                        self.pending.drain(..valid);
                        break;
                    }
                }
            }
        }
        out
    }
}

/// Owns every live terminal session.
pub struct TerminalMultiplexer {
    sessions: SessionMap,
    connections: ConnectionMap,
    config: MultiplexerConfig,
}

impl TerminalMultiplexer {
    pub fn new(config: MultiplexerConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            connections: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(MultiplexerConfig::default())
    }

    pub const fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    /// Spawn a process on a new PTY and bind it to `connection_id`.
    ///
    /// A session the connection already owned is destroyed once the new
    /// one is bound. Returns once the process is running; its output and
    /// exit arrive on the handle's event receiver.
    pub async fn create_session(
        &self,
        connection_id: &str,
        spec: SessionSpec,
    ) -> Result<SessionHandle, TerminalError> {
        if !spec.working_directory.is_dir() {
            return Err(TerminalError::SpawnFailed {
                reason: format!(
                    "working directory does not exist: {}",
                    spec.working_directory.display()
                ),
            });
        }

        let (program, args) = spec.command.as_ref().map_or_else(
            || (self.config.shell.clone(), Vec::new()),
            |c| (c.program.clone(), c.args.clone()),
        );

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TerminalError::Pty(e.to_string()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TerminalError::Pty(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TerminalError::Pty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&program);
        cmd.cwd(&spec.working_directory);
        for arg in &args {
            cmd.arg(arg);
        }
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TerminalError::SpawnFailed {
                reason: format!("{program}: {e}"),
            })?;
        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let session_id = uuid::Uuid::new_v4().to_string();
        let (event_tx, events) = broadcast::channel(self.config.broadcast_capacity);

        let session = Arc::new(TerminalSession::new(
            session_id.clone(),
            connection_id.to_string(),
            pid,
            event_tx,
            spec.analyzer.clone(),
            pair.master,
            writer,
            killer,
        ));

        // Bind under the connection lock so concurrent creates for one
        // connection each see the session they displace.
        let previous = {
            let mut connections = self.connections.write().await;
            self.sessions
                .write()
                .await
                .insert(session_id.clone(), Arc::clone(&session));
            connections.insert(connection_id.to_string(), session_id.clone())
        };
        if let Some(previous) = previous {
            info!(connection_id, session_id = %previous, "Replacing terminal session");
            self.destroy(&previous).await;
        }

        let (pty_tx, pty_rx) = mpsc::unbounded_channel();
        let spawned = std::thread::Builder::new()
            .name(format!("pty-{}", &session_id[..8]))
            .spawn(move || read_loop(reader, child, &pty_tx));
        if let Err(e) = spawned {
            session.kill();
            self.forget(&session).await;
            return Err(TerminalError::Pty(format!("failed to spawn reader thread: {e}")));
        }

        if let Some(analyzer) = &spec.analyzer {
            analyzer.start();
        }
        #[cfg(feature = "metrics")]
        ccfleet_core::metrics::record_terminal_sessions(1);
        tokio::spawn(pump(
            Arc::clone(&self.sessions),
            Arc::clone(&self.connections),
            Arc::clone(&session),
            pty_rx,
        ));

        info!(
            session_id = %session_id,
            connection_id,
            program = %program,
            pid = ?pid,
            cwd = %spec.working_directory.display(),
            "Terminal session created"
        );

        Ok(SessionHandle {
            session_id,
            pid,
            events,
        })
    }

    /// Forward input to a session. Input for missing or exited sessions is
    /// dropped.
    pub async fn write(&self, session_id: &str, data: &[u8]) -> WriteOutcome {
        let Some(session) = self.get(session_id).await else {
            debug!(session_id, bytes = data.len(), "Dropping input for unknown session");
            return WriteOutcome::Dropped;
        };
        if session.has_exited() {
            debug!(session_id, bytes = data.len(), "Dropping input for exited session");
            return WriteOutcome::Dropped;
        }

        let data = data.to_vec();
        let writer = Arc::clone(&session);
        match tokio::task::spawn_blocking(move || writer.write(&data)).await {
            Ok(Ok(())) => WriteOutcome::Delivered,
            Ok(Err(e)) => {
                warn!(session_id, error = %e, "Terminal write failed");
                WriteOutcome::Dropped
            }
            Err(e) => {
                warn!(session_id, error = %e, "Terminal write task failed");
                WriteOutcome::Dropped
            }
        }
    }

    /// Change a session's window size.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), TerminalError> {
        let session = self
            .get(session_id)
            .await
            .ok_or_else(|| TerminalError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        session.resize(cols, rows)?;
        debug!(session_id, cols, rows, "Terminal resized");
        Ok(())
    }

    /// Send SIGTERM to a session's process. Returns `false` if the session
    /// is unknown.
    ///
    /// The session disappears once the exit is observed; a process still
    /// alive after the grace period is killed.
    pub async fn destroy(&self, session_id: &str) -> bool {
        let Some(session) = self.get(session_id).await else {
            return false;
        };

        {
            let mut connections = self.connections.write().await;
            if connections.get(&session.connection_id).map(String::as_str) == Some(session_id) {
                connections.remove(&session.connection_id);
            }
        }

        info!(session_id, pid = ?session.pid, "Destroying terminal session");
        session.terminate();

        let grace = self.config.terminate_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !session.has_exited() {
                warn!(session_id = %session.session_id, "Session survived SIGTERM, killing");
                session.kill();
            }
        });
        true
    }

    /// Destroy the session owned by a connection, if any.
    pub async fn destroy_connection(&self, connection_id: &str) -> bool {
        let session_id = self.connections.write().await.remove(connection_id);
        match session_id {
            Some(session_id) => self.destroy(&session_id).await,
            None => false,
        }
    }

    /// Destroy every session. Returns how many were signalled.
    pub async fn destroy_all(&self) -> usize {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        let mut count = 0;
        for id in ids {
            if self.destroy(&id).await {
                count += 1;
            }
        }
        count
    }

    /// Another receiver for a live session's events.
    pub async fn subscribe(&self, session_id: &str) -> Option<broadcast::Receiver<TerminalEvent>> {
        self.get(session_id).await.map(|s| s.event_tx.subscribe())
    }

    pub async fn session_for_connection(&self, connection_id: &str) -> Option<String> {
        self.connections.read().await.get(connection_id).cloned()
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Get multiplexer statistics.
    pub async fn stats(&self) -> MultiplexerStats {
        let session_count = self.sessions.read().await.len();
        let connection_count = self.connections.read().await.len();
        MultiplexerStats {
            session_count,
            connection_count,
        }
    }

    async fn get(&self, session_id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    async fn forget(&self, session: &TerminalSession) {
        forget(&self.sessions, &self.connections, session).await;
    }
}

async fn forget(sessions: &SessionMap, connections: &ConnectionMap, session: &TerminalSession) {
    sessions.write().await.remove(&session.session_id);
    let mut connections = connections.write().await;
    if connections.get(&session.connection_id) == Some(&session.session_id) {
        connections.remove(&session.connection_id);
    }
}

/// Blocking read loop run on the session's reader thread.
fn read_loop(
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
    tx: &mpsc::UnboundedSender<PtyMessage>,
) {
    let mut buf = [0u8; READ_BUFFER_BYTES];
    loop {
        match reader.read(&mut buf) {
            // EIO on Linux once the child side closes.
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(PtyMessage::Data(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
        }
    }

    let (code, signal) = match child.wait() {
        Ok(status) => (Some(status.exit_code()), status.signal().map(str::to_string)),
        Err(_) => (None, None),
    };
    let _ = tx.send(PtyMessage::Exited { code, signal });
}

/// Fan PTY output out to subscribers and the analyzer until the process exits.
async fn pump(
    sessions: SessionMap,
    connections: ConnectionMap,
    session: Arc<TerminalSession>,
    mut rx: mpsc::UnboundedReceiver<PtyMessage>,
) {
    let mut text = Utf8Stream::default();
    let mut exit = (None, None);

    while let Some(message) = rx.recv().await {
        match message {
            PtyMessage::Data(bytes) => {
                if let Some(analyzer) = &session.analyzer {
                    let chunk = text.decode(&bytes);
                    if !chunk.is_empty() {
                        analyzer.feed(&chunk);
                    }
                }
                let _ = session.event_tx.send(TerminalEvent::Output(bytes));
            }
            PtyMessage::Exited { code, signal } => {
                exit = (code, signal);
                break;
            }
        }
    }

    if !session.mark_exited() {
        return;
    }
    forget(&sessions, &connections, &session).await;
    if let Some(analyzer) = &session.analyzer {
        analyzer.stop();
    }
    #[cfg(feature = "metrics")]
    ccfleet_core::metrics::record_terminal_sessions(-1);

    let (code, signal) = exit;
    info!(session_id = %session.session_id, code = ?code, signal = ?signal, "Terminal session exited");
    let _ = session.event_tx.send(TerminalEvent::Exited { code, signal });
}

#[cfg(all(test, unix))]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use ccfleet_core::RuleSet;

    use super::*;
    use crate::monitor::{MonitorConfig, OutputAnalyzer};

    async fn run_to_exit(
        events: &mut broadcast::Receiver<TerminalEvent>,
    ) -> (String, Option<u32>) {
        let mut output = Vec::new();
        let code = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Ok(TerminalEvent::Output(bytes)) => output.extend(bytes),
                    Ok(TerminalEvent::Exited { code, .. }) => return code,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("channel closed before exit"),
                }
            }
        })
        .await
        .expect("session did not exit in time");
        (String::from_utf8_lossy(&output).into_owned(), code)
    }

    fn sh(dir: &std::path::Path, script: &str) -> SessionSpec {
        SessionSpec::shell(dir).with_command("sh", vec!["-c".into(), script.into()])
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[tokio::test]
    async fn echo_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mux = TerminalMultiplexer::with_defaults();

        let mut handle = mux.create_session("c1", sh(dir.path(), "echo hello")).await.unwrap();
        assert!(handle.pid.is_some());

        let (output, code) = run_to_exit(&mut handle.events).await;
        assert!(output.contains("hello"));
        assert_eq!(code, Some(0));
        assert_eq!(mux.stats().await, MultiplexerStats {
            session_count: 0,
            connection_count: 0,
        });
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mux = TerminalMultiplexer::with_defaults();
        let mut handle = mux.create_session("c1", sh(dir.path(), "exit 3")).await.unwrap();
        let (_, code) = run_to_exit(&mut handle.events).await;
        assert_eq!(code, Some(3));
    }

    #[tokio::test]
    async fn runs_in_working_directory_with_env() {
        let dir = tempfile::tempdir().unwrap();
        let mux = TerminalMultiplexer::with_defaults();
        let mut spec = sh(dir.path(), "pwd; echo \"flag=$CCFLEET_TEST_FLAG\"");
        spec.env.push(("CCFLEET_TEST_FLAG".into(), "on".into()));

        let mut handle = mux.create_session("c1", spec).await.unwrap();
        let (output, _) = run_to_exit(&mut handle.events).await;
        let name = dir.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(output.contains(&name));
        assert!(output.contains("flag=on"));
    }

    #[tokio::test]
    async fn unknown_program_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let mux = TerminalMultiplexer::with_defaults();
        let spec = SessionSpec::shell(dir.path()).with_command("ccfleet-no-such-binary", vec![]);

        match mux.create_session("c1", spec).await {
            Err(TerminalError::SpawnFailed { reason }) => {
                assert!(reason.contains("ccfleet-no-such-binary"));
            }
            other => panic!("Expected SpawnFailed, got: {other:?}"),
        }
        assert_eq!(mux.stats().await.session_count, 0);
    }

    #[tokio::test]
    async fn missing_working_directory_fails_to_spawn() {
        let mux = TerminalMultiplexer::with_defaults();
        let spec = SessionSpec::shell("/nonexistent/ccfleet/dir");
        assert!(matches!(
            mux.create_session("c1", spec).await,
            Err(TerminalError::SpawnFailed { .. })
        ));
    }

    #[tokio::test]
    async fn second_session_replaces_first_for_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mux = TerminalMultiplexer::with_defaults();

        let spec = SessionSpec::shell(dir.path()).with_command("sleep", vec!["30".into()]);
        let mut first = mux.create_session("c1", spec.clone()).await.unwrap();
        let second = mux.create_session("c1", spec).await.unwrap();

        assert_eq!(
            mux.session_for_connection("c1").await,
            Some(second.session_id.clone())
        );
        let (_, code) = run_to_exit(&mut first.events).await;
        assert_ne!(code, Some(0));
        assert!(!mux.contains(&first.session_id).await);
        assert!(mux.contains(&second.session_id).await);

        assert!(mux.destroy_connection("c1").await);
        assert!(!mux.destroy_connection("c1").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_creates_for_one_connection_keep_one_session() {
        let dir = tempfile::tempdir().unwrap();
        let mux = Arc::new(TerminalMultiplexer::with_defaults());
        let spec = SessionSpec::shell(dir.path()).with_command("sleep", vec!["30".into()]);

        let (a, b) = tokio::join!(
            mux.create_session("c1", spec.clone()),
            mux.create_session("c1", spec),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let owner = mux.session_for_connection("c1").await.unwrap();
        let mut loser = if owner == a.session_id { b } else { a };
        assert_ne!(loser.session_id, owner);
        run_to_exit(&mut loser.events).await;

        assert!(!mux.contains(&loser.session_id).await);
        assert_eq!(mux.stats().await.session_count, 1);
        assert!(mux.destroy_connection("c1").await);
    }

    // =========================================================================
    // Input
    // =========================================================================

    #[tokio::test]
    async fn write_reaches_process() {
        let dir = tempfile::tempdir().unwrap();
        let mux = TerminalMultiplexer::with_defaults();
        let mut handle = mux
            .create_session("c1", sh(dir.path(), "read line; echo \"got:$line\""))
            .await
            .unwrap();

        assert_eq!(
            mux.write(&handle.session_id, b"ping\n").await,
            WriteOutcome::Delivered
        );
        let (output, code) = run_to_exit(&mut handle.events).await;
        assert!(output.contains("got:ping"));
        assert_eq!(code, Some(0));
    }

    #[tokio::test]
    async fn write_after_exit_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mux = TerminalMultiplexer::with_defaults();
        let mut handle = mux.create_session("c1", sh(dir.path(), "true")).await.unwrap();
        run_to_exit(&mut handle.events).await;

        assert_eq!(
            mux.write(&handle.session_id, b"late\n").await,
            WriteOutcome::Dropped
        );
        assert_eq!(mux.write("unknown", b"x").await, WriteOutcome::Dropped);
    }

    #[tokio::test]
    async fn resize_unknown_session_is_not_found() {
        let mux = TerminalMultiplexer::with_defaults();
        assert!(matches!(
            mux.resize("nope", 100, 40).await,
            Err(TerminalError::SessionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn resize_live_session() {
        let dir = tempfile::tempdir().unwrap();
        let mux = TerminalMultiplexer::with_defaults();
        let spec = SessionSpec::shell(dir.path()).with_command("sleep", vec!["30".into()]);
        let handle = mux.create_session("c1", spec).await.unwrap();

        mux.resize(&handle.session_id, 132, 50).await.unwrap();
        assert!(mux.destroy(&handle.session_id).await);
    }

    // =========================================================================
    // Analyzer wiring
    // =========================================================================

    #[tokio::test]
    async fn analyzer_sees_output_and_stops_on_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mux = TerminalMultiplexer::with_defaults();
        let (analyzer, _rx) =
            OutputAnalyzer::new(Arc::new(RuleSet::builtin()), MonitorConfig::default());
        let analyzer = Arc::new(analyzer);

        let spec = sh(dir.path(), "echo 'Here is the answer.'").with_analyzer(Arc::clone(&analyzer));
        let mut handle = mux.create_session("c1", spec).await.unwrap();
        run_to_exit(&mut handle.events).await;

        assert!(analyzer.last_output(200).contains("Here is the answer."));
        assert!(!analyzer.is_running());
    }

    #[test]
    fn utf8_stream_joins_split_sequences() {
        let mut stream = Utf8Stream::default();
        let bytes = "héllo".as_bytes();
        assert_eq!(stream.decode(&bytes[..2]), "h");
        assert_eq!(stream.decode(&bytes[2..]), "éllo");
        assert_eq!(stream.decode(&[0xff, b'a']), "\u{FFFD}a");
    }
}
