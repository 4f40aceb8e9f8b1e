//! WebSocket endpoints: operator terminals and the fleet event stream.
//!
//! `/ws/terminal` protocol, JSON text frames tagged by `type`:
//! - in: `create`, `input`, `resize`, `destroy`; binary frames are input
//! - out: `created`, `exited`, `error`; terminal output as binary frames

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::orchestration::FleetEvent;
use crate::terminal::{SessionSpec, TerminalEvent, WriteOutcome};

use super::AppState;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Client → server terminal frame.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalIn {
    Create {
        working_directory: Option<PathBuf>,
        cols: Option<u16>,
        rows: Option<u16>,
        /// Extra environment for the shell.
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Input {
        data: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Destroy,
}

/// Server → client terminal frame.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalOut {
    Created {
        session_id: String,
        pid: Option<u32>,
    },
    Exited {
        session_id: String,
        code: Option<u32>,
        signal: Option<String>,
    },
    Error {
        message: String,
    },
}

fn text_frame<T: Serialize>(value: &T) -> Option<Message> {
    serde_json::to_string(value)
        .ok()
        .map(|json| Message::Text(json.into()))
}

// =========================================================================
// /ws/terminal
// =========================================================================

pub async fn terminal_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_terminal(socket, state))
}

async fn handle_terminal(socket: WebSocket, state: AppState) {
    let connection_id = format!("ws:{}", uuid::Uuid::new_v4());
    info!(connection_id = %connection_id, "Terminal connection opened");

    let (ws_write, mut ws_read) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    let write_handle = tokio::spawn(write_loop(ws_write, rx, connection_id.clone()));

    while let Some(result) = ws_read.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Terminal socket read error");
                break;
            }
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<TerminalIn>(text.as_str()) {
                Ok(frame) => handle_frame(&state, &connection_id, frame, &tx).await,
                Err(e) => send_error(&tx, format!("invalid terminal message: {e}")),
            },
            Message::Binary(bytes) => write_input(&state, &connection_id, &bytes, &tx).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    if state.manager.terminals().destroy_connection(&connection_id).await {
        debug!(connection_id = %connection_id, "Destroyed session of closed connection");
    }
    write_handle.abort();
    info!(connection_id = %connection_id, "Terminal connection closed");
}

async fn handle_frame(
    state: &AppState,
    connection_id: &str,
    frame: TerminalIn,
    tx: &mpsc::UnboundedSender<Message>,
) {
    match frame {
        TerminalIn::Create {
            working_directory,
            cols,
            rows,
            env,
        } => {
            let spec = shell_spec(&state.terminal_root, working_directory, cols, rows, env);
            match state
                .manager
                .terminals()
                .create_session(connection_id, spec)
                .await
            {
                Ok(handle) => {
                    state.manager.publish(FleetEvent::SessionCreated {
                        session_id: handle.session_id.clone(),
                        instance_id: None,
                        pid: handle.pid,
                    });
                    if let Some(frame) = text_frame(&TerminalOut::Created {
                        session_id: handle.session_id.clone(),
                        pid: handle.pid,
                    }) {
                        let _ = tx.send(frame);
                    }
                    tokio::spawn(forward_session(
                        state.clone(),
                        handle.session_id,
                        handle.events,
                        tx.clone(),
                    ));
                }
                Err(e) => send_error(tx, e.to_string()),
            }
        }
        TerminalIn::Input { data } => {
            write_input(state, connection_id, data.as_bytes(), tx).await;
        }
        TerminalIn::Resize { cols, rows } => {
            let terminals = state.manager.terminals();
            let Some(session_id) = terminals.session_for_connection(connection_id).await else {
                send_error(tx, "no terminal session on this connection");
                return;
            };
            if let Err(e) = terminals.resize(&session_id, cols, rows).await {
                send_error(tx, e.to_string());
            }
        }
        TerminalIn::Destroy => {
            state
                .manager
                .terminals()
                .destroy_connection(connection_id)
                .await;
        }
    }
}

/// Session spec for an operator shell; unset fields fall back to `root`
/// and an 80x24 window.
fn shell_spec(
    root: &Path,
    working_directory: Option<PathBuf>,
    cols: Option<u16>,
    rows: Option<u16>,
    env: HashMap<String, String>,
) -> SessionSpec {
    let mut spec = SessionSpec::shell(working_directory.unwrap_or_else(|| root.to_path_buf()))
        .with_size(cols.unwrap_or(DEFAULT_COLS), rows.unwrap_or(DEFAULT_ROWS));
    spec.env.extend(env);
    spec
}

async fn write_input(
    state: &AppState,
    connection_id: &str,
    data: &[u8],
    tx: &mpsc::UnboundedSender<Message>,
) {
    let terminals = state.manager.terminals();
    let Some(session_id) = terminals.session_for_connection(connection_id).await else {
        send_error(tx, "no terminal session on this connection");
        return;
    };
    if terminals.write(&session_id, data).await == WriteOutcome::Dropped {
        debug!(session_id = %session_id, "Input dropped for exited session");
    }
}

fn send_error(tx: &mpsc::UnboundedSender<Message>, message: impl Into<String>) {
    if let Some(frame) = text_frame(&TerminalOut::Error {
        message: message.into(),
    }) {
        let _ = tx.send(frame);
    }
}

/// Relay one session's output to the socket and the event stream.
async fn forward_session(
    state: AppState,
    session_id: String,
    mut events: broadcast::Receiver<TerminalEvent>,
    tx: mpsc::UnboundedSender<Message>,
) {
    let (code, signal) = loop {
        match events.recv().await {
            Ok(TerminalEvent::Output(bytes)) => {
                state.manager.publish(FleetEvent::TerminalOutput {
                    session_id: session_id.clone(),
                    instance_id: None,
                    data: String::from_utf8_lossy(&bytes).into_owned(),
                });
                let _ = tx.send(Message::Binary(bytes.into()));
            }
            Ok(TerminalEvent::Exited { code, signal }) => break (code, signal),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(session_id = %session_id, skipped, "Terminal output lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break (None, None),
        }
    };

    state.manager.publish(FleetEvent::SessionExited {
        session_id: session_id.clone(),
        instance_id: None,
        code,
        signal: signal.clone(),
    });
    if let Some(frame) = text_frame(&TerminalOut::Exited {
        session_id,
        code,
        signal,
    }) {
        let _ = tx.send(frame);
    }
}

// =========================================================================
// /ws/events
// =========================================================================

pub async fn events_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_events(socket, state))
}

async fn handle_events(socket: WebSocket, state: AppState) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (mut ws_write, mut ws_read) = socket.split();
    let mut events = state.manager.subscribe();
    info!(connection_id = %connection_id, "Event stream opened");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Some(frame) = text_frame(&event) else { continue };
                    if ws_write.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(connection_id = %connection_id, skipped, "Event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = ws_read.next() => match incoming {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    info!(connection_id = %connection_id, "Event stream closed");
}

async fn write_loop(
    mut ws_write: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    connection_id: String,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = ws_write.send(msg).await {
            warn!(connection_id = %connection_id, error = %e, "Terminal socket write error");
            break;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn parses_terminal_frames() {
        let create: TerminalIn =
            serde_json::from_str(r#"{"type":"create","cols":100,"rows":30}"#).unwrap();
        assert_eq!(
            create,
            TerminalIn::Create {
                working_directory: None,
                cols: Some(100),
                rows: Some(30),
                env: HashMap::new(),
            }
        );

        let input: TerminalIn = serde_json::from_str(r#"{"type":"input","data":"ls\r"}"#).unwrap();
        assert_eq!(
            input,
            TerminalIn::Input {
                data: "ls\r".into()
            }
        );

        let destroy: TerminalIn = serde_json::from_str(r#"{"type":"destroy"}"#).unwrap();
        assert_eq!(destroy, TerminalIn::Destroy);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn create_frame_environment_reaches_the_shell() {
        use std::time::Duration;

        use crate::terminal::{MultiplexerConfig, TerminalMultiplexer};

        let root = tempfile::tempdir().unwrap();
        let frame: TerminalIn = serde_json::from_str(
            r#"{"type":"create","cols":100,"env":{"CCFLEET_WS_FLAG":"from-client"}}"#,
        )
        .unwrap();
        let TerminalIn::Create {
            working_directory,
            cols,
            rows,
            env,
        } = frame
        else {
            panic!("expected a create frame");
        };
        let spec = shell_spec(root.path(), working_directory, cols, rows, env);
        assert_eq!(spec.working_directory, root.path());
        assert_eq!((spec.cols, spec.rows), (100, DEFAULT_ROWS));

        let mux = TerminalMultiplexer::new(MultiplexerConfig {
            shell: "/bin/sh".into(),
            ..MultiplexerConfig::default()
        });
        let mut handle = mux.create_session("ws:test", spec).await.unwrap();
        mux.write(&handle.session_id, b"echo \"flag:$CCFLEET_WS_FLAG\"; exit\n")
            .await;

        let mut output = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match handle.events.recv().await {
                    Ok(TerminalEvent::Output(bytes)) => output.extend(bytes),
                    Ok(TerminalEvent::Exited { .. }) | Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        })
        .await
        .unwrap();
        assert!(String::from_utf8_lossy(&output).contains("flag:from-client"));
    }

    #[test]
    fn rejects_unknown_frame_type() {
        assert!(serde_json::from_str::<TerminalIn>(r#"{"type":"reboot"}"#).is_err());
        assert!(serde_json::from_str::<TerminalIn>(r#"{"type":"resize","cols":10}"#).is_err());
    }

    #[test]
    fn serializes_outgoing_frames() {
        let exited = serde_json::to_value(TerminalOut::Exited {
            session_id: "s1".into(),
            code: Some(0),
            signal: None,
        })
        .unwrap();
        assert_eq!(exited["type"], "exited");
        assert_eq!(exited["session_id"], "s1");
        assert_eq!(exited["code"], 0);

        let error = serde_json::to_value(TerminalOut::Error {
            message: "boom".into(),
        })
        .unwrap();
        assert_eq!(error["type"], "error");
        assert_eq!(error["message"], "boom");
    }
}
