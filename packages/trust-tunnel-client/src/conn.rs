//! Live agent connection: frame decode loop plus the byte-pump surface.

use std::io;
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::NormalCloseMessage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Default)]
struct CloseState {
    exit_code: i32,
    err: Option<String>,
}

/// One established exec session against the agent.
///
/// Stdout/stderr reads block until bytes arrive (see
/// [`crate::BlockingBuffer`]), so a terminal pump can drive them from plain
/// threads while control messages go out through the async writer task.
pub struct AgentSession {
    stdout: Arc<crate::BlockingBuffer>,
    stderr: Arc<crate::BlockingBuffer>,
    outbound: mpsc::UnboundedSender<Message>,
    close_state: Arc<Mutex<CloseState>>,
    interactive: bool,
}

impl AgentSession {
    pub(crate) fn spawn(stream: WsStream, interactive: bool) -> Self {
        let (mut sink, mut source) = stream.split();

        let stdout = Arc::new(crate::BlockingBuffer::new());
        let stderr = Arc::new(crate::BlockingBuffer::new());
        let close_state = Arc::new(Mutex::new(CloseState::default()));
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        {
            let stdout = stdout.clone();
            let stderr = stderr.clone();
            let close_state = close_state.clone();
            tokio::spawn(async move {
                loop {
                    match source.next().await {
                        Some(Ok(Message::Binary(data))) => {
                            let _ = stdout.write(&data);
                        }
                        Some(Ok(Message::Text(text))) => {
                            let _ = stderr.write(text.as_bytes());
                        }
                        Some(Ok(Message::Close(frame))) => {
                            record_close(&close_state, frame);
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            let mut state = close_state.lock().unwrap_or_else(|e| e.into_inner());
                            if state.err.is_none() {
                                state.err = Some(err.to_string());
                            }
                            break;
                        }
                        None => break,
                    }
                }

                // close() waits for readers to drain, so hop off the runtime.
                let _ = tokio::task::spawn_blocking(move || {
                    stdout.close();
                    stderr.close();
                })
                .await;
            });
        }

        Self {
            stdout,
            stderr,
            outbound,
            close_state,
            interactive,
        }
    }

    /// Reads remote stdout. Blocks until bytes arrive; `Ok(0)` after close
    /// and drain.
    pub fn read(&self, p: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(p)
    }

    /// Reads remote stderr with the same blocking semantics as [`read`].
    ///
    /// [`read`]: Self::read
    pub fn read_stderr(&self, p: &mut [u8]) -> io::Result<usize> {
        self.stderr.read(p)
    }

    /// Sends stdin bytes. Non-interactive sessions swallow writes so a pump
    /// wired unconditionally to local stdin stays harmless.
    pub fn write(&self, p: &[u8]) -> io::Result<usize> {
        if !self.interactive {
            return Ok(p.len());
        }

        self.outbound
            .send(Message::Binary(p.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"))?;

        Ok(p.len())
    }

    /// Asks the agent to resize the remote terminal.
    pub fn resize(&self, height: u16, width: u16) -> io::Result<()> {
        self.outbound
            .send(Message::Text(format!("resize: {height},{width}")))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"))
    }

    /// Asks the agent to end the session cleanly.
    pub fn close_session(&self) -> io::Result<()> {
        self.outbound
            .send(Message::Text("close session".to_string()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"))
    }

    /// Exit code delivered by the agent's close frame. Meaningful once both
    /// output readers have hit EOF.
    pub fn exit_code(&self) -> i32 {
        self.close_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .exit_code
    }

    /// Transport or remote error recorded during the session, if any.
    pub fn err(&self) -> Option<String> {
        self.close_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .err
            .clone()
    }
}

fn record_close(
    state: &Mutex<CloseState>,
    frame: Option<tokio_tungstenite::tungstenite::protocol::CloseFrame<'_>>,
) {
    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());

    let Some(frame) = frame else {
        return;
    };

    if frame.code == CloseCode::Normal {
        match serde_json::from_str::<NormalCloseMessage>(&frame.reason) {
            Ok(msg) => {
                state.exit_code = msg.code;
                state.err = msg.err;
            }
            Err(_) => {
                // Older agents sent a bare error string on normal closure.
                if !frame.reason.is_empty() {
                    state.exit_code = -1;
                    state.err = Some(frame.reason.to_string());
                }
            }
        }
    } else {
        state.exit_code = -1;
        state.err = Some(frame.reason.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close_frame(
        code: CloseCode,
        reason: &str,
    ) -> Option<tokio_tungstenite::tungstenite::protocol::CloseFrame<'static>> {
        Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
            code,
            reason: reason.to_string().into(),
        })
    }

    #[test]
    fn normal_close_carries_exit_code() {
        let state = Mutex::new(CloseState::default());
        record_close(&state, close_frame(CloseCode::Normal, r#"{"Code":7,"Err":null}"#));

        let state = state.lock().unwrap();
        assert_eq!(state.exit_code, 7);
        assert!(state.err.is_none());
    }

    #[test]
    fn legacy_plain_reason_is_an_error() {
        let state = Mutex::new(CloseState::default());
        record_close(&state, close_frame(CloseCode::Normal, "something broke"));

        let state = state.lock().unwrap();
        assert_eq!(state.exit_code, -1);
        assert_eq!(state.err.as_deref(), Some("something broke"));
    }

    #[test]
    fn abnormal_close_records_reason() {
        let state = Mutex::new(CloseState::default());
        record_close(
            &state,
            close_frame(CloseCode::Unsupported, "code=MA_521,msg=current sidecar num exceed the limit: 1,1"),
        );

        let state = state.lock().unwrap();
        assert_eq!(state.exit_code, -1);
        assert!(state.err.as_deref().unwrap().contains("MA_521"));
    }

    #[test]
    fn empty_normal_close_keeps_defaults() {
        let state = Mutex::new(CloseState::default());
        record_close(&state, close_frame(CloseCode::Normal, ""));

        let state = state.lock().unwrap();
        assert_eq!(state.exit_code, 0);
        assert!(state.err.is_none());
    }
}
