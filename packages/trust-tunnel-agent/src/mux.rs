//! Per-connection stream multiplexing between the WebSocket and a backend.
//!
//! Three pumps cooperate per live connection: inbound (frames to backend
//! stdin plus control messages), outbound stdout (binary frames, then the
//! close frame carrying the exit code), and outbound stderr (text frames).
//! All transport writes serialize on one sink mutex. Only the inbound pump
//! decides the connection's fate; its error, if any, is what the broker
//! uses to reserve the session for reclaim.

use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use trust_tunnel_client::NormalCloseMessage;
use trust_tunnel_error::trunc_control_msg;

use crate::audit::CmdLogger;
use crate::session::Session;

const RESIZE_HEADER: &str = "resize: ";
const CLOSE_HEADER: &str = "close session";

/// Handle over the outbound pumps of one connection. Cancelling releases
/// their hold on the session's stream receivers so a reclaiming connection
/// can take over; without reclaim they exit when the backend streams end.
pub struct ConnectionPumps {
    cancel: CancellationToken,
}

impl ConnectionPumps {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Drives one upgraded connection against its session. Resolves when the
/// client half closes; the returned error is `Some` exactly when the close
/// was abnormal (the stale-reserve trigger).
pub async fn run_connection(
    socket: WebSocket,
    sess: Arc<dyn Session>,
    mut cmd_logger: CmdLogger,
) -> (Option<String>, ConnectionPumps) {
    let (sink, stream) = socket.split();
    let sink = Arc::new(Mutex::new(sink));
    let cancel = CancellationToken::new();

    {
        let sink = sink.clone();
        let sess = sess.clone();
        let cancel = cancel.clone();
        tokio::spawn(process_local_output(sink, sess, cancel));
    }
    {
        let sink = sink.clone();
        let sess = sess.clone();
        let cancel = cancel.clone();
        tokio::spawn(process_local_error(sink, sess, cancel));
    }

    let result = process_remote_input(stream, sess, &mut cmd_logger).await;
    cmd_logger.destroy();

    (result.err(), ConnectionPumps { cancel })
}

/// Sends the fatal-to-request close frame: unsupported-data status with a
/// coded error payload.
pub async fn send_establish_error(mut socket: WebSocket, err_msg: &str) {
    let payload = trunc_control_msg(&format!("Establish session error: {err_msg}"));
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::UNSUPPORTED,
            reason: payload.into(),
        })))
        .await;
}

/// Inbound pump: binary frames feed stdin (tee'd through the command
/// logger), text frames are control messages.
async fn process_remote_input(
    mut stream: SplitStream<WebSocket>,
    sess: Arc<dyn Session>,
    cmd_logger: &mut CmdLogger,
) -> Result<(), String> {
    loop {
        match stream.next().await {
            None => return Ok(()),
            Some(Ok(Message::Close(frame))) => {
                let graceful = frame
                    .as_ref()
                    .map(|frame| frame.code == close_code::NORMAL)
                    .unwrap_or(true);
                if graceful {
                    return Ok(());
                }
                let code = frame.map(|frame| frame.code).unwrap_or_default();
                return Err(format!("read from remote error: close status {code}"));
            }
            Some(Ok(Message::Text(text))) => {
                if let Some(spec) = text.strip_prefix(RESIZE_HEADER) {
                    if let Some((height, width)) = parse_resize(spec) {
                        if let Err(err) = sess.resize(height, width).await {
                            tracing::warn!(error = %err, "resize failed");
                        }
                    }
                } else if text.starts_with(CLOSE_HEADER) {
                    tracing::debug!("received close message, return");
                    return Ok(());
                }
            }
            Some(Ok(Message::Binary(data))) => {
                cmd_logger.write(&data);
                sess.write_stdin(&data).await.map_err(|err| {
                    format!("copy data from websocket to cmd's stdin failed: {err}")
                })?;
                tracing::trace!(bytes = data.len(), "write to cmd's stdin");
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                if is_graceful_read_error(&err.to_string()) {
                    return Ok(());
                }
                return Err(format!("read from remote error: {err}"));
            }
        }
    }
}

/// A read error that just means the peer went away mid-handshake is a
/// normal ending, not a session failure.
fn is_graceful_read_error(msg: &str) -> bool {
    msg.contains("use of closed connection")
        || msg.contains("use of closed network connection")
        || msg.contains("unexpected EOF")
}

/// Parses `H,W`; both must be strictly positive. Malformed input is ignored
/// by returning `None`, never an error.
fn parse_resize(spec: &str) -> Option<(u16, u16)> {
    let mut parts = spec.splitn(2, ',');
    let height: i32 = parts.next()?.trim().parse().unwrap_or(0);
    let width: i32 = parts.next()?.trim().parse().unwrap_or(0);

    if height > 0 && width > 0 {
        Some((height as u16, width as u16))
    } else {
        None
    }
}

/// A send that failed only because the connection is already closed. These
/// are the Display texts of tungstenite's `ConnectionClosed` and
/// `AlreadyClosed` variants, which is what the ws sink surfaces once the
/// peer is gone; they carry no information the close handshake didn't.
fn is_closed_send_error(msg: &str) -> bool {
    msg.contains("Connection closed normally") || msg.contains("Trying to work with closed connection")
}

/// Outbound stdout pump. After the stream drains it emits the close frame
/// carrying the exit code; the exit code is read only once both outputs
/// have signalled completion. A genuine mid-stream write failure reports
/// exit code -1 instead, since the streams never drained.
async fn process_local_output<S>(sink: Arc<Mutex<S>>, sess: Arc<dyn Session>, cancel: CancellationToken)
where
    S: Sink<Message, Error = axum::Error> + Unpin + Send + 'static,
{
    let result = pump_output(&sink, &sess, false, &cancel).await;
    sess.stdout_done();

    if cancel.is_cancelled() {
        // Superseded connection: the close frame belongs to whoever takes
        // over the session.
        return;
    }

    let msg = match result {
        Err(err) if !is_closed_send_error(&err) => NormalCloseMessage {
            code: -1,
            err: Some(err),
        },
        _ => NormalCloseMessage {
            code: sess.exit_code().await,
            err: None,
        },
    };

    let data = serde_json::to_string(&msg).unwrap_or_default();
    let payload = trunc_control_msg(&data);

    let mut sink = sink.lock().await;
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: payload.into(),
        })))
        .await;
}

/// Outbound stderr pump; signals completion but never closes the transport.
async fn process_local_error<S>(sink: Arc<Mutex<S>>, sess: Arc<dyn Session>, cancel: CancellationToken)
where
    S: Sink<Message, Error = axum::Error> + Unpin + Send + 'static,
{
    let _ = pump_output(&sink, &sess, true, &cancel).await;
    sess.stderr_done();
}

async fn pump_output<S>(
    sink: &Arc<Mutex<S>>,
    sess: &Arc<dyn Session>,
    is_err: bool,
    cancel: &CancellationToken,
) -> Result<(), String>
where
    S: Sink<Message, Error = axum::Error> + Unpin + Send,
{
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            chunk = async {
                if is_err {
                    sess.next_stderr().await
                } else {
                    sess.next_stdout().await
                }
            } => chunk,
        };

        let Some(chunk) = chunk else {
            return Ok(());
        };

        let message = if is_err {
            Message::Text(String::from_utf8_lossy(&chunk).into_owned())
        } else {
            Message::Binary(chunk.to_vec())
        };

        let mut guard = sink.lock().await;
        guard
            .send(message)
            .await
            .map_err(|err| format!("copy message to websocket failed: {err}"))?;
        tracing::trace!(bytes = chunk.len(), is_err, "write output back to websocket");
    }
}
