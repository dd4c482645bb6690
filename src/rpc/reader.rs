//! Reader tasks for the agent's stdout and stderr.
//!
//! The stdout reader is driven by a [`FramedRead`] backed by [`RpcCodec`].
//! Each line is classified once and routed:
//!
//! | Variant          | Action                                              |
//! |------------------|-----------------------------------------------------|
//! | `Response`       | complete the matching pending request               |
//! | `ServerRequest`  | ask the registered handlers, write the reply        |
//! | `Notification`   | emit to every subscriber, in parse order            |
//! | `Unrecognized`   | skipped; logged at `DEBUG`                          |
//!
//! Malformed or oversized lines are logged and skipped; they never end the
//! session. EOF or an I/O error closes the session, which rejects every
//! pending request.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, trace, warn};

use crate::rpc::codec::RpcCodec;
use crate::rpc::message::{parse_line, IncomingMessage};
use crate::rpc::session::RpcSession;
use crate::rpc::spawner::BoxedReader;
use crate::rpc::state::TransportShared;
use crate::AppError;

/// Spawn the stdout reader for `session`.
pub(crate) fn spawn_reader(
    session: Arc<RpcSession>,
    stdout: BoxedReader,
    shared: Arc<TransportShared>,
) -> JoinHandle<()> {
    tokio::spawn(run_reader(session, stdout, shared))
}

async fn run_reader(session: Arc<RpcSession>, stdout: BoxedReader, shared: Arc<TransportShared>) {
    let generation = session.generation();
    let cancel = session.cancellation();
    let mut framed = FramedRead::new(stdout, RpcCodec::new());

    let reason = loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(generation, "rpc reader: session closed, stopping");
                return;
            }

            item = framed.next() => {
                match item {
                    None => break "agent stdout closed".to_owned(),
                    Some(Err(AppError::Protocol(msg))) => {
                        warn!(generation, error = msg.as_str(), "rpc reader: framing error, skipping");
                    }
                    Some(Err(e)) => break format!("stream error: {e}"),
                    Some(Ok(line)) => dispatch_line(&session, &shared, &line),
                }
            }
        }
    };

    debug!(generation, reason = reason.as_str(), "rpc reader: session lost");
    session.close(&reason);
    shared.session_lost(generation, &reason);
}

fn dispatch_line(session: &Arc<RpcSession>, shared: &Arc<TransportShared>, line: &str) {
    let message = match parse_line(line) {
        Ok(Some(message)) => message,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, raw_line = %line, "rpc reader: parse error, skipping line");
            return;
        }
    };

    match message {
        IncomingMessage::Response { id, outcome } => {
            if !session.complete(id, outcome) {
                debug!(id, "rpc reader: reply for unknown or expired request");
            }
        }
        IncomingMessage::ServerRequest { id, method, params } => {
            let outcome = shared.handle_server_request(&method, &params);
            let session = Arc::clone(session);
            // Replies go out on their own task so a full stdin pipe never
            // stalls stdout consumption.
            tokio::spawn(async move {
                if let Err(err) = session.reply(&id, &outcome).await {
                    warn!(method = method.as_str(), %err, "failed to answer server request");
                }
            });
        }
        IncomingMessage::Notification(notification) => {
            trace!(method = notification.method.as_str(), "rpc notification");
            shared.subscribers.emit(&notification);
        }
        IncomingMessage::Unrecognized(value) => {
            debug!(raw = %value, "rpc reader: unrecognized message, skipping");
        }
    }
}

/// Spawn a task that copies the agent's stderr into the diagnostic tail.
pub(crate) fn spawn_stderr_drain(
    session: &RpcSession,
    stderr: BoxedReader,
    shared: Arc<TransportShared>,
) -> JoinHandle<()> {
    let cancel = session.cancellation();
    let generation = session.generation();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        debug!(generation, stderr = line.as_str(), "agent stderr");
                        shared.record_diagnostic(line);
                    }
                    Ok(None) | Err(_) => break,
                },
            }
        }
    })
}
