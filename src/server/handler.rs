//! Per-connection request/response loop.
//!
//! The handler reads bounded chunks from its stream, splits complete
//! newline-terminated frames out of an accumulation buffer, and answers each
//! frame with exactly one response line before consuming further input, so
//! responses always preserve request order on a connection. It is generic
//! over the stream type so the TCP front-end and in-memory test streams run
//! the identical code path.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::AtomicU64;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

use crate::error::ServiceError;
use crate::server::request::{self, Command, Response};
use crate::store::{Outcome, Presence, SharedIndex};

/// Monotonic id handed to each accepted connection for log correlation.
pub static CONN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Socket reads are bounded; framing does not depend on chunk alignment.
const READ_CHUNK: usize = 2048;

/// Drive one client connection to completion.
///
/// Returns `Ok` on orderly close (peer EOF or an internal fault already
/// answered with `ERROR`); returns `Err` only for transport failures, which
/// the caller logs. Either way the connection is finished when this returns.
pub async fn serve_connection<S>(mut stream: S, index: SharedIndex, conn_id: u64) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!(target: "pkgindex::handler", "conn_id={} new client connection established", conn_id);

    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            // Peer closed. A trailing unterminated frame is dropped silently.
            if !pending.is_empty() {
                debug!(
                    target: "pkgindex::handler",
                    "conn_id={} discarding {} unterminated trailing bytes",
                    conn_id,
                    pending.len()
                );
            }
            break;
        }
        pending.extend_from_slice(&chunk[..n]);

        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let frame: Vec<u8> = pending.drain(..=pos).collect();
            let line = &frame[..frame.len() - 1];

            match catch_unwind(AssertUnwindSafe(|| respond_to_frame(&index, line, conn_id))) {
                Ok(response) => {
                    stream.write_all(response.as_line().as_bytes()).await?;
                }
                Err(_) => {
                    let fault = ServiceError::internal("request dispatch panicked");
                    error!(target: "pkgindex::handler", "conn_id={} {}; closing connection", conn_id, fault);
                    stream.write_all(fault.wire_code().as_line().as_bytes()).await?;
                    return Ok(());
                }
            }
        }
    }

    debug!(target: "pkgindex::handler", "conn_id={} client closed connection", conn_id);
    Ok(())
}

/// Classify one frame and run it against the store. Never touches the stream.
fn respond_to_frame(index: &SharedIndex, raw: &[u8], conn_id: u64) -> Response {
    let line = match std::str::from_utf8(raw) {
        Ok(line) => line,
        Err(_) => {
            debug!(target: "pkgindex::handler", "conn_id={} non-utf8 request frame", conn_id);
            return Response::Error;
        }
    };
    debug!(target: "pkgindex::handler", "conn_id={} client sent {:?}", conn_id, line);

    let req = match request::parse(line) {
        Ok(req) => req,
        Err(err) => {
            debug!(target: "pkgindex::handler", "conn_id={} {}", conn_id, err);
            return err.wire_code();
        }
    };

    let response = match req.command {
        Command::Query => match index.query(&req.name) {
            Presence::Present => Response::Ok,
            Presence::Absent => Response::Fail,
        },
        Command::Index => match index.index(&req.name, &req.dependencies) {
            Outcome::Ok => Response::Ok,
            Outcome::Refused => Response::Fail,
        },
        Command::Remove => match index.remove(&req.name) {
            Outcome::Ok => Response::Ok,
            Outcome::Refused => Response::Fail,
        },
    };
    debug!(target: "pkgindex::handler", "conn_id={} responding {:?}", conn_id, response);
    response
}
