//! The Dispatcher: the server-side half of the wire protocol run inside the
//! per-connection worker process. Reads one JSON request per line, looks up
//! the action in a static table, invokes the handler, writes the encoded
//! response, and loops until `close` or EOF. There is no concurrency
//! inside a single worker: one request is in flight at a time.

pub mod actions;
pub mod context;

use crate::dispatcher::context::WorkerContext;
use crate::error::McVirtError;
use crate::remote::protocol::{WireRequest, WireResponse};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

/// Runs the dispatcher loop over `input`/`output`, which stand in for the
/// SSH channel's stdin/stdout when this process is launched as a peer
/// worker. Returns once `close` is received or the input stream ends.
pub async fn run<R, W>(mut input: R, mut output: W, ctx: Arc<WorkerContext>)
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(&mut input);
    let mut line = String::new();
    loop {
        line.clear();
        let bytes_read = match reader.read_line(&mut line).await {
            Ok(0) => {
                info!("dispatcher input closed, exiting");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "dispatcher read error, exiting");
                break;
            }
        };
        let _ = bytes_read;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: WireRequest = match serde_json::from_str(trimmed) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "malformed request line");
                let resp = WireResponse::from_error(&McVirtError::Internal(e.to_string()));
                if write_response(&mut output, &resp).await.is_err() {
                    break;
                }
                continue;
            }
        };

        if request.is_close() {
            info!("received close sentinel, exiting");
            break;
        }

        debug!(action = %request.action, "dispatching action");
        let response = match actions::dispatch(&request.action, request.arguments, &ctx).await {
            Ok(value) => WireResponse::ok(value),
            Err(err) => {
                warn!(action = %request.action, error = %err, "action failed");
                WireResponse::from_error(&err)
            }
        };

        if write_response(&mut output, &response).await.is_err() {
            break;
        }
    }
}

async fn write_response<W: tokio::io::AsyncWrite + Unpin>(
    output: &mut W,
    response: &WireResponse,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(response).unwrap_or_else(|_| b"null".to_vec());
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await
}
