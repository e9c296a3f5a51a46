//! Degraded responder for IDE-integration sessions.
//!
//! When a persistent session cannot come up because the environment or
//! the external build is broken, abruptly exiting would sever the
//! editor's protocol session. Instead the client keeps the channel
//! open with a null responder: every request gets a `null` result,
//! notifications are ignored, and the responder winds down on client
//! disconnect or after a bounded lifetime.

use std::io::{BufRead, Write};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info};

use crate::error::Result;

/// Upper bound on a null responder's lifetime.
pub const NULL_SERVER_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Serves `null` responses over a Content-Length-framed JSON-RPC
/// channel until the peer disconnects or `lifetime` elapses. The
/// lifetime is checked between messages; a read blocked on a silent
/// peer outlives it.
pub fn run_null_server(
    reader: &mut impl BufRead,
    writer: &mut impl Write,
    lifetime: Duration,
) -> Result<()> {
    info!("Starting degraded null responder");
    let deadline = Instant::now() + lifetime;
    while Instant::now() < deadline {
        let message = match read_message(reader)? {
            Some(message) => message,
            None => break,
        };
        // Only requests carry an id; notifications get no reply.
        let id = match message.get("id") {
            Some(id) if !id.is_null() => id.clone(),
            _ => {
                debug!("Ignoring notification");
                continue;
            }
        };
        let response = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": null,
        });
        write_message(writer, &response)?;
    }
    info!("Null responder finished");
    Ok(())
}

/// Reads one framed message. `None` on a clean disconnect.
fn read_message(reader: &mut impl BufRead) -> Result<Option<Value>> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("Content-Length:") {
            content_length = value.trim().parse().ok();
        }
    }
    let length = match content_length {
        Some(length) => length,
        // Unframed garbage; treat as a disconnect rather than guessing.
        None => return Ok(None),
    };
    let mut body = vec![0u8; length];
    std::io::Read::read_exact(reader, &mut body)?;
    match serde_json::from_slice(&body) {
        Ok(message) => Ok(Some(message)),
        Err(_) => {
            debug!("Discarding unparseable message");
            Ok(Some(Value::Null))
        }
    }
}

fn write_message(writer: &mut impl Write, message: &Value) -> Result<()> {
    let body = message.to_string();
    write!(writer, "Content-Length: {}\r\n\r\n{}", body.len(), body)?;
    writer.flush()?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
