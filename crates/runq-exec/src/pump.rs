//! Line pumps from a child's output streams into a job's log buffer.
//!
//! Each pump runs in its own task, splits the stream on `\n` (dropping a
//! trailing `\r`), decodes lossily and appends every line to the buffer as it
//! arrives. A trailing partial line is flushed at EOF.
use std::sync::Arc;

use runq_core::BoundedLogBuffer;
use tokio::{io::AsyncReadExt, task::JoinHandle};
use tracing::trace;

use crate::error::ExecError;

/// Which stream a pump reads; stderr lines carry a prefix in the buffer.
#[derive(Debug, Clone)]
pub enum LineStream {
    Stdout,
    Stderr { prefix: String },
}

impl LineStream {
    pub fn label(&self) -> &'static str {
        match self {
            LineStream::Stdout => "stdout",
            LineStream::Stderr { .. } => "stderr",
        }
    }
}

/// Spawn a pump copying `rd` into `buffer`. Resolves to the number of lines stored.
pub fn pump_lines<R>(
    mut rd: R,
    buffer: Arc<BoundedLogBuffer>,
    stream: LineStream,
) -> JoinHandle<Result<u64, ExecError>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let label = stream.label();
        let mut buf = vec![0u8; 8 * 1024];
        let mut line_buf: Vec<u8> = Vec::with_capacity(1024);
        let mut lines = 0u64;

        loop {
            let n = rd.read(&mut buf).await.map_err(|e| ExecError::Pump {
                stream: label,
                reason: e.to_string(),
            })?;
            if n == 0 {
                break;
            }

            line_buf.extend_from_slice(&buf[..n]);
            while let Some(pos) = line_buf.iter().position(|&b| b == b'\n') {
                let one: Vec<u8> = line_buf.drain(..=pos).collect();
                emit(&buffer, &stream, &one);
                lines += 1;
            }
        }

        if !line_buf.is_empty() {
            emit(&buffer, &stream, &line_buf);
            lines += 1;
        }
        trace!(target: "runq.exec.pump", stream = label, lines, "eof");
        Ok(lines)
    })
}

fn emit(buffer: &BoundedLogBuffer, stream: &LineStream, raw: &[u8]) {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let line = String::from_utf8_lossy(raw);
    match stream {
        LineStream::Stdout => buffer.add(line.into_owned()),
        LineStream::Stderr { prefix } => buffer.add_prefixed(prefix, &line),
    };
}
