/// Line-oriented stream capture for remote process output.
///
/// Drains an async byte stream into an `OutputBuffer`, one complete line at a
/// time, logging each line as it lands. A trailing fragment that never gets
/// its `\n` is dropped when the stream ends.
use crate::buffer::OutputBuffer;
use crate::prompt::PromptResponder;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 4096;

/// Which of the process's streams is being drained (used in log fields).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "STDOUT",
            StreamKind::Stderr => "STDERR",
        }
    }
}

/// Read `reader` until end of stream or error, appending complete lines to `buffer`.
///
/// When a `responder` is supplied every byte of the in-progress line is
/// checked against the password prompt. Matching restarts right after an
/// answered prompt, so each occurrence is answered once, while the line
/// itself is still appended unchanged at its real `\n`. If the answer cannot
/// be written the loop stops.
///
/// Returns the number of lines appended.
pub async fn drain<R>(
    mut reader: R,
    buffer: OutputBuffer,
    tag: &str,
    stream: StreamKind,
    mut responder: Option<PromptResponder>,
) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut line: Vec<u8> = Vec::new();
    // Offset in `line` where prompt matching starts.
    let mut scan_from = 0usize;
    let mut lines = 0usize;

    'read: loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(host = tag, stream = stream.as_str(), error = %e, "stream read failed");
                break;
            }
        };

        for &b in &chunk[..n] {
            line.push(b);

            if b == b'\n' {
                emit(&buffer, tag, stream, &line);
                lines += 1;
                line.clear();
                scan_from = 0;
                continue;
            }

            let Some(r) = responder.as_mut() else {
                continue;
            };
            if r.is_prompt(&line[scan_from..]) {
                if let Err(e) = r.answer(tag).await {
                    tracing::debug!(host = tag, error = %e, "could not answer password prompt");
                    break 'read;
                }
                scan_from = line.len();
            }
        }
    }

    if let Some(r) = &responder {
        tracing::debug!(host = tag, answered = r.answered(), "prompt scanning finished");
    }

    if !line.is_empty() {
        tracing::debug!(
            host = tag,
            stream = stream.as_str(),
            dropped_bytes = line.len(),
            "stream ended mid-line"
        );
    }
    lines
}

fn emit(buffer: &OutputBuffer, tag: &str, stream: StreamKind, line: &[u8]) {
    buffer.append(line);
    let text = String::from_utf8_lossy(&line[..line.len() - 1]);
    tracing::debug!(host = tag, stream = stream.as_str(), "{}", text);
}
