//! Output relay
//!
//! Reads a sandboxed program's stdout and stderr concurrently, decodes them as
//! UTF-8 without splitting characters across chunks, applies the output budget
//! and forwards ordered [`OutputChunk`]s while keeping a capped copy.

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::execution::{OutputChunk, OutputStream};
use crate::limiter::OutputBudget;
use crate::sandbox::OutputReader;

pub(crate) const CHUNK_SIZE: usize = 4096;

/// Incremental UTF-8 decoder that holds back an incomplete trailing sequence
#[derive(Debug, Default)]
pub(crate) struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /// Decode as much as possible; invalid sequences become U+FFFD
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(bytes);

        let mut out = String::with_capacity(input.len());
        let mut rest = input.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is held back at end of stream
    pub(crate) fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

/// What was kept of the program's output
#[derive(Debug, Default)]
pub(crate) struct Captured {
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

struct Relay {
    budget: OutputBudget,
    captured: Captured,
    tx: mpsc::Sender<OutputChunk>,
    receiver_gone: bool,
}

impl Relay {
    async fn forward(&mut self, stream: OutputStream, text: String) {
        let kept = self.budget.take(&text);
        if kept.is_empty() {
            return;
        }
        match stream {
            OutputStream::Stdout => self.captured.stdout.push_str(kept),
            OutputStream::Stderr => self.captured.stderr.push_str(kept),
        }
        if self.receiver_gone {
            return;
        }
        let chunk = OutputChunk {
            stream,
            data: kept.to_owned(),
        };
        if self.tx.send(chunk).await.is_err() {
            self.receiver_gone = true;
        }
    }
}

/// Read one chunk, or pend forever once the stream is closed
async fn read_some(reader: &mut Option<OutputReader>, buf: &mut [u8]) -> std::io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Relay both streams until EOF on both or until `stop` fires
pub(crate) async fn pump(
    mut stdout: Option<OutputReader>,
    mut stderr: Option<OutputReader>,
    cap: usize,
    tx: mpsc::Sender<OutputChunk>,
    stop: CancellationToken,
) -> Captured {
    let mut relay = Relay {
        budget: OutputBudget::new(cap),
        captured: Captured::default(),
        tx,
        receiver_gone: false,
    };
    let mut out_buf = vec![0u8; CHUNK_SIZE];
    let mut err_buf = vec![0u8; CHUNK_SIZE];
    let mut out_utf8 = Utf8Carry::default();
    let mut err_utf8 = Utf8Carry::default();

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            read = read_some(&mut stdout, &mut out_buf) => match read {
                Ok(0) => stdout = None,
                Ok(n) => {
                    trace!(n, "stdout chunk");
                    let text = out_utf8.push(&out_buf[..n]);
                    relay.forward(OutputStream::Stdout, text).await;
                }
                Err(e) => {
                    warn!(error = %e, "reading stdout failed");
                    stdout = None;
                }
            },
            read = read_some(&mut stderr, &mut err_buf) => match read {
                Ok(0) => stderr = None,
                Ok(n) => {
                    trace!(n, "stderr chunk");
                    let text = err_utf8.push(&err_buf[..n]);
                    relay.forward(OutputStream::Stderr, text).await;
                }
                Err(e) => {
                    warn!(error = %e, "reading stderr failed");
                    stderr = None;
                }
            },
        }
    }

    relay.forward(OutputStream::Stdout, out_utf8.finish()).await;
    relay.forward(OutputStream::Stderr, err_utf8.finish()).await;

    relay.captured.truncated = relay.budget.truncated();
    relay.captured
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn reader(bytes: &[u8]) -> Option<OutputReader> {
        Some(Box::pin(Cursor::new(bytes.to_vec())))
    }

    #[test]
    fn carry_holds_back_split_character() {
        let mut carry = Utf8Carry::default();
        let bytes = "añb".as_bytes();
        assert_eq!(carry.push(&bytes[..2]), "a");
        assert_eq!(carry.push(&bytes[2..]), "ñb");
        assert_eq!(carry.finish(), "");
    }

    #[test]
    fn carry_replaces_invalid_bytes() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.push(b"ok\xffok"), "ok\u{fffd}ok");
        assert_eq!(carry.push(b"\xe2\x82"), "");
        assert_eq!(carry.finish(), "\u{fffd}");
    }

    #[tokio::test]
    async fn pump_forwards_and_captures_both_streams() {
        let (tx, mut rx) = mpsc::channel(16);
        let captured = pump(
            reader(b"2\n"),
            reader(b"warning\n"),
            1024,
            tx,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(captured.stdout, "2\n");
        assert_eq!(captured.stderr, "warning\n");
        assert!(!captured.truncated);

        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().any(|c| c.stream == OutputStream::Stderr && c.data == "warning\n"));
    }

    #[tokio::test]
    async fn pump_truncates_at_cap() {
        let (tx, mut rx) = mpsc::channel(64);
        let big = vec![b'x'; 3 * CHUNK_SIZE];
        let captured = pump(reader(&big), None, 5000, tx, CancellationToken::new()).await;

        assert_eq!(captured.stdout.len(), 5000);
        assert!(captured.truncated);

        let mut relayed = 0;
        while let Some(chunk) = rx.recv().await {
            relayed += chunk.data.len();
        }
        assert_eq!(relayed, 5000);
    }

    #[tokio::test]
    async fn pump_keeps_capturing_without_receiver() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let captured = pump(reader(b"hello"), None, 1024, tx, CancellationToken::new()).await;
        assert_eq!(captured.stdout, "hello");
    }

    #[tokio::test]
    async fn pump_stops_when_told() {
        let (tx, _rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        stop.cancel();
        // A duplex whose writer is never closed would block forever
        let (_writer, pending) = tokio::io::duplex(64);
        let captured = pump(Some(Box::pin(pending)), None, 1024, tx, stop).await;
        assert!(captured.stdout.is_empty());
    }
}
