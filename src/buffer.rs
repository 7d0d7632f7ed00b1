/// Append-only text buffer shared between one drain task and any number of readers.
///
/// The drain task is the only writer and appends whole lines (terminated with
/// `\n`). Readers see a growing prefix and can subscribe to be woken whenever
/// new bytes land, instead of polling in a tight loop.
use std::sync::{Arc, RwLock};
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct OutputBuffer {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    text: RwLock<String>,
    len_tx: watch::Sender<usize>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        let (len_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                text: RwLock::new(String::new()),
                len_tx,
            }),
        }
    }

    /// Append bytes to the end of the buffer and wake subscribers.
    ///
    /// Invalid UTF-8 is replaced rather than rejected; daemon output is
    /// diagnostic text, not data.
    pub fn append(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let new_len = {
            let mut text = match self.inner.text.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            text.push_str(&String::from_utf8_lossy(bytes));
            text.len()
        };
        self.inner.len_tx.send_replace(new_len);
    }

    /// Current length in bytes.
    pub fn len(&self) -> usize {
        *self.inner.len_tx.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Literal, case-sensitive substring test against everything captured so far.
    pub fn contains(&self, needle: &str) -> bool {
        self.read(|text| text.contains(needle))
    }

    /// Copy of everything captured so far.
    pub fn snapshot(&self) -> String {
        self.read(|text| text.to_string())
    }

    /// Complete lines starting at byte offset `cursor`.
    ///
    /// Returns the lines (without their `\n`) and the cursor to pass next
    /// time. A trailing fragment without a terminator is left for the next
    /// call.
    pub fn lines_after(&self, cursor: usize) -> (Vec<String>, usize) {
        self.read(|text| {
            let Some(rest) = text.get(cursor..) else {
                return (Vec::new(), cursor);
            };
            let Some(last_newline) = rest.rfind('\n') else {
                return (Vec::new(), cursor);
            };
            let complete = &rest[..last_newline];
            let lines = complete.split('\n').map(str::to_string).collect();
            (lines, cursor + last_newline + 1)
        })
    }

    /// Receiver that changes whenever the buffer grows.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.inner.len_tx.subscribe()
    }

    fn read<T>(&self, f: impl FnOnce(&str) -> T) -> T {
        let text = match self.inner.text.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&text)
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_contains() {
        let buf = OutputBuffer::new();
        assert!(buf.is_empty());
        buf.append(b"ptp4l[1.0]: port 1: INITIALIZING to LISTENING on INIT_COMPLETE\n");
        assert!(buf.contains("INITIALIZING to LISTENING"));
        assert!(!buf.contains("initializing to listening"));
        assert_eq!(buf.len(), buf.snapshot().len());
    }

    #[test]
    fn test_clones_share_content() {
        let writer = OutputBuffer::new();
        let reader = writer.clone();
        writer.append(b"hello\n");
        assert_eq!(reader.snapshot(), "hello\n");
    }

    #[test]
    fn test_lines_after_walks_complete_lines() {
        let buf = OutputBuffer::new();
        buf.append(b"one\ntwo\n");
        let (lines, cursor) = buf.lines_after(0);
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(cursor, 8);

        buf.append(b"three\n");
        let (lines, cursor) = buf.lines_after(cursor);
        assert_eq!(lines, vec!["three"]);
        assert_eq!(cursor, 14);

        let (lines, same) = buf.lines_after(cursor);
        assert!(lines.is_empty());
        assert_eq!(same, cursor);
    }

    #[test]
    fn test_lines_after_leaves_partial_line() {
        let buf = OutputBuffer::new();
        buf.append(b"done\npart");
        let (lines, cursor) = buf.lines_after(0);
        assert_eq!(lines, vec!["done"]);
        assert_eq!(cursor, 5);
    }

    #[test]
    fn test_lines_after_keeps_empty_lines() {
        let buf = OutputBuffer::new();
        buf.append(b"\n\nx\n");
        let (lines, _) = buf.lines_after(0);
        assert_eq!(lines, vec!["", "", "x"]);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let buf = OutputBuffer::new();
        buf.append(&[b'a', 0xff, b'\n']);
        assert!(buf.snapshot().starts_with('a'));
        assert!(buf.snapshot().ends_with('\n'));
    }

    #[tokio::test]
    async fn test_subscribers_are_notified() {
        let buf = OutputBuffer::new();
        let mut rx = buf.subscribe();
        let writer = buf.clone();
        tokio::spawn(async move {
            writer.append(b"line\n");
        });
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 5);
    }
}
