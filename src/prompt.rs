/// Answers privilege-escalation prompts that show up on a process's stderr.
///
/// The responder does not read anything itself. `capture::drain` owns the
/// stream and hands it the in-progress line after every byte, so stderr is
/// read exactly once and is still captured for diagnostics.
use crate::config::PromptConfig;
use crate::secret::Secret;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

pub struct PromptResponder {
    prefix: String,
    suffix: String,
    secret: Secret,
    sink: Box<dyn AsyncWrite + Send + Unpin>,
    answered: u32,
}

impl PromptResponder {
    pub fn new(
        config: &PromptConfig,
        secret: Secret,
        sink: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Self {
        Self {
            prefix: config.prefix.clone(),
            suffix: config.suffix.clone(),
            secret,
            sink,
            answered: 0,
        }
    }

    /// Whether the in-progress line is a complete password prompt.
    pub fn is_prompt(&self, line: &[u8]) -> bool {
        line.starts_with(self.prefix.as_bytes()) && line.ends_with(self.suffix.as_bytes())
    }

    /// Write the secret followed by a newline to the process's stdin.
    pub async fn answer(&mut self, tag: &str) -> std::io::Result<()> {
        tracing::info!(host = tag, "remote requested sudo password, entering it");
        let mut reply = Zeroizing::new(Vec::with_capacity(self.secret.expose().len() + 1));
        reply.extend_from_slice(self.secret.expose().as_bytes());
        reply.push(b'\n');
        self.sink.write_all(&reply).await?;
        self.sink.flush().await?;
        self.answered += 1;
        Ok(())
    }

    /// Number of prompts answered so far.
    pub fn answered(&self) -> u32 {
        self.answered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responder(sink: Box<dyn AsyncWrite + Send + Unpin>) -> PromptResponder {
        PromptResponder::new(&PromptConfig::default(), Secret::new("s3cret"), sink)
    }

    #[test]
    fn test_is_prompt_needs_prefix_and_suffix() {
        let r = responder(Box::new(tokio::io::sink()));
        assert!(r.is_prompt(b"[sudo] password for alice: "));
        assert!(!r.is_prompt(b"[sudo] password for alice"));
        assert!(!r.is_prompt(b"[sudo] password for "));
        assert!(!r.is_prompt(b"password for alice: "));
        assert!(!r.is_prompt(b"xx [sudo] password for alice: "));
    }

    #[tokio::test]
    async fn test_answer_writes_secret_and_newline() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let mut r = responder(Box::new(writer));
        r.answer("test").await.unwrap();
        assert_eq!(r.answered(), 1);

        let mut got = vec![0u8; 7];
        tokio::io::AsyncReadExt::read_exact(&mut reader, &mut got)
            .await
            .unwrap();
        assert_eq!(got, b"s3cret\n");
    }

    #[tokio::test]
    async fn test_answer_fails_when_sink_closed() {
        let (writer, reader) = tokio::io::duplex(64);
        drop(reader);
        let mut r = responder(Box::new(writer));
        assert!(r.answer("test").await.is_err());
        assert_eq!(r.answered(), 0);
    }
}
