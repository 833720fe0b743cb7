use async_trait::async_trait;
use bytes::Bytes;

use crate::error::SourceError;

/// Pull-based byte-chunk capability.
///
/// One operation: read the next chunk, or signal end. `Ok(None)` is natural
/// exhaustion; `Err` is a read failure, which downstream consumers treat as
/// an ordinary end of stream (see [`crate::decode`]).
#[async_trait]
pub trait ByteSource: Send {
    async fn pull(&mut self) -> Result<Option<Bytes>, SourceError>;
}

/// Boxed byte source for dynamic dispatch across connector implementations.
pub type BoxByteSource = Box<dyn ByteSource>;

#[async_trait]
impl<T: ByteSource + ?Sized> ByteSource for Box<T> {
    async fn pull(&mut self) -> Result<Option<Bytes>, SourceError> {
        (**self).pull().await
    }
}

/// In-memory byte source yielding a fixed script of chunks.
///
/// `fail_after_script` makes the source raise a read failure once the
/// script is exhausted instead of signalling a clean end.
pub struct ScriptedSource {
    chunks: std::collections::VecDeque<Bytes>,
    fail_after_script: bool,
}

impl ScriptedSource {
    #[must_use]
    pub fn new<I>(chunks: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            fail_after_script: false,
        }
    }

    /// A source whose every pull raises a read failure.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            chunks: std::collections::VecDeque::new(),
            fail_after_script: true,
        }
    }
}

#[async_trait]
impl ByteSource for ScriptedSource {
    async fn pull(&mut self) -> Result<Option<Bytes>, SourceError> {
        match self.chunks.pop_front() {
            Some(chunk) => Ok(Some(chunk)),
            None if self.fail_after_script => {
                Err(SourceError("scripted read failure".to_string()))
            }
            None => Ok(None),
        }
    }
}

/// Byte source that waits for an external permit before each pull.
///
/// Used to hold an exchange suspended at a pull boundary so a test can
/// interleave machine actions between two deltas.
pub struct GatedSource {
    inner: ScriptedSource,
    permits: tokio::sync::mpsc::UnboundedReceiver<()>,
}

impl GatedSource {
    #[must_use]
    pub fn new(
        inner: ScriptedSource,
    ) -> (Self, tokio::sync::mpsc::UnboundedSender<()>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { inner, permits: rx }, tx)
    }
}

#[async_trait]
impl ByteSource for GatedSource {
    async fn pull(&mut self) -> Result<Option<Bytes>, SourceError> {
        if self.permits.recv().await.is_none() {
            // Gate dropped: behave like a disconnect.
            return Err(SourceError("gate closed".to_string()));
        }
        self.inner.pull().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_source_yields_chunks_in_order() {
        let mut source = ScriptedSource::new(["ab", "cd"]);
        assert_eq!(source.pull().await.unwrap(), Some(Bytes::from("ab")));
        assert_eq!(source.pull().await.unwrap(), Some(Bytes::from("cd")));
        assert_eq!(source.pull().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failing_source_raises_on_first_pull() {
        let mut source = ScriptedSource::failing();
        assert!(source.pull().await.is_err());
    }

    #[tokio::test]
    async fn test_gated_source_waits_for_permit() {
        let (mut source, permits) = GatedSource::new(ScriptedSource::new(["x"]));
        permits.send(()).unwrap();
        assert_eq!(source.pull().await.unwrap(), Some(Bytes::from("x")));
        drop(permits);
        assert!(source.pull().await.is_err());
    }
}
