//! Byte-bounded response streaming.

use bytes::Bytes;
use futures_util::{future, Stream, StreamExt};

/// Caps a byte stream at `limit` bytes. The final chunk is truncated if it
/// crosses the limit, and the stream ends once the limit is reached, even
/// if the source has more to give. Errors pass through untouched.
pub fn limit_bytes<S, E>(stream: S, limit: u64) -> impl Stream<Item = Result<Bytes, E>>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    stream.scan(0u64, move |written, item| {
        let item = match item {
            Ok(chunk) => {
                if *written >= limit {
                    return future::ready(None);
                }
                let remaining = limit - *written;
                let chunk = if (chunk.len() as u64) > remaining {
                    chunk.slice(..remaining as usize)
                } else {
                    chunk
                };
                *written += chunk.len() as u64;
                Some(Ok(chunk))
            }
            Err(error) => {
                tracing::warn!(%error, "error relaying response body to client");
                Some(Err(error))
            }
        };
        future::ready(item)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    async fn collected(chunks: Vec<&'static [u8]>, limit: u64) -> Vec<u8> {
        let source = stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, std::convert::Infallible>(Bytes::from_static(c))),
        );
        limit_bytes(source, limit)
            .fold(Vec::new(), |mut acc, item| {
                acc.extend_from_slice(&item.unwrap());
                async move { acc }
            })
            .await
    }

    #[tokio::test]
    async fn passes_through_under_the_limit() {
        assert_eq!(collected(vec![b"hello", b" world"], 100).await, b"hello world");
    }

    #[tokio::test]
    async fn truncates_the_crossing_chunk() {
        assert_eq!(collected(vec![b"hello", b" world"], 7).await, b"hello w");
    }

    #[tokio::test]
    async fn exact_limit_is_kept() {
        assert_eq!(collected(vec![b"hello"], 5).await, b"hello");
    }

    #[tokio::test]
    async fn zero_limit_yields_nothing() {
        assert_eq!(collected(vec![b"hello"], 0).await, b"");
    }
}
