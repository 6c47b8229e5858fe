//! Built-in plugins
//!
//! Context-enrichment plugins come first (range state, path walk), followed by
//! the format renderers. Every built-in is wrapped in [`Traced`].

mod byte_range;
mod car;
mod cbor;
mod dag_pb;
mod dag_walk;
mod dir_index;
mod ipns_record;
mod json;
mod raw;
mod structured;
mod tar_export;
mod traced;

pub use self::byte_range::ByteRangeContextPlugin;
pub use self::car::CarPlugin;
pub use self::cbor::CborPlugin;
pub use self::dag_pb::DagPbPlugin;
pub use self::dag_walk::DagWalkPlugin;
pub use self::dir_index::DirIndexHtmlPlugin;
pub use self::ipns_record::IpnsRecordPlugin;
pub use self::json::JsonPlugin;
pub use self::raw::RawPlugin;
pub use self::tar_export::TarPlugin;
pub use self::traced::Traced;

use crate::error::{GatewayError, Result};
use crate::pipeline::Plugin;
use crate::response::BodyStream;
use futures::StreamExt;
use libipld::multihash::{Code, MultihashDigest};
use std::future::Future;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio_util::io::ReaderStream;

/// Bytes buffered between an archive producer and the consumer
const PIPE_CAPACITY: usize = 64 * 1024;

/// The built-in plugins in dispatch order
pub fn default_plugins() -> Vec<Arc<dyn Plugin>> {
    vec![
        Traced::wrap(ByteRangeContextPlugin),
        Traced::wrap(IpnsRecordPlugin),
        Traced::wrap(DagWalkPlugin),
        Traced::wrap(CarPlugin),
        Traced::wrap(TarPlugin),
        Traced::wrap(RawPlugin),
        Traced::wrap(JsonPlugin),
        Traced::wrap(CborPlugin),
        Traced::wrap(DagPbPlugin),
        Traced::wrap(DirIndexHtmlPlugin),
    ]
}

/// Run `producer` against the write half of a bounded pipe and stream the read half
///
/// The producer suspends whenever the pipe is full, so nothing is produced
/// faster than the consumer pulls. Dropping the stream closes the pipe and
/// the producer's next write fails. A producer error is delivered as the
/// stream's last item.
pub(crate) fn piped_body<F, Fut>(producer: F) -> BodyStream
where
    F: FnOnce(DuplexStream) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    let task = tokio::spawn(producer(writer));

    let body = ReaderStream::new(reader).map(|chunk| chunk.map_err(GatewayError::from));
    let outcome = futures::stream::once(async move {
        match task.await {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(Err(err)),
            Err(err) => Some(Err(GatewayError::Internal(format!(
                "body producer failed: {}",
                err
            )))),
        }
    })
    .filter_map(|item| async move { item });

    Box::pin(body.chain(outcome))
}

/// First 8 bytes of the SHA-256 digest, hex encoded
pub(crate) fn fingerprint(bytes: &[u8]) -> String {
    let hash = Code::Sha2_256.digest(bytes);
    hash.digest()[..8]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_default_order() {
        let ids: Vec<String> = default_plugins().iter().map(|p| p.id().to_string()).collect();
        assert_eq!(
            ids,
            vec![
                "byte-range-context",
                "ipns-record",
                "dag-walk",
                "car",
                "tar",
                "raw",
                "json",
                "cbor",
                "dag-pb",
                "dir-index-html",
            ]
        );
    }

    #[tokio::test]
    async fn test_piped_body_delivers_bytes_then_error() {
        let body = piped_body(|mut writer| async move {
            writer.write_all(b"partial").await?;
            Err(GatewayError::Store("lost block".to_string()))
        });
        let items: Vec<Result<bytes::Bytes>> = body.collect().await;
        assert_eq!(&items[0].as_ref().unwrap()[..], b"partial");
        assert!(items.last().unwrap().is_err());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(fingerprint(b"abc"), "ba7816bf8f01cfea");
        assert_eq!(fingerprint(b"abc"), fingerprint(b"abc"));
        assert_ne!(fingerprint(b"abc"), fingerprint(b"abd"));
    }
}
