//! Response bodies as binary streams.

use std::io::{self, Write};

use bytes::Bytes;
use flate2::write::GzDecoder;
use futures::{Stream, StreamExt};
use moult::BinaryStream;
use tokio_util::io::StreamReader;

/// Whether a download named `name` should be gunzipped on the fly.
///
/// Bodies the server already marked as gzip-encoded are left alone.
pub(crate) fn wants_gunzip(name: &str, content_encoding: Option<&str>) -> bool {
    name.ends_with(".gz") && content_encoding != Some("gzip")
}

pub(crate) fn into_binary<S>(body: S, gunzip: bool) -> BinaryStream
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    if gunzip {
        Box::pin(StreamReader::new(gunzip_stream(body)))
    } else {
        Box::pin(StreamReader::new(body))
    }
}

fn gunzip_stream<S>(body: S) -> impl Stream<Item = io::Result<Bytes>> + Send
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    let state = Some((Box::pin(body), GzDecoder::new(Vec::new())));
    futures::stream::unfold(state, |state| async move {
        let (mut body, mut decoder) = state?;
        loop {
            match body.next().await {
                Some(Ok(chunk)) => {
                    if let Err(err) = decoder.write_all(&chunk) {
                        return Some((Err(err), None));
                    }
                    let inflated = std::mem::take(decoder.get_mut());
                    if !inflated.is_empty() {
                        return Some((Ok(Bytes::from(inflated)), Some((body, decoder))));
                    }
                }
                Some(Err(err)) => return Some((Err(err), None)),
                None => {
                    return match decoder.finish() {
                        Ok(rest) if rest.is_empty() => None,
                        Ok(rest) => Some((Ok(Bytes::from(rest)), None)),
                        Err(err) => Some((Err(err), None)),
                    }
                }
            }
        }
    })
}
