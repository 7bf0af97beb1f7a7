// Length-prefixed frame streaming utilities
//
// Each frame is a 4-byte big-endian length followed by that many payload
// bytes. Payloads are JSON, optionally Brotli-compressed frame by frame.
use anyhow::{bail, Context};
use async_compression::tokio::bufread::{BrotliDecoder, BrotliEncoder};
use axum::body::Body;
use axum::http::{header, Response, StatusCode};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::stream::Stream;
use futures::StreamExt;
use serde::Serialize;
use tokio::io::AsyncReadExt;

const LENGTH_PREFIX: usize = 4;

/// Frames larger than this are treated as a corrupt stream
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Create a chunked streaming response from a stream of serializable items
pub fn chunked_json_stream<S, T>(stream: S, compress: bool) -> Result<Response<Body>, StatusCode>
where
    S: Stream<Item = T> + Send + 'static,
    T: Serialize + Send + Sync + 'static,
{
    let byte_stream = stream.then(move |item| async move { serialize_chunk(&item, compress).await });

    let body = Body::from_stream(byte_stream);

    // No Content-Encoding: frames are compressed individually, not the
    // HTTP body as a whole.
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndframes+json")
        .header(header::TRANSFER_ENCODING, "chunked")
        .body(body)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Serialize a single item to a length-prefixed chunk
pub async fn serialize_chunk<T: Serialize>(item: &T, compress: bool) -> Result<Bytes, std::io::Error> {
    // 1. Serialize to JSON
    let buffer = serde_json::to_vec(item).map_err(std::io::Error::other)?;

    // 2. Optionally compress
    let payload = if compress {
        let mut encoder = BrotliEncoder::new(std::io::Cursor::new(buffer));
        let mut compressed = Vec::new();
        encoder.read_to_end(&mut compressed).await?;
        compressed
    } else {
        buffer
    };

    // 3. Prepend length
    let mut chunk = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
    chunk.put_u32(payload.len() as u32);
    chunk.put_slice(&payload);

    Ok(chunk.freeze())
}

/// Undo the optional per-frame compression
pub async fn decode_payload(frame: Bytes, compressed: bool) -> anyhow::Result<Vec<u8>> {
    if !compressed {
        return Ok(frame.to_vec());
    }

    let mut decoder = BrotliDecoder::new(std::io::Cursor::new(frame));
    let mut payload = Vec::new();
    decoder
        .read_to_end(&mut payload)
        .await
        .context("Failed to decompress push frame")?;
    Ok(payload)
}

/// Reassembles frames from arbitrarily split network chunks
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete frame, `Ok(None)` if more bytes are needed
    pub fn next_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        if self.buffer.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut prefix = &self.buffer[..LENGTH_PREFIX];
        let length = prefix.get_u32() as usize;
        if length > MAX_FRAME_LEN {
            bail!("push frame of {} bytes exceeds limit of {}", length, MAX_FRAME_LEN);
        }
        if self.buffer.len() < LENGTH_PREFIX + length {
            return Ok(None);
        }

        self.buffer.advance(LENGTH_PREFIX);
        Ok(Some(self.buffer.split_to(length).freeze()))
    }

    /// Bytes of an incomplete frame left over
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
