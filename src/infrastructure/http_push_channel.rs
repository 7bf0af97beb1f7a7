// Push channel over a long-lived chunked HTTP response
use crate::application::push_channel::{PushChannel, PushFrame, PushStream};
use crate::domain::error::MalformedEvent;
use crate::domain::query_key::QueryKey;
use crate::infrastructure::chunked_frames::{decode_payload, FrameDecoder};
use crate::infrastructure::wire;
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use futures::StreamExt;

#[derive(Debug, Clone)]
pub struct HttpPushChannel {
    base_url: String,
    token: Option<String>,
    compressed: bool,
    client: reqwest::Client,
}

impl HttpPushChannel {
    pub fn new(base_url: String, token: Option<String>, compressed: bool) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            compressed,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PushChannel for HttpPushChannel {
    async fn subscribe(&self, key: &QueryKey) -> anyhow::Result<PushStream> {
        let url = format!("{}/metrics/stream", self.base_url);
        let mut request = self.client.get(&url).query(&wire::metrics_request(key));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        tracing::debug!(key = %key, "Opening push stream");
        let response = request
            .send()
            .await
            .context("Failed to open push stream")?;

        if !response.status().is_success() {
            anyhow::bail!("Push stream rejected with status {}", response.status());
        }

        Ok(decode_frames(response.bytes_stream(), self.compressed).boxed())
    }
}

/// Turn raw body chunks into decoded push frames. Undecodable payloads are
/// yielded as malformed events; broken framing ends the stream with an error.
pub fn decode_frames<S, E>(
    chunks: S,
    compressed: bool,
) -> impl Stream<Item = anyhow::Result<PushFrame>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    async_stream::try_stream! {
        let mut chunks = Box::pin(chunks);
        let mut decoder = FrameDecoder::new();

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.context("Push stream interrupted")?;
            decoder.extend(&chunk);

            while let Some(frame) = decoder.next_frame()? {
                let payload = decode_payload(frame, compressed).await?;
                let event = match serde_json::from_slice::<serde_json::Value>(&payload) {
                    Ok(value) => wire::decode_push_event(value),
                    Err(e) => Err(MalformedEvent::new(format!("invalid JSON: {}", e))),
                };
                yield event;
            }
        }

        if decoder.pending() > 0 {
            Err::<(), _>(anyhow::anyhow!("Push stream ended inside a frame"))?;
        }
    }
}
