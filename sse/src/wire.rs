//! Server-side framing: serialize payloads into `data: <json>\n\n` frames
//! with monotonically increasing event ids, ending in the `[DONE]` sentinel.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::frame::DONE_SENTINEL;

/// Terminal frame for the logical stream.
pub fn encode_done() -> String {
    format!("data: {}\n\n", DONE_SENTINEL)
}

/// Assigns event ids and frames payloads for the push side. Ids start at 0 and
/// increase by one per event, which is what the resumable consumer echoes back
/// as `lastEventId`.
#[derive(Debug, Default)]
pub struct EventWriter {
    next_id: u64,
}

impl EventWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame<T: Serialize>(&mut self, payload: &T) -> anyhow::Result<String> {
        let json = serde_json::to_string(payload)?;
        let id = self.next_id;
        self.next_id += 1;
        Ok(format!("id: {}\ndata: {}\n\n", id, json))
    }
}

/// Adapt a channel of serializable events into an SSE body: one id-carrying
/// frame per event, then the done sentinel once the sender side closes.
pub fn body_stream<T: Serialize + Send + 'static>(
    rx: UnboundedReceiver<T>,
) -> impl Stream<Item = Bytes> {
    let mut writer = EventWriter::new();
    UnboundedReceiverStream::new(rx)
        .filter_map(move |event| {
            let framed = match writer.frame(&event) {
                Ok(s) => Some(Bytes::from(s)),
                Err(err) => {
                    tracing::warn!("dropping unserializable event: {err}");
                    None
                }
            };
            futures::future::ready(framed)
        })
        .chain(futures::stream::once(futures::future::ready(Bytes::from(
            encode_done(),
        ))))
}
