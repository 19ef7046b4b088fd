//! Incremental SSE frame decoding and a callback-driven parse loop.
//!
//! `FrameDecoder` is pure buffering logic (bytes in, frames out) so it can be
//! tested without IO; `parse` drives it over a byte stream with cancellation
//! checked before every read, including the first.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

/// Payload literal that ends the logical stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One decoded frame: the joined `data:` payload plus an optional event id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub id: Option<String>,
    pub data: String,
}

impl Frame {
    pub fn is_done(&self) -> bool {
        self.data == DONE_SENTINEL
    }
}

/// Buffering decoder. Frames are delimited by a blank line; within a frame
/// every `data:` line contributes to the payload (joined with `\n`) and the
/// last `id:` line, if any, becomes the frame id. Frames without a `data:`
/// line are discarded.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every frame completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some(pos) = self.buf.find("\n\n") {
            let raw: String = self.buf.drain(..pos + 2).collect();
            if let Some(frame) = decode_frame(&raw) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing partial frame at end-of-stream.
    pub fn finish(&mut self) -> Option<Frame> {
        let raw = std::mem::take(&mut self.buf);
        decode_frame(&raw)
    }
}

fn decode_frame(raw: &str) -> Option<Frame> {
    let mut data: Vec<&str> = Vec::new();
    let mut id = None;

    for line in raw.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else if let Some(rest) = line.strip_prefix("id:") {
            id = Some(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
        // Other fields (event:, retry:, comments) are ignored.
    }

    if data.is_empty() {
        return None;
    }
    Some(Frame {
        id,
        data: data.join("\n"),
    })
}

/// Callbacks for the parse loop. `on_error` is optional: when present a
/// decode failure is routed there and the loop stops; when absent the
/// failure propagates out of `parse`.
pub struct ParseHooks<T> {
    pub on_chunk: Box<dyn FnMut(T) + Send>,
    pub on_done: Box<dyn FnMut() + Send>,
    pub on_error: Option<Box<dyn FnMut(anyhow::Error) + Send>>,
}

impl<T> ParseHooks<T> {
    pub fn new(
        on_chunk: impl FnMut(T) + Send + 'static,
        on_done: impl FnMut() + Send + 'static,
    ) -> Self {
        Self {
            on_chunk: Box::new(on_chunk),
            on_done: Box::new(on_done),
            on_error: None,
        }
    }

    pub fn with_on_error(mut self, on_error: impl FnMut(anyhow::Error) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(on_error));
        self
    }
}

enum Step {
    Continue,
    Stop,
}

/// Consume a byte stream of SSE frames, decoding each payload with `decode`.
///
/// A payload equal to [`DONE_SENTINEL`] fires `on_done` and ends the loop
/// without reaching `on_chunk`. Cancellation is observed before the first
/// read: a pre-cancelled call returns without invoking any callback.
pub async fn parse<S, T, D>(
    stream: S,
    decode: D,
    mut hooks: ParseHooks<T>,
    cancel: Option<CancellationToken>,
) -> anyhow::Result<()>
where
    S: Stream<Item = anyhow::Result<Bytes>>,
    D: Fn(&str) -> anyhow::Result<T>,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = FrameDecoder::new();

    loop {
        if cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Ok(());
        }

        let next = match &cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                next = stream.next() => next,
            },
            None => stream.next().await,
        };

        match next {
            Some(Ok(chunk)) => {
                for frame in decoder.feed(&chunk) {
                    match dispatch(frame, &decode, &mut hooks)? {
                        Step::Continue => {}
                        Step::Stop => return Ok(()),
                    }
                }
            }
            Some(Err(err)) => match hooks.on_error.as_mut() {
                Some(on_error) => {
                    on_error(err);
                    return Ok(());
                }
                None => return Err(err),
            },
            None => {
                // End of stream: a partial buffered frame gets one final attempt.
                if let Some(frame) = decoder.finish() {
                    let _ = dispatch(frame, &decode, &mut hooks)?;
                }
                return Ok(());
            }
        }
    }
}

fn dispatch<T, D>(frame: Frame, decode: &D, hooks: &mut ParseHooks<T>) -> anyhow::Result<Step>
where
    D: Fn(&str) -> anyhow::Result<T>,
{
    if frame.is_done() {
        (hooks.on_done)();
        return Ok(Step::Stop);
    }
    match decode(&frame.data) {
        Ok(value) => {
            (hooks.on_chunk)(value);
            Ok(Step::Continue)
        }
        Err(err) => match hooks.on_error.as_mut() {
            Some(on_error) => {
                on_error(err);
                Ok(Step::Stop)
            }
            None => Err(err),
        },
    }
}
