//! Length-prefixed trace frame intake.
//!
//! Each frame is a big-endian `u32` length followed by a protobuf
//! `TracesData` message.

use anyhow::{bail, Context};
use localblocks_core::model::decode_trace;
use localblocks_core::SpanProcessor;
use opentelemetry_proto::tonic::trace::v1::ResourceSpans;
use std::io::{self, Read};
use std::thread;
use tokio::sync::mpsc;
use tracing::debug;

pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Decoded frames waiting to be pushed
const FRAME_QUEUE: usize = 64;

pub type Frame = Result<Vec<ResourceSpans>, anyhow::Error>;

/// Reads the next frame, `None` once the input is exhausted
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<ResourceSpans>>, anyhow::Error> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds the {} byte limit", len, MAX_FRAME_LEN);
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .with_context(|| format!("truncated frame, expected {} bytes", len))?;

    Ok(Some(decode_trace(&buf)?))
}

/// Decodes frames from `reader` on a dedicated thread. The thread is never
/// joined: a read blocked on idle input must not hold up shutdown, and it
/// stops on its own once the receiver is dropped and the next frame arrives.
pub fn spawn_reader<R: Read + Send + 'static>(mut reader: R) -> Result<mpsc::Receiver<Frame>, anyhow::Error> {
    let (tx, rx) = mpsc::channel(FRAME_QUEUE);
    thread::Builder::new()
        .name("frame-reader".into())
        .spawn(move || loop {
            let frame: Frame = match read_frame(&mut reader) {
                Ok(Some(batches)) => Ok(batches),
                Ok(None) => break,
                Err(e) => Err(e),
            };
            let failed = frame.is_err();
            if tx.blocking_send(frame).is_err() || failed {
                break;
            }
        })?;
    Ok(rx)
}

/// Pushes every received frame into the processor. Returns the number of
/// frames pushed once the reader is done.
pub async fn ingest<P>(frames: &mut mpsc::Receiver<Frame>, processor: &P) -> Result<u64, anyhow::Error>
where
    P: SpanProcessor + ?Sized,
{
    let mut count = 0;
    while let Some(frame) = frames.recv().await {
        let batches = frame?;
        debug!(batches = batches.len(), "Frame received");
        processor.push_spans(batches).await;
        count += 1;
    }
    Ok(count)
}
