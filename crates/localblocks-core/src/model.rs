//! Trace record encoding.
//!
//! A trace record is the protobuf encoding of an OTLP `TracesData` holding
//! every batch accumulated for one trace.

use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, TracesData};
use prost::Message;

use crate::Result;

/// Opaque trace identifier, compared bytewise
pub type TraceId = Vec<u8>;

/// Trace id of the first span in the batch. Batches reaching the engine are
/// already grouped by trace, so the first span speaks for all of them.
pub fn batch_trace_id(batch: &ResourceSpans) -> Option<&[u8]> {
    batch
        .scope_spans
        .first()
        .and_then(|ss| ss.spans.first())
        .map(|span| span.trace_id.as_slice())
}

pub fn encode_trace(batches: Vec<ResourceSpans>) -> Vec<u8> {
    TracesData {
        resource_spans: batches,
    }
    .encode_to_vec()
}

pub fn decode_trace(buf: &[u8]) -> Result<Vec<ResourceSpans>> {
    Ok(TracesData::decode(buf)?.resource_spans)
}
