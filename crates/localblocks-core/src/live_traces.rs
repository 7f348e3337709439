//! In-memory buffer of traces still receiving spans.

use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic::trace::v1::ResourceSpans;
use std::collections::HashMap;

use crate::model::{batch_trace_id, TraceId};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct LiveTrace {
    pub id: TraceId,
    pub batches: Vec<ResourceSpans>,
    /// Time of the most recent push
    pub last_write: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct LiveTraces {
    traces: HashMap<TraceId, LiveTrace>,
}

impl LiveTraces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub fn contains(&self, id: &[u8]) -> bool {
        self.traces.contains_key(id)
    }

    /// Appends the batch to its trace, creating the trace if needed.
    ///
    /// New traces are refused with `Error::LiveTracesExceeded` once
    /// `max_live_traces` distinct traces are buffered (0 means unbounded).
    /// Batches without spans are ignored.
    pub fn push(
        &mut self,
        batch: ResourceSpans,
        max_live_traces: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(id) = batch_trace_id(&batch) else {
            return Ok(());
        };

        if let Some(trace) = self.traces.get_mut(id) {
            trace.batches.push(batch);
            trace.last_write = now;
            return Ok(());
        }

        if max_live_traces > 0 && self.traces.len() as u64 >= max_live_traces {
            return Err(Error::LiveTracesExceeded);
        }

        let id = id.to_vec();
        self.traces.insert(
            id.clone(),
            LiveTrace {
                id,
                batches: vec![batch],
                last_write: now,
            },
        );
        Ok(())
    }

    /// Removes and returns every trace last written strictly before `idle_since`,
    /// or every trace when `idle_since` is `None`. The result is ordered by
    /// trace id, as blocks require ascending ids.
    pub fn cut_idle(&mut self, idle_since: Option<DateTime<Utc>>) -> Vec<LiveTrace> {
        let mut cut: Vec<LiveTrace> = match idle_since {
            None => self.traces.drain().map(|(_, t)| t).collect(),
            Some(since) => {
                let idle: Vec<TraceId> = self
                    .traces
                    .iter()
                    .filter(|(_, t)| t.last_write < since)
                    .map(|(id, _)| id.clone())
                    .collect();
                idle.iter().filter_map(|id| self.traces.remove(id)).collect()
            }
        };

        cut.sort_unstable_by(|a, b| a.id.cmp(&b.id));
        cut
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use opentelemetry_proto::tonic::trace::v1::{ScopeSpans, Span};

    fn batch(trace_id: &[u8]) -> ResourceSpans {
        ResourceSpans {
            scope_spans: vec![ScopeSpans {
                spans: vec![Span {
                    trace_id: trace_id.to_vec(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_distinct_pushes_within_limit() {
        let now = Utc::now();
        let mut lt = LiveTraces::new();
        for i in 0..10u8 {
            lt.push(batch(&[i]), 10, now).unwrap();
        }
        assert_eq!(lt.len(), 10);
    }

    #[test]
    fn test_push_appends_to_existing_trace() {
        let t0 = Utc::now();
        let mut lt = LiveTraces::new();
        lt.push(batch(&[1]), 0, t0).unwrap();
        lt.push(batch(&[1]), 0, t0 + Duration::seconds(5)).unwrap();

        assert_eq!(lt.len(), 1);
        let cut = lt.cut_idle(None);
        assert_eq!(cut[0].batches.len(), 2);
        assert_eq!(cut[0].last_write, t0 + Duration::seconds(5));
    }

    #[test]
    fn test_new_trace_rejected_at_limit() {
        let now = Utc::now();
        let mut lt = LiveTraces::new();
        lt.push(batch(b"A"), 2, now).unwrap();
        lt.push(batch(b"B"), 2, now).unwrap();

        let err = lt.push(batch(b"C"), 2, now).unwrap_err();
        assert!(matches!(err, Error::LiveTracesExceeded));
        assert_eq!(lt.len(), 2);
        assert!(!lt.contains(b"C"));

        // existing traces still accept data
        lt.push(batch(b"A"), 2, now).unwrap();
        assert_eq!(lt.len(), 2);
    }

    #[test]
    fn test_zero_limit_is_unbounded() {
        let now = Utc::now();
        let mut lt = LiveTraces::new();
        for i in 0..=255u8 {
            lt.push(batch(&[i]), 0, now).unwrap();
        }
        assert_eq!(lt.len(), 256);
    }

    #[test]
    fn test_empty_batch_ignored() {
        let mut lt = LiveTraces::new();
        lt.push(ResourceSpans::default(), 1, Utc::now()).unwrap();
        assert!(lt.is_empty());
    }

    #[test]
    fn test_cut_idle_before_all_entries_is_noop() {
        let now = Utc::now();
        let mut lt = LiveTraces::new();
        lt.push(batch(&[1]), 0, now).unwrap();
        lt.push(batch(&[2]), 0, now).unwrap();

        let cut = lt.cut_idle(Some(now - Duration::seconds(1)));
        assert!(cut.is_empty());
        assert_eq!(lt.len(), 2);

        // strictly older: an entry written exactly at the cutoff stays
        let cut = lt.cut_idle(Some(now));
        assert!(cut.is_empty());
        assert_eq!(lt.len(), 2);
    }

    #[test]
    fn test_cut_idle_all() {
        let now = Utc::now();
        let mut lt = LiveTraces::new();
        for id in [[3u8], [1u8], [2u8]] {
            lt.push(batch(&id), 0, now).unwrap();
        }

        let cut = lt.cut_idle(None);
        assert!(lt.is_empty());
        let ids: Vec<_> = cut.iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn test_cut_idle_partial_sorted() {
        let t0 = Utc::now();
        let mut lt = LiveTraces::new();
        lt.push(batch(&[0x09]), 0, t0).unwrap();
        lt.push(batch(&[0x02, 0x01]), 0, t0).unwrap();
        lt.push(batch(&[0x05]), 0, t0 + Duration::seconds(20)).unwrap();
        lt.push(batch(&[0x02]), 0, t0).unwrap();

        let cut = lt.cut_idle(Some(t0 + Duration::seconds(10)));
        let ids: Vec<_> = cut.iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec![vec![0x02], vec![0x02, 0x01], vec![0x09]]);

        assert_eq!(lt.len(), 1);
        assert!(lt.contains(&[0x05]));
    }
}
