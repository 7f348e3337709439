use opentelemetry_proto::tonic::trace::v1::{span::SpanKind, ResourceSpans, ScopeSpans};

/// Reduces a batch to its server-kind spans.
///
/// Spans are moved as-is into fresh scope groups; resource and scope values
/// carry over untouched. Scope groups left empty are dropped, and `None` is
/// returned when no server span remains.
pub fn filter_batch(batch: ResourceSpans) -> Option<ResourceSpans> {
    let scope_spans: Vec<ScopeSpans> = batch
        .scope_spans
        .into_iter()
        .filter_map(|ss| {
            let spans: Vec<_> = ss
                .spans
                .into_iter()
                .filter(|s| s.kind == SpanKind::Server as i32)
                .collect();

            if spans.is_empty() {
                return None;
            }
            Some(ScopeSpans {
                scope: ss.scope,
                spans,
                schema_url: ss.schema_url,
            })
        })
        .collect();

    if scope_spans.is_empty() {
        return None;
    }

    Some(ResourceSpans {
        resource: batch.resource,
        scope_spans,
        schema_url: batch.schema_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::common::v1::InstrumentationScope;
    use opentelemetry_proto::tonic::resource::v1::Resource;
    use opentelemetry_proto::tonic::trace::v1::Span;

    fn span(name: &str, kind: SpanKind) -> Span {
        Span {
            trace_id: vec![1; 16],
            name: name.to_string(),
            kind: kind as i32,
            ..Default::default()
        }
    }

    fn scope(name: &str, spans: Vec<Span>) -> ScopeSpans {
        ScopeSpans {
            scope: Some(InstrumentationScope {
                name: name.to_string(),
                ..Default::default()
            }),
            spans,
            ..Default::default()
        }
    }

    #[test]
    fn test_no_server_spans_drops_batch() {
        let batch = ResourceSpans {
            scope_spans: vec![
                scope("a", vec![span("c1", SpanKind::Client), span("i1", SpanKind::Internal)]),
                scope("b", vec![span("p1", SpanKind::Producer)]),
            ],
            ..Default::default()
        };
        assert!(filter_batch(batch).is_none());
    }

    #[test]
    fn test_empty_batch_drops() {
        assert!(filter_batch(ResourceSpans::default()).is_none());
    }

    #[test]
    fn test_keeps_only_server_spans() {
        let resource = Resource::default();
        let batch = ResourceSpans {
            resource: Some(resource.clone()),
            scope_spans: vec![
                scope("a", vec![span("s1", SpanKind::Server), span("c1", SpanKind::Client)]),
                scope("b", vec![span("c2", SpanKind::Client)]),
                scope("c", vec![span("s2", SpanKind::Server), span("s3", SpanKind::Server)]),
            ],
            schema_url: "https://example.test/schema".to_string(),
        };

        let out = filter_batch(batch).expect("server spans present");

        assert_eq!(out.resource, Some(resource));
        assert_eq!(out.schema_url, "https://example.test/schema");
        assert_eq!(out.scope_spans.len(), 2);

        assert_eq!(out.scope_spans[0].scope.as_ref().unwrap().name, "a");
        let names: Vec<_> = out.scope_spans[0].spans.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["s1"]);

        assert_eq!(out.scope_spans[1].scope.as_ref().unwrap().name, "c");
        let names: Vec<_> = out.scope_spans[1].spans.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["s2", "s3"]);
    }

    #[test]
    fn test_server_spans_are_unchanged() {
        let mut original = span("s1", SpanKind::Server);
        original.span_id = vec![9; 8];
        original.start_time_unix_nano = 42;
        let batch = ResourceSpans {
            scope_spans: vec![scope("a", vec![original.clone()])],
            ..Default::default()
        };

        let out = filter_batch(batch).unwrap();
        assert_eq!(out.scope_spans[0].spans[0], original);
    }
}
