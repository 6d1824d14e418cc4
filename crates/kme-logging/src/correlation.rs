//! Correlation IDs for requests that cross nodes
//!
//! Issuing keys on the generator fans out to the retriever, and retrieving
//! them fans back out as a removal. Both hops carry a W3C `traceparent`
//! header so the two nodes' logs share one `trace_id`.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// HTTP header carrying the W3C trace context
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Trace position of one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationContext {
    /// Shared by every node handling the same request
    pub trace_id: Uuid,
    /// This operation, as the 8-byte W3C parent-id
    pub span_id: u64,
    /// The operation that caused this one, local or remote
    pub caused_by: Option<u64>,
    /// Node boundaries crossed since the root
    pub hops: u32,
}

impl CorrelationContext {
    pub fn new_root() -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            span_id: fresh_span_id(),
            caused_by: None,
            hops: 0,
        }
    }

    /// Context for work handed to a peer
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: fresh_span_id(),
            caused_by: Some(self.span_id),
            hops: self.hops + 1,
        }
    }

    /// Continue the caller's trace when its header parses, else start one
    pub fn from_header_or_root(traceparent: Option<&str>) -> Self {
        match traceparent.and_then(Self::from_traceparent) {
            Some(remote) => remote.child(),
            None => Self::new_root(),
        }
    }

    /// Trace ID as 32 lowercase hex digits
    pub fn trace_id_str(&self) -> String {
        self.trace_id.simple().to_string()
    }

    /// `00-{trace_id}-{span_id}-01`
    pub fn to_traceparent(&self) -> String {
        format!("00-{}-{:016x}-01", self.trace_id.simple(), self.span_id)
    }

    /// Parse a version-00 style header
    ///
    /// All-zero trace or span IDs are invalid per W3C and rejected.
    pub fn from_traceparent(header: &str) -> Option<Self> {
        let mut fields = header.trim().split('-');
        let (version, trace, span, flags) =
            (fields.next()?, fields.next()?, fields.next()?, fields.next()?);
        if fields.next().is_some() || version.len() != 2 || flags.len() != 2 {
            return None;
        }
        if trace.len() != 32 || span.len() != 16 {
            return None;
        }

        let trace_id = Uuid::from_u128(u128::from_str_radix(trace, 16).ok()?);
        let span_id = u64::from_str_radix(span, 16).ok()?;
        if trace_id.is_nil() || span_id == 0 {
            return None;
        }

        Some(Self {
            trace_id,
            span_id,
            caused_by: None,
            hops: 0,
        })
    }
}

impl Default for CorrelationContext {
    fn default() -> Self {
        Self::new_root()
    }
}

impl fmt::Display for CorrelationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:016x}", self.trace_id.simple(), self.span_id)
    }
}

fn fresh_span_id() -> u64 {
    // Zero means "no span" on the wire
    Uuid::new_v4().as_u128() as u64 | 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_links_to_parent() {
        let root = CorrelationContext::new_root();
        let child = root.child();

        assert_eq!(child.trace_id, root.trace_id);
        assert_ne!(child.span_id, root.span_id);
        assert_eq!(child.caused_by, Some(root.span_id));
        assert_eq!(child.hops, 1);
        assert_eq!(child.child().hops, 2);
    }

    #[test]
    fn test_traceparent_header_form() {
        let ctx = CorrelationContext::new_root();
        let header = ctx.to_traceparent();
        assert!(header.starts_with("00-"));
        assert!(header.ends_with("-01"));
        assert_eq!(header.len(), 55);

        let parsed = CorrelationContext::from_traceparent(&header).unwrap();
        assert_eq!(parsed.trace_id, ctx.trace_id);
        assert_eq!(parsed.span_id, ctx.span_id);
    }

    #[test]
    fn test_rejects_bad_headers() {
        for header in [
            "",
            "00-abc-def-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-extra",
            "00-4bf92f3577b34da6a3ce929d0e0e473z-00f067aa0ba902b7-01",
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01",
        ] {
            assert!(
                CorrelationContext::from_traceparent(header).is_none(),
                "accepted {header:?}"
            );
        }
    }

    #[test]
    fn test_inbound_header_continues_trace() {
        let upstream = CorrelationContext::new_root();

        let continued =
            CorrelationContext::from_header_or_root(Some(&upstream.to_traceparent()));
        assert_eq!(continued.trace_id, upstream.trace_id);
        assert_eq!(continued.caused_by, Some(upstream.span_id));
        assert_eq!(continued.hops, 1);

        let fresh = CorrelationContext::from_header_or_root(Some("garbage"));
        assert_ne!(fresh.trace_id, upstream.trace_id);
        assert_eq!(fresh.hops, 0);
        assert_eq!(CorrelationContext::from_header_or_root(None).hops, 0);
    }

    #[test]
    fn test_known_w3c_example_parses() {
        let ctx = CorrelationContext::from_traceparent(
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        )
        .unwrap();
        assert_eq!(ctx.trace_id_str(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(ctx.span_id, 0x00f0_67aa_0ba9_02b7);
    }
}
