//! W3C trace-context propagation for outbound requests.
//!
//! The gateway participates in distributed traces by carrying the
//! `traceparent` header across the proxy hop: an inbound context is continued
//! with a fresh span id, and requests that arrive without one start a new
//! trace. `baggage` needs no handling here since all request headers are
//! forwarded verbatim.

use http::header::HeaderValue;
use http::HeaderMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const TRACEPARENT: &str = "traceparent";

/// One process-wide PRNG, seeded once at startup. Shared by trace-id
/// generation and by the router's traffic splits.
static RNG: Lazy<Mutex<StdRng>> = Lazy::new(|| Mutex::new(StdRng::from_entropy()));

/// Runs `f` with the shared process RNG.
pub(crate) fn with_rng<T>(f: impl FnOnce(&mut StdRng) -> T) -> T {
    f(&mut RNG.lock())
}

/// A parsed `traceparent` value: `00-{trace_id}-{span_id}-{flags}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: u128,
    pub span_id: u64,
    pub flags: u8,
}

impl TraceContext {
    /// Starts a new sampled trace with random ids.
    pub fn new() -> Self {
        let (trace_id, span_id) = with_rng(|rng| (rng.gen::<u128>(), rng.gen::<u64>()));
        Self {
            trace_id: trace_id.max(1),
            span_id: span_id.max(1),
            flags: 0x01,
        }
    }

    /// Parses a `traceparent` header value. Returns `None` for anything that
    /// is not a well-formed version-00 value with non-zero ids.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() {
            return None;
        }

        if version != "00" || trace_id.len() != 32 || span_id.len() != 16 || flags.len() != 2 {
            return None;
        }

        let trace_id = u128::from_str_radix(trace_id, 16).ok()?;
        let span_id = u64::from_str_radix(span_id, 16).ok()?;
        let flags = u8::from_str_radix(flags, 16).ok()?;
        if trace_id == 0 || span_id == 0 {
            return None;
        }

        Some(Self {
            trace_id,
            span_id,
            flags,
        })
    }

    /// Continues an inbound context, or starts a new trace when the request
    /// carries no usable `traceparent`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(TRACEPARENT)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::parse)
            .map(|ctx| ctx.child())
            .unwrap_or_default()
    }

    /// A child context: same trace, fresh span id.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: with_rng(|rng| rng.gen::<u64>()).max(1),
            flags: self.flags,
        }
    }

    /// Renders the `traceparent` wire form.
    pub fn render(&self) -> String {
        format!(
            "00-{:032x}-{:016x}-{:02x}",
            self.trace_id, self.span_id, self.flags
        )
    }

    /// Writes this context into `headers`, replacing any inbound value so the
    /// upstream sees the gateway's hop as its parent.
    pub fn inject(&self, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(&self.render()) {
            headers.insert(TRACEPARENT, value);
        }
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_parse_round_trip() {
        let ctx = TraceContext::new();
        let parsed = TraceContext::parse(&ctx.render()).unwrap();
        assert_eq!(ctx, parsed);
    }

    #[test]
    fn test_parse_valid() {
        let ctx =
            TraceContext::parse("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01").unwrap();
        assert_eq!(ctx.trace_id, 0x4bf92f3577b34da6a3ce929d0e0e4736);
        assert_eq!(ctx.span_id, 0x00f067aa0ba902b7);
        assert_eq!(ctx.flags, 0x01);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(TraceContext::parse("").is_none());
        assert!(TraceContext::parse("01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
            .is_none());
        assert!(TraceContext::parse("00-short-00f067aa0ba902b7-01").is_none());
        // All-zero ids are invalid per the wire format.
        assert!(TraceContext::parse("00-00000000000000000000000000000000-00f067aa0ba902b7-01")
            .is_none());
        assert!(TraceContext::parse("00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01")
            .is_none());
    }

    #[test]
    fn test_child_keeps_trace_id() {
        let ctx = TraceContext::new();
        let child = ctx.child();
        assert_eq!(ctx.trace_id, child.trace_id);
        assert_ne!(ctx.span_id, child.span_id);
    }

    #[test]
    fn test_from_headers_continues_trace() {
        let mut headers = HeaderMap::new();
        headers.insert(
            TRACEPARENT,
            HeaderValue::from_static("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"),
        );
        let ctx = TraceContext::from_headers(&headers);
        assert_eq!(ctx.trace_id, 0x4bf92f3577b34da6a3ce929d0e0e4736);
        assert_ne!(ctx.span_id, 0x00f067aa0ba902b7);
    }

    #[test]
    fn test_inject_overwrites() {
        let mut headers = HeaderMap::new();
        headers.insert(TRACEPARENT, HeaderValue::from_static("garbage"));
        let ctx = TraceContext::new();
        ctx.inject(&mut headers);
        assert_eq!(headers.get(TRACEPARENT).unwrap(), &ctx.render());
    }
}
