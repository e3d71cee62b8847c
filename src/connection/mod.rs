//! The Connection Layer (spec.md §4.F): TCP acceptor and UDP endpoint,
//! sharing one Pipeline intake and one statistics tracker.

pub mod stats;
pub mod tcp;
pub mod udp;

pub use stats::ConnectionStats;
pub use tcp::TcpAcceptor;
pub use udp::UdpEndpoint;

/// Infer a device tag from a leading `$XX...,` pattern: talker+type, the
/// first 5 characters after `$` (spec.md §4.F). Returns `None` when the
/// frame doesn't start with the pattern, so callers can fall back to a
/// session- or peer-derived id.
pub(crate) fn infer_tag(frame: &[u8]) -> Option<String> {
    if frame.first() != Some(&b'$') {
        return None;
    }
    let body = &frame[1..];
    if body.len() < 5 || !body[..5].iter().all(|b| b.is_ascii_alphanumeric()) {
        return None;
    }
    std::str::from_utf8(&body[..5]).ok().map(str::to_string)
}
