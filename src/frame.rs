//! The immutable unit of work handed from the Connection Layer to the
//! Pipeline (spec.md §3, "Frame").

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::buffer_pool::BufferPool;

/// Where a frame came from. TCP sessions carry a stable session id for
/// their whole lifetime; UDP has no session, only the peer address plus a
/// tag inferred per-datagram (spec.md §4.F).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    TcpSession(Uuid),
    Udp { peer: SocketAddr },
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::TcpSession(id) => write!(f, "tcp:{id}"),
            SourceDescriptor::Udp { peer } => write!(f, "udp:{peer}"),
        }
    }
}

/// One opaque byte buffer as delivered by the network layer, plus arrival
/// metadata. The buffer is owned by the Connection Layer until the Pipeline
/// accepts it; afterward ownership transfers to the Pipeline, which must
/// release the pooled backing store once decoding completes.
pub struct Frame {
    pub data: Bytes,
    pub arrived_at: DateTime<Utc>,
    pub source: SourceDescriptor,
    /// The device id the Connection Layer inferred for this frame (spec.md
    /// §4.F) — a TCP session's leading `$XX...,` tag, reused for every
    /// subsequent frame on that session, or a UDP `<tag>_<peer>` synthetic
    /// id. The Pipeline passes this straight to the decoder rather than
    /// re-deriving it from `source`.
    pub device_id: String,
    /// `data` is a zero-copy `Bytes` view sliced from this pool's own
    /// allocation (see `buffer_pool::PooledBuffer::freeze`) — no separate
    /// heap buffer is ever allocated for frame contents. `None` for frames
    /// assembled from data that never came from a pool (e.g. in tests).
    pool: Option<BufferPool>,
}

impl Frame {
    pub fn new(data: Bytes, source: SourceDescriptor, device_id: String, pool: Option<BufferPool>) -> Self {
        Frame {
            data,
            arrived_at: Utc::now(),
            source,
            device_id,
            pool,
        }
    }

    /// Return `data`'s backing allocation to the buffer pool once the
    /// Pipeline is done with it. Safe to call more than once; a second call
    /// is a no-op. Called on every path out of `process_frame` — success,
    /// a counted drop, or a retry-then-drop (spec.md §5, buffer pooling).
    pub fn release(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.reclaim(std::mem::replace(&mut self.data, Bytes::new()));
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.data.len())
            .field("arrived_at", &self.arrived_at)
            .field("source", &self.source)
            .field("device_id", &self.device_id)
            .finish()
    }
}
