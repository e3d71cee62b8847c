//! The UDP endpoint (spec.md §4.F): one stateless receiver loop, synthetic
//! per-datagram device ids.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{info, warn};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::buffer_pool::BufferPool;
use crate::connection::infer_tag;
use crate::connection::stats::ConnectionStats;
use crate::frame::{Frame, SourceDescriptor};
use crate::pipeline::PipelineHandle;

pub struct UdpEndpoint {
    socket: UdpSocket,
    pipeline: PipelineHandle,
    buffer_pool: BufferPool,
    stats: Arc<ConnectionStats>,
}

impl UdpEndpoint {
    pub async fn bind(
        addr: SocketAddr,
        pipeline: PipelineHandle,
        buffer_pool: BufferPool,
        stats: Arc<ConnectionStats>,
    ) -> std::io::Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::DGRAM,
            None,
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;

        Ok(UdpEndpoint {
            socket,
            pipeline,
            buffer_pool,
            stats,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Read datagrams into pooled buffers until `cancel` fires. Device id is
    /// `<talker+type>_<peer-address>` with colons replaced for topic-key
    /// safety (spec.md §4.F) — the peer address is the only affinity
    /// mechanism since UDP carries no session state.
    pub async fn run(self, cancel: CancellationToken) {
        info!("udp endpoint listening on {:?}", self.socket.local_addr());
        self.stats.set_udp_active(true);

        loop {
            let mut pooled = self.buffer_pool.rent();
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("udp endpoint stopping");
                    break;
                }
                received = self.socket.recv_from(pooled.as_mut_slice()) => received,
            };

            let (n, peer) = match received {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("udp recv error: {e}");
                    continue;
                }
            };

            let data = pooled.freeze(n);
            let tag = infer_tag(&data).unwrap_or_else(|| "unknown".to_string());
            let device_id = format!("{tag}_{peer}").replace(':', "_");

            self.stats.message_received();
            let frame = Frame::new(
                data,
                SourceDescriptor::Udp { peer },
                device_id,
                Some(self.buffer_pool.clone()),
            );

            if self.pipeline.enqueue(frame).await.is_err() {
                warn!("udp endpoint pipeline intake closed, stopping");
                break;
            }
        }

        self.stats.set_udp_active(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_an_ephemeral_port() {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let pipeline = crate::pipeline::test_support::handle_from_sender(tx);
        let pool = BufferPool::new(16);
        let stats = ConnectionStats::new();
        let endpoint = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap(), pipeline, pool, stats)
            .await
            .unwrap();
        assert!(endpoint.local_addr().unwrap().port() > 0);
    }
}
