//! The TCP acceptor (spec.md §4.F): one reader task per session, feeding a
//! shared Pipeline intake.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::buffer_pool::BufferPool;
use crate::connection::infer_tag;
use crate::connection::stats::ConnectionStats;
use crate::frame::{Frame, SourceDescriptor};
use crate::pipeline::PipelineHandle;

pub struct TcpAcceptor {
    listener: TcpListener,
    pipeline: PipelineHandle,
    buffer_pool: BufferPool,
    stats: Arc<ConnectionStats>,
    max_connections: usize,
    active_connections: Arc<AtomicUsize>,
}

impl TcpAcceptor {
    pub async fn bind(
        addr: SocketAddr,
        pipeline: PipelineHandle,
        buffer_pool: BufferPool,
        stats: Arc<ConnectionStats>,
        max_connections: usize,
    ) -> std::io::Result<Self> {
        let socket = if addr.is_ipv4() {
            tokio::net::TcpSocket::new_v4()?
        } else {
            tokio::net::TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(1024)?;

        Ok(TcpAcceptor {
            listener,
            pipeline,
            buffer_pool,
            stats,
            max_connections,
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `cancel` fires, spawning a reader task per
    /// session. Refuses accept (drops the socket immediately) once the
    /// active count reaches `max_connections` (spec.md §4.F).
    pub async fn run(self, cancel: CancellationToken) {
        info!("tcp acceptor listening on {:?}", self.listener.local_addr());
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("tcp acceptor stopping");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.handle_accept(stream, peer, &cancel),
                        Err(e) => warn!("tcp accept error: {e}"),
                    }
                }
            }
        }
    }

    fn handle_accept(&self, stream: TcpStream, peer: SocketAddr, cancel: &CancellationToken) {
        if self.active_connections.load(Ordering::Relaxed) >= self.max_connections {
            warn!("refusing connection from {peer}: max concurrent connections reached");
            drop(stream);
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY for {peer}: {e}");
        }

        let session_id = Uuid::new_v4();
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.session_opened();

        let pipeline = self.pipeline.clone();
        let buffer_pool = self.buffer_pool.clone();
        let stats = self.stats.clone();
        let active = self.active_connections.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            session_reader_loop(session_id, stream, peer, pipeline, buffer_pool, stats.clone(), cancel).await;
            active.fetch_sub(1, Ordering::Relaxed);
            stats.session_closed();
            debug!("session {session_id} ({peer}) closed");
        });
    }
}

async fn session_reader_loop(
    session_id: Uuid,
    mut stream: TcpStream,
    peer: SocketAddr,
    pipeline: PipelineHandle,
    buffer_pool: BufferPool,
    stats: Arc<ConnectionStats>,
    cancel: CancellationToken,
) {
    let mut device_id: Option<String> = None;

    loop {
        let mut pooled = buffer_pool.rent();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("session {session_id} ({peer}) observed shutdown signal");
                break;
            }
            read = stream.read(pooled.as_mut_slice()) => read,
        };

        let n = match read {
            Ok(0) => {
                debug!("session {session_id} ({peer}) reached EOF");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("session {session_id} ({peer}) read error: {e}");
                break;
            }
        };

        let data = pooled.freeze(n);

        if device_id.is_none() {
            device_id = Some(infer_tag(&data).unwrap_or_else(|| session_id.to_string()));
        }

        stats.message_received();
        let frame = Frame::new(
            data,
            SourceDescriptor::TcpSession(session_id),
            device_id.clone().unwrap_or_else(|| session_id.to_string()),
            Some(buffer_pool.clone()),
        );

        if pipeline.enqueue(frame).await.is_err() {
            warn!("session {session_id} ({peer}) pipeline intake closed, dropping connection");
            break;
        }
    }

    // Give a pending in-flight read a moment to observe cancellation before
    // the socket is dropped, matching the "close all session readers,
    // draining their pending buffers" shutdown step (spec.md §5).
    tokio::time::sleep(Duration::from_millis(0)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_an_ephemeral_port() {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let pipeline = PipelineHandleTestExt::from_sender(tx);
        let pool = BufferPool::new(16);
        let stats = ConnectionStats::new();
        let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), pipeline, pool, stats, 10)
            .await
            .unwrap();
        assert!(acceptor.local_addr().unwrap().port() > 0);
    }

    // `PipelineHandle`'s fields are private to the crate, so tests build one
    // through this crate-internal extension rather than duplicating state.
    trait PipelineHandleTestExt {
        fn from_sender(sender: tokio::sync::mpsc::Sender<Frame>) -> PipelineHandle;
    }
    impl PipelineHandleTestExt for PipelineHandle {
        fn from_sender(sender: tokio::sync::mpsc::Sender<Frame>) -> PipelineHandle {
            crate::pipeline::test_support::handle_from_sender(sender)
        }
    }
}
