//! Listener side of an engine: accepts channels from peers and serves their
//! transfers against the local registry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::TransferError;
use crate::channel::status_frame;
use crate::metrics::core_metrics;
use crate::protocol::{
    ConnectInfo, Frame, FrameCodec, MAX_FRAME_SIZE, Message, StatusInfo, TransferRequest,
};
use crate::registry::MemRegistry;
use crate::types::{Endpoint, TransferOp};

/// State shared by every connection of one listener.
pub(crate) struct ServerContext {
    pub channel_id: String,
    pub comm_res: String,
    pub heartbeat_timeout: Duration,
    pub registry: Arc<MemRegistry>,
    pub metadata: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    channels: Mutex<HashMap<String, (u64, CancellationToken)>>,
    next_generation: AtomicU64,
}

impl ServerContext {
    pub fn new(
        channel_id: String,
        comm_res: String,
        heartbeat_timeout: Duration,
        registry: Arc<MemRegistry>,
        metadata: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    ) -> Self {
        Self {
            channel_id,
            comm_res,
            heartbeat_timeout,
            registry,
            metadata,
            channels: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    fn local_info(&self) -> ConnectInfo {
        ConnectInfo {
            channel_id: self.channel_id.clone(),
            comm_res: self.comm_res.clone(),
            timeout_ms: self.heartbeat_timeout.as_millis() as u64,
            segments: self.registry.segments(),
        }
    }

    /// Register a server channel, cancelling any previous one with the same id.
    fn open_channel(&self, channel_id: &str, parent: &CancellationToken) -> (u64, CancellationToken) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = parent.child_token();
        let previous = self
            .channels
            .lock()
            .insert(channel_id.to_string(), (generation, token.clone()));
        if let Some((_, old)) = previous {
            info!("Replacing existing server channel: channel_id={}", channel_id);
            old.cancel();
        }
        core_metrics().server_channels.add(1, &[]);
        (generation, token)
    }

    fn close_channel(&self, channel_id: &str, generation: u64) {
        let mut channels = self.channels.lock();
        if channels
            .get(channel_id)
            .is_some_and(|(current, _)| *current == generation)
        {
            channels.remove(channel_id);
        }
        drop(channels);
        core_metrics().server_channels.add(-1, &[]);
    }

    fn cancel_channel(&self, channel_id: &str) -> bool {
        match self.channels.lock().remove(channel_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }
}

/// Running listener. Dropping it cancels the accept loop and every channel;
/// `shutdown` additionally waits for the loop to exit.
pub(crate) struct EngineServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
    ctx: Arc<ServerContext>,
}

impl EngineServer {
    pub async fn bind(endpoint: Endpoint, ctx: Arc<ServerContext>) -> Result<Self, TransferError> {
        let listener = TcpListener::bind(endpoint.socket_addr()).await.map_err(|err| {
            TransferError::Failed(format!("failed to listen on {endpoint}: {err}"))
        })?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        info!("Engine listening: addr={} channel_id={}", local_addr, ctx.channel_id);
        let task = tokio::spawn(accept_loop(listener, Arc::clone(&ctx), shutdown.clone()));

        Ok(Self {
            local_addr,
            shutdown,
            task: Some(task),
            ctx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn channel_count(&self) -> usize {
        self.ctx.channel_count()
    }

    /// Stop accepting and close every server channel.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
        {
            error!("Engine accept loop panicked: {err}");
        }
        info!("Engine listener stopped: addr={}", self.local_addr);
    }
}

impl Drop for EngineServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ServerContext>, shutdown: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("Accept failed: {err}");
                    continue;
                }
            },
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {peer}: {err}");
        }
        let ctx = Arc::clone(&ctx);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, &ctx, &shutdown).await {
                warn!("Connection from {} ended with error: {}", peer, err);
            }
        });
    }
}

async fn serve_connection(
    stream: TcpStream,
    ctx: &ServerContext,
    shutdown: &CancellationToken,
) -> Result<(), TransferError> {
    let mut conn = Framed::new(stream, FrameCodec::new());

    let first = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return Ok(()),
        first = tokio::time::timeout(ctx.heartbeat_timeout, conn.next()) => first,
    };
    let frame = match first {
        Ok(Some(frame)) => frame?,
        Ok(None) => return Ok(()),
        Err(_) => return Err(TransferError::Timeout("no handshake received".into())),
    };

    let info = match frame.message {
        Message::Connect(info) => info,
        Message::Disconnect { channel_id } => {
            // Out-of-band disconnect on a fresh connection.
            let found = ctx.cancel_channel(&channel_id);
            debug!("Disconnect request: channel_id={} found={}", channel_id, found);
            conn.send(Frame::new(Message::Status(StatusInfo::ok()))).await?;
            return Ok(());
        }
        other => {
            let err = TransferError::Protocol(format!(
                "expected Connect as first message, got {:?}",
                other.kind()
            ));
            conn.send(status_frame(&Err(TransferError::NotConnected(err.to_string()))))
                .await?;
            return Err(err);
        }
    };

    let channel_id = info.channel_id;
    let (generation, token) = ctx.open_channel(&channel_id, shutdown);
    info!(
        "Server channel opened: channel_id={} comm_res={:?} peer_timeout_ms={}",
        channel_id, info.comm_res, info.timeout_ms
    );

    let result = match conn
        .send(Frame::new(Message::Connected(ctx.local_info())))
        .await
    {
        Ok(()) => serve_channel(&mut conn, ctx, &token, &channel_id).await,
        Err(err) => Err(err.into()),
    };

    ctx.close_channel(&channel_id, generation);
    info!("Server channel closed: channel_id={}", channel_id);
    result
}

async fn serve_channel(
    conn: &mut Framed<TcpStream, FrameCodec>,
    ctx: &ServerContext,
    token: &CancellationToken,
    channel_id: &str,
) -> Result<(), TransferError> {
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            next = tokio::time::timeout(ctx.heartbeat_timeout, conn.next()) => next,
        };
        let frame = match next {
            Ok(Some(frame)) => frame?,
            Ok(None) => return Ok(()),
            Err(_) => {
                warn!(
                    "Channel heartbeat timeout: channel_id={} timeout_ms={}",
                    channel_id,
                    ctx.heartbeat_timeout.as_millis()
                );
                core_metrics().heartbeat_expirations.add(1, &[]);
                return Ok(());
            }
        };
        core_metrics().server_requests.add(1, &[]);

        match frame.message {
            Message::Heartbeat => {}
            Message::Transfer(request) => {
                let reply = handle_transfer(&ctx.registry, request, frame.payload);
                conn.send(reply).await?;
            }
            Message::GetSegments => {
                conn.send(Frame::new(Message::Segments(ctx.registry.segments())))
                    .await?;
            }
            Message::GetMetadata { key } => {
                let value = ctx.metadata.read().get(&key).cloned();
                conn.send(Frame::new(Message::Metadata { value })).await?;
            }
            Message::Disconnect { channel_id: id } => {
                if id != channel_id {
                    warn!("Disconnect for {} received on channel {}", id, channel_id);
                }
                conn.send(Frame::new(Message::Status(StatusInfo::ok()))).await?;
                return Ok(());
            }
            Message::Connect(_) => {
                let err = TransferError::AlreadyConnected(channel_id.to_string());
                conn.send(status_frame(&Err(err))).await?;
            }
            other => {
                let err = TransferError::Protocol(format!("unexpected {:?}", other.kind()));
                conn.send(status_frame(&Err(err))).await?;
            }
        }
    }
}

/// Execute one transfer batch against local memory and build the reply.
pub(crate) fn handle_transfer(
    registry: &MemRegistry,
    request: TransferRequest,
    payload: bytes::Bytes,
) -> Frame {
    let result = (|| -> Result<Option<bytes::Bytes>, TransferError> {
        let total = request.total_len()?;
        if total > u64::from(MAX_FRAME_SIZE) / 2 {
            return Err(TransferError::InvalidArgument(format!(
                "batch of {total} bytes exceeds the per-request limit"
            )));
        }
        let access = registry.access(request.spans.iter().map(|s| (s.addr, s.len)))?;
        match request.op {
            TransferOp::Write => {
                if payload.len() as u64 != total {
                    return Err(TransferError::InvalidArgument(format!(
                        "write payload has {} bytes, spans need {}",
                        payload.len(),
                        total
                    )));
                }
                let mut offset = 0usize;
                for span in &request.spans {
                    let end = offset + span.len as usize;
                    access.scatter(span.addr, &payload[offset..end]);
                    offset = end;
                }
                Ok(None)
            }
            TransferOp::Read => {
                let mut out = BytesMut::with_capacity(total as usize);
                for span in &request.spans {
                    access.gather(span.addr, span.len, &mut out);
                }
                Ok(Some(out.freeze()))
            }
        }
    })();

    match result {
        Ok(None) => Frame::new(Message::Status(StatusInfo::ok())),
        Ok(Some(data)) => Frame::with_payload(Message::Status(StatusInfo::ok()), data),
        Err(err) => {
            core_metrics().server_rejections.add(1, &[]);
            debug!("Rejected transfer: {}", err);
            status_frame(&Err(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Span;
    use crate::types::{MemDesc, MemType};

    fn registry_over(buf: &mut [u8]) -> (MemRegistry, u64) {
        let addr = buf.as_mut_ptr() as u64;
        let registry = MemRegistry::new();
        registry
            .register(MemDesc::new(addr, buf.len() as u64), MemType::Host)
            .unwrap();
        (registry, addr)
    }

    #[test]
    fn write_then_read_against_registry() {
        let mut buf = vec![0u8; 32];
        let (registry, addr) = registry_over(&mut buf);

        let write = TransferRequest {
            op: TransferOp::Write,
            spans: vec![Span { addr, len: 2 }, Span { addr: addr + 30, len: 2 }],
        };
        let reply = handle_transfer(&registry, write, bytes::Bytes::from_static(&[1, 2, 3, 4]));
        assert_eq!(reply.message, Message::Status(StatusInfo::ok()));

        let read = TransferRequest {
            op: TransferOp::Read,
            spans: vec![Span { addr: addr + 30, len: 2 }, Span { addr, len: 2 }],
        };
        let reply = handle_transfer(&registry, read, bytes::Bytes::new());
        assert_eq!(reply.message, Message::Status(StatusInfo::ok()));
        assert_eq!(&reply.payload[..], &[3, 4, 1, 2]);
    }

    #[test]
    fn rejects_unregistered_ranges_and_short_payloads() {
        let mut buf = vec![0u8; 16];
        let (registry, addr) = registry_over(&mut buf);

        let outside = TransferRequest {
            op: TransferOp::Read,
            spans: vec![Span { addr: addr + 8, len: 16 }],
        };
        match handle_transfer(&registry, outside, bytes::Bytes::new()).message {
            Message::Status(status) => assert_eq!(status.code, crate::status::PARAM_INVALID),
            other => panic!("unexpected {other:?}"),
        }

        let short = TransferRequest {
            op: TransferOp::Write,
            spans: vec![Span { addr, len: 8 }],
        };
        match handle_transfer(&registry, short, bytes::Bytes::from_static(&[0; 4])).message {
            Message::Status(status) => assert_eq!(status.code, crate::status::PARAM_INVALID),
            other => panic!("unexpected {other:?}"),
        }
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn rejects_spans_whose_lengths_overflow() {
        let mut buf = vec![0u8; 16];
        let (registry, addr) = registry_over(&mut buf);

        let half = u64::MAX / 2 + 1;
        for op in [TransferOp::Read, TransferOp::Write] {
            let request = TransferRequest {
                op,
                spans: vec![Span { addr, len: half }; 2],
            };
            match handle_transfer(&registry, request, bytes::Bytes::new()).message {
                Message::Status(status) => assert_eq!(status.code, crate::status::PARAM_INVALID),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(buf.iter().all(|b| *b == 0));
    }
}
