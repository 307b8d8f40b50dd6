//! Outgoing connection to a remote engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout_at};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::TransferError;
use crate::metrics::core_metrics;
use crate::protocol::{
    ConnectInfo, Frame, FrameCodec, Message, SegmentInfo, Span, StatusInfo, TransferRequest,
};
use crate::registry::{MemRegistry, segments_cover};
use crate::types::{Endpoint, TransferOp, TransferOpDesc};

/// Upper bound of op descriptors flushed in one request.
pub(crate) const MAX_OPS_PER_BATCH: usize = 256;
/// Upper bound of data bytes carried by one request.
pub(crate) const MAX_BATCH_BYTES: u64 = 32 * 1024 * 1024;

/// Split `descs` into request batches of at most `max_ops` entries and
/// `max_bytes` data bytes. A single desc larger than `max_bytes` is cut into
/// consecutive chunks.
pub(crate) fn plan_batches(
    descs: &[TransferOpDesc],
    max_ops: usize,
    max_bytes: u64,
) -> Vec<Vec<TransferOpDesc>> {
    let max_ops = max_ops.max(1);
    let max_bytes = max_bytes.max(1);

    let mut batches = Vec::new();
    let mut current: Vec<TransferOpDesc> = Vec::new();
    let mut current_bytes = 0u64;

    for desc in descs {
        let mut offset = 0u64;
        while offset < desc.len {
            let len = (desc.len - offset).min(max_bytes);
            if current.len() == max_ops || current_bytes + len > max_bytes {
                batches.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current.push(TransferOpDesc::new(
                desc.local_addr + offset,
                desc.remote_addr + offset,
                len,
            ));
            current_bytes += len;
            offset += len;
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

type Connection = Framed<TcpStream, FrameCodec>;

/// A connected, handshaken channel to one remote engine.
///
/// Requests are strictly request/response, so the connection is serialized
/// behind an async mutex. A request that fails midway poisons the channel.
pub(crate) struct Channel {
    remote: String,
    peer_id: String,
    conn: Mutex<Option<Connection>>,
    segments: RwLock<Vec<SegmentInfo>>,
    heartbeat: CancellationToken,
    poisoned: AtomicBool,
}

impl Channel {
    /// Connect to `endpoint` and run the handshake before `deadline`.
    pub async fn connect(
        remote: String,
        endpoint: Endpoint,
        local: ConnectInfo,
        deadline: Instant,
    ) -> Result<Arc<Self>, TransferError> {
        let handshake = async {
            let stream = TcpStream::connect(endpoint.socket_addr()).await?;
            stream.set_nodelay(true)?;
            let mut conn = Framed::new(stream, FrameCodec::new());
            conn.send(Frame::new(Message::Connect(local))).await?;
            match conn.next().await {
                Some(Ok(Frame {
                    message: Message::Connected(info),
                    ..
                })) => Ok::<_, TransferError>((conn, info)),
                Some(Ok(Frame {
                    message: Message::Status(status),
                    ..
                })) => Err(status.into_result().err().unwrap_or_else(|| {
                    TransferError::Protocol("handshake answered with bare success".into())
                })),
                Some(Ok(frame)) => Err(TransferError::Protocol(format!(
                    "unexpected handshake reply {:?}",
                    frame.message.kind()
                ))),
                Some(Err(err)) => Err(err.into()),
                None => Err(TransferError::Failed(format!(
                    "{remote} closed the connection during handshake"
                ))),
            }
        };

        let (conn, info) = timeout_at(deadline, handshake).await.map_err(|_| {
            TransferError::Timeout(format!("connect to {remote} did not finish in time"))
        })??;

        info!(
            "Channel connected: remote={} peer_id={} segments={}",
            remote,
            info.channel_id,
            info.segments.len()
        );
        core_metrics().client_channels.add(1, &[]);

        Ok(Arc::new(Self {
            remote,
            peer_id: info.channel_id,
            conn: Mutex::new(Some(conn)),
            segments: RwLock::new(info.segments),
            heartbeat: CancellationToken::new(),
            poisoned: AtomicBool::new(false),
        }))
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// True once a request or heartbeat failed and the connection was dropped.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
        self.heartbeat.cancel();
    }

    /// Send one frame and wait for the reply. Poisons the channel on failure.
    async fn roundtrip(&self, frame: Frame, deadline: Instant) -> Result<Frame, TransferError> {
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return Err(TransferError::NotConnected(self.remote.clone()));
        };

        let exchange = async {
            conn.send(frame).await?;
            match conn.next().await {
                Some(Ok(reply)) => Ok::<Frame, TransferError>(reply),
                Some(Err(err)) => Err(TransferError::from(err)),
                None => Err(TransferError::NotConnected(format!(
                    "{} closed the connection",
                    self.remote
                ))),
            }
        };

        let result = match timeout_at(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Timeout(format!(
                "request to {} did not finish in time",
                self.remote
            ))),
        };
        if result.is_err() {
            warn!("Channel poisoned after failed request: remote={}", self.remote);
            *guard = None;
            self.poison();
        }
        result
    }

    /// Send a heartbeat unless a request is in flight (which counts as traffic).
    pub async fn heartbeat(&self) {
        let Ok(mut guard) = self.conn.try_lock() else {
            return;
        };
        let Some(conn) = guard.as_mut() else {
            return;
        };
        if let Err(err) = conn.send(Frame::new(Message::Heartbeat)).await {
            warn!("Heartbeat to {} failed: {}", self.remote, err);
            *guard = None;
            self.poison();
        }
    }

    /// Spawn the heartbeat loop. Stops on `stop_heartbeat` or once the channel is closed.
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) {
        let channel = Arc::downgrade(self);
        let stop = self.heartbeat.clone();
        let remote = self.remote.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(channel) = channel.upgrade() else {
                            break;
                        };
                        channel.heartbeat().await;
                    }
                }
            }
            debug!("Heartbeat loop stopped: remote={}", remote);
        });
    }

    pub fn stop_heartbeat(&self) {
        self.heartbeat.cancel();
    }

    pub async fn refresh_segments(&self, deadline: Instant) -> Result<(), TransferError> {
        match self
            .roundtrip(Frame::new(Message::GetSegments), deadline)
            .await?
            .message
        {
            Message::Segments(segments) => {
                *self.segments.write() = segments;
                Ok(())
            }
            Message::Status(status) => status.into_result(),
            other => Err(TransferError::Protocol(format!(
                "unexpected reply to GetSegments: {:?}",
                other.kind()
            ))),
        }
    }

    pub async fn fetch_metadata(
        &self,
        key: &str,
        deadline: Instant,
    ) -> Result<Option<Vec<u8>>, TransferError> {
        let frame = Frame::new(Message::GetMetadata {
            key: key.to_string(),
        });
        match self.roundtrip(frame, deadline).await?.message {
            Message::Metadata { value } => Ok(value),
            Message::Status(status) => status.into_result().map(|_| None),
            other => Err(TransferError::Protocol(format!(
                "unexpected reply to GetMetadata: {:?}",
                other.kind()
            ))),
        }
    }

    /// Tell the peer to drop our server-side channel, then close the connection.
    pub async fn disconnect(&self, channel_id: &str, deadline: Instant) -> Result<(), TransferError> {
        self.stop_heartbeat();
        if self.is_poisoned() {
            debug!("Dropping poisoned channel without notifying peer: remote={}", self.remote);
            return Ok(());
        }
        let frame = Frame::new(Message::Disconnect {
            channel_id: channel_id.to_string(),
        });
        let result = match self.roundtrip(frame, deadline).await {
            Ok(Frame {
                message: Message::Status(status),
                ..
            }) => status.into_result(),
            Ok(frame) => Err(TransferError::Protocol(format!(
                "unexpected reply to Disconnect: {:?}",
                frame.message.kind()
            ))),
            Err(err) => Err(err),
        };
        self.conn.lock().await.take();
        result
    }

    fn remote_covers(&self, descs: &[TransferOpDesc]) -> bool {
        let segments = self.segments.read();
        descs
            .iter()
            .all(|d| segments_cover(&segments, d.remote_addr, d.len))
    }

    /// Run `descs` against the peer. Returns the number of bytes moved.
    pub async fn transfer(
        &self,
        registry: &MemRegistry,
        op: TransferOp,
        descs: &[TransferOpDesc],
        deadline: Instant,
        max_ops: usize,
        max_bytes: u64,
    ) -> Result<u64, TransferError> {
        registry.access(descs.iter().map(|d| (d.local_addr, d.len)))?;

        if !self.remote_covers(descs) {
            // The peer may have registered memory after we connected.
            self.refresh_segments(deadline).await?;
            if !self.remote_covers(descs) {
                return Err(TransferError::InvalidArgument(format!(
                    "remote range is not inside memory registered by {}",
                    self.remote
                )));
            }
        }

        let mut moved = 0u64;
        for batch in plan_batches(descs, max_ops, max_bytes) {
            let spans: Vec<Span> = batch
                .iter()
                .map(|d| Span {
                    addr: d.remote_addr,
                    len: d.len,
                })
                .collect();
            let request = TransferRequest { op, spans };
            let total = request.total_len()?;

            match op {
                TransferOp::Write => {
                    let payload = {
                        let access = registry.access(batch.iter().map(|d| (d.local_addr, d.len)))?;
                        let mut payload = BytesMut::with_capacity(total as usize);
                        for d in &batch {
                            access.gather(d.local_addr, d.len, &mut payload);
                        }
                        payload.freeze()
                    };
                    let reply = self
                        .roundtrip(
                            Frame::with_payload(Message::Transfer(request), payload),
                            deadline,
                        )
                        .await?;
                    expect_status(reply.message)?;
                }
                TransferOp::Read => {
                    let reply = self
                        .roundtrip(Frame::new(Message::Transfer(request)), deadline)
                        .await?;
                    expect_status(reply.message)?;
                    if reply.payload.len() as u64 != total {
                        return Err(TransferError::Protocol(format!(
                            "read reply carried {} bytes, expected {}",
                            reply.payload.len(),
                            total
                        )));
                    }
                    let access = registry.access(batch.iter().map(|d| (d.local_addr, d.len)))?;
                    let mut offset = 0usize;
                    for d in &batch {
                        let end = offset + d.len as usize;
                        access.scatter(d.local_addr, &reply.payload[offset..end]);
                        offset = end;
                    }
                }
            }
            moved += total;
        }
        Ok(moved)
    }
}

fn expect_status(message: Message) -> Result<(), TransferError> {
    match message {
        Message::Status(status) => status.into_result(),
        other => Err(TransferError::Protocol(format!(
            "unexpected reply to Transfer: {:?}",
            other.kind()
        ))),
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.heartbeat.cancel();
        core_metrics().client_channels.add(-1, &[]);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("remote", &self.remote)
            .field("peer_id", &self.peer_id)
            .finish()
    }
}

/// Status frame for a finished request.
pub(crate) fn status_frame(result: &Result<(), TransferError>) -> Frame {
    let status = match result {
        Ok(()) => StatusInfo::ok(),
        Err(err) => StatusInfo::from_error(err),
    };
    Frame::new(Message::Status(status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_respect_op_limit() {
        let descs: Vec<_> = (0..600)
            .map(|i| TransferOpDesc::new(0x1000 + i * 16, 0x9000 + i * 16, 16))
            .collect();
        let batches = plan_batches(&descs, MAX_OPS_PER_BATCH, MAX_BATCH_BYTES);
        let sizes: Vec<_> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![256, 256, 88]);
        assert_eq!(batches[1][0], descs[256]);
    }

    #[test]
    fn large_descs_are_split_by_bytes() {
        let descs = [
            TransferOpDesc::new(0x1000, 0x8000, 10),
            TransferOpDesc::new(0x2000, 0x9000, 25),
        ];
        let batches = plan_batches(&descs, 256, 16);
        let flat: Vec<_> = batches.iter().flatten().copied().collect();
        assert_eq!(flat.iter().map(|d| d.len).sum::<u64>(), 35);
        assert!(
            batches
                .iter()
                .all(|b| b.iter().map(|d| d.len).sum::<u64>() <= 16)
        );
        assert_eq!(flat[1], TransferOpDesc::new(0x2000, 0x9000, 16));
        assert_eq!(flat[2], TransferOpDesc::new(0x2010, 0x9010, 9));
    }

    #[test]
    fn empty_input_has_no_batches() {
        assert!(plan_batches(&[], 256, 1024).is_empty());
        let zero = [TransferOpDesc::new(0x1000, 0x2000, 0)];
        assert!(plan_batches(&zero, 256, 1024).is_empty());
    }

    #[test]
    fn status_frame_carries_error_code() {
        let frame = status_frame(&Err(TransferError::Timeout("slow".into())));
        match frame.message {
            Message::Status(status) => assert_eq!(status.code, crate::status::TIMEOUT),
            other => panic!("unexpected {other:?}"),
        }
    }
}
