//! Rendezvous store: a small key/value service with counters and named
//! barriers, hosted by rank 0 of a [`ProcessGroup`].

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::TransferError;
use crate::protocol::{Frame, FrameCodec, Message, StatusInfo, StoreReply, StoreRequest};

/// Extra time granted to a request on top of its own wait budget.
const REQUEST_SLACK: Duration = Duration::from_secs(5);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

struct BarrierState {
    generation: u64,
    world_size: u32,
    arrived: u32,
    released: watch::Sender<bool>,
}

#[derive(Default)]
struct StoreState {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
    changed: Notify,
    barriers: Mutex<HashMap<String, BarrierState>>,
    next_generation: AtomicU64,
}

impl StoreState {
    fn set(&self, key: String, value: Vec<u8>) {
        self.data.lock().insert(key, value);
        self.changed.notify_waiters();
    }

    async fn get(&self, key: &str, wait: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.data.lock().get(key).cloned() {
                return Some(value);
            }
            if wait.is_zero() || timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    fn add(&self, key: String, delta: i64) -> Result<i64, TransferError> {
        let mut data = self.data.lock();
        let current = match data.get(&key) {
            None => 0,
            Some(raw) => std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| {
                    TransferError::InvalidArgument(format!("key '{key}' does not hold a counter"))
                })?,
        };
        let value = current.wrapping_add(delta);
        data.insert(key, value.to_string().into_bytes());
        drop(data);
        self.changed.notify_waiters();
        Ok(value)
    }

    fn delete(&self, key: &str) -> bool {
        self.data.lock().remove(key).is_some()
    }

    fn list(&self, prefix: &str) -> Vec<String> {
        self.data
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }

    async fn barrier(
        &self,
        name: String,
        world_size: u32,
        wait: Duration,
    ) -> Result<(), TransferError> {
        if world_size == 0 {
            return Err(TransferError::InvalidArgument(
                "barrier world size must be positive".into(),
            ));
        }
        let (generation, mut released) = {
            let mut barriers = self.barriers.lock();
            let state = barriers.entry(name.clone()).or_insert_with(|| BarrierState {
                generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
                world_size,
                arrived: 0,
                released: watch::channel(false).0,
            });
            if state.world_size != world_size {
                return Err(TransferError::InvalidArgument(format!(
                    "barrier '{name}' expects {} participants, got {}",
                    state.world_size, world_size
                )));
            }
            state.arrived += 1;
            if state.arrived == world_size {
                if let Some(state) = barriers.remove(&name) {
                    state.released.send_replace(true);
                }
                debug!("Barrier released: name={} world_size={}", name, world_size);
                return Ok(());
            }
            (state.generation, state.released.subscribe())
        };

        let deadline = Instant::now() + wait;
        match timeout_at(deadline, released.wait_for(|done| *done)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TransferError::Failed(format!("barrier '{name}' was dropped"))),
            Err(_) => {
                let mut barriers = self.barriers.lock();
                if let Some(state) = barriers.get_mut(&name)
                    && state.generation == generation
                {
                    state.arrived -= 1;
                    if state.arrived == 0 {
                        barriers.remove(&name);
                    }
                }
                Err(TransferError::Timeout(format!("barrier '{name}'")))
            }
        }
    }

    async fn handle(&self, request: StoreRequest) -> StoreReply {
        let result = match request {
            StoreRequest::Set { key, value } => {
                self.set(key, value);
                Ok(StoreReply::Released)
            }
            StoreRequest::Get { key, wait_ms } => Ok(StoreReply::Value(
                self.get(&key, Duration::from_millis(wait_ms)).await,
            )),
            StoreRequest::Add { key, delta } => self.add(key, delta).map(StoreReply::Counter),
            StoreRequest::Delete { key } => Ok(StoreReply::Deleted(self.delete(&key))),
            StoreRequest::List { prefix } => Ok(StoreReply::Keys(self.list(&prefix))),
            StoreRequest::Barrier {
                name,
                world_size,
                timeout_ms,
            } => self
                .barrier(name, world_size, Duration::from_millis(timeout_ms))
                .await
                .map(|_| StoreReply::Released),
        };
        result.unwrap_or_else(|err| StoreReply::Error(StatusInfo::from_error(&err)))
    }
}

/// The store service. Dropping it stops accepting and closes every client.
pub struct RendezvousServer {
    local_addr: SocketAddr,
    state: Arc<StoreState>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RendezvousServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransferError> {
        let listener = TcpListener::bind(addr).await.map_err(|err| {
            TransferError::Failed(format!("rendezvous store cannot listen on {addr}: {err}"))
        })?;
        let local_addr = listener.local_addr()?;
        let state = Arc::new(StoreState::default());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, Arc::clone(&state), shutdown.clone()));
        info!("Rendezvous store listening: addr={}", local_addr);
        Ok(Self {
            local_addr,
            state,
            shutdown,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn key_count(&self) -> usize {
        self.state.data.lock().len()
    }

    pub fn pending_barriers(&self) -> usize {
        self.state.barriers.lock().len()
    }

    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
        {
            error!("Rendezvous accept loop panicked: {err}");
        }
        info!("Rendezvous store stopped: addr={}", self.local_addr);
    }
}

impl Drop for RendezvousServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<StoreState>, shutdown: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("Rendezvous accept failed: {err}");
                    continue;
                }
            },
        };
        if let Err(err) = stream.set_nodelay(true) {
            warn!("Rendezvous set_nodelay failed for {}: {}", peer, err);
        }
        let state = Arc::clone(&state);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut conn = Framed::new(stream, FrameCodec::new());
            loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    next = conn.next() => next,
                };
                let reply = match next {
                    None => break,
                    Some(Err(err)) => {
                        debug!("Rendezvous client {} dropped: {}", peer, err);
                        break;
                    }
                    Some(Ok(Frame {
                        message: Message::Store(request),
                        ..
                    })) => {
                        tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => break,
                            reply = state.handle(request) => reply,
                        }
                    }
                    Some(Ok(frame)) => StoreReply::Error(StatusInfo::from_error(
                        &TransferError::Protocol(format!(
                            "unexpected {:?} on rendezvous connection",
                            frame.message.kind()
                        )),
                    )),
                };
                if let Err(err) = conn.send(Frame::new(Message::StoreReply(reply))).await {
                    debug!("Rendezvous reply to {} failed: {}", peer, err);
                    break;
                }
            }
        });
    }
}

/// Client of a [`RendezvousServer`]. Requests are serialized on one connection.
pub struct RendezvousClient {
    addr: SocketAddr,
    conn: tokio::sync::Mutex<Framed<TcpStream, FrameCodec>>,
}

impl RendezvousClient {
    /// Connect to `addr`, retrying until `timeout` elapses.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, TransferError> {
        let deadline = Instant::now() + timeout;
        let mut attempts = 0u32;
        let stream = loop {
            attempts += 1;
            match timeout_at(deadline, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => break stream,
                Ok(Err(err)) => {
                    if Instant::now() + CONNECT_RETRY_INTERVAL >= deadline {
                        return Err(TransferError::Timeout(format!(
                            "rendezvous store {addr} unreachable after {attempts} attempts: {err}"
                        )));
                    }
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(_) => {
                    return Err(TransferError::Timeout(format!(
                        "rendezvous store {addr} unreachable after {attempts} attempts"
                    )));
                }
            }
        };
        stream.set_nodelay(true)?;
        debug!("Rendezvous client connected: addr={} attempts={}", addr, attempts);
        Ok(Self {
            addr,
            conn: tokio::sync::Mutex::new(Framed::new(stream, FrameCodec::new())),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn request(&self, request: StoreRequest, wait: Duration) -> Result<StoreReply, TransferError> {
        let deadline = Instant::now() + wait + REQUEST_SLACK;
        let mut conn = self.conn.lock().await;
        let exchange = async {
            conn.send(Frame::new(Message::Store(request))).await?;
            match conn.next().await {
                Some(Ok(Frame {
                    message: Message::StoreReply(reply),
                    ..
                })) => Ok::<StoreReply, TransferError>(reply),
                Some(Ok(frame)) => Err(TransferError::Protocol(format!(
                    "unexpected {:?} from rendezvous store",
                    frame.message.kind()
                ))),
                Some(Err(err)) => Err(TransferError::from(err)),
                None => Err(TransferError::NotConnected(format!(
                    "rendezvous store {}",
                    self.addr
                ))),
            }
        };
        match timeout_at(deadline, exchange).await {
            Ok(Ok(StoreReply::Error(status))) => Err(status
                .into_result()
                .err()
                .unwrap_or_else(|| TransferError::Protocol("error reply without code".into()))),
            Ok(result) => result,
            Err(_) => Err(TransferError::Timeout(format!(
                "rendezvous request to {}",
                self.addr
            ))),
        }
    }

    pub async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), TransferError> {
        let request = StoreRequest::Set {
            key: key.to_string(),
            value,
        };
        match self.request(request, Duration::ZERO).await? {
            StoreReply::Released => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Value of `key`, waiting up to `wait` for it to be set.
    pub async fn get(&self, key: &str, wait: Duration) -> Result<Option<Vec<u8>>, TransferError> {
        let request = StoreRequest::Get {
            key: key.to_string(),
            wait_ms: wait.as_millis() as u64,
        };
        match self.request(request, wait).await? {
            StoreReply::Value(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Add `delta` to the counter at `key` and return the new value.
    pub async fn add(&self, key: &str, delta: i64) -> Result<i64, TransferError> {
        let request = StoreRequest::Add {
            key: key.to_string(),
            delta,
        };
        match self.request(request, Duration::ZERO).await? {
            StoreReply::Counter(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<bool, TransferError> {
        let request = StoreRequest::Delete {
            key: key.to_string(),
        };
        match self.request(request, Duration::ZERO).await? {
            StoreReply::Deleted(found) => Ok(found),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, TransferError> {
        let request = StoreRequest::List {
            prefix: prefix.to_string(),
        };
        match self.request(request, Duration::ZERO).await? {
            StoreReply::Keys(keys) => Ok(keys),
            other => Err(unexpected(other)),
        }
    }

    /// Block until `world_size` participants reached barrier `name`.
    pub async fn barrier(
        &self,
        name: &str,
        world_size: u32,
        timeout: Duration,
    ) -> Result<(), TransferError> {
        let request = StoreRequest::Barrier {
            name: name.to_string(),
            world_size,
            timeout_ms: timeout.as_millis() as u64,
        };
        match self.request(request, timeout).await? {
            StoreReply::Released => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: StoreReply) -> TransferError {
    TransferError::Protocol(format!("unexpected rendezvous reply {reply:?}"))
}

/// A fixed-size group of processes synchronizing through a rendezvous store.
pub struct ProcessGroup {
    rank: u32,
    world_size: u32,
    timeout: Duration,
    client: RendezvousClient,
    server: Option<RendezvousServer>,
    barrier_seq: AtomicU64,
}

impl ProcessGroup {
    /// Join the group. Rank 0 hosts the store on `master_addr`; every rank
    /// then waits until all `world_size` ranks have joined.
    pub async fn init(
        rank: u32,
        world_size: u32,
        master_addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Self, TransferError> {
        if world_size == 0 || rank >= world_size {
            return Err(TransferError::InvalidArgument(format!(
                "rank {rank} is outside world size {world_size}"
            )));
        }
        info!(
            "Init process group: rank={} world_size={} master={}",
            rank, world_size, master_addr
        );
        let server = if rank == 0 {
            Some(RendezvousServer::bind(master_addr).await?)
        } else {
            None
        };
        let client = RendezvousClient::connect(master_addr, timeout).await?;
        client.barrier("pg/init", world_size, timeout).await?;
        info!("Process group ready: rank={} world_size={}", rank, world_size);

        Ok(Self {
            rank,
            world_size,
            timeout,
            client,
            server,
            barrier_seq: AtomicU64::new(0),
        })
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    pub fn client(&self) -> &RendezvousClient {
        &self.client
    }

    /// Wait for every rank to reach the same barrier call.
    pub async fn barrier(&self) -> Result<(), TransferError> {
        let seq = self.barrier_seq.fetch_add(1, Ordering::Relaxed);
        let name = format!("pg/barrier/{seq}");
        debug!("Barrier enter: rank={} name={}", self.rank, name);
        self.client
            .barrier(&name, self.world_size, self.timeout)
            .await
    }

    /// Leave the group. Rank 0 waits for the other ranks before stopping the store.
    pub async fn shutdown(self) {
        if let Err(err) = self
            .client
            .barrier("pg/shutdown", self.world_size, self.timeout)
            .await
        {
            warn!("Process group shutdown barrier failed: rank={} err={}", self.rank, err);
        }
        drop(self.client);
        if let Some(server) = self.server {
            server.shutdown().await;
        }
    }
}
