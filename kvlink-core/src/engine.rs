//! Transfer engine: memory registration, channels to remote engines and
//! one-sided READ/WRITE transfers.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::TransferError;
use crate::channel::{Channel, MAX_BATCH_BYTES, MAX_OPS_PER_BATCH};
use crate::metrics::core_metrics;
use crate::protocol::ConnectInfo;
use crate::registry::MemRegistry;
use crate::server::{EngineServer, ServerContext};
use crate::types::{
    Endpoint, MemDesc, MemHandle, MemType, TransferOp, TransferOpDesc, TransferReq, TransferStatus,
};

/// Tunables for a [`TransferEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Used by callers that do not pass an explicit connect timeout.
    pub connect_timeout: Duration,
    /// Period of client heartbeats.
    pub heartbeat_interval: Duration,
    /// Idle time after which the listener closes an incoming channel.
    pub heartbeat_timeout: Duration,
    pub max_ops_per_batch: usize,
    pub max_batch_bytes: u64,
    /// Free-form local communication resource description sent on connect.
    pub comm_res: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(120),
            max_ops_per_batch: MAX_OPS_PER_BATCH,
            max_batch_bytes: MAX_BATCH_BYTES,
            comm_res: String::new(),
        }
    }
}

/// Turn a user supplied remote string into the key channels are stored under.
fn remote_key(remote: &str) -> Result<(String, Endpoint), TransferError> {
    let endpoint: Endpoint = remote.parse()?;
    if !endpoint.is_listening() {
        return Err(TransferError::InvalidArgument(format!(
            "remote engine '{remote}' must include a port"
        )));
    }
    Ok((endpoint.to_string(), endpoint))
}

fn check_timeout(timeout: Duration) -> Result<(), TransferError> {
    if timeout.is_zero() {
        return Err(TransferError::InvalidArgument(
            "timeout must be greater than zero".into(),
        ));
    }
    Ok(())
}

/// Removes a remote from the in-progress set when a connect attempt ends.
struct PendingConnect<'a> {
    connecting: &'a Mutex<HashSet<String>>,
    remote: String,
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        self.connecting.lock().remove(&self.remote);
    }
}

struct EngineState {
    config: EngineConfig,
    endpoint: Endpoint,
    channel_id: String,
    registry: Arc<MemRegistry>,
    metadata: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    clients: Mutex<HashMap<String, Arc<Channel>>>,
    connecting: Mutex<HashSet<String>>,
    server: Mutex<Option<EngineServer>>,
    local_addr: Option<SocketAddr>,
    requests: Mutex<HashMap<u64, JoinHandle<Result<(), TransferError>>>>,
    next_request: AtomicU64,
}

impl EngineState {
    fn channel(&self, key: &str) -> Result<Arc<Channel>, TransferError> {
        self.clients
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| TransferError::NotConnected(key.to_string()))
    }

    async fn transfer(
        &self,
        remote: &str,
        op: TransferOp,
        descs: &[TransferOpDesc],
        timeout: Duration,
    ) -> Result<(), TransferError> {
        let (key, _) = remote_key(remote)?;
        let channel = self.channel(&key)?;
        if descs.is_empty() {
            return Ok(());
        }

        let start = std::time::Instant::now();
        let result = channel
            .transfer(
                &self.registry,
                op,
                descs,
                Instant::now() + timeout,
                self.config.max_ops_per_batch,
                self.config.max_batch_bytes,
            )
            .await;

        let metrics = core_metrics();
        match &result {
            Ok(bytes) => {
                let elapsed = start.elapsed();
                metrics.transfer_bytes.add(*bytes, &[]);
                metrics.transfer_ops.add(descs.len() as u64, &[]);
                metrics
                    .transfer_duration_ms
                    .record(elapsed.as_secs_f64() * 1000.0, &[]);
                debug!(
                    "Transfer done: remote={} op={:?} descs={} bytes={} elapsed_us={}",
                    key,
                    op,
                    descs.len(),
                    bytes,
                    elapsed.as_micros()
                );
            }
            Err(err) => {
                metrics.transfer_failures.add(1, &[]);
                warn!(
                    "Transfer failed: remote={} op={:?} descs={} err={}",
                    key,
                    op,
                    descs.len(),
                    err
                );
            }
        }
        result.map(|_| ())
    }
}

fn validate_descs(descs: &[TransferOpDesc]) -> Result<(), TransferError> {
    for (i, desc) in descs.iter().enumerate() {
        if desc.local_addr == 0 || desc.remote_addr == 0 {
            return Err(TransferError::InvalidArgument(format!(
                "transfer desc {i} has a null address"
            )));
        }
    }
    Ok(())
}

/// A peer-to-peer transfer engine.
///
/// Every operation except [`initialize`](Self::initialize) fails with
/// [`TransferError::NotInitialized`] before initialization and after
/// [`finalize`](Self::finalize).
pub struct TransferEngine {
    config: EngineConfig,
    init_lock: tokio::sync::Mutex<()>,
    state: RwLock<Option<Arc<EngineState>>>,
}

impl TransferEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            init_lock: tokio::sync::Mutex::new(()),
            state: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn state(&self) -> Result<Arc<EngineState>, TransferError> {
        self.state
            .read()
            .as_ref()
            .cloned()
            .ok_or(TransferError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().is_some()
    }

    /// Start the engine on `local_engine` (`ip`, `ip:port`, `[v6]:port`).
    ///
    /// A non-zero port starts a listener. Calling this on an initialized
    /// engine succeeds without doing anything.
    pub async fn initialize(&self, local_engine: &str) -> Result<(), TransferError> {
        let _init = self.init_lock.lock().await;
        if let Some(state) = self.state.read().as_ref() {
            info!(
                "Engine already initialized: channel_id={} requested={}",
                state.channel_id, local_engine
            );
            return Ok(());
        }

        let endpoint: Endpoint = local_engine.parse()?;
        let channel_id = if endpoint.is_listening() {
            endpoint.to_string()
        } else {
            format!("{}#{}", endpoint.ip, uuid::Uuid::new_v4())
        };

        let registry = Arc::new(MemRegistry::new());
        let metadata = Arc::new(RwLock::new(HashMap::new()));
        let server = if endpoint.is_listening() {
            let ctx = Arc::new(ServerContext::new(
                channel_id.clone(),
                self.config.comm_res.clone(),
                self.config.heartbeat_timeout,
                Arc::clone(&registry),
                Arc::clone(&metadata),
            ));
            Some(EngineServer::bind(endpoint, ctx).await?)
        } else {
            None
        };
        let local_addr = server.as_ref().map(EngineServer::local_addr);

        *self.state.write() = Some(Arc::new(EngineState {
            config: self.config.clone(),
            endpoint,
            channel_id: channel_id.clone(),
            registry,
            metadata,
            clients: Mutex::new(HashMap::new()),
            connecting: Mutex::new(HashSet::new()),
            server: Mutex::new(server),
            local_addr,
            requests: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(0),
        }));

        info!(
            "Engine initialized: channel_id={} listening={}",
            channel_id,
            endpoint.is_listening()
        );
        Ok(())
    }

    /// Endpoint this engine was initialized with.
    pub fn local_engine(&self) -> Result<Endpoint, TransferError> {
        Ok(self.state()?.endpoint)
    }

    /// Identifier peers know this engine by.
    pub fn channel_id(&self) -> Result<String, TransferError> {
        Ok(self.state()?.channel_id.clone())
    }

    /// Bound listener address, `None` for client-only engines.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state().ok().and_then(|state| state.local_addr)
    }

    /// Make `desc` readable and writable by peers.
    ///
    /// # Safety
    ///
    /// `desc` must describe memory that stays mapped and is not otherwise
    /// aliased mutably until the returned handle is deregistered or the engine
    /// is finalized. Peers may write into it at any time in between.
    pub unsafe fn register_mem(
        &self,
        desc: MemDesc,
        mem_type: MemType,
    ) -> Result<MemHandle, TransferError> {
        self.state()?.registry.register(desc, mem_type)
    }

    pub fn deregister_mem(&self, handle: MemHandle) -> Result<(), TransferError> {
        self.state()?.registry.deregister(handle);
        Ok(())
    }

    pub(crate) fn registry(&self) -> Result<Arc<MemRegistry>, TransferError> {
        Ok(Arc::clone(&self.state()?.registry))
    }

    /// Open a channel to `remote` (`ip:port`).
    ///
    /// A channel left poisoned by an earlier failure is replaced.
    pub async fn connect(&self, remote: &str, timeout: Duration) -> Result<(), TransferError> {
        check_timeout(timeout)?;
        let state = self.state()?;
        let (key, endpoint) = remote_key(remote)?;
        let deadline = Instant::now() + timeout;

        {
            let mut clients = state.clients.lock();
            match clients.get(&key) {
                Some(channel) if channel.is_poisoned() => {
                    info!("Replacing poisoned channel: remote={}", key);
                    clients.remove(&key);
                }
                Some(_) => return Err(TransferError::AlreadyConnected(key)),
                None => {}
            }
        }
        if !state.connecting.lock().insert(key.clone()) {
            return Err(TransferError::AlreadyConnected(format!(
                "{key} (connect in progress)"
            )));
        }
        let _pending = PendingConnect {
            connecting: &state.connecting,
            remote: key.clone(),
        };

        let local = ConnectInfo {
            channel_id: state.channel_id.clone(),
            comm_res: state.config.comm_res.clone(),
            timeout_ms: state.config.heartbeat_timeout.as_millis() as u64,
            segments: state.registry.segments(),
        };
        let channel = Channel::connect(key.clone(), endpoint, local, deadline).await?;
        channel.spawn_heartbeat(state.config.heartbeat_interval);
        state.clients.lock().insert(key, channel);
        Ok(())
    }

    /// Close the channel to `remote`. The local channel is dropped even when
    /// the peer does not acknowledge.
    pub async fn disconnect(&self, remote: &str, timeout: Duration) -> Result<(), TransferError> {
        check_timeout(timeout)?;
        let state = self.state()?;
        let (key, _) = remote_key(remote)?;
        let channel = state
            .clients
            .lock()
            .remove(&key)
            .ok_or_else(|| TransferError::NotConnected(key.clone()))?;

        let result = channel
            .disconnect(&state.channel_id, Instant::now() + timeout)
            .await;
        match &result {
            Ok(()) => info!("Disconnected: remote={}", key),
            Err(err) => warn!("Disconnect from {} not acknowledged: {}", key, err),
        }
        result
    }

    pub fn is_connected(&self, remote: &str) -> bool {
        let Ok(state) = self.state() else {
            return false;
        };
        let Ok((key, _)) = remote_key(remote) else {
            return false;
        };
        state
            .clients
            .lock()
            .get(&key)
            .is_some_and(|channel| !channel.is_poisoned())
    }

    /// Run `descs` against `remote` and wait for completion.
    pub async fn transfer_sync(
        &self,
        remote: &str,
        op: TransferOp,
        descs: &[TransferOpDesc],
        timeout: Duration,
    ) -> Result<(), TransferError> {
        let state = self.state()?;
        check_timeout(timeout)?;
        validate_descs(descs)?;
        state.transfer(remote, op, descs, timeout).await
    }

    /// Start a transfer in the background. Poll it with
    /// [`get_transfer_status`](Self::get_transfer_status).
    pub async fn transfer_async(
        &self,
        remote: &str,
        op: TransferOp,
        descs: Vec<TransferOpDesc>,
        timeout: Duration,
    ) -> Result<TransferReq, TransferError> {
        let state = self.state()?;
        check_timeout(timeout)?;
        validate_descs(&descs)?;
        let (key, _) = remote_key(remote)?;
        state.channel(&key)?;

        let id = state.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        let task_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            task_state.transfer(&key, op, &descs, timeout).await
        });
        state.requests.lock().insert(id, handle);
        debug!("Async transfer started: req={} remote={}", id, remote);
        Ok(TransferReq(id))
    }

    /// Poll an async transfer. Finished requests are forgotten after they
    /// report `Completed` or `Failed` once.
    pub fn get_transfer_status(&self, req: TransferReq) -> Result<TransferStatus, TransferError> {
        let state = self.state()?;
        let mut requests = state.requests.lock();
        let Some(handle) = requests.get_mut(&req.0) else {
            return Err(TransferError::InvalidArgument(format!(
                "unknown transfer request {}",
                req.0
            )));
        };
        if !handle.is_finished() {
            return Ok(TransferStatus::Waiting);
        }
        let status = match handle.now_or_never() {
            None => return Ok(TransferStatus::Waiting),
            Some(Ok(Ok(()))) => TransferStatus::Completed,
            Some(Ok(Err(err))) => {
                warn!("Async transfer {} failed: {}", req.0, err);
                TransferStatus::Failed
            }
            Some(Err(err)) => {
                warn!("Async transfer {} aborted: {}", req.0, err);
                TransferStatus::Failed
            }
        };
        requests.remove(&req.0);
        Ok(status)
    }

    /// Serve `value` under `key` to any connected peer.
    pub fn publish_metadata(&self, key: &str, value: Vec<u8>) -> Result<(), TransferError> {
        let state = self.state()?;
        debug!("Publishing metadata: key={} bytes={}", key, value.len());
        state.metadata.write().insert(key.to_string(), value);
        Ok(())
    }

    /// Fetch a peer's metadata entry; `None` if the peer has none under `key`.
    pub async fn fetch_metadata(
        &self,
        remote: &str,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransferError> {
        check_timeout(timeout)?;
        let state = self.state()?;
        let (remote_key, _) = remote_key(remote)?;
        let channel = state.channel(&remote_key)?;
        channel.fetch_metadata(key, Instant::now() + timeout).await
    }

    /// Stop the listener, drop every channel and registration. Idempotent.
    pub async fn finalize(&self) {
        let _init = self.init_lock.lock().await;
        let Some(state) = self.state.write().take() else {
            debug!("Engine finalize: not initialized");
            return;
        };

        let server = state.server.lock().take();
        if let Some(server) = server {
            server.shutdown().await;
        }
        let clients = std::mem::take(&mut *state.clients.lock());
        for (remote, channel) in clients {
            channel.stop_heartbeat();
            debug!("Dropped channel on finalize: remote={}", remote);
        }
        for (_, handle) in state.requests.lock().drain() {
            handle.abort();
        }
        state.registry.clear();
        state.metadata.write().clear();
        info!("Engine finalized: channel_id={}", state.channel_id);
    }
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        if let Some(state) = self.state.get_mut().take() {
            for (_, handle) in state.requests.lock().drain() {
                handle.abort();
            }
            state.clients.lock().clear();
            state.server.lock().take();
            state.registry.clear();
        }
    }
}
