//! Role-aware entry point tying the engine, cache manager and link manager
//! together for one process of a prompt/decoder pair.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytesize::ByteSize;
use log::{info, warn};

use crate::TransferError;
use crate::cache::CacheManager;
use crate::engine::{EngineConfig, TransferEngine};
use crate::host_pool::HostMemoryPool;
use crate::link::{ClusterInfo, DEFAULT_UNLINK_TIMEOUT, LinkManager, LinkReport};
use crate::types::Endpoint;

pub const OPTION_DEVICE_ID: &str = "llm.DeviceId";
pub const OPTION_LISTEN_IP_INFO: &str = "llm.ListenIpInfo";
pub const OPTION_TRANSFER_BACKEND: &str = "llm.TransferBackend";
pub const OPTION_LOCAL_COMM_RES: &str = "llm.LocalCommRes";
pub const OPTION_BUFFER_POOL: &str = "llm.BufferPool";

const SUPPORTED_BACKENDS: &[&str] = &["hixl", "tcp"];
const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Prompt,
    Decoder,
}

impl Role {
    /// Listen port used when the configuration does not name one.
    pub fn default_port(&self) -> u16 {
        match self {
            Role::Prompt => 26000,
            Role::Decoder => 26001,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Prompt => f.write_str("prompt"),
            Role::Decoder => f.write_str("decoder"),
        }
    }
}

impl FromStr for Role {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "p" | "prompt" => Ok(Role::Prompt),
            "d" | "decoder" => Ok(Role::Decoder),
            _ => Err(TransferError::InvalidArgument(format!(
                "unknown role '{s}', expected p or d"
            ))),
        }
    }
}

/// Host staging pool as `count:size_mib` blocks; `0:0` disables it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPool {
    pub count: u64,
    pub size_mib: u64,
}

impl BufferPool {
    pub fn bytes(&self) -> u64 {
        self.count.saturating_mul(self.size_mib).saturating_mul(MIB)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self {
            count: 4,
            size_mib: 16,
        }
    }
}

impl FromStr for BufferPool {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransferError::InvalidArgument(format!("invalid buffer pool '{s}'"));
        let (count, size) = s.trim().split_once(':').ok_or_else(invalid)?;
        let count = count.trim().parse().map_err(|_| invalid())?;
        let size_mib = size.trim().parse().map_err(|_| invalid())?;
        if (count == 0) != (size_mib == 0) {
            return Err(invalid());
        }
        Ok(Self { count, size_mib })
    }
}

impl fmt::Display for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.count, self.size_mib)
    }
}

#[derive(Debug, Clone)]
pub struct DataDistConfig {
    pub device_id: u32,
    /// `ip:port` to listen on. `None` (or port 0) runs without a listener.
    pub listen_ip_info: Option<String>,
    pub transfer_backend: Option<String>,
    pub local_comm_res: String,
    pub buffer_pool: BufferPool,
    pub engine: EngineConfig,
    /// Deadline applied to each push/pull.
    pub transfer_timeout: Duration,
}

impl Default for DataDistConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            listen_ip_info: None,
            transfer_backend: None,
            local_comm_res: String::new(),
            buffer_pool: BufferPool::default(),
            engine: EngineConfig::default(),
            transfer_timeout: Duration::from_secs(30),
        }
    }
}

impl DataDistConfig {
    /// Listen on `ip` at the role's default port.
    pub fn for_role(role: Role, ip: IpAddr) -> Self {
        Self {
            listen_ip_info: Some(Endpoint::new(ip, role.default_port()).to_string()),
            ..Self::default()
        }
    }

    pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self, TransferError> {
        let mut config = Self::default();
        for (key, value) in options {
            match key.as_str() {
                OPTION_DEVICE_ID => {
                    config.device_id = value.trim().parse().map_err(|_| {
                        TransferError::InvalidArgument(format!("invalid {key} '{value}'"))
                    })?;
                }
                OPTION_LISTEN_IP_INFO => {
                    value.parse::<Endpoint>()?;
                    config.listen_ip_info = Some(value.trim().to_string());
                }
                OPTION_TRANSFER_BACKEND => config.transfer_backend = Some(value.trim().to_string()),
                OPTION_LOCAL_COMM_RES => config.local_comm_res = value.clone(),
                OPTION_BUFFER_POOL => config.buffer_pool = value.parse()?,
                _ => warn!("Ignoring unknown option: {}={}", key, value),
            }
        }
        Ok(config)
    }

    pub fn to_options(&self) -> BTreeMap<String, String> {
        let mut options = BTreeMap::new();
        options.insert(OPTION_DEVICE_ID.to_string(), self.device_id.to_string());
        if let Some(listen) = &self.listen_ip_info {
            options.insert(OPTION_LISTEN_IP_INFO.to_string(), listen.clone());
        }
        if let Some(backend) = &self.transfer_backend {
            options.insert(OPTION_TRANSFER_BACKEND.to_string(), backend.clone());
        }
        options.insert(
            OPTION_LOCAL_COMM_RES.to_string(),
            self.local_comm_res.clone(),
        );
        options.insert(OPTION_BUFFER_POOL.to_string(), self.buffer_pool.to_string());
        options
    }

    fn check_backend(&self) -> Result<(), TransferError> {
        match &self.transfer_backend {
            Some(backend) if !SUPPORTED_BACKENDS.contains(&backend.as_str()) => Err(
                TransferError::Unsupported(format!("transfer backend '{backend}'")),
            ),
            _ => Ok(()),
        }
    }
}

struct Components {
    engine: Arc<TransferEngine>,
    links: Arc<LinkManager>,
    caches: CacheManager,
}

/// One side (prompt or decoder) of a cache distribution pair.
pub struct DataDist {
    role: Role,
    cluster_id: u64,
    components: Option<Components>,
}

impl DataDist {
    pub fn new(role: Role, cluster_id: u64) -> Self {
        Self {
            role,
            cluster_id,
            components: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    pub fn is_initialized(&self) -> bool {
        self.components.is_some()
    }

    pub async fn init(&mut self, config: DataDistConfig) -> Result<(), TransferError> {
        if self.components.is_some() {
            warn!("DataDist already initialized: cluster_id={}", self.cluster_id);
            return Ok(());
        }
        config.check_backend()?;

        let listen = config
            .listen_ip_info
            .clone()
            .unwrap_or_else(|| "0.0.0.0".to_string());
        let engine_config = EngineConfig {
            comm_res: config.local_comm_res.clone(),
            ..config.engine.clone()
        };
        let engine = Arc::new(TransferEngine::new(engine_config));
        engine.initialize(&listen).await?;

        let pool_bytes = config.buffer_pool.bytes();
        let pool = if pool_bytes > 0 {
            match HostMemoryPool::new(pool_bytes as usize, false, false, None) {
                Ok(pool) => Some(pool),
                Err(err) => {
                    engine.finalize().await;
                    return Err(err);
                }
            }
        } else {
            None
        };

        let links = Arc::new(LinkManager::new(Arc::clone(&engine)));
        let caches = CacheManager::new(
            Arc::clone(&engine),
            Arc::clone(&links),
            pool,
            config.transfer_timeout,
        );
        info!(
            "DataDist initialized: role={} cluster_id={} device_id={} listen={} pool={}",
            self.role,
            self.cluster_id,
            config.device_id,
            listen,
            ByteSize(pool_bytes)
        );
        self.components = Some(Components {
            engine,
            links,
            caches,
        });
        Ok(())
    }

    fn components(&self) -> Result<&Components, TransferError> {
        self.components.as_ref().ok_or(TransferError::NotInitialized)
    }

    pub fn cache_manager(&self) -> Result<&CacheManager, TransferError> {
        Ok(&self.components()?.caches)
    }

    pub fn engine(&self) -> Result<&Arc<TransferEngine>, TransferError> {
        Ok(&self.components()?.engine)
    }

    pub async fn link_clusters(
        &self,
        clusters: &[ClusterInfo],
        timeout: Duration,
    ) -> Result<LinkReport, TransferError> {
        self.components()?
            .links
            .link_clusters(clusters, timeout)
            .await
    }

    pub async fn unlink_clusters(
        &self,
        clusters: &[ClusterInfo],
        timeout: Duration,
    ) -> Result<LinkReport, TransferError> {
        self.components()?
            .links
            .unlink_clusters(clusters, timeout)
            .await
    }

    pub fn linked_clusters(&self) -> Vec<(u64, String)> {
        self.components
            .as_ref()
            .map(|c| c.links.linked_clusters())
            .unwrap_or_default()
    }

    /// Unlink everything, unregister every cache and stop the engine. Idempotent.
    pub async fn finalize(&mut self) {
        let Some(components) = self.components.take() else {
            return;
        };
        let report = components.links.unlink_all(DEFAULT_UNLINK_TIMEOUT).await;
        if let Some((cluster_id, err)) = report.first_error() {
            warn!(
                "Unlink during finalize failed: cluster_id={} err={}",
                cluster_id, err
            );
        }
        components.caches.unregister_all();
        components.engine.finalize().await;
        info!(
            "DataDist finalized: role={} cluster_id={}",
            self.role, self.cluster_id
        );
    }
}

impl Drop for DataDist {
    fn drop(&mut self) {
        if let Some(components) = self.components.take() {
            warn!(
                "DataDist dropped without finalize: cluster_id={}",
                self.cluster_id
            );
            components.caches.unregister_all();
        }
    }
}
