//! Prompt/decoder pair: the prompt side (cluster 0) pulls a block from the
//! decoder, the decoder side (cluster 1) pushes its first two blocks into the
//! prompt. Both end up holding the decoder's data.

use clap::Args;
use kvlink_core::cache::{Cache, CacheDesc};
use kvlink_core::datadist::{BufferPool, DataDist, DataDistConfig, Role};
use kvlink_core::link::{ClusterInfo, IpInfo};
use kvlink_core::rendezvous::ProcessGroup;
use kvlink_core::types::{CacheKey, DataType, MemType};
use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::http_server::SharedStatus;
use crate::metric::record_phase;
use crate::utils::pair_master_ip;

const PROMPT_CLUSTER: u64 = 0;
const DECODER_CLUSTER: u64 = 1;

#[derive(Args, Debug, Clone)]
pub struct DataDistArgs {
    /// Role of this node: p (prompt) or d (decoder)
    #[arg(long)]
    pub role: Role,

    #[arg(long, default_value_t = 0)]
    pub device_id: u32,

    /// Address this node listens on
    #[arg(long)]
    pub local_host_ip: IpAddr,

    /// Address of the peer node
    #[arg(long)]
    pub remote_host_ip: IpAddr,

    /// Listen port; defaults to 26000 for prompt and 26001 for decoder
    #[arg(long)]
    pub local_port: Option<u16>,

    /// Peer listen port; defaults to the peer role's port
    #[arg(long)]
    pub remote_port: Option<u16>,

    /// Transfer backend (hixl or tcp)
    #[arg(long)]
    pub transfer_backend: Option<String>,

    /// Host staging pool as count:size_mib, 0:0 disables it
    #[arg(long)]
    pub buffer_pool: Option<BufferPool>,

    /// Rendezvous port on the smaller of the two addresses
    #[arg(long, default_value_t = 29500)]
    pub pg_port: u16,

    #[arg(long, default_value_t = 2)]
    pub num_tensors: u32,

    /// Cache tensor shape, blocks first
    #[arg(long, value_delimiter = ',', default_value = "3,10")]
    pub shape: Vec<u64>,

    #[arg(long, default_value_t = 5000)]
    pub link_timeout_ms: u64,

    #[arg(long, default_value_t = 30)]
    pub pg_timeout_secs: u64,
}

impl DataDistArgs {
    fn cluster_id(&self) -> u64 {
        match self.role {
            Role::Prompt => PROMPT_CLUSTER,
            Role::Decoder => DECODER_CLUSTER,
        }
    }

    fn peer_role(&self) -> Role {
        match self.role {
            Role::Prompt => Role::Decoder,
            Role::Decoder => Role::Prompt,
        }
    }

    fn cluster_info(&self) -> ClusterInfo {
        let local_port = self.local_port.unwrap_or(self.role.default_port());
        let remote_port = self
            .remote_port
            .unwrap_or(self.peer_role().default_port());
        ClusterInfo {
            remote_cluster_id: match self.role {
                Role::Prompt => DECODER_CLUSTER,
                Role::Decoder => PROMPT_CLUSTER,
            },
            local_ip_infos: vec![IpInfo::new(self.local_host_ip, local_port)],
            remote_ip_infos: vec![IpInfo::new(self.remote_host_ip, remote_port)],
        }
    }

    fn config(&self) -> DataDistConfig {
        let port = self.local_port.unwrap_or(self.role.default_port());
        DataDistConfig {
            device_id: self.device_id,
            listen_ip_info: Some(IpInfo::new(self.local_host_ip, port).to_string()),
            transfer_backend: self.transfer_backend.clone(),
            buffer_pool: self.buffer_pool.unwrap_or_default(),
            ..DataDistConfig::default()
        }
    }
}

fn set_phase(status: &SharedStatus, phase: &str) {
    status.write().phase = phase.to_string();
    info!("Phase: {}", phase);
}

/// Run one side of the pair to completion.
pub async fn run(args: DataDistArgs, status: SharedStatus) -> Result<(), Box<dyn Error>> {
    let cluster_id = args.cluster_id();
    let master = SocketAddr::new(
        pair_master_ip(args.local_host_ip, args.remote_host_ip),
        args.pg_port,
    );
    let pg_timeout = Duration::from_secs(args.pg_timeout_secs);
    let link_timeout = Duration::from_millis(args.link_timeout_ms);

    set_phase(&status, "process_group");
    let pg = ProcessGroup::init(cluster_id as u32, 2, master, pg_timeout).await?;

    let mut dist = DataDist::new(args.role, cluster_id);
    dist.init(args.config()).await?;

    let desc = CacheDesc::new(args.num_tensors, args.shape.clone(), DataType::Float32, MemType::Host);
    desc.validate()?;
    let elems = (desc.tensor_bytes() / DataType::Float32.size()) as usize;
    let fill = match args.role {
        Role::Prompt => 1.0f32,
        Role::Decoder => 0.0f32,
    };
    let mut tensors: Vec<Vec<f32>> = (0..args.num_tensors).map(|_| vec![fill; elems]).collect();
    let addrs: Vec<u64> = tensors.iter_mut().map(|t| t.as_mut_ptr() as u64).collect();

    set_phase(&status, "register");
    // SAFETY: `tensors` outlives the cache, which is unregistered before return.
    let cache = unsafe {
        dist.cache_manager()?
            .register_blocks_cache(&desc, &addrs, CacheKey::new(cluster_id, 0))?
    };
    pg.barrier().await?;

    let result = exchange(&dist, &args, &cache, &status, link_timeout, &pg).await;
    if let Err(err) = &result {
        error!("Exchange failed: {}", err);
        status.write().error = Some(err.to_string());
    }

    set_phase(&status, "cleanup");
    if let Err(err) = dist.cache_manager()?.unregister_cache(cache.cache_id) {
        error!("Unregister cache failed: {}", err);
    }
    dist.finalize().await;
    pg.shutdown().await;

    if result.is_ok() && args.role == Role::Prompt {
        let expected = 0.0f32;
        let mismatched = tensors
            .iter()
            .flatten()
            .filter(|v| **v != expected)
            .count();
        if mismatched > 0 {
            return Err(format!("{mismatched} prompt cache values were not overwritten").into());
        }
        info!("Prompt cache holds decoder data in every block");
    }
    set_phase(&status, "done");
    result
}

async fn exchange(
    dist: &DataDist,
    args: &DataDistArgs,
    cache: &Cache,
    status: &SharedStatus,
    link_timeout: Duration,
    pg: &ProcessGroup,
) -> Result<(), Box<dyn Error>> {
    let clusters = [args.cluster_info()];

    set_phase(status, "link");
    let start = Instant::now();
    let linked = dist
        .link_clusters(&clusters, link_timeout)
        .await
        .and_then(|report| report.into_result());
    record_phase("link", &linked, start);
    linked?;
    status.write().linked_clusters = dist.linked_clusters().iter().map(|(id, _)| *id).collect();

    set_phase(status, "transfer");
    let start = Instant::now();
    let manager = dist.cache_manager()?;
    let moved = match args.role {
        Role::Prompt => {
            let last = cache.desc.num_blocks() - 1;
            manager
                .pull_blocks(CacheKey::new(DECODER_CLUSTER, 0), cache, &[last], &[last])
                .await
        }
        Role::Decoder => {
            let blocks: Vec<u64> = (0..cache.desc.num_blocks().saturating_sub(1)).collect();
            manager
                .push_blocks(CacheKey::new(PROMPT_CLUSTER, 0), cache, &blocks, &blocks)
                .await
        }
    };
    record_phase("transfer", &moved, start);
    moved?;
    pg.barrier().await?;

    set_phase(status, "unlink");
    let start = Instant::now();
    let unlinked = dist
        .unlink_clusters(&clusters, link_timeout)
        .await
        .and_then(|report| report.into_result());
    record_phase("unlink", &unlinked, start);
    unlinked?;
    status.write().linked_clusters.clear();
    pg.barrier().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: DataDistArgs,
    }

    #[test]
    fn derives_ports_and_clusters_from_role() {
        let wrapper = Wrapper::parse_from([
            "test",
            "--role",
            "d",
            "--local-host-ip",
            "10.0.0.2",
            "--remote-host-ip",
            "10.0.0.1",
            "--buffer-pool",
            "4:8",
        ]);
        let args = wrapper.args;
        assert_eq!(args.role, Role::Decoder);
        assert_eq!(args.cluster_id(), DECODER_CLUSTER);
        assert_eq!(args.shape, vec![3, 10]);

        let info = args.cluster_info();
        assert_eq!(info.remote_cluster_id, PROMPT_CLUSTER);
        assert_eq!(info.remote_ip_infos[0].port, 26000);
        assert_eq!(info.local_ip_infos[0].port, 26001);

        let config = args.config();
        assert_eq!(config.listen_ip_info.as_deref(), Some("10.0.0.2:26001"));
        assert_eq!(config.buffer_pool, BufferPool { count: 4, size_mib: 8 });
        assert_eq!(config.transfer_backend, None);
    }

    #[test]
    fn rejects_unknown_role() {
        assert!(
            Wrapper::try_parse_from([
                "test",
                "--role",
                "x",
                "--local-host-ip",
                "10.0.0.1",
                "--remote-host-ip",
                "10.0.0.2",
            ])
            .is_err()
        );
    }
}
