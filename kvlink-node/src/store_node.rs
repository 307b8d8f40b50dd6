//! Two-rank object store exercise: rank 0 puts a tensor, rank 1 gets it into
//! its own registered buffer and checks every byte.

use bytesize::ByteSize;
use clap::Args;
use kvlink_core::rendezvous::ProcessGroup;
use kvlink_core::store::{BUFFER_ALIGNMENT, DistributedStore, Schema, StoreConfig, align_up};
use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::http_server::SharedStatus;
use crate::metric::record_phase;
use crate::utils::parse_memory_size;

const BASE_PORT: u16 = 12345;
const OBJECT_KEY: &str = "kvlink-store-sample";

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Device id; the rank is device_id % 2 and the engine port 12345 + device_id
    #[arg(long, default_value_t = 0)]
    pub device_id: u16,

    /// Copy direction: h2h, h2d, d2h or d2d
    #[arg(long, default_value = "h2h")]
    pub schema: Schema,

    /// Address the store engine listens on
    #[arg(long, default_value = "127.0.0.1")]
    pub local_ip: IpAddr,

    /// Rendezvous store holding object metadata
    #[arg(long, default_value = "127.0.0.1:50051")]
    pub master_server_addr: SocketAddr,

    /// Rendezvous address for the two-rank barrier group
    #[arg(long, default_value = "127.0.0.1:29500")]
    pub pg_addr: SocketAddr,

    #[arg(long, default_value = "tcp")]
    pub protocol: String,

    #[arg(long, default_value = "")]
    pub device_name: String,

    /// Segment mounted into the store (supports units: kb, mb, gb, tb)
    #[arg(long, default_value = "1gb", value_parser = parse_memory_size)]
    pub global_segment_size: u64,

    /// Local staging buffer (supports units: kb, mb, gb, tb)
    #[arg(long, default_value = "20mb", value_parser = parse_memory_size)]
    pub local_buffer_size: u64,

    /// Size of the tensor moved between ranks (supports units: kb, mb, gb, tb)
    #[arg(long, default_value = "64mb", value_parser = parse_memory_size)]
    pub tensor_size: u64,

    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,
}

impl StoreArgs {
    fn rank(&self) -> u32 {
        u32::from(self.device_id % 2)
    }

    fn config(&self) -> Result<StoreConfig, Box<dyn Error>> {
        let port = BASE_PORT
            .checked_add(self.device_id)
            .ok_or("device id pushes the engine port past 65535")?;
        Ok(StoreConfig {
            local_hostname: SocketAddr::new(self.local_ip, port).to_string(),
            metadata_server: "P2PHANDSHAKE".to_string(),
            global_segment_size: self.global_segment_size,
            local_buffer_size: self.local_buffer_size,
            protocol: self.protocol.clone(),
            device_name: self.device_name.clone(),
            master_server_addr: self.master_server_addr.to_string(),
            request_timeout: Duration::from_secs(self.timeout_secs),
            ..StoreConfig::default()
        })
    }
}

/// Buffer over-allocated so a `BUFFER_ALIGNMENT` aligned window of `len` bytes fits.
struct AlignedBuffer {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedBuffer {
    fn new(len: u64, fill: u8) -> Self {
        let mut storage = vec![fill; (len + BUFFER_ALIGNMENT) as usize];
        let base = storage.as_mut_ptr() as u64;
        let offset = (align_up(base, BUFFER_ALIGNMENT) - base) as usize;
        Self {
            storage,
            offset,
            len: len as usize,
        }
    }

    fn addr(&mut self) -> u64 {
        self.storage[self.offset..].as_mut_ptr() as u64
    }

    fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }
}

fn set_phase(status: &SharedStatus, phase: &str) {
    status.write().phase = phase.to_string();
    info!("Phase: {}", phase);
}

pub async fn run(args: StoreArgs, status: SharedStatus) -> Result<(), Box<dyn Error>> {
    if args.tensor_size == 0 {
        return Err("--tensor-size must be greater than zero".into());
    }
    let rank = args.rank();
    let timeout = Duration::from_secs(args.timeout_secs);

    set_phase(&status, "process_group");
    let pg = ProcessGroup::init(rank, 2, args.pg_addr, timeout).await?;

    set_phase(&status, "setup");
    let store = DistributedStore::setup(args.config()?).await?;

    let (fill, placement) = if rank == 0 {
        (1u8, args.schema.source())
    } else {
        (0u8, args.schema.target())
    };
    let mut buffer = AlignedBuffer::new(args.tensor_size, fill);
    let addr = buffer.addr();
    // SAFETY: `buffer` lives until after `unregister_buffer` below.
    unsafe { store.register_buffer_as(addr, args.tensor_size, placement)? };

    let result = exchange(&store, &pg, rank, addr, args.tensor_size, &status).await;

    set_phase(&status, "cleanup");
    if let Err(err) = store.unregister_buffer(addr) {
        warn!("Unregister buffer failed: {}", err);
    }
    if let Err(err) = store.close().await {
        warn!("Store close failed: {}", err);
    }
    pg.shutdown().await;
    result?;

    if rank == 1 {
        let mismatched = buffer.as_slice().iter().filter(|b| **b != 1).count();
        if mismatched > 0 {
            return Err(format!("{mismatched} bytes differ from the source tensor").into());
        }
        info!("Target buffer matches the source tensor");
    }
    set_phase(&status, "done");
    Ok(())
}

async fn exchange(
    store: &DistributedStore,
    pg: &ProcessGroup,
    rank: u32,
    addr: u64,
    len: u64,
    status: &SharedStatus,
) -> Result<(), Box<dyn Error>> {
    if rank == 0 {
        set_phase(status, "put");
        let start = Instant::now();
        let put = store.put_from(OBJECT_KEY, addr, len).await;
        record_phase("put", &put, start);
        put?;
        log_bandwidth("put", len, start);
    }
    pg.barrier().await?;

    if rank == 1 {
        set_phase(status, "get");
        let start = Instant::now();
        let got = store.get_into(OBJECT_KEY, addr, len).await;
        record_phase("get", &got, start);
        let size = got?;
        if size != len {
            return Err(format!("got {size} bytes, expected {len}").into());
        }
        log_bandwidth("get", len, start);
    }
    // Rank 0 owns the object and must stay up until rank 1 has read it.
    pg.barrier().await?;
    Ok(())
}

fn log_bandwidth(op: &str, bytes: u64, start: Instant) {
    let secs = start.elapsed().as_secs_f64();
    let gbps = if secs > 0.0 {
        bytes as f64 / secs / 1e9
    } else {
        0.0
    };
    info!(
        "{} done: size={} elapsed_ms={:.3} bandwidth={:.3} GB/s",
        op,
        ByteSize(bytes),
        secs * 1000.0,
        gbps
    );
}
