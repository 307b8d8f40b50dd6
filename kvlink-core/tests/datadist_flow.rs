use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use kvlink_core::cache::CacheDesc;
use kvlink_core::datadist::{DataDist, DataDistConfig, Role};
use kvlink_core::link::{ClusterInfo, IpInfo};
use kvlink_core::rendezvous::ProcessGroup;
use kvlink_core::types::{CacheKey, DataType, MemType};
use kvlink_core::TransferError;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const LINK_TIMEOUT: Duration = Duration::from_millis(5000);
const PG_TIMEOUT: Duration = Duration::from_secs(30);

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct Side {
    role: Role,
    cluster_id: u64,
    local_port: u16,
    remote_port: u16,
    fill: f32,
}

fn cluster_info(side: &Side) -> ClusterInfo {
    ClusterInfo {
        remote_cluster_id: 1 - side.cluster_id,
        local_ip_infos: vec![IpInfo::new(LOCALHOST, side.local_port)],
        remote_ip_infos: vec![IpInfo::new(LOCALHOST, side.remote_port)],
    }
}

/// One side of the prompt/decoder exchange: the prompt pulls block 2 from the
/// decoder, the decoder pushes blocks 0 and 1 into the prompt.
async fn run_side(side: Side, master: SocketAddr) -> Vec<Vec<f32>> {
    let pg = ProcessGroup::init(side.cluster_id as u32, 2, master, PG_TIMEOUT)
        .await
        .unwrap();

    let mut dist = DataDist::new(side.role, side.cluster_id);
    let config = DataDistConfig {
        listen_ip_info: Some(format!("127.0.0.1:{}", side.local_port)),
        transfer_backend: Some("hixl".to_string()),
        ..DataDistConfig::default()
    };
    dist.init(config).await.unwrap();

    let desc = CacheDesc::new(2, vec![3, 10], DataType::Float32, MemType::Host);
    let mut tensors = vec![vec![side.fill; 30], vec![side.fill; 30]];
    let addrs: Vec<u64> = tensors.iter_mut().map(|t| t.as_mut_ptr() as u64).collect();
    let cache = unsafe {
        dist.cache_manager()
            .unwrap()
            .register_blocks_cache(&desc, &addrs, CacheKey::new(side.cluster_id, 0))
            .unwrap()
    };
    pg.barrier().await.unwrap();

    let clusters = [cluster_info(&side)];
    dist.link_clusters(&clusters, LINK_TIMEOUT)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(dist.linked_clusters().len(), 1);

    let manager = dist.cache_manager().unwrap();
    match side.role {
        Role::Prompt => manager
            .pull_blocks(CacheKey::new(1, 0), &cache, &[2], &[2])
            .await
            .unwrap(),
        Role::Decoder => manager
            .push_blocks(CacheKey::new(0, 0), &cache, &[0, 1], &[0, 1])
            .await
            .unwrap(),
    }
    pg.barrier().await.unwrap();

    let report = dist.unlink_clusters(&clusters, LINK_TIMEOUT).await.unwrap();
    assert!(report.is_ok());
    pg.barrier().await.unwrap();

    dist.cache_manager()
        .unwrap()
        .unregister_cache(cache.cache_id)
        .unwrap();
    dist.finalize().await;
    pg.shutdown().await;
    tensors
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prompt_and_decoder_exchange_blocks() {
    let master = SocketAddr::new(LOCALHOST, free_port());
    let prompt_port = free_port();
    let decoder_port = free_port();

    let prompt = Side {
        role: Role::Prompt,
        cluster_id: 0,
        local_port: prompt_port,
        remote_port: decoder_port,
        fill: 1.0,
    };
    let decoder = Side {
        role: Role::Decoder,
        cluster_id: 1,
        local_port: decoder_port,
        remote_port: prompt_port,
        fill: 2.0,
    };

    let (prompt_tensors, decoder_tensors) =
        tokio::join!(run_side(prompt, master), run_side(decoder, master));

    for tensor in &prompt_tensors {
        assert!(tensor.iter().all(|v| *v == 2.0), "{tensor:?}");
    }
    for tensor in &decoder_tensors {
        assert!(tensor.iter().all(|v| *v == 2.0), "{tensor:?}");
    }
}

#[tokio::test]
async fn blocks_move_only_between_linked_clusters() {
    let port = free_port();
    let mut owner = DataDist::new(Role::Decoder, 7);
    owner
        .init(DataDistConfig {
            listen_ip_info: Some(format!("127.0.0.1:{port}")),
            ..DataDistConfig::default()
        })
        .await
        .unwrap();
    let mut user = DataDist::new(Role::Prompt, 3);
    user.init(DataDistConfig::default()).await.unwrap();

    let desc = CacheDesc::new(1, vec![4, 8], DataType::Int8, MemType::Host);
    let remote_cache = owner
        .cache_manager()
        .unwrap()
        .allocate_blocks_cache(&desc, CacheKey::new(7, 1))
        .unwrap();
    let local_cache = user
        .cache_manager()
        .unwrap()
        .allocate_blocks_cache(&desc, CacheKey::new(3, 1))
        .unwrap();
    assert_eq!(remote_cache.tensor_addrs.len(), 1);

    let manager = user.cache_manager().unwrap();
    assert!(matches!(
        manager
            .pull_blocks(CacheKey::new(7, 1), &local_cache, &[0], &[0])
            .await,
        Err(TransferError::NotConnected(_))
    ));

    let clusters = [ClusterInfo {
        remote_cluster_id: 7,
        local_ip_infos: vec![],
        remote_ip_infos: vec![IpInfo::new(LOCALHOST, port)],
    }];
    user.link_clusters(&clusters, LINK_TIMEOUT)
        .await
        .unwrap()
        .into_result()
        .unwrap();

    // Second link of the same cluster is refused, first stays usable.
    let again = user.link_clusters(&clusters, LINK_TIMEOUT).await.unwrap();
    assert!(!again.is_ok());

    let manager = user.cache_manager().unwrap();
    manager
        .push_blocks(CacheKey::new(7, 1), &local_cache, &[0, 1], &[2, 3])
        .await
        .unwrap();
    assert!(matches!(
        manager
            .push_blocks(CacheKey::new(7, 1), &local_cache, &[0], &[4])
            .await,
        Err(TransferError::InvalidArgument(_))
    ));
    assert!(matches!(
        manager
            .push_blocks(CacheKey::new(7, 2), &local_cache, &[0], &[0])
            .await,
        Err(TransferError::InvalidArgument(_))
    ));

    // A cache registered after linking is found by refreshing the table.
    let late = owner
        .cache_manager()
        .unwrap()
        .allocate_blocks_cache(&desc, CacheKey::new(7, 2))
        .unwrap();
    manager
        .pull_blocks(CacheKey::new(7, 2), &local_cache, &[1], &[1])
        .await
        .unwrap();
    assert_eq!(late.key, CacheKey::new(7, 2));

    user.finalize().await;
    owner.finalize().await;
    assert!(!user.is_initialized());
}

#[tokio::test]
async fn unknown_backend_is_rejected() {
    let mut dist = DataDist::new(Role::Prompt, 0);
    let config = DataDistConfig {
        transfer_backend: Some("rdma".to_string()),
        ..DataDistConfig::default()
    };
    assert!(matches!(
        dist.init(config).await,
        Err(TransferError::Unsupported(_))
    ));
    assert!(!dist.is_initialized());
    assert!(matches!(
        dist.cache_manager(),
        Err(TransferError::NotInitialized)
    ));
}
