//! Cluster links: an engine channel plus the remote cluster's cache table.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::TransferError;
use crate::cache::{CACHE_TABLE_KEY, CacheEntry, decode_cache_table};
use crate::engine::TransferEngine;
use crate::status;
use crate::types::{CacheKey, Endpoint};

/// Default timeout for unlinking clusters.
pub const DEFAULT_UNLINK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpInfo {
    pub ip: IpAddr,
    pub port: u16,
}

impl IpInfo {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.ip, self.port)
    }
}

impl fmt::Display for IpInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.endpoint(), f)
    }
}

/// A cluster to link to or unlink from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub remote_cluster_id: u64,
    pub local_ip_infos: Vec<IpInfo>,
    pub remote_ip_infos: Vec<IpInfo>,
}

impl ClusterInfo {
    fn remote(&self) -> Result<String, TransferError> {
        match self.remote_ip_infos.as_slice() {
            [info] if info.port > 0 => Ok(info.endpoint().to_string()),
            [info] => Err(TransferError::InvalidArgument(format!(
                "cluster {} remote address {} has no port",
                self.remote_cluster_id, info.ip
            ))),
            infos => Err(TransferError::InvalidArgument(format!(
                "cluster {} needs exactly one remote ip info, got {}",
                self.remote_cluster_id,
                infos.len()
            ))),
        }
    }
}

/// Per-cluster outcome of a link or unlink call.
#[derive(Debug)]
pub struct LinkReport {
    pub results: Vec<(u64, Result<(), TransferError>)>,
}

impl LinkReport {
    pub fn is_ok(&self) -> bool {
        self.results.iter().all(|(_, result)| result.is_ok())
    }

    /// First failure in request order.
    pub fn first_error(&self) -> Option<(u64, &TransferError)> {
        self.results
            .iter()
            .find_map(|(id, result)| result.as_ref().err().map(|err| (*id, err)))
    }

    /// Status code of the first failure, `SUCCESS` when every cluster succeeded.
    pub fn status_code(&self) -> u32 {
        self.first_error()
            .map(|(_, err)| err.status_code())
            .unwrap_or(status::SUCCESS)
    }

    pub fn into_result(self) -> Result<(), TransferError> {
        for (_, result) in self.results {
            result?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct LinkedCluster {
    remote: String,
    table: Vec<CacheEntry>,
}

/// Tracks which remote clusters are linked and what caches they expose.
pub struct LinkManager {
    engine: Arc<TransferEngine>,
    links: Mutex<BTreeMap<u64, LinkedCluster>>,
    pending: Mutex<HashSet<u64>>,
}

impl LinkManager {
    pub fn new(engine: Arc<TransferEngine>) -> Self {
        Self {
            engine,
            links: Mutex::new(BTreeMap::new()),
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// Link every cluster in `clusters` concurrently.
    pub async fn link_clusters(
        &self,
        clusters: &[ClusterInfo],
        timeout: Duration,
    ) -> Result<LinkReport, TransferError> {
        if clusters.is_empty() {
            return Err(TransferError::InvalidArgument(
                "cluster list must not be empty".into(),
            ));
        }
        let results = join_all(clusters.iter().map(|cluster| async move {
            let result = self.link_one(cluster, timeout).await;
            if let Err(err) = &result {
                warn!(
                    "Link failed: cluster_id={} err={}",
                    cluster.remote_cluster_id, err
                );
            }
            (cluster.remote_cluster_id, result)
        }))
        .await;
        Ok(LinkReport { results })
    }

    async fn link_one(&self, cluster: &ClusterInfo, timeout: Duration) -> Result<(), TransferError> {
        let cluster_id = cluster.remote_cluster_id;
        let remote = cluster.remote()?;
        if self.links.lock().contains_key(&cluster_id) || !self.pending.lock().insert(cluster_id) {
            return Err(TransferError::AlreadyConnected(format!("cluster {cluster_id}")));
        }

        let result = match self.engine.connect(&remote, timeout).await {
            Ok(()) => match self.fetch_table(&remote, timeout).await {
                Ok(table) => Ok(table),
                Err(err) => {
                    if let Err(close_err) = self.engine.disconnect(&remote, timeout).await {
                        warn!("Rollback disconnect from {} failed: {}", remote, close_err);
                    }
                    Err(err)
                }
            },
            Err(err) => Err(err),
        };
        self.pending.lock().remove(&cluster_id);

        let table = result?;
        info!(
            "Cluster linked: cluster_id={} remote={} caches={}",
            cluster_id,
            remote,
            table.len()
        );
        self.links
            .lock()
            .insert(cluster_id, LinkedCluster { remote, table });
        Ok(())
    }

    async fn fetch_table(
        &self,
        remote: &str,
        timeout: Duration,
    ) -> Result<Vec<CacheEntry>, TransferError> {
        match self
            .engine
            .fetch_metadata(remote, CACHE_TABLE_KEY, timeout)
            .await?
        {
            Some(bytes) => decode_cache_table(&bytes),
            None => Ok(Vec::new()),
        }
    }

    /// Unlink every cluster in `clusters` concurrently. Local state is dropped
    /// even when a peer does not acknowledge.
    pub async fn unlink_clusters(
        &self,
        clusters: &[ClusterInfo],
        timeout: Duration,
    ) -> Result<LinkReport, TransferError> {
        if clusters.is_empty() {
            return Err(TransferError::InvalidArgument(
                "cluster list must not be empty".into(),
            ));
        }
        let ids: Vec<u64> = clusters.iter().map(|c| c.remote_cluster_id).collect();
        Ok(self.unlink_ids(&ids, timeout).await)
    }

    /// Unlink everything currently linked.
    pub async fn unlink_all(&self, timeout: Duration) -> LinkReport {
        let ids: Vec<u64> = self.links.lock().keys().copied().collect();
        self.unlink_ids(&ids, timeout).await
    }

    async fn unlink_ids(&self, ids: &[u64], timeout: Duration) -> LinkReport {
        let results = join_all(ids.iter().map(|&cluster_id| async move {
            let linked = self.links.lock().remove(&cluster_id);
            let result = match linked {
                None => Err(TransferError::NotConnected(format!("cluster {cluster_id}"))),
                Some(linked) => {
                    let result = self.engine.disconnect(&linked.remote, timeout).await;
                    info!(
                        "Cluster unlinked: cluster_id={} remote={} acknowledged={}",
                        cluster_id,
                        linked.remote,
                        result.is_ok()
                    );
                    result
                }
            };
            (cluster_id, result)
        }))
        .await;
        LinkReport { results }
    }

    /// `(cluster_id, remote engine)` pairs, ordered by cluster id.
    pub fn linked_clusters(&self) -> Vec<(u64, String)> {
        self.links
            .lock()
            .iter()
            .map(|(id, linked)| (*id, linked.remote.clone()))
            .collect()
    }

    pub fn is_linked(&self, cluster_id: u64) -> bool {
        self.links.lock().contains_key(&cluster_id)
    }

    /// Cached copy of a linked cluster's cache table.
    pub fn remote_table(&self, cluster_id: u64) -> Option<Vec<CacheEntry>> {
        self.links
            .lock()
            .get(&cluster_id)
            .map(|linked| linked.table.clone())
    }

    /// Re-fetch a linked cluster's cache table.
    pub async fn refresh_table(&self, cluster_id: u64, timeout: Duration) -> Result<(), TransferError> {
        let remote = self.remote_of(cluster_id)?;
        let table = self.fetch_table(&remote, timeout).await?;
        if let Some(linked) = self.links.lock().get_mut(&cluster_id) {
            linked.table = table;
        }
        Ok(())
    }

    fn remote_of(&self, cluster_id: u64) -> Result<String, TransferError> {
        self.links
            .lock()
            .get(&cluster_id)
            .map(|linked| linked.remote.clone())
            .ok_or_else(|| TransferError::NotConnected(format!("cluster {cluster_id}")))
    }

    fn lookup(&self, key: CacheKey) -> Result<(String, Option<CacheEntry>), TransferError> {
        let links = self.links.lock();
        let linked = links
            .get(&key.cluster_id)
            .ok_or_else(|| TransferError::NotConnected(format!("cluster {}", key.cluster_id)))?;
        let entry = linked.table.iter().find(|entry| entry.key == key).cloned();
        Ok((linked.remote.clone(), entry))
    }

    /// Remote engine and cache entry for `key`, refreshing the table once on a miss.
    pub(crate) async fn resolve(
        &self,
        key: CacheKey,
        timeout: Duration,
    ) -> Result<(String, CacheEntry), TransferError> {
        if let (remote, Some(entry)) = self.lookup(key)? {
            return Ok((remote, entry));
        }
        self.refresh_table(key.cluster_id, timeout).await?;
        match self.lookup(key)? {
            (remote, Some(entry)) => Ok((remote, entry)),
            (_, None) => Err(TransferError::InvalidArgument(format!(
                "remote cache {key} is not registered"
            ))),
        }
    }

    pub fn engine(&self) -> &Arc<TransferEngine> {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn cluster(id: u64, remotes: Vec<IpInfo>) -> ClusterInfo {
        ClusterInfo {
            remote_cluster_id: id,
            local_ip_infos: vec![],
            remote_ip_infos: remotes,
        }
    }

    #[test]
    fn cluster_needs_exactly_one_remote() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert_eq!(
            cluster(1, vec![IpInfo::new(ip, 26000)]).remote().unwrap(),
            "127.0.0.1:26000"
        );
        assert!(cluster(1, vec![]).remote().is_err());
        assert!(
            cluster(1, vec![IpInfo::new(ip, 1), IpInfo::new(ip, 2)])
                .remote()
                .is_err()
        );
        assert!(cluster(1, vec![IpInfo::new(ip, 0)]).remote().is_err());
    }

    #[test]
    fn report_status_is_first_error() {
        let report = LinkReport {
            results: vec![
                (1, Ok(())),
                (2, Err(TransferError::Timeout("x".into()))),
                (3, Err(TransferError::NotConnected("y".into()))),
            ],
        };
        assert!(!report.is_ok());
        assert_eq!(report.first_error().map(|(id, _)| id), Some(2));
        assert_eq!(report.status_code(), status::TIMEOUT);
        assert!(matches!(
            report.into_result(),
            Err(TransferError::Timeout(_))
        ));

        let ok = LinkReport {
            results: vec![(1, Ok(()))],
        };
        assert_eq!(ok.status_code(), status::SUCCESS);
    }

    #[tokio::test]
    async fn empty_lists_and_unknown_clusters() {
        let engine = Arc::new(TransferEngine::default());
        engine.initialize("127.0.0.1").await.unwrap();
        let links = LinkManager::new(Arc::clone(&engine));

        assert!(matches!(
            links.link_clusters(&[], Duration::from_secs(1)).await,
            Err(TransferError::InvalidArgument(_))
        ));
        let report = links
            .unlink_clusters(&[cluster(9, vec![])], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report.status_code(), status::NOT_CONNECTED);
        assert!(links.linked_clusters().is_empty());
        engine.finalize().await;
    }
}
