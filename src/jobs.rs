//! Work-unit tracking between the node's getwork endpoint and the miners.
//!
//! One poll task writes; every miner session reads. A small window of
//! superseded jobs is kept so late Stratum submissions can still be
//! reconstructed instead of bouncing with "job not found".

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::metrics::prometheus as metrics;
use crate::rpc::{NodeRpc, RpcError};

/// Superseded jobs kept around for in-flight submissions.
const JOB_CACHE_LIMIT: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: String,
    pub header_hash: String,
    pub seed_hash: String,
    pub boundary: String,
    pub created_at: DateTime<Utc>,
}

/// Verdict on a forwarded solution, rendered on the wire as
/// `accepted` / `rejected` / `error: <detail>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected,
    Error(String),
}

impl fmt::Display for SubmitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitOutcome::Accepted => f.write_str("accepted"),
            SubmitOutcome::Rejected => f.write_str("rejected"),
            SubmitOutcome::Error(detail) => write!(f, "error: {}", detail),
        }
    }
}

/// Ensure a hex argument carries the `0x` prefix the node expects.
pub fn ensure_0x(s: &str) -> String {
    if s.starts_with("0x") {
        s.to_string()
    } else {
        format!("0x{}", s)
    }
}

/// Shorten a hash for log lines.
pub fn abbrev(hash: &str) -> String {
    if hash.len() > 18 && hash.is_ascii() {
        format!("{}..{}", &hash[..10], &hash[hash.len() - 6..])
    } else {
        hash.to_string()
    }
}

/// Numeric value of a proxy job id, used for eviction ordering.
fn job_seq(job_id: &str) -> u64 {
    u64::from_str_radix(job_id.trim_start_matches("0x"), 16).unwrap_or(0)
}

#[derive(Default)]
struct JobCache {
    jobs: HashMap<String, Arc<Job>>,
    by_header: HashMap<String, Arc<Job>>,
    current: Option<Arc<Job>>,
    counter: u64,
}

impl JobCache {
    /// Record a getwork triple. Returns the new Job when the header
    /// changed, `None` when it matches the current job.
    fn advance(
        &mut self,
        header_hash: String,
        seed_hash: String,
        boundary: String,
    ) -> Option<Arc<Job>> {
        if let Some(current) = &self.current {
            if current.header_hash == header_hash {
                return None;
            }
        }

        self.counter += 1;
        let job = Arc::new(Job {
            job_id: format!("0x{:x}", self.counter),
            header_hash,
            seed_hash,
            boundary,
            created_at: Utc::now(),
        });

        self.jobs.insert(job.job_id.clone(), job.clone());
        self.by_header
            .insert(job.header_hash.to_lowercase(), job.clone());
        self.current = Some(job.clone());
        self.prune();

        Some(job)
    }

    fn prune(&mut self) {
        while self.jobs.len() > JOB_CACHE_LIMIT {
            let Some(oldest) = self.jobs.keys().min_by_key(|id| job_seq(id)).cloned() else {
                break;
            };
            if let Some(job) = self.jobs.remove(&oldest) {
                self.by_header.remove(&job.header_hash.to_lowercase());
            }
        }
    }

    fn find(&self, job_id: Option<&str>, header_hash: Option<&str>) -> Option<Arc<Job>> {
        if let Some(id) = job_id {
            if let Some(job) = self.jobs.get(id) {
                return Some(job.clone());
            }
        }
        header_hash.and_then(|h| self.by_header.get(&h.to_lowercase()).cloned())
    }
}

pub struct JobManager {
    rpc: Arc<NodeRpc>,
    cache: RwLock<JobCache>,
}

impl JobManager {
    pub fn new(rpc: Arc<NodeRpc>) -> Self {
        Self {
            rpc,
            cache: RwLock::new(JobCache::default()),
        }
    }

    pub fn rpc(&self) -> &NodeRpc {
        &self.rpc
    }

    /// One poll tick: fetch work and compare against the current job.
    /// `Ok(None)` covers both "node has no work" and "header unchanged".
    pub async fn poll_work(&self) -> Result<Option<Arc<Job>>, RpcError> {
        let Some([header_hash, seed_hash, boundary]) = self.rpc.get_work().await? else {
            return Ok(None);
        };

        let mut cache = self.cache.write().await;
        Ok(cache.advance(header_hash, seed_hash, boundary))
    }

    pub async fn current_job(&self) -> Option<Arc<Job>> {
        self.cache.read().await.current.clone()
    }

    /// Look up a job by proxy id (Stratum) or header hash (EthProxy).
    pub async fn find_job(
        &self,
        job_id: Option<&str>,
        header_hash: Option<&str>,
    ) -> Option<Arc<Job>> {
        self.cache.read().await.find(job_id, header_hash)
    }

    /// Forward a solution to the node.
    pub async fn submit_solution(
        &self,
        nonce: &str,
        header_hash: Option<&str>,
        mix_digest: Option<&str>,
    ) -> SubmitOutcome {
        let nonce = ensure_0x(nonce);
        let header_hash = header_hash.map(ensure_0x);
        let mix_digest = mix_digest.map(ensure_0x);

        match self
            .rpc
            .submit_work(&nonce, header_hash.as_deref(), mix_digest.as_deref())
            .await
        {
            Ok(true) => {
                tracing::info!(
                    "*** BLOCK FOUND! *** nonce={} header={}",
                    nonce,
                    abbrev(header_hash.as_deref().unwrap_or("?"))
                );
                metrics::inc_blocks_found();
                SubmitOutcome::Accepted
            }
            Ok(false) => {
                tracing::warn!("solution REJECTED by node nonce={}", nonce);
                SubmitOutcome::Rejected
            }
            Err(e) => {
                tracing::error!("eth_submitWork error: {}", e);
                SubmitOutcome::Error(e.to_string())
            }
        }
    }

    pub async fn stats(&self) -> Value {
        let cache = self.cache.read().await;
        json!({
            "current": cache.current.as_deref(),
            "cached_jobs": cache.jobs.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advance_n(cache: &mut JobCache, n: usize) -> Vec<Arc<Job>> {
        (0..n)
            .filter_map(|i| {
                cache.advance(
                    format!("0xAA{:02x}", i),
                    "0xseed".to_string(),
                    "0x00ff".to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn test_ensure_0x() {
        assert_eq!(ensure_0x("abcd"), "0xabcd");
        assert_eq!(ensure_0x("0xabcd"), "0xabcd");
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(SubmitOutcome::Accepted.to_string(), "accepted");
        assert_eq!(SubmitOutcome::Rejected.to_string(), "rejected");
        assert_eq!(
            SubmitOutcome::Error("boom".to_string()).to_string(),
            "error: boom"
        );
    }

    #[test]
    fn test_unchanged_header_creates_one_job() {
        let mut cache = JobCache::default();
        let first = cache.advance("0xAA".into(), "0xBB".into(), "0x00ff".into());
        assert!(first.is_some());
        assert!(cache
            .advance("0xAA".into(), "0xBB".into(), "0x00ff".into())
            .is_none());
        assert!(cache
            .advance("0xAA".into(), "0xBB".into(), "0x00ff".into())
            .is_none());
        assert_eq!(cache.jobs.len(), 1);
        assert_eq!(cache.current.as_ref().unwrap().job_id, "0x1");
    }

    #[test]
    fn test_job_ids_monotonic_hex() {
        let mut cache = JobCache::default();
        let jobs = advance_n(&mut cache, 3);
        let ids: Vec<&str> = jobs.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, ["0x1", "0x2", "0x3"]);
    }

    #[test]
    fn test_find_by_id_and_case_insensitive_header() {
        let mut cache = JobCache::default();
        let job = cache
            .advance("0xAABBCC".into(), "0xseed".into(), "0x00ff".into())
            .unwrap();

        assert_eq!(
            cache.find(Some(&job.job_id), None).unwrap().header_hash,
            "0xAABBCC"
        );
        assert_eq!(
            cache.find(None, Some("0xaabbcc")).unwrap().job_id,
            job.job_id
        );
        assert!(cache.find(Some("0x999"), None).is_none());
        assert!(cache.find(None, None).is_none());
    }

    #[test]
    fn test_eviction_keeps_twenty_newest() {
        let mut cache = JobCache::default();
        let jobs = advance_n(&mut cache, 25);
        assert_eq!(jobs.len(), 25);
        assert_eq!(cache.jobs.len(), 20);
        assert_eq!(cache.by_header.len(), 20);

        // The five oldest are gone from both maps, for good.
        for evicted in &jobs[..5] {
            assert!(cache.find(Some(&evicted.job_id), None).is_none());
            assert!(cache.find(None, Some(&evicted.header_hash)).is_none());
        }
        for kept in &jobs[5..] {
            assert!(cache.find(Some(&kept.job_id), None).is_some());
        }
        assert_eq!(cache.current.as_ref().unwrap().job_id, jobs[24].job_id);
    }

    #[tokio::test]
    async fn test_manager_starts_empty() {
        let rpc = Arc::new(NodeRpc::new("http://127.0.0.1:8545".to_string()));
        let manager = JobManager::new(rpc);
        assert!(manager.current_job().await.is_none());
        assert!(manager.find_job(Some("0x1"), None).await.is_none());
    }
}
