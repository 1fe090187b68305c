//! Replica pool and session-to-replica routing
//!
//! The pool is a fixed arena of slots with atomic job counters: assignment
//! and release are the only state shared across sessions, so they must be
//! race-free without a broad lock.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Static description of one replica, from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Compute device this replica is bound to, e.g. "cuda:0"
    pub device_id: String,
    /// Maximum concurrent synthesis jobs
    pub capacity: usize,
}

/// Every healthy replica is at full capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("all replicas busy")]
pub struct RouterBusy;

/// One synthesis execution unit bound to a compute device
#[derive(Debug)]
pub struct Replica {
    device_id: String,
    index: usize,
    capacity: usize,
    active: AtomicUsize,
    healthy: AtomicBool,
    fail_streak: AtomicU32,
}

impl Replica {
    fn new(config: &ReplicaConfig, index: usize) -> Self {
        Self {
            device_id: config.device_id.clone(),
            index,
            capacity: config.capacity,
            active: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            fail_streak: AtomicU32::new(0),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Increment the job count unless at capacity. The CAS loop is the
    /// single mutation point, so active never exceeds capacity even under
    /// concurrent assignment.
    fn try_acquire(&self) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok();
    }

    /// Record a failed job. Returns true when the failure streak crossed
    /// `threshold` and the replica was marked unhealthy.
    pub fn record_job_failure(&self, threshold: u32) -> bool {
        let streak = self.fail_streak.fetch_add(1, Ordering::AcqRel) + 1;
        if streak >= threshold && self.healthy.swap(false, Ordering::AcqRel) {
            tracing::warn!(
                device = %self.device_id,
                streak,
                "replica marked unhealthy after repeated job failures"
            );
            return true;
        }
        false
    }

    pub fn record_job_success(&self) {
        self.fail_streak.store(0, Ordering::Release);
    }

    /// Force the replica out of rotation immediately (device gone).
    pub fn mark_unhealthy(&self) {
        if self.healthy.swap(false, Ordering::AcqRel) {
            tracing::warn!(device = %self.device_id, "replica marked unhealthy");
        }
    }

    fn reinstate(&self) {
        self.fail_streak.store(0, Ordering::Release);
        if !self.healthy.swap(true, Ordering::AcqRel) {
            tracing::info!(device = %self.device_id, "replica reinstated");
        }
    }
}

/// A session's hold on one replica job slot.
///
/// Release is idempotent: every error path may call it, and dropping the
/// slot releases it as a last resort, but the count decrements once.
#[derive(Debug)]
pub struct ReplicaSlot {
    replica: Arc<Replica>,
    released: AtomicBool,
}

impl ReplicaSlot {
    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.replica.release();
        }
    }
}

impl Drop for ReplicaSlot {
    fn drop(&mut self) {
        self.release();
    }
}

/// Owns the replica pool; assigns each new session exactly one replica.
#[derive(Debug)]
pub struct ReplicaRouter {
    replicas: Vec<Arc<Replica>>,
    fail_threshold: u32,
}

impl ReplicaRouter {
    pub fn new(configs: &[ReplicaConfig], fail_threshold: u32) -> Self {
        Self {
            replicas: configs
                .iter()
                .enumerate()
                .map(|(index, config)| Arc::new(Replica::new(config, index)))
                .collect(),
            fail_threshold,
        }
    }

    pub fn replicas(&self) -> &[Arc<Replica>] {
        &self.replicas
    }

    pub fn fail_threshold(&self) -> u32 {
        self.fail_threshold
    }

    /// Pick the healthy replica with the lowest active/capacity ratio;
    /// ties break by lower absolute load, then by device index. Returns
    /// `RouterBusy` immediately when everything is saturated — callers
    /// turn that into a start rejection, nothing queues.
    pub fn assign(&self) -> Result<ReplicaSlot, RouterBusy> {
        // A concurrent assignment can take the chosen slot between the
        // scan and the acquire; rescan until acquisition or exhaustion.
        loop {
            let mut best: Option<(&Arc<Replica>, usize)> = None;

            for replica in &self.replicas {
                if !replica.is_healthy() {
                    continue;
                }
                let active = replica.active_jobs();
                if active >= replica.capacity() {
                    continue;
                }
                best = match best {
                    None => Some((replica, active)),
                    Some((current, current_active)) => {
                        // Compare active/capacity ratios without floats:
                        // a1/c1 < a2/c2  <=>  a1*c2 < a2*c1.
                        let lhs = active * current.capacity();
                        let rhs = current_active * replica.capacity();
                        if lhs < rhs || (lhs == rhs && active < current_active) {
                            Some((replica, active))
                        } else {
                            Some((current, current_active))
                        }
                    }
                };
            }

            let Some((candidate, _)) = best else {
                return Err(RouterBusy);
            };

            if candidate.try_acquire() {
                return Ok(ReplicaSlot {
                    replica: Arc::clone(candidate),
                    released: AtomicBool::new(false),
                });
            }
        }
    }

    /// External health-check hook: put a replica back into rotation.
    /// Sessions that failed while it was out are not resurrected.
    pub fn reinstate(&self, device_id: &str) -> bool {
        match self.replicas.iter().find(|r| r.device_id() == device_id) {
            Some(replica) => {
                replica.reinstate();
                true
            }
            None => false,
        }
    }

    pub fn total_active(&self) -> usize {
        self.replicas.iter().map(|r| r.active_jobs()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(capacities: &[usize]) -> ReplicaRouter {
        let configs: Vec<ReplicaConfig> = capacities
            .iter()
            .enumerate()
            .map(|(i, &capacity)| ReplicaConfig {
                device_id: format!("cuda:{}", i),
                capacity,
            })
            .collect();
        ReplicaRouter::new(&configs, 3)
    }

    #[test]
    fn test_assign_prefers_lowest_index_on_even_load() {
        let router = pool(&[2, 2]);
        let slot = router.assign().unwrap();
        assert_eq!(slot.replica().device_id(), "cuda:0");
    }

    #[test]
    fn test_assign_balances_by_load_ratio() {
        let router = pool(&[4, 2]);
        // 0/4 vs 0/2: ratios and absolute load tie, index breaks.
        let s0 = router.assign().unwrap();
        assert_eq!(s0.replica().device_id(), "cuda:0");
        // 1/4 vs 0/2: cuda:1 has the lower ratio.
        let s1 = router.assign().unwrap();
        assert_eq!(s1.replica().device_id(), "cuda:1");
        // 1/4 vs 1/2: back to cuda:0.
        let s2 = router.assign().unwrap();
        assert_eq!(s2.replica().device_id(), "cuda:0");
    }

    #[test]
    fn test_busy_when_saturated() {
        let router = pool(&[1]);
        let _slot = router.assign().unwrap();
        assert_eq!(router.assign().unwrap_err(), RouterBusy);
    }

    #[test]
    fn test_release_is_idempotent() {
        let router = pool(&[2]);
        let slot = router.assign().unwrap();
        assert_eq!(router.total_active(), 1);
        slot.release();
        slot.release();
        assert_eq!(router.total_active(), 0);
        // Drop after explicit release must not double-decrement.
        drop(slot);
        assert_eq!(router.total_active(), 0);
    }

    #[test]
    fn test_drop_releases() {
        let router = pool(&[1]);
        {
            let _slot = router.assign().unwrap();
            assert_eq!(router.total_active(), 1);
        }
        assert_eq!(router.total_active(), 0);
    }

    #[test]
    fn test_unhealthy_excluded_until_reinstated() {
        let router = pool(&[1, 1]);
        router.replicas()[0].mark_unhealthy();

        let slot = router.assign().unwrap();
        assert_eq!(slot.replica().device_id(), "cuda:1");
        drop(slot);

        assert!(router.reinstate("cuda:0"));
        assert!(!router.reinstate("cuda:9"));
        let slot = router.assign().unwrap();
        assert_eq!(slot.replica().device_id(), "cuda:0");
    }

    #[test]
    fn test_failure_streak_marks_unhealthy() {
        let router = pool(&[1]);
        let replica = &router.replicas()[0];
        assert!(!replica.record_job_failure(3));
        replica.record_job_success();
        assert!(!replica.record_job_failure(3));
        assert!(!replica.record_job_failure(3));
        assert!(replica.record_job_failure(3));
        assert!(!replica.is_healthy());
    }

    #[test]
    fn test_capacity_never_exceeded_under_concurrency() {
        let router = Arc::new(pool(&[3, 3]));
        let mut handles = Vec::new();

        for _ in 0..16 {
            let router = Arc::clone(&router);
            handles.push(std::thread::spawn(move || {
                let mut granted = 0usize;
                for _ in 0..50 {
                    if let Ok(slot) = router.assign() {
                        let replica = Arc::clone(slot.replica());
                        assert!(replica.active_jobs() <= replica.capacity());
                        granted += 1;
                        drop(slot);
                    }
                }
                granted
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(router.total_active(), 0);
    }
}
