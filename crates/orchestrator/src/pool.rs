// crates/orchestrator/src/pool.rs
//! Endpoint pool - exclusive leases on browser (CDP) endpoints

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Hands out each endpoint to at most one holder at a time. Waiters are
/// parked on a semaphore with one permit per free endpoint.
#[derive(Clone)]
pub struct EndpointPool {
    inner: Arc<Inner>,
}

struct Inner {
    endpoints: Vec<String>,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    next_lease: AtomicU64,
}

struct PoolState {
    available: VecDeque<String>,
    in_use: HashMap<String, Holder>,
}

struct Holder {
    lease_id: u64,
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
    pub endpoint: String,
    pub in_use: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub endpoints: Vec<EndpointStatus>,
}

impl EndpointPool {
    /// Build a pool. Duplicates are dropped; an empty list is rejected.
    pub fn new<I, S>(endpoints: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for endpoint in endpoints {
            let endpoint = endpoint.into().trim().to_string();
            if !endpoint.is_empty() && !unique.contains(&endpoint) {
                unique.push(endpoint);
            }
        }
        if unique.is_empty() {
            return Err(anyhow!("endpoint pool needs at least one endpoint"));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                permits: Arc::new(Semaphore::new(unique.len())),
                state: Mutex::new(PoolState {
                    available: unique.iter().cloned().collect(),
                    in_use: HashMap::new(),
                }),
                endpoints: unique,
                next_lease: AtomicU64::new(1),
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> &[String] {
        &self.inner.endpoints
    }

    /// Wait for a free endpoint. The lease returns it on drop.
    pub async fn acquire(&self) -> Result<EndpointLease> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("endpoint pool closed")?;

        let lease_id = self.inner.next_lease.fetch_add(1, Ordering::Relaxed);
        let mut state = self.inner.state.lock();
        let endpoint = state
            .available
            .pop_front()
            .context("endpoint pool has a permit but no free endpoint")?;
        state.in_use.insert(
            endpoint.clone(),
            Holder {
                lease_id,
                _permit: permit,
            },
        );
        drop(state);

        debug!("Leased endpoint {}", endpoint);
        Ok(EndpointLease {
            pool: self.inner.clone(),
            endpoint,
            lease_id,
        })
    }

    /// Return an endpoint. Unknown or already free endpoints are ignored.
    pub fn release(&self, endpoint: &str) {
        self.inner.release(endpoint, None);
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        let endpoints = self
            .inner
            .endpoints
            .iter()
            .map(|e| EndpointStatus {
                endpoint: e.clone(),
                in_use: state.in_use.contains_key(e),
            })
            .collect();
        PoolStatus {
            total: self.inner.endpoints.len(),
            available: state.available.len(),
            in_use: state.in_use.len(),
            endpoints,
        }
    }
}

impl Inner {
    /// `lease_id` restricts the release to the holder that acquired it, so a
    /// stale lease cannot free an endpoint someone else now holds.
    fn release(&self, endpoint: &str, lease_id: Option<u64>) {
        let mut state = self.state.lock();
        let held_by_caller = match (state.in_use.get(endpoint), lease_id) {
            (Some(holder), Some(id)) => holder.lease_id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !held_by_caller {
            return;
        }
        // the permit drops with the holder, after the endpoint is back in the queue
        let holder = state.in_use.remove(endpoint);
        state.available.push_back(endpoint.to_string());
        drop(state);
        drop(holder);
        debug!("Released endpoint {}", endpoint);
    }
}

/// Exclusive use of one endpoint until dropped.
pub struct EndpointLease {
    pool: Arc<Inner>,
    endpoint: String,
    lease_id: u64,
}

impl EndpointLease {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Drop for EndpointLease {
    fn drop(&mut self) {
        self.pool.release(&self.endpoint, Some(self.lease_id));
    }
}

impl std::fmt::Debug for EndpointLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointLease")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}
