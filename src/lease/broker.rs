//! Bounded-concurrency access to shared endpoints.
//!
//! The broker owns the acquisition policy (capability filter, shuffling,
//! per-slot attempts, jittered backoff). Where a slot is actually recorded is
//! up to a [`SlotStore`] backend; [`FsSlotStore`](super::FsSlotStore) keeps one
//! locked descriptor file per slot so uncoordinated processes on one host
//! share the same pool.

use std::time::Duration;

use rand::RngExt;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::LeaseDescriptor;
use crate::error::LeaseError;

/// A named external service with a fixed number of concurrent slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub url: String,
    pub capacity: u32,
    /// Free-form capability tags, e.g. the models loaded on the server.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Endpoint {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// How long `acquire` keeps trying before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitBudget {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter_max: Duration,
}

impl WaitBudget {
    /// Sleep between two full passes: `base_delay + random(0..=jitter_max)`.
    pub fn next_delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.jitter_max.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.base_delay + Duration::from_millis(jitter)
    }
}

/// Backend that records slot ownership.
pub trait SlotStore: Send + Sync {
    type Slot: SlotLease;

    /// Non-blocking attempt on one slot. `Ok(None)` means the slot is busy.
    fn try_acquire(
        &self,
        endpoint: &Endpoint,
        slot: u32,
        purpose: &str,
    ) -> Result<Option<Self::Slot>, LeaseError>;
}

/// An owned slot. Dropping it must release it as well.
pub trait SlotLease: Send {
    fn descriptor(&self) -> &LeaseDescriptor;

    fn release(self) -> Result<(), LeaseError>;
}

/// A granted lease on one endpoint slot, released on drop.
#[derive(Debug)]
pub struct LeaseHandle<L: SlotLease> {
    slot: L,
    endpoint: Endpoint,
}

impl<L: SlotLease> LeaseHandle<L> {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn descriptor(&self) -> &LeaseDescriptor {
        self.slot.descriptor()
    }

    /// Releases now, surfacing errors that a plain drop would only log.
    pub fn release(self) -> Result<(), LeaseError> {
        self.slot.release()
    }
}

pub struct LeaseBroker<S: SlotStore> {
    store: S,
    endpoints: Vec<Endpoint>,
    budget: WaitBudget,
    cancel: CancellationToken,
}

impl<S: SlotStore> LeaseBroker<S> {
    pub fn new(
        store: S,
        endpoints: Vec<Endpoint>,
        budget: WaitBudget,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            endpoints,
            budget,
            cancel,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Wait budget from configuration.
    pub fn budget(&self) -> WaitBudget {
        self.budget
    }

    /// Sum of slot capacities over all configured endpoints.
    pub fn total_capacity(&self) -> u32 {
        self.endpoints.iter().map(|e| e.capacity).sum()
    }

    /// Acquires one slot on an endpoint accepted by `capability`.
    ///
    /// Each pass shuffles the eligible endpoints and tries every slot of each
    /// without blocking. Between passes it sleeps per `budget`; the sleep ends
    /// early with [`LeaseError::Cancelled`] on shutdown. After
    /// `budget.max_attempts` passes it returns
    /// [`LeaseError::ResourceExhausted`], even when nothing was eligible.
    pub async fn acquire<F>(
        &self,
        capability: F,
        purpose: &str,
        budget: WaitBudget,
    ) -> Result<LeaseHandle<S::Slot>, LeaseError>
    where
        F: Fn(&Endpoint) -> bool + Send + Sync,
    {
        let mut eligible: Vec<&Endpoint> =
            self.endpoints.iter().filter(|e| capability(*e)).collect();
        if eligible.is_empty() {
            warn!(purpose, "no configured endpoint satisfies the capability");
        }

        let attempts = budget.max_attempts.max(1);
        for attempt in 1..=attempts {
            eligible.shuffle(&mut rand::rng());
            if let Some(handle) = self.try_endpoints(&eligible, purpose)? {
                debug!(
                    purpose,
                    endpoint = %handle.endpoint.id,
                    slot = handle.descriptor().slot,
                    attempt,
                    "lease acquired"
                );
                return Ok(handle);
            }

            if attempt < attempts {
                let delay = budget.next_delay();
                debug!(
                    purpose,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "all slots busy, backing off"
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(LeaseError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        warn!(purpose, attempts, "lease wait budget exhausted");
        Err(LeaseError::ResourceExhausted {
            purpose: purpose.to_string(),
            attempts,
        })
    }

    fn try_endpoints(
        &self,
        eligible: &[&Endpoint],
        purpose: &str,
    ) -> Result<Option<LeaseHandle<S::Slot>>, LeaseError> {
        for endpoint in eligible {
            for slot in 0..endpoint.capacity {
                if let Some(lease) = self.store.try_acquire(endpoint, slot, purpose)? {
                    return Ok(Some(LeaseHandle {
                        slot: lease,
                        endpoint: (*endpoint).clone(),
                    }));
                }
            }
        }
        Ok(None)
    }
}
