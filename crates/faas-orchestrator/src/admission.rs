//! Bounded admission for concurrent invocations.

use faas_common::{FaasError, Result};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

/// Fixed pool of admission slots. Waiters queue without limit and are
/// served first-come-first-served.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Suspends until a slot is free. The slot returns to the pool when the
    /// returned guard is released or dropped.
    pub async fn acquire(&self) -> Result<AdmissionSlot> {
        if self.semaphore.available_permits() == 0 {
            debug!(capacity = self.capacity, "Admission budget exhausted, waiting for a slot");
        }
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FaasError::Internal("Admission controller closed".to_string()))?;
        trace!(available = self.available(), "Admission slot acquired");
        Ok(AdmissionSlot { permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.available()
    }
}

/// One held admission slot.
#[derive(Debug)]
#[must_use = "dropping the slot releases it immediately"]
pub struct AdmissionSlot {
    permit: OwnedSemaphorePermit,
}

impl AdmissionSlot {
    /// Returns the slot. Consuming `self` makes a second release impossible;
    /// dropping the slot has the same effect.
    pub fn release(self) {
        drop(self.permit);
    }
}
