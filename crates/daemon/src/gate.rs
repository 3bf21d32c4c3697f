//! Single-instance admission control
//!
//! The gate is a counter that starts at one. Acquiring decrements it and backs
//! the decrement out if the result went negative; releasing increments it. The
//! counter is the only state touched before a caller holds the permit.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use thiserror::Error;
use tracing::debug;

/// The gate's permit is already held by an active binding
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("an unlock binding is already active")]
pub struct AdmissionError;

/// Process-wide exclusivity gate
#[derive(Debug, Clone)]
pub struct ExclusivityGate {
    count: Arc<AtomicI32>,
}

impl ExclusivityGate {
    pub fn new() -> Self {
        Self {
            count: Arc::new(AtomicI32::new(1)),
        }
    }

    /// Try to take the single permit
    ///
    /// The returned [`GatePermit`] gives the permit back when dropped.
    pub fn try_acquire(&self) -> Result<GatePermit, AdmissionError> {
        if self.count.fetch_sub(1, Ordering::AcqRel) - 1 < 0 {
            self.count.fetch_add(1, Ordering::AcqRel);
            return Err(AdmissionError);
        }
        debug!("exclusivity permit acquired");
        Ok(GatePermit {
            count: Arc::clone(&self.count),
        })
    }

    /// Whether the permit is currently free
    pub fn is_available(&self) -> bool {
        self.count.load(Ordering::Acquire) > 0
    }
}

impl Default for ExclusivityGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof of admission; releases the gate exactly once on drop
#[derive(Debug)]
pub struct GatePermit {
    count: Arc<AtomicI32>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.count.fetch_add(1, Ordering::AcqRel);
        debug!("exclusivity permit released");
    }
}
