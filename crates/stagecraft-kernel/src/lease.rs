//! Counted leases over shared resources
//!
//! A run does not own the registry or the telemetry ledger; it leases them.
//! Each resource keeps a [`LeaseCounter`] of in-flight leases, and each
//! [`Lease`] is a [`Disposable`] that gives its slot back exactly once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Cleanup failure
///
/// Always logged by the owner of the cleanup, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DisposalError {
    /// Resource was already released
    #[error("{resource} already released")]
    AlreadyReleased {
        /// Resource label
        resource: String,
    },

    /// Release bookkeeping went below zero
    #[error("{resource} lease count underflow")]
    Underflow {
        /// Resource label
        resource: String,
    },

    /// Resource-specific release failure
    #[error("{resource} failed to release: {reason}")]
    Failed {
        /// Resource label
        resource: String,
        /// Failure reason
        reason: String,
    },
}

/// Something that must be released once
pub trait Disposable: Send {
    /// Label used in logs
    fn label(&self) -> &str;

    /// Release the resource
    ///
    /// # Errors
    /// Returns [`DisposalError`] if release fails. Callers log it and move on.
    fn dispose(&mut self) -> Result<(), DisposalError>;
}

/// Count of in-flight leases on a resource
#[derive(Debug, Default)]
pub struct LeaseCounter {
    active: AtomicUsize,
    total: AtomicUsize,
}

impl LeaseCounter {
    /// Create zeroed counter
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self, resource: &str) -> Result<(), DisposalError> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|_| ())
            .map_err(|_| DisposalError::Underflow {
                resource: resource.to_string(),
            })
    }

    /// Leases currently held
    #[inline]
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Leases ever granted
    #[inline]
    #[must_use]
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }
}

/// Resource that can be leased
pub trait Leasable: Send + Sync {
    /// Counter tracking this resource's leases
    fn lease_counter(&self) -> &LeaseCounter;

    /// Label used in logs and disposal errors
    fn resource_name(&self) -> &'static str;
}

/// A held lease on `T`
///
/// Released by [`Disposable::dispose`], or on drop if never disposed.
pub struct Lease<T: Leasable> {
    resource: Arc<T>,
    released: bool,
}

impl<T: Leasable> Lease<T> {
    /// Take a lease on `resource`
    #[must_use]
    pub fn acquire(resource: Arc<T>) -> Self {
        resource.lease_counter().acquire();
        tracing::trace!(
            resource = resource.resource_name(),
            active = resource.lease_counter().active(),
            "lease acquired"
        );
        Self {
            resource,
            released: false,
        }
    }

    /// The leased resource
    #[inline]
    #[must_use]
    pub fn resource(&self) -> &Arc<T> {
        &self.resource
    }

    /// Whether this lease has been given back
    #[inline]
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl<T: Leasable> std::fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("resource", &self.resource.resource_name())
            .field("released", &self.released)
            .finish()
    }
}

impl<T: Leasable> Disposable for Lease<T> {
    fn label(&self) -> &str {
        self.resource.resource_name()
    }

    fn dispose(&mut self) -> Result<(), DisposalError> {
        if self.released {
            return Err(DisposalError::AlreadyReleased {
                resource: self.resource.resource_name().to_string(),
            });
        }
        self.released = true;
        self.resource
            .lease_counter()
            .release(self.resource.resource_name())
    }
}

impl<T: Leasable> Drop for Lease<T> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.dispose() {
                tracing::warn!(error = %e, "lease release on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Thing {
        leases: LeaseCounter,
    }

    impl Leasable for Thing {
        fn lease_counter(&self) -> &LeaseCounter {
            &self.leases
        }

        fn resource_name(&self) -> &'static str {
            "thing"
        }
    }

    #[test]
    fn dispose_releases_once() {
        let thing = Arc::new(Thing::default());
        let mut lease = Lease::acquire(Arc::clone(&thing));
        assert_eq!(thing.leases.active(), 1);

        lease.dispose().unwrap();
        assert_eq!(thing.leases.active(), 0);
        assert!(matches!(
            lease.dispose(),
            Err(DisposalError::AlreadyReleased { .. })
        ));
        assert_eq!(thing.leases.active(), 0);
    }

    #[test]
    fn drop_releases_undisposed_lease() {
        let thing = Arc::new(Thing::default());
        {
            let _a = Lease::acquire(Arc::clone(&thing));
            let _b = Lease::acquire(Arc::clone(&thing));
            assert_eq!(thing.leases.active(), 2);
        }
        assert_eq!(thing.leases.active(), 0);
        assert_eq!(thing.leases.total(), 2);
    }

    #[test]
    fn disposed_lease_is_not_released_again_on_drop() {
        let thing = Arc::new(Thing::default());
        let keep = Lease::acquire(Arc::clone(&thing));
        let mut lease = Lease::acquire(Arc::clone(&thing));
        lease.dispose().unwrap();
        drop(lease);
        assert_eq!(thing.leases.active(), 1);
        drop(keep);
    }
}
