//! Time-bounded advisory leases.
//!
//! A lease is a `Meta` value `Lock:<name>` holding its expiry. Acquire is a
//! single read-check-write transaction; release deletes the value. There is
//! no owner token: expiry is what reclaims a lease from a crashed holder.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::clock;
use crate::error::ErrorCode;
use crate::store::{Store, StoreError};

const LEASE_PREFIX: &str = "Lock:";

/// Meta key backing the lease `name`.
#[must_use]
pub fn lease_key(name: &str) -> String {
    format!("{LEASE_PREFIX}{name}")
}

/// Returned by one-off operations that refuse to run while a lease is held.
#[derive(Debug, thiserror::Error)]
#[error("{code}: lease {name:?} is held until {until}", code = ErrorCode::LeaseContention.code())]
pub struct LeaseBusy {
    pub name: String,
    pub until: DateTime<Utc>,
}

impl LeaseBusy {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::LeaseContention
    }

    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

/// Take the lease if nobody holds an unexpired one.
///
/// Fails closed: a store error is reported as "not acquired".
pub fn acquire(store: &Store, name: &str, duration: Duration) -> bool {
    match try_acquire(store, name, duration) {
        Ok(true) => true,
        Ok(false) => {
            debug!(lease = name, "lease held elsewhere");
            false
        }
        Err(err) => {
            debug!(lease = name, error = %err, "lease acquire failed; treating as held");
            false
        }
    }
}

/// Like [`acquire`] but surfaces store errors.
///
/// # Errors
///
/// Returns an error if the transaction cannot run.
pub fn try_acquire(store: &Store, name: &str, duration: Duration) -> Result<bool, StoreError> {
    let key = lease_key(name);
    store.transaction(|tx| {
        let now = tx.now();
        if let Some(expiry) = tx.read_meta::<DateTime<Utc>>(&key)? {
            if now < expiry {
                return Ok(false);
            }
        }
        tx.write_meta(&key, &clock::after(now, duration))?;
        Ok(true)
    })
}

/// Drop the lease. Idempotent.
pub fn release(store: &Store, name: &str) {
    if let Err(err) = store.delete_meta(&lease_key(name)) {
        warn!(lease = name, error = %err, "lease release failed; it will expire");
    }
}

/// Expiry of the lease if one is currently held.
///
/// # Errors
///
/// Returns an error if the lease value cannot be read.
pub fn held_until(store: &Store, name: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    let now = store.now();
    Ok(store
        .read_meta::<DateTime<Utc>>(&lease_key(name))?
        .filter(|expiry| now < *expiry))
}

/// RAII guard releasing its lease on drop.
#[derive(Debug)]
pub struct LeaseGuard<'s> {
    store: &'s Store,
    name: String,
}

impl<'s> LeaseGuard<'s> {
    /// Acquire `name` for `duration`, or `None` if it is held.
    #[must_use]
    pub fn acquire(store: &'s Store, name: &str, duration: Duration) -> Option<Self> {
        acquire(store, name, duration).then(|| Self {
            store,
            name: name.to_string(),
        })
    }

    /// Acquire `name` or report who holds it.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseBusy`] when the lease is held.
    pub fn acquire_or_busy(store: &'s Store, name: &str, duration: Duration) -> anyhow::Result<Self> {
        if let Some(guard) = Self::acquire(store, name, duration) {
            return Ok(guard);
        }
        let until = held_until(store, name)?.unwrap_or_else(|| store.now());
        Err(LeaseBusy {
            name: name.to_string(),
            until,
        }
        .into())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        release(self.store, &self.name);
    }
}
