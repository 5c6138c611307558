//! Scalar metadata: checkpoints, counters, leases and cached credentials.
//!
//! Values live in the `records` table under kind [`META_KIND`] as JSON, so
//! they share transactions with the records they describe.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::store::{Store, StoreError, Tx};

pub const META_KIND: &str = "Meta";

impl Tx<'_> {
    /// Read a metadata value. Absent keys are `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored JSON does not decode as `T`.
    pub fn read_meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let Some((_, body)) = self.raw_get(META_KIND, key)? else {
            return Ok(None);
        };
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|source| StoreError::Decode {
                kind: META_KIND.to_string(),
                key: key.to_string(),
                source,
            })
    }

    /// Write a metadata value.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the write fails.
    pub fn write_meta<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let body = serde_json::to_string(value)?;
        self.raw_put(META_KIND, key, 0, &body)
    }

    /// Delete a metadata value. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete_meta(&self, key: &str) -> Result<bool, StoreError> {
        self.delete(META_KIND, key)
    }

    /// Add `delta` to an integer counter, creating it at zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter cannot be read or written.
    pub fn bump_counter(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let next = self.read_meta::<i64>(key)?.unwrap_or(0) + delta;
        self.write_meta(key, &next)?;
        Ok(next)
    }
}

impl Store {
    /// See [`Tx::read_meta`].
    ///
    /// # Errors
    ///
    /// Returns an error if the stored JSON does not decode as `T`.
    pub fn read_meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        self.autocommit().read_meta(key)
    }

    /// See [`Tx::write_meta`].
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the write fails.
    pub fn write_meta<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.autocommit().write_meta(key, value)
    }

    /// See [`Tx::delete_meta`].
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete_meta(&self, key: &str) -> Result<bool, StoreError> {
        self.autocommit().delete_meta(key)
    }

    /// Raw JSON text of a metadata value, for operator tooling.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn read_meta_raw(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        self.read_meta::<serde_json::Value>(key)
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::ManualClock;
    use crate::store::{DataKinds, Store, StoreError};
    use chrono::{DateTime, Utc};
    use std::sync::Arc;

    fn store() -> Store {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_400_000_000, 0).expect("valid timestamp"),
        ));
        Store::open_in_memory(Arc::new(DataKinds::default()), clock).expect("open store")
    }

    #[test]
    fn meta_round_trips_typed_values() -> Result<(), StoreError> {
        let store = store();
        assert_eq!(store.read_meta::<String>("issue.mtime")?, None);

        let at: DateTime<Utc> = DateTime::from_timestamp(1_388_534_400, 0).expect("valid");
        store.write_meta("issue.mtime", &at)?;
        assert_eq!(store.read_meta::<DateTime<Utc>>("issue.mtime")?, Some(at));

        store.write_meta("codereview.mtime.cc.g", "2014-01-01 00:00:00")?;
        assert_eq!(
            store.read_meta::<String>("codereview.mtime.cc.g")?.as_deref(),
            Some("2014-01-01 00:00:00")
        );

        assert!(store.delete_meta("issue.mtime")?);
        assert!(!store.delete_meta("issue.mtime")?);
        Ok(())
    }

    #[test]
    fn counters_start_at_zero() -> Result<(), StoreError> {
        let store = store();
        let n = store.transaction(|tx| {
            tx.bump_counter("issue.count", 1)?;
            tx.bump_counter("issue.count", 1)
        })?;
        assert_eq!(n, 2);
        Ok(())
    }

    #[test]
    fn wrong_type_is_a_decode_error() -> Result<(), StoreError> {
        let store = store();
        store.write_meta("k", "not a number")?;
        let err = store.read_meta::<i64>("k").expect_err("decode must fail");
        assert!(matches!(err, StoreError::Decode { .. }));
        Ok(())
    }
}
