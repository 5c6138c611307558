//! Per-kind record versions, migrations and derivation hooks.
//!
//! Every record type declares a current version, an ordered list of
//! migrations and an optional derive function. The table is built once at
//! startup and handed to the [`Store`](super::Store) behind an `Arc`; it is
//! never mutated afterwards.
//!
//! - on read, migrations newer than the stored version are applied in memory
//!   and the record is re-derived
//! - on write, migrations newer than the in-memory version are applied, the
//!   record is re-derived and stamped with the current version

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{StoreError, Tx};
use crate::jobs::registry::RegistryError;

/// A persisted record type.
pub trait Record: Serialize + DeserializeOwned + Send + 'static {
    /// Kind name used as the first half of the storage key.
    const KIND: &'static str;

    /// Version the in-memory value was last normalized to.
    fn data_version(&self) -> u32;

    fn set_data_version(&mut self, version: u32);
}

type MigrateFn<T> = Box<dyn Fn(&mut T) -> anyhow::Result<()> + Send + Sync>;
type DeriveFn<T> = Box<dyn Fn(&mut T, DateTime<Utc>) + Send + Sync>;
type RewriteFn = for<'a> fn(&Tx<'a>, &str) -> Result<(), StoreError>;

/// One step in a kind's upgrade path.
pub struct Migration<T> {
    version: u32,
    apply: MigrateFn<T>,
}

/// Registration for one record type.
pub struct KindSpec<T> {
    version: u32,
    migrations: Vec<Migration<T>>,
    derive: Option<DeriveFn<T>>,
}

impl<T: Record> KindSpec<T> {
    #[must_use]
    pub fn new(version: u32) -> Self {
        Self {
            version,
            migrations: Vec::new(),
            derive: None,
        }
    }

    /// Add the migration that brings a record up to `version`.
    #[must_use]
    pub fn migration(
        mut self,
        version: u32,
        apply: impl Fn(&mut T) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.migrations.push(Migration {
            version,
            apply: Box::new(apply),
        });
        self
    }

    /// Pure recomputation of derived fields, run on every read and write.
    #[must_use]
    pub fn derive(mut self, derive: impl Fn(&mut T, DateTime<Utc>) + Send + Sync + 'static) -> Self {
        self.derive = Some(Box::new(derive));
        self
    }

    fn validate(&self) -> Result<(), RegistryError> {
        let mut last = 0;
        for m in &self.migrations {
            if m.version <= last || m.version > self.version {
                return Err(RegistryError::MigrationOrder {
                    kind: T::KIND,
                    version: m.version,
                    current: self.version,
                });
            }
            last = m.version;
        }
        Ok(())
    }

    fn upgrade(
        &self,
        key: &str,
        record: &mut T,
        from: u32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        for m in self.migrations.iter().filter(|m| m.version > from) {
            (m.apply)(record).map_err(|source| StoreError::Migration {
                kind: T::KIND.to_string(),
                key: key.to_string(),
                version: m.version,
                source,
            })?;
        }
        if let Some(derive) = &self.derive {
            derive(record, now);
        }
        record.set_data_version(self.version);
        Ok(())
    }
}

struct KindEntry {
    version: u32,
    type_id: TypeId,
    type_name: &'static str,
    spec: Box<dyn Any + Send + Sync>,
    rewrite: RewriteFn,
}

/// Registered record kinds.
#[derive(Default)]
pub struct DataKinds {
    kinds: HashMap<&'static str, KindEntry>,
}

impl fmt::Debug for DataKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.list()).finish()
    }
}

impl DataKinds {
    /// Register a record type.
    ///
    /// # Errors
    ///
    /// Fails if the kind is already registered or its migrations are not in
    /// strictly increasing order at or below the declared version.
    pub fn register<T: Record>(&mut self, spec: KindSpec<T>) -> Result<(), RegistryError> {
        if self.kinds.contains_key(T::KIND) {
            return Err(RegistryError::Duplicate {
                what: "record kind",
                name: T::KIND.to_string(),
            });
        }
        spec.validate()?;
        self.kinds.insert(
            T::KIND,
            KindEntry {
                version: spec.version,
                type_id: TypeId::of::<T>(),
                type_name: std::any::type_name::<T>(),
                spec: Box::new(spec),
                rewrite: rewrite_record::<T>,
            },
        );
        Ok(())
    }

    /// Current version of `kind`, if registered.
    #[must_use]
    pub fn version_of(&self, kind: &str) -> Option<u32> {
        self.kinds.get(kind).map(|entry| entry.version)
    }

    /// Registered kinds and their versions, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<(&'static str, u32)> {
        let mut out: Vec<_> = self.kinds.iter().map(|(k, e)| (*k, e.version)).collect();
        out.sort_unstable();
        out
    }

    fn spec<T: Record>(&self) -> Result<&KindSpec<T>, StoreError> {
        let entry = self
            .kinds
            .get(T::KIND)
            .ok_or_else(|| StoreError::UnknownKind(T::KIND.to_string()))?;
        if entry.type_id != TypeId::of::<T>() {
            return Err(StoreError::KindMismatch {
                kind: T::KIND,
                registered: entry.type_name,
                requested: std::any::type_name::<T>(),
            });
        }
        entry
            .spec
            .downcast_ref::<KindSpec<T>>()
            .ok_or_else(|| StoreError::UnknownKind(T::KIND.to_string()))
    }

    /// Bring a freshly decoded record from `stored_version` to current.
    pub(crate) fn upgrade<T: Record>(
        &self,
        key: &str,
        record: &mut T,
        stored_version: u32,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let spec = self.spec::<T>()?;
        spec.upgrade(key, record, stored_version, now)?;
        Ok(spec.version)
    }

    /// Normalize a record about to be written.
    pub(crate) fn normalize<T: Record>(
        &self,
        key: &str,
        record: &mut T,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let from = record.data_version();
        self.upgrade(key, record, from, now)
    }

    /// Read and rewrite one record of `kind` through its typed path.
    pub(crate) fn rewrite(&self, tx: &Tx<'_>, kind: &str, key: &str) -> Result<(), StoreError> {
        let entry = self
            .kinds
            .get(kind)
            .ok_or_else(|| StoreError::UnknownKind(kind.to_string()))?;
        (entry.rewrite)(tx, key)
    }
}

fn rewrite_record<T: Record>(tx: &Tx<'_>, key: &str) -> Result<(), StoreError> {
    let mut record: T = tx.get(key)?;
    tx.put(key, &mut record)
}
