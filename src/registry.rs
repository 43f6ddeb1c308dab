//! In-memory validator public-key -> id cache.
//!
//! The mapping is append-only: once a key is registered it keeps its id for
//! the lifetime of the store, so readers never need to coordinate with
//! writers. Registration itself still goes through the store (the Store's
//! `UNIQUE` constraint on `public_key` is the source of truth); this cache
//! only spares every sign request a round trip to look the id up again.

use crate::{NotSafe, PublicKeyBytes, SlashingDatabase, ValidatorId};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct ValidatorRegistry {
    ids: RwLock<HashMap<PublicKeyBytes, ValidatorId>>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate the cache from the store's `validators` table.
    pub fn load(&self, db: &SlashingDatabase) -> Result<(), NotSafe> {
        let all = db.load_all_validators()?;
        let mut ids = self.ids.write();
        ids.extend(all);
        Ok(())
    }

    /// Register any keys not already known, locally or in the store.
    ///
    /// Idempotent: keys already present (in the cache or the store) keep
    /// their existing id and are not re-inserted.
    pub fn register(
        &self,
        db: &SlashingDatabase,
        public_keys: &[PublicKeyBytes],
    ) -> Result<(), NotSafe> {
        let unknown: Vec<PublicKeyBytes> = {
            let ids = self.ids.read();
            public_keys
                .iter()
                .filter(|pk| !ids.contains_key(*pk))
                .cloned()
                .collect()
        };
        if unknown.is_empty() {
            return Ok(());
        }
        let assigned = db.register_validators(&unknown)?;
        let mut ids = self.ids.write();
        for (pk, id) in assigned {
            ids.entry(pk).or_insert(id);
        }
        Ok(())
    }

    /// Resolve a public key to its store-internal id.
    pub fn get(&self, public_key: &PublicKeyBytes) -> Option<ValidatorId> {
        self.ids.read().get(public_key).copied()
    }

    /// Resolve a public key, failing with `UnregisteredValidator` if absent.
    ///
    /// Registration policy belongs to the caller: the registry never
    /// auto-registers an unknown key on a sign-path lookup.
    pub fn require(&self, public_key: &PublicKeyBytes) -> Result<ValidatorId, NotSafe> {
        self.get(public_key)
            .ok_or_else(|| NotSafe::UnregisteredValidator(public_key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn register_is_idempotent() {
        let dir = tempdir().unwrap();
        let db = SlashingDatabase::create(&dir.path().join("db.sqlite")).unwrap();
        let registry = ValidatorRegistry::new();

        let pk = PublicKeyBytes([1; 48]);
        registry.register(&db, &[pk.clone()]).unwrap();
        let id_first = registry.get(&pk).unwrap();

        registry.register(&db, &[pk.clone()]).unwrap();
        let id_second = registry.get(&pk).unwrap();

        assert_eq!(id_first, id_second);
    }

    #[test]
    fn unregistered_key_is_rejected() {
        let registry = ValidatorRegistry::new();
        let pk = PublicKeyBytes([9; 48]);
        assert!(matches!(
            registry.require(&pk),
            Err(NotSafe::UnregisteredValidator(_))
        ));
    }
}
