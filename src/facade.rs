//! The crate's single intended entry point for an external signing service.
//!
//! `SlashingProtection` bundles the Store, the Registry, and a `Logger`
//! passed in by the caller (the engine never constructs its own, matching
//! the dependency-injection style `http_api::Config`/`Logger` plumbing uses
//! throughout the teacher codebase). Every sign-path call collapses to a
//! bare `bool`: `false` on any error at all, after a structured WARN record
//! is emitted, so a caller can never mistake "we couldn't tell" for "it's
//! safe".

use crate::bytes::{Hash256, PublicKeyBytes};
use crate::config::Config;
use crate::interchange_codec::{self, InterchangeError};
use crate::registry::ValidatorRegistry;
use crate::slashing_database::SlashingDatabase;
use crate::{Epoch, NotSafe, Slot};
use slog::{o, warn, Logger};
use std::io::{Read, Write};
use std::path::Path;

pub struct SlashingProtection {
    db: SlashingDatabase,
    registry: ValidatorRegistry,
    log: Logger,
}

impl SlashingProtection {
    /// Open (or create) the store at `config.db_path()` and load the
    /// registry cache from it.
    pub fn open(config: &Config, log: Logger) -> Result<Self, NotSafe> {
        let log = log.new(o!("service" => "slashing_protection"));
        let db = SlashingDatabase::open_or_create(Path::new(config.db_path()))?;
        let registry = ValidatorRegistry::new();
        registry.load(&db)?;
        Ok(Self { db, registry, log })
    }

    /// Wrap an already-open store, e.g. one built directly in a test.
    pub fn new(db: SlashingDatabase, log: Logger) -> Result<Self, NotSafe> {
        let registry = ValidatorRegistry::new();
        registry.load(&db)?;
        Ok(Self { db, registry, log })
    }

    pub fn set_genesis_validators_root(&self, root: Hash256) -> Result<(), NotSafe> {
        self.db.set_genesis_validators_root(root)
    }

    pub fn get_genesis_validators_root(&self) -> Result<Option<Hash256>, NotSafe> {
        self.db.get_genesis_validators_root()
    }

    /// Register validators with the store so they become eligible for
    /// `may_sign_block`/`may_sign_attestation`. Idempotent.
    pub fn register_validators(&self, public_keys: &[PublicKeyBytes]) -> Result<(), NotSafe> {
        self.registry.register(&self.db, public_keys)
    }

    /// Decide whether signing a block proposal for `public_key` at `slot`
    /// with `signing_root` is safe, recording the decision if so.
    ///
    /// Every failure mode — unregistered key, a genuine slashing conflict,
    /// or a storage fault — collapses to `false`; the reason only reaches
    /// the log.
    pub fn may_sign_block(
        &self,
        public_key: &PublicKeyBytes,
        slot: Slot,
        signing_root: Hash256,
    ) -> bool {
        match self.try_sign_block(public_key, slot, signing_root) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    self.log,
                    "refusing to sign block proposal";
                    "public_key" => %public_key,
                    "slot" => slot,
                    "reason" => %e,
                );
                false
            }
        }
    }

    fn try_sign_block(
        &self,
        public_key: &PublicKeyBytes,
        slot: Slot,
        signing_root: Hash256,
    ) -> Result<(), NotSafe> {
        let validator_id = self.registry.require(public_key)?;
        self.db
            .check_and_insert_block_proposal(validator_id, slot, signing_root)?;
        Ok(())
    }

    /// Decide whether signing an attestation for `public_key` spanning
    /// `(source_epoch, target_epoch)` with `signing_root` is safe, recording
    /// the decision if so.
    pub fn may_sign_attestation(
        &self,
        public_key: &PublicKeyBytes,
        source_epoch: Epoch,
        target_epoch: Epoch,
        signing_root: Hash256,
    ) -> bool {
        match self.try_sign_attestation(public_key, source_epoch, target_epoch, signing_root) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    self.log,
                    "refusing to sign attestation";
                    "public_key" => %public_key,
                    "source_epoch" => source_epoch,
                    "target_epoch" => target_epoch,
                    "reason" => %e,
                );
                false
            }
        }
    }

    fn try_sign_attestation(
        &self,
        public_key: &PublicKeyBytes,
        source_epoch: Epoch,
        target_epoch: Epoch,
        signing_root: Hash256,
    ) -> Result<(), NotSafe> {
        let validator_id = self.registry.require(public_key)?;
        self.db.check_and_insert_attestation(
            validator_id,
            source_epoch,
            target_epoch,
            signing_root,
        )?;
        Ok(())
    }

    /// Import an EIP-3076 interchange document, registering any validators
    /// it names and raising their low-watermarks. All-or-nothing: a single
    /// malformed or conflicting record aborts the whole import.
    pub fn import(&self, reader: impl Read) -> Result<(), InterchangeError> {
        let result = interchange_codec::import(&self.db, &self.registry, reader);
        if let Err(e) = &result {
            warn!(self.log, "interchange import failed"; "reason" => %e);
        }
        result
    }

    /// Export the store's full contents as an EIP-3076 interchange document.
    pub fn export(&self, writer: impl Write) -> Result<(), InterchangeError> {
        let root = self
            .db
            .get_genesis_validators_root()?
            .ok_or(InterchangeError::MissingGenesisRoot)?;
        interchange_codec::export(&self.db, root, writer)
    }
}
