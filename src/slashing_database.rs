//! Transactional SQLite-backed Store and Decision Engine.
//!
//! A single SQLite connection, held exclusively (`locking_mode=EXCLUSIVE`,
//! pool size 1), gives every public method here the "serialized through the
//! Store" property the design calls for: two concurrent callers are
//! strictly ordered by SQLite's own connection lock, so there is never a
//! window in which both observe the absence of a record and both try to
//! insert it.

use crate::bytes::{Hash256, PublicKeyBytes};
use crate::lower_bound::LowerBound;
use crate::signed_attestation::{InvalidAttestation, SignedAttestation};
use crate::signed_block::{InvalidBlock, SignedBlock};
use crate::{Epoch, NotSafe, Safe, Slot, ValidatorId};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::Duration;

type Pool = r2d2::Pool<SqliteConnectionManager>;

/// We set the pool size to 1 for compatibility with `locking_mode=EXCLUSIVE`.
///
/// This has the added bonus of preventing other processes from using the
/// same slashing database concurrently.
pub const POOL_SIZE: u32 = 1;

#[cfg(not(test))]
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
#[cfg(test)]
pub const CONNECTION_TIMEOUT: Duration = Duration::from_millis(100);

/// Number of times a transaction is retried after a `SQLITE_BUSY` before the
/// call fails closed with `NotSafe::StorageUnavailable`.
const MAX_TXN_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct SlashingDatabase {
    conn_pool: Pool,
}

impl SlashingDatabase {
    /// Open an existing database at `path`, or create one if none exists.
    pub fn open_or_create(path: &Path) -> Result<Self, NotSafe> {
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    /// Create a slashing database at `path`.
    ///
    /// Errors if a file already exists there.
    pub fn create(path: &Path) -> Result<Self, NotSafe> {
        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create_new(true)
            .open(path)?;

        Self::set_db_file_permissions(&file)?;
        let conn_pool = Self::open_conn_pool(path)?;
        let conn = conn_pool.get()?;

        conn.execute(
            "CREATE TABLE validators (
                id INTEGER PRIMARY KEY,
                public_key TEXT NOT NULL UNIQUE
            )",
            params![],
        )?;

        // `signing_root` is nullable: NULL is the interchange wildcard, a
        // placeholder recorded in place of a concrete root that can never
        // compare equal to one (see `signed_block`/`signed_attestation`).
        conn.execute(
            "CREATE TABLE signed_blocks (
                validator_id INTEGER NOT NULL,
                slot INTEGER NOT NULL,
                signing_root BLOB,
                FOREIGN KEY(validator_id) REFERENCES validators(id),
                UNIQUE (validator_id, slot)
            )",
            params![],
        )?;

        conn.execute(
            "CREATE TABLE signed_attestations (
                validator_id INTEGER NOT NULL,
                source_epoch INTEGER NOT NULL,
                target_epoch INTEGER NOT NULL,
                signing_root BLOB,
                FOREIGN KEY(validator_id) REFERENCES validators(id),
                UNIQUE (validator_id, target_epoch)
            )",
            params![],
        )?;

        conn.execute(
            "CREATE INDEX idx_signed_attestations_source
             ON signed_attestations (validator_id, source_epoch)",
            params![],
        )?;

        conn.execute(
            "CREATE TABLE metadata (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                genesis_validators_root BLOB
             )",
            params![],
        )?;

        Self::create_low_watermarks_table(&conn)?;

        Ok(Self { conn_pool })
    }

    /// Open an existing `SlashingDatabase` from disk, migrating it forward
    /// to the current schema if it predates the `low_watermarks` table.
    pub fn open(path: &Path) -> Result<Self, NotSafe> {
        let conn_pool = Self::open_conn_pool(path)?;
        let conn = conn_pool.get()?;
        if !Self::low_watermarks_table_exists(&conn)? {
            Self::create_low_watermarks_table(&conn)?;
        }
        Ok(Self { conn_pool })
    }

    fn low_watermarks_table_exists(conn: &Connection) -> Result<bool, NotSafe> {
        let exists = conn
            .query_row(
                "SELECT TRUE FROM sqlite_master WHERE type='table' AND name='low_watermarks'",
                params![],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.unwrap_or(false))
    }

    fn create_low_watermarks_table(conn: &Connection) -> Result<(), NotSafe> {
        conn.execute(
            "CREATE TABLE low_watermarks (
                validator_id INTEGER PRIMARY KEY,
                block_proposal_slot INTEGER,
                attestation_source_epoch INTEGER,
                attestation_target_epoch INTEGER,
                FOREIGN KEY(validator_id) REFERENCES validators(id)
             )",
            params![],
        )?;
        Ok(())
    }

    fn open_conn_pool(path: &Path) -> Result<Pool, NotSafe> {
        let manager = SqliteConnectionManager::file(path)
            .with_flags(rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE)
            .with_init(Self::apply_pragmas);
        let conn_pool = Pool::builder()
            .max_size(POOL_SIZE)
            .connection_timeout(CONNECTION_TIMEOUT)
            .build(manager)
            .map_err(|e| NotSafe::StorageUnavailable(format!("unable to open database: {}", e)))?;
        Ok(conn_pool)
    }

    /// Put the connection into exclusive locking mode, so that every thread
    /// (and every other process) is forced to serialize access to the
    /// database rather than concurrently check and sign slashable data.
    fn apply_pragmas(conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.pragma_update(None, "foreign_keys", &true)?;
        conn.pragma_update(None, "locking_mode", &"EXCLUSIVE")?;
        Ok(())
    }

    #[cfg(unix)]
    fn set_db_file_permissions(file: &File) -> Result<(), NotSafe> {
        use std::os::unix::fs::PermissionsExt;

        let mut perm = file.metadata()?.permissions();
        perm.set_mode(0o600);
        file.set_permissions(perm)?;
        Ok(())
    }

    #[cfg(windows)]
    fn set_db_file_permissions(_file: &File) -> Result<(), NotSafe> {
        // TODO: add support for Windows ACLs
        Ok(())
    }

    /// Run `f` inside a fresh exclusive transaction, retrying a bounded
    /// number of times on a transient `SQLITE_BUSY`, then committing.
    ///
    /// Any error `f` returns aborts the transaction; the store is left
    /// exactly as it was before the call.
    fn with_exclusive_transaction<T>(
        &self,
        mut f: impl FnMut(&Transaction) -> Result<T, NotSafe>,
    ) -> Result<T, NotSafe> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut conn = self.conn_pool.get()?;
            let txn = match conn.transaction_with_behavior(TransactionBehavior::Exclusive) {
                Ok(txn) => txn,
                Err(e) if is_busy(&e) && attempt < MAX_TXN_RETRIES => continue,
                Err(e) => return Err(e.into()),
            };
            match f(&txn) {
                Ok(value) => {
                    txn.commit()?;
                    return Ok(value);
                }
                Err(NotSafe::StorageUnavailable(_)) if attempt < MAX_TXN_RETRIES => continue,
                Err(e) => return Err(e),
            }
        }
    }

    // ---- Validator registry (Store side) ----------------------------------

    /// Register any of `public_keys` not already known, returning the full
    /// `(key, id)` mapping for every key passed in.
    pub fn register_validators(
        &self,
        public_keys: &[PublicKeyBytes],
    ) -> Result<Vec<(PublicKeyBytes, ValidatorId)>, NotSafe> {
        self.with_exclusive_transaction(|txn| {
            public_keys
                .iter()
                .map(|pk| Ok((pk.clone(), self.register_validator_in_txn(txn, pk)?)))
                .collect()
        })
    }

    pub(crate) fn register_validator_in_txn(
        &self,
        txn: &Transaction,
        public_key: &PublicKeyBytes,
    ) -> Result<ValidatorId, NotSafe> {
        if let Some(id) = self.get_validator_id_opt(txn, public_key)? {
            return Ok(id);
        }
        txn.execute(
            "INSERT INTO validators (public_key) VALUES (?1)",
            params![public_key.to_hex_string()],
        )?;
        Ok(txn.last_insert_rowid())
    }

    fn get_validator_id_opt(
        &self,
        txn: &Transaction,
        public_key: &PublicKeyBytes,
    ) -> Result<Option<ValidatorId>, NotSafe> {
        Ok(txn
            .query_row(
                "SELECT id FROM validators WHERE public_key = ?1",
                params![public_key.to_hex_string()],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Load the full validator table, used to prime [`crate::ValidatorRegistry`].
    pub fn load_all_validators(&self) -> Result<Vec<(PublicKeyBytes, ValidatorId)>, NotSafe> {
        let conn = self.conn_pool.get()?;
        let mut stmt = conn.prepare("SELECT public_key, id FROM validators")?;
        let rows = stmt.query_map(params![], |row| {
            let public_key: String = row.get(0)?;
            let id: ValidatorId = row.get(1)?;
            Ok((public_key, id))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (public_key, id) = row?;
            let pk = public_key
                .parse::<PublicKeyBytes>()
                .map_err(|e| NotSafe::StorageUnavailable(e.to_string()))?;
            out.push((pk, id));
        }
        Ok(out)
    }

    /// Validators ordered by ascending id, the order interchange export uses.
    pub(crate) fn validators_by_id(&self) -> Result<Vec<(ValidatorId, PublicKeyBytes)>, NotSafe> {
        let conn = self.conn_pool.get()?;
        let mut stmt = conn.prepare("SELECT id, public_key FROM validators ORDER BY id ASC")?;
        let rows = stmt.query_map(params![], |row| {
            let id: ValidatorId = row.get(0)?;
            let public_key: String = row.get(1)?;
            Ok((id, public_key))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, public_key) = row?;
            let pk = public_key
                .parse::<PublicKeyBytes>()
                .map_err(|e| NotSafe::StorageUnavailable(e.to_string()))?;
            out.push((id, pk));
        }
        Ok(out)
    }

    // ---- Genesis validators root -------------------------------------------

    pub fn get_genesis_validators_root(&self) -> Result<Option<Hash256>, NotSafe> {
        let conn = self.conn_pool.get()?;
        Self::get_genesis_validators_root_conn(&conn)
    }

    fn get_genesis_validators_root_conn(conn: &Connection) -> Result<Option<Hash256>, NotSafe> {
        let root: Option<Vec<u8>> = conn
            .query_row(
                "SELECT genesis_validators_root FROM metadata WHERE id = 0",
                params![],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        root.map(|bytes| {
            Hash256::from_slice(&bytes).map_err(|e| NotSafe::StorageUnavailable(e.to_string()))
        })
        .transpose()
    }

    /// Set the genesis validators root. Fails if it is already set to a
    /// different value (I5: the root is immutable once set).
    pub fn set_genesis_validators_root(&self, root: Hash256) -> Result<(), NotSafe> {
        self.with_exclusive_transaction(|txn| self.set_genesis_validators_root_in_txn(txn, root))
    }

    pub(crate) fn set_genesis_validators_root_in_txn(
        &self,
        txn: &Transaction,
        root: Hash256,
    ) -> Result<(), NotSafe> {
        match self.genesis_validators_root_in_txn(txn)? {
            Some(existing) if existing != root => Err(NotSafe::MalformedRequest(
                "genesis validators root is already set to a different value".to_string(),
            )),
            Some(_) => Ok(()),
            None => {
                txn.execute(
                    "INSERT INTO metadata (id, genesis_validators_root) VALUES (0, ?1)
                     ON CONFLICT(id) DO UPDATE SET genesis_validators_root = excluded.genesis_validators_root",
                    params![root.as_bytes()],
                )?;
                Ok(())
            }
        }
    }

    pub(crate) fn genesis_validators_root_in_txn(
        &self,
        txn: &Transaction,
    ) -> Result<Option<Hash256>, NotSafe> {
        let root: Option<Vec<u8>> = txn
            .query_row(
                "SELECT genesis_validators_root FROM metadata WHERE id = 0",
                params![],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        root.map(|bytes| {
            Hash256::from_slice(&bytes).map_err(|e| NotSafe::StorageUnavailable(e.to_string()))
        })
        .transpose()
    }

    // ---- Low watermarks -----------------------------------------------------

    fn get_low_watermark(
        &self,
        txn: &Transaction,
        validator_id: ValidatorId,
    ) -> Result<Option<LowerBound>, NotSafe> {
        Ok(txn
            .query_row(
                "SELECT block_proposal_slot, attestation_source_epoch, attestation_target_epoch
                 FROM low_watermarks
                 WHERE validator_id = ?1",
                params![validator_id],
                LowerBound::from_row,
            )
            .optional()?)
    }

    pub(crate) fn raise_low_watermark(
        &self,
        txn: &Transaction,
        validator_id: ValidatorId,
        candidate: LowerBound,
    ) -> Result<(), NotSafe> {
        let merged = self
            .get_low_watermark(txn, validator_id)?
            .unwrap_or_default()
            .merge(candidate);
        txn.execute(
            "INSERT INTO low_watermarks (
                validator_id, block_proposal_slot, attestation_source_epoch, attestation_target_epoch
             ) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(validator_id) DO UPDATE SET
                block_proposal_slot = excluded.block_proposal_slot,
                attestation_source_epoch = excluded.attestation_source_epoch,
                attestation_target_epoch = excluded.attestation_target_epoch",
            params![
                validator_id,
                merged.block_proposal_slot,
                merged.attestation_source_epoch,
                merged.attestation_target_epoch
            ],
        )?;
        Ok(())
    }

    // ---- Block proposals ----------------------------------------------------

    fn find_existing_block(
        &self,
        txn: &Transaction,
        validator_id: ValidatorId,
        slot: Slot,
    ) -> Result<Option<SignedBlock>, NotSafe> {
        Ok(txn
            .prepare(
                "SELECT slot, signing_root FROM signed_blocks
                 WHERE validator_id = ?1 AND slot = ?2",
            )?
            .query_row(params![validator_id, slot], |row| {
                SignedBlock::from_row(validator_id, row)
            })
            .optional()?)
    }

    fn insert_block(
        &self,
        txn: &Transaction,
        validator_id: ValidatorId,
        slot: Slot,
        signing_root: Option<Hash256>,
    ) -> Result<(), NotSafe> {
        txn.execute(
            "INSERT INTO signed_blocks (validator_id, slot, signing_root) VALUES (?1, ?2, ?3)",
            params![validator_id, slot, signing_root.as_ref().map(Hash256::as_bytes)],
        )?;
        Ok(())
    }

    /// Check a block proposal for slash safety and, if safe, record it.
    ///
    /// Checking and inserting happen inside a single exclusive transaction
    /// so a concurrent caller can never observe the absence of the record
    /// this call is about to insert.
    pub fn check_and_insert_block_proposal(
        &self,
        validator_id: ValidatorId,
        slot: Slot,
        signing_root: Hash256,
    ) -> Result<Safe, NotSafe> {
        self.with_exclusive_transaction(|txn| {
            let safe = self.check_block_proposal(txn, validator_id, slot, signing_root)?;
            if safe != Safe::SameData {
                self.insert_block(txn, validator_id, slot, Some(signing_root))?;
                self.raise_low_watermark(
                    txn,
                    validator_id,
                    LowerBound {
                        block_proposal_slot: Some(slot),
                        attestation_source_epoch: None,
                        attestation_target_epoch: None,
                    },
                )?;
            }
            Ok(safe)
        })
    }

    /// The same-slot rebroadcast check runs before the low-watermark gate so
    /// that signing the same `(validator, slot)` twice in a row is always
    /// recognized as `Safe::SameData`, never rejected by the watermark this
    /// call itself raised after the first insert.
    fn check_block_proposal(
        &self,
        txn: &Transaction,
        validator_id: ValidatorId,
        slot: Slot,
        signing_root: Hash256,
    ) -> Result<Safe, NotSafe> {
        if let Some(existing) = self.find_existing_block(txn, validator_id, slot)? {
            return if existing.signing_root == Some(signing_root) {
                Ok(Safe::SameData)
            } else {
                Err(NotSafe::InvalidBlock(InvalidBlock::DoubleBlockProposal(
                    existing,
                )))
            };
        }

        if let Some(bound_slot) = self
            .get_low_watermark(txn, validator_id)?
            .and_then(|lb| lb.block_proposal_slot)
        {
            if slot <= bound_slot {
                return Err(NotSafe::InvalidBlock(InvalidBlock::SlotViolatesLowerBound {
                    block_slot: slot,
                    bound_slot,
                }));
            }
        }

        Ok(Safe::Valid)
    }

    // ---- Attestations ---------------------------------------------------------

    fn find_existing_attestation(
        &self,
        txn: &Transaction,
        validator_id: ValidatorId,
        target_epoch: Epoch,
    ) -> Result<Option<SignedAttestation>, NotSafe> {
        Ok(txn
            .prepare(
                "SELECT source_epoch, target_epoch, signing_root FROM signed_attestations
                 WHERE validator_id = ?1 AND target_epoch = ?2",
            )?
            .query_row(params![validator_id, target_epoch], |row| {
                SignedAttestation::from_row(validator_id, row)
            })
            .optional()?)
    }

    fn find_surrounding_attestation(
        &self,
        txn: &Transaction,
        validator_id: ValidatorId,
        source: Epoch,
        target: Epoch,
    ) -> Result<Option<SignedAttestation>, NotSafe> {
        Ok(txn
            .prepare(
                "SELECT source_epoch, target_epoch, signing_root FROM signed_attestations
                 WHERE validator_id = ?1 AND source_epoch < ?2 AND target_epoch > ?3
                 ORDER BY target_epoch DESC
                 LIMIT 1",
            )?
            .query_row(params![validator_id, source, target], |row| {
                SignedAttestation::from_row(validator_id, row)
            })
            .optional()?)
    }

    fn find_surrounded_attestation(
        &self,
        txn: &Transaction,
        validator_id: ValidatorId,
        source: Epoch,
        target: Epoch,
    ) -> Result<Option<SignedAttestation>, NotSafe> {
        Ok(txn
            .prepare(
                "SELECT source_epoch, target_epoch, signing_root FROM signed_attestations
                 WHERE validator_id = ?1 AND source_epoch > ?2 AND target_epoch < ?3
                 ORDER BY target_epoch DESC
                 LIMIT 1",
            )?
            .query_row(params![validator_id, source, target], |row| {
                SignedAttestation::from_row(validator_id, row)
            })
            .optional()?)
    }

    fn insert_attestation(
        &self,
        txn: &Transaction,
        validator_id: ValidatorId,
        source_epoch: Epoch,
        target_epoch: Epoch,
        signing_root: Option<Hash256>,
    ) -> Result<(), NotSafe> {
        txn.execute(
            "INSERT INTO signed_attestations (validator_id, source_epoch, target_epoch, signing_root)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                validator_id,
                source_epoch,
                target_epoch,
                signing_root.as_ref().map(Hash256::as_bytes)
            ],
        )?;
        Ok(())
    }

    /// Check an attestation for slash safety and, if safe, record it.
    ///
    /// The same-target check runs before either surround check so that a
    /// benign rebroadcast is never mistaken for a surround; the relative
    /// order of the two surround checks does not matter.
    pub fn check_and_insert_attestation(
        &self,
        validator_id: ValidatorId,
        source_epoch: Epoch,
        target_epoch: Epoch,
        signing_root: Hash256,
    ) -> Result<Safe, NotSafe> {
        if source_epoch > target_epoch {
            return Err(NotSafe::InvalidAttestation(
                InvalidAttestation::SourceExceedsTarget {
                    source: source_epoch,
                    target: target_epoch,
                },
            ));
        }

        self.with_exclusive_transaction(|txn| {
            let safe =
                self.check_attestation(txn, validator_id, source_epoch, target_epoch, signing_root)?;
            if safe != Safe::SameData {
                self.insert_attestation(
                    txn,
                    validator_id,
                    source_epoch,
                    target_epoch,
                    Some(signing_root),
                )?;
                self.raise_low_watermark(
                    txn,
                    validator_id,
                    LowerBound {
                        block_proposal_slot: None,
                        attestation_source_epoch: Some(source_epoch),
                        attestation_target_epoch: Some(target_epoch),
                    },
                )?;
            }
            Ok(safe)
        })
    }

    /// The same-target rebroadcast check and both surround checks run before
    /// the low-watermark gate, so that neither an identical rebroadcast nor
    /// the documented surround-detection ordering can be preempted by a
    /// watermark this call itself raised after an earlier insert.
    fn check_attestation(
        &self,
        txn: &Transaction,
        validator_id: ValidatorId,
        source_epoch: Epoch,
        target_epoch: Epoch,
        signing_root: Hash256,
    ) -> Result<Safe, NotSafe> {
        if let Some(existing) = self.find_existing_attestation(txn, validator_id, target_epoch)? {
            return if existing.signing_root == Some(signing_root) {
                Ok(Safe::SameData)
            } else {
                Err(NotSafe::InvalidAttestation(InvalidAttestation::DoubleVote(
                    existing,
                )))
            };
        }

        if let Some(prev) =
            self.find_surrounding_attestation(txn, validator_id, source_epoch, target_epoch)?
        {
            return Err(NotSafe::InvalidAttestation(
                InvalidAttestation::PrevSurroundsNew { prev },
            ));
        }

        if let Some(prev) =
            self.find_surrounded_attestation(txn, validator_id, source_epoch, target_epoch)?
        {
            return Err(NotSafe::InvalidAttestation(
                InvalidAttestation::NewSurroundsPrev { prev },
            ));
        }

        if let Some(lower_bound) = self.get_low_watermark(txn, validator_id)? {
            if let Some(source_bound) = lower_bound.attestation_source_epoch {
                if source_epoch < source_bound {
                    return Err(NotSafe::InvalidAttestation(
                        InvalidAttestation::SourceLessThanLowerBound {
                            source_epoch,
                            bound_epoch: source_bound,
                        },
                    ));
                }
            }
            if let Some(target_bound) = lower_bound.attestation_target_epoch {
                if target_epoch <= target_bound {
                    return Err(NotSafe::InvalidAttestation(
                        InvalidAttestation::TargetLessThanOrEqLowerBound {
                            target_epoch,
                            bound_epoch: target_bound,
                        },
                    ));
                }
            }
        }

        Ok(Safe::Valid)
    }

    // ---- Counts (used by tests and by the façade for diagnostics) ----------

    pub fn num_validator_rows(&self) -> Result<u32, NotSafe> {
        let conn = self.conn_pool.get()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM validators", params![], |row| row.get(0))?)
    }

    pub fn num_signed_block_rows(&self) -> Result<u32, NotSafe> {
        let conn = self.conn_pool.get()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM signed_blocks", params![], |row| {
            row.get(0)
        })?)
    }

    pub fn num_signed_attestation_rows(&self) -> Result<u32, NotSafe> {
        let conn = self.conn_pool.get()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM signed_attestations",
            params![],
            |row| row.get(0),
        )?)
    }

    /// Exposed for the interchange codec, which needs to drive its own
    /// long-lived, streaming transaction rather than the short per-call
    /// ones the engine methods above use.
    pub(crate) fn pooled_connection(
        &self,
    ) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, NotSafe> {
        Ok(self.conn_pool.get()?)
    }

    /// `signing_root` is `None` for a wildcard interchange entry. A wildcard
    /// never matches an existing concrete root, so it can only be imported
    /// against an empty slot, never treated as a rebroadcast of one.
    pub(crate) fn insert_block_for_import(
        &self,
        txn: &Transaction,
        validator_id: ValidatorId,
        slot: Slot,
        signing_root: Option<Hash256>,
    ) -> Result<(), NotSafe> {
        match self.find_existing_block(txn, validator_id, slot)? {
            Some(existing) if existing.signing_root == signing_root && signing_root.is_some() => {
                Ok(())
            }
            Some(existing) => Err(NotSafe::InvalidBlock(InvalidBlock::DoubleBlockProposal(
                existing,
            ))),
            None => self.insert_block(txn, validator_id, slot, signing_root),
        }
    }

    /// `signing_root` is `None` for a wildcard interchange entry, with the
    /// same never-matches-a-concrete-root rule as `insert_block_for_import`.
    pub(crate) fn insert_attestation_for_import(
        &self,
        txn: &Transaction,
        validator_id: ValidatorId,
        source_epoch: Epoch,
        target_epoch: Epoch,
        signing_root: Option<Hash256>,
    ) -> Result<(), NotSafe> {
        if let Some(existing) = self.find_existing_attestation(txn, validator_id, target_epoch)? {
            return if existing.signing_root == signing_root && signing_root.is_some() {
                Ok(())
            } else {
                Err(NotSafe::InvalidAttestation(InvalidAttestation::DoubleVote(
                    existing,
                )))
            };
        }
        if let Some(prev) =
            self.find_surrounding_attestation(txn, validator_id, source_epoch, target_epoch)?
        {
            return Err(NotSafe::InvalidAttestation(
                InvalidAttestation::PrevSurroundsNew { prev },
            ));
        }
        if let Some(prev) =
            self.find_surrounded_attestation(txn, validator_id, source_epoch, target_epoch)?
        {
            return Err(NotSafe::InvalidAttestation(
                InvalidAttestation::NewSurroundsPrev { prev },
            ));
        }
        self.insert_attestation(txn, validator_id, source_epoch, target_epoch, signing_root)
    }

    pub(crate) fn blocks_for_validator(
        &self,
        conn: &Connection,
        validator_id: ValidatorId,
    ) -> Result<Vec<SignedBlock>, NotSafe> {
        let mut stmt = conn.prepare(
            "SELECT slot, signing_root FROM signed_blocks
             WHERE validator_id = ?1 ORDER BY slot ASC",
        )?;
        let rows = stmt.query_map(params![validator_id], |row| {
            SignedBlock::from_row(validator_id, row)
        })?;
        rows.map(|r| r.map_err(NotSafe::from)).collect()
    }

    pub(crate) fn attestations_for_validator(
        &self,
        conn: &Connection,
        validator_id: ValidatorId,
    ) -> Result<Vec<SignedAttestation>, NotSafe> {
        let mut stmt = conn.prepare(
            "SELECT source_epoch, target_epoch, signing_root FROM signed_attestations
             WHERE validator_id = ?1 ORDER BY target_epoch ASC, source_epoch ASC",
        )?;
        let rows = stmt.query_map(params![validator_id], |row| {
            SignedAttestation::from_row(validator_id, row)
        })?;
        rows.map(|r| r.map_err(NotSafe::from)).collect()
    }
}

fn is_busy(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::DatabaseBusy
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::PublicKeyBytes;
    use tempfile::tempdir;

    fn pk(byte: u8) -> PublicKeyBytes {
        PublicKeyBytes([byte; 48])
    }

    #[test]
    fn open_non_existent_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("db.sqlite");
        assert!(SlashingDatabase::open(&file).is_err());
    }

    // Due to the exclusive locking, trying to use an already open database should error.
    #[test]
    fn double_open_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("db.sqlite");
        let _db1 = SlashingDatabase::create(&file).unwrap();
        SlashingDatabase::open(&file).unwrap_err();
    }

    #[test]
    fn double_create_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("db.sqlite");
        let _db1 = SlashingDatabase::create(&file).unwrap();
        drop(_db1);
        SlashingDatabase::create(&file).unwrap_err();
    }

    #[test]
    fn connection_settings_applied() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("db.sqlite");

        let check = |db: &SlashingDatabase| {
            assert_eq!(db.conn_pool.max_size(), POOL_SIZE);
            assert_eq!(db.conn_pool.connection_timeout(), CONNECTION_TIMEOUT);
            let conn = db.conn_pool.get().unwrap();
            assert!(conn
                .pragma_query_value(None, "foreign_keys", |row| { row.get::<_, bool>(0) })
                .unwrap());
            assert_eq!(
                conn.pragma_query_value(None, "locking_mode", |row| { row.get::<_, String>(0) })
                    .unwrap()
                    .to_uppercase(),
                "EXCLUSIVE"
            );
        };

        let db1 = SlashingDatabase::create(&file).unwrap();
        check(&db1);
        drop(db1);
        let db2 = SlashingDatabase::open(&file).unwrap();
        check(&db2);
    }

    #[test]
    fn double_block_proposal_is_refused() {
        let dir = tempdir().unwrap();
        let db = SlashingDatabase::create(&dir.path().join("db.sqlite")).unwrap();
        let (_, id) = db.register_validators(&[pk(1)]).unwrap().remove(0);

        assert_eq!(
            db.check_and_insert_block_proposal(id, 10, Hash256([0xaa; 32]))
                .unwrap(),
            Safe::Valid
        );
        assert_eq!(
            db.check_and_insert_block_proposal(id, 10, Hash256([0xaa; 32]))
                .unwrap(),
            Safe::SameData
        );
        assert!(matches!(
            db.check_and_insert_block_proposal(id, 10, Hash256([0xbb; 32])),
            Err(NotSafe::InvalidBlock(InvalidBlock::DoubleBlockProposal(_)))
        ));
    }

    #[test]
    fn surround_votes_are_refused_both_directions() {
        let dir = tempdir().unwrap();
        let db = SlashingDatabase::create(&dir.path().join("db.sqlite")).unwrap();
        let (_, id) = db.register_validators(&[pk(1)]).unwrap().remove(0);

        db.check_and_insert_attestation(id, 4, 8, Hash256([0xaa; 32]))
            .unwrap();

        // (3, 9) is wider than the recorded (4, 8): the new vote surrounds it.
        assert!(matches!(
            db.check_and_insert_attestation(id, 3, 9, Hash256([0xbb; 32])),
            Err(NotSafe::InvalidAttestation(
                InvalidAttestation::NewSurroundsPrev { .. }
            ))
        ));

        // (5, 7) is nested inside the recorded (4, 8): the recorded vote surrounds it.
        assert!(matches!(
            db.check_and_insert_attestation(id, 5, 7, Hash256([0xcc; 32])),
            Err(NotSafe::InvalidAttestation(
                InvalidAttestation::PrevSurroundsNew { .. }
            ))
        ));

        assert_eq!(
            db.check_and_insert_attestation(id, 9, 10, Hash256([0xdd; 32]))
                .unwrap(),
            Safe::Valid
        );
    }

    #[test]
    fn malformed_attestation_source_after_target_is_refused() {
        let dir = tempdir().unwrap();
        let db = SlashingDatabase::create(&dir.path().join("db.sqlite")).unwrap();
        let (_, id) = db.register_validators(&[pk(1)]).unwrap().remove(0);

        assert!(matches!(
            db.check_and_insert_attestation(id, 10, 5, Hash256([0; 32])),
            Err(NotSafe::InvalidAttestation(
                InvalidAttestation::SourceExceedsTarget { .. }
            ))
        ));
        assert_eq!(db.num_signed_attestation_rows().unwrap(), 0);
    }

    #[test]
    fn genesis_root_is_set_once() {
        let dir = tempdir().unwrap();
        let db = SlashingDatabase::create(&dir.path().join("db.sqlite")).unwrap();
        assert!(db.get_genesis_validators_root().unwrap().is_none());

        let root = Hash256([7; 32]);
        db.set_genesis_validators_root(root).unwrap();
        assert_eq!(db.get_genesis_validators_root().unwrap(), Some(root));

        // Setting the same value again is a no-op.
        db.set_genesis_validators_root(root).unwrap();

        // Setting a different value fails.
        assert!(db.set_genesis_validators_root(Hash256([8; 32])).is_err());
    }

    #[test]
    fn low_watermark_rejects_stale_slot_after_raise() {
        let dir = tempdir().unwrap();
        let db = SlashingDatabase::create(&dir.path().join("db.sqlite")).unwrap();
        let (_, id) = db.register_validators(&[pk(1)]).unwrap().remove(0);

        db.with_exclusive_transaction(|txn| {
            db.raise_low_watermark(
                txn,
                id,
                LowerBound {
                    block_proposal_slot: Some(100),
                    attestation_source_epoch: Some(10),
                    attestation_target_epoch: Some(20),
                },
            )
        })
        .unwrap();

        assert!(matches!(
            db.check_and_insert_block_proposal(id, 50, Hash256([1; 32])),
            Err(NotSafe::InvalidBlock(InvalidBlock::SlotViolatesLowerBound { .. }))
        ));
        assert!(matches!(
            db.check_and_insert_attestation(id, 5, 15, Hash256([1; 32])),
            Err(NotSafe::InvalidAttestation(
                InvalidAttestation::SourceLessThanLowerBound { .. }
            ))
        ));
        assert!(matches!(
            db.check_and_insert_attestation(id, 10, 20, Hash256([1; 32])),
            Err(NotSafe::InvalidAttestation(
                InvalidAttestation::TargetLessThanOrEqLowerBound { .. }
            ))
        ));
        assert_eq!(
            db.check_and_insert_block_proposal(id, 101, Hash256([1; 32]))
                .unwrap(),
            Safe::Valid
        );
    }
}
