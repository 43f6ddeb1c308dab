//! Integration tests exercising `SlashingProtection` as an external signing
//! service would: through the public façade only, never `SlashingDatabase`
//! directly.

use slashing_protection::{Hash256, PublicKeyBytes, SlashingDatabase, SlashingProtection};
use slog::{o, Drain};
use tempfile::tempdir;

fn test_logger() -> slog::Logger {
    let decorator = slog_term::PlainDecorator::new(std::io::sink());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, o!())
}

fn pk(byte: u8) -> PublicKeyBytes {
    PublicKeyBytes([byte; 48])
}

fn open(dir: &tempfile::TempDir) -> SlashingProtection {
    let db = SlashingDatabase::create(&dir.path().join("db.sqlite")).unwrap();
    SlashingProtection::new(db, test_logger()).unwrap()
}

// S1: a freshly registered validator may sign its first block.
#[test]
fn s1_first_block_is_permitted() {
    let dir = tempdir().unwrap();
    let protection = open(&dir);
    let key = pk(1);
    protection.register_validators(&[key.clone()]).unwrap();

    assert!(protection.may_sign_block(&key, 100, Hash256([1; 32])));
}

// S2: re-signing the exact same block is permitted (idempotent rebroadcast).
#[test]
fn s2_identical_rebroadcast_is_permitted() {
    let dir = tempdir().unwrap();
    let protection = open(&dir);
    let key = pk(1);
    protection.register_validators(&[key.clone()]).unwrap();

    let root = Hash256([9; 32]);
    assert!(protection.may_sign_block(&key, 100, root));
    assert!(protection.may_sign_block(&key, 100, root));
}

// S3: a double block proposal at the same slot with a different root is refused.
#[test]
fn s3_double_block_proposal_is_refused() {
    let dir = tempdir().unwrap();
    let protection = open(&dir);
    let key = pk(1);
    protection.register_validators(&[key.clone()]).unwrap();

    assert!(protection.may_sign_block(&key, 100, Hash256([1; 32])));
    assert!(!protection.may_sign_block(&key, 100, Hash256([2; 32])));
}

// S4: a surrounding attestation is refused in both directions.
#[test]
fn s4_surround_votes_refused_both_directions() {
    let dir = tempdir().unwrap();
    let protection = open(&dir);
    let key = pk(1);
    protection.register_validators(&[key.clone()]).unwrap();

    assert!(protection.may_sign_attestation(&key, 4, 8, Hash256([1; 32])));
    assert!(!protection.may_sign_attestation(&key, 3, 9, Hash256([2; 32])));
    assert!(!protection.may_sign_attestation(&key, 5, 7, Hash256([3; 32])));
}

// S5: an unregistered validator is refused regardless of the request's contents.
#[test]
fn s5_unregistered_validator_refused() {
    let dir = tempdir().unwrap();
    let protection = open(&dir);
    assert!(!protection.may_sign_block(&pk(9), 1, Hash256::zero()));
    assert!(!protection.may_sign_attestation(&pk(9), 0, 1, Hash256::zero()));
}

// S6: equal source/target epoch attestations are accepted (Open Question resolution).
#[test]
fn s6_equal_source_and_target_epoch_is_accepted() {
    let dir = tempdir().unwrap();
    let protection = open(&dir);
    let key = pk(1);
    protection.register_validators(&[key.clone()]).unwrap();

    assert!(protection.may_sign_attestation(&key, 5, 5, Hash256([1; 32])));
}

// P1: registration is idempotent; re-registering a key does not reset its history.
#[test]
fn p1_reregistration_does_not_reset_history() {
    let dir = tempdir().unwrap();
    let protection = open(&dir);
    let key = pk(1);
    protection.register_validators(&[key.clone()]).unwrap();
    assert!(protection.may_sign_block(&key, 100, Hash256([1; 32])));

    protection.register_validators(&[key.clone()]).unwrap();
    assert!(!protection.may_sign_block(&key, 100, Hash256([2; 32])));
}

// P2: import then export round-trips the same validator set and history.
#[test]
fn p2_import_export_round_trip() {
    let dir = tempdir().unwrap();
    let protection = open(&dir);

    let root = format!("0x{}", "ab".repeat(32));
    let pubkey = format!("0x{}", "cd".repeat(48));
    let doc = format!(
        r#"{{
            "metadata": {{
                "interchange_format_version": "5",
                "genesis_validators_root": "{root}"
            }},
            "data": [
                {{
                    "pubkey": "{pubkey}",
                    "signed_blocks": [{{ "slot": "5", "signing_root": "0x{hex}" }}],
                    "signed_attestations": [
                        {{ "source_epoch": "1", "target_epoch": "2", "signing_root": "0x{hex}" }}
                    ]
                }}
            ]
        }}"#,
        root = root,
        pubkey = pubkey,
        hex = "11".repeat(32),
    );

    protection.import(doc.as_bytes()).unwrap();

    let mut out = Vec::new();
    protection.export(&mut out).unwrap();
    let exported = String::from_utf8(out).unwrap();
    assert!(exported.contains(&pubkey));
    assert!(exported.contains("\"slot\":\"5\""));
}

// P3: a failed sign request never leaves a new record behind.
#[test]
fn p3_refused_request_leaves_no_trace() {
    let dir = tempdir().unwrap();
    let protection = open(&dir);
    let key = pk(1);
    protection.register_validators(&[key.clone()]).unwrap();

    assert!(protection.may_sign_block(&key, 100, Hash256([1; 32])));
    assert!(!protection.may_sign_block(&key, 100, Hash256([2; 32])));
    // The slashable attempt did not overwrite the original record: signing
    // the original root again is still recognized as the same data.
    assert!(protection.may_sign_block(&key, 100, Hash256([1; 32])));
}

// P4: a low watermark raised by import rejects a stale request afterwards.
#[test]
fn p4_import_raises_watermark_that_blocks_later_stale_requests() {
    let dir = tempdir().unwrap();
    let protection = open(&dir);

    let root = format!("0x{}", "ef".repeat(32));
    let pubkey = format!("0x{}", "22".repeat(48));
    let doc = format!(
        r#"{{
            "metadata": {{
                "interchange_format_version": "5",
                "genesis_validators_root": "{root}"
            }},
            "data": [
                {{
                    "pubkey": "{pubkey}",
                    "signed_blocks": [{{ "slot": "1000", "signing_root": "0x{hex}" }}],
                    "signed_attestations": []
                }}
            ]
        }}"#,
        root = root,
        pubkey = pubkey,
        hex = "33".repeat(32),
    );
    protection.import(doc.as_bytes()).unwrap();

    let key: PublicKeyBytes = pubkey.parse().unwrap();
    assert!(!protection.may_sign_block(&key, 500, Hash256([1; 32])));
    assert!(protection.may_sign_block(&key, 1001, Hash256([1; 32])));
}

// P5: a document at an unsupported interchange version is refused wholesale.
#[test]
fn p5_unsupported_version_refuses_whole_import() {
    let dir = tempdir().unwrap();
    let protection = open(&dir);

    let doc = format!(
        r#"{{
            "metadata": {{
                "interchange_format_version": "3",
                "genesis_validators_root": "0x{}"
            }},
            "data": []
        }}"#,
        "00".repeat(32),
    );
    assert!(protection.import(doc.as_bytes()).is_err());
}

// P6: exporting with no genesis root set fails rather than emitting a
// document with a fabricated one.
#[test]
fn p6_export_before_genesis_root_is_set_fails() {
    let dir = tempdir().unwrap();
    let protection = open(&dir);
    let mut out = Vec::new();
    assert!(protection.export(&mut out).is_err());
}
