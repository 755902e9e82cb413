//! # Checkpoint Storage
//!
//! The raw-document interface the replication layer drives. Two stores:
//!
//! - `"checkpoints"`: this device's own progress markers, keyed by a
//!   checkpoint id derived from the file's private UUID and the remote URL.
//! - `"peerCheckpoints"`: markers stored *on behalf of* remote peers, with a
//!   tiny revision scheme (`<generation>-cc`) for conflict detection.
//!
//! A peer checkpoint write is get-then-put under one transaction: the
//! client's revision must equal the stored one or the write fails with
//! [`Error::CheckpointConflict`] - the HTTP 409 of this layer.
//!
//! ## Why Strict Revision Parsing?
//!
//! The revision grammar is exactly `<decimal>"-cc"`, and anything else is
//! [`Error::CorruptRevisionData`]. A lenient parser (read digits until
//! something else appears) would happily extract a generation from garbage -
//! or walk past the end of a malformed buffer - and then *write back* a
//! plausible-looking successor, laundering corruption into valid-shaped
//! data. Checkpoints guard replication progress; guessing here can make a
//! peer silently skip changes.
//!
//! ## Why Get-Then-Put in One Transaction?
//!
//! The conflict check reads the stored revision and the put writes the next
//! one. Without the enclosing transaction, two peers could both pass the
//! check against generation N and both write N+1, which is exactly the lost
//! update the revision scheme exists to prevent.

use base64::Engine;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::codec::{self, Value};
use crate::database::{Database, RawDocument};
use crate::error::{Error, Result};
use crate::transaction::Transaction;

/// Store for this device's own checkpoints.
pub const LOCAL_STORE: &str = "checkpoints";
/// Store for checkpoints saved on behalf of peers.
pub const PEER_STORE: &str = "peerCheckpoints";

// =============================================================================
// Revision Metadata
// =============================================================================

/// Parses checkpoint revision metadata, strictly `<decimal>"-cc"`.
fn parse_generation(meta: &[u8]) -> Result<u64> {
    let corrupt = || Error::CorruptRevisionData("malformed checkpoint revision".into());
    let text = std::str::from_utf8(meta).map_err(|_| corrupt())?;
    let digits = text.strip_suffix("-cc").ok_or_else(corrupt)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(corrupt());
    }
    digits.parse().map_err(|_| corrupt())
}

fn format_revision(generation: u64) -> Vec<u8> {
    format!("{generation}-cc").into_bytes()
}

// =============================================================================
// Local Checkpoints
// =============================================================================

/// Reads the local checkpoint body; `None` if never saved.
pub fn get_local(db: &Database, id: &[u8]) -> Result<Option<Vec<u8>>> {
    Ok(db.raw_get(LOCAL_STORE, id)?.map(|doc| doc.body))
}

/// Saves the local checkpoint body in its own transaction.
pub fn set_local(db: &Database, id: &[u8], body: &[u8]) -> Result<()> {
    let t = Transaction::new(db)?;
    db.raw_put(LOCAL_STORE, id, b"", body, &t)?;
    t.commit()?;
    debug!(id = %String::from_utf8_lossy(id), "saved local checkpoint");
    Ok(())
}

/// Derives the default local checkpoint id for a remote:
/// `"cp-" + base64(SHA1(encode([private_uuid, remote_url])))`.
pub fn local_checkpoint_id(db: &Database, remote_url: &str) -> Result<String> {
    let uuid = db.private_uuid()?;
    let fingerprint = Value::Array(vec![
        Value::Blob(uuid.to_vec()),
        Value::Text(remote_url.to_string()),
    ]);
    let digest = Sha1::digest(codec::encode_value_to_vec(&fingerprint));
    Ok(format!(
        "cp-{}",
        base64::engine::general_purpose::STANDARD.encode(digest)
    ))
}

// =============================================================================
// Peer Checkpoints
// =============================================================================

/// Reads a peer checkpoint; `None` if the peer never saved one.
pub fn get_peer(db: &Database, id: &[u8]) -> Result<Option<RawDocument>> {
    db.raw_get(PEER_STORE, id)
}

/// Writes a peer checkpoint, enforcing the revision handshake.
///
/// `client_rev` must equal the stored revision (empty for a first write) or
/// the call fails with [`Error::CheckpointConflict`]. On success the stored
/// generation advances and the new revision is returned.
pub fn set_peer(db: &Database, id: &[u8], client_rev: &[u8], body: &[u8]) -> Result<Vec<u8>> {
    let t = Transaction::new(db)?;

    let existing = db.raw_get(PEER_STORE, id)?;
    let (stored_rev, generation) = match &existing {
        Some(doc) => (doc.meta.as_slice(), t.check(parse_generation(&doc.meta))?),
        None => (&b""[..], 0),
    };

    if client_rev != stored_rev {
        t.abort();
        return Err(Error::CheckpointConflict);
    }

    let new_rev = format_revision(generation + 1);
    db.raw_put(PEER_STORE, id, &new_rev, body, &t)?;
    t.commit()?;
    debug!(
        id = %String::from_utf8_lossy(id),
        rev = %String::from_utf8_lossy(&new_rev),
        "saved peer checkpoint"
    );
    Ok(new_rev)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(dir.path().join("cp.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_parse_generation_strict() {
        assert_eq!(parse_generation(b"1-cc").unwrap(), 1);
        assert_eq!(parse_generation(b"42-cc").unwrap(), 42);

        for bad in [
            &b""[..],
            b"-cc",
            b"cc",
            b"12",
            b"12-CC",
            b"x2-cc",
            b"12-cc ",
            b"1e3-cc",
            b"-1-cc",
        ] {
            assert!(
                matches!(parse_generation(bad), Err(Error::CorruptRevisionData(_))),
                "should reject {:?}",
                String::from_utf8_lossy(bad)
            );
        }
    }

    #[test]
    fn test_local_checkpoint_round_trip() {
        let (_dir, db) = temp_db();
        let id = local_checkpoint_id(&db, "wss://host/db").unwrap();
        assert!(id.starts_with("cp-"));

        assert!(get_local(&db, id.as_bytes()).unwrap().is_none());
        set_local(&db, id.as_bytes(), b"{\"seq\":99}").unwrap();
        assert_eq!(
            get_local(&db, id.as_bytes()).unwrap().as_deref(),
            Some(&b"{\"seq\":99}"[..])
        );
    }

    #[test]
    fn test_checkpoint_id_depends_on_remote_and_file() {
        let (_dir, db) = temp_db();
        let a = local_checkpoint_id(&db, "wss://host/db").unwrap();
        let b = local_checkpoint_id(&db, "wss://host/db").unwrap();
        let c = local_checkpoint_id(&db, "wss://other/db").unwrap();
        assert_eq!(a, b, "derivation is deterministic");
        assert_ne!(a, c, "different remotes get different ids");

        let (_dir2, db2) = temp_db();
        let d = local_checkpoint_id(&db2, "wss://host/db").unwrap();
        assert_ne!(a, d, "different files get different ids");
    }

    #[test]
    fn test_peer_checkpoint_revision_handshake() {
        let (_dir, db) = temp_db();

        // First write: client presents the empty revision.
        let rev1 = set_peer(&db, b"client-1", b"", b"{\"seq\":1}").unwrap();
        assert_eq!(rev1, b"1-cc");

        // Stale write: wrong revision conflicts, state unchanged.
        let err = set_peer(&db, b"client-1", b"", b"{\"seq\":2}").unwrap_err();
        assert!(matches!(err, Error::CheckpointConflict));
        let doc = get_peer(&db, b"client-1").unwrap().unwrap();
        assert_eq!(doc.meta, b"1-cc");
        assert_eq!(doc.body, b"{\"seq\":1}");

        // Correct revision advances the generation.
        let rev2 = set_peer(&db, b"client-1", &rev1, b"{\"seq\":2}").unwrap();
        assert_eq!(rev2, b"2-cc");
    }

    #[test]
    fn test_peer_checkpoint_corrupt_meta_surfaces() {
        let (_dir, db) = temp_db();
        let t = Transaction::new(&db).unwrap();
        db.raw_put(PEER_STORE, b"client-9", b"definitely-not-a-rev", b"{}", &t)
            .unwrap();
        t.commit().unwrap();

        let err = set_peer(&db, b"client-9", b"definitely-not-a-rev", b"{}").unwrap_err();
        assert!(matches!(err, Error::CorruptRevisionData(_)));
    }
}
