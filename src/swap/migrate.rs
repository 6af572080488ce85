//! Versioned revival of persisted swap records
//!
//! Records carry the format version they were written with. Loading
//! applies the upgrade steps one version at a time before
//! deserializing, so every record in storage parses as the current
//! `Swap` regardless of its age. Records written by a *newer* client,
//! and records whose kind tag this build does not know, are skipped
//! rather than failing the whole load.

use crate::error::{ClientError, ClientResult};
use crate::swap::{Swap, SwapKind, SwapRecord};
use serde_json::Value;
use tracing::{debug, warn};

/// Format version written by this build
pub const CURRENT_VERSION: u32 = 2;

/// Revive one stored record into a live swap. `Ok(None)` means the
/// record is not for this build (unknown kind or newer format) and was
/// deliberately left untouched in storage.
pub fn revive(record: &SwapRecord) -> ClientResult<Option<Swap>> {
    let Some(kind) = SwapKind::from_tag(&record.kind) else {
        debug!("Skipping record {} with unknown kind {:?}", record.id, record.kind);
        return Ok(None);
    };

    if record.version > CURRENT_VERSION {
        warn!(
            "Skipping record {} written by a newer client (version {} > {})",
            record.id, record.version, CURRENT_VERSION
        );
        return Ok(None);
    }

    let mut doc = record.doc.clone();
    let mut version = record.version;
    while version < CURRENT_VERSION {
        upgrade(version, &mut doc)?;
        version += 1;
    }

    let mut swap: Swap = serde_json::from_value(doc)?;
    swap.version = CURRENT_VERSION;

    if swap.kind() != kind {
        return Err(ClientError::Internal(format!(
            "record {} kind tag {:?} does not match its document",
            record.id, record.kind
        )));
    }

    Ok(Some(swap))
}

/// One upgrade step, `from → from + 1`, patching the raw document
fn upgrade(from: u32, doc: &mut Value) -> ClientResult<()> {
    match from {
        // v1 predates explicit exact-in tracking and network fee
        // pass-through; old swaps were all exact-in with the network
        // fee folded into the base fee
        1 => {
            let obj = doc
                .as_object_mut()
                .ok_or_else(|| ClientError::Internal("record document is not an object".into()))?;
            obj.entry("exact_in").or_insert(Value::Bool(true));
            if let Some(fees) = obj.get_mut("fees").and_then(Value::as_object_mut) {
                fees.entry("network").or_insert(Value::from(0u64));
            }
            Ok(())
        }
        other => Err(ClientError::Internal(format!(
            "no upgrade step from record version {}",
            other
        ))),
    }
}
