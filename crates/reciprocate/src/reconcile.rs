//! Reconciliation of snapshots against recorded non-reciprocation.
//!
//! [`verify`] adds a record for every roster member (other than the owner)
//! missing from a post's snapshot. [`cleanup`] removes records whose
//! participant now appears in the snapshot. Verify only inserts, cleanup only
//! deletes, and both are safe to repeat.

use std::collections::BTreeSet;

use tracing::debug;

use crate::store::VerificationStore;
use crate::types::{normalize_username, InteractionSnapshot, NewVerification, Roster, VerificationRecord};

/// `(roster − {owner}) − interacted`, normalized and sorted.
pub fn missing_participants(
    snapshot: &InteractionSnapshot,
    owner: &str,
    roster: &Roster,
) -> BTreeSet<String> {
    let owner = normalize_username(owner);
    let interacted = snapshot.interacted();

    roster
        .iter()
        .filter(|member| *member != owner)
        .filter(|member| !interacted.contains(member))
        .map(str::to_string)
        .collect()
}

/// Record every participant who has not reciprocated `owner`'s post.
///
/// Returns only the records created by this call; participants already on
/// record for `link` are skipped.
pub async fn verify(
    store: &dyn VerificationStore,
    snapshot: &InteractionSnapshot,
    link: &str,
    owner: &str,
    roster: &Roster,
) -> anyhow::Result<Vec<VerificationRecord>> {
    let owner = normalize_username(owner);
    let mut added = Vec::new();

    for participant in missing_participants(snapshot, &owner, roster) {
        let record = NewVerification {
            participant: participant.clone(),
            link: link.to_string(),
            link_owner: owner.clone(),
        };

        match store.insert_if_absent(record).await? {
            Some(stored) => {
                debug!(participant = %participant, link, "recorded non-reciprocation");
                added.push(stored);
            }
            None => debug!(participant = %participant, link, "already on record"),
        }
    }

    Ok(added)
}

/// Delete the records in `existing` whose participant has since interacted.
///
/// Records for participants still absent from `snapshot` are left alone.
pub async fn cleanup(
    store: &dyn VerificationStore,
    snapshot: &InteractionSnapshot,
    existing: &[VerificationRecord],
) -> anyhow::Result<Vec<VerificationRecord>> {
    let mut removed = Vec::new();

    for record in existing {
        if !snapshot.has_interacted(&record.participant) {
            continue;
        }

        if store.delete_record(record.id).await? {
            debug!(participant = %record.participant, link = %record.link, "reciprocated, record cleared");
            removed.push(record.clone());
        }
    }

    Ok(removed)
}
