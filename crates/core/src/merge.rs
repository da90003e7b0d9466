use std::collections::{BTreeMap, BTreeSet};

use crate::{pending::PendingMessages, types::STORE_MESSAGES};

/// Key-value snapshot of one trigger storage scope.
pub type StoredValues = BTreeMap<String, String>;

/// Reconciles local edits with a concurrently persisted remote state.
///
/// `base` is what the local writer originally read, `local` is what it wants
/// to persist and `remote` is what is persisted now. The result covers every
/// key seen on any side; `None` removes the key.
///
/// The pending messages entry is merged per message id: ids the local writer
/// added or changed are applied on top of `remote`, ids it removed are removed
/// from `remote`. Every other key takes the local value when the local writer
/// changed it and the remote value otherwise.
pub fn merge(
    base: &StoredValues,
    local: &StoredValues,
    remote: &StoredValues,
) -> BTreeMap<String, Option<String>> {
    let keys: BTreeSet<&String> = base.keys().chain(local.keys()).chain(remote.keys()).collect();

    keys.into_iter()
        .map(|key| {
            let base_value = base.get(key);
            let local_value = local.get(key);
            let remote_value = remote.get(key);

            let merged = if key == STORE_MESSAGES {
                merge_messages(base_value, local_value, remote_value)
            } else if local_value != base_value {
                local_value.cloned()
            } else {
                remote_value.cloned()
            };
            (key.clone(), merged)
        })
        .collect()
}

fn merge_messages(
    base: Option<&String>,
    local: Option<&String>,
    remote: Option<&String>,
) -> Option<String> {
    let parsed = (
        PendingMessages::parse(base.map(String::as_str)),
        PendingMessages::parse(local.map(String::as_str)),
        PendingMessages::parse(remote.map(String::as_str)),
    );
    let (Ok(base), Ok(local_messages), Ok(mut merged)) = parsed else {
        return local.cloned();
    };

    let removed: Vec<String> = base
        .ids()
        .into_iter()
        .filter(|id| local_messages.get(id).is_none())
        .collect();
    merged.remove_all(&removed);

    for record in local_messages.records() {
        if base.get(&record.message_id) != Some(record) {
            merged.upsert(record.clone());
        }
    }

    match merged.to_stored() {
        Ok(stored) => stored,
        Err(_) => local.cloned(),
    }
}
