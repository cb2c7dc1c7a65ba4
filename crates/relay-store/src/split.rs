use relay_kernel::{
    Channel, ChannelValue, ChannelVersion, ChannelVersions, Checkpoint, CheckpointConfig,
    CheckpointId, CheckpointTuple, WriteMode,
};

use crate::StoreError;

pub(crate) struct BlobRow {
    pub channel: Channel,
    pub version: ChannelVersion,
    pub value: ChannelValue,
}

/// A `put` broken into what each table receives.
pub(crate) struct PreparedPut {
    pub parent: Option<CheckpointId>,
    /// Checkpoint with blob-valued channels stripped.
    pub row: Checkpoint,
    pub blobs: Vec<BlobRow>,
    /// Blob references this put does not write; they must already exist.
    pub existing_refs: Vec<(Channel, ChannelVersion)>,
}

pub(crate) fn prepare_put(
    config: &CheckpointConfig,
    checkpoint: &Checkpoint,
    new_versions: &ChannelVersions,
) -> Result<PreparedPut, StoreError> {
    let parent = config.checkpoint_id.clone();
    if let Some(parent) = parent.as_ref() {
        if *parent == checkpoint.id {
            return Err(StoreError::SelfParent {
                id: checkpoint.id.clone(),
            });
        }
        if checkpoint.id < *parent {
            return Err(StoreError::OutOfOrder {
                id: checkpoint.id.clone(),
                parent: parent.clone(),
            });
        }
    }

    let mut row = checkpoint.clone();
    let mut blobs = Vec::new();
    let mut existing_refs = Vec::new();
    for (channel, value) in &checkpoint.channel_values {
        if value.is_inline() {
            continue;
        }
        row.channel_values.remove(channel);
        let Some(version) = checkpoint.channel_versions.get(channel) else {
            return Err(StoreError::MissingVersion { channel: *channel });
        };
        if let Some(new_version) = new_versions.get(channel) {
            blobs.push(BlobRow {
                channel: *channel,
                version: new_version.clone(),
                value: value.clone(),
            });
        }
        if new_versions.get(channel) != Some(version) {
            existing_refs.push((*channel, version.clone()));
        }
    }

    Ok(PreparedPut {
        parent,
        row,
        blobs,
        existing_refs,
    })
}

/// Channels whose value must be fetched from the blob table for `row`.
pub(crate) fn blob_refs(row: &Checkpoint) -> Vec<(Channel, ChannelVersion)> {
    row.channel_versions
        .iter()
        .filter(|(channel, _)| !row.channel_values.contains_key(channel))
        .map(|(channel, version)| (*channel, version.clone()))
        .collect()
}

pub(crate) fn parent_config(
    config: &CheckpointConfig,
    parent: Option<CheckpointId>,
) -> Option<CheckpointConfig> {
    parent.map(|id| config.at(id))
}

/// Every channel in the batch is replace-mode, so the batch may upsert.
pub(crate) fn batch_is_replaceable(writes: &[(Channel, ChannelValue)]) -> bool {
    writes
        .iter()
        .all(|(channel, _)| channel.write_mode() == WriteMode::Replace)
}

pub(crate) fn apply_list_window(
    tuples: Vec<CheckpointTuple>,
    query: &crate::ListQuery,
) -> Vec<CheckpointTuple> {
    let limit = query.limit.unwrap_or(usize::MAX);
    tuples
        .into_iter()
        .filter(|tuple| {
            query
                .before
                .as_ref()
                .map(|before| tuple.checkpoint.id < *before)
                .unwrap_or(true)
        })
        .filter(|tuple| tuple.metadata.matches(&query.filter))
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_kernel::Message;

    fn checkpoint_with_messages(id: &str) -> Checkpoint {
        let mut checkpoint = Checkpoint::new(CheckpointId::new(id));
        checkpoint.channel_values.insert(
            Channel::Messages,
            ChannelValue::Messages(vec![Message::user("hi")]),
        );
        checkpoint
            .channel_values
            .insert(Channel::Step, ChannelValue::Int(1));
        let version = ChannelVersion::next_after(None);
        checkpoint
            .channel_versions
            .insert(Channel::Messages, version.clone());
        checkpoint.channel_versions.insert(Channel::Step, version);
        checkpoint
    }

    #[test]
    fn strips_blob_channels_from_row() {
        let checkpoint = checkpoint_with_messages("1");
        let prepared = prepare_put(
            &CheckpointConfig::new("t"),
            &checkpoint,
            &checkpoint.channel_versions,
        )
        .expect("prepare");
        assert!(prepared.row.value(Channel::Messages).is_none());
        assert_eq!(prepared.row.value(Channel::Step), Some(&ChannelValue::Int(1)));
        assert_eq!(prepared.blobs.len(), 1);
        assert!(prepared.existing_refs.is_empty());
        assert_eq!(blob_refs(&prepared.row).len(), 1);
    }

    #[test]
    fn unchanged_blob_becomes_existing_reference() {
        let checkpoint = checkpoint_with_messages("2");
        let prepared = prepare_put(
            &CheckpointConfig::new("t").at(CheckpointId::new("1")),
            &checkpoint,
            &ChannelVersions::new(),
        )
        .expect("prepare");
        assert!(prepared.blobs.is_empty());
        assert_eq!(prepared.existing_refs.len(), 1);
    }

    #[test]
    fn rejects_self_parent_and_backwards_ids() {
        let checkpoint = checkpoint_with_messages("2");
        let versions = checkpoint.channel_versions.clone();
        let own = CheckpointConfig::new("t").at(CheckpointId::new("2"));
        assert!(matches!(
            prepare_put(&own, &checkpoint, &versions),
            Err(StoreError::SelfParent { .. })
        ));
        let later = CheckpointConfig::new("t").at(CheckpointId::new("3"));
        assert!(matches!(
            prepare_put(&later, &checkpoint, &versions),
            Err(StoreError::OutOfOrder { .. })
        ));
    }

    #[test]
    fn blob_value_without_version_is_rejected() {
        let mut checkpoint = checkpoint_with_messages("1");
        checkpoint.channel_versions.remove(&Channel::Messages);
        assert!(matches!(
            prepare_put(&CheckpointConfig::new("t"), &checkpoint, &ChannelVersions::new()),
            Err(StoreError::MissingVersion { .. })
        ));
    }
}
