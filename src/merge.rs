use crate::{
    aggregate::{AggregateStore, FlowAggregate},
    error::{Error, Result},
    model::{DailySample, FlowKey},
};

use alloc::collections::{BTreeMap, BTreeSet};

/// Reconciles independently written shards into one store.
///
/// Per flow, the sample lists are unioned with exact (date, duration, packets) dedup,
/// whatever policy produced them; this is a set union, never a re-aggregation. The union
/// is kept in canonical sample order and the statistics are recomputed from it, so the
/// result is independent of shard order and merging a shard twice changes nothing.
pub fn merge_shards<I>(shards: I) -> AggregateStore
where
    I: IntoIterator<Item = AggregateStore>,
{
    let mut union = BTreeMap::<FlowKey, BTreeSet<DailySample>>::new();
    for shard in shards {
        for (key, aggregate) in shard {
            union.entry(key).or_default().extend(aggregate.samples().iter().copied());
        }
    }

    union
        .into_iter()
        .map(|(key, samples)| (key, FlowAggregate::from_samples(samples.into_iter().collect())))
        .collect()
}

/// Decodes named shard blobs, keeping the names of the readable ones. Unreadable shards
/// are logged and left out; this only fails when there was at least one shard and none
/// could be read.
pub fn decode_shards<I, N, B>(shards: I) -> Result<Vec<(N, AggregateStore)>>
where
    I: IntoIterator<Item = (N, B)>,
    N: core::fmt::Display,
    B: AsRef<[u8]>,
{
    let mut seen = 0;
    let mut decoded = Vec::new();
    for (name, bytes) in shards {
        seen += 1;
        match AggregateStore::decode(bytes.as_ref()) {
            Ok(store) => decoded.push((name, store)),
            Err(err) => log::error!("excluding shard {name} from merge: {err}"),
        }
    }

    if seen > 0 && decoded.is_empty() {
        return Err(Error::AllShardsCorrupt(seen));
    }

    log::debug!("decoded {} of {seen} shards", decoded.len());
    Ok(decoded)
}

/// [`decode_shards`] followed by [`merge_shards`].
pub fn merge_encoded<I, N, B>(shards: I) -> Result<AggregateStore>
where
    I: IntoIterator<Item = (N, B)>,
    N: core::fmt::Display,
    B: AsRef<[u8]>,
{
    let decoded = decode_shards(shards)?;
    Ok(merge_shards(decoded.into_iter().map(|(_, store)| store)))
}
