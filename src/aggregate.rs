use crate::{
    error::{Error, Result},
    model::{DailySample, FlowKey},
};

use alloc::collections::BTreeMap;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

/// Leading byte of every encoded [`AggregateStore`].
pub const FORMAT_VERSION: u8 = 1;

/// Streaming mean and population variance (Welford).
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct OnlineStats {
    count: u64,
    mean: f64,
    /// Sum of squared deviations from the running mean.
    m2: f64,
}

impl OnlineStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Zero when nothing has been observed.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance (divides by `n`). Zero when nothing has been observed.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

impl FromIterator<f64> for OnlineStats {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut stats = Self::default();
        for value in iter {
            stats.push(value);
        }
        stats
    }
}

/// How a new [`DailySample`] is folded into an existing [`FlowAggregate`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Append unless an identical (date, duration, packets) triple is already present.
    /// Several samples may share a date.
    AppendDistinct,
    /// Add into the sample with the same date, or insert a new one keeping the list
    /// sorted by date. At most one sample per date.
    #[default]
    MergeByDate,
}

impl FromStr for UpdatePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "append-distinct" => Ok(Self::AppendDistinct),
            "merge-by-date" => Ok(Self::MergeByDate),
            other => Err(Error::Parse(alloc::format!("unknown update policy {other:?}"))),
        }
    }
}

/// Everything known about one flow: its daily samples and the statistics over them.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct FlowAggregate {
    samples: Vec<DailySample>,
    duration: OnlineStats,
    packets: OnlineStats,
}

impl FlowAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an aggregate over the given samples in the given order, computing the
    /// statistics from scratch.
    pub fn from_samples(samples: Vec<DailySample>) -> Self {
        let mut aggregate = Self { samples, ..Self::default() };
        aggregate.recompute();
        aggregate
    }

    fn observe(&mut self, sample: &DailySample) {
        self.duration.push(sample.duration as f64);
        self.packets.push(sample.packets as f64);
    }

    /// Recomputes the statistics by replaying the current sample list.
    pub fn recompute(&mut self) {
        self.duration = self.samples.iter().map(|s| s.duration as f64).collect();
        self.packets = self.samples.iter().map(|s| s.packets as f64).collect();
    }

    /// Folds a sample in under the given policy. Returns `false` when the aggregate was
    /// left untouched (an exact duplicate under [`UpdatePolicy::AppendDistinct`]).
    pub fn insert(&mut self, sample: DailySample, policy: UpdatePolicy) -> bool {
        match policy {
            UpdatePolicy::AppendDistinct => {
                if self.samples.contains(&sample) {
                    return false;
                }
                self.samples.push(sample);
                self.observe(&sample);
            }
            UpdatePolicy::MergeByDate => match self.samples.binary_search_by_key(&sample.date, |s| s.date) {
                Ok(index) => {
                    let existing = &mut self.samples[index];
                    existing.duration = existing.duration.saturating_add(sample.duration);
                    existing.packets = existing.packets.saturating_add(sample.packets);
                    // An existing value changed, so the running statistics no longer apply.
                    self.recompute();
                }
                Err(index) => {
                    self.samples.insert(index, sample);
                    self.observe(&sample);
                }
            },
        }
        true
    }

    pub fn samples(&self) -> &[DailySample] {
        &self.samples
    }

    pub fn mean_duration(&self) -> f64 {
        self.duration.mean()
    }

    pub fn variance_duration(&self) -> f64 {
        self.duration.variance()
    }

    pub fn mean_packets(&self) -> f64 {
        self.packets.mean()
    }

    pub fn variance_packets(&self) -> f64 {
        self.packets.variance()
    }

    pub fn duration_stats(&self) -> &OnlineStats {
        &self.duration
    }

    pub fn packet_stats(&self) -> &OnlineStats {
        &self.packets
    }
}

/// Flow key to aggregate. Persisted whole; never partially overwritten.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct AggregateStore {
    flows: BTreeMap<FlowKey, FlowAggregate>,
}

impl AggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a sample into the aggregate of `key`, creating it on first sight.
    pub fn insert(&mut self, key: FlowKey, sample: DailySample, policy: UpdatePolicy) -> bool {
        self.flows.entry(key).or_default().insert(sample, policy)
    }

    pub fn get(&self, key: &FlowKey) -> Option<&FlowAggregate> {
        self.flows.get(key)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FlowKey, &FlowAggregate)> {
        self.flows.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &FlowKey> {
        self.flows.keys()
    }

    /// Serializes the store behind a one-byte format version.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bitcode::serialize(self).map_err(|err| Error::Corrupt(alloc::format!("encode: {err}")))?;
        let mut bytes = Vec::with_capacity(body.len() + 1);
        bytes.push(FORMAT_VERSION);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let Some((&version, body)) = bytes.split_first() else {
            return Err(Error::Corrupt("empty aggregate".into()));
        };
        if version != FORMAT_VERSION {
            return Err(Error::Corrupt(alloc::format!("unsupported format version {version}")));
        }
        Ok(bitcode::deserialize(body)?)
    }
}

impl FromIterator<(FlowKey, FlowAggregate)> for AggregateStore {
    fn from_iter<I: IntoIterator<Item = (FlowKey, FlowAggregate)>>(iter: I) -> Self {
        Self { flows: iter.into_iter().collect() }
    }
}

impl IntoIterator for AggregateStore {
    type Item = (FlowKey, FlowAggregate);
    type IntoIter = alloc::collections::btree_map::IntoIter<FlowKey, FlowAggregate>;

    fn into_iter(self) -> Self::IntoIter {
        self.flows.into_iter()
    }
}
