use crate::{
    aggregate::{AggregateStore, FlowAggregate, OnlineStats},
    error::Result,
    model::{DailySample, FlowKey},
    stage::load_aggregate,
    storage::BlobStore,
};

use alloc::{collections::BTreeMap, sync::Arc};
use core::fmt::Write;

pub const REPORT_HEADER: &str = "Source IP,Destination IP,Mean TotalFlowDuration,Standard Deviation TotalFlowDuration,\
    Mean TotalPacketsForward,Standard Deviation TotalPacketsForward";

pub const ROWS_HEADER: &str = "Date,TotalFlowDuration,TotalPacketsForward";

/// Per-day view of one flow with its summary statistics.
#[derive(Clone, Debug, PartialEq)]
pub struct FlowReport {
    pub key: FlowKey,
    /// One row per date, ascending.
    pub rows: Vec<DailySample>,
    pub duration: OnlineStats,
    pub packets: OnlineStats,
}

impl FlowReport {
    /// Samples sharing a date (possible after a set-union merge) are summed into one row;
    /// statistics are taken over the resulting per-day rows.
    pub fn new(key: FlowKey, aggregate: &FlowAggregate) -> Self {
        let mut days = BTreeMap::new();
        for sample in aggregate.samples() {
            let (duration, packets) = days.entry(sample.date).or_insert((0u64, 0u64));
            *duration = duration.saturating_add(sample.duration);
            *packets = packets.saturating_add(sample.packets);
        }

        let rows: Vec<_> =
            days.into_iter().map(|(date, (duration, packets))| DailySample { date, duration, packets }).collect();
        let duration = rows.iter().map(|row| row.duration as f64).collect();
        let packets = rows.iter().map(|row| row.packets as f64).collect();
        Self { key, rows, duration, packets }
    }

    /// Statistics header, a blank line, then the per-date rows.
    pub fn to_csv(&self) -> String {
        let Self { key: FlowKey { source, destination }, rows, duration, packets } = self;
        let mut out = String::new();
        // Writing into a `String` cannot fail.
        let _ = writeln!(out, "{REPORT_HEADER}");
        // Statistics always carry a fractional part, so an integral mean reads `4.0`.
        let _ = writeln!(
            out,
            "{source},{destination},{:?},{:?},{:?},{:?}",
            duration.mean(),
            duration.std_dev(),
            packets.mean(),
            packets.std_dev()
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "{ROWS_HEADER}");
        for DailySample { date, duration, packets } in rows {
            let _ = writeln!(out, "{date},{duration},{packets}");
        }
        out
    }
}

/// Looks a flow up in an already merged store.
pub fn lookup(store: &AggregateStore, key: &FlowKey) -> Option<FlowReport> {
    store.get(key).map(|aggregate| FlowReport::new(key.clone(), aggregate))
}

/// Serves flow lookups against the sharded aggregate in one bucket.
pub struct Exporter<S> {
    store: Arc<S>,
    bucket: String,
}

impl<S: BlobStore> Exporter<S> {
    pub fn new(store: Arc<S>, bucket: impl Into<String>) -> Self {
        Self { store, bucket: bucket.into() }
    }

    /// Merges the current shards into one store.
    pub async fn load(&self) -> Result<AggregateStore> {
        load_aggregate(&*self.store, &self.bucket).await
    }

    pub async fn lookup(&self, key: &FlowKey) -> Result<Option<FlowReport>> {
        let store = self.load().await?;
        Ok(lookup(&store, key))
    }
}
