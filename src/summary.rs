use crate::{
    error::{Error, Result},
    model::{DailySample, FlowKey, FlowObservation},
    normalize::{normalize, ColumnLayout},
};

use alloc::collections::BTreeMap;
use chrono::NaiveDate;
use core::fmt::Write;
use rayon::prelude::*;
use std::collections::HashMap;

pub const SUMMARY_HEADER: &str = "date,source_ip,destination_ip,total_flow_duration,total_forward_packets";

/// Per-day per-flow totals of one input file, keyed by the composite `date,source,destination`
/// string. Iteration and rendering follow the lexicographic order of that key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DailySummary {
    rows: BTreeMap<String, FlowObservation>,
}

fn composite_key(obs: &FlowObservation) -> String {
    alloc::format!("{},{},{}", obs.date, obs.source, obs.destination)
}

fn fold_into(acc: &mut HashMap<String, FlowObservation>, obs: FlowObservation) {
    let key = composite_key(&obs);
    acc.entry(key)
        .and_modify(|total| {
            total.duration = total.duration.saturating_add(obs.duration);
            total.packets = total.packets.saturating_add(obs.packets);
        })
        .or_insert(obs);
}

/// Reduces every record of a file (the first record is the header and is always skipped)
/// into one row per (date, source, destination). Rejected rows are dropped silently.
/// The fold runs in parallel; since it is a plain sum the result does not depend on
/// record order.
pub fn summarize<S: AsRef<str> + Sync>(records: &[Vec<S>], layout: &ColumnLayout) -> DailySummary {
    let totals = records
        .par_iter()
        .skip(1)
        .filter_map(|record| normalize(record, layout))
        .fold(HashMap::new, |mut acc, obs| {
            fold_into(&mut acc, obs);
            acc
        })
        .reduce(HashMap::new, |mut left, right| {
            for obs in right.into_values() {
                fold_into(&mut left, obs);
            }
            left
        });

    DailySummary { rows: totals.into_iter().collect() }
}

impl DailySummary {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in composite-key order, each carrying the summed duration and packets.
    pub fn rows(&self) -> impl Iterator<Item = &FlowObservation> {
        self.rows.values()
    }

    /// Renders the report: the fixed header, then one LF-terminated line per row.
    pub fn to_csv(&self) -> String {
        let mut out = String::with_capacity(SUMMARY_HEADER.len() + 1 + self.rows.len() * 48);
        out.push_str(SUMMARY_HEADER);
        out.push('\n');
        for (key, FlowObservation { duration, packets, .. }) in &self.rows {
            // Writing into a `String` cannot fail.
            let _ = writeln!(out, "{key},{duration},{packets}");
        }
        out
    }
}

fn parse_summary_row<S: AsRef<str>>(record: &[S]) -> Result<Option<(FlowKey, DailySample)>> {
    let [date, source, destination, duration, packets, ..] = record else {
        return Err(Error::Parse(alloc::format!("expected 5 fields, found {}", record.len())));
    };

    let (source, destination) = (source.as_ref().trim(), destination.as_ref().trim());
    if source.is_empty() || destination.is_empty() {
        return Ok(None);
    }

    let date = date.as_ref().trim();
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|err| Error::Parse(alloc::format!("bad date {date:?}: {err}")))?;

    let count = |field: &S| {
        let field = field.as_ref().trim();
        field.parse::<u64>().map_err(|err| Error::Parse(alloc::format!("bad total {field:?}: {err}")))
    };

    let sample = DailySample { date, duration: count(duration)?, packets: count(packets)? };
    Ok(Some((FlowKey::new(source, destination), sample)))
}

/// Reads back a summary report (as produced by [`DailySummary::to_csv`]) as flow samples,
/// in file order. The header is skipped; rows with a missing IP address are ignored and
/// malformed rows are logged and skipped.
pub fn parse_summary<S: AsRef<str>>(records: &[Vec<S>]) -> Vec<(FlowKey, DailySample)> {
    records
        .iter()
        .enumerate()
        .skip(1)
        .filter_map(|(line, record)| match parse_summary_row(record) {
            Ok(row) => row,
            Err(err) => {
                log::warn!("skipping summary line {}: {err}", line + 1);
                None
            }
        })
        .collect()
}
