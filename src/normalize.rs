use crate::model::FlowObservation;

use chrono::NaiveDateTime;

/// Capture timestamps look like `01/01/2025 01:00:00 AM`.
pub const TIMESTAMP_FORMAT: &str = "%d/%m/%Y %I:%M:%S %p";

/// Field positions of a raw flow capture row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColumnLayout {
    pub timestamp: usize,
    pub source: usize,
    pub destination: usize,
    pub duration: usize,
    pub packets: usize,
    /// Rows with fewer fields than this are rejected outright.
    pub min_fields: usize,
}

impl ColumnLayout {
    /// Builds a layout whose minimum width is just wide enough for every named column.
    pub fn new(timestamp: usize, source: usize, destination: usize, duration: usize, packets: usize) -> Self {
        let widest = timestamp.max(source).max(destination).max(duration).max(packets);
        Self { timestamp, source, destination, duration, packets, min_fields: widest + 1 }
    }
}

impl Default for ColumnLayout {
    /// Layout of the network capture exports this pipeline was built for.
    fn default() -> Self {
        Self { timestamp: 6, source: 1, destination: 3, duration: 7, packets: 8, min_fields: 9 }
    }
}

/// Numeric columns fail closed: anything that is not a non-negative integer counts as zero.
fn parse_count(field: &str) -> u64 {
    field.trim().parse().unwrap_or(0)
}

/// Turns one raw record into a [`FlowObservation`]. Returns [`None`] for rows that are
/// too short, lack either IP address, or carry an empty or unparseable timestamp.
/// Malformed duration or packet fields do not reject the row; they read as zero.
pub fn normalize<S: AsRef<str>>(record: &[S], layout: &ColumnLayout) -> Option<FlowObservation> {
    if record.len() < layout.min_fields {
        return None;
    }

    let field = |index: usize| record.get(index).map_or("", |f| f.as_ref().trim());

    let timestamp = field(layout.timestamp);
    if timestamp.is_empty() {
        return None;
    }

    let source = field(layout.source);
    let destination = field(layout.destination);
    if source.is_empty() || destination.is_empty() {
        return None;
    }

    let date = match NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT) {
        Ok(ts) => ts.date(),
        Err(err) => {
            log::debug!("rejecting row with timestamp {timestamp:?}: {err}");
            return None;
        }
    };

    Some(FlowObservation {
        date,
        source: source.into(),
        destination: destination.into(),
        duration: parse_count(field(layout.duration)),
        packets: parse_count(field(layout.packets)),
    })
}
