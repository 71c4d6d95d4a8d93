use crate::error::{Error, Result};

use chrono::{Datelike, NaiveDate};
use core::fmt;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Dates travel through the aggregate codec as days since the common era.
mod days {
    use super::*;

    pub fn serialize<S: Serializer>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(date.num_days_from_ce())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
        let days = i32::deserialize(deserializer)?;
        NaiveDate::from_num_days_from_ce_opt(days).ok_or_else(|| de::Error::custom("day number out of range"))
    }
}

/// One accepted row of a raw flow capture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowObservation {
    /// Calendar day of the flow timestamp.
    pub date: NaiveDate,
    pub source: String,
    pub destination: String,
    pub duration: u64,
    pub packets: u64,
}

impl FlowObservation {
    pub fn key(&self) -> FlowKey {
        FlowKey::new(self.source.as_str(), self.destination.as_str())
    }

    pub fn sample(&self) -> DailySample {
        DailySample { date: self.date, duration: self.duration, packets: self.packets }
    }
}

/// Identifies one logical conversation: the (source IP, destination IP) pair.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct FlowKey {
    pub source: String,
    pub destination: String,
}

impl FlowKey {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self { source: source.into(), destination: destination.into() }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.source, self.destination)
    }
}

/// One day's summed totals for a flow. The derived ordering (date, then duration, then
/// packets) is the canonical order of reconciled sample lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct DailySample {
    #[serde(with = "days")]
    pub date: NaiveDate,
    /// Total flow duration for the day.
    pub duration: u64,
    /// Total forward packets for the day.
    pub packets: u64,
}

/// Location of an object in the blob store.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

#[derive(Deserialize)]
struct Bucket {
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct Object {
    #[serde(default)]
    key: String,
}

#[derive(Deserialize)]
struct Entity {
    bucket: Bucket,
    object: Object,
}

#[derive(Deserialize)]
struct Record {
    s3: Entity,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "Event")]
    event: Option<String>,
    /// Body of an SNS envelope, itself a JSON document.
    #[serde(rename = "Message")]
    message: Option<String>,
    #[serde(rename = "Records")]
    #[serde(default)]
    records: Vec<Record>,
}

/// What a queue message asks the worker to do.
#[derive(Debug, PartialEq, Eq)]
pub enum Notification {
    /// Control traffic (e.g. `s3:TestEvent`) that needs no processing.
    Test,
    /// Newly arrived objects, in record order. Never empty.
    Objects(Vec<ObjectRef>),
}

fn object_ref(Record { s3: Entity { bucket, object } }: Record) -> Result<ObjectRef> {
    if bucket.name.is_empty() || object.key.is_empty() {
        return Err(Error::Parse("empty bucket name or object key".to_owned()));
    }

    // Form encoding: '+' stands for a space, the rest is percent-escaped.
    let plus = object.key.replace('+', " ");
    let key = urlencoding::decode(&plus).map_err(|err| Error::Parse(alloc::format!("{err}")))?;
    Ok(ObjectRef { bucket: bucket.name, key: key.into_owned() })
}

impl Notification {
    /// Parses a storage event notification, unwrapping one level of SNS envelope.
    /// Every record is honored; one unusable record rejects the whole message.
    pub fn parse(body: &str) -> Result<Self> {
        let mut envelope: Envelope = serde_json::from_str(body)?;
        if envelope.event.as_deref() == Some("s3:TestEvent") {
            return Ok(Self::Test);
        }

        if let Some(inner) = envelope.message.take() {
            envelope = serde_json::from_str(&inner)?;
            if envelope.event.as_deref() == Some("s3:TestEvent") {
                return Ok(Self::Test);
            }
        }

        if envelope.records.is_empty() {
            return Err(Error::Parse("no Records array in notification".to_owned()));
        }

        let objects = envelope.records.into_iter().map(object_ref).collect::<Result<_>>()?;
        Ok(Self::Objects(objects))
    }

    /// Renders the object-created event that [`Notification::parse`] reads back.
    pub fn created(objects: &[ObjectRef]) -> String {
        let records: Vec<_> = objects
            .iter()
            .map(|ObjectRef { bucket, key }| {
                serde_json::json!({
                    "eventName": "ObjectCreated:Put",
                    "s3": { "bucket": { "name": bucket }, "object": { "key": urlencoding::encode(key) } },
                })
            })
            .collect();
        serde_json::json!({ "Records": records }).to_string()
    }
}
