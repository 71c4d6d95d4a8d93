use crate::{aggregate::UpdatePolicy, processor::ProcessorConfig};

use anyhow::{anyhow, Context};
use core::{str::FromStr, time::Duration};

/// Which part of the pipeline this process runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    /// Raw captures in, daily summaries out.
    #[default]
    Summarize,
    /// Daily summaries in, aggregate shards out.
    Consolidate,
    /// Folds all shards into one, then exits.
    Compact,
    /// Serves flow reports over HTTP.
    Export,
    /// Announces every object of `SOURCE_BUCKET` on the queue, then exits.
    Scan,
}

impl Mode {
    /// Queue polled when `QUEUE` is not set.
    pub fn default_queue(self) -> &'static str {
        match self {
            Self::Summarize | Self::Export | Self::Scan => "summarize",
            Self::Consolidate | Self::Compact => "consolidate",
        }
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "summarize" => Self::Summarize,
            "consolidate" => Self::Consolidate,
            "compact" => Self::Compact,
            "export" => Self::Export,
            "scan" => Self::Scan,
            other => return Err(anyhow!("unknown mode {other:?}")),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub pg_url: String,
    pub mode: Mode,
    pub queue: String,
    /// Where the outputs of this stage are announced, if anywhere.
    pub next_queue: Option<String>,
    pub source_bucket: String,
    pub output_bucket: String,
    pub aggregate_bucket: String,
    pub batch_size: usize,
    pub wait: Duration,
    pub visibility: Duration,
    pub concurrency: usize,
    pub policy: UpdatePolicy,
    pub delete_source: bool,
    pub port: u16,
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    let Some(value) = lookup(name) else {
        return Ok(default);
    };
    value.trim().parse().map_err(|err| anyhow!("invalid {name} {value:?}: {err}"))
}

impl Config {
    /// Reads the settings from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the settings through `lookup`, which returns the raw value of a variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let pg_url = lookup("PG_URL").context("PG_URL is not set")?;
        let mode: Mode = parse_or(&lookup, "MODE", Mode::default())?;
        let queue = lookup("QUEUE").unwrap_or_else(|| mode.default_queue().into());
        let next_queue = lookup("NEXT_QUEUE").map(|q| q.trim().to_owned()).filter(|q| !q.is_empty());

        let source_bucket = lookup("SOURCE_BUCKET").unwrap_or_default();
        if source_bucket.is_empty() && mode == Mode::Scan {
            return Err(anyhow!("SOURCE_BUCKET is required in {mode:?} mode"));
        }

        let output_bucket = lookup("OUTPUT_BUCKET").unwrap_or_default();
        if output_bucket.is_empty() && matches!(mode, Mode::Summarize | Mode::Consolidate) {
            return Err(anyhow!("OUTPUT_BUCKET is required in {mode:?} mode"));
        }
        let aggregate_bucket = lookup("AGGREGATE_BUCKET").unwrap_or_else(|| output_bucket.clone());
        if aggregate_bucket.is_empty() && matches!(mode, Mode::Compact | Mode::Export) {
            return Err(anyhow!("AGGREGATE_BUCKET or OUTPUT_BUCKET is required in {mode:?} mode"));
        }

        Ok(Self {
            pg_url,
            mode,
            queue,
            next_queue,
            source_bucket,
            output_bucket,
            aggregate_bucket,
            batch_size: parse_or(&lookup, "BATCH_SIZE", 10)?,
            wait: Duration::from_secs(parse_or(&lookup, "WAIT_SECONDS", 10)?),
            visibility: Duration::from_secs(parse_or(&lookup, "VISIBILITY_SECONDS", 120)?),
            concurrency: parse_or(&lookup, "CONCURRENCY", 5)?,
            policy: parse_or(&lookup, "POLICY", UpdatePolicy::default())?,
            delete_source: parse_or(&lookup, "DELETE_SOURCE", true)?,
            port: parse_or(&lookup, "PORT", 8080)?,
        })
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            queue: self.queue.clone(),
            max_messages: self.batch_size,
            wait: self.wait,
            concurrency: self.concurrency,
            next_queue: self.next_queue.clone(),
        }
    }
}
