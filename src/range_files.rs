//! Range-file sample: fan out one `GenerateFile` activity per number range
//! and collect the names of the blobs they wrote.
//!
//! Input is a comma-separated list of `start-end` ranges, e.g. `"1-10,1-100"`.
//! Range `1-3` produces blob `1-3.txt` containing `"1\n2\n3\n"`.
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::blob_store::BlobStore;
use crate::runtime::registry::{ActivityRegistryBuilder, OrchestrationRegistryBuilder};
use crate::runtime::{ActivityContext, ActivityHandler};
use crate::{durable_error, durable_info, durable_warn, OrchestrationContext};

pub const DURABLE_EXAMPLE: &str = "DurableExample";
pub const GENERATE_FILE: &str = "GenerateFile";
/// Used when the caller supplies no input.
pub const DEFAULT_INPUT: &str = "1-10";
/// Upper bound on numbers per file.
pub const MAX_RANGE_LEN: u64 = 10_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeParseError {
    EmptySegment { index: usize },
    Malformed(String),
    Reversed { start: i64, end: i64 },
    TooLarge { start: i64, end: i64 },
}

impl fmt::Display for RangeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeParseError::EmptySegment { index } => write!(f, "range #{} is empty", index + 1),
            RangeParseError::Malformed(segment) => write!(f, "expected <start>-<end>, got {segment:?}"),
            RangeParseError::Reversed { start, end } => write!(f, "range {start}-{end} ends before it starts"),
            RangeParseError::TooLarge { start, end } => {
                write!(f, "range {start}-{end} exceeds {MAX_RANGE_LEN} numbers")
            }
        }
    }
}

impl std::error::Error for RangeParseError {}

/// Inclusive integer range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumberRange {
    pub start: i64,
    pub end: i64,
}

impl NumberRange {
    /// Parse `"start-end"`. A leading `-` belongs to `start`, so `"-2-2"` is valid.
    pub fn parse(segment: &str) -> Result<Self, RangeParseError> {
        let segment = segment.trim();
        let malformed = || RangeParseError::Malformed(segment.to_string());
        let split_at = segment
            .char_indices()
            .skip(1)
            .find(|&(_, c)| c == '-')
            .map(|(i, _)| i)
            .ok_or_else(malformed)?;
        let start: i64 = segment[..split_at].trim().parse().map_err(|_| malformed())?;
        let end: i64 = segment[split_at + 1..].trim().parse().map_err(|_| malformed())?;
        if end < start {
            return Err(RangeParseError::Reversed { start, end });
        }
        if end.abs_diff(start) >= MAX_RANGE_LEN {
            return Err(RangeParseError::TooLarge { start, end });
        }
        Ok(Self { start, end })
    }

    /// One number per line, each line newline-terminated.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for n in self.start..=self.end {
            out.push_str(&n.to_string());
            out.push('\n');
        }
        out
    }

    pub fn blob_name(&self) -> String {
        format!("{self}.txt")
    }
}

impl fmt::Display for NumberRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Parse a comma-separated range list, keeping input order.
pub fn parse_ranges(input: &str) -> Result<Vec<NumberRange>, RangeParseError> {
    input
        .split(',')
        .enumerate()
        .map(|(index, segment)| {
            if segment.trim().is_empty() {
                Err(RangeParseError::EmptySegment { index })
            } else {
                NumberRange::parse(segment)
            }
        })
        .collect()
}

/// Activity that renders one range and writes it to the blob store.
/// Returns the blob name.
pub struct GenerateFile {
    store: Arc<dyn BlobStore>,
}

impl GenerateFile {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ActivityHandler for GenerateFile {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        let range = NumberRange::parse(&input).map_err(|e| e.to_string())?;
        let name = range.blob_name();
        self.store
            .put(&name, range.render().as_bytes())
            .await
            .map_err(|e| e.to_string())?;
        ctx.trace_info(format!("File {range} generated."));
        Ok(name)
    }
}

/// Orchestration: one `GenerateFile` per range, fanned in as a JSON array of
/// blob names in input order.
pub async fn durable_example(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let input = if input.trim().is_empty() {
        durable_warn!(ctx, fallback = DEFAULT_INPUT, "empty input; using default ranges");
        DEFAULT_INPUT.to_string()
    } else {
        input
    };
    durable_info!(ctx, parameter = %input, "parameter received");
    let ranges = parse_ranges(&input).map_err(|e| {
        durable_error!(ctx, parameter = %input, error = %e, "invalid range list");
        e.to_string()
    })?;
    let blobs = ctx
        .fan_out(ranges.iter().map(|r| (GENERATE_FILE, r.to_string())))
        .await?;
    serde_json::to_string(&blobs).map_err(|e| e.to_string())
}

pub fn register_activities(builder: ActivityRegistryBuilder, store: Arc<dyn BlobStore>) -> ActivityRegistryBuilder {
    builder.register_handler(GENERATE_FILE, Arc::new(GenerateFile::new(store)))
}

pub fn register_orchestrations(builder: OrchestrationRegistryBuilder) -> OrchestrationRegistryBuilder {
    builder.register_with_activities(DURABLE_EXAMPLE, [GENERATE_FILE], durable_example)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::InMemoryBlobStore;

    #[test]
    fn parses_ranges_in_order() {
        let ranges = parse_ranges("1-2, 5-5 ,-3--1").unwrap();
        assert_eq!(
            ranges,
            vec![
                NumberRange { start: 1, end: 2 },
                NumberRange { start: 5, end: 5 },
                NumberRange { start: -3, end: -1 },
            ]
        );
        assert_eq!(ranges[2].to_string(), "-3--1");
    }

    #[test]
    fn rejects_bad_segments() {
        assert_eq!(parse_ranges("1-3,,4-5"), Err(RangeParseError::EmptySegment { index: 1 }));
        assert!(matches!(parse_ranges("abc"), Err(RangeParseError::Malformed(_))));
        assert!(matches!(parse_ranges("7"), Err(RangeParseError::Malformed(_))));
        assert_eq!(parse_ranges("5-1"), Err(RangeParseError::Reversed { start: 5, end: 1 }));
        assert!(matches!(parse_ranges("0-99999999"), Err(RangeParseError::TooLarge { .. })));
    }

    #[test]
    fn render_and_blob_name() {
        let r = NumberRange::parse("1-3").unwrap();
        assert_eq!(r.render(), "1\n2\n3\n");
        assert_eq!(r.blob_name(), "1-3.txt");
    }

    #[tokio::test]
    async fn generate_file_writes_blob() {
        let store = Arc::new(InMemoryBlobStore::new());
        let activity = GenerateFile::new(store.clone());
        let ctx = ActivityContext::new("i".into(), 1, GENERATE_FILE.into(), 1);
        assert_eq!(activity.invoke(ctx.clone(), "2-4".into()).await.unwrap(), "2-4.txt");
        assert_eq!(store.get("2-4.txt").await.unwrap(), b"2\n3\n4\n");
        assert!(activity.invoke(ctx, "oops".into()).await.is_err());
    }
}
