//! Dotted-order codec.
//!
//! Encodes a sortable path key per run: `YYYYMMDDTHHMMSSmmmuuuZ<runId>`,
//! joined `.`-separated from root to leaf. Ordering is lexicographic and
//! corresponds to depth-first, start-time-breaking-ties traversal.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::{ErrorCode, StructuredError};

/// One decoded dotted-order segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub run_id: Uuid,
    pub start_time_ms: i64,
}

/// Encodes a single segment from a start time, run id, and execution order.
///
/// `execution_order` must be unique among siblings that start within the
/// same microsecond, since it is folded into the sub-millisecond digits
/// that otherwise tie.
pub fn encode(start_time_ms: i64, run_id: Uuid, execution_order: u32) -> String {
    let secs = start_time_ms.div_euclid(1000);
    let millis_rem = start_time_ms.rem_euclid(1000);
    let dt = DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap());

    // Sub-millisecond tail: fold the execution order into a synthetic
    // microsecond component so siblings sharing a millisecond still sort
    // deterministically and uniquely.
    let micros_tail = execution_order % 1000;

    let base = dt.format("%Y%m%dT%H%M%S").to_string();
    let stamp = format!("{base}{millis_rem:03}{micros_tail:03}Z");
    format!("{stamp}{run_id}")
}

/// Joins segments root-to-leaf into a full dotted-order string.
pub fn join(segments: &[String]) -> String {
    segments.join(".")
}

/// The decoded identity triple carried by a full dotted-order string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDottedOrder {
    pub id: Uuid,
    pub trace_id: Uuid,
    pub parent_run_id: Option<Uuid>,
    pub start_time_ms: i64,
}

fn parse_segment(segment: &str) -> Result<Segment, StructuredError> {
    // Layout: 8 (date) + 1 ('T') + 6 (time) + 3 (millis) + 3 (tail) + 1 ('Z') = 22 chars, then UUID.
    const PREFIX_LEN: usize = 22;
    if segment.len() < PREFIX_LEN + 36 {
        return Err(StructuredError::new(
            ErrorCode::MALFORMED_DOTTED_ORDER,
            format!("segment too short: {segment}"),
        ));
    }
    let (stamp, run_id_str) = segment.split_at(PREFIX_LEN);
    let run_id = Uuid::parse_str(run_id_str).map_err(|e| {
        StructuredError::new(
            ErrorCode::MALFORMED_DOTTED_ORDER,
            format!("invalid run id in segment '{segment}': {e}"),
        )
    })?;

    let date_part = &stamp[0..8];
    let time_part = &stamp[9..15]; // skip 'T'
    let millis_part = &stamp[15..18];

    // No offset in the stamp (the trailing 'Z' is a literal separator before
    // the run id, not an RFC 3339 zone marker), so this is always UTC and
    // must be parsed as a naive timestamp rather than with an offset parser.
    let naive_str = format!("{date_part}T{time_part}.{millis_part}");
    let naive = chrono::NaiveDateTime::parse_from_str(&naive_str, "%Y%m%dT%H%M%S.%3f").map_err(|e| {
        StructuredError::new(
            ErrorCode::MALFORMED_DOTTED_ORDER,
            format!("invalid timestamp in segment '{segment}': {e}"),
        )
    })?;
    let dt = naive.and_utc();

    Ok(Segment {
        run_id,
        start_time_ms: dt.timestamp_millis(),
    })
}

/// Parses a full dotted-order string into the identity triple it encodes.
pub fn parse(dot_order: &str) -> Result<ParsedDottedOrder, StructuredError> {
    let parts: Vec<&str> = dot_order.split('.').collect();
    if parts.is_empty() {
        return Err(StructuredError::new(
            ErrorCode::MALFORMED_DOTTED_ORDER,
            "empty dotted-order".to_string(),
        ));
    }

    let first = parse_segment(parts[0])?;
    let last = parse_segment(parts[parts.len() - 1])?;
    let parent_run_id = if parts.len() >= 2 {
        Some(parse_segment(parts[parts.len() - 2])?.run_id)
    } else {
        None
    };

    Ok(ParsedDottedOrder {
        id: last.run_id,
        trace_id: first.run_id,
        parent_run_id,
        start_time_ms: last.start_time_ms,
    })
}
