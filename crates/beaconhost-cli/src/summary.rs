use std::collections::{BTreeMap, BTreeSet};

use beaconhost_core::{Event, EventKind, EventRecord};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct LogSummary {
    pub total: usize,
    pub by_kind: BTreeMap<EventKind, usize>,
    pub remotes: BTreeSet<String>,
    pub bytes_served: u64,
    pub first_ts: Option<u64>,
    pub last_ts: Option<u64>,
}

pub fn summarize(records: &[EventRecord]) -> LogSummary {
    let mut summary = LogSummary::default();
    for record in records {
        summary.total += 1;
        *summary.by_kind.entry(record.event.kind()).or_default() += 1;
        summary.remotes.insert(record.event.remote().to_string());
        if let Event::Download { size, .. } = record.event {
            summary.bytes_served += size;
        }
        summary.first_ts = Some(summary.first_ts.map_or(record.ts, |ts| ts.min(record.ts)));
        summary.last_ts = Some(summary.last_ts.map_or(record.ts, |ts| ts.max(record.ts)));
    }
    summary
}

pub fn format_ts(ts: u64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ts) * 1_000_000)
        .ok()
        .and_then(|at| at.format(&Rfc3339).ok())
        .unwrap_or_else(|| ts.to_string())
}

/// One human-readable line per record for `log tail`.
pub fn format_record(record: &EventRecord) -> String {
    let detail = match &record.event {
        Event::Download { size, .. } => format!("{size} bytes"),
        Event::Beacon {
            user_agent, body, ..
        } => {
            let agent = if user_agent.is_empty() { "-" } else { user_agent };
            format!("ua={agent} body={body}")
        }
    };
    format!(
        "{}\t{}\t{}\t{}\t{}",
        format_ts(record.ts),
        record.event.kind(),
        record.event.remote(),
        record.event.path(),
        detail
    )
}
