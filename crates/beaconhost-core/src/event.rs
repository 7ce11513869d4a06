use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Key under which a beacon body that is not valid JSON is stored.
pub const RAW_BODY_KEY: &str = "_raw";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Download {
        path: String,
        remote: String,
        size: u64,
    },
    Beacon {
        path: String,
        remote: String,
        #[serde(default)]
        user_agent: String,
        body: Value,
    },
}

impl Event {
    pub fn download(path: impl Into<String>, remote: impl Into<String>, size: u64) -> Self {
        Self::Download {
            path: path.into(),
            remote: remote.into(),
            size,
        }
    }

    /// Builds a beacon event, decoding `raw` as JSON when possible.
    pub fn beacon(
        path: impl Into<String>,
        remote: impl Into<String>,
        user_agent: impl Into<String>,
        raw: &[u8],
    ) -> Self {
        Self::Beacon {
            path: path.into(),
            remote: remote.into(),
            user_agent: user_agent.into(),
            body: decode_body(raw),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Download { .. } => EventKind::Download,
            Self::Beacon { .. } => EventKind::Beacon,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::Download { path, .. } | Self::Beacon { path, .. } => path,
        }
    }

    pub fn remote(&self) -> &str {
        match self {
            Self::Download { remote, .. } | Self::Beacon { remote, .. } => remote,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Download,
    Beacon,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Download => f.write_str("download"),
            Self::Beacon => f.write_str("beacon"),
        }
    }
}

/// One line of the event log. `ts` is assigned by the host when the record is
/// appended and is never taken from the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts: u64,
    #[serde(flatten)]
    pub event: Event,
}

/// Parses a beacon body as JSON, or wraps its lossy UTF-8 text under
/// [`RAW_BODY_KEY`] when it is not JSON.
pub fn decode_body(raw: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(raw) {
        Ok(value) => value,
        Err(_) => serde_json::json!({
            RAW_BODY_KEY: String::from_utf8_lossy(raw),
        }),
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
