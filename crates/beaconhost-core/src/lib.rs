mod config;
mod event;
mod log;

pub use config::{
    ConfigError, HostConfig, DEFAULT_DOWNLOAD_PATH, DEFAULT_LOG_PATH, DEFAULT_PORT,
    DEFAULT_ROUTE,
};
pub use event::{decode_body, now_unix_ms, Event, EventKind, EventRecord, RAW_BODY_KEY};
pub use log::{read_events, EventLog, LogError};
