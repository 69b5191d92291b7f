pub mod artifacts;
pub mod candles;
pub mod confirmations;
pub mod dag_nodes;
pub mod evals;
pub mod events;
pub mod orders;
pub mod portfolio;
pub mod rankings;
pub mod runs;
pub mod tickets;

use chrono::{DateTime, Utc};

pub(crate) fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
