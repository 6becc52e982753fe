//! Archive naming for stored result messages.
//!
//! Results are laid out as `{node}/{YYYY-MM-DD}/{HH}/{node}_{YYYY-MM-DDTHH-MM-SSZ}.json`
//! so a busy node never puts more than one hour of files in a directory.
//! Existing archive consumers depend on this exact layout.
//!
//! Fields are taken from the clock time the node reported, in its own offset.
//! The trailing `Z` is part of the historical layout and is written for every
//! offset.

use std::fmt::Display;

use chrono::{DateTime, TimeZone};

pub fn archive_filename<Tz: TimeZone>(node_id: &str, timestamp: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    format!("{}_{}.json", node_id, timestamp.format("%Y-%m-%dT%H-%M-%SZ"))
}

/// Relative directory, always ending in `/`.
pub fn archive_dir<Tz: TimeZone>(node_id: &str, timestamp: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    format!(
        "{}/{}/{}/",
        node_id,
        timestamp.format("%Y-%m-%d"),
        timestamp.format("%H")
    )
}

pub fn archive_path<Tz: TimeZone>(node_id: &str, timestamp: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    format!(
        "{}{}",
        archive_dir(node_id, timestamp),
        archive_filename(node_id, timestamp)
    )
}
