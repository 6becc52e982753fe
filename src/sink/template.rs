//! `${name}` placeholder templates for MQTT topics and HTTP URLs.

use std::fmt;

use anyhow::{anyhow, Result};
use regex::Regex;

pub const PLACEHOLDERS: [&str; 3] = ["hostname", "node_id", "filename"];

/// Values substituted at publish time.
#[derive(Clone, Copy, Debug)]
pub struct TemplateValues<'a> {
    pub hostname: &'a str,
    pub node_id: &'a str,
    pub filename: &'a str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Placeholder {
    Hostname,
    NodeId,
    Filename,
}

impl Placeholder {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "hostname" => Some(Self::Hostname),
            "node_id" => Some(Self::NodeId),
            "filename" => Some(Self::Filename),
            _ => None,
        }
    }

    fn value<'a>(&self, values: &TemplateValues<'a>) -> &'a str {
        match self {
            Self::Hostname => values.hostname,
            Self::NodeId => values.node_id,
            Self::Filename => values.filename,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Value(Placeholder),
}

/// Validated template string, split into literal text and placeholders.
///
/// Rendering walks the segments once, so text coming from a substituted
/// value is never scanned for placeholders again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Template {
    raw: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Accepts only `${hostname}`, `${node_id}` and `${filename}`.
    pub fn parse(raw: &str) -> Result<Self> {
        let pattern = Regex::new(r"\$\{([^}]*)\}")?;
        let mut segments = Vec::new();
        let mut unknown = Vec::new();
        let mut last = 0;
        for caps in pattern.captures_iter(raw) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if whole.start() > last {
                segments.push(Segment::Literal(raw[last..whole.start()].to_string()));
            }
            match Placeholder::from_name(name.as_str()) {
                Some(placeholder) => segments.push(Segment::Value(placeholder)),
                None => unknown.push(name.as_str()),
            }
            last = whole.end();
        }
        if last < raw.len() {
            segments.push(Segment::Literal(raw[last..].to_string()));
        }

        if !unknown.is_empty() {
            return Err(anyhow!(
                "unknown placeholder(s) {} in '{}' (known: {})",
                unknown
                    .iter()
                    .map(|name| format!("${{{}}}", name))
                    .collect::<Vec<_>>()
                    .join(", "),
                raw,
                PLACEHOLDERS.join(", ")
            ));
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn render(&self, values: &TemplateValues<'_>) -> String {
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Value(placeholder) => out.push_str(placeholder.value(values)),
            }
        }
        out
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Refuse node ids that would change the meaning of a path, URL or MQTT
/// topic they are substituted into. Node ids arrive with untrusted batches.
pub fn check_node_id(node_id: &str) -> Result<()> {
    let reserved = |c: char| {
        matches!(c, '/' | '\\' | '?' | '#' | '%' | '+' | '&') || c.is_whitespace() || c.is_control()
    };
    if node_id.is_empty() || node_id == "." || node_id.contains("..") || node_id.contains(reserved)
    {
        return Err(anyhow!(
            "node id '{}' cannot be used in a path, URL or topic",
            node_id.escape_debug()
        ));
    }
    Ok(())
}

/// Access-point prefix some deployments put in front of node hostnames.
const AP_PREFIX: &str = "ap-";

/// Local hostname with any `ap-` prefix removed.
pub fn local_hostname() -> String {
    normalize_hostname(&system_hostname())
}

fn normalize_hostname(name: &str) -> String {
    name.replace(AP_PREFIX, "")
}

#[cfg(unix)]
fn system_hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes; gethostname writes at most that many.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        log::warn!(
            "gethostname failed: {}",
            std::io::Error::last_os_error()
        );
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(not(unix))]
fn system_hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}
