use regex::Regex;

lazy_static! {
    static ref FORWARD: Regex =
        Regex::new(r"^(?:(\[[^\]]*\]|[^\s:\[\]]*):)?(\d+)\s+(\[[^\]]*\]|[^\s:\[\]]+):(\d+)$").unwrap();
}

/// The bind address used when a forward specification has none.
pub const DEFAULT_BIND_ADDRESS: &str = "localhost";

/// A `LocalForward` or `RemoteForward` specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub bind_address: String,
    pub bind_port: u16,
    pub target_host: String,
    pub target_port: u16,
    /// Name of a filter, looked up in the connection's registry.
    pub filter: Option<String>,
}

fn unbracket(s: &str) -> &str {
    s.trim_start_matches('[').trim_end_matches(']')
}

impl Forward {
    /// Parse `[bind_address:]port host:hostport`. IPv6 addresses are
    /// written between brackets.
    pub fn parse(spec: &str) -> Option<Forward> {
        let cap = FORWARD.captures(spec.trim())?;
        let bind_address = match cap.get(1).map(|m| unbracket(m.as_str())) {
            None | Some("") => DEFAULT_BIND_ADDRESS.to_string(),
            Some(addr) => addr.to_string(),
        };
        Some(Forward {
            bind_address,
            bind_port: cap[2].parse().ok()?,
            target_host: unbracket(&cap[3]).to_string(),
            target_port: cap[4].parse().ok()?,
            filter: None,
        })
    }
}
