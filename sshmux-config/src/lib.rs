//! Parse `ssh_config`-style files describing the forwards of an
//! `sshmux` connection, and the parameters of its channels.
//!
//! ```text
//! Host ftp-gateway
//!     WindowSize 1048576
//!     ConnectTimeout 20
//!     LocalForward 2121 ftp.internal:21
//!     ForwardFilter 2121 ftp
//!     RemoteForward 0.0.0.0:8080 localhost:80
//!     X11Display localhost:10
//! ```

extern crate regex;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
extern crate dirs;

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use sshmux::forward::Listener;
use sshmux::Connection;

#[derive(Debug)]
pub enum Error {
    IO(std::io::Error),
    HostNotFound,
    NoHome,
    Parse { line: usize, message: String },
    UnknownFilter(String),
    ForwardRefused { bind_address: String, bind_port: u16 },
    Connection(sshmux::Error),
}

impl std::convert::From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IO(e)
    }
}

impl std::convert::From<sshmux::Error> for Error {
    fn from(e: sshmux::Error) -> Self {
        Error::Connection(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Error::IO(ref e) => e.fmt(f),
            Error::HostNotFound => write!(f, "Host not found"),
            Error::NoHome => write!(f, "No home directory"),
            Error::Parse { line, ref message } => write!(f, "Line {}: {}", line, message),
            Error::UnknownFilter(ref name) => write!(f, "Unknown filter {:?}", name),
            Error::ForwardRefused {
                ref bind_address,
                bind_port,
            } => write!(f, "Remote forward {}:{} refused", bind_address, bind_port),
            Error::Connection(ref e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::IO(ref e) => Some(e),
            Error::Connection(ref e) => Some(e),
            _ => None,
        }
    }
}

mod forward;
pub use forward::*;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub channel: sshmux::Config,
    pub local_forwards: Vec<Forward>,
    pub remote_forwards: Vec<Forward>,
}

impl Config {
    /// Start the local forwards, and request the remote forwards, of
    /// this configuration. The filters are looked up in the registry of
    /// `connection`.
    pub async fn establish(&self, connection: &Connection) -> Result<Vec<Listener>, Error> {
        let filter = |forward: &Forward| match forward.filter {
            Some(ref name) => connection
                .filters()
                .get(name)
                .map(Some)
                .ok_or_else(|| Error::UnknownFilter(name.clone())),
            None => Ok(None),
        };
        let mut listeners = Vec::new();
        for forward in self.local_forwards.iter() {
            let listener = connection
                .new_local_forward_filtered(
                    &forward.bind_address,
                    forward.bind_port,
                    &forward.target_host,
                    u32::from(forward.target_port),
                    filter(forward)?,
                )
                .await?;
            listeners.push(listener)
        }
        let mut requests = Vec::new();
        for forward in self.remote_forwards.iter() {
            let factory = filter(forward)?;
            requests.push(async move {
                let accepted = connection
                    .new_remote_forward_blocking(
                        &forward.bind_address,
                        u32::from(forward.bind_port),
                        &forward.target_host,
                        u32::from(forward.target_port),
                        factory,
                    )
                    .await;
                (forward, accepted)
            })
        }
        for (forward, accepted) in futures::future::join_all(requests).await {
            if !accepted {
                for listener in listeners.iter() {
                    listener.stop()
                }
                return Err(Error::ForwardRefused {
                    bind_address: forward.bind_address.clone(),
                    bind_port: forward.bind_port,
                });
            }
        }
        Ok(listeners)
    }
}

pub fn parse_home(host: &str) -> Result<Config, Error> {
    let mut home = if let Some(home) = dirs::home_dir() {
        home
    } else {
        return Err(Error::NoHome);
    };
    home.push(".ssh");
    home.push("config");
    parse_path(&home, host)
}

pub fn parse_path<P: AsRef<Path>>(path: P, host: &str) -> Result<Config, Error> {
    let mut s = String::new();
    let mut b = std::fs::File::open(path)?;
    b.read_to_string(&mut s)?;
    parse(&s, host)
}

/// `host:display[.screen]`, with an empty or `unix` host meaning the
/// local machine.
fn parse_display(value: &str) -> Option<(String, u16)> {
    let n = value.rfind(':')?;
    let (host, display) = value.split_at(n);
    let display = display[1..].split('.').next()?;
    let display: u16 = display.parse().ok()?;
    let host = match host {
        "" | "unix" | "localhost" => "127.0.0.1",
        host => host,
    };
    Some((host.to_string(), 6000u16.checked_add(display)?))
}

fn matches(patterns: &str, host: &str) -> bool {
    patterns.split_whitespace().any(|p| p == "*" || p == host)
}

pub fn parse(file: &str, host: &str) -> Result<Config, Error> {
    let mut config: Option<Config> = None;
    let mut filters = Vec::new();
    for (n, line) in file.lines().enumerate() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        if let Some(i) = line.find(|c: char| c.is_whitespace() || c == '=') {
            let (key, value) = line.split_at(i);
            let value = value.trim_start_matches(|c: char| c.is_whitespace() || c == '=');
            let lower = key.to_lowercase();
            let err = |message: &str| Error::Parse {
                line: n + 1,
                message: format!("{}: {}", message, value),
            };
            if let Some(ref mut config) = config {
                match lower.as_str() {
                    "host" => break,
                    "windowsize" => {
                        config.channel.window_size = value.parse().map_err(|_| err("bad window size"))?
                    }
                    "maxpacketsize" => {
                        config.channel.maximum_packet_size =
                            value.parse().map_err(|_| err("bad packet size"))?
                    }
                    "connecttimeout" => {
                        let secs: u64 = value.parse().map_err(|_| err("bad timeout"))?;
                        config.channel.connect_timeout = if secs == 0 {
                            None
                        } else {
                            Some(Duration::from_secs(secs))
                        }
                    }
                    "x11display" => {
                        let (host, port) = parse_display(value).ok_or_else(|| err("bad display"))?;
                        config.channel.x11_display_host = host;
                        config.channel.x11_display_port = port;
                    }
                    "localforward" => config
                        .local_forwards
                        .push(Forward::parse(value).ok_or_else(|| err("bad forward"))?),
                    "remoteforward" => config
                        .remote_forwards
                        .push(Forward::parse(value).ok_or_else(|| err("bad forward"))?),
                    "forwardfilter" => {
                        let mut it = value.split_whitespace();
                        match (it.next().map(|p| p.parse::<u16>()), it.next(), it.next()) {
                            (Some(Ok(port)), Some(name), None) => filters.push((port, name.to_string())),
                            _ => return Err(err("bad filter")),
                        }
                    }
                    key => {
                        debug!("{:?}", key);
                    }
                }
            } else if lower == "host" && matches(value, host) {
                config = Some(Config::default())
            }
        }
    }
    let mut config = config.ok_or(Error::HostNotFound)?;
    for (port, name) in filters {
        let mut found = false;
        for forward in config
            .local_forwards
            .iter_mut()
            .chain(config.remote_forwards.iter_mut())
            .filter(|f| f.bind_port == port)
        {
            forward.filter = Some(name.clone());
            found = true
        }
        if !found {
            warn!("filter {:?} on port {}, which is not forwarded", name, port)
        }
    }
    Ok(config)
}
