// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
//! FTP through a tunnel.
//!
//! FTP data connections are separate TCP connections, whose addresses
//! are sent in-band on the control connection. This filter, installed
//! on a forwarded control connection, makes them go through the tunnel
//! too:
//!
//! - in active mode, the client sends `PORT h1,h2,h3,h4,p1,p2`, asking
//!   the server to connect back to it. We ask the remote side to listen
//!   on a random port, forwarding connections to the client's address,
//!   and tell the server to connect to that port on its own host.
//!
//! - in passive mode, the server answers `PASV` with `227 Entering
//!   Passive Mode (h1,h2,h3,h4,p1,p2)`. We listen on a local port
//!   for exactly one connection, forwarded to the server's address, and
//!   give that port to the client instead.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{split_line_ending, Chunk, FilterFactory, FilterPair, LineBuffer, StreamFilter};
use crate::channel::ChannelInfo;
use crate::connection::{Connection, WeakConnection};
use crate::Error;

/// The factory of FTP filters, registered as `"ftp"`.
#[derive(Debug, Clone)]
pub struct FtpProxyFilter {
    public_addr: Ipv4Addr,
    local_host: String,
    server_local_addr: String,
}

impl Default for FtpProxyFilter {
    fn default() -> Self {
        FtpProxyFilter {
            public_addr: Ipv4Addr::new(127, 0, 0, 1),
            local_host: "127.0.0.1".to_string(),
            server_local_addr: "0.0.0.0".to_string(),
        }
    }
}

impl FtpProxyFilter {
    /// Passive listeners on 127.0.0.1, remote listeners on all
    /// interfaces of the remote host.
    pub fn new() -> Self {
        Self::default()
    }

    /// The address given to clients in rewritten `227` replies.
    pub fn with_public_addr(mut self, addr: Ipv4Addr) -> Self {
        self.public_addr = addr;
        self
    }

    /// The address passive listeners are bound to.
    pub fn with_local_host(mut self, host: &str) -> Self {
        self.local_host = host.to_string();
        self
    }

    /// The address the remote side binds for active mode connections.
    pub fn with_server_local_addr(mut self, addr: &str) -> Self {
        self.server_local_addr = addr.to_string();
        self
    }
}

impl FilterFactory for FtpProxyFilter {
    fn create_filter(&self, connection: &Connection, channel: &ChannelInfo) -> FilterPair {
        debug!("channel {}: ftp filter", channel.id);
        let state = Arc::new(FtpState::default());
        FilterPair {
            input: Some(Box::new(FtpCommands {
                connection: connection.downgrade(),
                state: state.clone(),
                lines: LineBuffer::default(),
                server_local_addr: self.server_local_addr.clone(),
                port_retry_limit: connection.config().port_retry_limit,
                rng: StdRng::from_entropy(),
            })),
            output: Some(Box::new(FtpReplies {
                connection: connection.downgrade(),
                state,
                lines: LineBuffer::default(),
                local_host: self.local_host.clone(),
                public_addr: self.public_addr,
            })),
        }
    }
}

/// Shared by both directions of a control connection.
#[derive(Debug, Default)]
struct FtpState {
    awaiting_passive_response: AtomicBool,
    last_bound_port: Mutex<Option<u16>>,
}

struct FtpCommands {
    connection: WeakConnection,
    state: Arc<FtpState>,
    lines: LineBuffer,
    server_local_addr: String,
    port_retry_limit: usize,
    rng: StdRng,
}

#[async_trait]
impl StreamFilter for FtpCommands {
    async fn filter(&mut self, data: Bytes) -> Result<Bytes, Error> {
        let mut out = Vec::with_capacity(data.len());
        for chunk in self.lines.push(&data) {
            match chunk {
                Chunk::Line(line) => out.extend_from_slice(&self.command(line).await),
                Chunk::Verbatim(bytes) => out.extend_from_slice(&bytes),
            }
        }
        Ok(Bytes::from(out))
    }

    fn finish(&mut self) -> Bytes {
        Bytes::from(self.lines.take_rest())
    }

    async fn close(&mut self) {
        let port = self.state.last_bound_port.lock().unwrap().take();
        if let (Some(port), Some(connection)) = (port, self.connection.upgrade()) {
            connection.delete_remote_forward(&self.server_local_addr, u32::from(port));
        }
    }
}

impl FtpCommands {
    async fn command(&mut self, line: Vec<u8>) -> Vec<u8> {
        let (content, ending) = split_line_ending(&line);
        let keyword = content.split(|&c| c == b' ').next().unwrap_or(&[]);
        if keyword.eq_ignore_ascii_case(b"PASV") {
            debug!("passive mode requested");
            self.state.awaiting_passive_response.store(true, Ordering::SeqCst);
        } else if keyword.eq_ignore_ascii_case(b"PORT") {
            match self.rewrite_port(content).await {
                Ok(mut rewritten) => {
                    rewritten.extend_from_slice(ending);
                    return rewritten;
                }
                Err(e) => warn!("{}, passing PORT through", e),
            }
        }
        line
    }

    async fn rewrite_port(&mut self, content: &[u8]) -> Result<Vec<u8>, Error> {
        let (host, port) = std::str::from_utf8(&content[4..])
            .ok()
            .and_then(parse_host_port)
            .ok_or_else(|| Error::FilterRewrite(String::from_utf8_lossy(content).into_owned()))?;
        let connection = self.connection.upgrade().ok_or(Error::Disconnect)?;
        let previous = self.state.last_bound_port.lock().unwrap().take();
        if let Some(previous) = previous {
            connection.delete_remote_forward(&self.server_local_addr, u32::from(previous));
        }
        for _ in 0..self.port_retry_limit {
            let candidate: u16 = self.rng.gen_range(1024..=65535);
            if connection
                .new_remote_forward_blocking(
                    &self.server_local_addr,
                    u32::from(candidate),
                    &host,
                    u32::from(port),
                    None,
                )
                .await
            {
                debug!("active mode: {}:{} through remote port {}", host, port, candidate);
                *self.state.last_bound_port.lock().unwrap() = Some(candidate);
                return Ok(format!("PORT 127,0,0,1,{},{}", candidate >> 8, candidate & 0xff).into_bytes());
            }
        }
        Err(Error::FilterRewrite(format!(
            "PORT {}:{}: no remote port after {} attempts",
            host, port, self.port_retry_limit
        )))
    }
}

struct FtpReplies {
    connection: WeakConnection,
    state: Arc<FtpState>,
    lines: LineBuffer,
    local_host: String,
    public_addr: Ipv4Addr,
}

#[async_trait]
impl StreamFilter for FtpReplies {
    async fn filter(&mut self, data: Bytes) -> Result<Bytes, Error> {
        let mut out = Vec::with_capacity(data.len());
        for chunk in self.lines.push(&data) {
            match chunk {
                Chunk::Line(line) => out.extend_from_slice(&self.reply(line).await),
                Chunk::Verbatim(bytes) => out.extend_from_slice(&bytes),
            }
        }
        Ok(Bytes::from(out))
    }

    fn finish(&mut self) -> Bytes {
        Bytes::from(self.lines.take_rest())
    }
}

impl FtpReplies {
    async fn reply(&mut self, line: Vec<u8>) -> Vec<u8> {
        if !self.state.awaiting_passive_response.load(Ordering::SeqCst) || !line.starts_with(b"227 ") {
            return line;
        }
        let (content, ending) = split_line_ending(&line);
        match self.rewrite_passive(content).await {
            Ok(mut rewritten) => {
                rewritten.extend_from_slice(ending);
                rewritten
            }
            Err(e) => {
                warn!("{}, passing reply through", e);
                line
            }
        }
    }

    async fn rewrite_passive(&mut self, content: &[u8]) -> Result<Vec<u8>, Error> {
        let (host, port) = parse_passive_reply(content)
            .ok_or_else(|| Error::FilterRewrite(String::from_utf8_lossy(content).into_owned()))?;
        self.state.awaiting_passive_response.store(false, Ordering::SeqCst);
        let connection = self.connection.upgrade().ok_or(Error::Disconnect)?;
        let listener = connection
            .new_local_forward(&self.local_host, 0, &host, u32::from(port))
            .await?;
        listener.set_accept_max(1);
        let local_port = listener.listen_port();
        debug!("passive mode: {}:{} through local port {}", host, port, local_port);
        let [a, b, c, d] = self.public_addr.octets();
        Ok(format!(
            "227 Entering Passive Mode ({},{},{},{},{},{})",
            a,
            b,
            c,
            d,
            local_port >> 8,
            local_port & 0xff
        )
        .into_bytes())
    }
}

/// Parse `h1,h2,h3,h4,p1,p2`.
fn parse_host_port(s: &str) -> Option<(String, u16)> {
    let mut fields = [0u8; 6];
    let mut it = s.trim().split(',');
    for field in fields.iter_mut() {
        *field = it.next()?.trim().parse().ok()?;
    }
    if it.next().is_some() {
        return None;
    }
    let host = Ipv4Addr::new(fields[0], fields[1], fields[2], fields[3]);
    Some((host.to_string(), u16::from(fields[4]) << 8 | u16::from(fields[5])))
}

/// Parse the tuple between the parentheses of a `227` reply.
fn parse_passive_reply(content: &[u8]) -> Option<(String, u16)> {
    let text = std::str::from_utf8(content).ok()?;
    let start = text.find('(')? + 1;
    let end = start + text[start..].find(')')?;
    parse_host_port(&text[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port() {
        assert_eq!(
            parse_host_port("192,168,1,2,4,1"),
            Some(("192.168.1.2".to_string(), 1025))
        );
        assert_eq!(parse_host_port(" 10, 0, 0, 1, 255, 255 "), Some(("10.0.0.1".to_string(), 65535)));
        assert_eq!(parse_host_port("10,0,0,1,4"), None);
        assert_eq!(parse_host_port("10,0,0,1,4,1,7"), None);
        assert_eq!(parse_host_port("10,0,0,256,4,1"), None);
        assert_eq!(
            parse_passive_reply(b"227 Entering Passive Mode (10,0,0,5,19,137)."),
            Some(("10.0.0.5".to_string(), 5001))
        );
        assert_eq!(parse_passive_reply(b"227 Entering Passive Mode"), None);
    }

    fn filters() -> (Connection, FilterPair) {
        let (connection, _) = Connection::new(
            Arc::new(crate::Config::default()),
            Arc::new(()),
            super::super::FilterRegistry::new(),
        );
        let info = ChannelInfo {
            id: crate::ChannelId(0),
            peer_id: 0,
            channel_type: "direct-tcpip".to_string(),
            target_host: "ftp.example.com".to_string(),
            target_port: 21,
            origin_host: "127.0.0.1".to_string(),
            origin_port: 40000,
        };
        let pair = FtpProxyFilter::new().create_filter(&connection, &info);
        (connection, pair)
    }

    #[tokio::test]
    async fn unrelated_lines_pass_through() {
        let (_connection, mut pair) = filters();
        let input = pair.input.as_mut().unwrap();
        let output = pair.output.as_mut().unwrap();
        assert_eq!(&input.filter(Bytes::from_static(b"USER anonymous\r\nTY")).await.unwrap()[..], b"USER anonymous\r\n");
        assert_eq!(&input.filter(Bytes::from_static(b"PE I\r\n")).await.unwrap()[..], b"TYPE I\r\n");
        // Not waiting for a passive reply.
        let reply = b"227 Entering Passive Mode (10,0,0,5,19,137)\r\n";
        assert_eq!(&output.filter(Bytes::from_static(reply)).await.unwrap()[..], &reply[..]);
        assert_eq!(&output.filter(Bytes::from_static(b"220 ready")).await.unwrap()[..], b"");
        assert_eq!(&output.finish()[..], b"220 ready");
    }

    #[tokio::test]
    async fn long_lines_are_not_held_back() {
        let (_connection, mut pair) = filters();
        pair.input
            .as_mut()
            .unwrap()
            .filter(Bytes::from_static(b"PASV\r\n"))
            .await
            .unwrap();
        let output = pair.output.as_mut().unwrap();
        let block = Bytes::from(vec![b'x'; 16384]);
        let mut forwarded = 0;
        for _ in 0..64 {
            forwarded += output.filter(block.clone()).await.unwrap().len();
        }
        assert_eq!(forwarded, 64 * 16384);
        // The end of the long line is not taken for a reply.
        let reply = b"227 Entering Passive Mode (10,0,0,5,19,137)\r\n220 ok\r\n";
        assert_eq!(&output.filter(Bytes::from_static(reply)).await.unwrap()[..], &reply[..]);
        assert!(output.finish().is_empty());
    }

    #[tokio::test]
    async fn malformed_port_passes_through() {
        let (_connection, mut pair) = filters();
        let input = pair.input.as_mut().unwrap();
        let line = b"port 1,2,3\r\n";
        assert_eq!(&input.filter(Bytes::from_static(line)).await.unwrap()[..], &line[..]);
    }

    #[tokio::test]
    async fn passive_reply_rewritten_once() {
        let (_connection, mut pair) = filters();
        pair.input
            .as_mut()
            .unwrap()
            .filter(Bytes::from_static(b"pasv\r\n"))
            .await
            .unwrap();
        let output = pair.output.as_mut().unwrap();
        let rewritten = output
            .filter(Bytes::from_static(b"227 Entering Passive Mode (10,0,0,5,19,137).\r\n"))
            .await
            .unwrap();
        let rewritten = std::str::from_utf8(&rewritten).unwrap();
        assert!(rewritten.starts_with("227 Entering Passive Mode (127,0,0,1,"));
        assert!(rewritten.ends_with(")\r\n"));
        let (_, port) = parse_passive_reply(rewritten.trim_end().as_bytes()).unwrap();
        assert_ne!(port, 5001);

        let again = b"227 Entering Passive Mode (10,0,0,5,19,138).\r\n";
        assert_eq!(&output.filter(Bytes::from_static(again)).await.unwrap()[..], &again[..]);
    }
}
