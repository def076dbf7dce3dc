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
//! Filters rewriting the bytes of forwarded connections, for protocols
//! that carry addresses in-band (FTP, X11 authentication).
//!
//! A filter sees the bytes of one direction of one channel, in order.
//! The *input* filter of a [`FilterPair`] sees the bytes read from the
//! local socket, before they are sent to the remote side; the *output*
//! filter sees the bytes received from the remote side, before they are
//! written to the local socket.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::channel::ChannelInfo;
use crate::connection::Connection;
use crate::Error;

pub mod ftp;
pub mod x11;

/// One direction of a filtered stream.
#[async_trait]
pub trait StreamFilter: Send {
    /// Rewrite `data`. The result may be empty, if the filter needs more
    /// data before deciding anything.
    async fn filter(&mut self, data: Bytes) -> Result<Bytes, Error>;

    /// The end of the stream was reached: return whatever is still
    /// buffered.
    fn finish(&mut self) -> Bytes {
        Bytes::new()
    }

    /// The channel is going away.
    async fn close(&mut self) {}
}

/// The filters of both directions of a channel.
#[derive(Default)]
pub struct FilterPair {
    /// Local socket to remote side.
    pub input: Option<Box<dyn StreamFilter>>,
    /// Remote side to local socket.
    pub output: Option<Box<dyn StreamFilter>>,
}

/// Creates the filters of each new channel of a forward.
pub trait FilterFactory: Send + Sync {
    #[allow(missing_docs)]
    fn create_filter(&self, connection: &Connection, channel: &ChannelInfo) -> FilterPair;
}

/// Filter factories, by name.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    factories: HashMap<String, Arc<dyn FilterFactory>>,
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        fmt.debug_set().entries(self.names()).finish()
    }
}

impl FilterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the filters of this crate: `"ftp"`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("ftp", Arc::new(ftp::FtpProxyFilter::new()));
        registry
    }

    /// Register `factory` under `name`, replacing any previous one.
    pub fn register(&mut self, name: &str, factory: Arc<dyn FilterFactory>) {
        self.factories.insert(name.to_lowercase(), factory);
    }

    /// Names are case-insensitive.
    pub fn get(&self, name: &str) -> Option<Arc<dyn FilterFactory>> {
        self.factories.get(&name.to_lowercase()).cloned()
    }

    #[allow(missing_docs)]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.factories.keys().map(|k| k.as_str()).collect();
        names.sort();
        names
    }
}

/// Longest incomplete line a [`LineBuffer`] holds on to.
pub const MAX_LINE_LENGTH: usize = 4096;

/// What a [`LineBuffer`] gives back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// A complete line, with its line ending.
    Line(Vec<u8>),
    /// Part of a line longer than [`MAX_LINE_LENGTH`], to be forwarded
    /// as is.
    Verbatim(Vec<u8>),
}

/// Cuts a byte stream into lines. Incomplete lines are kept until the
/// rest arrives, up to [`MAX_LINE_LENGTH`] bytes.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
    /// Inside a line that went past the limit.
    overlong: bool,
}

impl LineBuffer {
    /// Append `data`, and return the lines it completes, with their
    /// line endings.
    pub fn push(&mut self, mut data: &[u8]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        if self.overlong {
            let end = match data.iter().position(|&c| c == b'\n') {
                Some(i) => {
                    self.overlong = false;
                    i + 1
                }
                None => data.len(),
            };
            if end > 0 {
                chunks.push(Chunk::Verbatim(data[..end].to_vec()));
            }
            data = &data[end..];
        }
        self.partial.extend_from_slice(data);
        while let Some(i) = self.partial.iter().position(|&c| c == b'\n') {
            let rest = self.partial.split_off(i + 1);
            chunks.push(Chunk::Line(std::mem::replace(&mut self.partial, rest)));
        }
        if self.partial.len() > MAX_LINE_LENGTH {
            self.overlong = true;
            chunks.push(Chunk::Verbatim(std::mem::take(&mut self.partial)));
        }
        chunks
    }

    /// The incomplete line, if any.
    pub fn take_rest(&mut self) -> Vec<u8> {
        self.overlong = false;
        std::mem::take(&mut self.partial)
    }
}

/// Split a line into its content and its ending (`\r\n`, `\n` or
/// nothing).
pub(crate) fn split_line_ending(line: &[u8]) -> (&[u8], &[u8]) {
    let n = if line.ends_with(b"\r\n") {
        2
    } else if line.ends_with(b"\n") {
        1
    } else {
        0
    };
    line.split_at(line.len() - n)
}
