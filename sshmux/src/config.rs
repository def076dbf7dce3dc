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
use std::time::Duration;

/// Configuration of a connection.
#[derive(Debug, Clone)]
pub struct Config {
    /// Initial window size advertised for the channels this side accepts or opens.
    pub window_size: u32,
    /// Maximal size of a data packet this side accepts.
    pub maximum_packet_size: u32,
    /// Maximal number of simultaneously open channels.
    pub maximum_channels: usize,
    /// Time allowed for connecting the local end of a channel, or for
    /// the remote side to confirm a channel we open. `None` waits forever.
    pub connect_timeout: Option<Duration>,
    /// Time allowed for the remote side to answer a forwarding request.
    pub forward_reply_timeout: Duration,
    /// Number of random ports tried when rewriting an FTP `PORT` command.
    pub port_retry_limit: usize,
    /// Host of the local X server, for X11 channels.
    pub x11_display_host: String,
    /// Port of the local X server, for X11 channels.
    pub x11_display_port: u16,
    /// Accept `direct-tcpip` channels from the remote side.
    pub allow_direct_tcpip: bool,
    /// Honour `tcpip-forward` requests from the remote side.
    pub allow_remote_forwarding: bool,
    /// The remote side does not understand the description and
    /// language tag of channel open failures (some old servers).
    pub incompatible_channel_open_failure: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            window_size: 2097152,
            maximum_packet_size: 32768,
            maximum_channels: 1024,
            connect_timeout: Some(Duration::from_secs(10)),
            forward_reply_timeout: Duration::from_secs(5),
            port_retry_limit: 16,
            x11_display_host: "127.0.0.1".to_string(),
            x11_display_port: 6000,
            allow_direct_tcpip: true,
            allow_remote_forwarding: true,
            incompatible_channel_open_failure: false,
        }
    }
}
