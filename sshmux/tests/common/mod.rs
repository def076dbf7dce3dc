#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ByteOrder};
use sshmux::channel::ChannelInfo;
use sshmux::connector::OpenRequest;
use sshmux::filter::FilterRegistry;
use sshmux::{ChannelId, Config, Connection, CryptoVec, Error, Handler};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const GLOBAL_REQUEST: u8 = 80;
pub const CHANNEL_OPEN: u8 = 90;
pub const CHANNEL_OPEN_CONFIRMATION: u8 = 91;
pub const CHANNEL_OPEN_FAILURE: u8 = 92;
pub const CHANNEL_WINDOW_ADJUST: u8 = 93;
pub const CHANNEL_DATA: u8 = 94;
pub const CHANNEL_EOF: u8 = 96;
pub const CHANNEL_CLOSE: u8 = 97;

pub fn init() {
    let _ = env_logger::try_init();
}

/// Records the events it is given.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
    fn push(&self, e: String) {
        self.events.lock().unwrap().push(e)
    }
}

impl Handler for Recorder {
    fn channel_added(&self, _: &Connection, channel: ChannelId) {
        self.push(format!("added {}", channel))
    }
    fn channel_closed(&self, _: &Connection, channel: ChannelId) {
        self.push(format!("closed {}", channel))
    }
    fn remote_direct_connect(&self, _: &Connection, channel: &ChannelInfo) {
        self.push(format!("direct {}:{}", channel.target_host, channel.target_port))
    }
    fn remote_forwarded_connect(&self, _: &Connection, addr: &str, port: u32, _: &ChannelInfo) {
        self.push(format!("forwarded {}:{}", addr, port))
    }
    fn remote_channel_open_failure(&self, _: &Connection, request: &OpenRequest, error: &Error) {
        self.push(format!("refused {}: {}", request.channel_type.name(), error))
    }
}

/// Message type and recipient channel of every message seen.
pub type Tap = Arc<Mutex<Vec<(u8, u32)>>>;

/// Forward the payloads of `from`, recording them in `tap`.
pub fn relay(mut from: mpsc::UnboundedReceiver<CryptoVec>, tap: Tap) -> mpsc::UnboundedReceiver<CryptoVec> {
    let (sender, receiver) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(packet) = from.recv().await {
            let recipient = if packet.len() >= 5 {
                BigEndian::read_u32(&packet[1..5])
            } else {
                0
            };
            tap.lock().unwrap().push((packet[0], recipient));
            if sender.send(packet).is_err() {
                break;
            }
        }
    });
    receiver
}

/// Two connections talking to each other, `a` and `b`.
pub struct Pair {
    pub a: Connection,
    pub b: Connection,
    pub a_run: JoinHandle<Result<(), Error>>,
    pub b_run: JoinHandle<Result<(), Error>>,
    pub b_events: Arc<Recorder>,
    /// Messages from `b` to `a`.
    pub b_to_a: Tap,
}

pub fn pair_with(a_config: Config, b_config: Config) -> Pair {
    init();
    let b_events = Arc::new(Recorder::default());
    let (a, a_out) = Connection::new(Arc::new(a_config), Arc::new(()), FilterRegistry::with_defaults());
    let (b, b_out) = Connection::new(Arc::new(b_config), b_events.clone(), FilterRegistry::with_defaults());
    let b_to_a = Tap::default();
    let a_in = relay(b_out, b_to_a.clone());
    let b_in = relay(a_out, Tap::default());
    let a_run = {
        let a = a.clone();
        tokio::spawn(async move { a.run(a_in).await })
    };
    let b_run = {
        let b = b.clone();
        tokio::spawn(async move { b.run(b_in).await })
    };
    Pair {
        a,
        b,
        a_run,
        b_run,
        b_events,
        b_to_a,
    }
}

pub fn pair() -> Pair {
    pair_with(Config::default(), Config::default())
}

/// One connection, whose remote side is played by the test.
pub fn single(config: Config) -> (Connection, mpsc::UnboundedReceiver<CryptoVec>, Arc<Recorder>) {
    init();
    let events = Arc::new(Recorder::default());
    let (c, out) = Connection::new(Arc::new(config), events.clone(), FilterRegistry::with_defaults());
    (c, out, events)
}

pub fn push_string(buf: &mut CryptoVec, s: &[u8]) {
    buf.push_u32_be(s.len() as u32);
    buf.extend(s);
}

pub fn open_message(typ: &str, peer_id: u32, window: u32, max_packet: u32, fields: &[(&str, u32)]) -> CryptoVec {
    let mut buf = CryptoVec::new();
    buf.push(CHANNEL_OPEN);
    push_string(&mut buf, typ.as_bytes());
    buf.push_u32_be(peer_id);
    buf.push_u32_be(window);
    buf.push_u32_be(max_packet);
    for &(s, n) in fields {
        push_string(&mut buf, s.as_bytes());
        buf.push_u32_be(n);
    }
    buf
}

/// Reads SSH-encoded fields.
pub struct Fields<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Fields { buf, pos: 1 }
    }
    pub fn u32(&mut self) -> u32 {
        let x = BigEndian::read_u32(&self.buf[self.pos..]);
        self.pos += 4;
        x
    }
    pub fn string(&mut self) -> &'a [u8] {
        let len = self.u32() as usize;
        let s = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        s
    }
    pub fn str(&mut self) -> &'a str {
        std::str::from_utf8(self.string()).unwrap()
    }
    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

/// A server writing `banner` to every connection, then echoing.
pub async fn echo_server(banner: &'static [u8]) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.into_split();
                if tokio::io::AsyncWriteExt::write_all(&mut w, banner).await.is_ok() {
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                }
            });
        }
    });
    port
}

pub async fn read_line(stream: &mut TcpStream) -> String {
    let mut line = Vec::new();
    loop {
        let c = stream.read_u8().await.unwrap();
        line.push(c);
        if c == b'\n' {
            return String::from_utf8(line).unwrap();
        }
    }
}

/// Parse `h1,h2,h3,h4,p1,p2`.
pub fn host_port(s: &str) -> ([u8; 4], u16) {
    let f: Vec<u8> = s.split(',').map(|x| x.trim().parse().unwrap()).collect();
    assert_eq!(f.len(), 6, "{:?}", s);
    ([f[0], f[1], f[2], f[3]], u16::from(f[4]) << 8 | u16::from(f[5]))
}
