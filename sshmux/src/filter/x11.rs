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
//! X11 forwarding: substitute the real authentication cookie for the
//! fake one given to the remote side.

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::Bytes;
use log::{debug, warn};

use super::StreamFilter;
use crate::Error;

/// Authentication data of forwarded X11 connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X11Mapping {
    /// Usually `MIT-MAGIC-COOKIE-1`.
    pub auth_protocol: String,
    /// The cookie given to the remote side.
    pub fake_cookie: Vec<u8>,
    /// The cookie of the local X server.
    pub real_cookie: Vec<u8>,
}

impl X11Mapping {
    /// A `MIT-MAGIC-COOKIE-1` mapping.
    pub fn new(fake_cookie: &[u8], real_cookie: &[u8]) -> Self {
        X11Mapping {
            auth_protocol: "MIT-MAGIC-COOKIE-1".to_string(),
            fake_cookie: fake_cookie.to_vec(),
            real_cookie: real_cookie.to_vec(),
        }
    }
}

fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

/// Buffers the connection setup of an X11 client, and rewrites its
/// authentication data. Everything after the setup passes through.
pub(crate) struct X11AuthFilter {
    mapping: X11Mapping,
    setup: Option<Vec<u8>>,
}

impl X11AuthFilter {
    pub(crate) fn new(mapping: X11Mapping) -> Self {
        X11AuthFilter {
            mapping,
            setup: Some(Vec::new()),
        }
    }
}

#[async_trait]
impl StreamFilter for X11AuthFilter {
    async fn filter(&mut self, data: Bytes) -> Result<Bytes, Error> {
        let setup = match self.setup {
            Some(ref mut setup) => setup,
            None => return Ok(data),
        };
        setup.extend_from_slice(&data);
        // byte-order, unused, major, minor, name length, data length, unused.
        if setup.len() < 12 {
            return Ok(Bytes::new());
        }
        let big_endian = match setup[0] {
            b'B' => true,
            b'l' => false,
            b => {
                warn!("x11: bad byte order {:?}", b);
                return Err(Error::X11Auth);
            }
        };
        let read_u16 = |b: &[u8]| {
            if big_endian {
                BigEndian::read_u16(b)
            } else {
                LittleEndian::read_u16(b)
            }
        };
        let name_len = read_u16(&setup[6..8]) as usize;
        let data_len = read_u16(&setup[8..10]) as usize;
        let name_start = 12;
        let data_start = name_start + pad4(name_len);
        let end = data_start + pad4(data_len);
        if setup.len() < end {
            return Ok(Bytes::new());
        }
        let name = &setup[name_start..name_start + name_len];
        let cookie = &setup[data_start..data_start + data_len];
        if name != self.mapping.auth_protocol.as_bytes() || cookie != &self.mapping.fake_cookie[..] {
            warn!("x11: authentication cookie mismatch");
            return Err(Error::X11Auth);
        }

        let real = &self.mapping.real_cookie;
        let mut out = Vec::with_capacity(setup.len() - data_len + real.len() + 3);
        out.extend_from_slice(&setup[..data_start]);
        let mut len = [0; 2];
        if big_endian {
            BigEndian::write_u16(&mut len, real.len() as u16)
        } else {
            LittleEndian::write_u16(&mut len, real.len() as u16)
        }
        out[8..10].copy_from_slice(&len);
        out.extend_from_slice(real);
        out.resize(data_start + pad4(real.len()), 0);
        out.extend_from_slice(&setup[end..]);
        self.setup = None;
        debug!("x11: authentication cookie replaced");
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(order: u8, name: &[u8], cookie: &[u8]) -> Vec<u8> {
        let mut v = vec![order, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let (n, d) = (name.len() as u16, cookie.len() as u16);
        if order == b'B' {
            v[2..4].copy_from_slice(&11u16.to_be_bytes());
            v[6..8].copy_from_slice(&n.to_be_bytes());
            v[8..10].copy_from_slice(&d.to_be_bytes());
        } else {
            v[2..4].copy_from_slice(&11u16.to_le_bytes());
            v[6..8].copy_from_slice(&n.to_le_bytes());
            v[8..10].copy_from_slice(&d.to_le_bytes());
        }
        v.extend_from_slice(name);
        v.resize(12 + pad4(name.len()), 0);
        v.extend_from_slice(cookie);
        v.resize(12 + pad4(name.len()) + pad4(cookie.len()), 0);
        v
    }

    #[tokio::test]
    async fn cookie_substituted_in_pieces() {
        let mapping = X11Mapping::new(&[1; 16], &[7; 16]);
        let mut f = X11AuthFilter::new(mapping);
        let mut input = setup(b'l', b"MIT-MAGIC-COOKIE-1", &[1; 16]);
        input.extend_from_slice(b"requests");
        let mut out = Vec::new();
        for chunk in input.chunks(5) {
            out.extend_from_slice(&f.filter(Bytes::copy_from_slice(chunk)).await.unwrap());
        }
        let mut expected = setup(b'l', b"MIT-MAGIC-COOKIE-1", &[7; 16]);
        expected.extend_from_slice(b"requests");
        assert_eq!(out, expected);
        // Later data is not inspected.
        assert_eq!(&f.filter(Bytes::from_static(b"B")).await.unwrap()[..], b"B");
    }

    #[tokio::test]
    async fn cookie_of_another_length() {
        let mapping = X11Mapping::new(b"fake", &[9; 16]);
        let mut f = X11AuthFilter::new(mapping);
        let out = f
            .filter(Bytes::from(setup(b'B', b"MIT-MAGIC-COOKIE-1", b"fake")))
            .await
            .unwrap();
        assert_eq!(&out[..], &setup(b'B', b"MIT-MAGIC-COOKIE-1", &[9; 16])[..]);
    }

    #[tokio::test]
    async fn wrong_cookie() {
        let mut f = X11AuthFilter::new(X11Mapping::new(&[1; 16], &[7; 16]));
        match f.filter(Bytes::from(setup(b'B', b"MIT-MAGIC-COOKIE-1", &[2; 16]))).await {
            Err(Error::X11Auth) => {}
            x => panic!("unexpected {:?}", x),
        }
        let mut f = X11AuthFilter::new(X11Mapping::new(&[1; 16], &[7; 16]));
        assert!(f.filter(Bytes::from_static(b"?nonsense...")).await.is_err());
    }
}
