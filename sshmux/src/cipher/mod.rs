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
//! Block ciphers in ECB, CBC, CFB and OFB modes.
//!
//! A [`BlockCipherEngine`] turns a raw [`BlockCipher`] primitive into a
//! transform over arbitrary buffers, keeping the running register (IV)
//! from one call to the next. One engine serves one direction of one
//! session, and must not be shared.

use crate::Error;

mod modes;
mod primitive;

pub use self::primitive::OpenSslBlock;

/// A raw block primitive: encrypts or decrypts exactly one block.
pub trait BlockCipher: Send {
    /// Block size in bytes.
    fn block_size(&self) -> usize;
    /// Encrypt `input` (one block) into `output` (one block).
    fn encrypt_block(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), Error>;
    /// Decrypt `input` (one block) into `output` (one block).
    fn decrypt_block(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), Error>;
}

/// Feedback mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Mode {
    Ecb,
    Cbc,
    Cfb,
    Ofb,
}

impl Mode {
    /// Block modes only process whole blocks; stream modes process
    /// any length.
    fn needs_whole_blocks(self) -> bool {
        match self {
            Mode::Ecb | Mode::Cbc => true,
            Mode::Cfb | Mode::Ofb => false,
        }
    }

    fn function(self, direction: Direction) -> modes::ModeFn {
        match (self, direction) {
            (Mode::Ecb, Direction::Encrypt) => modes::ecb_encrypt,
            (Mode::Ecb, Direction::Decrypt) => modes::ecb_decrypt,
            (Mode::Cbc, Direction::Encrypt) => modes::cbc_encrypt,
            (Mode::Cbc, Direction::Decrypt) => modes::cbc_decrypt,
            (Mode::Cfb, Direction::Encrypt) => modes::cfb_encrypt,
            (Mode::Cfb, Direction::Decrypt) => modes::cfb_decrypt,
            (Mode::Ofb, _) => modes::ofb,
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "ecb" => Ok(Mode::Ecb),
            "cbc" => Ok(Mode::Cbc),
            "cfb" => Ok(Mode::Cfb),
            "ofb" => Ok(Mode::Ofb),
            _ => Err(Error::UnknownCipher(s.to_string())),
        }
    }
}

/// Padding scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// The caller provides whole blocks (for ECB and CBC).
    None,
    /// Pad with `n` bytes of value `n`. A whole block of padding is
    /// added when the input is already aligned.
    Pkcs5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// A block cipher together with its mode, padding, direction and
/// running register.
pub struct BlockCipherEngine {
    primitive: Box<dyn BlockCipher>,
    mode: Mode,
    padding: Padding,
    direction: Direction,
    iv: Vec<u8>,
    transform: modes::ModeFn,
}

impl std::fmt::Debug for BlockCipherEngine {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        fmt.debug_struct("BlockCipherEngine")
            .field("mode", &self.mode)
            .field("padding", &self.padding)
            .field("direction", &self.direction)
            .field("block_size", &self.primitive.block_size())
            .finish()
    }
}

impl BlockCipherEngine {
    /// Create an engine. An empty `iv` means an all-zero register.
    pub fn new(
        primitive: Box<dyn BlockCipher>,
        mode: Mode,
        padding: Padding,
        direction: Direction,
        iv: &[u8],
    ) -> Result<Self, Error> {
        let bs = primitive.block_size();
        let iv = if iv.is_empty() {
            vec![0; bs]
        } else if iv.len() == bs {
            iv.to_vec()
        } else {
            return Err(Error::InvalidKeyLength);
        };
        Ok(BlockCipherEngine {
            primitive,
            mode,
            padding,
            direction,
            iv,
            transform: mode.function(direction),
        })
    }

    /// Block size of the underlying primitive.
    pub fn block_size(&self) -> usize {
        self.primitive.block_size()
    }

    /// The mode of this engine.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The running register.
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Start over with a new register.
    pub fn reset(&mut self, iv: &[u8]) -> Result<(), Error> {
        if iv.len() != self.iv.len() {
            return Err(Error::InvalidKeyLength);
        }
        self.iv.copy_from_slice(iv);
        Ok(())
    }

    /// Size of the output for an input of `input_len` bytes. Without
    /// padding, this is rounded up to the block size only when not
    /// already aligned; with PKCS5, it always grows to the next multiple.
    pub fn output_size(&self, input_len: usize) -> usize {
        let bs = self.block_size();
        let rest = input_len % bs;
        if rest > 0 || self.padding == Padding::Pkcs5 {
            input_len + (bs - rest)
        } else {
            input_len
        }
    }

    /// Encrypt or decrypt `input`, continuing from the current register.
    pub fn transform(&mut self, input: &[u8]) -> Result<Vec<u8>, Error> {
        let bs = self.block_size();
        match self.direction {
            Direction::Encrypt => {
                let mut padded;
                let input = if self.padding == Padding::Pkcs5 {
                    let pad = bs - (input.len() % bs);
                    padded = Vec::with_capacity(input.len() + pad);
                    padded.extend_from_slice(input);
                    padded.resize(input.len() + pad, pad as u8);
                    &padded[..]
                } else {
                    input
                };
                if self.mode.needs_whole_blocks() && input.len() % bs != 0 {
                    return Err(Error::InvalidBlockLength);
                }
                let mut output = vec![0; input.len()];
                (self.transform)(&mut *self.primitive, &mut self.iv, input, &mut output)?;
                Ok(output)
            }
            Direction::Decrypt => {
                if (self.mode.needs_whole_blocks() || self.padding == Padding::Pkcs5)
                    && input.len() % bs != 0
                {
                    return Err(Error::InvalidBlockLength);
                }
                let mut output = vec![0; input.len()];
                (self.transform)(&mut *self.primitive, &mut self.iv, input, &mut output)?;
                if self.padding == Padding::Pkcs5 {
                    let len = unpadded_len(&output, bs)?;
                    output.truncate(len);
                }
                Ok(output)
            }
        }
    }
}

fn unpadded_len(output: &[u8], bs: usize) -> Result<usize, Error> {
    let pad = *output.last().ok_or(Error::InvalidPadding)? as usize;
    if pad == 0 || pad > bs || pad > output.len() {
        return Err(Error::InvalidPadding);
    }
    if output[output.len() - pad..].iter().any(|&b| b as usize != pad) {
        return Err(Error::InvalidPadding);
    }
    Ok(output.len() - pad)
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
/// The name of a cipher, as negotiated by the transport.
pub struct Name(&'static str);
impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

/// A named cipher: a primitive and a mode.
pub struct Cipher {
    /// Negotiated name.
    pub name: Name,
    /// Key length in bytes.
    pub key_len: usize,
    /// Block (and IV) length in bytes.
    pub block_size: usize,
    /// Feedback mode.
    pub mode: Mode,
    /// Key schedule.
    pub make_primitive: fn(key: &[u8]) -> Result<Box<dyn BlockCipher>, Error>,
}

impl Cipher {
    /// Create an engine for one direction. The transport does its own
    /// packet padding, hence no padding here.
    pub fn make_engine(&self, key: &[u8], iv: &[u8], direction: Direction) -> Result<BlockCipherEngine, Error> {
        if key.len() < self.key_len || iv.len() < self.block_size {
            return Err(Error::InvalidKeyLength);
        }
        let primitive = (self.make_primitive)(&key[..self.key_len])?;
        BlockCipherEngine::new(primitive, self.mode, Padding::None, direction, &iv[..self.block_size])
    }
}

macro_rules! cipher {
    ($id:ident, $name:expr, $key_len:expr, $block_size:expr, $mode:expr, $make:path) => {
        #[allow(missing_docs)]
        pub static $id: Cipher = Cipher {
            name: Name($name),
            key_len: $key_len,
            block_size: $block_size,
            mode: $mode,
            make_primitive: $make,
        };
    };
}

cipher!(AES128_CBC, "aes128-cbc", 16, 16, Mode::Cbc, primitive::aes128);
cipher!(AES192_CBC, "aes192-cbc", 24, 16, Mode::Cbc, primitive::aes192);
cipher!(AES256_CBC, "aes256-cbc", 32, 16, Mode::Cbc, primitive::aes256);
cipher!(TRIPLEDES_CBC, "3des-cbc", 24, 8, Mode::Cbc, primitive::tripledes);
cipher!(AES128_CFB, "aes128-cfb", 16, 16, Mode::Cfb, primitive::aes128);
cipher!(AES128_OFB, "aes128-ofb", 16, 16, Mode::Ofb, primitive::aes128);
cipher!(AES128_ECB, "aes128-ecb", 16, 16, Mode::Ecb, primitive::aes128);

/// All ciphers, in order of preference.
pub static CIPHERS: &[&Cipher] = &[
    &AES128_CBC,
    &AES192_CBC,
    &AES256_CBC,
    &TRIPLEDES_CBC,
    &AES128_CFB,
    &AES128_OFB,
    &AES128_ECB,
];

/// Look a cipher up by name.
pub fn by_name(name: &str) -> Result<&'static Cipher, Error> {
    CIPHERS
        .iter()
        .find(|c| c.name.as_ref() == name)
        .copied()
        .ok_or_else(|| Error::UnknownCipher(name.to_string()))
}

/// Both directions of a transport session.
#[derive(Debug)]
pub struct CipherPair {
    /// Encrypts what this side sends.
    pub local_to_remote: BlockCipherEngine,
    /// Decrypts what the remote side sends.
    pub remote_to_local: BlockCipherEngine,
}

impl CipherPair {
    /// Set up both directions of `cipher` from the keys and IVs derived
    /// by the key exchange.
    pub fn new(
        cipher: &Cipher,
        local_key: &[u8],
        local_iv: &[u8],
        remote_key: &[u8],
        remote_iv: &[u8],
    ) -> Result<Self, Error> {
        Ok(CipherPair {
            local_to_remote: cipher.make_engine(local_key, local_iv, Direction::Encrypt)?,
            remote_to_local: cipher.make_engine(remote_key, remote_iv, Direction::Decrypt)?,
        })
    }

    /// Encrypt an outgoing record.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        self.local_to_remote.transform(plaintext)
    }

    /// Decrypt an incoming record.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        self.remote_to_local.transform(ciphertext)
    }
}
