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
use openssl::symm::{Cipher, Crypter, Mode};

use super::BlockCipher;
use crate::Error;

/// A raw block primitive backed by OpenSSL, used in ECB mode one
/// block at a time. The feedback modes are handled by this crate.
pub struct OpenSslBlock {
    encrypter: Crypter,
    decrypter: Crypter,
    block_size: usize,
    scratch: Vec<u8>,
}

impl OpenSslBlock {
    /// Schedule `key` for `cipher`, which must be an ECB cipher.
    pub fn new(cipher: Cipher, key: &[u8]) -> Result<Self, Error> {
        if key.len() != cipher.key_len() {
            return Err(Error::InvalidKeyLength);
        }
        let mut encrypter = Crypter::new(cipher, Mode::Encrypt, key, None)?;
        encrypter.pad(false);
        let mut decrypter = Crypter::new(cipher, Mode::Decrypt, key, None)?;
        decrypter.pad(false);
        let block_size = cipher.block_size();
        Ok(OpenSslBlock {
            encrypter,
            decrypter,
            block_size,
            scratch: vec![0; 2 * block_size],
        })
    }

    fn run(crypter: &mut Crypter, scratch: &mut [u8], input: &[u8], output: &mut [u8]) -> Result<(), Error> {
        let n = crypter.update(input, scratch)?;
        if n != output.len() {
            return Err(Error::InvalidBlockLength);
        }
        output.copy_from_slice(&scratch[..n]);
        Ok(())
    }
}

impl BlockCipher for OpenSslBlock {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn encrypt_block(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), Error> {
        Self::run(&mut self.encrypter, &mut self.scratch, input, output)
    }

    fn decrypt_block(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), Error> {
        Self::run(&mut self.decrypter, &mut self.scratch, input, output)
    }
}

pub(super) fn aes128(key: &[u8]) -> Result<Box<dyn BlockCipher>, Error> {
    Ok(Box::new(OpenSslBlock::new(Cipher::aes_128_ecb(), key)?))
}

pub(super) fn aes192(key: &[u8]) -> Result<Box<dyn BlockCipher>, Error> {
    Ok(Box::new(OpenSslBlock::new(Cipher::aes_192_ecb(), key)?))
}

pub(super) fn aes256(key: &[u8]) -> Result<Box<dyn BlockCipher>, Error> {
    Ok(Box::new(OpenSslBlock::new(Cipher::aes_256_ecb(), key)?))
}

pub(super) fn tripledes(key: &[u8]) -> Result<Box<dyn BlockCipher>, Error> {
    Ok(Box::new(OpenSslBlock::new(Cipher::des_ede3(), key)?))
}
