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
//! Feedback modes over a raw block primitive.
//!
//! Each function processes `input` into `output` (of the same length)
//! and updates the running register `iv` in place, so that the next
//! call continues the same stream.

use super::BlockCipher;
use crate::Error;

/// A mode, in one direction.
pub(super) type ModeFn =
    fn(&mut dyn BlockCipher, &mut [u8], &[u8], &mut [u8]) -> Result<(), Error>;

pub(super) fn ecb_encrypt(
    cipher: &mut dyn BlockCipher,
    _iv: &mut [u8],
    input: &[u8],
    output: &mut [u8],
) -> Result<(), Error> {
    let bs = cipher.block_size();
    for (i, o) in input.chunks(bs).zip(output.chunks_mut(bs)) {
        cipher.encrypt_block(i, o)?
    }
    Ok(())
}

pub(super) fn ecb_decrypt(
    cipher: &mut dyn BlockCipher,
    _iv: &mut [u8],
    input: &[u8],
    output: &mut [u8],
) -> Result<(), Error> {
    let bs = cipher.block_size();
    for (i, o) in input.chunks(bs).zip(output.chunks_mut(bs)) {
        cipher.decrypt_block(i, o)?
    }
    Ok(())
}

pub(super) fn cbc_encrypt(
    cipher: &mut dyn BlockCipher,
    iv: &mut [u8],
    input: &[u8],
    output: &mut [u8],
) -> Result<(), Error> {
    let bs = cipher.block_size();
    for (i, o) in input.chunks(bs).zip(output.chunks_mut(bs)) {
        xor(iv, i);
        cipher.encrypt_block(iv, o)?;
        iv.copy_from_slice(o);
    }
    Ok(())
}

pub(super) fn cbc_decrypt(
    cipher: &mut dyn BlockCipher,
    iv: &mut [u8],
    input: &[u8],
    output: &mut [u8],
) -> Result<(), Error> {
    let bs = cipher.block_size();
    for (i, o) in input.chunks(bs).zip(output.chunks_mut(bs)) {
        cipher.decrypt_block(i, o)?;
        xor(o, iv);
        // The register takes the ciphertext, not the plaintext.
        iv.copy_from_slice(i);
    }
    Ok(())
}

pub(super) fn cfb_encrypt(
    cipher: &mut dyn BlockCipher,
    iv: &mut [u8],
    input: &[u8],
    output: &mut [u8],
) -> Result<(), Error> {
    let bs = cipher.block_size();
    let mut keystream = vec![0; bs];
    for (i, o) in input.chunks(bs).zip(output.chunks_mut(bs)) {
        cipher.encrypt_block(iv, &mut keystream)?;
        iv.copy_from_slice(&keystream);
        let n = i.len();
        xor(&mut iv[..n], i);
        o.copy_from_slice(&iv[..n]);
    }
    Ok(())
}

pub(super) fn cfb_decrypt(
    cipher: &mut dyn BlockCipher,
    iv: &mut [u8],
    input: &[u8],
    output: &mut [u8],
) -> Result<(), Error> {
    let bs = cipher.block_size();
    let mut keystream = vec![0; bs];
    for (i, o) in input.chunks(bs).zip(output.chunks_mut(bs)) {
        cipher.encrypt_block(iv, &mut keystream)?;
        let n = i.len();
        // Same register as the encrypting side, including after a
        // short final segment.
        iv.copy_from_slice(&keystream);
        iv[..n].copy_from_slice(i);
        o.copy_from_slice(&keystream[..n]);
        xor(o, i);
    }
    Ok(())
}

/// OFB is its own inverse.
pub(super) fn ofb(
    cipher: &mut dyn BlockCipher,
    iv: &mut [u8],
    input: &[u8],
    output: &mut [u8],
) -> Result<(), Error> {
    let bs = cipher.block_size();
    let mut keystream = vec![0; bs];
    for (i, o) in input.chunks(bs).zip(output.chunks_mut(bs)) {
        cipher.encrypt_block(iv, &mut keystream)?;
        // Never truncated, even if only part of it is used.
        iv.copy_from_slice(&keystream);
        o.copy_from_slice(i);
        xor(o, &keystream[..i.len()]);
    }
    Ok(())
}

fn xor(dest: &mut [u8], src: &[u8]) {
    for (d, s) in dest.iter_mut().zip(src) {
        *d ^= *s
    }
}
