//! Password encryption for archive streams.
//!
//! The stream is cut into chunks of 64 KiB, each sealed with AES-256-GCM under a
//! key derived from the password with PBKDF2-HMAC-SHA256.
//!
//! ```text
//! header: magic (8) | iterations u32 LE | salt (32) | nonce prefix (7) | verifier (16)
//! chunk:  last flag u8 | sealed length u32 LE | ciphertext + tag
//! ```
//!
//! A chunk nonce is the prefix, the chunk counter (u32 BE) and the last flag, so
//! reordered, dropped or truncated chunks fail authentication.

use crate::{BackupError, Result};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use std::io::{self, Read, Write};

pub const MAGIC: &[u8; 8] = b"HVBKAES1";

/// Plaintext bytes per sealed chunk
pub const CHUNK_SIZE: usize = 64 * 1024;

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LENGTH: usize = 32;
const PREFIX_LENGTH: usize = 7;
const VERIFIER_LENGTH: usize = 16;
const TAG_LENGTH: usize = 16;

struct StreamKey {
    cipher: Aes256Gcm,
    /// Stored in the header to tell a wrong password from a damaged stream
    verifier: [u8; VERIFIER_LENGTH],
}

impl StreamKey {
    fn derive(password: &str, salt: &[u8], iterations: u32) -> Self {
        let mut material = [0u8; 32 + VERIFIER_LENGTH];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut material);

        let (key, check) = material.split_at(32);
        let mut verifier = [0u8; VERIFIER_LENGTH];
        verifier.copy_from_slice(check);

        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            verifier,
        }
    }
}

fn chunk_nonce(prefix: &[u8; PREFIX_LENGTH], counter: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..PREFIX_LENGTH].copy_from_slice(prefix);
    nonce[PREFIX_LENGTH..11].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = u8::from(last);
    nonce
}

fn invalid_data(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

/// Encrypting writer. Call [`EncryptWriter::finish`] to seal the last chunk;
/// a stream dropped without it cannot be decrypted.
pub struct EncryptWriter<W: Write> {
    inner: W,
    key: StreamKey,
    prefix: [u8; PREFIX_LENGTH],
    counter: u32,
    buffer: Vec<u8>,
}

impl<W: Write> EncryptWriter<W> {
    /// Derive a key for `password` with a fresh salt and write the header.
    pub fn new(mut inner: W, password: &str) -> io::Result<Self> {
        let mut salt = [0u8; SALT_LENGTH];
        OsRng.fill_bytes(&mut salt);
        let mut prefix = [0u8; PREFIX_LENGTH];
        OsRng.fill_bytes(&mut prefix);

        let key = StreamKey::derive(password, &salt, PBKDF2_ITERATIONS);

        inner.write_all(MAGIC)?;
        inner.write_all(&PBKDF2_ITERATIONS.to_le_bytes())?;
        inner.write_all(&salt)?;
        inner.write_all(&prefix)?;
        inner.write_all(&key.verifier)?;

        Ok(Self {
            inner,
            key,
            prefix,
            counter: 0,
            buffer: Vec::with_capacity(CHUNK_SIZE),
        })
    }

    fn seal_chunk(&mut self, last: bool) -> io::Result<()> {
        let nonce = chunk_nonce(&self.prefix, self.counter, last);
        let sealed = self
            .key
            .cipher
            .encrypt(Nonce::from_slice(&nonce), self.buffer.as_slice())
            .map_err(|e| io::Error::other(format!("chunk encryption failed: {}", e)))?;

        self.inner.write_all(&[u8::from(last)])?;
        self.inner.write_all(&(sealed.len() as u32).to_le_bytes())?;
        self.inner.write_all(&sealed)?;
        self.buffer.clear();

        if !last {
            self.counter = self
                .counter
                .checked_add(1)
                .ok_or_else(|| io::Error::other("encrypted stream has too many chunks"))?;
        }
        Ok(())
    }

    /// Seal the remaining bytes as the last chunk and hand back the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.seal_chunk(true)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // a full buffer is only sealed once more data proves it is not the last chunk
        if self.buffer.len() == CHUNK_SIZE {
            self.seal_chunk(false)?;
        }

        let n = (CHUNK_SIZE - self.buffer.len()).min(buf.len());
        self.buffer.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader over a stream produced by [`EncryptWriter`].
pub struct DecryptReader<R: Read> {
    inner: R,
    key: StreamKey,
    prefix: [u8; PREFIX_LENGTH],
    counter: u32,
    plain: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: Read> DecryptReader<R> {
    /// Read the header and check `password` against it.
    pub fn new(mut inner: R, password: &str) -> Result<Self> {
        let mut magic = [0u8; 8];
        inner.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(invalid_data("not an encrypted archive stream").into());
        }

        let mut iterations = [0u8; 4];
        inner.read_exact(&mut iterations)?;
        let mut salt = [0u8; SALT_LENGTH];
        inner.read_exact(&mut salt)?;
        let mut prefix = [0u8; PREFIX_LENGTH];
        inner.read_exact(&mut prefix)?;
        let mut verifier = [0u8; VERIFIER_LENGTH];
        inner.read_exact(&mut verifier)?;

        let key = StreamKey::derive(password, &salt, u32::from_le_bytes(iterations));
        if key.verifier != verifier {
            return Err(BackupError::InvalidPassword);
        }

        Ok(Self {
            inner,
            key,
            prefix,
            counter: 0,
            plain: Vec::new(),
            pos: 0,
            done: false,
        })
    }

    fn open_chunk(&mut self) -> io::Result<()> {
        let mut flag = [0u8; 1];
        self.inner.read_exact(&mut flag).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                invalid_data("encrypted stream is truncated")
            } else {
                e
            }
        })?;
        let last = match flag[0] {
            0 => false,
            1 => true,
            _ => return Err(invalid_data("corrupt chunk header")),
        };

        let mut length = [0u8; 4];
        self.inner.read_exact(&mut length)?;
        let length = u32::from_le_bytes(length) as usize;
        if !(TAG_LENGTH..=CHUNK_SIZE + TAG_LENGTH).contains(&length) {
            return Err(invalid_data("corrupt chunk length"));
        }

        let mut sealed = vec![0u8; length];
        self.inner.read_exact(&mut sealed)?;

        let nonce = chunk_nonce(&self.prefix, self.counter, last);
        self.plain = self
            .key
            .cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_slice())
            .map_err(|_| invalid_data("chunk authentication failed"))?;
        self.pos = 0;
        self.done = last;
        self.counter = self.counter.wrapping_add(1);
        Ok(())
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.plain.len() {
            if self.done || buf.is_empty() {
                return Ok(0);
            }
            self.open_chunk()?;
        }

        let n = (self.plain.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
