//! Selecting and applying backup encryption
//!
//! Encrypted artifacts start with a fixed [`ContainerHeader`] followed by
//! length prefixed XChaCha20-Poly1305 frames. Each frame's nonce is the
//! header's random prefix, the frame counter and a last frame flag, and the
//! header is authenticated with every frame. Dropping, reordering, truncating
//! or appending frames fails decryption.

use core::fmt;
use std::{
    fs::File,
    io::{self, BufWriter, ErrorKind, Read, Write},
};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytemuck::{Pod, Zeroable};
use chacha20poly1305::{
    Key, KeyInit, XChaCha20Poly1305, XNonce,
    aead::{Aead, Payload},
};
use rand::{RngCore, rngs::OsRng};
use thiserror::Error;

use crate::config::{EncryptionMode, EncryptionSettings};

const MAGIC: [u8; 8] = *b"RVNBKENC";
const VERSION: u32 = 1;
const NONCE_PREFIX_LENGTH: usize = 19;
const TAG_LENGTH: usize = 16;

/// The plaintext size of every frame but the last.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A 256 bit encryption key.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// The key length in bytes.
    pub const LENGTH: usize = 32;

    /// Create a key from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Decode a base64 key.
    pub fn from_base64(encoded: &str) -> Result<Self, EncryptionError> {
        let bytes = BASE64.decode(encoded.trim())?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| EncryptionError::InvalidKeyLength(bytes.len()))?;

        Ok(Self(bytes))
    }

    /// Generate a random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// The key as base64.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.0))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Chooses whether and how a backup's output is encrypted.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncryptionSelector;

impl EncryptionSelector {
    /// The key to encrypt with, or `None` to write plain output.
    ///
    /// Without settings the database key is used if the database has one.
    /// Mode `None` always opts out, even if the database is encrypted.
    pub fn select(
        master_key: Option<&EncryptionKey>,
        settings: Option<&EncryptionSettings>,
    ) -> Result<Option<EncryptionKey>, EncryptionError> {
        let Some(settings) = settings else {
            return Ok(master_key.cloned());
        };

        match settings.mode {
            EncryptionMode::None => Ok(None),
            EncryptionMode::UseDatabaseKey => master_key
                .cloned()
                .map(Some)
                .ok_or(EncryptionError::MissingDatabaseKey),
            EncryptionMode::UseProvidedKey => {
                let key = settings
                    .key
                    .as_deref()
                    .ok_or(EncryptionError::MissingProvidedKey)?;
                EncryptionKey::from_base64(key).map(Some)
            }
        }
    }

    /// Wrap a raw output stream according to the settings.
    pub fn wrap<W: Write>(
        raw: W,
        master_key: Option<&EncryptionKey>,
        settings: Option<&EncryptionSettings>,
    ) -> Result<OutputStream<W>, EncryptionError> {
        let key = Self::select(master_key, settings)?;
        OutputStream::new(raw, key.as_ref())
    }
}

/// A writer that can force its written bytes to durable storage.
///
/// [`Write::flush`] only empties buffers, `sync_to_disk` returns once the
/// bytes survive a crash.
pub trait DurableWrite: Write {
    /// Flush and sync everything written so far to durable storage.
    fn sync_to_disk(&mut self) -> io::Result<()>;
}

impl DurableWrite for File {
    fn sync_to_disk(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_all()
    }
}

impl<W: DurableWrite> DurableWrite for BufWriter<W> {
    fn sync_to_disk(&mut self) -> io::Result<()> {
        self.flush()?;
        self.get_mut().sync_to_disk()
    }
}

impl DurableWrite for Vec<u8> {
    fn sync_to_disk(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The header of an encrypted artifact.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq)]
pub struct ContainerHeader {
    magic: [u8; 8],
    version: [u8; 4],
    chunk_size: [u8; 4],
    nonce_prefix: [u8; NONCE_PREFIX_LENGTH],
    reserved: u8,
}

impl ContainerHeader {
    /// The encoded header length.
    pub const LENGTH: usize = size_of::<Self>();

    fn new(chunk_size: u32) -> Self {
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LENGTH];
        OsRng.fill_bytes(&mut nonce_prefix);

        Self {
            magic: MAGIC,
            version: VERSION.to_le_bytes(),
            chunk_size: chunk_size.to_le_bytes(),
            nonce_prefix,
            reserved: 0,
        }
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self, EncryptionError> {
        let mut bytes = [0u8; Self::LENGTH];
        reader
            .read_exact(&mut bytes)
            .map_err(|e| EncryptionError::Io(e, "read the header"))?;

        let header: Self = bytemuck::pod_read_unaligned(&bytes);

        if header.magic != MAGIC {
            return Err(EncryptionError::InvalidHeader);
        }

        let version = u32::from_le_bytes(header.version);
        if version != VERSION {
            return Err(EncryptionError::UnsupportedVersion(version));
        }

        if header.chunk_size() == 0 {
            return Err(EncryptionError::InvalidHeader);
        }

        Ok(header)
    }

    fn chunk_size(&self) -> usize {
        usize::try_from(u32::from_le_bytes(self.chunk_size)).unwrap_or(usize::MAX)
    }

    fn nonce(&self, counter: u32, last: bool) -> XNonce {
        let mut nonce = [0u8; 24];
        nonce[..NONCE_PREFIX_LENGTH].copy_from_slice(&self.nonce_prefix);
        nonce[NONCE_PREFIX_LENGTH..23].copy_from_slice(&counter.to_le_bytes());
        nonce[23] = u8::from(last);
        *XNonce::from_slice(&nonce)
    }
}

/// Encrypts everything written to it into the framed format.
///
/// [`EncryptingWriter::finish`] must be called to write the last frame,
/// an unfinished stream fails to decrypt.
pub struct EncryptingWriter<W: Write> {
    inner: W,
    cipher: XChaCha20Poly1305,
    header: ContainerHeader,
    buffer: Vec<u8>,
    chunk_size: usize,
    counter: u32,
}

impl<W: Write> EncryptingWriter<W> {
    /// Write the header and start a new encrypted stream.
    pub fn new(inner: W, key: &EncryptionKey) -> Result<Self, EncryptionError> {
        Self::with_chunk_size(inner, key, DEFAULT_CHUNK_SIZE)
    }

    /// Start a new encrypted stream with a custom frame size.
    pub fn with_chunk_size(
        mut inner: W,
        key: &EncryptionKey,
        chunk_size: usize,
    ) -> Result<Self, EncryptionError> {
        let encoded_size = u32::try_from(chunk_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or(EncryptionError::InvalidChunkSize(chunk_size))?;

        let header = ContainerHeader::new(encoded_size);
        inner
            .write_all(bytemuck::bytes_of(&header))
            .map_err(|e| EncryptionError::Io(e, "write the header"))?;

        Ok(Self {
            inner,
            cipher: key.cipher(),
            header,
            buffer: Vec::with_capacity(chunk_size),
            chunk_size,
            counter: 0,
        })
    }

    /// Write the last frame and return the inner writer.
    pub fn finish(mut self) -> Result<W, EncryptionError> {
        self.seal_frame(true)
            .map_err(|e| EncryptionError::Io(e, "write the last frame"))?;
        self.inner
            .flush()
            .map_err(|e| EncryptionError::Io(e, "flush the output"))?;

        Ok(self.inner)
    }

    fn seal_frame(&mut self, last: bool) -> io::Result<()> {
        let nonce = self.header.nonce(self.counter, last);
        let payload = Payload {
            msg: &self.buffer,
            aad: bytemuck::bytes_of(&self.header),
        };

        let ciphertext = self
            .cipher
            .encrypt(&nonce, payload)
            .map_err(|_| io::Error::other("failed to seal a frame"))?;
        let length = u32::try_from(ciphertext.len()).map_err(io::Error::other)?;

        self.inner.write_all(&length.to_le_bytes())?;
        self.inner.write_all(&ciphertext)?;

        self.buffer.clear();
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| io::Error::other("too many frames"))?;

        Ok(())
    }
}

impl<W: Write> Write for EncryptingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;

        while written < buf.len() {
            // A full buffer is only sealed once more data arrives, the last
            // frame is sealed by `finish`.
            if self.buffer.len() == self.chunk_size {
                self.seal_frame(false)?;
            }

            let space = self.chunk_size - self.buffer.len();
            let take = space.min(buf.len() - written);
            self.buffer
                .extend_from_slice(&buf[written..written + take]);
            written += take;
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: DurableWrite> DurableWrite for EncryptingWriter<W> {
    fn sync_to_disk(&mut self) -> io::Result<()> {
        self.inner.sync_to_disk()
    }
}

/// A backup output stream, encrypted or not.
pub enum OutputStream<W: Write> {
    #[allow(missing_docs)]
    Plain(W),
    #[allow(missing_docs)]
    Encrypted(EncryptingWriter<W>),
}

impl<W: Write> OutputStream<W> {
    /// Encrypt with `key`, or write plain output without one.
    pub fn new(raw: W, key: Option<&EncryptionKey>) -> Result<Self, EncryptionError> {
        match key {
            Some(key) => Ok(Self::Encrypted(EncryptingWriter::new(raw, key)?)),
            None => Ok(Self::Plain(raw)),
        }
    }

    /// If the stream encrypts its output.
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted(_))
    }

    /// Complete the stream and return the raw writer.
    pub fn finish(self) -> Result<W, EncryptionError> {
        match self {
            Self::Plain(mut writer) => {
                writer
                    .flush()
                    .map_err(|e| EncryptionError::Io(e, "flush the output"))?;
                Ok(writer)
            }
            Self::Encrypted(writer) => writer.finish(),
        }
    }
}

impl<W: Write> Write for OutputStream<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(writer) => writer.write(buf),
            Self::Encrypted(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(writer) => writer.flush(),
            Self::Encrypted(writer) => writer.flush(),
        }
    }
}

impl<W: DurableWrite> DurableWrite for OutputStream<W> {
    fn sync_to_disk(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(writer) => writer.sync_to_disk(),
            Self::Encrypted(writer) => writer.sync_to_disk(),
        }
    }
}

/// Decrypts a stream written by [`EncryptingWriter`].
pub struct DecryptingReader<R: Read> {
    inner: R,
    cipher: XChaCha20Poly1305,
    header: ContainerHeader,
    counter: u32,
    plaintext: Vec<u8>,
    position: usize,
    lookahead: Option<Vec<u8>>,
    finished: bool,
}

impl<R: Read> DecryptingReader<R> {
    /// Read and check the header.
    pub fn new(mut inner: R, key: &EncryptionKey) -> Result<Self, EncryptionError> {
        let header = ContainerHeader::read_from(&mut inner)?;

        let mut reader = Self {
            inner,
            cipher: key.cipher(),
            header,
            counter: 0,
            plaintext: Vec::new(),
            position: 0,
            lookahead: None,
            finished: false,
        };

        reader.lookahead = reader
            .read_frame()
            .map_err(|e| EncryptionError::Io(e, "read the first frame"))?;
        if reader.lookahead.is_none() {
            return Err(EncryptionError::Truncated);
        }

        Ok(reader)
    }

    fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut length = [0u8; 4];
        let mut filled = 0;
        while filled < length.len() {
            match self.inner.read(&mut length[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
                Ok(read) => filled += read,
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(error) => return Err(error),
            }
        }

        let length = usize::try_from(u32::from_le_bytes(length)).map_err(io::Error::other)?;
        if length < TAG_LENGTH || length > self.header.chunk_size().saturating_add(TAG_LENGTH) {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                "frame length out of range",
            ));
        }

        let mut frame = vec![0u8; length];
        self.inner.read_exact(&mut frame)?;

        Ok(Some(frame))
    }

    fn open_next_frame(&mut self) -> io::Result<()> {
        let Some(frame) = self.lookahead.take() else {
            return Err(ErrorKind::UnexpectedEof.into());
        };

        // The last frame is the one with nothing after it.
        let next = self.read_frame()?;
        let last = next.is_none();

        let nonce = self.header.nonce(self.counter, last);
        let payload = Payload {
            msg: &frame,
            aad: bytemuck::bytes_of(&self.header),
        };
        self.plaintext = self.cipher.decrypt(&nonce, payload).map_err(|_| {
            io::Error::new(ErrorKind::InvalidData, "frame failed authentication")
        })?;

        self.position = 0;
        self.lookahead = next;
        self.finished = last;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| io::Error::other("too many frames"))?;

        Ok(())
    }
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.position < self.plaintext.len() {
                let available = &self.plaintext[self.position..];
                let take = available.len().min(buf.len());
                buf[..take].copy_from_slice(&available[..take]);
                self.position += take;
                return Ok(take);
            }

            if self.finished || buf.is_empty() {
                return Ok(0);
            }

            self.open_next_frame()?;
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("The key is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("The key must be {length} bytes, was {0}", length = EncryptionKey::LENGTH)]
    InvalidKeyLength(usize),

    #[error("Can't use the database key for backup encryption, the key doesn't exist")]
    MissingDatabaseKey,

    #[error("Encryption mode UseProvidedKey requires a key")]
    MissingProvidedKey,

    #[error("Invalid frame size {0}")]
    InvalidChunkSize(usize),

    #[error("The stream is not an encrypted backup")]
    InvalidHeader,

    #[error("Unsupported encrypted backup version {0}")]
    UnsupportedVersion(u32),

    #[error("The encrypted stream has no frames")]
    Truncated,

    #[error("Failed to {1}: {0}")]
    Io(#[source] io::Error, &'static str),
}
