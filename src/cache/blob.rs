//! Encrypted temporary files backing large cache entries.
//!
//! Every process generates one AES-256-GCM key at startup and keeps it in
//! memory only, so blobs left behind by a crashed process are unreadable.
//!
//! File layout:
//!
//! ```text
//! nonce prefix (7 bytes)
//! frame*: u32 BE header | ciphertext
//! ```
//!
//! The header carries the ciphertext length in the low 31 bits and marks the
//! final frame with the high bit. Frames are sealed with the AEAD STREAM
//! construction (big-endian 32-bit counter), so reordering, truncation and
//! tampering all fail authentication.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use aes_gcm::{
    Aes256Gcm, KeyInit,
    aead::{
        generic_array::GenericArray,
        stream::{DecryptorBE32, EncryptorBE32},
    },
};
use bytes::Bytes;
use metrics::counter;
use rand::RngCore;
use tempfile::TempPath;
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt, BufReader},
};
use tracing::{debug, error, warn};

const KEY_LEN: usize = 32;
const NONCE_PREFIX_LEN: usize = 7;
const TAG_LEN: usize = 16;
const CHUNK_SIZE: usize = 64 * 1024;
const MAX_FRAME_LEN: usize = CHUNK_SIZE + TAG_LEN;
const LAST_FRAME_FLAG: u32 = 1 << 31;
const FILE_PREFIX: &str = "querycache-";
const FILE_SUFFIX: &str = ".blob";

pub(crate) const METRIC_BLOB_DELETED: &str = "querycache_blob_deleted_total";

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to initialise blob cipher")]
    Key,
    #[error("failed to encrypt blob frame")]
    Encrypt,
    #[error("blob frame of {0} bytes exceeds the frame header range")]
    FrameTooLarge(usize),
    #[error("failed to authenticate blob frame")]
    Decrypt,
    #[error("corrupt blob: {reason}")]
    Corrupt { reason: &'static str },
}

/// Creates and opens encrypted blobs inside one directory.
pub struct BlobStore {
    dir: PathBuf,
    cipher: Aes256Gcm,
}

impl fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobStore")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl BlobStore {
    /// Create a store rooted at `dir` with a freshly generated key, creating
    /// the directory if necessary.
    pub fn new(dir: PathBuf) -> Result<Self, BlobError> {
        std::fs::create_dir_all(&dir)?;

        let mut key = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut key);
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| BlobError::Key)?;
        key.fill(0);

        Ok(Self { dir, cipher })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Start a new blob. The file is removed again unless the writer is
    /// finished successfully.
    pub async fn create_blob(&self) -> Result<BlobWriter, BlobError> {
        let named = tempfile::Builder::new()
            .prefix(FILE_PREFIX)
            .suffix(FILE_SUFFIX)
            .tempfile_in(&self.dir)?;
        let (file, temp) = named.into_parts();
        let mut file = File::from_std(file);

        let mut nonce = [0u8; NONCE_PREFIX_LEN];
        rand::rng().fill_bytes(&mut nonce);
        file.write_all(&nonce).await?;

        let encryptor =
            EncryptorBE32::from_aead(self.cipher.clone(), GenericArray::from_slice(&nonce));

        Ok(BlobWriter {
            file,
            temp,
            encryptor,
            pending: Vec::with_capacity(CHUNK_SIZE),
            len: 0,
        })
    }

    /// Open a finished blob for sequential decryption.
    pub async fn open_blob(&self, blob: &Blob) -> Result<BlobReader, BlobError> {
        let file = File::open(blob.path()).await?;
        let mut reader = BufReader::new(file);

        let mut nonce = [0u8; NONCE_PREFIX_LEN];
        read_exact_or_corrupt(&mut reader, &mut nonce, "missing nonce prefix").await?;

        let decryptor =
            DecryptorBE32::from_aead(self.cipher.clone(), GenericArray::from_slice(&nonce));

        Ok(BlobReader {
            reader,
            decryptor: Some(decryptor),
        })
    }
}

/// Streaming writer for a blob under construction.
pub struct BlobWriter {
    file: File,
    temp: TempPath,
    encryptor: EncryptorBE32<Aes256Gcm>,
    pending: Vec<u8>,
    len: u64,
}

impl fmt::Debug for BlobWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobWriter")
            .field("path", &self.temp.to_path_buf())
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl BlobWriter {
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), BlobError> {
        self.pending.extend_from_slice(bytes);
        self.len += bytes.len() as u64;

        // Keep the tail buffered: the final frame is sealed differently.
        while self.pending.len() > CHUNK_SIZE {
            let ciphertext = self
                .encryptor
                .encrypt_next(&self.pending[..CHUNK_SIZE])
                .map_err(|_| BlobError::Encrypt)?;
            self.pending.drain(..CHUNK_SIZE);
            write_frame(&mut self.file, &ciphertext, false).await?;
        }

        Ok(())
    }

    /// Plaintext bytes accepted so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Seal the final frame and hand ownership of the file to a [`Blob`].
    pub async fn finish(self) -> Result<Blob, BlobError> {
        let BlobWriter {
            mut file,
            temp,
            encryptor,
            pending,
            len,
        } = self;

        let ciphertext = encryptor
            .encrypt_last(pending.as_slice())
            .map_err(|_| BlobError::Encrypt)?;
        write_frame(&mut file, &ciphertext, true).await?;
        file.flush().await?;
        drop(file);

        let path = temp.keep().map_err(|err| BlobError::Io(err.error))?;
        Ok(Blob {
            path,
            len,
            deleted: AtomicBool::new(false),
        })
    }

    /// Discard the partial file.
    pub fn abort(self) {
        let BlobWriter { file, temp, .. } = self;
        drop(file);
        let path = temp.to_path_buf();
        if let Err(err) = temp.close() {
            warn!(
                path = %path.display(),
                error = %err,
                "Failed to remove partial blob"
            );
        }
    }
}

async fn write_frame(file: &mut File, ciphertext: &[u8], last: bool) -> Result<(), BlobError> {
    let header = frame_header(ciphertext.len(), last)?;
    file.write_all(&header.to_be_bytes()).await?;
    file.write_all(ciphertext).await?;
    Ok(())
}

fn frame_header(len: usize, last: bool) -> Result<u32, BlobError> {
    let len = u32::try_from(len)
        .ok()
        .filter(|len| *len < LAST_FRAME_FLAG)
        .ok_or(BlobError::FrameTooLarge(len))?;
    Ok(if last { len | LAST_FRAME_FLAG } else { len })
}

/// A finished encrypted file.
///
/// Dropping the last handle deletes the file, on a blocking thread when a
/// tokio runtime is available. [`Blob::delete`] removes it synchronously and
/// is safe to call more than once.
pub struct Blob {
    path: PathBuf,
    len: u64,
    deleted: AtomicBool,
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("deleted", &self.deleted.load(Ordering::Relaxed))
            .finish()
    }
}

impl Blob {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Plaintext length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remove the file. Returns `true` only for the call that removed it.
    /// A file that is already gone is logged and otherwise ignored.
    pub fn delete(&self) -> bool {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return false;
        }
        remove_blob_file(&self.path)
    }
}

impl Drop for Blob {
    fn drop(&mut self) {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return;
        }

        // The last holder may be a response stream or a refresh task running
        // on an async worker.
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_blob_file(&path));
            }
            Err(_) => {
                remove_blob_file(&path);
            }
        }
    }
}

fn remove_blob_file(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => {
            counter!(METRIC_BLOB_DELETED).increment(1);
            debug!(path = %path.display(), "Deleted blob");
            true
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Blob already removed");
            false
        }
        Err(err) => {
            error!(
                path = %path.display(),
                error = %err,
                "Failed to delete blob"
            );
            false
        }
    }
}

/// Wait for a blob dropped inside a runtime to disappear from disk.
#[cfg(test)]
pub(crate) async fn wait_until_removed(path: &Path) -> bool {
    for _ in 0..200 {
        if !path.exists() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    !path.exists()
}

/// Sequential decryptor over a finished blob.
pub struct BlobReader {
    reader: BufReader<File>,
    decryptor: Option<DecryptorBE32<Aes256Gcm>>,
}

impl fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobReader")
            .field("finished", &self.decryptor.is_none())
            .finish_non_exhaustive()
    }
}

impl BlobReader {
    /// Decrypt the next frame. Returns `None` once the final frame has been
    /// authenticated.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, BlobError> {
        let Some(mut decryptor) = self.decryptor.take() else {
            return Ok(None);
        };

        let mut header = [0u8; 4];
        read_exact_or_corrupt(&mut self.reader, &mut header, "truncated frame header").await?;
        let header = u32::from_be_bytes(header);
        let last = header & LAST_FRAME_FLAG != 0;
        let len = (header & !LAST_FRAME_FLAG) as usize;
        if len > MAX_FRAME_LEN {
            return Err(BlobError::Corrupt {
                reason: "frame exceeds maximum length",
            });
        }

        let mut frame = vec![0u8; len];
        read_exact_or_corrupt(&mut self.reader, &mut frame, "truncated frame").await?;

        let plaintext = if last {
            let plaintext = decryptor
                .decrypt_last(frame.as_slice())
                .map_err(|_| BlobError::Decrypt)?;
            let mut trailing = [0u8; 1];
            if self.reader.read(&mut trailing).await? != 0 {
                return Err(BlobError::Corrupt {
                    reason: "trailing data after final frame",
                });
            }
            plaintext
        } else {
            let plaintext = decryptor
                .decrypt_next(frame.as_slice())
                .map_err(|_| BlobError::Decrypt)?;
            self.decryptor = Some(decryptor);
            plaintext
        };

        if plaintext.is_empty() && last {
            return Ok(None);
        }
        Ok(Some(Bytes::from(plaintext)))
    }

    /// Decrypt the remaining frames into one buffer.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, BlobError> {
        let mut output = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            output.extend_from_slice(&chunk);
        }
        Ok(output)
    }
}

async fn read_exact_or_corrupt(
    reader: &mut BufReader<File>,
    buf: &mut [u8],
    reason: &'static str,
) -> Result<(), BlobError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            Err(BlobError::Corrupt { reason })
        }
        Err(err) => Err(BlobError::Io(err)),
    }
}
