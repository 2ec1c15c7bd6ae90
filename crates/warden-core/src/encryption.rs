//! Authenticated encryption under a single, session-scoped data key.
//!
//! Tokens are URL-safe base64 of `version ‖ nonce ‖ ciphertext+tag`. Files use
//! a chunked layout so backups of any size stream through a fixed buffer:
//!
//! ```text
//! "WRDNFILE" | version (1) | nonce prefix (19)
//! repeated:  len (u32 BE) | sealed chunk
//! ```
//!
//! Every chunk nonce is `prefix ‖ counter (u32 BE) ‖ last flag`, and the header
//! is bound in as associated data, so truncation, reordering and trailing
//! garbage all fail authentication.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{self, DERIVED_KEY_LEN, NONCE_LEN, TAG_LEN};
use crate::error::{CoreError, Result};
use crate::settings::DEFAULT_KDF_ITERATIONS;

const TOKEN_VERSION: u8 = 1;
const TOKEN_AAD: &[u8] = b"warden.token.v1";

const FILE_MAGIC: &[u8; 8] = b"WRDNFILE";
const FILE_VERSION: u8 = 1;
const FILE_PREFIX_LEN: usize = NONCE_LEN - 5;
const FILE_HEADER_LEN: usize = FILE_MAGIC.len() + 1 + FILE_PREFIX_LEN;
pub const FILE_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Zeroize, ZeroizeOnDrop)]
struct DataKey([u8; DERIVED_KEY_LEN]);

pub struct EncryptionService {
    iterations: u32,
    active: RwLock<Option<Arc<DataKey>>>,
}

impl fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionService")
            .field("iterations", &self.iterations)
            .field("has_key", &self.has_key())
            .finish()
    }
}

impl Default for EncryptionService {
    fn default() -> Self {
        Self::new()
    }
}

impl EncryptionService {
    pub fn new() -> Self {
        Self::with_iterations(DEFAULT_KDF_ITERATIONS)
    }

    pub fn with_iterations(iterations: u32) -> Self {
        Self {
            iterations,
            active: RwLock::new(None),
        }
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Run the KDF over `passphrase`, generating a fresh 16-byte salt when none is given.
    pub fn derive_key(
        &self,
        passphrase: &str,
        salt: Option<&[u8]>,
    ) -> Result<(Zeroizing<[u8; DERIVED_KEY_LEN]>, Vec<u8>)> {
        let salt = match salt {
            Some(s) => s.to_vec(),
            None => crypto::generate_salt().to_vec(),
        };
        let key = crypto::derive_key(passphrase, &salt, self.iterations)?;
        Ok((key, salt))
    }

    /// A fresh random key suitable for [`set_key`](Self::set_key).
    pub fn generate_data_key() -> Zeroizing<[u8; DERIVED_KEY_LEN]> {
        crypto::generate_key()
    }

    pub fn set_key(&self, key: &[u8; DERIVED_KEY_LEN]) {
        *self.active.write() = Some(Arc::new(DataKey(*key)));
        debug!("encryption key installed");
    }

    /// Drop the active key. In-flight streaming operations keep their snapshot
    /// until they finish; the bytes are zeroed when the last reference goes.
    pub fn clear_key(&self) {
        if self.active.write().take().is_some() {
            debug!("encryption key cleared");
        }
    }

    pub fn has_key(&self) -> bool {
        self.active.read().is_some()
    }

    fn snapshot(&self) -> Result<Arc<DataKey>> {
        self.active.read().clone().ok_or(CoreError::KeyNotSet)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let key = self.snapshot()?;
        seal_token(&key.0, TOKEN_AAD, plaintext)
    }

    pub fn decrypt(&self, token: &str) -> Result<Zeroizing<Vec<u8>>> {
        let key = self.snapshot()?;
        open_token(&key.0, TOKEN_AAD, token)
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<String> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_str(&self, token: &str) -> Result<String> {
        let bytes = self.decrypt(token)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CoreError::Decryption("plaintext is not valid UTF-8".into()))
    }

    /// Encrypt `path` into `out_path` (default `<path>.enc`).
    pub fn encrypt_file(&self, path: &Path, out_path: Option<&Path>) -> Result<PathBuf> {
        let key = self.snapshot()?;
        let out = match out_path {
            Some(p) => p.to_path_buf(),
            None => append_suffix(path, ".enc"),
        };
        let mut reader = BufReader::new(File::open(path)?);
        let mut tmp = temp_sibling(&out)?;

        let mut prefix = [0u8; FILE_PREFIX_LEN];
        OsRng.fill_bytes(&mut prefix);
        let mut header = Vec::with_capacity(FILE_HEADER_LEN);
        header.extend_from_slice(FILE_MAGIC);
        header.push(FILE_VERSION);
        header.extend_from_slice(&prefix);

        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            writer.write_all(&header)?;

            let mut current = Zeroizing::new(vec![0u8; FILE_CHUNK_SIZE]);
            let mut next = Zeroizing::new(vec![0u8; FILE_CHUNK_SIZE]);
            let mut len = read_full(&mut reader, &mut current)?;
            let mut counter: u32 = 0;
            loop {
                let next_len = if len == FILE_CHUNK_SIZE {
                    read_full(&mut reader, &mut next)?
                } else {
                    0
                };
                let last = next_len == 0;
                let nonce = chunk_nonce(&prefix, counter, last);
                let sealed = crypto::seal(&key.0, &nonce, &header, &current[..len])?;
                writer.write_all(&(sealed.len() as u32).to_be_bytes())?;
                writer.write_all(&sealed)?;
                if last {
                    break;
                }
                std::mem::swap(&mut current, &mut next);
                len = next_len;
                counter = counter
                    .checked_add(1)
                    .ok_or_else(|| CoreError::Crypto("file too large to encrypt".into()))?;
            }
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&out).map_err(|e| CoreError::Io(e.error))?;
        debug!(src = %path.display(), dest = %out.display(), "file encrypted");
        Ok(out)
    }

    /// Decrypt a file produced by [`encrypt_file`](Self::encrypt_file).
    ///
    /// Output only appears at `out_path` once every chunk has authenticated.
    pub fn decrypt_file(&self, path: &Path, out_path: Option<&Path>) -> Result<PathBuf> {
        let key = self.snapshot()?;
        let out = match out_path {
            Some(p) => p.to_path_buf(),
            None => default_decrypt_path(path),
        };
        let mut reader = BufReader::new(File::open(path)?);

        let mut header = [0u8; FILE_HEADER_LEN];
        if read_full(&mut reader, &mut header)? != FILE_HEADER_LEN {
            return Err(CoreError::Decryption("truncated file header".into()));
        }
        if &header[..FILE_MAGIC.len()] != FILE_MAGIC {
            return Err(CoreError::Decryption("not an encrypted file".into()));
        }
        if header[FILE_MAGIC.len()] != FILE_VERSION {
            return Err(CoreError::Decryption(format!(
                "unsupported file version {}",
                header[FILE_MAGIC.len()]
            )));
        }
        let mut prefix = [0u8; FILE_PREFIX_LEN];
        prefix.copy_from_slice(&header[FILE_MAGIC.len() + 1..]);

        let mut tmp = temp_sibling(&out)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            let mut counter: u32 = 0;
            let mut pending_len = match read_chunk_len(&mut reader)? {
                Some(n) => n,
                None => return Err(CoreError::Decryption("missing final chunk".into())),
            };
            loop {
                if pending_len > FILE_CHUNK_SIZE + TAG_LEN {
                    return Err(CoreError::Decryption("oversized chunk".into()));
                }
                let mut sealed = vec![0u8; pending_len];
                if read_full(&mut reader, &mut sealed)? != pending_len {
                    return Err(CoreError::Decryption("truncated chunk".into()));
                }
                let following = read_chunk_len(&mut reader)?;
                let last = following.is_none();
                let nonce = chunk_nonce(&prefix, counter, last);
                let plain = crypto::open(&key.0, &nonce, &header, &sealed).map_err(|_| {
                    CoreError::Decryption(format!("chunk {counter} failed authentication"))
                })?;
                writer.write_all(&plain)?;
                match following {
                    None => break,
                    Some(n) => {
                        pending_len = n;
                        counter = counter
                            .checked_add(1)
                            .ok_or_else(|| CoreError::Decryption("too many chunks".into()))?;
                    }
                }
            }
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&out).map_err(|e| CoreError::Io(e.error))?;
        debug!(src = %path.display(), dest = %out.display(), "file decrypted");
        Ok(out)
    }
}

/// Seal `plaintext` into a token under an explicit key.
pub(crate) fn seal_token(key: &[u8; DERIVED_KEY_LEN], aad: &[u8], plaintext: &[u8]) -> Result<String> {
    let nonce = crypto::generate_nonce();
    let ct = crypto::seal(key, &nonce, aad, plaintext)?;
    let mut buf = Vec::with_capacity(1 + NONCE_LEN + ct.len());
    buf.push(TOKEN_VERSION);
    buf.extend_from_slice(&nonce);
    buf.extend_from_slice(&ct);
    Ok(URL_SAFE_NO_PAD.encode(buf))
}

pub(crate) fn open_token(
    key: &[u8; DERIVED_KEY_LEN],
    aad: &[u8],
    token: &str,
) -> Result<Zeroizing<Vec<u8>>> {
    let raw = URL_SAFE_NO_PAD
        .decode(token.trim())
        .map_err(|_| CoreError::Decryption("malformed token".into()))?;
    if raw.len() < 1 + NONCE_LEN + TAG_LEN {
        return Err(CoreError::Decryption("truncated token".into()));
    }
    if raw[0] != TOKEN_VERSION {
        warn!(version = raw[0], "unknown ciphertext token version");
        return Err(CoreError::Decryption("unsupported token version".into()));
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&raw[1..1 + NONCE_LEN]);
    crypto::open(key, &nonce, aad, &raw[1 + NONCE_LEN..])
}

fn chunk_nonce(prefix: &[u8; FILE_PREFIX_LEN], counter: u32, last: bool) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..FILE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[FILE_PREFIX_LEN..FILE_PREFIX_LEN + 4].copy_from_slice(&counter.to_be_bytes());
    nonce[NONCE_LEN - 1] = u8::from(last);
    nonce
}

/// Fill `buf` as far as the reader allows; returns the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_chunk_len<R: Read>(reader: &mut R) -> Result<Option<usize>> {
    let mut len = [0u8; 4];
    match read_full(reader, &mut len)? {
        0 => Ok(None),
        4 => Ok(Some(u32::from_be_bytes(len) as usize)),
        _ => Err(CoreError::Decryption("truncated chunk length".into())),
    }
}

fn temp_sibling(out: &Path) -> Result<NamedTempFile> {
    let parent = match out.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;
    Ok(NamedTempFile::new_in(parent)?)
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

fn default_decrypt_path(path: &Path) -> PathBuf {
    match path.extension() {
        Some(ext) if ext == "enc" => path.with_extension(""),
        _ => append_suffix(path, ".dec"),
    }
}
