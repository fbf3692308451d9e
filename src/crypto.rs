//! Master-key custody and AES-256-GCM envelope encryption.
//!
//! The master key lives in one page-aligned, `mlock`'d anonymous mapping for
//! the lifetime of the process. It is generated once at startup, never
//! copied out of this module, and zeroed (via a volatile write the compiler
//! cannot elide) before the mapping is released.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("failed to allocate locked key memory: {0}")]
    KeyAlloc(std::io::Error),
    #[error("failed to mlock key memory: {0}")]
    KeyLock(std::io::Error),
    #[error("entropy source exhausted")]
    EntropyExhausted,
    #[error("AES-GCM seal failed")]
    SealFailed,
    #[error("AES-GCM tag verification failed")]
    OpenFailed,
}

/// A sealed secret: ciphertext, the nonce used to produce it, and the GCM tag.
///
/// `ciphertext.len()` always equals the plaintext length; the tag is kept
/// apart from the ciphertext bytes so the data model matches spec's
/// `(ciphertext, nonce, tag)` triple rather than aes-gcm's concatenated
/// `ciphertext || tag` wire form.
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
}

/// One page-aligned, locked, zero-on-drop region holding the 32-byte master key.
///
/// Construction fills the key with OS entropy and locks the page into RAM;
/// `Drop` performs a volatile zero of the whole region before unlocking and
/// unmapping it. The key bytes themselves never leave this module — callers
/// only ever get a [`Crypto`] handle that can `seal`/`open` on their behalf.
struct MasterKey {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the region is exclusively owned by this struct and never aliased;
// sending the raw pointer across threads is sound because access is always
// mediated through `&MasterKey`/`&mut MasterKey` on the owning `Crypto`.
unsafe impl Send for MasterKey {}
unsafe impl Sync for MasterKey {}

impl MasterKey {
    fn generate() -> Result<Self, CryptoError> {
        let page_len = page_size();
        let alloc_len = page_len.max(KEY_LEN);

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                alloc_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CryptoError::KeyAlloc(std::io::Error::last_os_error()));
        }
        let ptr = ptr as *mut u8;

        let lock_res = unsafe { libc::mlock(ptr as *const libc::c_void, alloc_len) };
        if lock_res != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::munmap(ptr as *mut libc::c_void, alloc_len);
            }
            return Err(CryptoError::KeyLock(err));
        }

        let key = MasterKey { ptr, len: alloc_len };
        let slice = unsafe { std::slice::from_raw_parts_mut(key.ptr, key.len) };
        slice.fill(0);
        OsRng.fill_bytes(&mut slice[..KEY_LEN]);
        Ok(key)
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, KEY_LEN) }
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        let slice = unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) };
        slice.zeroize();
        unsafe {
            libc::munlock(self.ptr as *const libc::c_void, self.len);
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

/// Owns the process's one master key and performs envelope seal/open.
pub struct Crypto {
    key: MasterKey,
}

impl Crypto {
    /// Generates a fresh master key in locked memory. Call once per process.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self { key: MasterKey::generate()? })
    }

    fn cipher(&self) -> Aes256Gcm {
        let key = Key::<Aes256Gcm>::from_slice(self.key.bytes());
        Aes256Gcm::new(key)
    }

    /// Encrypts `plaintext` under the master key with a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Sealed, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut out = self
            .cipher()
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::SealFailed)?;
        if out.len() < TAG_LEN {
            return Err(CryptoError::SealFailed);
        }
        let tag_start = out.len() - TAG_LEN;
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&out[tag_start..]);
        out.truncate(tag_start);

        Ok(Sealed { ciphertext: out, nonce: nonce_bytes, tag })
    }

    /// Verifies `tag` and decrypts `ciphertext`. Returns [`CryptoError::OpenFailed`]
    /// on any tamper or corruption without yielding partial plaintext.
    pub fn open(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_LEN],
        tag: &[u8; TAG_LEN],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        combined.extend_from_slice(ciphertext);
        combined.extend_from_slice(tag);

        let nonce = Nonce::from_slice(nonce);
        self.cipher()
            .decrypt(nonce, combined.as_ref())
            .map_err(|_| CryptoError::OpenFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let crypto = Crypto::generate().unwrap();
        let plaintext = b"swordfish";
        let sealed = crypto.seal(plaintext).unwrap();
        assert_eq!(sealed.ciphertext.len(), plaintext.len());
        let opened = crypto.open(&sealed.ciphertext, &sealed.nonce, &sealed.tag).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let crypto = Crypto::generate().unwrap();
        let sealed = crypto.seal(b"top secret").unwrap();
        let mut bad_ct = sealed.ciphertext.clone();
        bad_ct[0] ^= 0x01;
        assert!(crypto.open(&bad_ct, &sealed.nonce, &sealed.tag).is_err());
    }

    #[test]
    fn tampered_tag_fails() {
        let crypto = Crypto::generate().unwrap();
        let sealed = crypto.seal(b"top secret").unwrap();
        let mut bad_tag = sealed.tag;
        bad_tag[0] ^= 0x01;
        assert!(crypto.open(&sealed.ciphertext, &sealed.nonce, &bad_tag).is_err());
    }

    #[test]
    fn two_seals_use_different_nonces() {
        let crypto = Crypto::generate().unwrap();
        let a = crypto.seal(b"same plaintext").unwrap();
        let b = crypto.seal(b"same plaintext").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }
}
