// src/volume/crypt.rs

//! Encrypted image container.
//!
//! Layout: `magic[16] | version u16 LE | algorithm[8] | nonce_len u32 LE |
//! nonce | ciphertext || tag`. Only AES-256-GCM is accepted.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use zeroize::Zeroizing;

/// Magic bytes opening every encrypted image
pub const ENCRYPTION_MAGIC: &[u8; 16] = b"WLAGENT_ENCRYPT\0";

/// Container version written by `encrypt_image`
pub const HEADER_VERSION: u16 = 1;

/// Algorithm tag for AES-256-GCM
pub const ALGORITHM_AES_256_GCM: &[u8; 8] = b"AES-GCM\0";

/// Required key length in bytes
pub const KEY_LEN: usize = 32;

const FIXED_HEADER_LEN: usize = 16 + 2 + 8 + 4;

/// Parsed image header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionHeader {
    /// Container version
    pub version: u16,

    /// Algorithm tag
    pub algorithm: [u8; 8],

    /// AEAD nonce
    pub nonce: Vec<u8>,
}

impl EncryptionHeader {
    /// Parses the header, returning it with the remaining ciphertext
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), CryptError> {
        if data.len() < FIXED_HEADER_LEN {
            return Err(CryptError::Truncated);
        }
        if &data[..16] != ENCRYPTION_MAGIC {
            return Err(CryptError::NotEncrypted);
        }

        let version = u16::from_le_bytes([data[16], data[17]]);
        let mut algorithm = [0u8; 8];
        algorithm.copy_from_slice(&data[18..26]);
        let nonce_len = u32::from_le_bytes([data[26], data[27], data[28], data[29]]) as usize;

        let rest = &data[FIXED_HEADER_LEN..];
        if rest.len() < nonce_len {
            return Err(CryptError::Truncated);
        }
        let (nonce, body) = rest.split_at(nonce_len);

        Ok((
            Self {
                version,
                algorithm,
                nonce: nonce.to_vec(),
            },
            body,
        ))
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_HEADER_LEN + self.nonce.len());
        out.extend_from_slice(ENCRYPTION_MAGIC);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.algorithm);
        out.extend_from_slice(&(self.nonce.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.nonce);
        out
    }
}

/// Whether the file at `path` starts with the encryption magic.
///
/// Only the first 16 bytes are read.
pub fn has_encryption_header(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 16];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(&magic == ENCRYPTION_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Decrypts an encrypted image held in memory
pub fn decrypt_image(data: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptError> {
    let (header, body) = EncryptionHeader::parse(data)?;

    if header.version != HEADER_VERSION {
        return Err(CryptError::UnsupportedVersion(header.version));
    }
    if &header.algorithm != ALGORITHM_AES_256_GCM {
        return Err(CryptError::UnsupportedAlgorithm(
            String::from_utf8_lossy(&header.algorithm).trim_end_matches('\0').to_string(),
        ));
    }
    if key.len() != KEY_LEN {
        return Err(CryptError::InvalidKeyLength(key.len()));
    }

    let key = LessSafeKey::new(
        UnboundKey::new(&AES_256_GCM, key).map_err(|_| CryptError::InvalidKeyLength(key.len()))?,
    );
    let nonce = Nonce::try_assume_unique_for_key(&header.nonce).map_err(|_| CryptError::InvalidNonce)?;

    let mut buffer = Zeroizing::new(body.to_vec());
    let plaintext_len = key
        .open_in_place(nonce, Aad::empty(), buffer.as_mut_slice())
        .map_err(|_| CryptError::AuthenticationFailed)?
        .len();
    buffer.truncate(plaintext_len);

    Ok(buffer)
}

/// Encrypts `plaintext` into the image container with a fresh random nonce
pub fn encrypt_image(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptError> {
    if key.len() != KEY_LEN {
        return Err(CryptError::InvalidKeyLength(key.len()));
    }

    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new().fill(&mut nonce_bytes).map_err(|_| CryptError::RandomUnavailable)?;

    let key = LessSafeKey::new(
        UnboundKey::new(&AES_256_GCM, key).map_err(|_| CryptError::InvalidKeyLength(key.len()))?,
    );

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce_bytes), Aad::empty(), &mut in_out)
        .map_err(|_| CryptError::AuthenticationFailed)?;

    let header = EncryptionHeader {
        version: HEADER_VERSION,
        algorithm: *ALGORITHM_AES_256_GCM,
        nonce: nonce_bytes.to_vec(),
    };

    let mut out = header.to_bytes();
    out.extend_from_slice(&in_out);
    Ok(out)
}

/// Image container errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptError {
    #[error("Image does not carry an encryption header")]
    NotEncrypted,

    #[error("Encrypted image is truncated")]
    Truncated,

    #[error("Unsupported image container version: {0}")]
    UnsupportedVersion(u16),

    #[error("Unsupported image encryption algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Invalid key length: {0} bytes")]
    InvalidKeyLength(usize),

    #[error("Invalid nonce")]
    InvalidNonce,

    #[error("Authentication failed; wrong key or corrupted image")]
    AuthenticationFailed,

    #[error("System random number generator unavailable")]
    RandomUnavailable,
}
