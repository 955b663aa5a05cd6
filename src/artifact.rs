//! Rendered output and its post-processing.
//!
//! Protected artifacts are laid out as `salt (16) | nonce (12) | ciphertext+tag`.
//! The key is derived from the password with PBKDF2-HMAC-SHA256.

use std::io::Write;
use std::num::NonZeroU32;

use flate2::{write::GzEncoder, Compression};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ReportError, ReportResult};
use crate::models::ExportFormat;

const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PBKDF2_ITERATIONS: u32 = 100_000;

/// Post-processing requested for an artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactOptions {
    pub compress: bool,
    /// Present only when password protection was requested. Never persisted.
    #[serde(skip)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub format: ExportFormat,
    pub bytes: Vec<u8>,
    pub size_bytes: u64,
    /// Hex SHA-256 of `bytes`.
    pub checksum: String,
    pub compressed: bool,
    pub password_protected: bool,
}

impl Artifact {
    pub fn new(format: ExportFormat, bytes: Vec<u8>) -> Self {
        let mut artifact = Self {
            format,
            bytes: Vec::new(),
            size_bytes: 0,
            checksum: String::new(),
            compressed: false,
            password_protected: false,
        };
        artifact.replace_bytes(bytes);
        artifact
    }

    /// Rebuild a stored artifact; post-processing is read off the stored file name.
    pub fn restore(format: ExportFormat, bytes: Vec<u8>, file_path: &str) -> Self {
        let mut artifact = Self::new(format, bytes);
        artifact.password_protected = file_path.ends_with(".enc");
        artifact.compressed = file_path.trim_end_matches(".enc").ends_with(".gz");
        artifact
    }

    fn replace_bytes(&mut self, bytes: Vec<u8>) {
        self.size_bytes = bytes.len() as u64;
        self.checksum = checksum(&bytes);
        self.bytes = bytes;
    }

    /// Apply compression, then encryption, as requested.
    pub fn post_process(self, options: &ArtifactOptions) -> ReportResult<Self> {
        let mut artifact = self;
        if options.compress {
            artifact = artifact.compress()?;
        }
        if let Some(password) = options.password.as_deref() {
            artifact = artifact.protect(password)?;
        }
        Ok(artifact)
    }

    pub fn compress(mut self) -> ReportResult<Self> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&self.bytes)
            .map_err(|err| ReportError::Render(format!("gzip failed: {err}")))?;
        let compressed = encoder
            .finish()
            .map_err(|err| ReportError::Render(format!("gzip failed: {err}")))?;
        self.replace_bytes(compressed);
        self.compressed = true;
        Ok(self)
    }

    pub fn protect(mut self, password: &str) -> ReportResult<Self> {
        let sealed = encrypt(password, &self.bytes)?;
        self.replace_bytes(sealed);
        self.password_protected = true;
        Ok(self)
    }

    /// File extension including post-processing suffixes, e.g. `csv.gz.enc`.
    pub fn extension(&self) -> String {
        let mut extension = self.format.extension().to_string();
        if self.compressed {
            extension.push_str(".gz");
        }
        if self.password_protected {
            extension.push_str(".enc");
        }
        extension
    }

    pub fn content_type(&self) -> &'static str {
        if self.password_protected {
            "application/octet-stream"
        } else if self.compressed {
            "application/gzip"
        } else {
            self.format.content_type()
        }
    }
}

pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn derive_key(password: &str, salt: &[u8]) -> ReportResult<[u8; KEY_LEN]> {
    let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).ok_or(ReportError::Encryption)?;
    let mut key = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        password.as_bytes(),
        &mut key,
    );
    Ok(key)
}

fn encrypt(password: &str, plaintext: &[u8]) -> ReportResult<Vec<u8>> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt).map_err(|_| ReportError::Encryption)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| ReportError::Encryption)?;

    let key = derive_key(password, &salt)?;
    let unbound = UnboundKey::new(&AES_256_GCM, &key).map_err(|_| ReportError::Encryption)?;
    let sealing_key = LessSafeKey::new(unbound);

    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| ReportError::Encryption)?;

    let mut sealed = Vec::with_capacity(SALT_LEN + NONCE_LEN + in_out.len());
    sealed.extend_from_slice(&salt);
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&in_out);
    Ok(sealed)
}

/// Reverse `Artifact::protect`.
pub fn decrypt(password: &str, sealed: &[u8]) -> ReportResult<Vec<u8>> {
    if sealed.len() < SALT_LEN + NONCE_LEN {
        return Err(ReportError::Encryption);
    }
    let (salt, rest) = sealed.split_at(SALT_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
    let nonce_array: [u8; NONCE_LEN] = nonce_bytes
        .try_into()
        .map_err(|_| ReportError::Encryption)?;

    let key = derive_key(password, salt)?;
    let unbound = UnboundKey::new(&AES_256_GCM, &key).map_err(|_| ReportError::Encryption)?;
    let opening_key = LessSafeKey::new(unbound);

    let mut in_out = ciphertext.to_vec();
    let plaintext = opening_key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_array),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| ReportError::Encryption)?;
    Ok(plaintext.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn new_artifact_records_size_and_checksum() {
        let artifact = Artifact::new(ExportFormat::Csv, b"id\n1\n".to_vec());
        assert_eq!(artifact.size_bytes, 5);
        assert_eq!(artifact.checksum.len(), 64);
        assert_eq!(artifact.extension(), "csv");
        assert!(!artifact.compressed);
    }

    #[test]
    fn identical_bytes_share_a_checksum() {
        let a = Artifact::new(ExportFormat::Json, b"[]".to_vec());
        let b = Artifact::new(ExportFormat::Json, b"[]".to_vec());
        assert_eq!(a.checksum, b.checksum);
    }

    #[test]
    fn restored_artifact_reads_suffixes_from_the_path() {
        let artifact = Artifact::restore(ExportFormat::Csv, vec![1, 2, 3], "exports/x/bookings.csv.gz.enc");
        assert!(artifact.compressed);
        assert!(artifact.password_protected);
        assert_eq!(artifact.extension(), "csv.gz.enc");

        let plain = Artifact::restore(ExportFormat::Pdf, vec![1], "reports/x/summary.pdf");
        assert_eq!(plain.extension(), "pdf");
    }

    #[test]
    fn compression_produces_gzip_stream() {
        let body = "id,name\n".repeat(200);
        let artifact = Artifact::new(ExportFormat::Csv, body.clone().into_bytes())
            .compress()
            .unwrap();
        assert!(artifact.compressed);
        assert_eq!(artifact.extension(), "csv.gz");
        assert!(artifact.size_bytes < body.len() as u64);

        let mut decoded = String::new();
        GzDecoder::new(artifact.bytes.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn protected_artifact_opens_only_with_the_password() {
        let options = ArtifactOptions {
            compress: false,
            password: Some("correct horse".to_string()),
        };
        let artifact = Artifact::new(ExportFormat::Pdf, b"%PDF-1.4".to_vec())
            .post_process(&options)
            .unwrap();
        assert!(artifact.password_protected);
        assert_eq!(artifact.content_type(), "application/octet-stream");
        assert_eq!(decrypt("correct horse", &artifact.bytes).unwrap(), b"%PDF-1.4");
        assert!(decrypt("wrong password", &artifact.bytes).is_err());
    }
}
