//! Field Encryption (AES-256-GCM)
//!
//! Values are encrypted under a single 32-byte master key loaded from a key
//! file. Output layout is `nonce (12) || ciphertext || tag (16)`, base64
//! encoded for storage in text columns.

use arc_swap::ArcSwap;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::Mutex;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tenancy_common::{TenancyError, TenancyResult};

/// Master key length in bytes
pub const KEY_LEN: usize = 32;

/// Algorithm label reported by [`EncryptionManager::algorithm`]
pub const ALGORITHM: &str = "AES-256-GCM";

const TAG_LEN: usize = 16;
const KEY_ID_DOMAIN: &[u8] = b"opentenancy-key-id/1";
const CARD_MASK_PREFIX: &str = "****-****-****-";

/// Fields the platform treats as sensitive
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SensitiveField {
    /// Phone number
    Phone,
    /// Email address
    Email,
    /// Street address
    Address,
    /// Card number, stored masked + encrypted
    CreditCard,
    /// Password hash; already one-way, stored as given
    PasswordHash,
    /// Anything else; encrypted like the named fields
    Other(String),
}

impl SensitiveField {
    /// Resolve a field name
    pub fn from_name(name: &str) -> Self {
        match name {
            "phone" => Self::Phone,
            "email" => Self::Email,
            "address" => Self::Address,
            "credit_card" => Self::CreditCard,
            "password_hash" => Self::PasswordHash,
            other => Self::Other(other.to_string()),
        }
    }

    /// Field name
    pub fn name(&self) -> &str {
        match self {
            Self::Phone => "phone",
            Self::Email => "email",
            Self::Address => "address",
            Self::CreditCard => "credit_card",
            Self::PasswordHash => "password_hash",
            Self::Other(name) => name,
        }
    }
}

struct ActiveKey {
    key: LessSafeKey,
    raw: [u8; KEY_LEN],
    version: u32,
    id: String,
}

impl ActiveKey {
    fn new(raw: [u8; KEY_LEN], version: u32) -> TenancyResult<Self> {
        let unbound = UnboundKey::new(&AES_256_GCM, &raw)
            .map_err(|_| TenancyError::Configuration("invalid AES-256 key".into()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            id: key_fingerprint(&raw),
            raw,
            version,
        })
    }
}

/// Encrypts and decrypts field values under the master key
pub struct EncryptionManager {
    active: ArcSwap<ActiveKey>,
    rotation: Mutex<()>,
    rng: SystemRandom,
}

impl std::fmt::Debug for EncryptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionManager")
            .field("algorithm", &ALGORITHM)
            .field("key_version", &self.key_version())
            .field("key_id", &self.key_id())
            .finish()
    }
}

impl EncryptionManager {
    /// Load the master key from a file of exactly 32 raw bytes
    pub fn from_key_file(path: impl AsRef<Path>) -> TenancyResult<Self> {
        let raw = read_key_file(path.as_ref())?;
        let manager = Self::from_key_bytes(&raw)?;
        tracing::info!(path = %path.as_ref().display(), "Encryption key loaded");
        Ok(manager)
    }

    /// Build from raw key bytes
    pub fn from_key_bytes(bytes: &[u8]) -> TenancyResult<Self> {
        let raw = key_array(bytes)?;
        Ok(Self {
            active: ArcSwap::from_pointee(ActiveKey::new(raw, 1)?),
            rotation: Mutex::new(()),
            rng: SystemRandom::new(),
        })
    }

    /// Write a fresh random key to `path` with owner-only permissions
    pub fn generate_key_file(path: impl AsRef<Path>) -> TenancyResult<()> {
        let path = path.as_ref();
        let mut raw = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut raw)
            .map_err(|_| TenancyError::Configuration("system RNG unavailable".into()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        write_owner_only(path, &raw)?;
        tracing::info!(path = %path.display(), "Generated master key");
        Ok(())
    }

    /// Algorithm in use
    pub fn algorithm(&self) -> &'static str {
        ALGORITHM
    }

    /// Version of the active key; starts at 1 and increments per rotation.
    /// Process-local, so never persist it.
    pub fn key_version(&self) -> u32 {
        self.active.load().version
    }

    /// Fingerprint of the active key. Stable across restarts and rotations,
    /// and reveals nothing about the key itself.
    pub fn key_id(&self) -> String {
        self.active.load().id.clone()
    }

    /// Replace the active key with the one in `path`.
    ///
    /// Values encrypted under the previous key no longer decrypt; callers
    /// re-encrypt or keep the old manager around for migration.
    pub fn rotate_keys(&self, path: impl AsRef<Path>) -> TenancyResult<u32> {
        let raw = read_key_file(path.as_ref())?;
        let _serialized = self.rotation.lock();
        let version = self.key_version() + 1;
        self.active.store(Arc::new(ActiveKey::new(raw, version)?));
        tracing::warn!(key_version = version, "Encryption key rotated");
        Ok(version)
    }

    /// Encrypt raw bytes: `nonce || ciphertext || tag`
    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> TenancyResult<Vec<u8>> {
        self.seal(&self.active.load(), plaintext)
    }

    /// Encrypt a string and report which key sealed it. Both come from the
    /// same key load, so a concurrent rotation cannot split them.
    pub fn encrypt_with_key_id(&self, plaintext: &str) -> TenancyResult<(String, String)> {
        let active = self.active.load();
        let sealed = self.seal(&active, plaintext.as_bytes())?;
        Ok((STANDARD.encode(sealed), active.id.clone()))
    }

    fn seal(&self, active: &ActiveKey, plaintext: &[u8]) -> TenancyResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| TenancyError::Configuration("system RNG unavailable".into()))?;

        let mut in_out = Vec::with_capacity(NONCE_LEN + plaintext.len() + TAG_LEN);
        in_out.extend_from_slice(plaintext);

        active
            .key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| TenancyError::Integrity("encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    /// Decrypt output of [`encrypt_bytes`](Self::encrypt_bytes)
    pub fn decrypt_bytes(&self, data: &[u8]) -> TenancyResult<Vec<u8>> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(TenancyError::Integrity("ciphertext too short".into()));
        }
        let (nonce_bytes, sealed) = data.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| TenancyError::Integrity("malformed nonce".into()))?;

        let mut in_out = sealed.to_vec();
        let active = self.active.load();
        let plaintext = active
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| TenancyError::Integrity("authentication failed".into()))?;
        Ok(plaintext.to_vec())
    }

    /// Encrypt a string; base64 output
    pub fn encrypt(&self, plaintext: &str) -> TenancyResult<String> {
        Ok(STANDARD.encode(self.encrypt_bytes(plaintext.as_bytes())?))
    }

    /// Decrypt base64 output of [`encrypt`](Self::encrypt)
    pub fn decrypt(&self, encoded: &str) -> TenancyResult<String> {
        let data = STANDARD
            .decode(encoded)
            .map_err(|e| TenancyError::Integrity(format!("malformed ciphertext: {e}")))?;
        let plaintext = self.decrypt_bytes(&data)?;
        String::from_utf8(plaintext)
            .map_err(|_| TenancyError::Integrity("plaintext is not UTF-8".into()))
    }

    /// Encrypt a value for storage in the named field
    pub fn encrypt_sensitive_field(&self, field: &SensitiveField, value: &str) -> TenancyResult<String> {
        match field {
            SensitiveField::PasswordHash => Ok(value.to_string()),
            SensitiveField::CreditCard => self.encrypt_credit_card(value),
            SensitiveField::Other(name) => {
                tracing::warn!(field = %name, "Unknown sensitive field, encrypting anyway");
                self.encrypt(value)
            }
            _ => self.encrypt(value),
        }
    }

    /// Reverse of [`encrypt_sensitive_field`](Self::encrypt_sensitive_field)
    pub fn decrypt_sensitive_field(&self, field: &SensitiveField, stored: &str) -> TenancyResult<String> {
        match field {
            SensitiveField::PasswordHash => Ok(stored.to_string()),
            SensitiveField::CreditCard => self.decrypt_credit_card(stored),
            _ => self.decrypt(stored),
        }
    }

    /// Store a card number as `<mask>:<ciphertext>`. The mask keeps only the
    /// last four digits so listings never need the key.
    pub fn encrypt_credit_card(&self, card_number: &str) -> TenancyResult<String> {
        let digits: String = card_number.chars().filter(char::is_ascii_digit).collect();
        if digits.len() < 4 {
            return Err(TenancyError::Validation(
                "card number needs at least four digits".into(),
            ));
        }
        let last4 = &digits[digits.len() - 4..];
        let ciphertext = self.encrypt(card_number)?;
        Ok(format!("{CARD_MASK_PREFIX}{last4}:{ciphertext}"))
    }

    /// Full card number from the stored form
    pub fn decrypt_credit_card(&self, stored: &str) -> TenancyResult<String> {
        let (_, ciphertext) = stored
            .split_once(':')
            .ok_or_else(|| TenancyError::Integrity("stored card is missing its mask".into()))?;
        self.decrypt(ciphertext)
    }

    /// Mask portion of a stored card, no key needed
    pub fn masked_card(stored: &str) -> Option<&str> {
        stored
            .split_once(':')
            .map(|(mask, _)| mask)
            .filter(|mask| mask.starts_with(CARD_MASK_PREFIX))
    }

    /// Derive a 32-byte key from a password and salt, bound to the master key
    pub fn derive_key(&self, password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
        let active = self.active.load();
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hasher.update(salt);
        hasher.update(active.raw);
        hasher.finalize().into()
    }
}

/// First 16 bytes of a domain-separated SHA-256 over the key, hex
fn key_fingerprint(raw: &[u8; KEY_LEN]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(KEY_ID_DOMAIN);
    hasher.update(raw);
    hex::encode(&hasher.finalize()[..16])
}

fn key_array(bytes: &[u8]) -> TenancyResult<[u8; KEY_LEN]> {
    bytes.try_into().map_err(|_| {
        TenancyError::Configuration(format!(
            "master key must be {KEY_LEN} bytes, got {}",
            bytes.len()
        ))
    })
}

fn read_key_file(path: &Path) -> TenancyResult<[u8; KEY_LEN]> {
    let meta = std::fs::metadata(path).map_err(|e| {
        TenancyError::Configuration(format!("key file {}: {e}", path.display()))
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = meta.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(TenancyError::Configuration(format!(
                "key file {} is accessible to group/other (mode {:o})",
                path.display(),
                mode & 0o777
            )));
        }
    }
    #[cfg(not(unix))]
    let _ = meta;

    let bytes = std::fs::read(path).map_err(|e| {
        TenancyError::Configuration(format!("key file {}: {e}", path.display()))
    })?;
    key_array(&bytes)
}

#[cfg(unix)]
fn write_owner_only(path: &Path, bytes: &[u8]) -> TenancyResult<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn write_owner_only(path: &Path, bytes: &[u8]) -> TenancyResult<()> {
    std::fs::write(path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> EncryptionManager {
        EncryptionManager::from_key_bytes(&[7u8; KEY_LEN]).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let mgr = manager();
        let long = "x".repeat(4096);
        for plaintext in ["", "a", "+1 555 0100", "日本語の住所", long.as_str()] {
            let encrypted = mgr.encrypt(plaintext).unwrap();
            assert_eq!(mgr.decrypt(&encrypted).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_nonce_makes_ciphertexts_differ() {
        let mgr = manager();
        let a = mgr.encrypt("same value").unwrap();
        let b = mgr.encrypt("same value").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_any_flipped_byte_fails_authentication() {
        let mgr = manager();
        let sealed = mgr.encrypt_bytes(b"secret address").unwrap();
        for i in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[i] ^= 0x01;
            assert!(matches!(
                mgr.decrypt_bytes(&tampered),
                Err(TenancyError::Integrity(_))
            ));
        }

        let encoded = mgr.encrypt("secret address").unwrap();
        for i in 0..encoded.len() {
            let mut bytes = encoded.clone().into_bytes();
            bytes[i] ^= 0x01;
            let tampered = String::from_utf8(bytes).unwrap();
            assert!(mgr.decrypt(&tampered).is_err());
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let encrypted = manager().encrypt("hello").unwrap();
        let other = EncryptionManager::from_key_bytes(&[8u8; KEY_LEN]).unwrap();
        assert!(matches!(
            other.decrypt(&encrypted),
            Err(TenancyError::Integrity(_))
        ));
    }

    #[test]
    fn test_short_or_malformed_input() {
        let mgr = manager();
        assert!(matches!(mgr.decrypt_bytes(&[0u8; 10]), Err(TenancyError::Integrity(_))));
        assert!(matches!(mgr.decrypt("not base64!"), Err(TenancyError::Integrity(_))));
    }

    #[test]
    fn test_key_length_enforced() {
        assert!(matches!(
            EncryptionManager::from_key_bytes(&[1u8; 16]),
            Err(TenancyError::Configuration(_))
        ));
    }

    #[test]
    fn test_credit_card_mask() {
        let mgr = manager();
        let stored = mgr.encrypt_credit_card("4111 1111 1111 1234").unwrap();
        assert!(stored.starts_with("****-****-****-1234:"));
        assert_eq!(EncryptionManager::masked_card(&stored), Some("****-****-****-1234"));
        assert_eq!(mgr.decrypt_credit_card(&stored).unwrap(), "4111 1111 1111 1234");
        assert!(matches!(
            mgr.encrypt_credit_card("12"),
            Err(TenancyError::Validation(_))
        ));
    }

    #[test]
    fn test_sensitive_field_dispatch() {
        let mgr = manager();
        let hash = "$argon2id$v=19$abc";
        let field = SensitiveField::from_name("password_hash");
        assert_eq!(mgr.encrypt_sensitive_field(&field, hash).unwrap(), hash);

        let email = SensitiveField::from_name("email");
        let stored = mgr.encrypt_sensitive_field(&email, "a@b.io").unwrap();
        assert_ne!(stored, "a@b.io");
        assert_eq!(mgr.decrypt_sensitive_field(&email, &stored).unwrap(), "a@b.io");

        let custom = SensitiveField::from_name("tax_id");
        assert_eq!(custom.name(), "tax_id");
        let stored = mgr.encrypt_sensitive_field(&custom, "X-1").unwrap();
        assert_eq!(mgr.decrypt_sensitive_field(&custom, &stored).unwrap(), "X-1");
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        let mgr = manager();
        let a = mgr.derive_key("pw", b"salt");
        assert_eq!(a, mgr.derive_key("pw", b"salt"));
        assert_ne!(a, mgr.derive_key("pw", b"pepper"));
        let other = EncryptionManager::from_key_bytes(&[9u8; KEY_LEN]).unwrap();
        assert_ne!(a, other.derive_key("pw", b"salt"));
    }

    #[test]
    fn test_key_file_generation_and_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("keys").join("master.key");
        let second = dir.path().join("keys").join("next.key");
        EncryptionManager::generate_key_file(&first).unwrap();
        EncryptionManager::generate_key_file(&second).unwrap();
        assert_eq!(std::fs::read(&first).unwrap().len(), KEY_LEN);

        let mgr = EncryptionManager::from_key_file(&first).unwrap();
        assert_eq!(mgr.key_version(), 1);
        let old = mgr.encrypt("before").unwrap();

        assert_eq!(mgr.rotate_keys(&second).unwrap(), 2);
        assert_eq!(mgr.key_version(), 2);
        assert!(mgr.decrypt(&old).is_err());
        let new = mgr.encrypt("after").unwrap();
        assert_eq!(mgr.decrypt(&new).unwrap(), "after");
    }

    #[test]
    fn test_key_id_follows_key_material() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("master.key");
        let second = dir.path().join("next.key");
        EncryptionManager::generate_key_file(&first).unwrap();
        EncryptionManager::generate_key_file(&second).unwrap();

        let mgr = EncryptionManager::from_key_file(&first).unwrap();
        let first_id = mgr.key_id();
        assert_eq!(first_id.len(), 32);
        mgr.rotate_keys(&second).unwrap();
        let (sealed, sealed_by) = mgr.encrypt_with_key_id("after rotation").unwrap();
        assert_ne!(sealed_by, first_id);
        assert_eq!(sealed_by, mgr.key_id());

        // A restart loading the rotated key starts over at version 1 but
        // keeps the same fingerprint
        let restarted = EncryptionManager::from_key_file(&second).unwrap();
        assert_eq!(restarted.key_version(), 1);
        assert_eq!(restarted.key_id(), sealed_by);
        assert_eq!(restarted.decrypt(&sealed).unwrap(), "after rotation");
    }

    #[test]
    fn test_generate_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        EncryptionManager::generate_key_file(&path).unwrap();
        assert!(EncryptionManager::generate_key_file(&path).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_world_readable_key_rejected() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        std::fs::write(&path, [3u8; KEY_LEN]).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(matches!(
            EncryptionManager::from_key_file(&path),
            Err(TenancyError::Configuration(_))
        ));

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        assert!(EncryptionManager::from_key_file(&path).is_ok());
    }

    #[test]
    fn test_missing_key_file() {
        assert!(matches!(
            EncryptionManager::from_key_file("/nonexistent/master.key"),
            Err(TenancyError::Configuration(_))
        ));
    }
}
