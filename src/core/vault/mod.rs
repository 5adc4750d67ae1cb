use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::Result;
use base64::Engine;
use hmac::Mac;
use rusqlite::{Connection, params};
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::error::{AgentResult, DecryptionError};
use crate::core::store::NOW_SQL;

type HmacSha256 = hmac::Hmac<Sha256>;

const KEY_LABEL: &[u8] = b"flowforge-credentials-v1";

/// Derive the process-wide 256-bit credential key.
///
/// A configured passphrase wins; otherwise the key is tied to the local
/// machine/user so it stays stable across restarts.
fn derive_key(passphrase: Option<&str>) -> Result<[u8; 32]> {
    let input = match passphrase {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => {
            let hostname = hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown-host".to_string());
            format!("{}{}", hostname, whoami::username())
        }
    };

    let mut mac = <HmacSha256 as Mac>::new_from_slice(KEY_LABEL)
        .map_err(|e| anyhow::anyhow!("HMAC init failed: {}", e))?;
    mac.update(input.as_bytes());
    let bytes = mac.finalize().into_bytes();

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Active,
    Inactive,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Inactive => "inactive",
        }
    }
}

/// Decrypted credentials for one execution, keyed by service name.
///
/// `Debug` only lists service names so payloads never reach the logs.
#[derive(Clone, Default)]
pub struct Credentials(HashMap<String, Value>);

impl Credentials {
    pub fn get(&self, service: &str) -> Option<&Value> {
        self.0.get(service)
    }

    pub fn insert(&mut self, service: impl Into<String>, payload: Value) {
        self.0.insert(service.into(), payload);
    }

    pub fn services(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.0.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("services", &self.services())
            .finish()
    }
}

/// Outcome of resolving an owner's credentials. Partial results are valid.
#[derive(Debug, Default)]
pub struct ResolvedCredentials {
    pub credentials: Credentials,
    pub skipped: Vec<DecryptionError>,
}

/// Encrypted per-user service credentials.
///
/// Rows are written by the credential management layer; the execution core only
/// reads and decrypts them through [`resolve`](Self::resolve).
pub struct CredentialVault {
    db: Arc<Mutex<Connection>>,
    cipher: Aes256Gcm,
}

impl CredentialVault {
    pub fn new(db: Arc<Mutex<Connection>>, passphrase: Option<&str>) -> Result<Self> {
        let key = derive_key(passphrase)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| anyhow::anyhow!("invalid credential key: {}", e))?;
        Ok(Self { db, cipher })
    }

    pub async fn initialize(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "CREATE TABLE IF NOT EXISTS credentials (
                owner_id TEXT NOT NULL,
                service_name TEXT NOT NULL,
                encrypted_data TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                PRIMARY KEY (owner_id, service_name)
            )",
            [],
        )?;
        Ok(())
    }

    /// Encrypt a plaintext value. Returns base64(nonce || ciphertext).
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

        let mut combined = Vec::with_capacity(12 + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    /// Decrypt a base64(nonce || ciphertext) value. Returns plaintext.
    fn decrypt(&self, encoded: &str) -> Result<String> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| anyhow::anyhow!("Base64 decode failed: {}", e))?;

        if combined.len() < 13 {
            return Err(anyhow::anyhow!("Encrypted value too short"));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| anyhow::anyhow!("Decryption failed: {}", e))?;

        String::from_utf8(plaintext).map_err(|e| anyhow::anyhow!("UTF-8 decode failed: {}", e))
    }

    /// Upsert a credential as `active`.
    pub async fn store_credential(&self, owner_id: &str, service: &str, payload: &Value) -> Result<()> {
        let encrypted = self.encrypt(&serde_json::to_string(payload)?)?;
        let db = self.db.lock().await;
        db.execute(
            &format!(
                "INSERT INTO credentials (owner_id, service_name, encrypted_data, status)
                 VALUES (?1, ?2, ?3, 'active')
                 ON CONFLICT(owner_id, service_name) DO UPDATE SET
                    encrypted_data = excluded.encrypted_data,
                    status = 'active',
                    updated_at = {}",
                NOW_SQL
            ),
            params![owner_id, service, encrypted],
        )?;
        Ok(())
    }

    pub async fn set_status(
        &self,
        owner_id: &str,
        service: &str,
        status: CredentialStatus,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE credentials SET status = ?1 WHERE owner_id = ?2 AND service_name = ?3",
            params![status.as_str(), owner_id, service],
        )?;
        Ok(rows > 0)
    }

    /// Decrypt every active credential of `owner_id`.
    ///
    /// A row that fails to decrypt is logged and reported in `skipped`; the
    /// remaining credentials are still returned.
    pub async fn resolve(&self, owner_id: &str) -> AgentResult<ResolvedCredentials> {
        let rows: Vec<(String, String)> = {
            let db = self.db.lock().await;
            let mut stmt = db.prepare(
                "SELECT service_name, encrypted_data FROM credentials
                 WHERE owner_id = ?1 AND status = 'active' ORDER BY service_name",
            )?;
            let mapped = stmt.query_map(params![owner_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row?);
            }
            rows
        };

        let mut resolved = ResolvedCredentials::default();
        for (service, encrypted) in rows {
            let payload = self
                .decrypt(&encrypted)
                .and_then(|plain| serde_json::from_str::<Value>(&plain).map_err(Into::into));
            match payload {
                Ok(value) => {
                    resolved.credentials.insert(service, value);
                }
                Err(e) => {
                    let err = DecryptionError {
                        service,
                        reason: e.to_string(),
                    };
                    warn!("Skipping credential for owner {}: {}", owner_id, err);
                    resolved.skipped.push(err);
                }
            }
        }

        debug!(
            "Resolved {} credential(s) for owner {} ({} skipped)",
            resolved.credentials.len(),
            owner_id,
            resolved.skipped.len()
        );
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use serde_json::json;

    async fn test_vault() -> CredentialVault {
        let db = Connection::open_in_memory().expect("in-memory db");
        let vault = CredentialVault::new(Arc::new(Mutex::new(db)), Some("test-passphrase"))
            .expect("vault");
        vault.initialize().await.expect("init vault tables");
        vault
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let db = Connection::open_in_memory().unwrap();
        let vault = CredentialVault::new(Arc::new(Mutex::new(db)), None).unwrap();

        let plaintext = r#"{"token":"xoxb-123"}"#;
        let encrypted = vault.encrypt(plaintext).unwrap();
        assert_ne!(encrypted, plaintext);
        assert_eq!(vault.decrypt(&encrypted).unwrap(), plaintext);
    }

    #[test]
    fn encrypt_produces_different_ciphertext_each_time() {
        let db = Connection::open_in_memory().unwrap();
        let vault = CredentialVault::new(Arc::new(Mutex::new(db)), Some("k")).unwrap();
        let a = vault.encrypt("same-input").unwrap();
        let b = vault.encrypt("same-input").unwrap();
        assert_ne!(a, b, "random nonce should produce different ciphertext");
    }

    #[test]
    fn different_passphrases_cannot_read_each_other() {
        let db = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let a = CredentialVault::new(db.clone(), Some("alpha")).unwrap();
        let b = CredentialVault::new(db, Some("bravo")).unwrap();
        let sealed = a.encrypt("secret").unwrap();
        assert!(b.decrypt(&sealed).is_err());
    }

    #[test]
    fn decrypt_rejects_short_and_invalid_input() {
        let db = Connection::open_in_memory().unwrap();
        let vault = CredentialVault::new(Arc::new(Mutex::new(db)), Some("k")).unwrap();
        let short = base64::engine::general_purpose::STANDARD.encode(b"short");
        assert!(vault.decrypt(&short).is_err());
        assert!(vault.decrypt("not-valid-base64!!!").is_err());
    }

    #[tokio::test]
    async fn resolve_returns_active_credentials_by_service() {
        let vault = test_vault().await;
        vault
            .store_credential("u1", "slack", &json!({"token": "xoxb-1"}))
            .await
            .unwrap();
        vault
            .store_credential("u1", "github", &json!({"token": "ghp-1"}))
            .await
            .unwrap();
        vault
            .store_credential("u2", "slack", &json!({"token": "other"}))
            .await
            .unwrap();

        let resolved = vault.resolve("u1").await.unwrap();
        assert!(resolved.skipped.is_empty());
        assert_eq!(resolved.credentials.services(), vec!["github", "slack"]);
        assert_eq!(resolved.credentials.get("slack").unwrap()["token"], "xoxb-1");
    }

    #[tokio::test]
    async fn inactive_credentials_are_not_resolved() {
        let vault = test_vault().await;
        vault
            .store_credential("u1", "slack", &json!({"token": "xoxb-1"}))
            .await
            .unwrap();
        assert!(
            vault
                .set_status("u1", "slack", CredentialStatus::Inactive)
                .await
                .unwrap()
        );
        assert!(vault.resolve("u1").await.unwrap().credentials.is_empty());

        // Storing again re-activates.
        vault
            .store_credential("u1", "slack", &json!({"token": "xoxb-2"}))
            .await
            .unwrap();
        let resolved = vault.resolve("u1").await.unwrap();
        assert_eq!(resolved.credentials.get("slack").unwrap()["token"], "xoxb-2");
    }

    #[tokio::test]
    async fn corrupt_credential_is_skipped_not_fatal() {
        let vault = test_vault().await;
        vault
            .store_credential("u1", "slack", &json!({"token": "xoxb-1"}))
            .await
            .unwrap();
        {
            let db = vault.db.lock().await;
            db.execute(
                "INSERT INTO credentials (owner_id, service_name, encrypted_data)
                 VALUES ('u1', 'google', 'garbage')",
                [],
            )
            .unwrap();
        }

        let resolved = vault.resolve("u1").await.unwrap();
        assert_eq!(resolved.credentials.services(), vec!["slack"]);
        assert_eq!(resolved.skipped.len(), 1);
        assert_eq!(resolved.skipped[0].service, "google");
    }

    #[test]
    fn debug_output_hides_payloads() {
        let mut creds = Credentials::default();
        creds.insert("slack", json!({"token": "xoxb-secret"}));
        let printed = format!("{:?}", creds);
        assert!(printed.contains("slack"));
        assert!(!printed.contains("xoxb-secret"));
    }
}
