//! SSH identity loading and unlocking

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::keys::{PrivateKey, decode_secret_key};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use crate::credentials::CredentialProvider;
use crate::error::TransportError;

/// SSH key resolution strategy
#[derive(Debug, Clone)]
pub enum KeySource {
    /// Explicit path to key file
    Path(PathBuf),
    /// Base64-encoded key from environment
    Env(String),
}

/// Stable name of an identity, used to key cached passphrases
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Private key material read once from a [`KeySource`]
///
/// Decryption happens per session in [`Identity::unlock`], with the
/// passphrase coming from the shared [`CredentialProvider`].
pub struct Identity {
    id: IdentityId,
    material: SecretString,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Identity {
    /// Read the key material behind `source`
    ///
    /// # Errors
    /// Returns `KeyError` if the key cannot be read (missing file, loose
    /// permissions, env not set, invalid base64)
    pub fn from_source(source: &KeySource) -> Result<Self, KeyError> {
        match source {
            KeySource::Path(path) => {
                if !path.exists() {
                    return Err(KeyError::NotFound(path.display().to_string()));
                }
                validate_key_permissions(path)?;
                let material = std::fs::read_to_string(path)?;
                debug!(path = %path.display(), "loaded SSH identity");
                Ok(Self::from_pem(path.display().to_string(), material))
            }
            KeySource::Env(var_name) => {
                let base64_key =
                    env::var(var_name).map_err(|_| KeyError::EnvNotSet(var_name.clone()))?;
                let key_data = base64_decode(&base64_key).map_err(|_| KeyError::InvalidBase64)?;
                let material = String::from_utf8(key_data).map_err(|_| KeyError::InvalidBase64)?;
                debug!(var = %var_name, "loaded SSH identity from environment");
                Ok(Self::from_pem(format!("env:{var_name}"), material))
            }
        }
    }

    /// Wrap PEM/OpenSSH key text already in memory
    pub fn from_pem(name: impl Into<String>, material: String) -> Self {
        Self {
            id: IdentityId::new(name),
            material: SecretString::new(material),
        }
    }

    #[must_use]
    pub fn id(&self) -> &IdentityId {
        &self.id
    }

    /// Decode the private key, asking `credentials` for a passphrase if the
    /// key is encrypted
    ///
    /// A wrong passphrase clears the cached answer so the next session asks
    /// again.
    ///
    /// # Errors
    /// `TransportError::AuthCancelled` when the prompt is declined,
    /// `TransportError::AuthRejected` when the key cannot be decoded
    pub fn unlock(&self, credentials: &CredentialProvider) -> Result<PrivateKey, TransportError> {
        let material = self.material.expose_secret();

        match decode_secret_key(material, None) {
            Ok(key) => return Ok(key),
            Err(russh::keys::Error::KeyIsEncrypted) => {}
            Err(e) => {
                return Err(TransportError::AuthRejected(format!("{}: {e}", self.id)));
            }
        }

        let prompt = format!("Enter passphrase for key {}", self.id);
        if !credentials.prompt_passphrase(&self.id, &prompt) {
            return Err(TransportError::AuthCancelled);
        }

        let passphrase = credentials.get_passphrase(&self.id);
        decode_secret_key(
            material,
            passphrase.as_ref().map(|p| p.expose_secret().as_str()),
        )
        .map_err(|e| {
            warn!(identity = %self.id, error = %e, "could not decrypt key");
            credentials.reset(&self.id);
            TransportError::AuthRejected(format!("{}: {e}", self.id))
        })
    }
}

/// Decrypted key, ready to sign authentication requests
#[derive(Clone)]
pub struct UnlockedKey {
    id: IdentityId,
    key: Arc<PrivateKey>,
}

impl fmt::Debug for UnlockedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnlockedKey").field("id", &self.id).finish_non_exhaustive()
    }
}

impl UnlockedKey {
    pub fn new(id: IdentityId, key: PrivateKey) -> Self {
        Self {
            id,
            key: Arc::new(key),
        }
    }

    #[must_use]
    pub fn id(&self) -> &IdentityId {
        &self.id
    }

    #[must_use]
    pub fn key(&self) -> &Arc<PrivateKey> {
        &self.key
    }
}

/// Unlock every identity that can be unlocked, in order
///
/// Runs on the blocking pool since unlocking may sit in a prompt for as long
/// as the user takes to answer. Identities that fail are skipped.
///
/// # Errors
/// The error of the last identity when none could be unlocked
pub async fn unlock_all(
    identities: &[Arc<Identity>],
    credentials: &Arc<CredentialProvider>,
) -> Result<Vec<UnlockedKey>, TransportError> {
    let mut keys = Vec::with_capacity(identities.len());
    let mut last_error = None;

    for identity in identities {
        let unlocking = identity.clone();
        let credentials = credentials.clone();
        let unlocked = tokio::task::spawn_blocking(move || unlocking.unlock(&credentials))
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        match unlocked {
            Ok(key) => keys.push(UnlockedKey::new(identity.id().clone(), key)),
            Err(e) => {
                debug!(identity = %identity.id(), error = %e, "identity unavailable");
                last_error = Some(e);
            }
        }
    }

    if keys.is_empty() {
        return Err(last_error.unwrap_or_else(|| {
            TransportError::AuthRejected("no identity configured".to_string())
        }));
    }
    Ok(keys)
}

/// Key resolution errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("key file not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn base64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input.trim())
}

#[cfg(unix)]
fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)?.permissions().mode();

    // group and other bits must be clear
    if mode & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_key_permissions(_path: &Path) -> Result<(), KeyError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use secrecy::SecretString;

    use super::*;
    use crate::credentials::{NoPrompt, PassphrasePrompt};

    const PLAIN_KEY: &str = include_str!("../tests/fixtures/id_ed25519");
    /// Same kind of key, encrypted with the passphrase `pw`
    const ENCRYPTED_KEY: &str = include_str!("../tests/fixtures/id_ed25519_encrypted");

    /// Answers every prompt with the next scripted reply
    struct ScriptedPrompt {
        replies: Vec<Option<&'static str>>,
        asked: Arc<AtomicUsize>,
    }

    impl ScriptedPrompt {
        fn provider(replies: Vec<Option<&'static str>>) -> (CredentialProvider, Arc<AtomicUsize>) {
            let asked = Arc::new(AtomicUsize::new(0));
            let prompt = Self {
                replies,
                asked: asked.clone(),
            };
            (CredentialProvider::new(prompt), asked)
        }
    }

    impl PassphrasePrompt for ScriptedPrompt {
        fn ask_passphrase(&self, _prompt: &str) -> Option<SecretString> {
            let n = self.asked.fetch_add(1, Ordering::SeqCst);
            self.replies[n].map(|s| SecretString::new(s.to_string()))
        }

        fn show_message(&self, _text: &str) {}
    }

    fn encrypted() -> Identity {
        Identity::from_pem("id_encrypted", ENCRYPTED_KEY.to_string())
    }

    #[test]
    fn test_missing_file() {
        let source = KeySource::Path(PathBuf::from("/nonexistent/nodeshell/id_ed25519"));
        assert!(matches!(
            Identity::from_source(&source),
            Err(KeyError::NotFound(_))
        ));
    }

    #[test]
    fn test_env_not_set() {
        let source = KeySource::Env("NODESHELL_TEST_KEY_THAT_IS_NOT_SET".to_string());
        assert!(matches!(
            Identity::from_source(&source),
            Err(KeyError::EnvNotSet(_))
        ));
    }

    #[test]
    fn test_base64_decode_trims() {
        assert_eq!(base64_decode(" aGVsbG8=\n").unwrap(), b"hello");
        assert!(base64_decode("not base64!").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_loose_permissions_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let path = std::env::temp_dir().join(format!("nodeshell_perm_test_{}", std::process::id()));
        std::fs::write(&path, "key").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let result = Identity::from_source(&KeySource::Path(path.clone()));
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(result, Err(KeyError::BadPermissions(_))));
    }

    #[test]
    fn test_garbage_key_is_rejected_without_prompting() {
        let identity = Identity::from_pem("garbage", "not a key".to_string());
        let credentials = CredentialProvider::new(NoPrompt);
        assert!(matches!(
            identity.unlock(&credentials),
            Err(TransportError::AuthRejected(_))
        ));
    }

    #[test]
    fn test_plain_key_unlocks_without_prompting() {
        let (credentials, asked) = ScriptedPrompt::provider(vec![]);
        let identity = Identity::from_pem("id_plain", PLAIN_KEY.to_string());

        assert!(identity.unlock(&credentials).is_ok());
        assert_eq!(asked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_encrypted_key_prompts_once() {
        let (credentials, asked) = ScriptedPrompt::provider(vec![Some("pw")]);
        let identity = encrypted();

        assert!(identity.unlock(&credentials).is_ok());
        assert!(identity.unlock(&credentials).is_ok());
        assert_eq!(asked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_declined_prompt_cancels() {
        let (credentials, asked) = ScriptedPrompt::provider(vec![None]);
        let identity = encrypted();

        assert!(matches!(
            identity.unlock(&credentials),
            Err(TransportError::AuthCancelled)
        ));
        assert!(matches!(
            identity.unlock(&credentials),
            Err(TransportError::AuthCancelled)
        ));
        assert_eq!(asked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wrong_passphrase_asks_again() {
        let (credentials, asked) = ScriptedPrompt::provider(vec![Some("wrong"), Some("pw")]);
        let identity = encrypted();

        assert!(matches!(
            identity.unlock(&credentials),
            Err(TransportError::AuthRejected(_))
        ));
        assert!(credentials.get_passphrase(identity.id()).is_none());

        assert!(identity.unlock(&credentials).is_ok());
        assert_eq!(asked.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_encrypted_key_with_display_disabled_is_rejected() {
        let (credentials, asked) = ScriptedPrompt::provider(vec![]);
        credentials.disable_display();

        assert!(matches!(
            encrypted().unlock(&credentials),
            Err(TransportError::AuthRejected(_))
        ));
        assert_eq!(asked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unlock_all_skips_unusable_identities() {
        let credentials = Arc::new(CredentialProvider::new(NoPrompt));
        let identities = vec![
            Arc::new(encrypted()),
            Arc::new(Identity::from_pem("id_plain", PLAIN_KEY.to_string())),
        ];

        let keys = unlock_all(&identities, &credentials).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].id(), &IdentityId::new("id_plain"));
    }

    #[tokio::test]
    async fn test_unlock_all_reports_last_error() {
        let credentials = Arc::new(CredentialProvider::new(NoPrompt));

        let result = unlock_all(&[Arc::new(encrypted())], &credentials).await;
        assert!(matches!(result, Err(TransportError::AuthCancelled)));

        let result = unlock_all(&[], &credentials).await;
        assert!(matches!(result, Err(TransportError::AuthRejected(_))));
    }

    #[test]
    fn test_debug_hides_material() {
        let identity = Identity::from_pem("id_test", "SECRET".to_string());
        let rendered = format!("{identity:?}");
        assert!(rendered.contains("id_test"));
        assert!(!rendered.contains("SECRET"));
    }
}
