//! Passphrase and confirmation handling for key-based authentication
//!
//! [`CredentialProvider`] sits between the transport and whatever can talk to
//! the user ([`PassphrasePrompt`]). It asks at most once per identity: the key
//! material does not change between connections to different hosts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::keys::IdentityId;

/// Something that can ask the user for a secret
pub trait PassphrasePrompt: Send + Sync {
    /// Ask for a passphrase; `None` means the user declined
    fn ask_passphrase(&self, prompt: &str) -> Option<SecretString>;

    /// Best-effort notification
    fn show_message(&self, text: &str);
}

/// Prompt that never asks and always declines
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrompt;

impl PassphrasePrompt for NoPrompt {
    fn ask_passphrase(&self, _prompt: &str) -> Option<SecretString> {
        None
    }

    fn show_message(&self, _text: &str) {}
}

#[derive(Clone)]
enum CachedAnswer {
    Passphrase(SecretString),
    Declined,
}

/// Per-identity passphrase cache in front of a [`PassphrasePrompt`]
///
/// Shared across concurrent executions; callers asking for the same identity
/// at the same time are serialised so only one of them prompts.
pub struct CredentialProvider {
    prompt: Box<dyn PassphrasePrompt>,
    display_enabled: AtomicBool,
    cache: Mutex<HashMap<IdentityId, CachedAnswer>>,
}

impl std::fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialProvider")
            .field("display_enabled", &self.is_display_enabled())
            .field("cached", &self.lock_cache().len())
            .finish_non_exhaustive()
    }
}

impl CredentialProvider {
    /// Create a provider with display enabled
    pub fn new(prompt: impl PassphrasePrompt + 'static) -> Self {
        Self {
            prompt: Box::new(prompt),
            display_enabled: AtomicBool::new(true),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<IdentityId, CachedAnswer>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Passphrase obtained for `identity`, if any
    #[must_use]
    pub fn get_passphrase(&self, identity: &IdentityId) -> Option<SecretString> {
        match self.lock_cache().get(identity) {
            Some(CachedAnswer::Passphrase(secret)) => Some(secret.clone()),
            Some(CachedAnswer::Declined) | None => None,
        }
    }

    /// Ask for the passphrase of `identity` unless an answer is already cached
    ///
    /// Returns whether authentication should proceed. With display disabled
    /// nothing is shown: a cached answer wins, otherwise the default is to
    /// proceed without a passphrase.
    pub fn prompt_passphrase(&self, identity: &IdentityId, prompt: &str) -> bool {
        let mut cache = self.lock_cache();

        if let Some(answer) = cache.get(identity) {
            debug!(identity = %identity, "using cached passphrase answer");
            return matches!(answer, CachedAnswer::Passphrase(_));
        }

        if !self.is_display_enabled() {
            debug!(identity = %identity, "display disabled, not prompting");
            return true;
        }

        let answer = match self.prompt.ask_passphrase(prompt) {
            Some(secret) => CachedAnswer::Passphrase(secret),
            None => {
                info!(identity = %identity, "passphrase prompt declined");
                CachedAnswer::Declined
            }
        };
        let proceed = matches!(answer, CachedAnswer::Passphrase(_));
        cache.insert(identity.clone(), answer);
        proceed
    }

    /// Confirmation prompts (unknown host keys and the like) are accepted
    pub fn prompt_yes_no(&self, prompt: &str) -> bool {
        warn!(prompt = %prompt, "auto-accepting confirmation");
        true
    }

    /// Forward a message to the prompt when display is enabled
    pub fn show_message(&self, text: &str) {
        info!(text = %text, "transport message");
        if self.is_display_enabled() {
            self.prompt.show_message(text);
        }
    }

    pub fn enable_display(&self) {
        self.display_enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable_display(&self) {
        self.display_enabled.store(false, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_display_enabled(&self) -> bool {
        self.display_enabled.load(Ordering::Relaxed)
    }

    /// Forget the answer for `identity` so the next use prompts again
    pub fn reset(&self, identity: &IdentityId) {
        self.lock_cache().remove(identity);
    }

    pub fn reset_all(&self) {
        self.lock_cache().clear();
    }
}
