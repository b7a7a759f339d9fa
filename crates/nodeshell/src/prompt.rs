//! Terminal implementations of the prompt and output sink

use nodeshell_exec::{LogSink, PassphrasePrompt};
use secrecy::SecretString;
use tracing::warn;

/// Asks for passphrases on the controlling terminal
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompt;

impl PassphrasePrompt for TerminalPrompt {
    fn ask_passphrase(&self, prompt: &str) -> Option<SecretString> {
        match dialoguer::Password::new()
            .with_prompt(prompt)
            .allow_empty_password(true)
            .interact()
        {
            Ok(passphrase) => Some(SecretString::new(passphrase)),
            Err(e) => {
                warn!(error = %e, "passphrase prompt failed");
                None
            }
        }
    }

    fn show_message(&self, text: &str) {
        eprintln!("{text}");
    }
}

/// Prints remote output as `[host] line` on stdout
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn log_line(&self, host: &str, line: &str) {
        println!("[{host}] {line}");
    }
}
