//! Command obfuscators applied when a link is delivered.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{Error, Result};

pub trait Obfuscator: Send + Sync {
    fn name(&self) -> &str;

    /// Rewrite `command` so `executor` still runs it unchanged.
    fn obfuscate(&self, executor: &str, command: &str) -> String;
}

pub struct PlainText;

impl Obfuscator for PlainText {
    fn name(&self) -> &str {
        "plain-text"
    }

    fn obfuscate(&self, _executor: &str, command: &str) -> String {
        command.to_string()
    }
}

pub struct Base64Obfuscator;

impl Obfuscator for Base64Obfuscator {
    fn name(&self) -> &str {
        "base64"
    }

    fn obfuscate(&self, executor: &str, command: &str) -> String {
        match executor {
            "sh" | "bash" | "zsh" => {
                format!("eval \"$(echo {} | base64 --decode)\"", STANDARD.encode(command))
            }
            "psh" | "pwsh" => {
                let utf16: Vec<u8> = command
                    .encode_utf16()
                    .flat_map(|unit| unit.to_le_bytes())
                    .collect();
                format!("powershell -Enc {}", STANDARD.encode(utf16))
            }
            _ => command.to_string(),
        }
    }
}

/// Look up an obfuscator by name.
pub fn obfuscator_for(name: &str) -> Result<Box<dyn Obfuscator>> {
    match name {
        "plain-text" | "" => Ok(Box::new(PlainText)),
        "base64" => Ok(Box::new(Base64Obfuscator)),
        other => Err(Error::InvalidDefinition(format!("unknown obfuscator {}", other))),
    }
}
