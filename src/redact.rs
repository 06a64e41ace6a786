//! Process-global secret redaction for log and error text.
//!
//! Credential material (tokens, passwords, private keys) is registered at
//! connector construction; any text routed through [`redact`] before being
//! logged or surfaced has those values replaced.

use std::sync::Mutex;

use once_cell::sync::Lazy;

const MASK: &str = "***";

static SECRETS: Lazy<Mutex<Vec<String>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Register a secret value for masking. Short values are ignored so the
/// mask never degenerates into replacing common substrings.
pub fn register_secret(value: &str) {
    if value.len() < 4 {
        return;
    }
    let mut secrets = SECRETS.lock().expect("redactor lock poisoned");
    if !secrets.iter().any(|s| s == value) {
        secrets.push(value.to_string());
    }
}

/// Replace every registered secret occurring in `text` with `***`.
pub fn redact(text: &str) -> String {
    let secrets = SECRETS.lock().expect("redactor lock poisoned");
    let mut out = text.to_string();
    for secret in secrets.iter() {
        if out.contains(secret.as_str()) {
            out = out.replace(secret.as_str(), MASK);
        }
    }
    out
}
