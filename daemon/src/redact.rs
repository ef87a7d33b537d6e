/// Log sink shared by the notification components.
///
/// Every component gets its own [`ServiceLog`] at construction.  Messages are
/// emitted as `tracing` events carrying a `component` field, after the active
/// registration token has been masked (when obfuscation is enabled).
use std::borrow::Cow;
use std::sync::{Arc, PoisonError, RwLock};

use crate::logging::{TIMEOUT_TARGET, VMOTION_TARGET};

/// Number of leading token characters left readable in redacted output.
pub const VISIBLE_PREFIX_CHARS: usize = 8;
/// Replaces the rest of the token.  Shaped like the tail of a UUID.
pub const MASKED_SUFFIX: &str = "-****-****-****-************";

/// Masks the active registration token in outbound log lines.
#[derive(Debug, Clone)]
pub struct Redactor {
    enabled: bool,
    token: Arc<RwLock<Option<String>>>,
}

impl Redactor {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            token: Arc::new(RwLock::new(None)),
        }
    }

    /// Sets the token to mask from now on.  Shared by every clone.
    pub fn set_token(&self, token: &str) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.to_string());
    }

    pub fn clear_token(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Returns `line` with every occurrence of the active token masked.
    pub fn redact<'a>(&self, line: &'a str) -> Cow<'a, str> {
        if !self.enabled {
            return Cow::Borrowed(line);
        }
        let guard = self.token.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_deref() {
            Some(token) if !token.is_empty() && line.contains(token) => {
                Cow::Owned(line.replace(token, &mask(token)))
            }
            _ => Cow::Borrowed(line),
        }
    }
}

/// `abcdefgh-1234-...` -> `abcdefgh-****-****-****-************`
pub fn mask(token: &str) -> String {
    let prefix: String = token.chars().take(VISIBLE_PREFIX_CHARS).collect();
    format!("{prefix}{MASKED_SUFFIX}")
}

/// Per-component handle onto the service log.
#[derive(Debug, Clone)]
pub struct ServiceLog {
    component: &'static str,
    redactor: Redactor,
}

impl ServiceLog {
    pub fn new(component: &'static str, redactor: Redactor) -> Self {
        Self { component, redactor }
    }

    /// Same sink and redactor, different component name.
    pub fn child(&self, component: &'static str) -> Self {
        Self::new(component, self.redactor.clone())
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    pub fn debug(&self, msg: impl AsRef<str>) {
        let msg = self.redactor.redact(msg.as_ref());
        tracing::debug!(component = self.component, "{msg}");
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        let msg = self.redactor.redact(msg.as_ref());
        tracing::info!(component = self.component, "{msg}");
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        let msg = self.redactor.redact(msg.as_ref());
        tracing::warn!(component = self.component, "{msg}");
    }

    /// Highest severity; used for every failure that ends or aborts a step.
    pub fn error(&self, msg: impl AsRef<str>) {
        let msg = self.redactor.redact(msg.as_ref());
        tracing::error!(component = self.component, "{msg}");
    }

    /// Dedicated migration stream (start/end events, hook boundaries).
    pub fn vmotion(&self, msg: impl AsRef<str>) {
        let msg = self.redactor.redact(msg.as_ref());
        tracing::debug!(target: VMOTION_TARGET, component = self.component, "{msg}");
    }

    /// Dedicated notification-timeout stream.
    pub fn timeout(&self, msg: impl AsRef<str>) {
        let msg = self.redactor.redact(msg.as_ref());
        tracing::warn!(target: TIMEOUT_TARGET, component = self.component, "{msg}");
    }
}
