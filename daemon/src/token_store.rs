use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;

use crate::error::NotifyError;
use crate::redact::ServiceLog;

/// Opaque token issued by the notification service on registration.
/// Required by every later call made on behalf of this registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationToken(String);

impl RegistrationToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegistrationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable copy of the registration token, so that a restarted daemon can
/// unregister a token left behind by a run that was killed uncleanly.
///
/// Permission problems on write/delete are logged and swallowed: the service
/// keeps running without a durable token.
pub struct TokenStore {
    path: PathBuf,
    log: ServiceLog,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>, log: ServiceLog) -> Self {
        Self {
            path: path.into(),
            log,
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Writes exactly the token bytes (no trailing newline), creating the
    /// parent directory if it does not exist.
    pub fn write(&self, token: &RegistrationToken) -> Result<(), NotifyError> {
        self.log.debug(format!(
            "write: writing token {token} to {}",
            self.path.display()
        ));
        let result = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
            _ => Ok(()),
        }
        .and_then(|()| std::fs::write(&self.path, token.as_str()));

        match result {
            Ok(()) => {
                self.log
                    .debug(format!("write: token written to {}", self.path.display()));
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                self.log.error(format!("write: {e}"));
                self.log.error(format!(
                    "write: could not save token to {}",
                    self.path.display()
                ));
                Ok(())
            }
            Err(e) => {
                self.log.error(format!("write: {e}"));
                Err(self.file_error(e))
            }
        }
    }

    /// Returns the first line of the token file, or `None` if there is no file
    /// (or it is empty).
    pub fn read(&self) -> Result<Option<RegistrationToken>, NotifyError> {
        self.log
            .debug(format!("read: reading token from {}", self.path.display()));
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.log
                    .debug(format!("read: no token file at {}", self.path.display()));
                return Ok(None);
            }
            Err(e) => return Err(self.file_error(e)),
        };

        let token = content
            .lines()
            .next()
            .filter(|line| !line.is_empty())
            .map(RegistrationToken::new);
        match &token {
            Some(t) => self.log.debug(format!("read: read token {t}")),
            None => self.log.debug("read: token file is empty"),
        }
        Ok(token)
    }

    /// Removes the token file.  A missing file is not an error.
    pub fn delete(&self) -> Result<(), NotifyError> {
        self.log
            .debug(format!("delete: deleting token at {}", self.path.display()));
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.log.debug(format!(
                    "delete: no token file to delete at {}",
                    self.path.display()
                ));
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                self.log.error(format!("delete: {e}"));
                self.log.error(format!(
                    "delete: could not delete the token file at {}",
                    self.path.display()
                ));
                Ok(())
            }
            Err(e) => Err(self.file_error(e)),
        }
    }

    fn file_error(&self, source: std::io::Error) -> NotifyError {
        NotifyError::TokenFile {
            path: self.path.clone(),
            source,
        }
    }
}
