/// Lifecycle of one daemon run: clean up after a previous crash, register,
/// poll until told to stop, then always unregister and remove the token file.
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;
use crate::error::NotifyError;
use crate::hook::Hooks;
use crate::redact::ServiceLog;
use crate::rpc::RpcGateway;
use crate::token_store::{RegistrationToken, TokenStore};

/// Core settings; everything else is already wired into the collaborators.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub app_name: String,
    pub poll_interval: Duration,
    /// Mirror the registration token to the token file.
    pub persist_token: bool,
}

pub struct NotificationService {
    settings: ServiceSettings,
    gateway: RpcGateway,
    store: TokenStore,
    hooks: Hooks,
    token: Option<RegistrationToken>,
    log: ServiceLog,
}

impl NotificationService {
    pub fn new(
        settings: ServiceSettings,
        gateway: RpcGateway,
        store: TokenStore,
        hooks: Hooks,
        log: ServiceLog,
    ) -> Self {
        Self {
            settings,
            gateway,
            store,
            hooks,
            token: None,
            log,
        }
    }

    #[cfg(test)]
    pub fn token(&self) -> Option<&RegistrationToken> {
        self.token.as_ref()
    }

    /// Runs until SIGINT/SIGTERM (Ctrl+C elsewhere) or a fatal error.
    pub async fn run_until_signalled(&mut self) {
        let cancel = CancellationToken::new();
        let listener = tokio::spawn(cancel_on_signal(cancel.clone(), self.log.clone()));
        self.run(&cancel).await;
        listener.abort();
    }

    /// Full lifecycle.  Never fails: errors are logged and end the run, and
    /// cleanup is performed however the poll loop exited.
    pub async fn run(&mut self, cancel: &CancellationToken) {
        self.startup_cleanup().await;

        match self.register_and_poll(cancel).await {
            Ok(()) => {}
            Err(e) if e.is_protocol() => self.log.error(format!("run: {e}")),
            Err(e) => self.log.error(format!("run: unexpected error: {e}")),
        }

        self.log.debug("run: cleaning up");
        self.unregister_for_notification().await;
        if let Err(e) = self.store.delete() {
            self.log.error(format!("run: {e}"));
        }
        self.token = None;
        self.log.redactor().clear_token();
    }

    /// Unregisters a token left behind by a run that did not shut down
    /// cleanly.  Best-effort.
    async fn startup_cleanup(&mut self) {
        match self.store.read() {
            Ok(Some(stale)) => {
                self.log.redactor().set_token(stale.as_str());
                self.token = Some(stale);
                self.unregister_for_notification().await;
                self.token = None;
            }
            Ok(None) => self
                .log
                .debug("startup_cleanup: no existing tokens to unregister"),
            Err(e) => self.log.warn(format!("startup_cleanup: {e}")),
        }
    }

    async fn register_and_poll(&mut self, cancel: &CancellationToken) -> Result<(), NotifyError> {
        let token = self.register_for_notification().await?;
        self.log.redactor().set_token(token.as_str());
        self.token = Some(token.clone());

        if self.settings.persist_token {
            self.store.write(&token)?;
        }

        let mut dispatcher = Dispatcher::new(
            &self.gateway,
            &self.hooks,
            &token,
            self.settings.poll_interval,
            self.log.child("dispatcher"),
        );
        dispatcher.run(cancel).await
    }

    pub async fn register_for_notification(&self) -> Result<RegistrationToken, NotifyError> {
        self.log.debug(format!(
            "register_for_notification: registering '{}'",
            self.settings.app_name
        ));
        let token = self.gateway.register(&self.settings.app_name).await?;
        self.log
            .debug("register_for_notification: registration successful");
        Ok(token)
    }

    /// Unregisters the held token, if any.  Failures are logged, not raised.
    pub async fn unregister_for_notification(&self) {
        let Some(token) = &self.token else {
            self.log
                .debug("unregister_for_notification: no token to unregister");
            return;
        };

        self.log
            .debug(format!("unregister_for_notification: unregister token {token}"));
        match self.gateway.unregister(token).await {
            Ok(()) => self
                .log
                .debug(format!("unregister_for_notification: unregistered token {token}")),
            Err(e) => self.log.warn(format!("unregister_for_notification: {e}")),
        }
    }
}

/// Cancels `cancel` on the first stop signal.  The poll loop notices at its
/// next suspension point.
async fn cancel_on_signal(cancel: CancellationToken, log: ServiceLog) {
    let signame = wait_for_stop_signal().await;
    log.debug(format!("stop: received stop request from {signame}"));
    cancel.cancel();
}

#[cfg(unix)]
async fn wait_for_stop_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigint, mut sigterm) =
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(i), Ok(t)) => (i, t),
            (Err(e), _) | (_, Err(e)) => {
                eprintln!("[signal] Failed to install stop handlers ({e}); falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return "SIGINT";
            }
        };

    tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "Ctrl+C"
}
