/// Migration-notification state machine.
///
/// One iteration polls the service for a pending event, reacts to it, and
/// sleeps for the poll interval:
///
/// ```text
///   start (fresh)   -> pre-migration hook -> ack
///   start (stale)   -> warn, nothing else (never acked)
///   timeout-change  -> log to the timeout stream -> ack
///   end             -> post-migration hook, only if a pre-migration hook ran
///   none            -> nothing
/// ```
///
/// Cancellation is cooperative: the token is checked before every poll and
/// interrupts the sleep, but never a running RPC call or hook.
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::NotifyError;
use crate::event::{MigrationEvent, StartEvent};
use crate::hook::{HookKind, Hooks};
use crate::redact::ServiceLog;
use crate::rpc::RpcGateway;
use crate::token_store::RegistrationToken;

/// State carried from one iteration to the next.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunState {
    /// Set once the pre-migration hook has run for a `start` event; cleared by
    /// the post-migration hook of the matching `end`.
    pub pre_hook_ran: bool,
}

/// What one iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Idle,
    PreHookRan { operation_id: String },
    StaleStart { operation_id: String },
    TimeoutChanged { operation_id: String, new_timeout_secs: u64 },
    PostHookRan { operation_id: String },
    PostHookSkipped { operation_id: String },
}

pub struct Dispatcher<'a> {
    gateway: &'a RpcGateway,
    hooks: &'a Hooks,
    token: &'a RegistrationToken,
    poll_interval: Duration,
    state: RunState,
    log: ServiceLog,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        gateway: &'a RpcGateway,
        hooks: &'a Hooks,
        token: &'a RegistrationToken,
        poll_interval: Duration,
        log: ServiceLog,
    ) -> Self {
        Self {
            gateway,
            hooks,
            token,
            poll_interval,
            state: RunState::default(),
            log,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Polls until `cancel` fires or an iteration fails.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), NotifyError> {
        self.log.debug(format!(
            "run: polling every {}s with token {}",
            self.poll_interval.as_secs(),
            self.token
        ));

        while !cancel.is_cancelled() {
            self.poll_once().await?;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        self.log.debug("run: stop requested, leaving poll loop");
        Ok(())
    }

    /// One check-for-event round trip and the reaction to its event.
    pub async fn poll_once(&mut self) -> Result<Outcome, NotifyError> {
        let event = self.gateway.check_for_event(self.token).await?;
        self.handle(event, Utc::now()).await
    }

    /// Reacts to `event` as observed at `now`.
    pub async fn handle(
        &mut self,
        event: MigrationEvent,
        now: DateTime<Utc>,
    ) -> Result<Outcome, NotifyError> {
        match event {
            MigrationEvent::None => Ok(Outcome::Idle),
            MigrationEvent::Start(start) => self.on_start(start, now).await,
            MigrationEvent::TimeoutChange {
                operation_id,
                new_timeout_secs,
            } => {
                self.log
                    .warn("handle: notification timeout change event received");
                self.log.warn(format!(
                    "handle: new notification timeout: {new_timeout_secs} seconds (operation '{operation_id}')"
                ));
                self.log.timeout(format!(
                    "notification timeout change for operation '{operation_id}': {new_timeout_secs} seconds"
                ));

                self.ack(&operation_id).await?;
                Ok(Outcome::TimeoutChanged {
                    operation_id,
                    new_timeout_secs,
                })
            }
            MigrationEvent::End { operation_id } => self.on_end(operation_id).await,
        }
    }

    async fn on_start(
        &mut self,
        start: StartEvent,
        now: DateTime<Utc>,
    ) -> Result<Outcome, NotifyError> {
        let StartEvent {
            operation_id,
            notification_timeout_secs,
            ..
        } = &start;

        self.log.vmotion("-".repeat(60));
        self.log.vmotion(format!(
            "vmotion start event: operation '{operation_id}', timeout {notification_timeout_secs}s, generated at {}",
            start.generated_at_epoch
        ));
        self.log
            .debug(format!("on_start: vmotion notification with operationId '{operation_id}'"));
        self.log.debug(format!(
            "on_start: notification timeout: {notification_timeout_secs} seconds"
        ));
        match start.generated_at() {
            Some(at) => self.log.debug(format!("on_start: event time: {at}")),
            None => self.log.debug(format!(
                "on_start: event time out of range: {}",
                start.generated_at_epoch
            )),
        }
        println!(
            "vmotion start with operation ID '{operation_id}' and timeout of {notification_timeout_secs} seconds."
        );

        if start.is_stale_at(now) {
            self.log
                .warn(format!("on_start: stale event - ignoring vmotion event with {operation_id}"));
            self.log
                .vmotion(format!("stale start event for '{operation_id}' ignored"));
            return Ok(Outcome::StaleStart {
                operation_id: start.operation_id,
            });
        }

        self.log.vmotion(format!(
            "pre-vmotion command starting: '{}'",
            self.hooks.pre.line()
        ));
        self.hooks.run(HookKind::Pre).await?;
        self.state.pre_hook_ran = true;
        self.log.vmotion("pre-vmotion command complete");

        self.log.vmotion("acknowledging vmotion operation");
        self.ack(operation_id).await?;
        Ok(Outcome::PreHookRan {
            operation_id: start.operation_id,
        })
    }

    async fn on_end(&mut self, operation_id: String) -> Result<Outcome, NotifyError> {
        self.log
            .vmotion(format!("vmotion end event: operation '{operation_id}'"));
        self.log.debug(format!(
            "on_end: vmotion end notification for migration id '{operation_id}'"
        ));
        println!("vmotion end with operation ID '{operation_id}'");

        if !self.state.pre_hook_ran {
            self.log
                .warn("on_end: pre command not run, not running post command");
            return Ok(Outcome::PostHookSkipped { operation_id });
        }

        self.log.vmotion(format!(
            "post-vmotion command starting: '{}'",
            self.hooks.post.line()
        ));
        self.hooks.run(HookKind::Post).await?;
        self.state.pre_hook_ran = false;
        self.log.vmotion("post-vmotion command complete");
        Ok(Outcome::PostHookRan { operation_id })
    }

    /// Acknowledges `operation_id`.  Failures propagate to the caller.
    async fn ack(&self, operation_id: &str) -> Result<(), NotifyError> {
        self.log.debug(format!(
            "ack: token '{}', operationId '{operation_id}'",
            self.token
        ));
        self.gateway.ack_event(self.token, operation_id).await?;
        self.log.debug("ack: acknowledged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcGateway;
    use crate::testing::{
        end_reply, log, recording_hooks, start_reply, timeout_change_reply, Journal,
        ScriptedTransport,
    };

    const ACK: &str = "rpc vm-operation-notification.ack-event";
    const CHECK: &str = "rpc vm-operation-notification.check-for-event";
    const PRE: &str = "hook pre-migration";
    const POST: &str = "hook post-migration";

    struct Fixture {
        journal: Journal,
        gateway: RpcGateway,
        hooks: Hooks,
        token: RegistrationToken,
    }

    impl Fixture {
        fn new(transport: impl FnOnce(Journal) -> ScriptedTransport) -> Self {
            let journal = Journal::default();
            let transport = transport(journal.clone());
            Self {
                gateway: RpcGateway::new(Box::new(transport), log()),
                hooks: recording_hooks(journal.clone()),
                token: RegistrationToken::new("tok-0123456789"),
                journal,
            }
        }

        fn dispatcher(&self, interval_secs: u64) -> Dispatcher<'_> {
            Dispatcher::new(
                &self.gateway,
                &self.hooks,
                &self.token,
                Duration::from_secs(interval_secs),
                log(),
            )
        }
    }

    fn now_epoch() -> i64 {
        Utc::now().timestamp()
    }

    // ── start ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn fresh_start_runs_pre_hook_then_acks() {
        let fx = Fixture::new(|j| ScriptedTransport::new(j).reply(start_reply("X", 30, now_epoch() - 5)));
        let mut d = fx.dispatcher(1);

        let outcome = d.poll_once().await.unwrap();

        assert_eq!(outcome, Outcome::PreHookRan { operation_id: "X".to_string() });
        assert_eq!(fx.journal.entries(), [CHECK, PRE, ACK]);
        assert!(d.state().pre_hook_ran);
    }

    #[tokio::test]
    async fn ack_carries_token_and_operation_id() {
        let journal = Journal::default();
        let transport =
            ScriptedTransport::new(journal.clone()).reply(start_reply("op-77", 30, now_epoch()));
        let payloads = transport.payloads();
        let gateway = RpcGateway::new(Box::new(transport), log());
        let hooks = recording_hooks(journal);
        let token = RegistrationToken::new("tok-0123456789");
        let mut d = Dispatcher::new(&gateway, &hooks, &token, Duration::from_secs(1), log());

        d.poll_once().await.unwrap();

        let sent = payloads.lock().unwrap();
        assert_eq!(
            sent[1],
            r#"vm-operation-notification.ack-event {"operationId":"op-77","uniqueToken":"tok-0123456789"}"#
        );
    }

    #[tokio::test]
    async fn stale_start_runs_nothing_and_is_not_acked() {
        let fx = Fixture::new(|j| ScriptedTransport::new(j).reply(start_reply("X", 30, now_epoch() - 120)));
        let mut d = fx.dispatcher(1);

        let outcome = d.poll_once().await.unwrap();

        assert_eq!(outcome, Outcome::StaleStart { operation_id: "X".to_string() });
        assert_eq!(fx.journal.entries(), [CHECK]);
        assert!(!d.state().pre_hook_ran);
    }

    #[tokio::test]
    async fn start_at_deadline_is_stale() {
        let fx = Fixture::new(|j| ScriptedTransport::new(j));
        let mut d = fx.dispatcher(1);
        let event = StartEvent {
            operation_id: "X".to_string(),
            notification_timeout_secs: 30,
            generated_at_epoch: 1_700_000_000,
        };
        let deadline = DateTime::from_timestamp(1_700_000_030, 0).unwrap();

        let outcome = d.handle(MigrationEvent::Start(event), deadline).await.unwrap();

        assert!(matches!(outcome, Outcome::StaleStart { .. }));
        assert_eq!(fx.journal.count(PRE), 0);
        assert_eq!(fx.journal.count(ACK), 0);
    }

    #[tokio::test]
    async fn failed_ack_propagates() {
        let fx = Fixture::new(|j| {
            ScriptedTransport::new(j)
                .reply(start_reply("X", 30, now_epoch()))
                .reply(r#"{"result": false, "errorMessage": "unknown operation"}"#)
        });
        let mut d = fx.dispatcher(1);

        let err = d.poll_once().await.unwrap_err();

        assert!(err.is_protocol());
        assert_eq!(fx.journal.entries(), [CHECK, PRE, ACK]);
    }

    // ── timeout-change ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn timeout_change_is_acked_without_hooks() {
        let fx = Fixture::new(|j| ScriptedTransport::new(j).reply(timeout_change_reply("X", 90)));
        let mut d = fx.dispatcher(1);

        let outcome = d.poll_once().await.unwrap();

        assert_eq!(
            outcome,
            Outcome::TimeoutChanged { operation_id: "X".to_string(), new_timeout_secs: 90 }
        );
        assert_eq!(fx.journal.entries(), [CHECK, ACK]);
    }

    // ── end ───────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn end_after_pre_hook_runs_post_hook_once() {
        let fx = Fixture::new(|j| {
            ScriptedTransport::new(j)
                .reply(start_reply("X", 30, now_epoch()))
                .reply(r#"{"result": true}"#)
                .reply(end_reply("X"))
                .reply(end_reply("X"))
        });
        let mut d = fx.dispatcher(1);

        d.poll_once().await.unwrap();
        let first_end = d.poll_once().await.unwrap();
        let second_end = d.poll_once().await.unwrap();

        assert_eq!(first_end, Outcome::PostHookRan { operation_id: "X".to_string() });
        assert_eq!(second_end, Outcome::PostHookSkipped { operation_id: "X".to_string() });
        assert_eq!(fx.journal.count(POST), 1);
        assert!(!d.state().pre_hook_ran);
    }

    #[tokio::test]
    async fn end_without_pre_hook_skips_post_hook_and_is_not_acked() {
        let fx = Fixture::new(|j| ScriptedTransport::new(j).reply(end_reply("X")));
        let mut d = fx.dispatcher(1);

        let outcome = d.poll_once().await.unwrap();

        assert_eq!(outcome, Outcome::PostHookSkipped { operation_id: "X".to_string() });
        assert_eq!(fx.journal.entries(), [CHECK]);
    }

    #[tokio::test]
    async fn end_after_stale_start_skips_post_hook() {
        let fx = Fixture::new(|j| {
            ScriptedTransport::new(j)
                .reply(start_reply("X", 30, now_epoch() - 300))
                .reply(end_reply("X"))
        });
        let mut d = fx.dispatcher(1);

        d.poll_once().await.unwrap();
        let outcome = d.poll_once().await.unwrap();

        assert!(matches!(outcome, Outcome::PostHookSkipped { .. }));
        assert_eq!(fx.journal.count(PRE), 0);
        assert_eq!(fx.journal.count(POST), 0);
    }

    // ── loop ──────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn idle_poll_does_nothing() {
        let fx = Fixture::new(|j| ScriptedTransport::new(j));
        let mut d = fx.dispatcher(1);
        assert_eq!(d.poll_once().await.unwrap(), Outcome::Idle);
        assert_eq!(fx.journal.entries(), [CHECK]);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_sleeps_exactly_the_poll_interval() {
        for interval_secs in [1, 3, 10] {
            let cancel = CancellationToken::new();
            let journal = Journal::default();
            let transport = ScriptedTransport::new(journal.clone()).cancel_after(4, cancel.clone());
            let times = transport.call_times();
            let gateway = RpcGateway::new(Box::new(transport), log());
            let hooks = recording_hooks(journal);
            let token = RegistrationToken::new("tok");
            let mut d = Dispatcher::new(
                &gateway,
                &hooks,
                &token,
                Duration::from_secs(interval_secs),
                log(),
            );

            d.run(&cancel).await.unwrap();

            let times = times.lock().unwrap();
            assert_eq!(times.len(), 4);
            for pair in times.windows(2) {
                assert_eq!(pair[1] - pair[0], Duration::from_secs(interval_secs));
            }
        }
    }

    #[tokio::test]
    async fn loop_does_not_poll_once_cancelled() {
        let fx = Fixture::new(|j| ScriptedTransport::new(j));
        let cancel = CancellationToken::new();
        cancel.cancel();

        fx.dispatcher(1).run(&cancel).await.unwrap();

        assert!(fx.journal.entries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_stops_on_failed_poll() {
        let fx = Fixture::new(|j| {
            ScriptedTransport::new(j)
                .reply(r#"{"result": true}"#)
                .reply(r#"{"result": false, "errorMessage": "Could not find application with the token."}"#)
        });
        let cancel = CancellationToken::new();

        let err = fx.dispatcher(1).run(&cancel).await.unwrap_err();

        assert!(err.is_protocol());
        assert_eq!(fx.journal.entries(), [CHECK, CHECK]);
    }
}
