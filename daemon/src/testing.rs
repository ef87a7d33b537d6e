/// Scripted collaborators for exercising the notification state machine
/// without `vmtoolsd` or real hook processes.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::NotifyError;
use crate::hook::{HookCommand, HookKind, HookOutcome, HookRunner, Hooks};
use crate::redact::{Redactor, ServiceLog};
use crate::rpc::RpcTransport;

pub const IDLE_REPLY: &str = r#"{"result": true}"#;

pub fn log() -> ServiceLog {
    ServiceLog::new("test", Redactor::new(false))
}

/// Ordered record of every RPC and hook invocation, shared between doubles.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }
}

/// Replies from a queue; once the queue is empty every call is answered with
/// an idle `{"result": true}`.
pub struct ScriptedTransport {
    journal: Journal,
    replies: Mutex<VecDeque<String>>,
    payloads: Arc<Mutex<Vec<String>>>,
    call_times: Arc<Mutex<Vec<Instant>>>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl ScriptedTransport {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            replies: Mutex::new(VecDeque::new()),
            payloads: Arc::default(),
            call_times: Arc::default(),
            cancel_after: None,
        }
    }

    pub fn reply(self, reply: impl Into<String>) -> Self {
        self.replies.lock().unwrap().push_back(reply.into());
        self
    }

    /// Cancels `token` while answering the `calls`-th request.
    pub fn cancel_after(mut self, calls: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((calls, token));
        self
    }

    pub fn payloads(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.payloads)
    }

    pub fn call_times(&self) -> Arc<Mutex<Vec<Instant>>> {
        Arc::clone(&self.call_times)
    }
}

#[async_trait]
impl RpcTransport for ScriptedTransport {
    async fn send(&self, payload: &str) -> Result<Vec<u8>, NotifyError> {
        let name = payload.split(' ').next().unwrap_or_default();
        self.journal.push(format!("rpc {name}"));
        self.call_times.lock().unwrap().push(Instant::now());

        let calls = {
            let mut payloads = self.payloads.lock().unwrap();
            payloads.push(payload.to_string());
            payloads.len()
        };
        if let Some((after, token)) = &self.cancel_after {
            if calls == *after {
                token.cancel();
            }
        }

        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| IDLE_REPLY.to_string());
        Ok(reply.into_bytes())
    }

    fn describe(&self, payload: &str) -> String {
        format!("scripted {payload}")
    }
}

/// Records hook invocations instead of running them.
pub struct RecordingHooks {
    journal: Journal,
}

impl RecordingHooks {
    pub fn new(journal: Journal) -> Self {
        Self { journal }
    }
}

#[async_trait]
impl HookRunner for RecordingHooks {
    async fn run(&self, kind: HookKind, _command: &HookCommand) -> Result<HookOutcome, NotifyError> {
        self.journal.push(format!("hook {kind}"));
        Ok(HookOutcome { exit_code: Some(0) })
    }
}

pub fn recording_hooks(journal: Journal) -> Hooks {
    Hooks {
        pre: HookCommand::parse("/usr/local/bin/app-pause").unwrap(),
        post: HookCommand::parse("/usr/local/bin/app-resume").unwrap(),
        runner: Box::new(RecordingHooks::new(journal)),
    }
}

pub fn start_reply(operation_id: &str, timeout_secs: u64, generated_at_epoch: i64) -> String {
    format!(
        r#"{{"result": true, "eventType": "start", "operationId": "{operation_id}", "notificationTimeoutInSec": {timeout_secs}, "eventGenTimeInSec": {generated_at_epoch}}}"#
    )
}

pub fn end_reply(operation_id: &str) -> String {
    format!(r#"{{"result": true, "eventType": "end", "operationId": "{operation_id}"}}"#)
}

pub fn timeout_change_reply(operation_id: &str, new_timeout_secs: u64) -> String {
    format!(
        r#"{{"result": true, "eventType": "timeout-change", "operationId": "{operation_id}", "newNotificationTimeoutInSec": {new_timeout_secs}}}"#
    )
}
