/// Request/reply channel to the notification service inside the tools agent.
///
/// Every request is one text command, `<rpc-name> <json-params>`, handed to an
/// external transport executable (`vmtoolsd --cmd` by default).  The reply is a
/// JSON object with a boolean `result`; a falsy `result` is turned into
/// [`NotifyError::Rpc`] here, and command-specific fields are decoded into
/// typed values before they reach the dispatcher.
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::process::Command;

use crate::error::NotifyError;
use crate::event::{Decoded, EventReply, MigrationEvent};
use crate::redact::ServiceLog;
use crate::token_store::RegistrationToken;

pub const DEFAULT_TRANSPORT_COMMAND: &str = "vmtoolsd --cmd";

/// The only notification type this client subscribes to.
pub const NOTIFICATION_TYPES: [&str; 1] = ["sla-miss"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCommand {
    Register,
    Unregister,
    CheckForEvent,
    AckEvent,
}

impl RpcCommand {
    pub fn name(self) -> &'static str {
        match self {
            RpcCommand::Register => "vm-operation-notification.register",
            RpcCommand::Unregister => "vm-operation-notification.unregister",
            RpcCommand::CheckForEvent => "vm-operation-notification.check-for-event",
            RpcCommand::AckEvent => "vm-operation-notification.ack-event",
        }
    }
}

/// Builds the single text command sent to the transport.
pub fn payload(command: RpcCommand, params: Option<&Value>) -> String {
    let params = params.map(Value::to_string).unwrap_or_default();
    format!("{} {params}", command.name())
}

// ── Transport ──────────────────────────────────────────────────────────────────

/// Executes one request and returns the raw reply bytes.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn send(&self, payload: &str) -> Result<Vec<u8>, NotifyError>;

    /// Printable form of the full request, for the debug log.
    fn describe(&self, payload: &str) -> String;
}

/// Runs the transport executable once per request, passing the payload as a
/// single argument, and captures its output.
#[derive(Debug, Clone)]
pub struct ProcessTransport {
    program: String,
    args: Vec<String>,
}

impl ProcessTransport {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Parses a prefix such as `vmtoolsd --cmd` with shell quoting rules.
    pub fn from_command_line(line: &str) -> Result<Self, NotifyError> {
        let mut argv = shlex::split(line)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| NotifyError::InvalidCommand(line.to_string()))?;
        let program = argv.remove(0);
        Ok(Self::new(program, argv))
    }
}

#[async_trait]
impl RpcTransport for ProcessTransport {
    async fn send(&self, payload: &str) -> Result<Vec<u8>, NotifyError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(payload)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| NotifyError::Transport {
                program: self.program.clone(),
                source,
            })?;

        let mut reply = output.stdout;
        reply.extend_from_slice(&output.stderr);
        Ok(reply)
    }

    fn describe(&self, payload: &str) -> String {
        let quoted = shlex::try_quote(payload)
            .map(|q| q.into_owned())
            .unwrap_or_else(|_| payload.to_string());
        let mut parts = Vec::with_capacity(self.args.len() + 2);
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        parts.push(quoted);
        parts.join(" ")
    }
}

// ── Gateway ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error_message: Option<String>,
}

pub struct RpcGateway {
    transport: Box<dyn RpcTransport>,
    log: ServiceLog,
}

impl RpcGateway {
    pub fn new(transport: Box<dyn RpcTransport>, log: ServiceLog) -> Self {
        Self { transport, log }
    }

    /// Sends one command and returns the reply object.  No retries.
    pub async fn call(
        &self,
        command: RpcCommand,
        params: Option<&Value>,
    ) -> Result<Map<String, Value>, NotifyError> {
        let rpc = command.name();
        let payload = payload(command, params);
        self.log.debug(format!(
            "call: running cmd: {}",
            self.transport.describe(&payload)
        ));

        let raw = self.transport.send(&payload).await?;
        let reply: Map<String, Value> = serde_json::from_slice(&raw).map_err(|source| {
            self.log.error(format!(
                "call: {rpc}: unparseable reply '{}'",
                String::from_utf8_lossy(&raw).trim_end()
            ));
            NotifyError::MalformedReply { rpc, source }
        })?;
        self.log.debug(format!("call: {rpc}: reply {}", Value::Object(reply.clone())));

        let envelope: Envelope = serde_json::from_value(Value::Object(reply.clone()))
            .map_err(|source| NotifyError::MalformedReply { rpc, source })?;
        if !is_truthy(&envelope.result) {
            let err = NotifyError::Rpc {
                rpc,
                message: envelope.error_message,
            };
            self.log.error(format!("call: {err}"));
            return Err(err);
        }
        Ok(reply)
    }

    /// Registers `app_name` for migration notifications.  A reply without a
    /// token is a protocol violation.
    pub async fn register(&self, app_name: &str) -> Result<RegistrationToken, NotifyError> {
        let params = json!({ "appName": app_name, "notificationTypes": NOTIFICATION_TYPES });
        let reply = self.call(RpcCommand::Register, Some(&params)).await?;
        match reply.get("uniqueToken").and_then(Value::as_str) {
            Some(token) if !token.is_empty() => Ok(RegistrationToken::new(token)),
            _ => {
                let err = NotifyError::Protocol {
                    rpc: RpcCommand::Register.name(),
                    detail: "No token was returned.".to_string(),
                };
                self.log.error(format!("register: {err}"));
                Err(err)
            }
        }
    }

    pub async fn unregister(&self, token: &RegistrationToken) -> Result<(), NotifyError> {
        let params = json!({ "uniqueToken": token.as_str() });
        self.call(RpcCommand::Unregister, Some(&params)).await?;
        Ok(())
    }

    pub async fn check_for_event(
        &self,
        token: &RegistrationToken,
    ) -> Result<MigrationEvent, NotifyError> {
        let params = json!({ "uniqueToken": token.as_str() });
        let rpc = RpcCommand::CheckForEvent.name();
        let reply = self.call(RpcCommand::CheckForEvent, Some(&params)).await?;
        let reply: EventReply = serde_json::from_value(Value::Object(reply))
            .map_err(|source| NotifyError::MalformedReply { rpc, source })?;

        match reply.decode()? {
            Decoded::Event(event) => Ok(event),
            Decoded::Unknown(event_type) => {
                self.log
                    .warn(format!("check_for_event: ignoring unknown event type '{event_type}'"));
                Ok(MigrationEvent::None)
            }
        }
    }

    pub async fn ack_event(
        &self,
        token: &RegistrationToken,
        operation_id: &str,
    ) -> Result<(), NotifyError> {
        let params = json!({ "uniqueToken": token.as_str(), "operationId": operation_id });
        self.call(RpcCommand::AckEvent, Some(&params)).await?;
        Ok(())
    }
}

/// `result` is normally a bool, but any JSON-truthy value is accepted.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
