use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::error::NotifyError;
use crate::rpc::RpcCommand;

/// A migration notification returned by the check-for-event call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationEvent {
    /// A migration is about to start; the pre-migration command should run and
    /// the event must be acknowledged before the notification timeout expires.
    Start(StartEvent),
    /// The host changed the notification timeout for an operation.
    TimeoutChange {
        operation_id: String,
        new_timeout_secs: u64,
    },
    /// The migration finished.
    End { operation_id: String },
    /// Nothing pending.
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartEvent {
    pub operation_id: String,
    pub notification_timeout_secs: u64,
    /// Epoch seconds at which the host generated the event.
    pub generated_at_epoch: i64,
}

impl StartEvent {
    pub fn generated_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.generated_at_epoch, 0)
    }

    /// Point after which the host no longer waits for an acknowledgment.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let timeout = i64::try_from(self.notification_timeout_secs).ok()?;
        self.generated_at()?
            .checked_add_signed(Duration::try_seconds(timeout)?)
    }

    /// An event is stale once `now` has reached its deadline.  Events whose
    /// deadline cannot be represented are treated as stale.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        match self.deadline() {
            Some(deadline) => now >= deadline,
            None => true,
        }
    }
}

/// Wire shape of a successful check-for-event reply.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EventReply {
    pub event_type: Option<String>,
    pub operation_id: Option<String>,
    pub notification_timeout_in_sec: Option<u64>,
    pub event_gen_time_in_sec: Option<i64>,
    pub new_notification_timeout_in_sec: Option<u64>,
}

/// Outcome of decoding an [`EventReply`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Decoded {
    Event(MigrationEvent),
    /// An `eventType` this client does not know about.
    Unknown(String),
}

impl EventReply {
    pub(crate) fn decode(self) -> Result<Decoded, NotifyError> {
        let Some(event_type) = self.event_type else {
            return Ok(Decoded::Event(MigrationEvent::None));
        };

        let event = match event_type.as_str() {
            "start" => MigrationEvent::Start(StartEvent {
                operation_id: required(self.operation_id, "operationId")?,
                notification_timeout_secs: required(
                    self.notification_timeout_in_sec,
                    "notificationTimeoutInSec",
                )?,
                generated_at_epoch: required(self.event_gen_time_in_sec, "eventGenTimeInSec")?,
            }),
            "timeout-change" => MigrationEvent::TimeoutChange {
                operation_id: required(self.operation_id, "operationId")?,
                new_timeout_secs: required(
                    self.new_notification_timeout_in_sec,
                    "newNotificationTimeoutInSec",
                )?,
            },
            "end" => MigrationEvent::End {
                operation_id: required(self.operation_id, "operationId")?,
            },
            _ => return Ok(Decoded::Unknown(event_type)),
        };
        Ok(Decoded::Event(event))
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, NotifyError> {
    value.ok_or_else(|| NotifyError::Protocol {
        rpc: RpcCommand::CheckForEvent.name(),
        detail: format!("event reply is missing '{field}'"),
    })
}
