//! Durable per-device command queue.
//!
//! Each device has a gapless, ordered command log and at most one command in
//! flight. Operations on one device are serialized by a per-device async
//! mutex; every state change is a single database transaction.

mod sweeper;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use mdmgate_core::db::unix_timestamp;

use crate::storage::{
    Command, CommandStatus, DatabaseError, EnrollmentState, InFlightTransition, MdmDatabase,
    NewCommandParams, TransitionOutcome,
};

pub use sweeper::spawn_overdue_sweeper;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("unknown command {0}")]
    UnknownCommand(String),

    #[error("stale acknowledgement: expected {expected:?}, got {got}")]
    StaleAck { expected: Option<i64>, got: i64 },

    #[error("storage error: {0}")]
    Storage(#[from] DatabaseError),
}

/// Result a device reported for the in-flight command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    Acknowledged,
    Error,
    CommandFormatError,
}

impl ResultStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Acknowledged => "Acknowledged",
            Self::Error => "Error",
            Self::CommandFormatError => "CommandFormatError",
        }
    }

    const fn command_status(self) -> CommandStatus {
        match self {
            Self::Acknowledged => CommandStatus::Acknowledged,
            Self::Error | Self::CommandFormatError => CommandStatus::Failed,
        }
    }
}

/// Outcome of timing out the in-flight command.
#[derive(Debug, Clone)]
pub enum TimeoutOutcome {
    /// Back in the queue for another attempt.
    Requeued(Command),
    /// Attempt ceiling reached.
    Failed(Command),
    /// The ordinal was not in flight; nothing changed.
    NotInFlight,
}

pub struct CommandQueue {
    db: MdmDatabase,
    locks: DashMap<String, Arc<Mutex<()>>>,
    delivery_timeout_secs: i64,
    max_attempts: i64,
}

impl CommandQueue {
    pub fn new(db: MdmDatabase, delivery_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            db,
            locks: DashMap::new(),
            delivery_timeout_secs: i64::try_from(delivery_timeout.as_secs()).unwrap_or(i64::MAX),
            max_attempts: i64::from(max_attempts.max(1)),
        }
    }

    fn device_lock(&self, udid: &str) -> Arc<Mutex<()>> {
        Arc::clone(&self.locks.entry(udid.to_string()).or_default())
    }

    /// Append a command to the device's log.
    #[instrument(skip(self, payload), fields(udid = %udid))]
    pub async fn enqueue(
        &self,
        udid: &str,
        request_type: &str,
        payload: &[u8],
    ) -> Result<Command, QueueError> {
        let known = self
            .db
            .get_device(udid)
            .await?
            .is_some_and(|d| d.enrollment_state != EnrollmentState::Unenrolled);
        if !known {
            return Err(QueueError::UnknownDevice(udid.to_string()));
        }

        let lock = self.device_lock(udid);
        let _guard = lock.lock().await;

        let uuid = uuid::Uuid::new_v4().to_string().to_uppercase();
        let command = self
            .db
            .insert_command(&NewCommandParams {
                uuid: &uuid,
                device_udid: udid,
                request_type,
                payload,
            })
            .await?;

        info!(
            ordinal = command.ordinal,
            command_uuid = %command.uuid,
            request_type = %request_type,
            "Command queued"
        );
        Ok(command)
    }

    /// The command the device should work on now.
    ///
    /// Repeated calls return the same in-flight command until it is
    /// acknowledged, deferred or timed out.
    #[instrument(skip(self), fields(udid = %udid))]
    pub async fn next_for_device(&self, udid: &str) -> Result<Option<Command>, QueueError> {
        let lock = self.device_lock(udid);
        let _guard = lock.lock().await;

        let now = unix_timestamp();
        self.expire_if_overdue(udid, now).await?;

        let command = self
            .db
            .claim_next_command(udid, now, now.saturating_add(self.delivery_timeout_secs))
            .await?;
        Ok(command)
    }

    /// Record the device's result for the in-flight command.
    #[instrument(skip(self, payload), fields(udid = %udid))]
    pub async fn acknowledge(
        &self,
        udid: &str,
        ordinal: i64,
        status: ResultStatus,
        payload: Option<&[u8]>,
    ) -> Result<Command, QueueError> {
        let lock = self.device_lock(udid);
        let _guard = lock.lock().await;

        let outcome = self
            .db
            .transition_in_flight(
                udid,
                ordinal,
                InFlightTransition::Complete {
                    status: status.command_status(),
                    result_status: status.as_str(),
                    result_payload: payload,
                },
            )
            .await?;

        match outcome {
            TransitionOutcome::Applied(command) => {
                info!(ordinal, status = status.as_str(), "Command result recorded");
                Ok(command)
            }
            TransitionOutcome::Mismatch { in_flight } => {
                warn!(
                    expected = ?in_flight,
                    got = ordinal,
                    "Stale acknowledgement ignored"
                );
                Err(QueueError::StaleAck {
                    expected: in_flight,
                    got: ordinal,
                })
            }
        }
    }

    /// Translate a wire `CommandUUID` into the device's ordinal.
    pub async fn ordinal_for_uuid(&self, udid: &str, uuid: &str) -> Result<i64, QueueError> {
        self.db
            .get_command_by_uuid(uuid)
            .await?
            .filter(|c| c.device_udid == udid)
            .map(|c| c.ordinal)
            .ok_or_else(|| QueueError::UnknownCommand(uuid.to_string()))
    }

    /// `NotNow`: put the in-flight command back without counting an attempt.
    #[instrument(skip(self), fields(udid = %udid))]
    pub async fn defer(&self, udid: &str, ordinal: i64) -> Result<Command, QueueError> {
        let lock = self.device_lock(udid);
        let _guard = lock.lock().await;

        match self
            .db
            .transition_in_flight(udid, ordinal, InFlightTransition::Defer)
            .await?
        {
            TransitionOutcome::Applied(command) => {
                info!(ordinal, "Command deferred by device");
                Ok(command)
            }
            TransitionOutcome::Mismatch { in_flight } => {
                warn!(expected = ?in_flight, got = ordinal, "Stale NotNow ignored");
                Err(QueueError::StaleAck {
                    expected: in_flight,
                    got: ordinal,
                })
            }
        }
    }

    /// Time out the in-flight command regardless of its deadline.
    #[instrument(skip(self), fields(udid = %udid))]
    pub async fn timeout(&self, udid: &str, ordinal: i64) -> Result<TimeoutOutcome, QueueError> {
        let lock = self.device_lock(udid);
        let _guard = lock.lock().await;
        self.apply_timeout(udid, ordinal).await
    }

    /// Time out every in-flight command whose deadline has passed.
    /// Returns the number of commands timed out.
    pub async fn release_overdue(&self) -> Result<usize, QueueError> {
        let now = unix_timestamp();
        let overdue = self.db.list_overdue_in_flight(now).await?;

        let mut released = 0;
        for (udid, _) in overdue {
            let lock = self.device_lock(&udid);
            let _guard = lock.lock().await;
            if self.expire_if_overdue(&udid, now).await?.is_some() {
                released += 1;
            }
        }
        Ok(released)
    }

    pub async fn command_by_uuid(&self, uuid: &str) -> Result<Option<Command>, QueueError> {
        Ok(self.db.get_command_by_uuid(uuid).await?)
    }

    pub async fn list_for_device(&self, udid: &str) -> Result<Vec<Command>, QueueError> {
        if self.db.get_device(udid).await?.is_none() {
            return Err(QueueError::UnknownDevice(udid.to_string()));
        }
        Ok(self.db.list_commands(udid).await?)
    }

    /// Caller must hold the device lock.
    async fn expire_if_overdue(
        &self,
        udid: &str,
        now: i64,
    ) -> Result<Option<TimeoutOutcome>, QueueError> {
        let Some(in_flight) = self.db.get_in_flight_command(udid).await? else {
            return Ok(None);
        };
        if in_flight.deadline_at.is_some_and(|deadline| deadline > now) {
            return Ok(None);
        }
        self.apply_timeout(udid, in_flight.ordinal).await.map(Some)
    }

    /// Caller must hold the device lock.
    async fn apply_timeout(&self, udid: &str, ordinal: i64) -> Result<TimeoutOutcome, QueueError> {
        let outcome = self
            .db
            .transition_in_flight(
                udid,
                ordinal,
                InFlightTransition::Timeout {
                    max_attempts: self.max_attempts,
                },
            )
            .await?;

        Ok(match outcome {
            TransitionOutcome::Applied(command) if command.status == CommandStatus::Failed => {
                warn!(
                    udid = %udid,
                    ordinal,
                    attempts = command.attempts,
                    "Command failed after reaching the attempt ceiling"
                );
                TimeoutOutcome::Failed(command)
            }
            TransitionOutcome::Applied(command) => {
                info!(udid = %udid, ordinal, attempts = command.attempts, "Command timed out, requeued");
                TimeoutOutcome::Requeued(command)
            }
            TransitionOutcome::Mismatch { .. } => TimeoutOutcome::NotInFlight,
        })
    }
}
