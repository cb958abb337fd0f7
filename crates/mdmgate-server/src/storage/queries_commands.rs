//! Command log queries.
//!
//! Every state change runs in one transaction. The in-flight invariant is
//! also enforced by `idx_commands_in_flight`.

use super::models::{Command, CommandStatus};
use super::{DatabaseError, MdmDatabase};
use mdmgate_core::db::unix_timestamp;

/// Parameters for appending a command to a device's log.
pub struct NewCommandParams<'a> {
    pub uuid: &'a str,
    pub device_udid: &'a str,
    pub request_type: &'a str,
    pub payload: &'a [u8],
}

/// A state change applied to the in-flight command.
#[derive(Debug, Clone, Copy)]
pub enum InFlightTransition<'a> {
    /// The device reported a result.
    Complete {
        status: CommandStatus,
        result_status: &'a str,
        result_payload: Option<&'a [u8]>,
    },
    /// `NotNow`: back to the queue, attempt not counted.
    Defer,
    /// Deadline passed: back to the queue, or failed at the attempt ceiling.
    Timeout { max_attempts: i64 },
}

/// Result of [`MdmDatabase::transition_in_flight`].
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied(Command),
    /// The ordinal did not match; nothing was changed.
    Mismatch { in_flight: Option<i64> },
}

const SELECT_IN_FLIGHT: &str =
    "SELECT * FROM commands WHERE device_udid = ? AND status = 'sent' LIMIT 1";

impl MdmDatabase {
    // =========================================================================
    // Command log writes
    // =========================================================================

    /// Append a command with the next per-device ordinal.
    pub async fn insert_command(
        &self,
        params: &NewCommandParams<'_>,
    ) -> Result<Command, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        let (ordinal,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(ordinal), 0) + 1 FROM commands WHERE device_udid = ?",
        )
        .bind(params.device_udid)
        .fetch_one(&mut *tx)
        .await?;

        let id = sqlx::query(
            "INSERT INTO commands (uuid, device_udid, ordinal, request_type, payload, status, attempts, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 'queued', 0, ?, ?)",
        )
        .bind(params.uuid)
        .bind(params.device_udid)
        .bind(ordinal)
        .bind(params.request_type)
        .bind(params.payload)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let command = sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(command)
    }

    /// Return the in-flight command, or move the oldest queued one to `sent`.
    ///
    /// Returns `None` when the device has nothing queued.
    pub async fn claim_next_command(
        &self,
        udid: &str,
        now: i64,
        deadline: i64,
    ) -> Result<Option<Command>, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        if let Some(in_flight) = sqlx::query_as::<_, Command>(SELECT_IN_FLIGHT)
            .bind(udid)
            .fetch_optional(&mut *tx)
            .await?
        {
            tx.commit().await?;
            return Ok(Some(in_flight));
        }

        let next = sqlx::query_as::<_, Command>(
            "SELECT * FROM commands WHERE device_udid = ? AND status = 'queued' ORDER BY ordinal LIMIT 1",
        )
        .bind(udid)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(next) = next else {
            tx.commit().await?;
            return Ok(None);
        };

        sqlx::query(
            "UPDATE commands SET status = 'sent', sent_at = ?, deadline_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(deadline)
        .bind(now)
        .bind(next.id)
        .execute(&mut *tx)
        .await?;

        let claimed = sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE id = ?")
            .bind(next.id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(claimed))
    }

    /// Apply a transition to the in-flight command if its ordinal matches.
    pub async fn transition_in_flight(
        &self,
        udid: &str,
        ordinal: i64,
        transition: InFlightTransition<'_>,
    ) -> Result<TransitionOutcome, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        let in_flight = sqlx::query_as::<_, Command>(SELECT_IN_FLIGHT)
            .bind(udid)
            .fetch_optional(&mut *tx)
            .await?;

        let command = match in_flight {
            Some(cmd) if cmd.ordinal == ordinal => cmd,
            other => {
                tx.commit().await?;
                return Ok(TransitionOutcome::Mismatch {
                    in_flight: other.map(|c| c.ordinal),
                });
            }
        };

        match transition {
            InFlightTransition::Complete {
                status,
                result_status,
                result_payload,
            } => {
                sqlx::query(
                    "UPDATE commands SET status = ?, result_status = ?, result_payload = ?, deadline_at = NULL, updated_at = ? WHERE id = ?",
                )
                .bind(status)
                .bind(result_status)
                .bind(result_payload)
                .bind(now)
                .bind(command.id)
                .execute(&mut *tx)
                .await?;
            }
            InFlightTransition::Defer => {
                sqlx::query(
                    "UPDATE commands SET status = 'queued', result_status = 'NotNow', sent_at = NULL, deadline_at = NULL, updated_at = ? WHERE id = ?",
                )
                .bind(now)
                .bind(command.id)
                .execute(&mut *tx)
                .await?;
            }
            InFlightTransition::Timeout { max_attempts } => {
                let attempts = command.attempts + 1;
                let status = if attempts >= max_attempts {
                    CommandStatus::Failed
                } else {
                    CommandStatus::Queued
                };
                sqlx::query(
                    "UPDATE commands SET status = ?, attempts = ?, result_status = 'TimedOut', sent_at = NULL, deadline_at = NULL, updated_at = ? WHERE id = ?",
                )
                .bind(status)
                .bind(attempts)
                .bind(now)
                .bind(command.id)
                .execute(&mut *tx)
                .await?;
            }
        }

        let updated = sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE id = ?")
            .bind(command.id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(TransitionOutcome::Applied(updated))
    }

    // =========================================================================
    // Command log reads
    // =========================================================================

    /// The in-flight command of a device, if any.
    pub async fn get_in_flight_command(&self, udid: &str) -> Result<Option<Command>, DatabaseError> {
        let command = sqlx::query_as::<_, Command>(SELECT_IN_FLIGHT)
            .bind(udid)
            .fetch_optional(self.pool())
            .await?;

        Ok(command)
    }

    /// In-flight commands whose deadline is at or before `now`, as
    /// `(udid, ordinal)` pairs.
    pub async fn list_overdue_in_flight(
        &self,
        now: i64,
    ) -> Result<Vec<(String, i64)>, DatabaseError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT device_udid, ordinal FROM commands WHERE status = 'sent' AND deadline_at <= ? ORDER BY deadline_at",
        )
        .bind(now)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    /// Look up a command by its wire UUID.
    pub async fn get_command_by_uuid(&self, uuid: &str) -> Result<Option<Command>, DatabaseError> {
        let command = sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(self.pool())
            .await?;

        Ok(command)
    }

    /// Full command log of a device, by ordinal.
    pub async fn list_commands(&self, udid: &str) -> Result<Vec<Command>, DatabaseError> {
        let commands = sqlx::query_as::<_, Command>(
            "SELECT * FROM commands WHERE device_udid = ? ORDER BY ordinal",
        )
        .bind(udid)
        .fetch_all(self.pool())
        .await?;

        Ok(commands)
    }
}
