//! Device registry queries.

use super::models::Device;
use super::{DatabaseError, MdmDatabase};
use mdmgate_core::db::unix_timestamp;

/// Parameters for an `Authenticate` check-in.
pub struct EnrollDeviceParams<'a> {
    pub udid: &'a str,
    pub serial_number: Option<&'a str>,
    pub cert_fingerprint: &'a str,
    pub subject_dn: &'a str,
    pub topic: &'a str,
}

impl MdmDatabase {
    /// Create a device, or re-enroll an existing one.
    ///
    /// Re-enrollment rebinds the certificate and topic and puts the device
    /// back into `enrolling` until its next `TokenUpdate`.
    pub async fn enroll_device(
        &self,
        params: &EnrollDeviceParams<'_>,
    ) -> Result<Device, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO devices (udid, serial_number, enrollment_state, cert_fingerprint, subject_dn, topic, last_checkin_at, enrolled_at, created_at, updated_at)
             VALUES (?, ?, 'enrolling', ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(udid) DO UPDATE SET
                serial_number = COALESCE(excluded.serial_number, devices.serial_number),
                enrollment_state = 'enrolling',
                cert_fingerprint = excluded.cert_fingerprint,
                subject_dn = excluded.subject_dn,
                topic = excluded.topic,
                last_checkin_at = excluded.last_checkin_at,
                enrolled_at = excluded.enrolled_at,
                updated_at = excluded.updated_at",
        )
        .bind(params.udid)
        .bind(params.serial_number)
        .bind(params.cert_fingerprint)
        .bind(params.subject_dn)
        .bind(params.topic)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_device(params.udid)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Device {}", params.udid)))
    }

    /// Get a device by UDID.
    pub async fn get_device(&self, udid: &str) -> Result<Option<Device>, DatabaseError> {
        let device = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE udid = ?")
            .bind(udid)
            .fetch_optional(self.pool())
            .await?;

        Ok(device)
    }

    /// Store the push token from a `TokenUpdate` and mark the device enrolled.
    ///
    /// Clears `push_invalidated`: the device has proven it is reachable on
    /// its current topic.
    pub async fn update_push_token(
        &self,
        udid: &str,
        push_token: &str,
        push_magic: &str,
        topic: Option<&str>,
    ) -> Result<Device, DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query(
            "UPDATE devices SET enrollment_state = 'enrolled', push_token = ?, push_magic = ?,
                topic = COALESCE(?, topic), push_invalidated = 0, last_checkin_at = ?, updated_at = ?
             WHERE udid = ? AND enrollment_state != 'unenrolled'",
        )
        .bind(push_token)
        .bind(push_magic)
        .bind(topic)
        .bind(now)
        .bind(now)
        .bind(udid)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Device {udid}")));
        }

        self.get_device(udid)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Device {udid}")))
    }

    /// Record a check-in without changing enrollment state.
    pub async fn touch_device(&self, udid: &str) -> Result<(), DatabaseError> {
        let now = unix_timestamp();
        sqlx::query("UPDATE devices SET last_checkin_at = ?, updated_at = ? WHERE udid = ?")
            .bind(now)
            .bind(now)
            .bind(udid)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Mark a device unenrolled (`CheckOut`). Devices are never deleted.
    pub async fn mark_device_unenrolled(&self, udid: &str) -> Result<bool, DatabaseError> {
        let now = unix_timestamp();
        let result = sqlx::query(
            "UPDATE devices SET enrollment_state = 'unenrolled', last_checkin_at = ?, updated_at = ?
             WHERE udid = ? AND enrollment_state != 'unenrolled'",
        )
        .bind(now)
        .bind(now)
        .bind(udid)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Flag a device's push binding as unusable (APNs reported the token gone).
    pub async fn invalidate_device_push(&self, udid: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE devices SET push_invalidated = 1, updated_at = ? WHERE udid = ? AND push_invalidated = 0",
        )
        .bind(unix_timestamp())
        .bind(udid)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
