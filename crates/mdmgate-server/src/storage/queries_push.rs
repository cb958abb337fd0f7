//! Push certificate queries.
//!
//! Each named slot keeps every version it ever had; at most one version per
//! slot is `active` (enforced by a partial unique index).

use super::models::PushCertificateRecord;
use super::{DatabaseError, MdmDatabase};
use mdmgate_core::db::unix_timestamp;

/// Parameters for storing a new push certificate version.
pub struct NewPushCertificateParams<'a> {
    pub name: &'a str,
    pub topic: &'a str,
    pub fingerprint: &'a str,
    pub not_before: i64,
    pub not_after: i64,
    pub cert_pem: &'a str,
    pub key_pem: &'a str,
}

impl MdmDatabase {
    /// Store a new version of a push certificate slot.
    ///
    /// The previous active version (if any) becomes `superseded`. When
    /// `invalidate_topic` is set, every device bound to that topic loses its
    /// push binding in the same transaction. Returns the stored record and
    /// the number of invalidated devices.
    pub async fn insert_push_certificate_version(
        &self,
        params: &NewPushCertificateParams<'_>,
        invalidate_topic: Option<&str>,
    ) -> Result<(PushCertificateRecord, u64), DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "UPDATE push_certificates SET state = 'superseded' WHERE name = ? AND state = 'active'",
        )
        .bind(params.name)
        .execute(&mut *tx)
        .await?;

        let (version,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM push_certificates WHERE name = ?",
        )
        .bind(params.name)
        .fetch_one(&mut *tx)
        .await?;

        let id = sqlx::query(
            "INSERT INTO push_certificates (name, version, topic, fingerprint, not_before, not_after, cert_pem, key_pem, state, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'active', ?)",
        )
        .bind(params.name)
        .bind(version)
        .bind(params.topic)
        .bind(params.fingerprint)
        .bind(params.not_before)
        .bind(params.not_after)
        .bind(params.cert_pem)
        .bind(params.key_pem)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let invalidated = match invalidate_topic {
            Some(topic) => sqlx::query(
                "UPDATE devices SET push_invalidated = 1, updated_at = ? WHERE topic = ? AND push_invalidated = 0",
            )
            .bind(now)
            .bind(topic)
            .execute(&mut *tx)
            .await?
            .rows_affected(),
            None => 0,
        };

        let record = sqlx::query_as::<_, PushCertificateRecord>(
            "SELECT * FROM push_certificates WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((record, invalidated))
    }

    /// Get the active version of a slot.
    pub async fn get_active_push_certificate(
        &self,
        name: &str,
    ) -> Result<Option<PushCertificateRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, PushCertificateRecord>(
            "SELECT * FROM push_certificates WHERE name = ? AND state = 'active'",
        )
        .bind(name)
        .fetch_optional(self.pool())
        .await?;

        Ok(record)
    }

    /// Get the newest version of a slot, whatever its state.
    pub async fn get_latest_push_certificate(
        &self,
        name: &str,
    ) -> Result<Option<PushCertificateRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, PushCertificateRecord>(
            "SELECT * FROM push_certificates WHERE name = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(self.pool())
        .await?;

        Ok(record)
    }

    /// Find the active certificate carrying a topic.
    pub async fn find_active_push_certificate_by_topic(
        &self,
        topic: &str,
    ) -> Result<Option<PushCertificateRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, PushCertificateRecord>(
            "SELECT * FROM push_certificates WHERE topic = ? AND state = 'active' ORDER BY id DESC LIMIT 1",
        )
        .bind(topic)
        .fetch_optional(self.pool())
        .await?;

        Ok(record)
    }

    /// All active certificates, one per slot.
    pub async fn list_active_push_certificates(
        &self,
    ) -> Result<Vec<PushCertificateRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, PushCertificateRecord>(
            "SELECT * FROM push_certificates WHERE state = 'active' ORDER BY name",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(records)
    }

    /// The latest version of every slot, whatever its state.
    pub async fn list_latest_push_certificates(
        &self,
    ) -> Result<Vec<PushCertificateRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, PushCertificateRecord>(
            "SELECT * FROM push_certificates p
             WHERE version = (SELECT MAX(version) FROM push_certificates WHERE name = p.name)
             ORDER BY name",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(records)
    }

    /// Revoke the active version of a slot.
    pub async fn revoke_push_certificate(&self, name: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE push_certificates SET state = 'revoked' WHERE name = ? AND state = 'active'",
        )
        .bind(name)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
