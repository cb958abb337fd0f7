//! Queries for data reconciled by sync jobs: directory devices, directory
//! cursors and catalog packages.

use super::models::{CatalogPackage, DirectoryDevice};
use super::{DatabaseError, MdmDatabase};
use mdmgate_core::db::unix_timestamp;

/// A device record as delivered by a directory server.
pub struct DirectoryDeviceParams<'a> {
    pub serial_number: &'a str,
    pub server_id: &'a str,
    pub model: Option<&'a str>,
    pub description: Option<&'a str>,
    pub color: Option<&'a str>,
    pub profile_status: Option<&'a str>,
    pub op_type: Option<&'a str>,
    pub op_date: Option<&'a str>,
}

/// A package as delivered by a catalog source.
pub struct CatalogPackageParams<'a> {
    pub source: &'a str,
    pub name: &'a str,
    pub version: &'a str,
    /// JSON array of catalog names.
    pub catalogs: &'a str,
    pub description: Option<&'a str>,
}

impl MdmDatabase {
    // =========================================================================
    // Directory
    // =========================================================================

    pub async fn get_directory_cursor(
        &self,
        server_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT cursor FROM directory_cursors WHERE server_id = ?")
                .bind(server_id)
                .fetch_optional(self.pool())
                .await?;

        Ok(row.map(|(cursor,)| cursor))
    }

    pub async fn set_directory_cursor(
        &self,
        server_id: &str,
        cursor: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO directory_cursors (server_id, cursor, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(server_id) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at",
        )
        .bind(server_id)
        .bind(cursor)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn clear_directory_cursor(&self, server_id: &str) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM directory_cursors WHERE server_id = ?")
            .bind(server_id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Insert or refresh a directory device. A `deleted` op type marks the
    /// record deleted instead of removing it.
    pub async fn upsert_directory_device(
        &self,
        params: &DirectoryDeviceParams<'_>,
    ) -> Result<(), DatabaseError> {
        let deleted = params
            .op_type
            .is_some_and(|op| op.eq_ignore_ascii_case("deleted"));

        sqlx::query(
            "INSERT INTO directory_devices (serial_number, server_id, model, description, color, profile_status, op_type, op_date, deleted, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(serial_number) DO UPDATE SET
                server_id = excluded.server_id,
                model = COALESCE(excluded.model, directory_devices.model),
                description = COALESCE(excluded.description, directory_devices.description),
                color = COALESCE(excluded.color, directory_devices.color),
                profile_status = COALESCE(excluded.profile_status, directory_devices.profile_status),
                op_type = excluded.op_type,
                op_date = excluded.op_date,
                deleted = excluded.deleted,
                updated_at = excluded.updated_at",
        )
        .bind(params.serial_number)
        .bind(params.server_id)
        .bind(params.model)
        .bind(params.description)
        .bind(params.color)
        .bind(params.profile_status)
        .bind(params.op_type)
        .bind(params.op_date)
        .bind(deleted)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn get_directory_device(
        &self,
        serial_number: &str,
    ) -> Result<Option<DirectoryDevice>, DatabaseError> {
        let device = sqlx::query_as::<_, DirectoryDevice>(
            "SELECT * FROM directory_devices WHERE serial_number = ?",
        )
        .bind(serial_number)
        .fetch_optional(self.pool())
        .await?;

        Ok(device)
    }

    pub async fn list_directory_devices(
        &self,
        server_id: &str,
    ) -> Result<Vec<DirectoryDevice>, DatabaseError> {
        let devices = sqlx::query_as::<_, DirectoryDevice>(
            "SELECT * FROM directory_devices WHERE server_id = ? ORDER BY serial_number",
        )
        .bind(server_id)
        .fetch_all(self.pool())
        .await?;

        Ok(devices)
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    pub async fn upsert_catalog_package(
        &self,
        params: &CatalogPackageParams<'_>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO catalog_packages (source, name, version, catalogs, description, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(source, name, version) DO UPDATE SET
                catalogs = excluded.catalogs,
                description = excluded.description,
                updated_at = excluded.updated_at",
        )
        .bind(params.source)
        .bind(params.name)
        .bind(params.version)
        .bind(params.catalogs)
        .bind(params.description)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn list_catalog_packages(
        &self,
        source: &str,
    ) -> Result<Vec<CatalogPackage>, DatabaseError> {
        let packages = sqlx::query_as::<_, CatalogPackage>(
            "SELECT * FROM catalog_packages WHERE source = ? ORDER BY name, version",
        )
        .bind(source)
        .fetch_all(self.pool())
        .await?;

        Ok(packages)
    }
}
