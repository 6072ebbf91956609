//! Read-only configuration store facade.
//!
//! The engine never writes device/point configuration; it is owned by the
//! provisioning side of the product (out of scope here, see the spec's
//! Non-goals). The `Repository` is a thin, typed accessor layer over the
//! SQLite reference binding so the rest of the engine never sees raw SQL.

use crate::errors::{EngineError, EngineResult};
use crate::model::{CurrentValue, DataPoint, DataType, Device, DeviceSettings, ProtocolTag, Quality};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use uuid::Uuid;

pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub async fn connect(database_url: &str) -> EngineResult<Self> {
        let pool = SqlitePool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_device(&self, device_id: Uuid) -> EngineResult<Option<Device>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, protocol, endpoint, enabled
            FROM devices
            WHERE id = ?
            "#,
        )
        .bind(device_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(device_from_row).transpose()
    }

    pub async fn find_all_active_devices(&self) -> EngineResult<Vec<Device>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, protocol, endpoint, enabled
            FROM devices
            WHERE enabled = 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(device_from_row).collect()
    }

    pub async fn find_settings(&self, device_id: Uuid) -> EngineResult<DeviceSettings> {
        let row = sqlx::query(
            r#"
            SELECT connection_timeout_ms, read_timeout_ms, retry_count, retry_interval_ms,
                   backoff_time_ms, keep_alive, polling_interval_ms
            FROM device_settings
            WHERE device_id = ?
            "#,
        )
        .bind(device_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let settings = match row {
            Some(row) => DeviceSettings {
                connection_timeout_ms: row.try_get::<i64, _>("connection_timeout_ms")? as u64,
                read_timeout_ms: row.try_get::<i64, _>("read_timeout_ms")? as u64,
                retry_count: row.try_get::<i64, _>("retry_count")? as u32,
                retry_interval_ms: row.try_get::<i64, _>("retry_interval_ms")? as u64,
                backoff_time_ms: row.try_get::<i64, _>("backoff_time_ms")? as u64,
                keep_alive: row.try_get::<i64, _>("keep_alive")? != 0,
                polling_interval_ms: row.try_get::<i64, _>("polling_interval_ms")? as u64,
            },
            None => DeviceSettings::default(),
        };

        settings.validate()?;
        Ok(settings)
    }

    pub async fn find_datapoints_for_device(&self, device_id: Uuid) -> EngineResult<Vec<DataPoint>> {
        let rows = sqlx::query(
            r#"
            SELECT id, device_id, name, address, address_string, data_type, unit,
                   scaling_factor, scaling_offset, min_value, max_value, writable, enabled,
                   log_enabled, log_interval_ms, log_deadband, poll_group, protocol_params
            FROM data_points
            WHERE device_id = ? AND enabled = 1
            "#,
        )
        .bind(device_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(datapoint_from_row).collect()
    }

    pub async fn find_current_values(&self, device_id: Uuid) -> EngineResult<Vec<CurrentValue>> {
        let rows = sqlx::query(
            r#"
            SELECT cv.point_id, dp.device_id, cv.value_json, cv.quality, cv.value_timestamp,
                   cv.quality_timestamp, cv.source, cv.read_count
            FROM current_values cv
            JOIN data_points dp ON dp.id = cv.point_id
            WHERE dp.device_id = ?
            "#,
        )
        .bind(device_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(current_value_from_row).collect()
    }
}

fn device_from_row(row: sqlx::sqlite::SqliteRow) -> EngineResult<Device> {
    let id: String = row.try_get("id")?;
    let protocol_str: String = row.try_get("protocol")?;
    Ok(Device {
        id: Uuid::parse_str(&id).map_err(|e| EngineError::DataCorruption(format!("bad device id: {e}")))?,
        name: row.try_get("name")?,
        protocol: ProtocolTag::parse(&protocol_str)
            .ok_or_else(|| EngineError::configuration("protocol", format!("unknown protocol '{protocol_str}'")))?,
        endpoint: row.try_get("endpoint")?,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
    })
}

fn datapoint_from_row(row: sqlx::sqlite::SqliteRow) -> EngineResult<DataPoint> {
    let id: String = row.try_get("id")?;
    let device_id: String = row.try_get("device_id")?;
    let data_type_str: String = row.try_get("data_type")?;
    let protocol_params_json: Option<String> = row.try_get("protocol_params")?;
    let protocol_params: HashMap<String, serde_json::Value> = protocol_params_json
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| EngineError::DataCorruption(format!("bad protocol_params json: {e}")))?
        .unwrap_or_default();

    Ok(DataPoint {
        id: Uuid::parse_str(&id).map_err(|e| EngineError::DataCorruption(format!("bad point id: {e}")))?,
        device_id: Uuid::parse_str(&device_id).map_err(|e| EngineError::DataCorruption(format!("bad device id: {e}")))?,
        name: row.try_get("name")?,
        address: row.try_get::<Option<i64>, _>("address")?.map(|v| v as u32),
        address_string: row.try_get("address_string")?,
        data_type: parse_data_type(&data_type_str)?,
        unit: row.try_get("unit")?,
        scaling_factor: row.try_get::<Option<f64>, _>("scaling_factor")?.unwrap_or(1.0),
        scaling_offset: row.try_get::<Option<f64>, _>("scaling_offset")?.unwrap_or(0.0),
        min_value: row.try_get("min_value")?,
        max_value: row.try_get("max_value")?,
        writable: row.try_get::<i64, _>("writable")? != 0,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        log_enabled: row.try_get::<i64, _>("log_enabled")? != 0,
        log_interval_ms: row.try_get::<Option<i64>, _>("log_interval_ms")?.unwrap_or(1000) as u64,
        log_deadband: row.try_get::<Option<f64>, _>("log_deadband")?.unwrap_or(0.0),
        poll_group: row.try_get("poll_group")?,
        protocol_params,
    })
}

fn current_value_from_row(row: sqlx::sqlite::SqliteRow) -> EngineResult<CurrentValue> {
    let point_id: String = row.try_get("point_id")?;
    let device_id: String = row.try_get("device_id")?;
    let value_json: String = row.try_get("value_json")?;
    let quality_str: String = row.try_get("quality")?;

    Ok(CurrentValue {
        point_id: Uuid::parse_str(&point_id).map_err(|e| EngineError::DataCorruption(format!("bad point id: {e}")))?,
        device_id: Uuid::parse_str(&device_id).map_err(|e| EngineError::DataCorruption(format!("bad device id: {e}")))?,
        value: serde_json::from_str(&value_json).map_err(|e| EngineError::DataCorruption(format!("bad value json: {e}")))?,
        quality: parse_quality(&quality_str)?,
        value_timestamp: row.try_get("value_timestamp")?,
        quality_timestamp: row.try_get("quality_timestamp")?,
        source: row.try_get("source")?,
        read_count: row.try_get::<i64, _>("read_count")? as u64,
    })
}

fn parse_data_type(s: &str) -> EngineResult<DataType> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| EngineError::configuration("data_type", format!("unknown data type '{s}'")))
}

fn parse_quality(s: &str) -> EngineResult<Quality> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| EngineError::configuration("quality", format!("unknown quality '{s}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_data_type_accepts_snake_case_variants() {
        assert_eq!(parse_data_type("float64").unwrap(), DataType::Float64);
        assert_eq!(parse_data_type("bool").unwrap(), DataType::Bool);
        assert!(parse_data_type("not_a_type").is_err());
    }

    #[test]
    fn parse_quality_accepts_snake_case_variants() {
        assert_eq!(parse_quality("good").unwrap(), Quality::Good);
        assert_eq!(parse_quality("not_connected").unwrap(), Quality::NotConnected);
        assert!(parse_quality("unknown").is_err());
    }
}
