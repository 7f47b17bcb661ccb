//! Audited mutations: manual record corrections and configuration updates.
//!
//! Every mutation here writes its audit entry first and applies the change
//! only once that write has succeeded.

use crate::models::{
    Actor, AuditAction, AuditLogEntry, AuditSource, IngestedRecord, NewAuditEntry,
    RecordCorrection, Snapshot, SnapshotValue, DEFAULT_TOLERANCE, TOLERANCE_CONFIG_KEY,
};
use crate::services::store::{ConfigStore, StoreError, Stores};
use rust_decimal::Decimal;
use serde_json::Value;
use service_core::error::AppError;
use std::str::FromStr;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const TOLERANCE_DESCRIPTION: &str = "Amount variance for partial matching (e.g., 0.02 for 2%)";

/// Read the partial-match tolerance, falling back to `default` when unset
/// or unreadable.
pub async fn current_tolerance(
    config: &dyn ConfigStore,
    default: Decimal,
) -> Result<Decimal, StoreError> {
    let value = config.get_setting(TOLERANCE_CONFIG_KEY).await?;
    Ok(match value {
        None => default,
        Some(value) => tolerance_from_value(&value).unwrap_or_else(|| {
            warn!(value = %value, "Unreadable tolerance setting, using default");
            default
        }),
    })
}

fn tolerance_from_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

fn tolerance_to_value(tolerance: Decimal) -> Value {
    Value::String(tolerance.normalize().to_string())
}

#[derive(Clone)]
pub struct AuditTrail {
    stores: Stores,
}

impl AuditTrail {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// Apply a manual correction to one record.
    ///
    /// Returns the record as it stands afterwards. When nothing differs the
    /// record is returned untouched and no entry is written.
    #[instrument(skip(self, correction, actor), fields(record_id = %record_id))]
    pub async fn correct_record(
        &self,
        record_id: Uuid,
        correction: RecordCorrection,
        actor: Actor,
    ) -> Result<IngestedRecord, AppError> {
        let current = self
            .stores
            .records
            .get_record(record_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Record not found")))?;

        let mut updated = current.clone();
        let mut fields = Vec::new();
        let mut changes = Vec::new();

        if let Some(amount) = correction.amount.filter(|a| *a != current.amount) {
            fields.push("amount");
            changes.push(format!("Amount: {} → {}", current.amount, amount));
            updated.amount = amount;
        }
        if let Some(reference) = correction
            .ref_number
            .filter(|r| *r != current.ref_number)
        {
            fields.push("refNumber");
            changes.push(format!("Ref: {} → {}", current.ref_number, reference));
            updated.ref_number = reference;
        }

        if fields.is_empty() {
            info!("No changes detected");
            return Ok(current);
        }

        self.stores
            .audit
            .append_entry(NewAuditEntry {
                record_id: Some(current.id),
                upload_job_id: Some(current.upload_job_id),
                action: AuditAction::ManualUpdate,
                field_name: Some(fields.join(", ")),
                old_value: Some(Snapshot::from(&current)),
                new_value: Some(Snapshot::from(&updated)),
                actor,
                source: AuditSource::Ui,
                description: format!("Manual correction: {}", changes.join(", ")),
            })
            .await?;

        self.stores.records.update_record(&updated).await?;
        info!(fields = %fields.join(", "), "Record corrected");
        Ok(updated)
    }

    /// Audit entries of a record, oldest first.
    pub async fn record_timeline(&self, record_id: Uuid) -> Result<Vec<AuditLogEntry>, AppError> {
        let mut entries = self.stores.audit.entries_for_record(record_id).await?;
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    pub async fn tolerance(&self, default: Decimal) -> Result<Decimal, AppError> {
        Ok(current_tolerance(self.stores.config.as_ref(), default).await?)
    }

    /// Set the partial-match tolerance. Accepts fractions in `[0, 1]`.
    #[instrument(skip(self, actor))]
    pub async fn update_tolerance(
        &self,
        tolerance: Decimal,
        actor: Actor,
    ) -> Result<Decimal, AppError> {
        if tolerance < Decimal::ZERO || tolerance > Decimal::ONE {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Tolerance must be between 0 and 1, got {}",
                tolerance
            )));
        }

        let previous = self
            .stores
            .config
            .get_setting(TOLERANCE_CONFIG_KEY)
            .await?
            .as_ref()
            .and_then(tolerance_from_value);

        let old_value = previous.map(|p| {
            Snapshot::new().with(TOLERANCE_CONFIG_KEY, SnapshotValue::Decimal(p))
        });
        self.stores
            .audit
            .append_entry(NewAuditEntry {
                record_id: None,
                upload_job_id: None,
                action: AuditAction::ConfigUpdate,
                field_name: Some(TOLERANCE_CONFIG_KEY.to_string()),
                old_value,
                new_value: Some(
                    Snapshot::new().with(TOLERANCE_CONFIG_KEY, SnapshotValue::Decimal(tolerance)),
                ),
                actor,
                source: AuditSource::Ui,
                description: format!("System configuration '{}' updated", TOLERANCE_CONFIG_KEY),
            })
            .await?;

        self.stores
            .config
            .put_setting(
                TOLERANCE_CONFIG_KEY,
                tolerance_to_value(tolerance),
                TOLERANCE_DESCRIPTION,
            )
            .await?;

        info!(tolerance = %tolerance, "Tolerance updated");
        Ok(tolerance)
    }

    /// Seed settings that have never been written.
    pub async fn initialize_defaults(&self) -> Result<(), AppError> {
        let config = &self.stores.config;
        if config.get_setting(TOLERANCE_CONFIG_KEY).await?.is_none() {
            config
                .put_setting(
                    TOLERANCE_CONFIG_KEY,
                    tolerance_to_value(DEFAULT_TOLERANCE),
                    TOLERANCE_DESCRIPTION,
                )
                .await?;
            info!(key = TOLERANCE_CONFIG_KEY, "Seeded default setting");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tolerance_reads_numbers_and_strings() {
        assert_eq!(
            tolerance_from_value(&json!(0.05)),
            Some(Decimal::new(5, 2))
        );
        assert_eq!(
            tolerance_from_value(&json!("0.1")),
            Some(Decimal::new(1, 1))
        );
        assert_eq!(tolerance_from_value(&json!(true)), None);
    }

    #[tokio::test]
    async fn missing_setting_uses_default() {
        let stores = Stores::in_memory();
        let tolerance = current_tolerance(stores.config.as_ref(), DEFAULT_TOLERANCE)
            .await
            .unwrap();
        assert_eq!(tolerance, DEFAULT_TOLERANCE);
    }

    #[tokio::test]
    async fn defaults_do_not_overwrite_existing_value() {
        let stores = Stores::in_memory();
        let trail = AuditTrail::new(stores.clone());
        trail
            .update_tolerance(Decimal::new(5, 2), Actor::System)
            .await
            .unwrap();
        trail.initialize_defaults().await.unwrap();

        assert_eq!(
            trail.tolerance(DEFAULT_TOLERANCE).await.unwrap(),
            Decimal::new(5, 2)
        );
    }

    #[tokio::test]
    async fn out_of_range_tolerance_is_rejected() {
        let trail = AuditTrail::new(Stores::in_memory());
        let err = trail
            .update_tolerance(Decimal::new(15, 1), Actor::System)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
