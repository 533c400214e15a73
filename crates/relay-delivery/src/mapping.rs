//! Pure mapping from inbound business fields to the CRM record shape.
//!
//! The intake handler stores the webhook's raw fields untouched; this module
//! is the single place where source-system naming becomes CRM naming. No
//! I/O, no clock, no configuration beyond the source name.

use serde_json::{Map, Value, json};

use crate::error::{DeliveryError, Result};

/// CRM field that carries the source system's entity id.
///
/// The search criteria in [`crate::crm`] and this mapper must agree on the
/// field name, otherwise upserts stop finding their own records.
pub const EXTERNAL_ID_FIELD: &str = "PrintIQ_Customer_ID";

/// CRM field that links a deal to its source-system quote.
pub const QUOTE_ID_FIELD: &str = "PrintIQ_Quote_ID";

/// Translates a deal lifecycle event into the CRM stage it moves the deal
/// to.
///
/// Returns `None` for event names this relay does not handle; the intake
/// handler rejects those before anything is enqueued, so a `None` in the
/// worker means the job payload was tampered with or predates the current
/// event set.
pub fn deal_stage_for_event(event: &str) -> Option<&'static str> {
    match event {
        "quote_created" => Some("Quote Requested"),
        "quote_accepted" => Some("Accepted"),
        "job_converted" => Some("Job Converted"),
        "invoice_created" => Some("Invoiced"),
        "quote_cancelled" | "job_cancelled" => Some("Cancelled"),
        _ => None,
    }
}

/// Builds the CRM account record for a customer upsert.
///
/// `external_entity_id` always lands in [`EXTERNAL_ID_FIELD`] as a string,
/// `name` becomes `Account_Name`; the remaining recognized fields are
/// copied over when present. Unrecognized fields are dropped, not
/// forwarded, so a source-side schema change cannot inject arbitrary CRM
/// fields.
///
/// # Errors
///
/// Returns `DeliveryError::InvalidPayload` if `name` is missing or blank.
pub fn map_customer_fields(external_entity_id: &str, fields: &Value) -> Result<Value> {
    let name = fields
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DeliveryError::invalid_payload("missing customer name"))?;

    let mut record = Map::new();
    record.insert("Account_Name".to_string(), json!(name));
    record.insert(EXTERNAL_ID_FIELD.to_string(), json!(external_entity_id));

    copy_string(fields, "customerCode", &mut record, "PrintIQ_Customer_Code");
    copy_string(fields, "phone", &mut record, "Phone");
    copy_string(fields, "fax", &mut record, "Fax");
    copy_string(fields, "email", &mut record, "Email");
    copy_string(fields, "website", &mut record, "Website");
    copy_string(fields, "notes", &mut record, "Description");

    if let Some(active) = fields.get("isActive").and_then(Value::as_bool) {
        let account_type = if active { "Active" } else { "Inactive" };
        record.insert("Account_Type".to_string(), json!(account_type));
    }

    if let Some(address) = fields.get("address").filter(|a| a.is_object()) {
        copy_string(address, "street", &mut record, "Billing_Street");
        copy_string(address, "city", &mut record, "Billing_City");
        copy_string(address, "state", &mut record, "Billing_State");
        copy_string(address, "postalCode", &mut record, "Billing_Code");
        copy_string(address, "country", &mut record, "Billing_Country");
    }

    Ok(Value::Object(record))
}

fn copy_string(source: &Value, source_key: &str, target: &mut Map<String, Value>, target_key: &str) {
    if let Some(value) = source.get(source_key).and_then(Value::as_str) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            target.insert(target_key.to_string(), json!(trimmed));
        }
    }
}
