use bson::Document;
use bson::oid::ObjectId;
use chrono::{DateTime, FixedOffset};
use serde::Serialize;

use crate::common::error::{DaoError, Result};

/// Offset used to render timestamps (China Standard Time)
pub const DISPLAY_UTC_OFFSET_SECS: i32 = 8 * 3600;

/// Render a value as compact JSON for printing. Unserializable values render
/// as an empty string.
pub fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Convert a struct into a generic BSON document
pub fn to_bson_document<T: Serialize + ?Sized>(value: &T) -> Result<Document> {
    Ok(bson::to_document(value)?)
}

/// Parse JSON text (a filter or update given on the command line) into a
/// BSON document. Blank input yields an empty document.
pub fn json_to_document(text: &str) -> Result<Document> {
    if text.trim().is_empty() {
        return Ok(Document::new());
    }
    let value: serde_json::Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(DaoError::bad_parameter("expected a JSON object"));
    }
    to_bson_document(&value)
}

/// Creation time embedded in an ObjectId, in the display time zone
pub fn local_time(id: &ObjectId) -> Option<DateTime<FixedOffset>> {
    let offset = FixedOffset::east_opt(DISPLAY_UTC_OFFSET_SECS)?;
    let utc = DateTime::from_timestamp_millis(id.timestamp().timestamp_millis())?;
    Some(utc.with_timezone(&offset))
}
