//! CloudEvents 1.0 attribute validation. Pure functions, no I/O.

use crate::error::{ArchiverError, Result};
use crate::event::CloudEvent;

/// Spec version accepted for storage after normalization.
pub const SPEC_VERSION: &str = "1.0";

/// Applies the "0.1" to "1.0" upgrade without touching any other value.
pub fn normalized_spec_version(raw: &str) -> &str {
    if raw == "0.1" {
        SPEC_VERSION
    } else {
        raw
    }
}

/// Accepts or rejects a CloudEvent per spec 1.0: the four required
/// attributes must be non-empty and the (normalized) spec version must
/// be "1.0". The fault names the offending field and the reason.
pub fn validate(event: &CloudEvent) -> Result<()> {
    if event.id.is_empty() {
        return Err(ArchiverError::validation("id", "must not be empty"));
    }
    if event.source.is_empty() {
        return Err(ArchiverError::validation("source", "must not be empty"));
    }
    if event.spec_version.is_empty() {
        return Err(ArchiverError::validation("specversion", "must not be empty"));
    }
    if event.event_type.is_empty() {
        return Err(ArchiverError::validation("type", "must not be empty"));
    }
    let version = normalized_spec_version(&event.spec_version);
    if version != SPEC_VERSION {
        return Err(ArchiverError::validation(
            "specversion",
            format!("unsupported version '{}', expected {SPEC_VERSION}", event.spec_version),
        ));
    }
    Ok(())
}
