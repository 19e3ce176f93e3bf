//! Structural checks on inbound reports and registrations.
//!
//! Validation happens before any state is touched, so a rejected report
//! leaves projections, ledgers and buffers unchanged.

use crate::error::{Error, Result};
use crate::model::{BucketCounts, ClientRegistration, UsageReport};

/// Longest accepted application name, in characters.
pub const MAX_APP_NAME_LEN: usize = 255;

fn validate_app_name(app_name: &str) -> Result<()> {
    if app_name.trim().is_empty() {
        return Err(Error::validation("appName", "must not be empty"));
    }

    let len = app_name.chars().count();
    if len > MAX_APP_NAME_LEN {
        return Err(Error::validation(
            "appName",
            format!("{len} characters exceeds the limit of {MAX_APP_NAME_LEN}"),
        ));
    }

    Ok(())
}

/// A report that passed validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidatedReport {
    /// Folded counts of every feature with a valid name.
    pub counts: BucketCounts,
    /// Feature names that were dropped because they are not URL friendly.
    pub invalid_names: Vec<String>,
}

/// True when `name` survives URL component encoding unchanged and is not a
/// relative path segment.
pub fn is_valid_feature_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '-' | '_' | '.' | '!' | '~' | '*' | '\'' | '(' | ')')
        })
}

/// Validates `report` and folds its per-feature counts.
///
/// Malformed reports are rejected. Features with names that are not URL
/// friendly are left out of the result and listed in `invalid_names`; the
/// rest of the report is still accepted.
pub fn validate_report(report: &UsageReport) -> Result<ValidatedReport> {
    validate_app_name(&report.app_name)?;

    let bucket = &report.bucket;
    if bucket.start > bucket.stop {
        return Err(Error::validation(
            "bucket",
            format!("start {} is after stop {}", bucket.start, bucket.stop),
        ));
    }

    let mut validated = ValidatedReport {
        counts: BucketCounts::with_capacity(bucket.toggles.len()),
        invalid_names: Vec::new(),
    };
    for (feature, counts) in &bucket.toggles {
        let count = counts.fold().ok_or_else(|| {
            Error::validation(
                "bucket.toggles",
                format!("counts for {feature} overflow"),
            )
        })?;
        count.yes.checked_add(count.no).ok_or_else(|| {
            Error::validation(
                "bucket.toggles",
                format!("total evaluations for {feature} overflow"),
            )
        })?;

        if is_valid_feature_name(feature) {
            validated.counts.insert(feature.clone(), count);
        } else {
            validated.invalid_names.push(feature.clone());
        }
    }
    validated.invalid_names.sort();

    Ok(validated)
}

pub fn validate_registration(registration: &ClientRegistration) -> Result<()> {
    validate_app_name(&registration.app_name)?;

    if let Some(instance_id) = &registration.instance_id {
        if instance_id.trim().is_empty() {
            return Err(Error::validation("instanceId", "must not be empty"));
        }
    }

    Ok(())
}
