//! Detection of SDK versions below the supported minimum.
//!
//! SDKs identify themselves as `name:version`, e.g. `unleash-client-node:5.4.0`.

use std::collections::HashSet;

use semver::Version;

/// Minimum supported version per SDK name.
const MINIMUM_VERSIONS: &[(&str, &str)] = &[
    ("unleash-client-node", "5.5.0"),
    ("unleash-node-sdk", "6.6.0"),
    ("unleash-client-java", "9.0.0"),
    ("unleash-client-go", "4.1.0"),
    ("unleash-client-python", "5.11.0"),
    ("unleash-client-ruby", "5.0.0"),
    ("unleash-client-dotnet", "4.1.3"),
    ("unleash-client-php", "1.13.0"),
    ("unleash-client-rust", "0.23.0"),
];

/// A parsed `name:version` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkVersion {
    pub name: String,
    pub version: Version,
}

/// Splits `name:version` and parses the version.
///
/// Versions with fewer than three components (`5`, `5.4`) are padded with
/// zeros. Returns `None` for anything else that is not semver.
pub fn parse_sdk_version(sdk_version: &str) -> Option<SdkVersion> {
    let (name, version) = sdk_version.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    Some(SdkVersion {
        name: name.to_string(),
        version: parse_lenient(version.trim().trim_start_matches('v'))?,
    })
}

fn parse_lenient(raw: &str) -> Option<Version> {
    if let Ok(v) = Version::parse(raw) {
        return Some(v);
    }

    let dots = raw.matches('.').count();
    if raw.is_empty() || dots >= 2 || raw.contains(['-', '+']) {
        return None;
    }

    let padded = format!("{raw}{}", ".0".repeat(2 - dots));
    Version::parse(&padded).ok()
}

fn minimum_for(name: &str) -> Option<Version> {
    MINIMUM_VERSIONS
        .iter()
        .find(|(sdk, _)| *sdk == name)
        .and_then(|(_, min)| Version::parse(min).ok())
}

/// True when `sdk_version` names a known SDK below its minimum version.
/// Malformed strings and unknown SDKs are never outdated.
pub fn is_outdated_sdk(sdk_version: &str) -> bool {
    let Some(parsed) = parse_sdk_version(sdk_version) else {
        return false;
    };

    match minimum_for(&parsed.name) {
        Some(minimum) => parsed.version < minimum,
        None => false,
    }
}

/// Distinct outdated entries of `sdk_versions`, in first-seen order.
pub fn find_outdated_sdks<S: AsRef<str>>(sdk_versions: &[S]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(sdk_versions.len());

    sdk_versions
        .iter()
        .map(AsRef::as_ref)
        .filter(|sdk| seen.insert(*sdk))
        .filter(|sdk| is_outdated_sdk(sdk))
        .map(str::to_string)
        .collect()
}
