//! Version compatibility evaluation.
//!
//! Decides whether a published platform version may be offered as an upgrade
//! target from the running version, and whether an existing version record has
//! become unreachable and can be pruned.

use std::cmp::Ordering;

use kube::ResourceExt;
use semver::{BuildMetadata, Version as SemVer};

use crate::crd::Version;
use crate::error::{PuoError, Result};

/// Marker identifying development builds, either in the version name or as a tag.
pub const DEV_MARKER: &str = "dev";

/// Parse a version string such as `v1.31.0+k3s1` or `0.3`.
///
/// A leading `v` is ignored and missing minor/patch components are treated as zero.
pub fn parse_version(raw: &str) -> Result<SemVer> {
    let trimmed = raw.trim();
    let stripped = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);

    if let Ok(version) = SemVer::parse(stripped) {
        return Ok(version);
    }

    let split = stripped.find(['-', '+']).unwrap_or(stripped.len());
    let (core, suffix) = stripped.split_at(split);
    let components = core.split('.').count();
    if !core.is_empty() && components < 3 {
        let padded = format!("{core}{}{suffix}", ".0".repeat(3 - components));
        if let Ok(version) = SemVer::parse(&padded) {
            return Ok(version);
        }
    }

    Err(PuoError::InvalidVersion(raw.to_string()))
}

/// Compare two versions by precedence, ignoring build metadata.
pub fn compare(a: &SemVer, b: &SemVer) -> Ordering {
    let strip = |v: &SemVer| SemVer {
        build: BuildMetadata::EMPTY,
        ..v.clone()
    };
    strip(a).cmp(&strip(b))
}

/// A development build is always offered, regardless of ordering.
pub fn is_dev_version(name: &str, tags: &[String]) -> bool {
    name.contains(DEV_MARKER) || tags.iter().any(|t| t == DEV_MARKER)
}

/// Whether `candidate` may be offered as an upgrade from `current`.
///
/// Fails if the candidate's name, runtime version or minimum upgradable version
/// does not parse.
pub fn can_upgrade(current: &SemVer, candidate: &Version) -> Result<bool> {
    let name = candidate.name_any();
    let candidate_version = parse_version(&name)?;

    if let Some(runtime) = non_empty(candidate.spec.runtime_version.as_deref()) {
        parse_version(runtime)?;
    }

    let min_version = non_empty(candidate.spec.min_upgradable_version.as_deref())
        .map(parse_version)
        .transpose()?;

    if is_dev_version(&name, &candidate.spec.tags) {
        return Ok(true);
    }

    let newer = compare(&candidate_version, current) == Ordering::Greater;
    let reachable = min_version.is_none_or(|min| compare(current, &min) != Ordering::Less);
    Ok(newer && reachable)
}

/// Whether a version record is no longer a reachable upgrade target.
pub fn is_stale(current: &SemVer, candidate: &Version) -> Result<bool> {
    let name = candidate.name_any();
    let candidate_version = parse_version(&name)?;

    if is_dev_version(&name, &candidate.spec.tags) {
        return Ok(false);
    }

    Ok(compare(current, &candidate_version) != Ordering::Less)
}

/// Resolve the effective runtime version to roll out to nodes.
///
/// An empty target keeps the current runtime version; a target lower than the
/// current one is rejected.
pub fn resolve_runtime_version(current: &str, target: Option<&str>) -> Result<String> {
    let Some(target) = non_empty(target) else {
        return Ok(current.to_string());
    };

    let current_version = parse_version(current)?;
    let target_version = parse_version(target)?;

    if compare(&target_version, &current_version) == Ordering::Less {
        return Err(PuoError::UpgradeNotPossible(format!(
            "runtime version {target} is lower than the current runtime version {current}"
        )));
    }

    Ok(target.to_string())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
