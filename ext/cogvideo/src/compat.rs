//! Backend version gate run at the start of every load call.

use crate::config::MIN_BACKEND_VERSION;
use crate::error::{LoaderError, Result};

/// Parse the leading `major.minor.patch` of a version string.
///
/// Pre-release and build suffixes (`0.31.0.dev0`, `0.32.0+cu124`) are ignored,
/// missing components count as zero.
fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let core = version
        .trim()
        .split(|c: char| c == '+' || c == '-')
        .next()?;
    let mut parts = core.split('.');
    let mut next = || -> Option<u64> {
        match parts.next() {
            Some(p) => {
                let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
                if digits.is_empty() {
                    None
                } else {
                    digits.parse().ok()
                }
            }
            None => Some(0),
        }
    };
    let major = next()?;
    let minor = next().unwrap_or(0);
    let patch = next().unwrap_or(0);
    Some((major, minor, patch))
}

/// Fail with a directive error when `found` is older than `required`.
pub fn check_version(found: &str, required: &str) -> Result<()> {
    let incompatible = || LoaderError::IncompatibleBackend {
        found: found.to_string(),
        required: required.to_string(),
    };
    let have = parse_version(found).ok_or_else(incompatible)?;
    let need = parse_version(required).ok_or_else(incompatible)?;
    if have < need {
        return Err(incompatible());
    }
    Ok(())
}

pub fn check_backend_version(found: &str) -> Result<()> {
    check_version(found, MIN_BACKEND_VERSION)
}
