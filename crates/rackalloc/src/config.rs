//! Rack tuning knobs.
//!
//! `RackConfig::from_env` reads the environment through `libc::getenv` and
//! parses in place, so it can run before any heap exists.

use crate::util::{DEFAULT_DEPOT_RETAINED_REGIONS, MAX_MAGAZINES};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RackConfig {
    /// Thread magazines, not counting the depot. 0 = one per online CPU.
    pub magazine_count: usize,
    /// Leave a random, page-multiple gap at the start of each new region.
    pub randomize_region_start: bool,
    /// Advise whole free pages to the OS on every free instead of only when a
    /// region moves to the depot.
    pub advise_on_free: bool,
    /// Empty regions the depot keeps mapped before it starts unmapping.
    pub depot_retained_regions: usize,
}

impl Default for RackConfig {
    fn default() -> Self {
        RackConfig {
            magazine_count: 0,
            randomize_region_start: false,
            advise_on_free: false,
            depot_retained_regions: DEFAULT_DEPOT_RETAINED_REGIONS,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("magazine count {0} exceeds the maximum of {MAX_MAGAZINES}")]
    TooManyMagazines(usize),
}

impl RackConfig {
    /// Defaults overlaid with `RACKALLOC_*` environment variables.
    /// Unparseable numbers are ignored.
    pub fn from_env() -> Self {
        let mut config = RackConfig::default();
        unsafe {
            if let Some(val) = getenv_usize(b"RACKALLOC_MAGAZINE_COUNT\0") {
                config.magazine_count = val;
            }
            if let Some(val) = getenv_usize(b"RACKALLOC_DEPOT_RESERVE\0") {
                config.depot_retained_regions = val;
            }
            config.advise_on_free |= getenv_present(b"RACKALLOC_ADVISE_ON_FREE\0");
            config.randomize_region_start |= getenv_present(b"RACKALLOC_RANDOMIZE_REGIONS\0");
        }
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.magazine_count > MAX_MAGAZINES {
            return Err(ConfigError::TooManyMagazines(self.magazine_count));
        }
        Ok(())
    }

    /// Thread magazines to create, resolving 0 to the CPU count.
    pub fn resolved_magazine_count(&self) -> usize {
        match self.magazine_count {
            0 => crate::platform::num_cpus().clamp(1, MAX_MAGAZINES),
            n => n,
        }
    }
}

/// # Safety
/// Calls libc::getenv.
unsafe fn getenv_present(key: &[u8]) -> bool {
    !libc::getenv(key.as_ptr() as *const libc::c_char).is_null()
}

/// Parse an environment variable as a usize.
///
/// # Safety
/// Calls libc::getenv.
unsafe fn getenv_usize(key: &[u8]) -> Option<usize> {
    let val = libc::getenv(key.as_ptr() as *const libc::c_char);
    if val.is_null() {
        return None;
    }
    parse_usize(core::ffi::CStr::from_ptr(val).to_bytes())
}

fn parse_usize(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }
    let mut result: usize = 0;
    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }
        result = result.checked_mul(10)?.checked_add((byte - b'0') as usize)?;
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_decimal() {
        assert_eq!(parse_usize(b"0"), Some(0));
        assert_eq!(parse_usize(b"42"), Some(42));
        assert_eq!(parse_usize(b""), None);
        assert_eq!(parse_usize(b"4x"), None);
        assert_eq!(parse_usize(b"-1"), None);
        assert_eq!(parse_usize(b"99999999999999999999999"), None);
    }

    #[test]
    fn validate_caps_magazines() {
        let mut c = RackConfig::default();
        assert!(c.validate().is_ok());
        c.magazine_count = MAX_MAGAZINES + 1;
        assert_eq!(c.validate(), Err(ConfigError::TooManyMagazines(MAX_MAGAZINES + 1)));
    }

    #[test]
    fn zero_magazines_resolves_to_cpus() {
        let c = RackConfig::default();
        let n = c.resolved_magazine_count();
        assert!((1..=MAX_MAGAZINES).contains(&n));
        let c = RackConfig {
            magazine_count: 3,
            ..RackConfig::default()
        };
        assert_eq!(c.resolved_magazine_count(), 3);
    }
}
