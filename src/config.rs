//! Allocator configuration. Every knob maps to one environment variable that
//! is read exactly once, the first time the allocator is used. After that the
//! configuration is immutable for the lifetime of the process.

use crate::{
    block::{ALIGNMENT, MIN_BLOCK_SIZE},
    platform, region,
};

/// Environment variable overriding [`Config::region_size`].
pub const REGION_SIZE_VAR: &str = "TAGALLOC_REGION_SIZE";

/// Environment variable overriding [`Config::max_block_size`].
pub const MAX_BLOCK_SIZE_VAR: &str = "TAGALLOC_MAX_BLOCK_SIZE";

/// Environment variable overriding [`Config::reserve_capacity`].
pub const RESERVE_VAR: &str = "TAGALLOC_RESERVE";

/// Environment variable overriding [`Config::min_split_size`].
pub const MIN_SPLIT_VAR: &str = "TAGALLOC_MIN_SPLIT";

/// Environment variable overriding [`Config::scribble_char`]. Parsed as a
/// hexadecimal byte, e.g. `aa`.
pub const SCRIBBLE_VAR: &str = "TAGALLOC_SCRIBBLE";

/// Tuning knobs for the allocator. The defaults match [`Config::default`];
/// [`Config::from_env`] starts from the defaults and applies one
/// environment variable per field:
///
/// | Variable                  | Field              |
/// |---------------------------|--------------------|
/// | `TAGALLOC_REGION_SIZE`    | `region_size`      |
/// | `TAGALLOC_MAX_BLOCK_SIZE` | `max_block_size`   |
/// | `TAGALLOC_RESERVE`        | `reserve_capacity` |
/// | `TAGALLOC_MIN_SPLIT`      | `min_split_size`   |
/// | `TAGALLOC_SCRIBBLE`       | `scribble_char`    |
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    /// Size in bytes of each small-object region. Must be a power of two
    /// multiple of the page size: regions are mapped at multiples of their
    /// own size so blocks can find them by masking addresses.
    pub region_size: usize,

    /// Requests larger than this take the large-block path and get their own
    /// mapping instead of a region block.
    pub max_block_size: usize,

    /// Extra bytes (multiple of 16) added to each request before the split
    /// decision, so freshly split blocks keep headroom for small growth.
    pub reserve_capacity: usize,

    /// Minimum remainder, in bytes, that justifies splitting a free block.
    /// Anything smaller stays with the allocated block.
    pub min_split_size: usize,

    /// If non-zero, the payload of every fresh allocation is filled with
    /// this byte. Debugging aid for catching reads of uninitialized memory.
    pub scribble_char: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Config {
    pub const DEFAULT: Self = Self {
        region_size: 4096,
        max_block_size: 2048,
        reserve_capacity: 0,
        min_split_size: MIN_BLOCK_SIZE,
        scribble_char: 0,
    };

    /// Builds the configuration from the environment, falling back to the
    /// defaults for unset or unparsable variables.
    pub fn from_env() -> Self {
        let defaults = Self::DEFAULT;

        let config = Self {
            region_size: read_usize(REGION_SIZE_VAR).unwrap_or(defaults.region_size),
            max_block_size: read_usize(MAX_BLOCK_SIZE_VAR).unwrap_or(defaults.max_block_size),
            reserve_capacity: read_usize(RESERVE_VAR).unwrap_or(defaults.reserve_capacity),
            min_split_size: read_usize(MIN_SPLIT_VAR).unwrap_or(defaults.min_split_size),
            scribble_char: read_hex_byte(SCRIBBLE_VAR).unwrap_or(defaults.scribble_char),
        };

        config.validate();
        config
    }

    /// Aborts on structurally invalid settings. A misconfigured allocator
    /// cannot uphold its invariants, so there is nothing sensible to return
    /// to the caller.
    pub(crate) fn validate(&self) {
        assert!(
            self.region_size.is_power_of_two()
                && self.region_size % platform::page_size() == 0,
            "region size must be a power of two multiple of the page size"
        );
        assert!(
            self.reserve_capacity % ALIGNMENT == 0,
            "reserve capacity must be a multiple of {ALIGNMENT}"
        );
        assert!(
            self.min_split_size >= MIN_BLOCK_SIZE,
            "min split size cannot go below the minimum block size"
        );
        assert!(
            self.max_block_size >= 1
                && self.max_block_size < self.region_size
                && crate::allocator::effective_size(self.max_block_size)
                    <= region::capacity(self.region_size),
            "max block size must fit inside a fresh region"
        );
    }
}

/// Looks up an environment variable without allocating. This matters: when
/// the allocator is installed as the global allocator, the first lookup runs
/// inside an allocation with the allocator lock held, so going through
/// `std::env` (which builds owned strings) would call back into ourselves.
/// Environment overrides are a Unix facility here; other platforms run on
/// the defaults.
#[cfg(all(unix, not(miri)))]
fn getenv(name: &str) -> Option<&'static str> {
    let mut key = [0u8; 64];
    if name.len() >= key.len() {
        return None;
    }
    key[..name.len()].copy_from_slice(name.as_bytes());

    unsafe {
        let value = libc::getenv(key.as_ptr().cast());
        if value.is_null() {
            return None;
        }
        std::ffi::CStr::from_ptr(value).to_str().ok()
    }
}

#[cfg(any(not(unix), miri))]
fn getenv(_name: &str) -> Option<&'static str> {
    None
}

fn read_usize(var: &str) -> Option<usize> {
    getenv(var)?.trim().parse().ok()
}

fn read_hex_byte(var: &str) -> Option<u8> {
    let digits = getenv(var)?.trim().trim_start_matches("0x");
    u8::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate();
    }

    #[test]
    fn env_defaults_apply_when_unset() {
        // None of the variables are set by the test harness, so this must
        // come back identical to the defaults.
        assert_eq!(Config::from_env(), Config::default());
    }

    #[test]
    #[should_panic(expected = "region size")]
    fn rejects_non_power_of_two_region() {
        Config {
            region_size: 4096 * 3,
            ..Config::default()
        }
        .validate();
    }

    #[test]
    #[should_panic(expected = "reserve capacity")]
    fn rejects_unaligned_reserve() {
        Config {
            reserve_capacity: 8,
            ..Config::default()
        }
        .validate();
    }

    #[test]
    #[should_panic(expected = "max block size")]
    fn rejects_oversized_max_block() {
        Config {
            max_block_size: 4096,
            ..Config::default()
        }
        .validate();
    }

    #[test]
    fn hex_byte_parsing() {
        assert_eq!(u8::from_str_radix("aa", 16), Ok(0xaa));
        // Unset variable falls back to the default.
        assert_eq!(read_hex_byte("TAGALLOC_TEST_UNSET_SCRIBBLE"), None);
    }
}
