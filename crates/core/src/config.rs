//! Cache geometry and filter-region string parsing.
//!
//! The emulator hands the core two small string grammars rather than a
//! structured configuration object: `"<hex_start>:<hex_end>"` for the
//! physical-address filter window, and `"sets:ways:linesize"` for cache
//! geometry. Both are parsed here, once, at startup.

use crate::common::error::ConfigError;

/// The physical-address filter window, half-open `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionConfig {
    /// Inclusive lower bound.
    pub start: u64,
    /// Exclusive upper bound.
    pub end: u64,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            start: 0,
            end: u64::MAX,
        }
    }
}

impl RegionConfig {
    /// Parses `"<hex_start>:<hex_end>"`, each side unprefixed or
    /// `0x`-prefixed hex.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MalformedRegion`] if the string doesn't split
    /// into exactly two hex integers separated by one colon.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let (start_str, end_str) = s
            .split_once(':')
            .ok_or_else(|| ConfigError::MalformedRegion(s.to_string()))?;
        let start = parse_hex(start_str).ok_or_else(|| ConfigError::MalformedRegion(s.to_string()))?;
        let end = parse_hex(end_str).ok_or_else(|| ConfigError::MalformedRegion(s.to_string()))?;
        Ok(Self { start, end })
    }
}

fn parse_hex(s: &str) -> Option<u64> {
    let trimmed = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    if trimmed.is_empty() {
        return None;
    }
    u64::from_str_radix(trimmed, 16).ok()
}

/// Parsed cache geometry: `sets`, `ways`, `line_bytes`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeometryConfig {
    /// Number of sets; must be a power of two.
    pub sets: usize,
    /// Number of ways per set.
    pub ways: usize,
    /// Line size in bytes; must be a power of two, at least 8.
    pub line_bytes: usize,
}

impl GeometryConfig {
    /// Parses `"sets:ways:linesize"` and validates the structural
    /// constraints (power-of-two sets and line size, line size `>= 8`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MalformedGeometry`] if the string doesn't
    /// split into exactly three positive integers, or
    /// [`ConfigError::InvalidGeometry`] if the integers violate the
    /// structural constraints.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let mut parts = s.split(':');
        let (Some(sets_str), Some(ways_str), Some(line_str), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ConfigError::MalformedGeometry(s.to_string()));
        };

        let malformed = || ConfigError::MalformedGeometry(s.to_string());
        let sets: usize = sets_str.parse().map_err(|_| malformed())?;
        let ways: usize = ways_str.parse().map_err(|_| malformed())?;
        let line_bytes: usize = line_str.parse().map_err(|_| malformed())?;

        if sets == 0 || ways == 0 || line_bytes == 0 {
            return Err(ConfigError::InvalidGeometry {
                geometry: s.to_string(),
                reason: "sets, ways, and linesize must all be positive",
            });
        }
        if !sets.is_power_of_two() {
            return Err(ConfigError::InvalidGeometry {
                geometry: s.to_string(),
                reason: "sets must be a power of two",
            });
        }
        if !line_bytes.is_power_of_two() || line_bytes < 8 {
            return Err(ConfigError::InvalidGeometry {
                geometry: s.to_string(),
                reason: "linesize must be a power of two and at least 8",
            });
        }

        Ok(Self {
            sets,
            ways,
            line_bytes,
        })
    }

    /// Whether this geometry selects the fully-associative storage variant:
    /// one set and more than four ways.
    #[inline(always)]
    pub fn is_fully_associative(&self) -> bool {
        self.sets == 1 && self.ways > 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn region_parses_unprefixed_hex() {
        let r = RegionConfig::parse("1000:2000").unwrap();
        assert_eq!(r.start, 0x1000);
        assert_eq!(r.end, 0x2000);
    }

    #[test]
    fn region_parses_0x_prefixed_hex() {
        let r = RegionConfig::parse("0x1000:0X2000").unwrap();
        assert_eq!(r.start, 0x1000);
        assert_eq!(r.end, 0x2000);
    }

    #[test]
    fn region_rejects_missing_colon() {
        assert!(RegionConfig::parse("1000").is_err());
    }

    #[test]
    fn region_rejects_non_hex() {
        assert!(RegionConfig::parse("zz:2000").is_err());
    }

    #[test]
    fn geometry_parses_basic() {
        let g = GeometryConfig::parse("1:1:8").unwrap();
        assert_eq!(g.sets, 1);
        assert_eq!(g.ways, 1);
        assert_eq!(g.line_bytes, 8);
    }

    #[test]
    fn geometry_rejects_non_power_of_two_sets() {
        assert!(GeometryConfig::parse("3:4:64").is_err());
    }

    #[test]
    fn geometry_rejects_line_below_eight() {
        assert!(GeometryConfig::parse("1:4:4").is_err());
    }

    #[test]
    fn fully_associative_threshold() {
        assert!(GeometryConfig::parse("1:8:64").unwrap().is_fully_associative());
        assert!(!GeometryConfig::parse("1:4:64").unwrap().is_fully_associative());
        assert!(!GeometryConfig::parse("4:8:64").unwrap().is_fully_associative());
    }

    #[rstest]
    #[case::single_set_one_way("1:1:8", 1, 1, 8)]
    #[case::four_sets_two_ways("4:2:32", 4, 2, 32)]
    #[case::eight_sets_four_ways("8:4:16", 8, 4, 16)]
    #[case::one_set_many_ways_fully_associative("1:16:64", 1, 16, 64)]
    fn geometry_table(
        #[case] input: &str,
        #[case] sets: usize,
        #[case] ways: usize,
        #[case] line_bytes: usize,
    ) {
        let g = GeometryConfig::parse(input).unwrap();
        assert_eq!(g.sets, sets);
        assert_eq!(g.ways, ways);
        assert_eq!(g.line_bytes, line_bytes);
    }

    #[rstest]
    #[case::zero_sets("0:1:8")]
    #[case::zero_ways("1:0:8")]
    #[case::zero_line_bytes("1:1:0")]
    #[case::sets_not_power_of_two("3:1:8")]
    #[case::line_bytes_not_power_of_two("1:1:12")]
    #[case::line_bytes_too_small("1:1:4")]
    #[case::too_few_fields("1:1")]
    #[case::too_many_fields("1:1:8:16")]
    #[case::non_numeric("a:b:c")]
    fn geometry_rejects(#[case] input: &str) {
        assert!(GeometryConfig::parse(input).is_err());
    }
}
