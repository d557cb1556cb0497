use crate::types::{QualityGrid, UsableMask, VegError};
use ndarray::Zip;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Fmask fill value marking pixels outside the acquisition
pub const FMASK_NODATA: u8 = 255;

const CIRRUS_BIT: u8 = 1 << 0;
const CLOUD_BIT: u8 = 1 << 1;
const ADJACENT_CLOUD_BIT: u8 = 1 << 2;
const CLOUD_SHADOW_BIT: u8 = 1 << 3;
const SNOW_ICE_BIT: u8 = 1 << 4;
const WATER_BIT: u8 = 1 << 5;
const AEROSOL_SHIFT: u8 = 6;

/// Which aerosol levels are masked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AerosolMode {
    /// Never mask on aerosol
    None,
    /// Mask level 3 only
    High,
    /// Mask levels 2-3
    #[default]
    Moderate,
    /// Mask levels 1-3
    Low,
}

impl AerosolMode {
    /// Lowest aerosol level (0-3) that is masked, if any
    pub fn threshold(&self) -> Option<u8> {
        match self {
            AerosolMode::None => None,
            AerosolMode::High => Some(3),
            AerosolMode::Moderate => Some(2),
            AerosolMode::Low => Some(1),
        }
    }
}

impl FromStr for AerosolMode {
    type Err = VegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "NONE" => Ok(AerosolMode::None),
            "HIGH" => Ok(AerosolMode::High),
            "MODERATE" => Ok(AerosolMode::Moderate),
            "LOW" => Ok(AerosolMode::Low),
            other => Err(VegError::Config(format!("Unknown aerosol mode: {}", other))),
        }
    }
}

/// Condition toggles applied to the Fmask byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityMaskConfig {
    pub cirrus: bool,
    pub cloud: bool,
    pub adjacent_cloud: bool,
    pub cloud_shadow: bool,
    pub snow_ice: bool,
    pub water: bool,
    pub aerosol: AerosolMode,
}

impl Default for QualityMaskConfig {
    fn default() -> Self {
        Self {
            cirrus: true,
            cloud: true,
            adjacent_cloud: true,
            cloud_shadow: true,
            snow_ice: true,
            water: true,
            aerosol: AerosolMode::Moderate,
        }
    }
}

/// Decodes HLS Fmask bytes into a per-pixel usable mask
#[derive(Debug, Clone, Copy)]
pub struct QualityMaskDecoder {
    condition_bits: u8,
    aerosol_threshold: Option<u8>,
}

impl QualityMaskDecoder {
    pub fn new(config: &QualityMaskConfig) -> Self {
        let mut condition_bits = 0u8;
        for (enabled, bit) in [
            (config.cirrus, CIRRUS_BIT),
            (config.cloud, CLOUD_BIT),
            (config.adjacent_cloud, ADJACENT_CLOUD_BIT),
            (config.cloud_shadow, CLOUD_SHADOW_BIT),
            (config.snow_ice, SNOW_ICE_BIT),
            (config.water, WATER_BIT),
        ] {
            if enabled {
                condition_bits |= bit;
            }
        }

        Self {
            condition_bits,
            aerosol_threshold: config.aerosol.threshold(),
        }
    }

    /// Usable = not fill, no enabled condition bit, aerosol below threshold
    #[inline]
    pub fn is_usable(&self, flags: u8) -> bool {
        if flags == FMASK_NODATA || flags & self.condition_bits != 0 {
            return false;
        }
        let aerosol_level = (flags >> AEROSOL_SHIFT) & 0b11;
        self.aerosol_threshold
            .map_or(true, |threshold| aerosol_level < threshold)
    }

    pub fn decode(&self, fmask: &QualityGrid) -> UsableMask {
        let mut usable = UsableMask::from_elem(fmask.dim(), false);
        Zip::from(&mut usable)
            .and(fmask)
            .for_each(|u, &flags| *u = self.is_usable(flags));
        usable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn aerosol(level: u8) -> u8 {
        level << AEROSOL_SHIFT
    }

    #[test]
    fn test_aerosol_modes() {
        let flags = aerosol(2);
        let moderate = QualityMaskDecoder::new(&QualityMaskConfig::default());
        assert!(!moderate.is_usable(flags));

        let none = QualityMaskDecoder::new(&QualityMaskConfig {
            aerosol: AerosolMode::None,
            ..QualityMaskConfig::default()
        });
        assert!(none.is_usable(flags));

        let high = QualityMaskDecoder::new(&QualityMaskConfig {
            aerosol: AerosolMode::High,
            ..QualityMaskConfig::default()
        });
        assert!(high.is_usable(aerosol(2)));
        assert!(!high.is_usable(aerosol(3)));

        let low = QualityMaskDecoder::new(&QualityMaskConfig {
            aerosol: AerosolMode::Low,
            ..QualityMaskConfig::default()
        });
        assert!(low.is_usable(aerosol(0)));
        assert!(!low.is_usable(aerosol(1)));
    }

    #[test]
    fn test_condition_toggles() {
        let all = QualityMaskDecoder::new(&QualityMaskConfig::default());
        for bit in [CIRRUS_BIT, CLOUD_BIT, ADJACENT_CLOUD_BIT, CLOUD_SHADOW_BIT, SNOW_ICE_BIT, WATER_BIT] {
            assert!(!all.is_usable(bit));
        }
        assert!(all.is_usable(0));

        let water_allowed = QualityMaskDecoder::new(&QualityMaskConfig {
            water: false,
            ..QualityMaskConfig::default()
        });
        assert!(water_allowed.is_usable(WATER_BIT));
        assert!(!water_allowed.is_usable(WATER_BIT | CLOUD_BIT));
    }

    #[test]
    fn test_fill_value_never_usable() {
        let permissive = QualityMaskDecoder::new(&QualityMaskConfig {
            cirrus: false,
            cloud: false,
            adjacent_cloud: false,
            cloud_shadow: false,
            snow_ice: false,
            water: false,
            aerosol: AerosolMode::None,
        });
        assert!(!permissive.is_usable(FMASK_NODATA));
        // 0xFE carries every flag but is not the fill value
        assert!(permissive.is_usable(0xFE));
    }

    #[test]
    fn test_decode_grid() {
        let decoder = QualityMaskDecoder::new(&QualityMaskConfig::default());
        let fmask = array![[0u8, CLOUD_BIT], [FMASK_NODATA, aerosol(1)]];
        let usable = decoder.decode(&fmask);
        assert_eq!(usable, array![[true, false], [false, true]]);
    }
}
