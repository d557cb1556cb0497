//! Pipeline configuration
//!
//! A [`PipelineConfig`] is built once (from defaults, from the classic
//! environment variable names, or deserialised) and handed by reference to
//! every component. Nothing below reads process state on its own.

use crate::core::quality_mask::{AerosolMode, QualityMaskConfig};
use crate::types::{TileId, TimeWindow, ValidRange, VegError, VegResult, VegetationIndex};
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

/// Directory layout of the pipeline's artifacts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryLayout {
    /// Downloaded HLS granules (`L30/` and `S30/` below it)
    pub raw_dir: PathBuf,
    /// Per-granule index GeoTIFFs
    pub vi_dir: PathBuf,
    /// Per-tile NetCDF time series
    pub netcdf_dir: PathBuf,
    /// Reprojected per-tile mean / valid-count rasters
    pub reprojected_dir: PathBuf,
    /// Reprojected per-tile outlier rasters
    pub outlier_dir: PathBuf,
    /// Study-area mosaics
    pub mosaic_dir: PathBuf,
    /// Seasonal composite stacks
    pub composite_dir: PathBuf,
}

impl DirectoryLayout {
    /// Conventional layout below a single root
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            raw_dir: root.join("raw"),
            vi_dir: root.join("vi"),
            netcdf_dir: root.join("netcdf"),
            reprojected_dir: root.join("reprojected"),
            outlier_dir: root.join("outliers"),
            mosaic_dir: root.join("mosaic"),
            composite_dir: root.join("timeseries"),
        }
    }

    pub fn create_all(&self) -> VegResult<()> {
        for dir in [
            &self.vi_dir,
            &self.netcdf_dir,
            &self.reprojected_dir,
            &self.outlier_dir,
            &self.mosaic_dir,
            &self.composite_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

impl Default for DirectoryLayout {
    fn default() -> Self {
        Self::under("hls_output")
    }
}

/// Raster container settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputOptions {
    /// GeoTIFF COMPRESS creation option
    pub geotiff_compress: String,
    /// GeoTIFF tile edge (also the mosaic streaming window height)
    pub geotiff_block_size: usize,
    /// NetCDF deflate level, 0-9
    pub netcdf_deflate_level: i32,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            geotiff_compress: "LZW".to_string(),
            geotiff_block_size: 512,
            netcdf_deflate_level: 1,
        }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub mask: QualityMaskConfig,
    /// Multiplier from stored reflectance integers to reflectance
    pub scale_factor: f32,
    pub indices: Vec<VegetationIndex>,
    /// Per-index overrides of [`VegetationIndex::default_valid_range`]
    pub valid_ranges: BTreeMap<VegetationIndex, ValidRange>,
    /// Target CRS definition, e.g. `EPSG:6350`
    pub target_crs: String,
    /// Output resolution in metres
    pub resolution_m: f64,
    /// Spatial chunk edge of the statistics engine
    pub chunk_size: usize,
    pub workers: usize,
    pub windows: Vec<TimeWindow>,
    /// Empty means every tile found
    pub tiles: BTreeSet<TileId>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub output: OutputOptions,
    pub dirs: DirectoryLayout,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mask: QualityMaskConfig::default(),
            scale_factor: 0.0001,
            indices: vec![VegetationIndex::NDVI, VegetationIndex::EVI2, VegetationIndex::NIRv],
            valid_ranges: BTreeMap::new(),
            target_crs: "EPSG:6350".to_string(),
            resolution_m: 30.0,
            chunk_size: 512,
            workers: default_workers(),
            windows: Vec::new(),
            tiles: BTreeSet::new(),
            start_date: None,
            end_date: None,
            output: OutputOptions::default(),
            dirs: DirectoryLayout::default(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl PipelineConfig {
    /// Valid range for an index, falling back to its default
    pub fn valid_range(&self, index: VegetationIndex) -> ValidRange {
        self.valid_ranges
            .get(&index)
            .copied()
            .unwrap_or_else(|| index.default_valid_range())
    }

    /// Target CRS as used in file names (`EPSG:6350` -> `EPSG6350`)
    pub fn crs_tag(&self) -> String {
        self.target_crs.replace(':', "")
    }

    pub fn tile_selected(&self, tile: &TileId) -> bool {
        self.tiles.is_empty() || self.tiles.contains(tile)
    }

    pub fn date_selected(&self, date: NaiveDate) -> bool {
        self.start_date.map_or(true, |s| date >= s) && self.end_date.map_or(true, |e| date <= e)
    }

    /// Read the classic pipeline environment variables
    pub fn from_env() -> Self {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_env_map(&vars)
    }

    /// Build a configuration from `KEY=value` pairs.
    ///
    /// Unparsable values are logged and replaced by their defaults.
    pub fn from_env_map(vars: &HashMap<String, String>) -> Self {
        let mut config = Self::default();
        let get = |key: &str| lookup(vars, key);

        let toggles: [(&str, &mut bool); 6] = [
            ("MASK_CIRRUS", &mut config.mask.cirrus),
            ("MASK_CLOUD", &mut config.mask.cloud),
            ("MASK_ADJACENT_CLOUD", &mut config.mask.adjacent_cloud),
            ("MASK_CLOUD_SHADOW", &mut config.mask.cloud_shadow),
            ("MASK_SNOW_ICE", &mut config.mask.snow_ice),
            ("MASK_WATER", &mut config.mask.water),
        ];
        for (key, slot) in toggles {
            if let Some(raw) = get(key) {
                *slot = parse_bool(key, raw, *slot);
            }
        }

        if let Some(raw) = get("MASK_AEROSOL_MODE") {
            config.mask.aerosol = raw.parse().unwrap_or_else(|e| {
                log::warn!("{}; using {:?}", e, AerosolMode::default());
                AerosolMode::default()
            });
        }

        if let Some(raw) = get("HLS_SCALE_FACTOR") {
            config.scale_factor = parse_number("HLS_SCALE_FACTOR", raw, config.scale_factor);
        }

        if let Some(raw) = get("PROCESSED_VIS") {
            let indices: Vec<VegetationIndex> = raw
                .split_whitespace()
                .filter_map(|name| match name.parse() {
                    Ok(vi) => Some(vi),
                    Err(e) => {
                        log::warn!("{}; ignoring", e);
                        None
                    }
                })
                .collect();
            if indices.is_empty() {
                log::warn!("PROCESSED_VIS='{}' names no known index; using defaults", raw);
            } else {
                config.indices = dedup_preserving_order(indices);
            }
        }

        for index in VegetationIndex::ALL {
            let key = format!("VALID_RANGE_{}", index.name());
            if let Some(raw) = get(&key) {
                match ValidRange::parse(raw) {
                    Ok(range) => {
                        config.valid_ranges.insert(index, range);
                    }
                    Err(e) => log::warn!(
                        "Could not parse {}='{}' ({}). Using default {:?}.",
                        key,
                        raw,
                        e,
                        index.default_valid_range()
                    ),
                }
            }
        }

        if let Some(raw) = get("TARGET_CRS") {
            config.target_crs = raw.to_string();
        }
        if let Some(raw) = get("TARGET_RESOLUTION") {
            config.resolution_m = parse_number("TARGET_RESOLUTION", raw, config.resolution_m);
        }
        if let Some(raw) = get("CHUNK_SIZE") {
            config.chunk_size = parse_number("CHUNK_SIZE", raw, config.chunk_size).max(1);
        }
        if let Some(raw) = get("NUM_WORKERS") {
            config.workers = parse_number("NUM_WORKERS", raw, config.workers).max(1);
        }

        if let Some(raw) = get("TIMESLICE_WINDOWS") {
            match parse_windows(raw) {
                Ok(windows) => config.windows = windows,
                Err(e) => log::warn!("Ignoring TIMESLICE_WINDOWS: {}", e),
            }
        }

        if let Some(raw) = get("HLS_TILES") {
            config.tiles = raw.split_whitespace().map(TileId::new).collect();
        }
        if let Some(raw) = get("START_DATE") {
            config.start_date = parse_date("START_DATE", raw);
        }
        if let Some(raw) = get("END_DATE") {
            config.end_date = parse_date("END_DATE", raw);
        }

        if let Some(raw) = get("GEOTIFF_COMPRESS") {
            config.output.geotiff_compress = raw.to_uppercase();
        }
        if let Some(raw) = get("GEOTIFF_BLOCK_SIZE") {
            let size = parse_number("GEOTIFF_BLOCK_SIZE", raw, config.output.geotiff_block_size);
            // TIFF tiles must be multiples of 16
            if size >= 16 && size % 16 == 0 {
                config.output.geotiff_block_size = size;
            } else {
                log::warn!("GEOTIFF_BLOCK_SIZE={} is not a positive multiple of 16; keeping 512", size);
            }
        }
        if let Some(raw) = get("NETCDF_COMPLEVEL") {
            config.output.netcdf_deflate_level =
                parse_number("NETCDF_COMPLEVEL", raw, config.output.netcdf_deflate_level).clamp(0, 9);
        }

        let dir_keys: [(&str, &mut PathBuf); 7] = [
            ("RAW_HLS_DIR", &mut config.dirs.raw_dir),
            ("VI_OUTPUT_DIR", &mut config.dirs.vi_dir),
            ("NETCDF_DIR", &mut config.dirs.netcdf_dir),
            ("REPROJECTED_DIR", &mut config.dirs.reprojected_dir),
            ("REPROJECTED_DIR_OUTLIERS", &mut config.dirs.outlier_dir),
            ("MOSAIC_DIR", &mut config.dirs.mosaic_dir),
            ("TIMESLICE_OUTPUT_DIR", &mut config.dirs.composite_dir),
        ];
        for (key, slot) in dir_keys {
            if let Some(raw) = get(key) {
                *slot = PathBuf::from(raw);
            }
        }

        config
    }
}

fn lookup<'a>(vars: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn parse_bool(key: &str, raw: &str, fallback: bool) -> bool {
    match raw.to_uppercase().as_str() {
        "TRUE" | "1" | "YES" => true,
        "FALSE" | "0" | "NO" => false,
        _ => {
            log::warn!("{}='{}' is not a boolean; keeping {}", key, raw, fallback);
            fallback
        }
    }
}

fn parse_number<T>(key: &str, raw: &str, fallback: T) -> T
where
    T: std::str::FromStr + std::fmt::Debug + Copy,
{
    raw.parse().unwrap_or_else(|_| {
        log::warn!("{}='{}' is not a number; keeping {:?}", key, raw, fallback);
        fallback
    })
}

fn parse_date(key: &str, raw: &str) -> Option<NaiveDate> {
    match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        Ok(date) => Some(date),
        Err(e) => {
            log::warn!("{}='{}' is not a YYYY-MM-DD date ({}); ignoring", key, raw, e);
            None
        }
    }
}

fn dedup_preserving_order(indices: Vec<VegetationIndex>) -> Vec<VegetationIndex> {
    let mut seen = HashSet::new();
    indices.into_iter().filter(|vi| seen.insert(*vi)).collect()
}

/// Parse space-separated `label:YYYY-MM-DD|YYYY-MM-DD` window tokens
pub fn parse_windows(raw: &str) -> VegResult<Vec<TimeWindow>> {
    let pattern = Regex::new(r"^([A-Za-z0-9_]+):(\d{4}-\d{2}-\d{2})\|(\d{4}-\d{2}-\d{2})$")
        .map_err(|e| VegError::Config(e.to_string()))?;

    let mut windows = Vec::new();
    let mut labels = HashSet::new();

    for token in raw.split_whitespace() {
        let caps = pattern.captures(token).ok_or_else(|| {
            VegError::Config(format!(
                "Invalid window token '{}' (expected label:YYYY-MM-DD|YYYY-MM-DD)",
                token
            ))
        })?;

        let label = caps[1].to_string();
        if !labels.insert(label.clone()) {
            return Err(VegError::Config(format!("Duplicate window label '{}'", label)));
        }

        let start = NaiveDate::parse_from_str(&caps[2], "%Y-%m-%d")
            .map_err(|e| VegError::Config(format!("Window '{}': {}", label, e)))?;
        let end = NaiveDate::parse_from_str(&caps[3], "%Y-%m-%d")
            .map_err(|e| VegError::Config(format!("Window '{}': {}", label, e)))?;
        if start > end {
            return Err(VegError::Config(format!(
                "Window '{}': start {} is after end {}",
                label, start, end
            )));
        }

        windows.push(TimeWindow { label, start, end });
    }

    if windows.is_empty() {
        return Err(VegError::Config("No time windows defined".to_string()));
    }
    Ok(windows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.target_crs, "EPSG:6350");
        assert_eq!(config.crs_tag(), "EPSG6350");
        assert_eq!(config.valid_range(VegetationIndex::EVI2), ValidRange::new(-1.0, 2.0));
        assert!(config.mask.cloud);
        assert_eq!(config.mask.aerosol, AerosolMode::Moderate);
    }

    #[test]
    fn test_malformed_values_fall_back() {
        let config = PipelineConfig::from_env_map(&env(&[
            ("VALID_RANGE_NDVI", "oops"),
            ("VALID_RANGE_NIRv", "-0.2,0.8"),
            ("MASK_AEROSOL_MODE", "EXTREME"),
            ("NUM_WORKERS", "many"),
            ("MASK_WATER", "FALSE"),
            ("PROCESSED_VIS", "NDVI SAVI NDVI EVI"),
        ]));

        assert_eq!(config.valid_range(VegetationIndex::NDVI), ValidRange::new(-1.0, 1.0));
        assert_eq!(config.valid_range(VegetationIndex::NIRv), ValidRange::new(-0.2, 0.8));
        assert_eq!(config.mask.aerosol, AerosolMode::Moderate);
        assert!(config.workers >= 1);
        assert!(!config.mask.water);
        assert_eq!(config.indices, vec![VegetationIndex::NDVI, VegetationIndex::EVI]);
    }

    #[test]
    fn test_tile_and_date_filters() {
        let config = PipelineConfig::from_env_map(&env(&[
            ("HLS_TILES", "34HBH T34HCH"),
            ("START_DATE", "2023-01-01"),
            ("END_DATE", "2023-12-31"),
        ]));
        assert!(config.tile_selected(&TileId::new("T34HCH")));
        assert!(!config.tile_selected(&TileId::new("35JKL")));
        assert!(config.date_selected(NaiveDate::from_ymd_opt(2023, 6, 1).unwrap()));
        assert!(!config.date_selected(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()));
    }

    #[test]
    fn test_parse_windows() {
        let windows = parse_windows("wet_2021:2021-11-01|2022-04-30 dry_2022:2022-05-01|2022-10-31").unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].label, "wet_2021");
        assert_eq!(windows[0].length_days(), 181);

        assert!(parse_windows("").is_err());
        assert!(parse_windows("bad-label:2021-01-01|2021-02-01").is_err());
        assert!(parse_windows("a:2021-03-01|2021-02-01").is_err());
        assert!(parse_windows("a:2021-01-01|2021-02-01 a:2021-03-01|2021-04-01").is_err());
    }
}
