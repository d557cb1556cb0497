//! HLS granule naming and local discovery
//!
//! HLS v2 files are named
//! `HLS.{L30|S30}.T{tile}.{YYYYDDD}T{HHMMSS}.v{major}.{minor}.{suffix}.tif`
//! where the suffix is a band token (`B04`, `Fmask`, ...) or, for derived
//! rasters, an index name.

use crate::io::geotiff::read_raster;
use crate::types::{Band, GeoRaster, Observation, Sensor, TileId, VegError, VegResult, VegetationIndex};
use chrono::NaiveDate;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use walkdir::WalkDir;

const GRANULE_PATTERN: &str =
    r"^(HLS\.(L30|S30)\.T(\d{2}[A-Z]{3})\.(\d{4})(\d{3})T(\d{6})\.v\d+\.\d+)\.([A-Za-z0-9]+)\.tif$";

const TILE_PATTERN: &str = r"(?:^|[._])T(\d{2}[A-Z]{3})(?:[._]|$)";

fn granule_regex() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(GRANULE_PATTERN).ok()).as_ref()
}

fn tile_regex() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(TILE_PATTERN).ok()).as_ref()
}

/// Parsed components of an HLS file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GranuleName {
    /// Everything before the band/index suffix
    pub granule_id: String,
    pub sensor: Sensor,
    pub tile: TileId,
    pub date: NaiveDate,
    pub suffix: String,
}

impl GranuleName {
    pub fn parse(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let caps = granule_regex()?.captures(name)?;

        let year: i32 = caps[4].parse().ok()?;
        let day_of_year: u32 = caps[5].parse().ok()?;
        Some(Self {
            granule_id: caps[1].to_string(),
            sensor: caps[2].parse().ok()?,
            tile: TileId::new(&caps[3]),
            date: NaiveDate::from_yo_opt(year, day_of_year)?,
            suffix: caps[7].to_string(),
        })
    }
}

/// Bare tile id embedded in an HLS, series or statistic file name
pub fn tile_id_from_path(path: &Path) -> Option<TileId> {
    let name = path.file_name()?.to_str()?;
    tile_regex()?.captures(name).map(|caps| TileId::new(&caps[1]))
}

/// Per-granule index raster path
pub fn index_raster_path(vi_dir: &Path, granule_id: &str, index: VegetationIndex) -> PathBuf {
    vi_dir.join(format!("{}.{}.tif", granule_id, index.name()))
}

/// Every per-granule raster of `index` below `vi_dir`, sorted by path
pub fn find_index_rasters(
    vi_dir: &Path,
    index: VegetationIndex,
) -> VegResult<Vec<(PathBuf, GranuleName)>> {
    if !vi_dir.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in WalkDir::new(vi_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| VegError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(granule) = GranuleName::parse(entry.path()) {
            if granule.suffix == index.name() {
                found.push((entry.into_path(), granule));
            }
        }
    }
    Ok(found)
}

/// Which observations a caller wants
#[derive(Debug, Clone, Default)]
pub struct ObservationQuery {
    /// Empty means every tile
    pub tiles: BTreeSet<TileId>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    /// Bands an observation must provide besides Fmask
    pub bands: Vec<Band>,
}

impl ObservationQuery {
    fn accepts(&self, granule: &GranuleName) -> bool {
        (self.tiles.is_empty() || self.tiles.contains(&granule.tile))
            && self.start.map_or(true, |s| granule.date >= s)
            && self.end.map_or(true, |e| granule.date <= e)
    }
}

/// Provider of raw HLS observations
pub trait ObservationSource {
    /// Observations matching the query, ordered by tile, date, sensor
    ///
    /// `band_paths` of each observation names every band the source can
    /// provide for it; indices needing an absent band are not requested.
    fn list(&self, query: &ObservationQuery) -> VegResult<Vec<Observation>>;

    /// Stored reflectance integers of one band as f32.
    ///
    /// Unreadable rasters are reported as [`VegError::CorruptInput`] so the
    /// granule is skipped rather than failed.
    fn fetch_band(&self, observation: &Observation, band: Band) -> VegResult<GeoRaster<f32>>;

    fn fetch_quality(&self, observation: &Observation) -> VegResult<GeoRaster<u8>>;
}

/// Granules already downloaded under `raw_dir/{L30,S30}`
#[derive(Debug, Clone)]
pub struct LocalGranuleSource {
    root: PathBuf,
}

impl LocalGranuleSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn band_path(&self, observation: &Observation, band: Band) -> VegResult<PathBuf> {
        observation
            .band_paths
            .get(&band)
            .cloned()
            .ok_or_else(|| VegError::MissingBand {
                granule: observation.granule_id.clone(),
                band,
            })
    }

    fn scan_sensor(
        &self,
        sensor: Sensor,
        query: &ObservationQuery,
        found: &mut Vec<Observation>,
    ) -> VegResult<()> {
        let dir = self.root.join(sensor.to_string());
        if !dir.exists() {
            log::debug!("No {} directory at {}", sensor, dir.display());
            return Ok(());
        }

        for entry in WalkDir::new(&dir).sort_by_file_name() {
            let entry = entry.map_err(|e| VegError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let granule = match GranuleName::parse(entry.path()) {
                Some(g) if g.sensor == sensor && g.suffix == sensor.band_token(Band::Fmask) => g,
                _ => continue,
            };
            if !query.accepts(&granule) {
                continue;
            }

            let folder = entry.path().parent().unwrap_or(dir.as_path());
            let mut band_paths = BTreeMap::new();
            band_paths.insert(Band::Fmask, entry.path().to_path_buf());
            for band in [Band::Red, Band::Nir, Band::Blue] {
                let candidate = folder.join(format!(
                    "{}.{}.tif",
                    granule.granule_id,
                    sensor.band_token(band)
                ));
                if candidate.exists() {
                    band_paths.insert(band, candidate);
                }
            }

            if let Some(missing) = query.bands.iter().find(|b| !band_paths.contains_key(*b)) {
                log::warn!(
                    "Skipping {}: band {} not found",
                    granule.granule_id,
                    sensor.band_token(*missing)
                );
                continue;
            }

            found.push(Observation {
                granule_id: granule.granule_id,
                tile: granule.tile,
                sensor,
                date: granule.date,
                band_paths,
            });
        }
        Ok(())
    }
}

/// GDAL failures on a source band mean the file itself is bad
fn corrupt_input(path: &Path, error: VegError) -> VegError {
    match error {
        e @ (VegError::Gdal(_) | VegError::InvalidFormat(_)) => VegError::CorruptInput {
            path: path.display().to_string(),
            message: e.to_string(),
        },
        other => other,
    }
}

impl ObservationSource for LocalGranuleSource {
    fn list(&self, query: &ObservationQuery) -> VegResult<Vec<Observation>> {
        let mut found = Vec::new();
        for sensor in [Sensor::L30, Sensor::S30] {
            self.scan_sensor(sensor, query, &mut found)?;
        }
        found.sort_by(|a, b| {
            (&a.tile, a.date, a.sensor, &a.granule_id).cmp(&(&b.tile, b.date, b.sensor, &b.granule_id))
        });
        log::info!("Found {} observations under {}", found.len(), self.root.display());
        Ok(found)
    }

    fn fetch_band(&self, observation: &Observation, band: Band) -> VegResult<GeoRaster<f32>> {
        let path = self.band_path(observation, band)?;
        read_raster::<f32, _>(&path).map_err(|e| corrupt_input(&path, e))
    }

    fn fetch_quality(&self, observation: &Observation) -> VegResult<GeoRaster<u8>> {
        let path = self.band_path(observation, Band::Fmask)?;
        read_raster::<u8, _>(&path).map_err(|e| corrupt_input(&path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_granule_name() {
        let granule =
            GranuleName::parse(Path::new("/data/HLS.S30.T34HBH.2023032T081019.v2.0.B8A.tif")).unwrap();
        assert_eq!(granule.granule_id, "HLS.S30.T34HBH.2023032T081019.v2.0");
        assert_eq!(granule.sensor, Sensor::S30);
        assert_eq!(granule.tile.as_str(), "34HBH");
        assert_eq!(granule.date, NaiveDate::from_ymd_opt(2023, 2, 1).unwrap());
        assert_eq!(granule.suffix, "B8A");

        assert!(GranuleName::parse(Path::new("HLS.S30.T34HBH.2023400T081019.v2.0.B04.tif")).is_none());
        assert!(GranuleName::parse(Path::new("notes.txt")).is_none());
    }

    #[test]
    fn test_tile_id_from_either_convention() {
        let hls = tile_id_from_path(Path::new("HLS.L30.T10SEG.2022180T183919.v2.0.NDVI.tif"));
        assert_eq!(hls.unwrap().as_str(), "10SEG");
        let stat = tile_id_from_path(Path::new("out/T34HBH_NDVI_average_NDVI_EPSG6350.tif"));
        assert_eq!(stat.unwrap().as_str(), "34HBH");
        assert!(tile_id_from_path(Path::new("HLS_Mosaic_NDVI_EPSG6350.tif")).is_none());
    }

    #[test]
    fn test_local_source_pairs_bands_and_filters() {
        let dir = TempDir::new().unwrap();
        let l30 = dir.path().join("L30").join("2023");
        let s30 = dir.path().join("S30");
        std::fs::create_dir_all(&l30).unwrap();
        std::fs::create_dir_all(&s30).unwrap();

        let touch = |dir: &Path, name: &str| std::fs::write(dir.join(name), b"").unwrap();
        for suffix in ["Fmask", "B04", "B05"] {
            touch(&l30, &format!("HLS.L30.T34HBH.2023010T081530.v2.0.{}.tif", suffix));
        }
        // S30 NIR is B8A, so a B05 file does not complete the granule
        for suffix in ["Fmask", "B04", "B05"] {
            touch(&s30, &format!("HLS.S30.T34HBH.2023011T081530.v2.0.{}.tif", suffix));
        }
        for suffix in ["Fmask", "B04", "B8A"] {
            touch(&s30, &format!("HLS.S30.T35JKL.2023012T081530.v2.0.{}.tif", suffix));
        }

        let source = LocalGranuleSource::new(dir.path());
        let query = ObservationQuery {
            bands: vec![Band::Red, Band::Nir],
            ..ObservationQuery::default()
        };
        let found = source.list(&query).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].tile.as_str(), "34HBH");
        assert_eq!(found[0].sensor, Sensor::L30);
        assert!(!found[0].band_paths.contains_key(&Band::Blue));

        let err = source.fetch_band(&found[0], Band::Blue).unwrap_err();
        assert!(err.is_input_fault());

        // The touched files are empty, so GDAL cannot open them
        let err = source.fetch_band(&found[0], Band::Red).unwrap_err();
        assert!(matches!(err, VegError::CorruptInput { .. }));
        assert!(source.fetch_quality(&found[0]).unwrap_err().is_input_fault());

        let only_35 = ObservationQuery {
            tiles: [TileId::new("T35JKL")].into_iter().collect(),
            ..query
        };
        assert_eq!(source.list(&only_35).unwrap().len(), 1);
    }
}
