use chrono::{Datelike, NaiveDate};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Per-pixel vegetation index values (non-finite = no valid observation)
pub type IndexGrid = Array2<f32>;

/// Raw HLS Fmask quality byte per pixel
pub type QualityGrid = Array2<u8>;

/// Per-pixel "usable" flags derived from a [`QualityGrid`]
pub type UsableMask = Array2<bool>;

/// Per-pixel observation counts
pub type CountGrid = Array2<u16>;

/// Epoch of the integer day-offset time coordinate
pub fn time_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

/// Days elapsed since 1970-01-01
pub fn days_since_epoch(date: NaiveDate) -> i32 {
    (date - time_epoch()).num_days() as i32
}

/// Inverse of [`days_since_epoch`]
pub fn date_from_days(days: i32) -> NaiveDate {
    time_epoch() + chrono::Duration::days(days as i64)
}

/// HLS sensor product family
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Sensor {
    /// Landsat 8/9 OLI, 30 m harmonised
    L30,
    /// Sentinel-2 MSI, 30 m harmonised
    S30,
}

impl Sensor {
    /// Stable numeric code stored in the time-series sensor side-channel
    pub fn code(&self) -> u8 {
        match self {
            Sensor::L30 => 1,
            Sensor::S30 => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Sensor::L30),
            2 => Some(Sensor::S30),
            _ => None,
        }
    }

    /// File-name token of a band for this sensor
    pub fn band_token(&self, band: Band) -> &'static str {
        match (self, band) {
            (_, Band::Red) => "B04",
            (Sensor::L30, Band::Nir) => "B05",
            (Sensor::S30, Band::Nir) => "B8A",
            (_, Band::Blue) => "B02",
            (_, Band::Fmask) => "Fmask",
        }
    }
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sensor::L30 => write!(f, "L30"),
            Sensor::S30 => write!(f, "S30"),
        }
    }
}

impl FromStr for Sensor {
    type Err = VegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "L30" => Ok(Sensor::L30),
            "S30" => Ok(Sensor::S30),
            other => Err(VegError::InvalidFormat(format!("Unknown sensor: {}", other))),
        }
    }
}

/// Spectral inputs of one observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Band {
    Red,
    Nir,
    Blue,
    Fmask,
}

/// Vegetation index formulas supported by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VegetationIndex {
    /// (NIR - Red) / (NIR + Red)
    NDVI,
    /// 2.5 (NIR - Red) / (NIR + 2.4 Red + 1)
    EVI2,
    /// NDVI * NIR
    NIRv,
    /// 2.5 (NIR - Red) / (NIR + 6 Red - 7.5 Blue + 1)
    EVI,
}

impl VegetationIndex {
    pub const ALL: [VegetationIndex; 4] = [
        VegetationIndex::NDVI,
        VegetationIndex::EVI2,
        VegetationIndex::NIRv,
        VegetationIndex::EVI,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            VegetationIndex::NDVI => "NDVI",
            VegetationIndex::EVI2 => "EVI2",
            VegetationIndex::NIRv => "NIRv",
            VegetationIndex::EVI => "EVI",
        }
    }

    /// Physically plausible range used when configuration provides none
    pub fn default_valid_range(&self) -> ValidRange {
        match self {
            VegetationIndex::NDVI => ValidRange::new(-1.0, 1.0),
            VegetationIndex::EVI2 => ValidRange::new(-1.0, 2.0),
            VegetationIndex::NIRv => ValidRange::new(-0.5, 1.0),
            VegetationIndex::EVI => ValidRange::new(-1.0, 1.0),
        }
    }

    pub fn needs_blue(&self) -> bool {
        matches!(self, VegetationIndex::EVI)
    }
}

impl fmt::Display for VegetationIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for VegetationIndex {
    type Err = VegError;

    // Names are matched exactly: "EVI" must not swallow "EVI2".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VegetationIndex::ALL
            .iter()
            .find(|vi| vi.name().eq_ignore_ascii_case(s.trim()))
            .copied()
            .ok_or_else(|| VegError::Config(format!("Unknown vegetation index: {}", s)))
    }
}

/// Closed interval of plausible index values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidRange {
    pub min: f32,
    pub max: f32,
}

impl ValidRange {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// Parse a `"min,max"` pair
    pub fn parse(raw: &str) -> VegResult<Self> {
        let mut parts = raw.split(',').map(str::trim);
        let (min, max) = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), None) => (a, b),
            _ => {
                return Err(VegError::Config(format!(
                    "Valid range '{}' is not of the form min,max",
                    raw
                )))
            }
        };
        let min: f32 = min
            .parse()
            .map_err(|_| VegError::Config(format!("Invalid range minimum '{}'", min)))?;
        let max: f32 = max
            .parse()
            .map_err(|_| VegError::Config(format!("Invalid range maximum '{}'", max)))?;
        if !(min.is_finite() && max.is_finite()) || min > max {
            return Err(VegError::Config(format!(
                "Valid range [{}, {}] is empty or non-finite",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// True for finite values inside `[min, max]`
    pub fn contains(&self, value: f32) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Named, inclusive date range used for seasonal composites
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub label: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimeWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Window bounds as day offsets from the time epoch
    pub fn day_bounds(&self) -> (i32, i32) {
        (days_since_epoch(self.start), days_since_epoch(self.end))
    }

    pub fn length_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

/// Bare MGRS tile identifier, e.g. `34HBH`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileId(String);

impl TileId {
    /// Accepts both `34HBH` and `T34HBH`
    pub fn new(raw: &str) -> Self {
        let trimmed = raw.trim();
        let bare = match trimmed.strip_prefix('T') {
            Some(rest) if !rest.is_empty() && rest.starts_with(|c: char| c.is_ascii_digit()) => rest,
            _ => trimmed,
        };
        Self(bare.to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-name form with the leading `T`
    pub fn prefixed(&self) -> String {
        format!("T{}", self.0)
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Geospatial transformation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform without rotation
    pub fn north_up(top_left_x: f64, top_left_y: f64, resolution: f64) -> Self {
        Self {
            top_left_x,
            pixel_width: resolution,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -resolution,
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Map coordinates of the centre of pixel (col, row)
    pub fn pixel_center(&self, col: usize, row: usize) -> (f64, f64) {
        let c = col as f64 + 0.5;
        let r = row as f64 + 0.5;
        (
            self.top_left_x + c * self.pixel_width + r * self.rotation_x,
            self.top_left_y + c * self.rotation_y + r * self.pixel_height,
        )
    }

    /// Map extent `(min_x, min_y, max_x, max_y)` of a `width` x `height` grid
    pub fn bounds(&self, width: usize, height: usize) -> (f64, f64, f64, f64) {
        let x0 = self.top_left_x;
        let x1 = self.top_left_x + width as f64 * self.pixel_width;
        let y0 = self.top_left_y;
        let y1 = self.top_left_y + height as f64 * self.pixel_height;
        (x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1))
    }

    /// Transforms describe the same grid up to floating-point noise
    pub fn approx_eq(&self, other: &GeoTransform) -> bool {
        let tol = self.pixel_width.abs().max(1e-9) * 1e-6;
        self.to_gdal()
            .iter()
            .zip(other.to_gdal().iter())
            .all(|(a, b)| (a - b).abs() <= tol)
    }
}

/// A grid together with its placement on the Earth
#[derive(Debug, Clone)]
pub struct GeoRaster<T> {
    pub data: Array2<T>,
    pub transform: GeoTransform,
    /// Well-known text of the grid's coordinate reference system
    pub crs_wkt: String,
}

impl<T> GeoRaster<T> {
    pub fn new(data: Array2<T>, transform: GeoTransform, crs_wkt: impl Into<String>) -> Self {
        Self {
            data,
            transform,
            crs_wkt: crs_wkt.into(),
        }
    }

    /// `(rows, cols)`
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }
}

/// Pixel types that can be persisted with a fixed nodata sentinel
pub trait RasterValue:
    gdal::raster::GdalType + Copy + PartialEq + Send + Sync + fmt::Debug + 'static
{
    /// Sentinel written where there is no data
    fn nodata() -> Self;

    /// Value stored in the GeoTIFF nodata tag
    fn nodata_tag() -> f64;

    fn is_nodata(self) -> bool;

    /// TIFF predictor suited to the type
    fn predictor() -> &'static str;
}

impl RasterValue for f32 {
    fn nodata() -> Self {
        f32::NAN
    }

    fn nodata_tag() -> f64 {
        f64::NAN
    }

    fn is_nodata(self) -> bool {
        !self.is_finite()
    }

    fn predictor() -> &'static str {
        "3"
    }
}

impl RasterValue for u16 {
    fn nodata() -> Self {
        0
    }

    fn nodata_tag() -> f64 {
        0.0
    }

    fn is_nodata(self) -> bool {
        self == 0
    }

    fn predictor() -> &'static str {
        "2"
    }
}

/// One granule: a single overpass of one sensor over one tile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// HLS base name, e.g. `HLS.L30.T34HBH.2023001T154931.v2.0`
    pub granule_id: String,
    pub tile: TileId,
    pub sensor: Sensor,
    pub date: NaiveDate,
    pub band_paths: BTreeMap<Band, PathBuf>,
}

impl Observation {
    /// Day of year as encoded in HLS names
    pub fn day_of_year(&self) -> u32 {
        self.date.ordinal()
    }
}

/// Temporal reduction persisted per tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StatisticKind {
    /// Mean of in-range values (float32, NaN nodata)
    Mean,
    /// Count of in-range values (uint16, 0 nodata)
    CountValid,
    /// Mean of finite out-of-range values (float32, NaN nodata)
    OutlierMean,
    /// Count of finite out-of-range values (uint16, 0 nodata)
    OutlierCount,
}

impl StatisticKind {
    pub const ALL: [StatisticKind; 4] = [
        StatisticKind::Mean,
        StatisticKind::CountValid,
        StatisticKind::OutlierMean,
        StatisticKind::OutlierCount,
    ];

    /// Token used in per-tile statistic file names
    pub fn file_token(&self) -> &'static str {
        match self {
            StatisticKind::Mean => "average",
            StatisticKind::CountValid => "count_valid",
            StatisticKind::OutlierMean => "outlier_mean",
            StatisticKind::OutlierCount => "outlier_count",
        }
    }

    /// Token used in mosaic file names
    pub fn mosaic_token(&self) -> &'static str {
        match self {
            StatisticKind::Mean => "",
            StatisticKind::CountValid => "CountValid_",
            StatisticKind::OutlierMean => "OutlierMean_",
            StatisticKind::OutlierCount => "OutlierCount_",
        }
    }

    pub fn is_count(&self) -> bool {
        matches!(self, StatisticKind::CountValid | StatisticKind::OutlierCount)
    }
}

/// Error types for vegetation-index processing
#[derive(Debug, thiserror::Error)]
pub enum VegError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Missing band {band:?} for granule {granule}")]
    MissingBand { granule: String, band: Band },

    #[error("Corrupt input {path}: {message}")]
    CorruptInput { path: String, message: String },

    #[error("CRS undetermined for {0}")]
    CrsUndetermined(String),

    #[error("Spatial shape/reference mismatch: {0}")]
    ShapeMismatch(String),

    #[error("No observations: {0}")]
    NoObservations(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("NetCDF error: {0}")]
    NetCdf(#[from] netcdf::Error),
}

impl VegError {
    /// Faults in the input data: the unit is skipped and the run continues
    pub fn is_input_fault(&self) -> bool {
        matches!(
            self,
            VegError::MissingBand { .. }
                | VegError::CorruptInput { .. }
                | VegError::CrsUndetermined(_)
                | VegError::NoObservations(_)
        )
    }
}

/// Result type for vegetation-index operations
pub type VegResult<T> = Result<T, VegError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_range_parse() {
        let range = ValidRange::parse("-1, 1").unwrap();
        assert_eq!(range, ValidRange::new(-1.0, 1.0));
        assert!(range.contains(1.0));
        assert!(!range.contains(1.5));
        assert!(!range.contains(f32::NAN));

        assert!(ValidRange::parse("1").is_err());
        assert!(ValidRange::parse("a,b").is_err());
        assert!(ValidRange::parse("2,1").is_err());
        assert!(ValidRange::parse("1,2,3").is_err());
    }

    #[test]
    fn test_index_names_are_exact() {
        assert_eq!("EVI2".parse::<VegetationIndex>().unwrap(), VegetationIndex::EVI2);
        assert_eq!("evi".parse::<VegetationIndex>().unwrap(), VegetationIndex::EVI);
        assert_eq!("NIRv".parse::<VegetationIndex>().unwrap(), VegetationIndex::NIRv);
        assert!("SAVI".parse::<VegetationIndex>().is_err());
    }

    #[test]
    fn test_tile_id_normalisation() {
        assert_eq!(TileId::new("T34HBH").as_str(), "34HBH");
        assert_eq!(TileId::new("34hbh").as_str(), "34HBH");
        assert_eq!(TileId::new("34HBH").prefixed(), "T34HBH");
    }

    #[test]
    fn test_day_offsets() {
        let date = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        assert_eq!(days_since_epoch(date), 19358);
        assert_eq!(date_from_days(19358), date);
        assert_eq!(days_since_epoch(time_epoch()), 0);
    }

    #[test]
    fn test_pixel_center_and_bounds() {
        let gt = GeoTransform::north_up(100.0, 200.0, 30.0);
        assert_eq!(gt.pixel_center(0, 0), (115.0, 185.0));
        assert_eq!(gt.bounds(2, 3), (100.0, 110.0, 160.0, 200.0));
    }

    #[test]
    fn test_input_fault_classification() {
        assert!(VegError::CrsUndetermined("x".into()).is_input_fault());
        assert!(VegError::CorruptInput {
            path: "B04.tif".into(),
            message: "not a TIFF".into()
        }
        .is_input_fault());
        assert!(!VegError::ShapeMismatch("x".into()).is_input_fault());
        assert!(!VegError::Processing("x".into()).is_input_fault());
    }
}
