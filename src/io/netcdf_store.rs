//! Per-tile NetCDF time series
//!
//! Layout of `T{tile}_{VI}.nc`:
//!
//! - dimensions `time` (unlimited), `y`, `x`
//! - `time` (int32, days since 1970-01-01), `y`/`x` (float64 pixel centres)
//! - `spatial_ref` scalar carrying `crs_wkt`, `spatial_ref` and `GeoTransform`
//! - the index variable (float32, NaN fill, deflate, `grid_mapping`)
//! - `sensor` (uint8 flag per time step)
//! - global `crs` and `title`

use crate::core::reproject::SpatialReferenceBearing;
use crate::core::time_series::TimeSeriesReader;
use crate::io::atomic::AtomicFile;
use crate::types::{
    date_from_days, days_since_epoch, GeoTransform, IndexGrid, Sensor, TileId, VegError,
    VegResult, VegetationIndex,
};
use chrono::NaiveDate;
use ndarray::Array3;
use netcdf::AttributeValue;
use std::ops::Range;
use std::path::{Path, PathBuf};

const TIME_UNITS: &str = "days since 1970-01-01";
const GRID_MAPPING: &str = "spatial_ref";
const MAX_CHUNK_EDGE: usize = 512;

/// File name of the time series of one (tile, index) pair
pub fn series_file_name(tile: &TileId, index: VegetationIndex) -> String {
    format!("{}_{}.nc", tile.prefixed(), index.name())
}

/// Native grid shared by every slice of a series
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesGrid {
    pub height: usize,
    pub width: usize,
    pub transform: GeoTransform,
    pub crs_wkt: String,
}

/// One time step's label
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeStep {
    pub date: NaiveDate,
    pub sensor: Sensor,
}

fn string_attribute(value: AttributeValue) -> Option<String> {
    match value {
        AttributeValue::Str(s) if !s.trim().is_empty() => Some(s),
        _ => None,
    }
}

fn format_geotransform(gt: &GeoTransform) -> String {
    gt.to_gdal()
        .iter()
        .map(|v| format!("{}", v))
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_geotransform(raw: &str) -> Option<GeoTransform> {
    let values: Vec<f64> = raw
        .split_whitespace()
        .map(|v| v.parse().ok())
        .collect::<Option<Vec<_>>>()?;
    let gt: [f64; 6] = values.try_into().ok()?;
    Some(GeoTransform::from_gdal(gt))
}

/// Appends chronologically ordered slices to a series file.
///
/// Output goes to a scratch copy that replaces the target on [`finish`];
/// an abandoned writer leaves the target untouched.
///
/// [`finish`]: TimeSeriesWriter::finish
pub struct TimeSeriesWriter {
    file: netcdf::FileMut,
    scratch: AtomicFile,
    index: VegetationIndex,
    grid: SeriesGrid,
    len: usize,
    last_day: Option<i32>,
}

impl std::fmt::Debug for TimeSeriesWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeSeriesWriter")
            .field("target", &self.scratch.target())
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

impl TimeSeriesWriter {
    /// Start a new, empty series
    pub fn create(
        path: &Path,
        tile: &TileId,
        index: VegetationIndex,
        grid: SeriesGrid,
        deflate_level: i32,
    ) -> VegResult<Self> {
        log::info!("Creating time series {}", path.display());
        let scratch = AtomicFile::new(path)?;
        let mut file = netcdf::create(scratch.path())?;

        file.add_unlimited_dimension("time")?;
        file.add_dimension("y", grid.height)?;
        file.add_dimension("x", grid.width)?;

        {
            let mut time = file.add_variable::<i32>("time", &["time"])?;
            time.put_attribute("units", TIME_UNITS)?;
            time.put_attribute("calendar", "standard")?;
            time.put_attribute("standard_name", "time")?;
        }

        let xs: Vec<f64> = (0..grid.width)
            .map(|c| grid.transform.pixel_center(c, 0).0)
            .collect();
        let ys: Vec<f64> = (0..grid.height)
            .map(|r| grid.transform.pixel_center(0, r).1)
            .collect();
        {
            let mut x = file.add_variable::<f64>("x", &["x"])?;
            x.put_attribute("standard_name", "projection_x_coordinate")?;
            x.put_values(&xs, ..)?;
        }
        {
            let mut y = file.add_variable::<f64>("y", &["y"])?;
            y.put_attribute("standard_name", "projection_y_coordinate")?;
            y.put_values(&ys, ..)?;
        }

        {
            let mut spatial_ref = file.add_variable::<i32>(GRID_MAPPING, &[])?;
            spatial_ref.put_attribute("crs_wkt", grid.crs_wkt.as_str())?;
            spatial_ref.put_attribute("spatial_ref", grid.crs_wkt.as_str())?;
            spatial_ref.put_attribute("GeoTransform", format_geotransform(&grid.transform))?;
        }

        {
            let mut var = file.add_variable::<f32>(index.name(), &["time", "y", "x"])?;
            var.set_compression(deflate_level.clamp(0, 9), true)?;
            var.set_chunking(&[
                1,
                grid.height.clamp(1, MAX_CHUNK_EDGE),
                grid.width.clamp(1, MAX_CHUNK_EDGE),
            ])?;
            var.set_fill_value(f32::NAN)?;
            var.put_attribute("long_name", index.name())?;
            var.put_attribute("grid_mapping", GRID_MAPPING)?;
        }

        {
            let mut sensor = file.add_variable::<u8>("sensor", &["time"])?;
            sensor.put_attribute("flag_values", vec![Sensor::L30.code(), Sensor::S30.code()])?;
            sensor.put_attribute("flag_meanings", "L30 S30")?;
        }

        file.add_attribute("crs", grid.crs_wkt.as_str())?;
        file.add_attribute(
            "title",
            format!("HLS {} time series for tile {}", index.name(), tile.prefixed()),
        )?;

        Ok(Self {
            file,
            scratch,
            index,
            grid,
            len: 0,
            last_day: None,
        })
    }

    /// Reopen an existing series to add later observations
    pub fn append(path: &Path, index: VegetationIndex) -> VegResult<Self> {
        let existing = TimeSeriesStore::open(path)?;
        if existing.index() != index {
            return Err(VegError::InvalidFormat(format!(
                "{} holds {}, not {}",
                path.display(),
                existing.index(),
                index
            )));
        }
        let grid = existing.grid().clone();
        let len = existing.len();
        let last_day = existing.time_days().last().copied();
        drop(existing);

        let scratch = AtomicFile::new(path)?;
        std::fs::copy(path, scratch.path())?;
        let file = netcdf::append(scratch.path())?;
        log::info!("Appending to time series {} ({} steps)", path.display(), len);

        Ok(Self {
            file,
            scratch,
            index,
            grid,
            len,
            last_day,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn grid(&self) -> &SeriesGrid {
        &self.grid
    }

    /// Write the next slice. Dates must never go backwards.
    pub fn push(&mut self, step: TimeStep, values: &IndexGrid) -> VegResult<()> {
        let day = days_since_epoch(step.date);
        if let Some(last) = self.last_day {
            if day < last {
                return Err(VegError::Processing(format!(
                    "{} precedes the last stored date {}",
                    step.date,
                    date_from_days(last)
                )));
            }
        }
        if values.dim() != (self.grid.height, self.grid.width) {
            return Err(VegError::ShapeMismatch(format!(
                "slice {:?} does not match series grid ({}, {})",
                values.dim(),
                self.grid.height,
                self.grid.width
            )));
        }

        let t = self.len;
        let data: Vec<f32> = values.iter().copied().collect();
        {
            let mut var = self
                .file
                .variable_mut(self.index.name())
                .ok_or_else(|| VegError::InvalidFormat(format!("missing variable {}", self.index)))?;
            var.put_values(&data, (t, .., ..))?;
        }
        self.put_step(t, day, step.sensor)?;

        self.len += 1;
        self.last_day = Some(day);
        Ok(())
    }

    fn put_step(&mut self, t: usize, day: i32, sensor: Sensor) -> VegResult<()> {
        self.file
            .variable_mut("time")
            .ok_or_else(|| VegError::InvalidFormat("missing time variable".to_string()))?
            .put_value(day, [t])?;
        self.file
            .variable_mut("sensor")
            .ok_or_else(|| VegError::InvalidFormat("missing sensor variable".to_string()))?
            .put_value(sensor.code(), [t])?;
        Ok(())
    }

    /// Flush and move the file into place
    pub fn finish(self) -> VegResult<PathBuf> {
        let Self { file, scratch, len, .. } = self;
        drop(file);
        let path = scratch.commit()?;
        log::info!("Time series {} holds {} steps", path.display(), len);
        Ok(path)
    }
}

/// Read access to a finished series file
pub struct TimeSeriesStore {
    path: PathBuf,
    file: netcdf::File,
    index: VegetationIndex,
    grid: SeriesGrid,
    days: Vec<i32>,
    sensors: Vec<Sensor>,
}

impl std::fmt::Debug for TimeSeriesStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeSeriesStore")
            .field("path", &self.path)
            .field("index", &self.index)
            .field("steps", &self.days.len())
            .finish()
    }
}

impl TimeSeriesStore {
    pub fn open(path: &Path) -> VegResult<Self> {
        let file = netcdf::open(path)?;

        let index = VegetationIndex::ALL
            .iter()
            .copied()
            .find(|vi| file.variable(vi.name()).is_some())
            .ok_or_else(|| {
                VegError::InvalidFormat(format!("{} has no index variable", path.display()))
            })?;

        let height = file
            .dimension("y")
            .ok_or_else(|| VegError::InvalidFormat("missing y dimension".to_string()))?
            .len();
        let width = file
            .dimension("x")
            .ok_or_else(|| VegError::InvalidFormat("missing x dimension".to_string()))?
            .len();

        let days: Vec<i32> = match file.variable("time") {
            Some(var) if var.len() > 0 => var.get_values::<i32, _>(..)?,
            Some(_) => Vec::new(),
            None => return Err(VegError::InvalidFormat("missing time variable".to_string())),
        };
        let sensors = match file.variable("sensor") {
            Some(var) if var.len() > 0 => var
                .get_values::<u8, _>(..)?
                .into_iter()
                .map(|code| {
                    Sensor::from_code(code).ok_or_else(|| {
                        VegError::InvalidFormat(format!("unknown sensor code {}", code))
                    })
                })
                .collect::<VegResult<Vec<_>>>()?,
            _ => Vec::new(),
        };

        let mut store = Self {
            path: path.to_path_buf(),
            file,
            index,
            grid: SeriesGrid {
                height,
                width,
                transform: GeoTransform::north_up(0.0, 0.0, 1.0),
                crs_wkt: String::new(),
            },
            days,
            sensors,
        };
        store.grid.transform = store.read_transform()?;
        store.grid.crs_wkt = store.grid_mapping_crs().unwrap_or_default();
        Ok(store)
    }

    /// GeoTransform attribute, else derived from the coordinate variables
    fn read_transform(&self) -> VegResult<GeoTransform> {
        if let Some(gt) = self
            .file
            .variable(GRID_MAPPING)
            .and_then(|v| v.attribute_value("GeoTransform"))
            .and_then(|v| v.ok())
            .and_then(string_attribute)
            .and_then(|raw| parse_geotransform(&raw))
        {
            return Ok(gt);
        }

        let coords = |name: &str| -> VegResult<Vec<f64>> {
            self.file
                .variable(name)
                .ok_or_else(|| VegError::InvalidFormat(format!("missing {} coordinate", name)))?
                .get_values::<f64, _>(..)
                .map_err(VegError::from)
        };
        let xs = coords("x")?;
        let ys = coords("y")?;
        if xs.len() < 2 || ys.len() < 2 {
            return Err(VegError::InvalidFormat(format!(
                "{} has too few coordinates to derive a transform",
                self.path.display()
            )));
        }
        let dx = xs[1] - xs[0];
        let dy = ys[1] - ys[0];
        Ok(GeoTransform {
            top_left_x: xs[0] - dx / 2.0,
            pixel_width: dx,
            rotation_x: 0.0,
            top_left_y: ys[0] - dy / 2.0,
            rotation_y: 0.0,
            pixel_height: dy,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> VegetationIndex {
        self.index
    }

    pub fn grid(&self) -> &SeriesGrid {
        &self.grid
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.days.iter().map(|&d| date_from_days(d)).collect()
    }

    fn attribute_string(var: Option<netcdf::Variable<'_>>, name: &str) -> Option<String> {
        var?.attribute_value(name)?.ok().and_then(string_attribute)
    }
}

impl TimeSeriesReader for TimeSeriesStore {
    fn shape(&self) -> (usize, usize, usize) {
        (self.days.len(), self.grid.height, self.grid.width)
    }

    fn time_days(&self) -> &[i32] {
        &self.days
    }

    fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    fn read(
        &self,
        times: Range<usize>,
        rows: Range<usize>,
        cols: Range<usize>,
    ) -> VegResult<Array3<f32>> {
        let shape = (times.len(), rows.len(), cols.len());
        if shape.0 == 0 || shape.1 == 0 || shape.2 == 0 {
            return Ok(Array3::from_elem(shape, f32::NAN));
        }
        let var = self
            .file
            .variable(self.index.name())
            .ok_or_else(|| VegError::InvalidFormat(format!("missing variable {}", self.index)))?;
        let values = var.get_values::<f32, _>((times, rows, cols))?;
        Array3::from_shape_vec(shape, values)
            .map_err(|e| VegError::InvalidFormat(format!("Failed to reshape series block: {}", e)))
    }
}

impl SpatialReferenceBearing for TimeSeriesStore {
    fn source_name(&self) -> String {
        self.path.display().to_string()
    }

    fn grid_mapping_crs(&self) -> Option<String> {
        let mapping = Self::attribute_string(self.file.variable(self.index.name()), "grid_mapping")?;
        Self::attribute_string(self.file.variable(&mapping), "crs_wkt")
    }

    fn dataset_crs(&self) -> Option<String> {
        self.file
            .attribute("crs")
            .and_then(|a| a.value().ok())
            .and_then(string_attribute)
    }

    fn variable_crs(&self) -> Option<String> {
        self.file.variables().find_map(|var| {
            ["crs_wkt", "spatial_ref"].iter().find_map(|name| {
                var.attribute_value(name)
                    .and_then(|v| v.ok())
                    .and_then(string_attribute)
            })
        })
    }
}
