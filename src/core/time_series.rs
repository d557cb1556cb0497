use crate::config::PipelineConfig;
use crate::io::geotiff::read_raster;
use crate::io::granule::{find_index_rasters, GranuleName};
use crate::io::netcdf_store::{SeriesGrid, TimeSeriesStore, TimeSeriesWriter, TimeStep};
use crate::types::{GeoRaster, Sensor, TileId, VegError, VegResult, VegetationIndex};
use ndarray::{s, Array3};
use std::collections::BTreeSet;
use std::ops::Range;
use std::path::{Path, PathBuf};

/// Block access to a (time, row, col) index volume
pub trait TimeSeriesReader {
    /// `(time steps, rows, cols)`
    fn shape(&self) -> (usize, usize, usize);

    /// Day offsets of the time axis, non-decreasing
    fn time_days(&self) -> &[i32];

    fn sensors(&self) -> &[Sensor];

    fn read(
        &self,
        times: Range<usize>,
        rows: Range<usize>,
        cols: Range<usize>,
    ) -> VegResult<Array3<f32>>;
}

/// A whole series held in memory
#[derive(Debug, Clone)]
pub struct InMemorySeries {
    pub values: Array3<f32>,
    pub days: Vec<i32>,
    pub sensors: Vec<Sensor>,
}

impl InMemorySeries {
    pub fn new(values: Array3<f32>, days: Vec<i32>, sensors: Vec<Sensor>) -> VegResult<Self> {
        let steps = values.dim().0;
        if days.len() != steps || sensors.len() != steps {
            return Err(VegError::ShapeMismatch(format!(
                "{} time steps but {} days and {} sensors",
                steps,
                days.len(),
                sensors.len()
            )));
        }
        Ok(Self {
            values,
            days,
            sensors,
        })
    }
}

impl TimeSeriesReader for InMemorySeries {
    fn shape(&self) -> (usize, usize, usize) {
        self.values.dim()
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
        let (t, h, w) = self.values.dim();
        if times.end > t || rows.end > h || cols.end > w {
            return Err(VegError::Processing(format!(
                "block {:?}x{:?}x{:?} outside volume {:?}",
                times,
                rows,
                cols,
                (t, h, w)
            )));
        }
        Ok(self.values.slice(s![times, rows, cols]).to_owned())
    }
}

/// One per-granule index raster waiting to be stacked
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SeriesInput {
    pub step: TimeStep,
    pub path: PathBuf,
}

impl SeriesInput {
    pub fn from_granule(path: PathBuf, granule: &GranuleName) -> Self {
        Self {
            step: TimeStep {
                date: granule.date,
                sensor: granule.sensor,
            },
            path,
        }
    }
}

/// What an assembly call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyOutcome {
    /// The series file was already present and left untouched
    AlreadyExists,
    Built { steps: usize, skipped: usize },
}

/// Stacks per-granule index rasters into a chronological series file
pub struct TimeSeriesAssembler {
    deflate_level: i32,
}

impl TimeSeriesAssembler {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            deflate_level: config.output.netcdf_deflate_level,
        }
    }

    /// Index rasters of one tile found under `vi_dir`
    pub fn collect_inputs(
        vi_dir: &Path,
        tile: &TileId,
        index: VegetationIndex,
    ) -> VegResult<Vec<SeriesInput>> {
        Ok(find_index_rasters(vi_dir, index)?
            .into_iter()
            .filter(|(_, granule)| &granule.tile == tile)
            .map(|(path, granule)| SeriesInput::from_granule(path, &granule))
            .collect())
    }

    /// Build `output` from `inputs`, ordered by date, then sensor, then path.
    ///
    /// Unreadable rasters are skipped. A raster whose grid differs from the
    /// first readable one aborts the series.
    pub fn assemble(
        &self,
        tile: &TileId,
        index: VegetationIndex,
        mut inputs: Vec<SeriesInput>,
        output: &Path,
    ) -> VegResult<AssemblyOutcome> {
        if output.exists() {
            log::info!("Time series exists, skipping: {}", output.display());
            return Ok(AssemblyOutcome::AlreadyExists);
        }
        inputs.sort();

        let mut writer: Option<TimeSeriesWriter> = None;
        let mut skipped = 0usize;

        for input in &inputs {
            let raster = match read_raster::<f32, _>(&input.path) {
                Ok(raster) => raster,
                Err(e) => {
                    log::warn!("Skipping unreadable {}: {}", input.path.display(), e);
                    skipped += 1;
                    continue;
                }
            };

            if let Some(existing) = &writer {
                check_same_grid(existing.grid(), &input.path, &raster)?;
            } else {
                let (height, width) = raster.shape();
                let grid = SeriesGrid {
                    height,
                    width,
                    transform: raster.transform,
                    crs_wkt: raster.crs_wkt.clone(),
                };
                writer = Some(TimeSeriesWriter::create(
                    output,
                    tile,
                    index,
                    grid,
                    self.deflate_level,
                )?);
            }
            if let Some(writer) = writer.as_mut() {
                writer.push(input.step, &raster.data)?;
            }
        }

        match writer {
            Some(writer) => {
                let steps = writer.len();
                writer.finish()?;
                if skipped > 0 {
                    log::warn!(
                        "T{} {}: {} of {} inputs skipped",
                        tile,
                        index,
                        skipped,
                        inputs.len()
                    );
                }
                Ok(AssemblyOutcome::Built { steps, skipped })
            }
            None => Err(VegError::NoObservations(format!(
                "no readable {} rasters for tile {}",
                index, tile
            ))),
        }
    }

    /// Append inputs not yet stored to an existing series.
    ///
    /// Steps already present are ignored. New steps dated before the last
    /// stored date cannot be inserted and are skipped with a warning.
    pub fn extend(&self, mut inputs: Vec<SeriesInput>, output: &Path) -> VegResult<usize> {
        let (index, last, stored) = {
            let store = TimeSeriesStore::open(output)?;
            let dates = store.dates();
            let stored: BTreeSet<TimeStep> = dates
                .iter()
                .zip(store.sensors())
                .map(|(&date, &sensor)| TimeStep { date, sensor })
                .collect();
            (store.index(), dates.last().copied(), stored)
        };
        let mut writer = TimeSeriesWriter::append(output, index)?;
        inputs.sort();
        inputs.retain(|input| {
            if stored.contains(&input.step) {
                return false;
            }
            match last {
                Some(last) if input.step.date < last => {
                    log::warn!(
                        "Skipping {}: {} precedes the last stored date {}",
                        input.path.display(),
                        input.step.date,
                        last
                    );
                    false
                }
                _ => true,
            }
        });

        let mut added = 0usize;
        for input in inputs {
            let raster = match read_raster::<f32, _>(&input.path) {
                Ok(raster) => raster,
                Err(e) => {
                    log::warn!("Skipping unreadable {}: {}", input.path.display(), e);
                    continue;
                }
            };
            check_same_grid(writer.grid(), &input.path, &raster)?;
            writer.push(input.step, &raster.data)?;
            added += 1;
        }

        if added == 0 {
            log::info!("No new observations for {}", output.display());
            return Ok(0);
        }
        writer.finish()?;
        Ok(added)
    }
}

fn check_same_grid(
    grid: &SeriesGrid,
    path: &Path,
    raster: &GeoRaster<f32>,
) -> VegResult<()> {
    if raster.shape() != (grid.height, grid.width) {
        return Err(VegError::ShapeMismatch(format!(
            "{} is {:?}, series is ({}, {})",
            path.display(),
            raster.shape(),
            grid.height,
            grid.width
        )));
    }
    if !raster.transform.approx_eq(&grid.transform) {
        return Err(VegError::ShapeMismatch(format!(
            "{} is not on the series grid",
            path.display()
        )));
    }
    if raster.crs_wkt != grid.crs_wkt {
        return Err(VegError::ShapeMismatch(format!(
            "{} has a different spatial reference",
            path.display()
        )));
    }
    Ok(())
}
