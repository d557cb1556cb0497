//! Python bindings (feature `python`)

use crate::config::PipelineConfig;
use crate::core::quality_mask::{QualityMaskConfig, QualityMaskDecoder};
use crate::core::temporal_stats::{ChunkedStatisticsEngine, StatisticsParams};
use crate::core::time_series::InMemorySeries;
use crate::core::vegetation_index::{IndexCalculator, ReflectanceBands};
use crate::pipeline::Pipeline;
use crate::types::{Sensor, ValidRange, VegError, VegetationIndex};
use numpy::{PyReadonlyArray2, PyReadonlyArray3, ToPyArray};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use std::collections::HashMap;

fn runtime_error(e: VegError) -> PyErr {
    PyErr::new::<PyRuntimeError, _>(format!("{}", e))
}

fn value_error(e: VegError) -> PyErr {
    PyErr::new::<PyValueError, _>(format!("{}", e))
}

/// Usable-pixel mask of an Fmask array
#[pyfunction]
#[pyo3(signature = (
    fmask,
    aerosol_mode = "MODERATE",
    cirrus = true,
    cloud = true,
    adjacent_cloud = true,
    cloud_shadow = true,
    snow_ice = true,
    water = true
))]
#[allow(clippy::too_many_arguments)]
fn decode_quality_mask(
    py: Python,
    fmask: PyReadonlyArray2<u8>,
    aerosol_mode: &str,
    cirrus: bool,
    cloud: bool,
    adjacent_cloud: bool,
    cloud_shadow: bool,
    snow_ice: bool,
    water: bool,
) -> PyResult<PyObject> {
    let config = QualityMaskConfig {
        cirrus,
        cloud,
        adjacent_cloud,
        cloud_shadow,
        snow_ice,
        water,
        aerosol: aerosol_mode.parse().map_err(value_error)?,
    };
    let usable = QualityMaskDecoder::new(&config).decode(&fmask.as_array().to_owned());
    Ok(usable.to_pyarray(py).into())
}

/// One index grid from stored reflectance integers; masked pixels are NaN
#[pyfunction]
#[pyo3(signature = (index, red, nir, usable, blue = None, scale_factor = 0.0001))]
fn compute_index(
    py: Python,
    index: &str,
    red: PyReadonlyArray2<f32>,
    nir: PyReadonlyArray2<f32>,
    usable: PyReadonlyArray2<bool>,
    blue: Option<PyReadonlyArray2<f32>>,
    scale_factor: f32,
) -> PyResult<PyObject> {
    let index: VegetationIndex = index.parse().map_err(value_error)?;
    let bands = ReflectanceBands::from_scaled(
        red.as_array().to_owned(),
        nir.as_array().to_owned(),
        blue.map(|b| b.as_array().to_owned()),
        scale_factor,
    );
    let mut grids = IndexCalculator::new(&[index])
        .compute(&bands, &usable.as_array().to_owned())
        .map_err(runtime_error)?;
    match grids.pop() {
        Some((_, grid)) => Ok(grid.to_pyarray(py).into()),
        None => Err(PyErr::new::<PyRuntimeError, _>("no index computed")),
    }
}

/// Temporal statistics of a (time, rows, cols) array
#[pyfunction]
#[pyo3(signature = (values, valid_min, valid_max, chunk_size = 512))]
fn temporal_statistics(
    py: Python,
    values: PyReadonlyArray3<f32>,
    valid_min: f32,
    valid_max: f32,
    chunk_size: usize,
) -> PyResult<PyObject> {
    let values = values.as_array().to_owned();
    let steps = values.dim().0;
    // Sensor labels and dates do not enter the reduction
    let series = InMemorySeries::new(values, (0..steps as i32).collect(), vec![Sensor::L30; steps])
        .map_err(runtime_error)?;

    let engine = ChunkedStatisticsEngine::with_params(StatisticsParams {
        valid_range: ValidRange::new(valid_min, valid_max),
        chunk_size,
    });
    let stats = engine.compute(&series).map_err(runtime_error)?;

    let result = PyDict::new(py);
    result.set_item("mean", stats.mean.to_pyarray(py))?;
    result.set_item("count_valid", stats.count_valid.to_pyarray(py))?;
    result.set_item("outlier_mean", stats.outlier_mean.to_pyarray(py))?;
    result.set_item("outlier_count", stats.outlier_count.to_pyarray(py))?;
    result.set_item("steps", stats.steps)?;
    Ok(result.into())
}

/// Run the whole pipeline configured from environment-style variables
#[pyfunction]
fn run_pipeline(py: Python, env: HashMap<String, String>) -> PyResult<PyObject> {
    let config = PipelineConfig::from_env_map(&env);
    let report = py
        .allow_threads(|| Pipeline::new(config).run(None))
        .map_err(runtime_error)?;

    let result = PyDict::new(py);
    result.set_item(
        "tiles_done",
        report.tiles.done_tiles().iter().map(|t| t.to_string()).collect::<Vec<_>>(),
    )?;
    result.set_item(
        "tiles_failed",
        report
            .tiles
            .failed_tiles()
            .into_iter()
            .map(|(tile, stage, message)| (tile.to_string(), stage.to_string(), message))
            .collect::<Vec<_>>(),
    )?;
    let stages = PyDict::new(py);
    for summary in &report.stages {
        stages.set_item(
            summary.stage.as_str(),
            (summary.succeeded(), summary.skipped(), summary.failed()),
        )?;
    }
    result.set_item("stages", stages)?;
    Ok(result.into())
}

/// Route Rust log records to stderr, honouring RUST_LOG
#[pyfunction]
fn init_logging() {
    let _ = env_logger::try_init();
}

/// Python module definition
#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(decode_quality_mask, m)?)?;
    m.add_function(wrap_pyfunction!(compute_index, m)?)?;
    m.add_function(wrap_pyfunction!(temporal_statistics, m)?)?;
    m.add_function(wrap_pyfunction!(run_pipeline, m)?)?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;
    Ok(())
}
