mod common;

use approx::assert_abs_diff_eq;
use chrono::NaiveDate;
use common::{init_logging, test_config, Granule, PIXEL};
use gdal::{Dataset, Metadata};
use hlsvi::config::parse_windows;
use hlsvi::core::outlier_points::{OutlierPoint, OutlierPointSink};
use hlsvi::core::worker_pool::{SkipReason, UnitOutcome};
use hlsvi::io::geotiff::{read_header, read_raster};
use hlsvi::io::granule::index_raster_path;
use hlsvi::io::netcdf_store::TimeSeriesStore;
use hlsvi::pipeline::{mosaic_path, series_path, statistic_path, Pipeline};
use hlsvi::types::{Sensor, StatisticKind, TileId, VegetationIndex};
use tempfile::TempDir;

const WEST: f64 = 300_000.0;
const EAST: f64 = WEST + 4.0 * PIXEL;

/// Tile 34HBH: three dates, one cloud and one outlier. Tile 34HCH: two dates.
fn write_granules(raw_dir: &std::path::Path) -> Vec<String> {
    let mut first = Granule::uniform(Sensor::L30, "34HBH", "2023005", WEST, 1000, 5000);
    first.red[[0, 0]] = -500;
    first.nir[[0, 0]] = 1000;

    let mut cloudy = Granule::uniform(Sensor::L30, "34HBH", "2023010", WEST, 1000, 3000);
    cloudy.fmask[[1, 1]] = 0b0000_0010;

    let granules = vec![
        first,
        cloudy,
        Granule::uniform(Sensor::S30, "34HBH", "2023012", WEST, 1000, 5000),
        Granule::uniform(Sensor::L30, "34HCH", "2023005", EAST, 1000, 3000),
        Granule::uniform(Sensor::L30, "34HCH", "2023013", EAST, 1000, 3000),
    ];
    for granule in &granules {
        granule.write(raw_dir);
    }
    granules.iter().map(Granule::id).collect()
}

#[test]
fn test_full_run_produces_every_artifact() {
    init_logging();
    let dir = TempDir::new().expect("tempdir");
    let mut config = test_config(dir.path());
    config.windows =
        parse_windows("early:2023-01-01|2023-01-31 late:2023-06-01|2023-06-30").expect("windows");
    let granules = write_granules(&config.dirs.raw_dir);

    let mut points: Vec<OutlierPoint> = Vec::new();
    let report = Pipeline::new(config.clone())
        .run(Some(&mut points as &mut dyn OutlierPointSink))
        .expect("pipeline run");

    let west = TileId::new("34HBH");
    let east = TileId::new("34HCH");
    assert_eq!(report.tiles.done_tiles(), vec![west.clone(), east.clone()]);
    assert_eq!(report.failed(), 0);

    for id in &granules {
        assert!(index_raster_path(&config.dirs.vi_dir, id, VegetationIndex::NDVI).exists());
    }

    // Chronological series with sensor labels
    let store = TimeSeriesStore::open(&series_path(&config, &west, VegetationIndex::NDVI)).expect("series");
    assert_eq!(
        store.dates(),
        vec![
            NaiveDate::from_ymd_opt(2023, 1, 5).unwrap(),
            NaiveDate::from_ymd_opt(2023, 1, 10).unwrap(),
            NaiveDate::from_ymd_opt(2023, 1, 12).unwrap(),
        ]
    );

    // Pixel (0,0): 3.0 is an outlier, 0.5 and 2/3 are valid
    let mean = read_raster::<f32, _>(statistic_path(&config, &west, VegetationIndex::NDVI, StatisticKind::Mean))
        .expect("mean raster");
    assert_abs_diff_eq!(mean.data[[0, 0]], (0.5 + 2.0 / 3.0) / 2.0, epsilon = 1e-5);
    // Pixel (1,1): the cloudy observation is excluded
    assert_abs_diff_eq!(mean.data[[1, 1]], 2.0 / 3.0, epsilon = 1e-5);
    assert_abs_diff_eq!(mean.data[[2, 2]], (2.0 / 3.0 * 2.0 + 0.5) / 3.0, epsilon = 1e-5);

    let count = read_raster::<u16, _>(statistic_path(&config, &west, VegetationIndex::NDVI, StatisticKind::CountValid))
        .expect("count raster");
    assert_eq!(count.data[[0, 0]], 2);
    assert_eq!(count.data[[1, 1]], 2);
    assert_eq!(count.data[[3, 3]], 3);

    let outlier_path = statistic_path(&config, &west, VegetationIndex::NDVI, StatisticKind::OutlierMean);
    assert!(outlier_path.starts_with(&config.dirs.outlier_dir));
    let outlier_mean = read_raster::<f32, _>(outlier_path).expect("outlier mean");
    assert_abs_diff_eq!(outlier_mean.data[[0, 0]], 3.0, epsilon = 1e-5);
    assert!(outlier_mean.data[[0, 1]].is_nan());

    // Mosaic spans both tiles without gaps
    let mosaic = read_raster::<f32, _>(mosaic_path(&config, VegetationIndex::NDVI, StatisticKind::Mean))
        .expect("mosaic");
    assert_eq!(mosaic.shape(), (4, 8));
    assert!(mosaic.data.iter().all(|v| v.is_finite()));
    assert_abs_diff_eq!(mosaic.data[[0, 4]], 0.5, epsilon = 1e-5);
    assert_abs_diff_eq!(mosaic.transform.top_left_x, WEST, epsilon = 1e-6);

    let mosaic_count =
        read_raster::<u16, _>(mosaic_path(&config, VegetationIndex::NDVI, StatisticKind::OutlierCount))
            .expect("outlier count mosaic");
    assert_eq!(mosaic_count.data[[0, 0]], 1);
    assert_eq!(mosaic_count.data.iter().map(|&c| c as u32).sum::<u32>(), 1);

    // Composite stacks: one band per window, the June window is empty
    let composite = config.dirs.composite_dir.join("HLS_TimeSeries_NDVI_Mean_EPSG32734.tif");
    let header = read_header(&composite).expect("composite header");
    assert_eq!((header.bands, header.width, header.height), (2, 8, 4));
    let dataset = Dataset::open(&composite).expect("open composite");
    let early = dataset.rasterband(1).expect("band 1");
    assert_eq!(early.description().expect("description"), "early");
    let late = dataset.rasterband(2).expect("band 2");
    assert_eq!(late.metadata_item("label", "").as_deref(), Some("late"));
    let late_values = late.read_as::<f32>((0, 0), (8, 4), (8, 4), None).expect("read band 2");
    assert!(late_values.data.iter().all(|v| v.is_nan()));
    assert!(config
        .dirs
        .composite_dir
        .join("HLS_TimeSeries_NDVI_CountValid_EPSG32734.tif")
        .exists());

    // Exactly one outlier observation
    assert_eq!(points.len(), 1);
    let point = &points[0];
    assert_abs_diff_eq!(point.value, 3.0, epsilon = 1e-5);
    assert_eq!(point.tile, west);
    assert_eq!(point.sensor, Sensor::L30);
    assert_eq!(point.date, NaiveDate::from_ymd_opt(2023, 1, 5).unwrap());
    assert_eq!((point.x, point.y), (WEST + 15.0, common::TOP - 15.0));
    assert!(point.lon.is_some() && point.lat.is_some());
}

#[test]
fn test_rerun_skips_existing_artifacts_and_keeps_bytes() {
    init_logging();
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(dir.path());
    write_granules(&config.dirs.raw_dir);

    let first = Pipeline::new(config.clone()).run(None).expect("first run");
    assert_eq!(first.failed(), 0);
    let mosaic = mosaic_path(&config, VegetationIndex::NDVI, StatisticKind::Mean);
    let before = std::fs::read(&mosaic).expect("mosaic bytes");

    let second = Pipeline::new(config.clone()).run(None).expect("second run");
    for stage in ["index", "series", "statistics", "mosaic"] {
        let summary = second.stage(stage).expect("stage summary");
        assert!(!summary.reports.is_empty(), "{} ran no units", stage);
        assert!(
            summary
                .reports
                .iter()
                .all(|r| r.outcome == UnitOutcome::Skipped(SkipReason::AlreadyExists)),
            "{} recomputed an artifact",
            stage
        );
    }
    assert_eq!(std::fs::read(&mosaic).expect("mosaic bytes"), before);
}

#[test]
fn test_deleted_artifact_is_rebuilt_alone() {
    init_logging();
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(dir.path());
    write_granules(&config.dirs.raw_dir);
    Pipeline::new(config.clone()).run(None).expect("first run");

    let mosaic = mosaic_path(&config, VegetationIndex::NDVI, StatisticKind::CountValid);
    std::fs::remove_file(&mosaic).expect("remove mosaic");

    let report = Pipeline::new(config.clone()).run(None).expect("second run");
    let summary = report.stage("mosaic").expect("mosaic summary");
    assert_eq!(summary.succeeded(), 1);
    assert_eq!(summary.skipped(), 3);
    assert!(mosaic.exists());
}

#[test]
fn test_missing_blue_band_is_reported_and_not_retried() {
    init_logging();
    let dir = TempDir::new().expect("tempdir");
    let mut config = test_config(dir.path());
    config.indices = vec![VegetationIndex::NDVI, VegetationIndex::EVI];
    let granules = write_granules(&config.dirs.raw_dir);

    let first = Pipeline::new(config.clone()).run(None).expect("first run");
    assert_eq!(first.failed(), 0);
    let unavailable = |report: &hlsvi::PipelineReport| {
        report
            .stage("index")
            .expect("index summary")
            .reports
            .iter()
            .filter(|r| matches!(r.outcome, UnitOutcome::Skipped(SkipReason::InputUnavailable(_))))
            .map(|r| r.unit.clone())
            .collect::<Vec<_>>()
    };
    let mut expected: Vec<String> = granules.iter().map(|id| format!("{}.EVI", id)).collect();
    expected.sort();
    let mut reported = unavailable(&first);
    reported.sort();
    assert_eq!(reported, expected);
    for id in &granules {
        assert!(index_raster_path(&config.dirs.vi_dir, id, VegetationIndex::NDVI).exists());
        assert!(!index_raster_path(&config.dirs.vi_dir, id, VegetationIndex::EVI).exists());
    }

    // Nothing is fetched or written again
    let second = Pipeline::new(config.clone()).run(None).expect("second run");
    let index = second.stage("index").expect("index summary");
    assert_eq!(index.succeeded(), 0);
    assert_eq!(
        index
            .reports
            .iter()
            .filter(|r| r.outcome == UnitOutcome::Skipped(SkipReason::AlreadyExists))
            .count(),
        granules.len()
    );
    assert_eq!(unavailable(&second).len(), granules.len());
}
