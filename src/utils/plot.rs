use crate::core::collector::{LoadSample, LOADS_FILE};
use crate::utils::error::{Result, WkeError};
use chrono::DateTime;
use plotters::prelude::*;
use std::path::Path;

const PLOT_SIZE: (u32, u32) = (1024, 600);

/// The 1-minute load of one machine over time.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadSeries {
    pub machine: String,
    /// Seconds since the first sample of the file, and the load at that time.
    pub points: Vec<(f64, f64)>,
}

fn plot_error(err: impl std::fmt::Display) -> WkeError {
    WkeError::PlotError {
        message: err.to_string(),
    }
}

/// Reads `<log_folder>/loads.csv` and groups it by machine, in order of
/// first appearance.
pub fn read_load_series(log_folder: &Path) -> Result<Vec<LoadSeries>> {
    let path = log_folder.join(LOADS_FILE);
    let mut reader = csv::Reader::from_path(&path).map_err(|err| {
        plot_error(format!("Cannot read {}: {}", path.display(), err))
    })?;

    let mut start = None;
    let mut series: Vec<LoadSeries> = Vec::new();
    for row in reader.deserialize() {
        let sample: LoadSample = row?;
        let timestamp = DateTime::parse_from_rfc3339(&sample.timestamp).map_err(|err| {
            plot_error(format!("Invalid timestamp \"{}\": {}", sample.timestamp, err))
        })?;
        let start = *start.get_or_insert(timestamp);
        let seconds = (timestamp - start).num_milliseconds() as f64 / 1000.0;

        match series.iter_mut().find(|s| s.machine == sample.machine) {
            Some(existing) => existing.points.push((seconds, sample.load1)),
            None => series.push(LoadSeries {
                machine: sample.machine,
                points: vec![(seconds, sample.load1)],
            }),
        }
    }
    Ok(series)
}

/// Renders the loads recorded in `log_folder` as an SVG line chart.
///
/// With `machine_index` set, only that machine (counted in order of
/// appearance in the file) is drawn. Returns the number of plotted series.
pub fn plot_loads(log_folder: &Path, out: &Path, machine_index: Option<usize>) -> Result<usize> {
    let mut series = read_load_series(log_folder)?;
    if let Some(index) = machine_index {
        if index >= series.len() {
            return Err(WkeError::invalid(format!(
                "Machine index {} out of range; {} has loads of {} machine(s)",
                index,
                LOADS_FILE,
                series.len()
            )));
        }
        series = vec![series.swap_remove(index)];
    }

    let max_time = series
        .iter()
        .flat_map(|s| s.points.iter().map(|(t, _)| *t))
        .fold(1.0, f64::max);
    let max_load = series
        .iter()
        .flat_map(|s| s.points.iter().map(|(_, load)| *load))
        .fold(1.0, f64::max);

    let root = SVGBackend::new(out, PLOT_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(plot_error)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Machine load", ("sans-serif", 24))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(0.0..max_time, 0.0..max_load * 1.1)
        .map_err(plot_error)?;

    chart
        .configure_mesh()
        .x_desc("Seconds since start")
        .y_desc("Load (1 minute average)")
        .draw()
        .map_err(plot_error)?;

    for (i, machine) in series.iter().enumerate() {
        let style = Palette99::pick(i).stroke_width(2);
        chart
            .draw_series(LineSeries::new(machine.points.iter().copied(), style))
            .map_err(plot_error)?
            .label(machine.machine.as_str())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], style));
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(plot_error)?;

    root.present().map_err(plot_error)?;
    tracing::debug!("Wrote load plot to {}", out.display());
    Ok(series.len())
}
