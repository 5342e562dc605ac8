//! Two-dimensional parameter scans
//!
//! Each axis is swept from `start` to `end` inclusive. One job covers
//! `per_job` consecutive points, so cells start every `increment * per_job`
//! and a cell's end is clamped to the axis end when `per_job` does not
//! divide the range evenly.

use serde::{Deserialize, Serialize};

/// Tolerance for floating-point stepping
const EPSILON: f64 = 1e-9;

/// Scan values are kept to nine decimal places
const SCALE: f64 = 1e9;

/// Errors in scan or job-count parameters
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScanError {
    #[error("scan{axis}: {message}")]
    InvalidAxis { axis: u8, message: String },

    #[error("{0} must be at least 1")]
    ZeroCount(&'static str),

    #[error("{0} would overflow")]
    Overflow(&'static str),
}

/// One scan axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanAxis {
    pub start: f64,
    /// Inclusive
    pub end: f64,
    pub increment: f64,
    /// Scan points bundled into one job
    pub per_job: u32,
}

/// Sub-range of an axis assigned to one job
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisCell {
    pub start: f64,
    pub end: f64,
}

impl Default for ScanAxis {
    /// A single point at zero
    fn default() -> Self {
        Self {
            start: 0.0,
            end: 0.0,
            increment: 1.0,
            per_job: 1,
        }
    }
}

impl ScanAxis {
    pub fn new(start: f64, end: f64, increment: f64, per_job: u32) -> Self {
        Self {
            start,
            end,
            increment,
            per_job,
        }
    }

    /// Check the axis parameters. `axis` is 1 or 2, for messages.
    pub fn validate(&self, axis: u8) -> Result<(), ScanError> {
        let invalid = |message: &str| ScanError::InvalidAxis {
            axis,
            message: message.to_string(),
        };
        if !(self.start.is_finite() && self.end.is_finite() && self.increment.is_finite()) {
            return Err(invalid("values must be finite"));
        }
        if self.increment <= 0.0 {
            return Err(invalid("increment must be positive"));
        }
        if self.per_job == 0 {
            return Err(invalid("points per job must be at least 1"));
        }
        if self.end < self.start {
            return Err(invalid("end is below start"));
        }
        Ok(())
    }

    /// Distance between the starts of consecutive cells
    pub fn step(&self) -> f64 {
        self.increment * f64::from(self.per_job)
    }

    /// Number of cells, i.e. ceil(points / per_job).
    pub fn cell_count(&self) -> usize {
        ((self.end - self.start) / self.step() + EPSILON).floor() as usize + 1
    }

    /// Cells in ascending order.
    pub fn cells(&self) -> Vec<AxisCell> {
        let span = self.increment * f64::from(self.per_job - 1);
        (0..self.cell_count())
            .map(|i| {
                let start = round_scan(self.start + i as f64 * self.step());
                AxisCell {
                    start,
                    end: round_scan((start + span).min(self.end)),
                }
            })
            .collect()
    }
}

/// Outer (`axis1`) and inner (`axis2`) scan axes
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanGrid {
    pub axis1: ScanAxis,
    pub axis2: ScanAxis,
}

impl ScanGrid {
    pub fn new(axis1: ScanAxis, axis2: ScanAxis) -> Self {
        Self { axis1, axis2 }
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        self.axis1.validate(1)?;
        self.axis2.validate(2)
    }

    pub fn cell_count(&self) -> usize {
        self.axis1.cell_count() * self.axis2.cell_count()
    }

    /// Cells in scan order: outer ascending, inner ascending within each outer.
    pub fn cells(&self) -> Vec<(AxisCell, AxisCell)> {
        let inner = self.axis2.cells();
        self.axis1
            .cells()
            .into_iter()
            .flat_map(|outer| inner.iter().map(move |cell| (outer, *cell)))
            .collect()
    }
}

/// Round away accumulated floating-point noise (0.30000000000000004 -> 0.3).
pub fn round_scan(value: f64) -> f64 {
    let rounded = (value * SCALE).round() / SCALE;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// Render a scan value for substitution; integral values print without a fraction.
pub fn format_scan_value(value: f64) -> String {
    let rounded = round_scan(value);
    let text = format!("{:.9}", rounded);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_axis_is_single_point() {
        let axis = ScanAxis::default();
        assert_eq!(axis.cell_count(), 1);
        assert_eq!(axis.cells(), vec![AxisCell { start: 0.0, end: 0.0 }]);
    }

    #[test]
    fn test_even_division() {
        let axis = ScanAxis::new(0.0, 10.0, 1.0, 1);
        assert_eq!(axis.cell_count(), 11);
        let cells = axis.cells();
        assert_eq!(cells[10], AxisCell { start: 10.0, end: 10.0 });
    }

    #[test]
    fn test_last_cell_clamped_to_axis_end() {
        let axis = ScanAxis::new(0.0, 10.0, 1.0, 3);
        let cells = axis.cells();
        assert_eq!(
            cells,
            vec![
                AxisCell { start: 0.0, end: 2.0 },
                AxisCell { start: 3.0, end: 5.0 },
                AxisCell { start: 6.0, end: 8.0 },
                AxisCell { start: 9.0, end: 10.0 },
            ]
        );
        // ceil(11 points / 3 per job)
        assert_eq!(axis.cell_count(), 4);
    }

    #[test]
    fn test_fractional_increment_hits_end() {
        let axis = ScanAxis::new(0.0, 1.0, 0.1, 1);
        let cells = axis.cells();
        assert_eq!(cells.len(), 11);
        assert_eq!(cells[3].start, 0.3);
        assert_eq!(cells[10].start, 1.0);
    }

    #[test]
    fn test_grid_order_outer_then_inner() {
        let grid = ScanGrid::new(ScanAxis::new(1.0, 2.0, 1.0, 1), ScanAxis::new(0.0, 0.5, 0.25, 1));
        let starts: Vec<(f64, f64)> = grid.cells().iter().map(|(a, b)| (a.start, b.start)).collect();
        assert_eq!(
            starts,
            vec![(1.0, 0.0), (1.0, 0.25), (1.0, 0.5), (2.0, 0.0), (2.0, 0.25), (2.0, 0.5)]
        );
        assert_eq!(grid.cell_count(), 6);
    }

    #[test]
    fn test_validation() {
        assert!(ScanAxis::new(0.0, 1.0, 0.0, 1).validate(1).is_err());
        assert!(ScanAxis::new(0.0, 1.0, -1.0, 1).validate(1).is_err());
        assert!(ScanAxis::new(0.0, 1.0, 1.0, 0).validate(2).is_err());
        assert!(ScanAxis::new(2.0, 1.0, 1.0, 1).validate(1).is_err());
        assert!(ScanAxis::new(0.0, f64::NAN, 1.0, 1).validate(1).is_err());
        assert!(ScanAxis::new(-5.0, 5.0, 2.5, 2).validate(1).is_ok());

        let grid = ScanGrid::new(ScanAxis::default(), ScanAxis::new(0.0, 1.0, 0.0, 1));
        assert_eq!(
            grid.validate(),
            Err(ScanError::InvalidAxis {
                axis: 2,
                message: "increment must be positive".to_string()
            })
        );
    }

    #[test]
    fn test_format_scan_value() {
        assert_eq!(format_scan_value(3.0), "3");
        assert_eq!(format_scan_value(0.1 * 3.0), "0.3");
        assert_eq!(format_scan_value(-2.5), "-2.5");
        assert_eq!(format_scan_value(-0.0), "0");
    }
}
