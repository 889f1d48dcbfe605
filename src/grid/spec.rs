//! Grid coordinate model: cell labels and their pixel positions.
//!
//! The screen is split into `columns x rows` cells. Columns are labelled with
//! letters (`A`, `B`, ...) from left to right and rows with numbers (`1`, `2`,
//! ...) from top to bottom, so `E5` is the fifth column of the fifth row.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Only single-letter column labels are defined.
pub const MAX_COLUMNS: u32 = 26;

/// Target cell width in pixels used by [`GridSpec::auto`].
pub const TARGET_CELL_WIDTH: f64 = 108.0;

/// Target cell height in pixels used by [`GridSpec::auto`].
pub const TARGET_CELL_HEIGHT: f64 = 120.0;

const AUTO_COLUMN_RANGE: (u32, u32) = (8, 20);
const AUTO_ROW_RANGE: (u32, u32) = (15, 35);

static LABEL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Z])([0-9]{1,4})$").expect("valid cell label regex"));

/// Grid errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    #[error("Cell {label} is outside the {columns}x{rows} grid")]
    OutOfRange {
        label: String,
        columns: u32,
        rows: u32,
    },
    #[error("Invalid cell label {0:?}, expected a column letter followed by a row number (e.g. E5)")]
    InvalidLabel(String),
    #[error("Invalid grid dimensions: {0}")]
    InvalidDimensions(String),
}

/// A grid cell addressed by zero-based column and row indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub struct CellLabel {
    column: u32,
    row: u32,
}

impl CellLabel {
    /// Create a label from zero-based indices. Range checks happen against a
    /// [`GridSpec`].
    pub fn new(column: u32, row: u32) -> Self {
        Self { column, row }
    }

    /// Parse a label like `"E5"`. Case-insensitive, surrounding whitespace is
    /// ignored.
    pub fn parse(label: &str) -> Result<Self, GridError> {
        let normalized = label.trim().to_uppercase();
        let caps = LABEL_PATTERN
            .captures(&normalized)
            .ok_or_else(|| GridError::InvalidLabel(label.to_string()))?;

        let letter = caps[1].as_bytes()[0];
        let row: u32 = caps[2]
            .parse()
            .map_err(|_| GridError::InvalidLabel(label.to_string()))?;
        if row == 0 {
            return Err(GridError::InvalidLabel(label.to_string()));
        }

        Ok(Self {
            column: u32::from(letter - b'A'),
            row: row - 1,
        })
    }

    /// Zero-based column index.
    pub fn column(&self) -> u32 {
        self.column
    }

    /// Zero-based row index.
    pub fn row(&self) -> u32 {
        self.row
    }
}

/// Column letter for a zero-based index.
pub fn column_letter(column: u32) -> Option<char> {
    if column < MAX_COLUMNS {
        Some(char::from(b'A' + column as u8))
    } else {
        None
    }
}

impl fmt::Display for CellLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match column_letter(self.column) {
            Some(letter) => write!(f, "{}{}", letter, self.row + 1),
            None => write!(f, "#{}:{}", self.column + 1, self.row + 1),
        }
    }
}

impl From<CellLabel> for String {
    fn from(cell: CellLabel) -> Self {
        cell.to_string()
    }
}

impl FromStr for CellLabel {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Where the grid density came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GridOrigin {
    /// Columns and rows were configured explicitly.
    Custom,
    /// Columns and rows were derived from the screen size.
    Auto,
}

/// Immutable description of the grid laid over one screen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GridSpec {
    columns: u32,
    rows: u32,
    screen_width: u32,
    screen_height: u32,
    origin: GridOrigin,
}

impl GridSpec {
    /// Create a grid with explicit density.
    ///
    /// Cells must be more than one pixel wide and tall, otherwise the center
    /// of a cell can round onto its neighbour.
    pub fn new(
        columns: u32,
        rows: u32,
        screen_width: u32,
        screen_height: u32,
    ) -> Result<Self, GridError> {
        Self::build(columns, rows, screen_width, screen_height, GridOrigin::Custom)
    }

    /// Derive the grid density from the screen size, aiming for roughly
    /// 108x120 pixel cells.
    pub fn auto(screen_width: u32, screen_height: u32) -> Result<Self, GridError> {
        if screen_width == 0 || screen_height == 0 {
            return Err(GridError::InvalidDimensions(format!(
                "screen size {}x{} must be non-zero",
                screen_width, screen_height
            )));
        }
        let columns = (screen_width as f64 / TARGET_CELL_WIDTH).round() as u32;
        let rows = (screen_height as f64 / TARGET_CELL_HEIGHT).round() as u32;

        Self::build(
            columns.clamp(AUTO_COLUMN_RANGE.0, AUTO_COLUMN_RANGE.1),
            rows.clamp(AUTO_ROW_RANGE.0, AUTO_ROW_RANGE.1),
            screen_width,
            screen_height,
            GridOrigin::Auto,
        )
    }

    fn build(
        columns: u32,
        rows: u32,
        screen_width: u32,
        screen_height: u32,
        origin: GridOrigin,
    ) -> Result<Self, GridError> {
        if columns == 0 || columns > MAX_COLUMNS {
            return Err(GridError::InvalidDimensions(format!(
                "columns must be between 1 and {}, got {}",
                MAX_COLUMNS, columns
            )));
        }
        if rows == 0 {
            return Err(GridError::InvalidDimensions(
                "rows must be at least 1".to_string(),
            ));
        }
        if screen_width <= columns || screen_height <= rows {
            return Err(GridError::InvalidDimensions(format!(
                "screen {}x{} is too small for a {}x{} grid",
                screen_width, screen_height, columns, rows
            )));
        }

        Ok(Self {
            columns,
            rows,
            screen_width,
            screen_height,
            origin,
        })
    }

    pub fn columns(&self) -> u32 {
        self.columns
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn screen_width(&self) -> u32 {
        self.screen_width
    }

    pub fn screen_height(&self) -> u32 {
        self.screen_height
    }

    pub fn origin(&self) -> GridOrigin {
        self.origin
    }

    pub fn cell_width(&self) -> f64 {
        self.screen_width as f64 / self.columns as f64
    }

    pub fn cell_height(&self) -> f64 {
        self.screen_height as f64 / self.rows as f64
    }

    /// Label of the last column (e.g. `J` for ten columns).
    pub fn last_column_letter(&self) -> char {
        column_letter(self.columns - 1).unwrap_or('Z')
    }

    /// Check that a cell exists on this grid.
    pub fn check(&self, cell: CellLabel) -> Result<CellLabel, GridError> {
        if cell.column >= self.columns || cell.row >= self.rows {
            return Err(GridError::OutOfRange {
                label: cell.to_string(),
                columns: self.columns,
                rows: self.rows,
            });
        }
        Ok(cell)
    }

    /// Parse a label and check it against this grid.
    pub fn parse_cell(&self, label: &str) -> Result<CellLabel, GridError> {
        self.check(CellLabel::parse(label)?)
    }

    /// Pixel coordinates of the center of a cell.
    pub fn cell_to_pixel(&self, cell: CellLabel) -> Result<(u32, u32), GridError> {
        let cell = self.check(cell)?;
        let x = ((cell.column as f64 + 0.5) * self.cell_width()).round() as u32;
        let y = ((cell.row as f64 + 0.5) * self.cell_height()).round() as u32;
        Ok((x, y))
    }

    /// Cell containing a pixel. Coordinates outside the screen are clamped to
    /// the nearest edge cell.
    pub fn pixel_to_cell(&self, x: u32, y: u32) -> CellLabel {
        let column = (x as f64 / self.cell_width()).floor() as u32;
        let row = (y as f64 / self.cell_height()).floor() as u32;
        CellLabel {
            column: column.min(self.columns - 1),
            row: row.min(self.rows - 1),
        }
    }

    /// Bounding box `(left, top, right, bottom)` of a cell in pixels.
    pub fn cell_bounds(&self, cell: CellLabel) -> Result<(u32, u32, u32, u32), GridError> {
        let cell = self.check(cell)?;
        let left = (cell.column as f64 * self.cell_width()) as u32;
        let top = (cell.row as f64 * self.cell_height()) as u32;
        let right = ((cell.column + 1) as f64 * self.cell_width()) as u32;
        let bottom = ((cell.row + 1) as f64 * self.cell_height()) as u32;
        Ok((left, top, right, bottom))
    }

    /// Every cell on the grid, row by row.
    pub fn cells(&self) -> impl Iterator<Item = CellLabel> + '_ {
        (0..self.rows).flat_map(move |row| (0..self.columns).map(move |column| CellLabel::new(column, row)))
    }
}

impl fmt::Display for GridSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} (A-{}, 1-{}) on {}x{} px, cell {:.0}x{:.0} px",
            self.columns,
            self.rows,
            self.last_column_letter(),
            self.rows,
            self.screen_width,
            self.screen_height,
            self.cell_width(),
            self.cell_height()
        )
    }
}
