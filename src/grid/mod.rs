//! Grid coordinate model and capture annotation.

pub mod annotator;
pub mod glyphs;
pub mod spec;

pub use annotator::{
    encode_for_model, encode_jpeg, AnnotateError, Annotator, GridStyle, DEFAULT_JPEG_QUALITY,
    DEFAULT_MODEL_IMAGE_SIDE,
};
pub use spec::{column_letter, CellLabel, GridError, GridOrigin, GridSpec, MAX_COLUMNS};
