//! Firmware acquisition: upstream catalogues, the on-disk cache and image
//! file parsing.

pub mod cache;
pub mod image;
pub mod manifest;

pub use cache::{CacheMeta, FirmwareCache};
pub use image::{FirmwareImage, ImageFormat, Segment};
pub use manifest::{
    BoardSummary, FirmwareSource, FirmwareVersion, ManifestService, ReleaseType, Vehicle,
    VersionGroup,
};
