//! Hamamatsu VMS key file parsing.
//!
//! A `.vms` file is an INI-style index describing a mosaic of JPEG files:
//!
//! ```text
//! [Virtual Microscope Specimen]
//! NoLayers=1
//! NoJpegColumns=2
//! NoJpegRows=2
//! ImageFile=0001.jpg
//! ImageFile(1,0)=0002.jpg
//! ImageFile(0,1)=0003.jpg
//! ImageFile(1,1)=0004.jpg
//! MapFile=map.jpg
//! OptimisationFile=0001.opt
//! MacroImage=macro.jpg
//! PhysicalWidth=10000000
//! SourceLens=20
//! ```
//!
//! `ImageFile` without coordinates is the `(0,0)` piece. The companion
//! `.vmu` key file uses a different group name and an uncompressed pixel
//! format this library does not read.

use std::collections::HashMap;

use tracing::warn;

use crate::error::SlideError;

/// Group header of a VMS key file.
pub const VMS_GROUP: &str = "[Virtual Microscope Specimen]";

/// Group header of the uncompressed (VMU) variant.
pub const VMU_GROUP: &str = "[Uncompressed Virtual Microscope Specimen]";

/// Parsed VMS key file.
#[derive(Debug, Clone, Default)]
pub struct VmsKeyFile {
    /// Focal layers (only layer 0 is read)
    pub num_layers: u32,

    /// Mosaic columns of JPEG files
    pub num_cols: u32,

    /// Mosaic rows of JPEG files
    pub num_rows: u32,

    /// JPEG file names, row-major; `None` for missing pieces
    pub image_files: Vec<Option<String>>,

    /// Low-resolution overview JPEG
    pub map_file: Option<String>,

    /// Restart-marker hint file
    pub optimisation_file: Option<String>,

    /// Macro photograph of the whole slide
    pub macro_image: Option<String>,

    /// Specimen width in nanometers
    pub physical_width: Option<f64>,

    /// Specimen height in nanometers
    pub physical_height: Option<f64>,

    /// Objective lens power
    pub source_lens: Option<f64>,

    /// Every key/value pair as written
    pub properties: HashMap<String, String>,
}

impl VmsKeyFile {
    /// Quick check that text looks like a VMS key file.
    pub fn looks_like_vms(text: &str) -> bool {
        text.lines().any(|l| l.trim() == VMS_GROUP)
    }

    /// Quick check for the uncompressed variant's group header.
    pub fn looks_like_vmu(text: &str) -> bool {
        text.lines().any(|l| l.trim() == VMU_GROUP)
    }

    /// Parse a VMS key file.
    ///
    /// Unparsable lines and values are skipped with a warning; a missing
    /// group header or `(0,0)` image is fatal.
    pub fn parse(text: &str) -> Result<Self, SlideError> {
        if !Self::looks_like_vms(text) {
            return Err(SlideError::bad_data(
                "key file lacks the Virtual Microscope Specimen group",
            ));
        }

        let mut key_file = VmsKeyFile {
            num_layers: 1,
            num_cols: 1,
            num_rows: 1,
            ..Default::default()
        };
        let mut image_entries: Vec<(u32, u32, String)> = Vec::new();
        let mut in_group = false;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') {
                in_group = line == VMS_GROUP;
                continue;
            }
            if !in_group {
                continue;
            }

            let Some(eq) = line.find('=') else {
                warn!(line, "skipping key file line without '='");
                continue;
            };
            let key = line[..eq].trim();
            let value = line[eq + 1..].trim();
            key_file
                .properties
                .insert(key.to_string(), value.to_string());

            match key {
                "NoLayers" => parse_into(&mut key_file.num_layers, key, value),
                "NoJpegColumns" => parse_into(&mut key_file.num_cols, key, value),
                "NoJpegRows" => parse_into(&mut key_file.num_rows, key, value),
                "ImageFile" => image_entries.push((0, 0, value.to_string())),
                "MapFile" => key_file.map_file = Some(value.to_string()),
                "OptimisationFile" => key_file.optimisation_file = Some(value.to_string()),
                "MacroImage" => key_file.macro_image = Some(value.to_string()),
                "PhysicalWidth" => key_file.physical_width = value.parse().ok(),
                "PhysicalHeight" => key_file.physical_height = value.parse().ok(),
                "SourceLens" => key_file.source_lens = value.parse().ok(),
                _ => {
                    if let Some(coords) = key
                        .strip_prefix("ImageFile(")
                        .and_then(|rest| rest.strip_suffix(')'))
                    {
                        match parse_coords(coords) {
                            Some((col, row)) => image_entries.push((col, row, value.to_string())),
                            None => warn!(key, "skipping image file key with bad coordinates"),
                        }
                    }
                }
            }
        }

        if key_file.num_cols == 0 || key_file.num_rows == 0 {
            return Err(SlideError::bad_data("key file declares an empty mosaic"));
        }

        let slots = (key_file.num_cols as usize) * (key_file.num_rows as usize);
        key_file.image_files = vec![None; slots];
        for (col, row, file) in image_entries {
            if col >= key_file.num_cols || row >= key_file.num_rows {
                return Err(SlideError::bad_data(format!(
                    "image file at ({col},{row}) outside the {}x{} mosaic",
                    key_file.num_cols, key_file.num_rows
                )));
            }
            key_file.image_files[(row * key_file.num_cols + col) as usize] = Some(file);
        }

        if key_file.image_files[0].is_none() {
            return Err(SlideError::bad_data("key file has no (0,0) image"));
        }

        Ok(key_file)
    }

    /// File name of the mosaic piece at `(col, row)`.
    pub fn image_file(&self, col: u32, row: u32) -> Option<&str> {
        if col >= self.num_cols || row >= self.num_rows {
            return None;
        }
        self.image_files[(row * self.num_cols + col) as usize].as_deref()
    }

    /// Microns per pixel in X, given the level-0 pixel width.
    pub fn mpp_x(&self, pixel_width: u32) -> Option<f64> {
        mpp(self.physical_width, pixel_width)
    }

    /// Microns per pixel in Y, given the level-0 pixel height.
    pub fn mpp_y(&self, pixel_height: u32) -> Option<f64> {
        mpp(self.physical_height, pixel_height)
    }
}

fn mpp(physical_nm: Option<f64>, pixels: u32) -> Option<f64> {
    let nm = physical_nm?;
    if pixels == 0 || nm <= 0.0 {
        return None;
    }
    Some(nm / 1000.0 / pixels as f64)
}

fn parse_into(slot: &mut u32, key: &str, value: &str) {
    match value.parse() {
        Ok(v) => *slot = v,
        Err(_) => warn!(key, value, "skipping unparsable key file value"),
    }
}

fn parse_coords(coords: &str) -> Option<(u32, u32)> {
    let (col, row) = coords.split_once(',')?;
    Some((col.trim().parse().ok()?, row.trim().parse().ok()?))
}

// =============================================================================
// Tests
// =============================================================================
