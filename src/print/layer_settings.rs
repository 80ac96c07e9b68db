//! Per-layer exposure settings for dynamic prints.
//!
//! The settings file is CSV with a header row and one row per layer:
//!
//! ```text
//! layer,intensity,exposure_time,dark_time
//! 1,10,5,100
//! 2,10,5,100
//! 3,20,8,150
//! ```
//!
//! Rows with identical settings collapse into one group; the group keeps the
//! position where its settings first appeared.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::num::NonZeroU32;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, SlaError};

/// Exposure parameters shared by a run of layers.
///
/// Ordering is lexicographic over (intensity, exposure_time, dark_time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LayerSettings {
    /// LED drive current.
    pub intensity: u8,
    /// Exposure length in displayed frames.
    pub exposure_time: NonZeroU32,
    /// Dark time in milliseconds.
    pub dark_time: u32,
}

/// Parse one integer field, telling "not a number" apart from "out of range".
fn parse_field<T: FromStr>(text: &str, line: u64, name: &str, range: &str) -> AppResult<T> {
    if let Ok(value) = text.parse::<T>() {
        return Ok(value);
    }
    let reason = match text.parse::<i64>() {
        Ok(value) => format!("{name} {value} is outside {range}"),
        Err(_) => format!("{name} {text:?} is not an integer"),
    };
    Err(SlaError::SettingsParse { line, reason })
}

/// Settings and the number of layers printed with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerGroup {
    /// Exposure shared by the group.
    pub settings: LayerSettings,
    /// Layers printed with `settings`.
    pub repeat_count: u32,
}

/// Ordered, deduplicated layer settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerSettingsTable {
    groups: Vec<LayerGroup>,
    index: BTreeMap<LayerSettings, usize>,
}

impl LayerSettingsTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a settings file. The first row is a header and is skipped.
    ///
    /// A row that is not four integers, or whose values are out of range,
    /// fails the whole load with the row's line number. Intensity must fit
    /// 0-255, exposure time must be at least one frame and dark time must not
    /// be negative.
    pub fn load<R: io::Read>(reader: R) -> AppResult<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut table = Self::new();
        for result in csv_reader.records() {
            let record = result.map_err(|e| SlaError::SettingsParse {
                line: e.position().map_or(0, csv::Position::line),
                reason: e.to_string(),
            })?;
            let line = record.position().map_or(0, csv::Position::line);

            if record.len() != 4 {
                return Err(SlaError::SettingsParse {
                    line,
                    reason: format!("expected 4 fields, found {}", record.len()),
                });
            }

            parse_field::<i64>(&record[0], line, "layer index", "an integer")?;
            table.push(LayerSettings {
                intensity: parse_field(&record[1], line, "intensity", "0-255")?,
                exposure_time: parse_field(&record[2], line, "exposure time", "1 frame or more")?,
                dark_time: parse_field(&record[3], line, "dark time", "0 ms or more")?,
            });
        }

        Ok(table)
    }

    /// Load a settings file from disk.
    pub fn from_path(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| SlaError::Filesystem {
            path: path.to_path_buf(),
            source,
        })?;
        Self::load(file)
    }

    /// Add one layer. Settings already in the table extend their group.
    pub fn push(&mut self, settings: LayerSettings) {
        match self.index.get(&settings) {
            Some(&i) => self.groups[i].repeat_count += 1,
            None => {
                self.index.insert(settings, self.groups.len());
                self.groups.push(LayerGroup {
                    settings,
                    repeat_count: 1,
                });
            }
        }
    }

    /// Groups in first-seen order.
    pub fn groups(&self) -> &[LayerGroup] {
        &self.groups
    }

    /// True when no layers were added.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Layers described by the whole table.
    pub fn total_layers(&self) -> u32 {
        self.groups.iter().map(|g| g.repeat_count).sum()
    }

    /// Group index and settings for a zero-based layer number.
    pub fn settings_for_layer(&self, layer: u32) -> Option<(usize, LayerSettings)> {
        let mut first = 0;
        for (i, group) in self.groups.iter().enumerate() {
            if layer < first + group.repeat_count {
                return Some((i, group.settings));
            }
            first += group.repeat_count;
        }
        None
    }

    /// Write the table back out as a settings file, one row per layer.
    pub fn write_csv<W: io::Write>(&self, writer: W) -> AppResult<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer
            .write_record(["layer", "intensity", "exposure_time", "dark_time"])
            .map_err(io::Error::from)?;

        let mut layer = 1u32;
        for group in &self.groups {
            for _ in 0..group.repeat_count {
                let s = group.settings;
                csv_writer
                    .write_record([
                        layer.to_string(),
                        s.intensity.to_string(),
                        s.exposure_time.to_string(),
                        s.dark_time.to_string(),
                    ])
                    .map_err(io::Error::from)?;
                layer += 1;
            }
        }
        csv_writer.flush()?;
        Ok(())
    }
}
