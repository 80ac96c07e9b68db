//! Shared fixtures for the print process integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::{ImageBuffer, Luma};
use rust_sla::error::{AppResult, SlaError};
use rust_sla::print::{AbortFlag, ExposureSettings, FrameSlot, MovePlan, MoveSettings, PresentationSurface};
use tempfile::TempDir;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// 30 Hz display.
pub const FRAME_PERIOD: Duration = Duration::from_micros(33_333);

/// Directory holding tiny PNG layer images with the given names.
pub fn image_dir(names: &[&str]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for name in names {
        let img: ImageBuffer<Luma<u8>, Vec<u8>> = ImageBuffer::from_pixel(8, 8, Luma([200]));
        img.save_with_format(dir.path().join(name), image::ImageFormat::Png)
            .unwrap();
    }
    dir
}

pub fn sec_images(count: usize) -> TempDir {
    let names: Vec<String> = (1..=count).map(|i| format!("SEC_{i}.PNG")).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    image_dir(&refs)
}

/// Clip-mode exposure settings with quick timings.
pub fn exposure_settings() -> ExposureSettings {
    ExposureSettings {
        exposure_frames: 5,
        initial_exposure_frames: 3,
        initial_layers: 2,
        dark_time: Duration::from_millis(100),
        move_plan: MovePlan {
            step: 0.05,
            clip_mode: true,
            pump_distance: 1.0,
        },
        move_settings: MoveSettings {
            poll_interval: Duration::from_millis(3),
            timeout: Duration::from_secs(2),
        },
        intensity_settle: Duration::from_millis(20),
        final_settle: Duration::from_millis(50),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Shown {
    Frame(String),
    Blank,
}

#[derive(Default)]
struct Recording {
    slots: [Option<PathBuf>; 2],
    shown: Vec<Shown>,
    loads: Vec<(String, FrameSlot)>,
    closed: bool,
    close_after_frames: Option<usize>,
    abort_on: Option<(String, AbortFlag)>,
}

/// Surface that records what it was asked to show, paced at [`FRAME_PERIOD`].
///
/// Clones share the recording.
#[derive(Clone)]
pub struct RecordingSurface {
    state: Arc<Mutex<Recording>>,
    ticker: Arc<tokio::sync::Mutex<Option<Interval>>>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(Recording::default())),
            ticker: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Raise `flag` the first time `image` is presented.
    pub fn abort_when_shown(&self, image: &str, flag: AbortFlag) {
        self.state.lock().unwrap().abort_on = Some((image.to_string(), flag));
    }

    /// Request close once `frames` image frames have been presented.
    pub fn close_after_frames(&self, frames: usize) {
        self.state.lock().unwrap().close_after_frames = Some(frames);
    }

    pub fn shown(&self) -> Vec<Shown> {
        self.state.lock().unwrap().shown.clone()
    }

    /// Image frames presented, as file names.
    pub fn frames(&self) -> Vec<String> {
        self.shown()
            .into_iter()
            .filter_map(|s| match s {
                Shown::Frame(name) => Some(name),
                Shown::Blank => None,
            })
            .collect()
    }

    /// Consecutive runs of the same image: (name, frame count).
    pub fn exposures(&self) -> Vec<(String, usize)> {
        let mut runs: Vec<(String, usize)> = Vec::new();
        let mut previous_blank = true;
        for shown in self.shown() {
            match shown {
                Shown::Frame(name) => {
                    match runs.last_mut() {
                        Some((last, count)) if *last == name && !previous_blank => *count += 1,
                        _ => runs.push((name, 1)),
                    }
                    previous_blank = false;
                }
                Shown::Blank => previous_blank = true,
            }
        }
        runs
    }

    pub fn loads(&self) -> Vec<(String, FrameSlot)> {
        self.state.lock().unwrap().loads.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    async fn refresh(&self) {
        let mut ticker = self.ticker.lock().await;
        let ticker = ticker.get_or_insert_with(|| {
            let mut ticker = interval(FRAME_PERIOD);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        ticker.tick().await;
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl PresentationSurface for RecordingSurface {
    async fn present_frame(&mut self, slot: FrameSlot) -> AppResult<()> {
        self.refresh().await;
        let mut state = self.state.lock().unwrap();
        let name = state.slots[slot.index()]
            .as_deref()
            .map(file_name)
            .ok_or_else(|| SlaError::Frame(format!("slot {slot:?} is empty")))?;
        if let Some((image, flag)) = &state.abort_on {
            if *image == name {
                flag.request();
            }
        }
        state.shown.push(Shown::Frame(name));
        Ok(())
    }

    async fn present_blank(&mut self) -> AppResult<()> {
        self.refresh().await;
        self.state.lock().unwrap().shown.push(Shown::Blank);
        Ok(())
    }

    async fn load_frame(&mut self, path: &Path, slot: FrameSlot) -> AppResult<()> {
        if !path.is_file() {
            return Err(SlaError::Frame(format!("{} does not exist", path.display())));
        }
        let mut state = self.state.lock().unwrap();
        state.slots[slot.index()] = Some(path.to_path_buf());
        state.loads.push((file_name(path), slot));
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.state.lock().unwrap().closed
    }

    fn poll_close_requested(&mut self) -> bool {
        let state = self.state.lock().unwrap();
        let frames = state
            .shown
            .iter()
            .filter(|s| matches!(s, Shown::Frame(_)))
            .count();
        state.close_after_frames.is_some_and(|limit| frames >= limit)
    }

    async fn close(&mut self) -> AppResult<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}
