//! Print process orchestration.
//!
//! `SyncEngine` runs the exposure cycle one display frame at a time:
//!
//! ```text
//! Light: present layer image until its frame count is reached
//!   -> Dark: present blank frames, move the stage in a background task and
//!            preload the next image into the idle slot
//!   -> Light again once the dark time has elapsed, the image is loaded and
//!            the stage has stopped
//! ```
//!
//! The abort flag is checked at the top of every light-phase frame. An
//! in-flight stage move is never interrupted; shutdown waits for it, reads
//! the final position, homes the stage and closes the controller and surface.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::config::PrinterConfig;
use crate::error::{AppResult, SlaError};
use crate::hardware::light_engine::LightEngine;
use crate::hardware::smc100::Smc100Controller;
use crate::logging::LogSink;
use crate::print::images::list_images;
use crate::print::layer_settings::LayerSettingsTable;
use crate::print::motion::{move_stage, MovePlan, MoveSettings};
use crate::print::surface::{FrameSlot, PresentationSurface};

/// Timing and motion parameters for one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureSettings {
    /// Frames per nominal layer.
    pub exposure_frames: u32,
    /// Frames for each of the first `initial_layers` layers.
    pub initial_exposure_frames: u32,
    /// Layers that get the initial exposure.
    pub initial_layers: u32,
    /// Minimum dark time between layers.
    pub dark_time: Duration,
    /// Stage moves made during each dark phase.
    pub move_plan: MovePlan,
    /// Bounds on each layer move.
    pub move_settings: MoveSettings,
    /// Pause after a dynamic run changes intensity.
    pub intensity_settle: Duration,
    /// Pause between the last move and the final position query.
    pub final_settle: Duration,
}

impl ExposureSettings {
    /// Static-run settings from the printer configuration.
    pub fn from_config(config: &PrinterConfig) -> Self {
        Self {
            exposure_frames: config.print.exposure_frames,
            initial_exposure_frames: config.print.initial_exposure_frames,
            initial_layers: config.print.initial_layers,
            dark_time: Duration::from_millis(config.print.dark_time_ms),
            move_plan: MovePlan {
                step: config.print.step_size,
                clip_mode: config.print.clip_mode,
                pump_distance: config.print.pump_distance,
            },
            move_settings: MoveSettings::from(&config.motion),
            intensity_settle: Duration::from_millis(config.light_engine.intensity_settle_ms),
            final_settle: Duration::from_millis(config.print.final_settle_ms),
        }
    }
}

/// Operator stop request, shared between the print loop and whoever sets it.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    /// Flag with no stop requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to stop at the next light frame.
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once `request` was called.
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every image was shown, or the layer settings ran out.
    Finished,
    /// The operator requested a stop.
    Aborted,
    /// The display was closed.
    SurfaceClosed,
}

/// One exposed layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerRecord {
    /// One-based layer number.
    pub layer: u32,
    /// Image shown.
    pub image: PathBuf,
    /// Frames the image was shown for.
    pub frames: u32,
    /// Intensity applied for this layer, dynamic runs only.
    pub intensity: Option<u8>,
    /// Dark time requested after this layer.
    pub dark_time: Duration,
    /// Measured time the image was on screen.
    pub light_duration: Option<Duration>,
    /// Measured time from the end of exposure to the next frame swap.
    pub dark_duration: Option<Duration>,
}

/// Summary returned by a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Layers exposed, in order.
    pub layers: Vec<LayerRecord>,
    /// Images found in the image directory.
    pub images_total: usize,
    /// Layer moves started.
    pub stage_moves: u32,
}

/// Exposure parameters for one layer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct LayerExposure {
    group: usize,
    intensity: Option<u8>,
    frames: u32,
    dark_time: Duration,
}

enum LayerSchedule<'a> {
    Static(ExposureSettings),
    Dynamic(&'a LayerSettingsTable),
}

impl LayerSchedule<'_> {
    /// Exposure for zero-based `layer`, or `None` when the schedule is exhausted.
    fn exposure_for(&self, layer: u32) -> Option<LayerExposure> {
        match self {
            LayerSchedule::Static(settings) => Some(LayerExposure {
                group: 0,
                intensity: None,
                frames: if layer < settings.initial_layers {
                    settings.initial_exposure_frames
                } else {
                    settings.exposure_frames
                },
                dark_time: settings.dark_time,
            }),
            LayerSchedule::Dynamic(table) => {
                table
                    .settings_for_layer(layer)
                    .map(|(group, settings)| LayerExposure {
                        group,
                        intensity: Some(settings.intensity),
                        frames: settings.exposure_time.get(),
                        dark_time: Duration::from_millis(u64::from(settings.dark_time)),
                    })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Light,
    Dark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Preload {
    Idle,
    Loading,
    Ready,
}

/// State of one run, owned by the engine until the run ends.
struct PrintJob {
    images: Vec<PathBuf>,
    current_image: usize,
    active_slot: FrameSlot,
    layer: u32,
    phase: Phase,
    phase_first_frame: bool,
    phase_started: Instant,
    exposure: LayerExposure,
    applied_group: Option<usize>,
    applied_intensity: Option<u8>,
    exposure_frames: u32,
    dark_started: Option<Instant>,
    stage_move: Option<JoinHandle<AppResult<()>>>,
    moved_this_dark: bool,
    preload: Preload,
    all_shown: bool,
    stage_moves: u32,
    records: Vec<LayerRecord>,
}

impl PrintJob {
    fn new(images: Vec<PathBuf>) -> Self {
        Self {
            images,
            current_image: 0,
            active_slot: FrameSlot::A,
            layer: 0,
            phase: Phase::Light,
            phase_first_frame: true,
            phase_started: Instant::now(),
            exposure: LayerExposure::default(),
            applied_group: None,
            applied_intensity: None,
            exposure_frames: 0,
            dark_started: None,
            stage_move: None,
            moved_this_dark: false,
            preload: Preload::Idle,
            all_shown: false,
            stage_moves: 0,
            records: Vec::new(),
        }
    }

    fn image_name(&self) -> String {
        self.images
            .get(self.current_image)
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn close_dark_phase(&mut self) {
        if let (Some(started), Some(record)) = (self.dark_started.take(), self.records.last_mut()) {
            record.dark_duration = Some(started.elapsed());
        }
    }

    fn report(self, outcome: RunOutcome) -> RunReport {
        RunReport {
            outcome,
            images_total: self.images.len(),
            stage_moves: self.stage_moves,
            layers: self.records,
        }
    }
}

async fn join_move(handle: JoinHandle<AppResult<()>>) -> AppResult<()> {
    handle
        .await
        .map_err(|e| SlaError::MoveTask(e.to_string()))?
}

/// Drives the light/dark exposure cycle for one print.
///
/// Consumed by a run: the controller and surface are closed when it ends.
pub struct SyncEngine {
    controller: Arc<Mutex<Smc100Controller>>,
    surface: Box<dyn PresentationSurface>,
    light: Option<Box<dyn LightEngine>>,
    settings: ExposureSettings,
    abort: AbortFlag,
    log_sink: Option<LogSink>,
}

impl SyncEngine {
    /// Engine for a static run with the given surface and controller.
    pub fn new(
        controller: Arc<Mutex<Smc100Controller>>,
        surface: Box<dyn PresentationSurface>,
        settings: ExposureSettings,
    ) -> Self {
        Self {
            controller,
            surface,
            light: None,
            settings,
            abort: AbortFlag::new(),
            log_sink: None,
        }
    }

    /// Light engine that receives intensity changes.
    pub fn with_light_engine(mut self, light: Box<dyn LightEngine>) -> Self {
        self.light = Some(light);
        self
    }

    /// Also send progress lines to `sink`.
    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Share `abort` with the caller.
    pub fn with_abort_flag(mut self, abort: AbortFlag) -> Self {
        self.abort = abort;
        self
    }

    /// Handle for stopping the run from elsewhere.
    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    /// Print every image in `image_dir` with the configured constant exposure.
    pub async fn run_static(self, image_dir: &Path) -> AppResult<RunReport> {
        let schedule = LayerSchedule::Static(self.settings);
        self.run(image_dir, schedule).await
    }

    /// Print with per-group intensity, exposure and dark time from `table`.
    ///
    /// When the table runs out before the images do, the run finishes there.
    pub async fn run_dynamic(
        self,
        image_dir: &Path,
        table: &LayerSettingsTable,
    ) -> AppResult<RunReport> {
        self.run(image_dir, LayerSchedule::Dynamic(table)).await
    }

    fn log(&self, message: &str) {
        info!(target: "operator", "{message}");
        if let Some(sink) = &self.log_sink {
            sink(message);
        }
    }

    async fn run(mut self, image_dir: &Path, schedule: LayerSchedule<'_>) -> AppResult<RunReport> {
        let images = match list_images(image_dir) {
            Ok(images) => images,
            Err(e) => {
                error!(error = %e, "cannot enumerate layer images");
                self.log(&format!("Print failed: {e}"));
                // Nothing has moved yet, so the stage is left where it is.
                if let Err(close_err) = self.surface.close().await {
                    warn!(error = %close_err, "failed to close presentation surface");
                }
                return Err(e);
            }
        };
        self.log(&format!(
            "Printing {} images from {}",
            images.len(),
            image_dir.display()
        ));

        let mut job = PrintJob::new(images);
        let result = match job.images.first().cloned() {
            None => {
                self.log("No images to print");
                Ok(RunOutcome::Finished)
            }
            Some(first) => match self.surface.load_frame(&first, job.active_slot).await {
                Ok(()) => self.exposure_loop(&mut job, &schedule).await,
                Err(e) => Err(e),
            },
        };

        let shutdown = self.shutdown(&mut job).await;

        match result {
            Ok(outcome) => {
                shutdown?;
                self.log(&format!(
                    "Print ended ({outcome:?}) after {} layers",
                    job.records.len()
                ));
                Ok(job.report(outcome))
            }
            Err(e) => {
                error!(error = %e, layer = job.layer, "print failed");
                self.log(&format!("Print failed at layer {}: {e}", job.layer + 1));
                Err(e)
            }
        }
    }

    async fn exposure_loop(
        &mut self,
        job: &mut PrintJob,
        schedule: &LayerSchedule<'_>,
    ) -> AppResult<RunOutcome> {
        loop {
            if self.surface.poll_close_requested() || !self.surface.is_open() {
                self.log("Presentation surface closed, stopping print");
                return Ok(RunOutcome::SurfaceClosed);
            }

            match job.phase {
                Phase::Light => {
                    if self.abort.is_requested() {
                        self.log(&format!("Print aborted at layer {}", job.layer + 1));
                        return Ok(RunOutcome::Aborted);
                    }

                    if job.phase_first_frame {
                        let Some(exposure) = schedule.exposure_for(job.layer) else {
                            self.log(&format!(
                                "Layer settings cover {} layers, {} images left unprinted",
                                job.layer,
                                job.images.len() - job.current_image
                            ));
                            return Ok(RunOutcome::Finished);
                        };
                        self.begin_layer(job, exposure).await?;
                    }

                    self.surface.present_frame(job.active_slot).await?;
                    job.exposure_frames += 1;
                    if job.exposure_frames >= job.exposure.frames {
                        self.end_exposure(job).await;
                    }
                }
                Phase::Dark => {
                    if let Some(outcome) = self.dark_frame(job).await? {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    async fn begin_layer(&mut self, job: &mut PrintJob, exposure: LayerExposure) -> AppResult<()> {
        job.phase_first_frame = false;

        if job.applied_group != Some(exposure.group) {
            if let Some(value) = exposure.intensity {
                self.log(&format!(
                    "Layer group {}: intensity {value}, exposure {} frames, dark {} ms",
                    exposure.group + 1,
                    exposure.frames,
                    exposure.dark_time.as_millis()
                ));
                match self.light.as_mut() {
                    Some(light) => light.set_intensity(value)?,
                    None => warn!(value, "no light engine attached, intensity not applied"),
                }
                job.applied_intensity = Some(value);
                sleep(self.settings.intensity_settle).await;
            }
            job.applied_group = Some(exposure.group);
        }

        job.exposure = exposure;
        job.phase_started = Instant::now();
        self.log(&format!(
            "Displaying {} (layer {})",
            job.image_name(),
            job.layer + 1
        ));
        Ok(())
    }

    async fn end_exposure(&mut self, job: &mut PrintJob) {
        let position = {
            let mut controller = self.controller.lock().await;
            controller.get_position().await
        };
        match position {
            Ok(position) => debug!(layer = job.layer + 1, position, "layer exposed"),
            Err(e) => warn!(error = %e, "position query at layer boundary failed"),
        }

        job.records.push(LayerRecord {
            layer: job.layer + 1,
            image: job.images[job.current_image].clone(),
            frames: job.exposure_frames,
            intensity: job.applied_intensity,
            dark_time: job.exposure.dark_time,
            light_duration: None,
            dark_duration: None,
        });

        job.layer += 1;
        job.exposure_frames = 0;
        job.dark_started = Some(Instant::now());
        job.moved_this_dark = false;
        job.phase = Phase::Dark;
        job.phase_first_frame = true;
    }

    async fn dark_frame(&mut self, job: &mut PrintJob) -> AppResult<Option<RunOutcome>> {
        self.surface.present_blank().await?;

        if job.phase_first_frame {
            job.phase_first_frame = false;
            if let Some(record) = job.records.last_mut() {
                record.light_duration = Some(job.phase_started.elapsed());
            }
            job.phase_started = Instant::now();
        }

        if job.stage_move.is_none() && !job.moved_this_dark {
            let controller = Arc::clone(&self.controller);
            job.stage_move = Some(tokio::spawn(move_stage(
                controller,
                self.settings.move_plan,
                self.settings.move_settings,
            )));
            job.moved_this_dark = true;
            job.stage_moves += 1;
            debug!(layer = job.layer, "stage move started");
        }

        let next = job.current_image + 1;
        if next < job.images.len() {
            if job.preload == Preload::Idle {
                job.preload = Preload::Loading;
                let slot = job.active_slot.other();
                self.surface.load_frame(&job.images[next], slot).await?;
                job.preload = Preload::Ready;
            }
        } else {
            job.all_shown = true;
        }

        if job.stage_move.as_ref().is_some_and(JoinHandle::is_finished) {
            if let Some(handle) = job.stage_move.take() {
                join_move(handle).await?;
                debug!(layer = job.layer, "stage move finished");
            }
        }
        let settled = job.stage_move.is_none();

        if job.all_shown && settled {
            job.close_dark_phase();
            self.log("All images shown");
            return Ok(Some(RunOutcome::Finished));
        }

        let dark_elapsed = job
            .dark_started
            .is_some_and(|started| started.elapsed() >= job.exposure.dark_time);
        if dark_elapsed && settled && job.preload == Preload::Ready {
            job.close_dark_phase();
            job.active_slot = job.active_slot.other();
            job.current_image = next;
            job.preload = Preload::Idle;
            // settle pulse before the next exposure
            self.surface.present_blank().await?;
            self.surface.present_blank().await?;
            job.phase = Phase::Light;
            job.phase_first_frame = true;
        }

        Ok(None)
    }

    async fn shutdown(&mut self, job: &mut PrintJob) -> AppResult<()> {
        let mut failure = None;
        if let Some(handle) = job.stage_move.take() {
            debug!("waiting for in-flight stage move");
            if let Err(e) = join_move(handle).await {
                error!(error = %e, "stage move failed during shutdown");
                failure = Some(e);
            }
        }

        sleep(self.settings.final_settle).await;
        {
            let mut controller = self.controller.lock().await;
            match controller.get_position().await {
                Ok(position) => self.log(&format!("Final position: {position:.4}")),
                Err(e) => warn!(error = %e, "final position query failed"),
            }
            if let Err(e) = controller.home() {
                error!(error = %e, "failed to send home command");
            }
            controller.close();
        }

        if let Some(light) = self.light.as_mut() {
            if let Err(e) = light.set_intensity(0) {
                warn!(error = %e, "failed to zero light engine intensity");
            }
        }
        if let Err(e) = self.surface.close().await {
            warn!(error = %e, "failed to close presentation surface");
        }

        failure.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::print::layer_settings::LayerSettings;
    use std::num::NonZeroU32;

    fn settings() -> ExposureSettings {
        ExposureSettings {
            exposure_frames: 5,
            initial_exposure_frames: 3,
            initial_layers: 2,
            dark_time: Duration::from_millis(100),
            move_plan: MovePlan {
                step: 0.05,
                clip_mode: true,
                pump_distance: 0.0,
            },
            move_settings: MoveSettings {
                poll_interval: Duration::from_millis(3),
                timeout: Duration::from_secs(1),
            },
            intensity_settle: Duration::from_millis(0),
            final_settle: Duration::from_millis(0),
        }
    }

    #[test]
    fn test_static_schedule_uses_initial_count_first() {
        let schedule = LayerSchedule::Static(settings());
        let frames: Vec<u32> = (0..4)
            .map(|layer| schedule.exposure_for(layer).unwrap().frames)
            .collect();
        assert_eq!(frames, vec![3, 3, 5, 5]);
    }

    #[test]
    fn test_dynamic_schedule_follows_groups() {
        let mut table = LayerSettingsTable::new();
        let first = LayerSettings {
            intensity: 10,
            exposure_time: NonZeroU32::new(5).unwrap(),
            dark_time: 100,
        };
        let second = LayerSettings {
            intensity: 20,
            exposure_time: NonZeroU32::new(8).unwrap(),
            dark_time: 150,
        };
        table.push(first);
        table.push(second);
        table.push(second);

        let schedule = LayerSchedule::Dynamic(&table);
        let layer0 = schedule.exposure_for(0).unwrap();
        assert_eq!(layer0.intensity, Some(10));
        assert_eq!(layer0.dark_time, Duration::from_millis(100));
        let layer2 = schedule.exposure_for(2).unwrap();
        assert_eq!((layer2.group, layer2.frames), (1, 8));
        assert!(schedule.exposure_for(3).is_none());
    }

    #[test]
    fn test_abort_flag_is_shared() {
        let flag = AbortFlag::new();
        let other = flag.clone();
        assert!(!flag.is_requested());
        other.request();
        assert!(flag.is_requested());
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = PrinterConfig::default();
        config.print.clip_mode = true;
        config.print.dark_time_ms = 250;
        let settings = ExposureSettings::from_config(&config);
        assert!(settings.move_plan.clip_mode);
        assert_eq!(settings.dark_time, Duration::from_millis(250));
        assert_eq!(settings.move_settings.timeout, Duration::from_secs(30));
    }
}
