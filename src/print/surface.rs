//! Frame presentation.
//!
//! The print loop only needs to show a preloaded layer image or a blank frame,
//! once per display refresh. [`PresentationSurface`] is that contract; a
//! window-backed projector output implements it outside this crate, and
//! [`HeadlessSurface`] implements it for dry runs.
//!
//! Frames are double buffered: the engine owns two [`FrameSlot`]s and loads
//! the next layer into the one not on screen.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, GenericImageView};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, trace};

use crate::error::{AppResult, SlaError};

/// One of the two frame buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameSlot {
    /// First buffer.
    A,
    /// Second buffer.
    B,
}

impl FrameSlot {
    /// The slot that is not `self`.
    pub fn other(self) -> Self {
        match self {
            FrameSlot::A => FrameSlot::B,
            FrameSlot::B => FrameSlot::A,
        }
    }

    /// Position in the slot array.
    pub fn index(self) -> usize {
        match self {
            FrameSlot::A => 0,
            FrameSlot::B => 1,
        }
    }
}

/// Display the print loop draws on.
///
/// `present_frame` and `present_blank` return once the frame is on screen,
/// which paces the loop at the display rate.
#[async_trait]
pub trait PresentationSurface: Send {
    /// Show the image in `slot` for one frame.
    async fn present_frame(&mut self, slot: FrameSlot) -> AppResult<()>;

    /// Show a black frame.
    async fn present_blank(&mut self) -> AppResult<()>;

    /// Decode `path` into `slot`, replacing what was there.
    async fn load_frame(&mut self, path: &Path, slot: FrameSlot) -> AppResult<()>;

    /// False after `close`.
    fn is_open(&self) -> bool;

    /// True once the operator asked the surface to close.
    fn poll_close_requested(&mut self) -> bool;

    /// Release the display. Later calls fail.
    async fn close(&mut self) -> AppResult<()>;
}

struct LoadedFrame {
    path: PathBuf,
    image: DynamicImage,
}

/// Counters kept by [`HeadlessSurface`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SurfaceStats {
    /// Image frames shown.
    pub frames_presented: u64,
    /// Blank frames shown.
    pub blanks_presented: u64,
    /// Images decoded.
    pub frames_loaded: u64,
}

/// Surface with no display: decodes frames and keeps display timing.
pub struct HeadlessSurface {
    frame_period: Duration,
    ticker: Option<Interval>,
    slots: [Option<LoadedFrame>; 2],
    open: bool,
    close_signal: Arc<AtomicBool>,
    stats: SurfaceStats,
}

impl HeadlessSurface {
    /// Surface presenting one frame every `frame_period`.
    pub fn new(frame_period: Duration) -> Self {
        Self {
            frame_period,
            ticker: None,
            slots: [None, None],
            open: true,
            close_signal: Arc::new(AtomicBool::new(false)),
            stats: SurfaceStats::default(),
        }
    }

    /// Flag that makes `poll_close_requested` report true once set.
    pub fn close_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.close_signal)
    }

    /// Counters so far.
    pub fn stats(&self) -> SurfaceStats {
        self.stats
    }

    /// Path and pixel size of the frame in `slot`.
    pub fn frame_info(&self, slot: FrameSlot) -> Option<(&Path, (u32, u32))> {
        self.slots[slot.index()]
            .as_ref()
            .map(|frame| (frame.path.as_path(), frame.image.dimensions()))
    }

    async fn next_refresh(&mut self) -> AppResult<()> {
        if !self.open {
            return Err(SlaError::Frame("surface is closed".to_string()));
        }
        let period = self.frame_period;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        ticker.tick().await;
        Ok(())
    }
}

#[async_trait]
impl PresentationSurface for HeadlessSurface {
    async fn present_frame(&mut self, slot: FrameSlot) -> AppResult<()> {
        if self.slots[slot.index()].is_none() {
            return Err(SlaError::Frame(format!("slot {slot:?} is empty")));
        }
        self.next_refresh().await?;
        self.stats.frames_presented += 1;
        trace!(?slot, "presented frame");
        Ok(())
    }

    async fn present_blank(&mut self) -> AppResult<()> {
        self.next_refresh().await?;
        self.stats.blanks_presented += 1;
        Ok(())
    }

    async fn load_frame(&mut self, path: &Path, slot: FrameSlot) -> AppResult<()> {
        let owned = path.to_path_buf();
        let image = tokio::task::spawn_blocking(move || image::open(owned))
            .await
            .map_err(|e| SlaError::Frame(format!("decode task failed: {e}")))?
            .map_err(|e| SlaError::Frame(format!("{}: {e}", path.display())))?;

        debug!(path = %path.display(), ?slot, size = ?image.dimensions(), "frame loaded");
        self.slots[slot.index()] = Some(LoadedFrame {
            path: path.to_path_buf(),
            image,
        });
        self.stats.frames_loaded += 1;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn poll_close_requested(&mut self) -> bool {
        self.close_signal.load(Ordering::SeqCst)
    }

    async fn close(&mut self) -> AppResult<()> {
        self.open = false;
        self.slots = [None, None];
        self.ticker = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};
    use tempfile::TempDir;
    use tokio::time::Instant;

    fn write_png(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        let img: ImageBuffer<Luma<u8>, Vec<u8>> = ImageBuffer::from_pixel(4, 3, Luma([255]));
        img.save(&path).unwrap();
        path
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_are_paced() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "SEC_1.png");
        let mut surface = HeadlessSurface::new(Duration::from_millis(10));
        surface.load_frame(&path, FrameSlot::A).await.unwrap();

        let start = Instant::now();
        for _ in 0..3 {
            surface.present_frame(FrameSlot::A).await.unwrap();
        }
        surface.present_blank().await.unwrap();

        // first refresh is immediate
        assert_eq!(start.elapsed(), Duration::from_millis(30));
        assert_eq!(
            surface.stats(),
            SurfaceStats {
                frames_presented: 3,
                blanks_presented: 1,
                frames_loaded: 1,
            }
        );
        assert_eq!(surface.frame_info(FrameSlot::A).unwrap().1, (4, 3));
    }

    #[tokio::test]
    async fn test_empty_slot_and_bad_file_are_errors() {
        let dir = TempDir::new().unwrap();
        let bogus = dir.path().join("SEC_1.png");
        std::fs::write(&bogus, b"not a png").unwrap();

        let mut surface = HeadlessSurface::new(Duration::from_millis(1));
        assert!(matches!(
            surface.present_frame(FrameSlot::B).await,
            Err(SlaError::Frame(_))
        ));
        assert!(matches!(
            surface.load_frame(&bogus, FrameSlot::A).await,
            Err(SlaError::Frame(_))
        ));
    }

    #[tokio::test]
    async fn test_close_signal_and_close() {
        let mut surface = HeadlessSurface::new(Duration::from_millis(1));
        assert!(!surface.poll_close_requested());
        surface.close_signal().store(true, Ordering::SeqCst);
        assert!(surface.poll_close_requested());

        surface.close().await.unwrap();
        assert!(!surface.is_open());
        assert!(surface.present_blank().await.is_err());
    }

    #[test]
    fn test_slots_alternate() {
        assert_eq!(FrameSlot::A.other(), FrameSlot::B);
        assert_eq!(FrameSlot::B.other().other(), FrameSlot::B);
    }
}
