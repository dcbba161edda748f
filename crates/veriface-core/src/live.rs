//! Live recognition loop: frames in, annotated frames out.
//!
//! Only every Nth frame runs detection and matching. Frames in between are
//! presented without annotations; boxes from an earlier frame are never
//! carried forward. Per-frame failures are logged and drop that frame's
//! annotations only. The loop ends on the stop flag (checked once per frame)
//! or when the source runs dry or fails.

use crate::enroll::is_image_file;
use crate::extractor::{crop, Detector, ExtractError, FeatureExtractor};
use crate::matcher::{EuclideanMatcher, Matcher};
use crate::types::{MatchResult, PixelRect, StoreState};
use image::{Rgb, RgbImage};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

pub const DEFAULT_PROCESS_EVERY: usize = 3;

const MATCHED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: u32 = 2;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write frame {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("frame source disconnected: {0}")]
    Disconnected(String),
}

/// Supplies frames; `Ok(None)` means the stream has ended.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, FrameError>;
}

/// Receives every frame, annotated or not.
pub trait FrameSink {
    fn present(&mut self, frame: &AnnotatedFrame) -> Result<(), FrameError>;
}

/// One recognized face in a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub rect: PixelRect,
    pub result: MatchResult,
}

#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    /// 1-based frame counter.
    pub sequence: u64,
    /// Whether detection ran on this frame.
    pub processed: bool,
    pub image: RgbImage,
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, Copy)]
pub struct LiveConfig {
    pub threshold: f32,
    /// Run detection on every Nth frame; 0 is treated as 1.
    pub process_every: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            threshold: crate::matcher::DEFAULT_MATCH_THRESHOLD,
            process_every: DEFAULT_PROCESS_EVERY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    Requested,
    Exhausted,
    SourceFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveSummary {
    pub frames: u64,
    pub processed: u64,
    pub matched: u64,
    pub unknown: u64,
    pub frame_errors: u64,
    pub stop_reason: StopReason,
}

pub struct LiveRecognizer<'a, D: Detector + ?Sized, E: FeatureExtractor + ?Sized> {
    detector: &'a mut D,
    extractor: &'a mut E,
    state: &'a StoreState,
    config: LiveConfig,
    frame_count: u64,
}

impl<'a, D: Detector + ?Sized, E: FeatureExtractor + ?Sized> LiveRecognizer<'a, D, E> {
    pub fn new(
        detector: &'a mut D,
        extractor: &'a mut E,
        state: &'a StoreState,
        config: LiveConfig,
    ) -> Self {
        Self {
            detector,
            extractor,
            state,
            config,
            frame_count: 0,
        }
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn run<S, K>(&mut self, source: &mut S, sink: &mut K, stop: &AtomicBool) -> LiveSummary
    where
        S: FrameSource + ?Sized,
        K: FrameSink + ?Sized,
    {
        let every = self.config.process_every.max(1) as u64;
        let mut summary = LiveSummary {
            frames: 0,
            processed: 0,
            matched: 0,
            unknown: 0,
            frame_errors: 0,
            stop_reason: StopReason::Exhausted,
        };

        tracing::info!(
            records = self.state.len(),
            threshold = self.config.threshold,
            process_every = every,
            "starting recognition loop"
        );

        loop {
            if stop.load(Ordering::Relaxed) {
                summary.stop_reason = StopReason::Requested;
                break;
            }

            let image = match source.next_frame() {
                Ok(Some(image)) => image,
                Ok(None) => {
                    summary.stop_reason = StopReason::Exhausted;
                    break;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "frame source failed; stopping");
                    summary.stop_reason = StopReason::SourceFailed(err.to_string());
                    break;
                }
            };

            self.frame_count += 1;
            summary.frames += 1;
            let processed = self.frame_count % every == 0;

            let annotations = if processed {
                summary.processed += 1;
                match self.process_frame(&image) {
                    Ok(annotations) => annotations,
                    Err(err) => {
                        tracing::warn!(frame = self.frame_count, error = %err, "error processing frame");
                        summary.frame_errors += 1;
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };

            for annotation in &annotations {
                if annotation.result.matched {
                    summary.matched += 1;
                } else {
                    summary.unknown += 1;
                }
            }

            let frame = AnnotatedFrame {
                sequence: self.frame_count,
                processed,
                image,
                annotations,
            };
            if let Err(err) = sink.present(&frame) {
                tracing::warn!(frame = frame.sequence, error = %err, "failed to present frame");
            }
        }

        tracing::info!(
            frames = summary.frames,
            processed = summary.processed,
            matched = summary.matched,
            unknown = summary.unknown,
            errors = summary.frame_errors,
            reason = ?summary.stop_reason,
            "recognition loop stopped"
        );
        summary
    }

    /// Detect, extract and match every face in one frame.
    pub fn process_frame(&mut self, image: &RgbImage) -> Result<Vec<Annotation>, ExtractError> {
        let boxes = self.detector.detect(image)?;
        let mut annotations = Vec::with_capacity(boxes.len());

        for bbox in &boxes {
            let Some(rect) = bbox.clip(image.width(), image.height()) else {
                tracing::debug!(?bbox, "skipping degenerate box");
                continue;
            };
            let Some(embedding) = self.extractor.extract(&crop(image, rect))? else {
                tracing::debug!(?rect, "no face in detected region");
                continue;
            };

            let result = EuclideanMatcher.compare(&embedding, self.state, self.config.threshold);
            tracing::debug!(
                frame = self.frame_count,
                label = %result.label,
                distance = result.distance,
                "face recognized"
            );
            annotations.push(Annotation { rect, result });
        }

        Ok(annotations)
    }
}

/// Paint box outlines for each annotation: green when matched, red otherwise.
///
/// Label and distance text are not rendered; sinks that want them read
/// [`Annotation::result`] and draw or log it themselves.
pub fn draw_annotations(image: &mut RgbImage, annotations: &[Annotation]) {
    for annotation in annotations {
        let color = if annotation.result.matched {
            MATCHED_COLOR
        } else {
            UNKNOWN_COLOR
        };
        draw_outline(image, annotation.rect, color);
    }
}

fn draw_outline(image: &mut RgbImage, rect: PixelRect, color: Rgb<u8>) {
    let x_end = (rect.x + rect.width).min(image.width());
    let y_end = (rect.y + rect.height).min(image.height());
    for y in rect.y..y_end {
        for x in rect.x..x_end {
            let on_edge = x < rect.x + BOX_THICKNESS
                || y < rect.y + BOX_THICKNESS
                || x + BOX_THICKNESS >= x_end
                || y + BOX_THICKNESS >= y_end;
            if on_edge {
                image.put_pixel(x, y, color);
            }
        }
    }
}

/// Replays the image files of a directory in name order.
pub struct DirectoryFrameSource {
    pending: VecDeque<PathBuf>,
}

impl DirectoryFrameSource {
    pub fn open(dir: &Path) -> Result<Self, FrameError> {
        let io = |source| FrameError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut frames = Vec::new();
        for entry in fs::read_dir(dir).map_err(io)? {
            let path = entry.map_err(io)?.path();
            if path.is_file() && is_image_file(&path) {
                frames.push(path);
            }
        }
        frames.sort();
        tracing::info!(dir = %dir.display(), frames = frames.len(), "opened frame directory");
        Ok(Self {
            pending: frames.into(),
        })
    }
}

impl FrameSource for DirectoryFrameSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, FrameError> {
        while let Some(path) = self.pending.pop_front() {
            match image::open(&path) {
                Ok(img) => return Ok(Some(img.to_rgb8())),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping undecodable frame")
                }
            }
        }
        Ok(None)
    }
}

/// Writes each frame, with box outlines drawn, as `frame_NNNNNN.png`.
pub struct DirectoryFrameSink {
    dir: PathBuf,
}

impl DirectoryFrameSink {
    pub fn create(dir: &Path) -> Result<Self, FrameError> {
        fs::create_dir_all(dir).map_err(|source| FrameError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }
}

impl FrameSink for DirectoryFrameSink {
    fn present(&mut self, frame: &AnnotatedFrame) -> Result<(), FrameError> {
        let mut image = frame.image.clone();
        draw_annotations(&mut image, &frame.annotations);
        for annotation in &frame.annotations {
            tracing::info!(
                frame = frame.sequence,
                label = %annotation.result.label,
                distance = annotation.result.distance,
                x = annotation.rect.x,
                y = annotation.rect.y,
                "face"
            );
        }

        let path = self.dir.join(format!("frame_{:06}.png", frame.sequence));
        image
            .save(&path)
            .map_err(|source| FrameError::Encode { path, source })
    }
}
