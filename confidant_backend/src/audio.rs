use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Clips shorter than this are treated as accidental taps.
pub const MIN_CLIP_DURATION: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedClip {
    pub path: PathBuf,
    pub duration: Duration,
}

impl RecordedClip {
    pub fn duration_secs(&self) -> f64 {
        self.duration.as_secs_f64()
    }
}

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("No recording in progress")]
    NotRecording,

    #[error("Recording too short ({0:?})")]
    TooShort(Duration),

    #[error("Recorder failure: {0}")]
    Platform(String),
}

/// Live microphone capture owned by the platform layer.
pub trait RecordingHandle: Send {
    /// Stop capturing and return the finished clip.
    fn finish(&mut self) -> Result<RecordedClip, RecordingError>;

    /// Stop capturing and discard whatever was recorded. Must be idempotent.
    fn release(&mut self);
}

/// Platform audio recorder.
pub trait AudioRecorder: Send + Sync {
    fn start(&self) -> Result<Box<dyn RecordingHandle>, RecordingError>;
}

/// One recording session at a time over an `AudioRecorder`.
///
/// The live handle is released on every exit path: `stop`, `cancel`, a new
/// `start`, or dropping the recorder.
pub struct VoiceRecorder<R: AudioRecorder> {
    recorder: R,
    active: Option<Box<dyn RecordingHandle>>,
}

impl<R: AudioRecorder> VoiceRecorder<R> {
    pub fn new(recorder: R) -> Self {
        Self {
            recorder,
            active: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Start a new session, discarding any capture still in progress.
    pub fn start(&mut self) -> Result<(), RecordingError> {
        if self.active.is_some() {
            tracing::debug!("Discarding unfinished recording before starting a new one");
            self.cancel();
        }
        self.active = Some(self.recorder.start()?);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<RecordedClip, RecordingError> {
        let mut handle = self.active.take().ok_or(RecordingError::NotRecording)?;
        let finished = handle.finish();
        handle.release();

        let clip = finished?;
        if clip.duration < MIN_CLIP_DURATION {
            return Err(RecordingError::TooShort(clip.duration));
        }
        Ok(clip)
    }

    pub fn cancel(&mut self) {
        if let Some(mut handle) = self.active.take() {
            handle.release();
        }
    }
}

impl<R: AudioRecorder> Drop for VoiceRecorder<R> {
    fn drop(&mut self) {
        self.cancel();
    }
}
