//! Optional recording sink writing WAV artifacts.
//!
//! The recorder is never on the critical detection path: the effects layer
//! feeds it from a dedicated queue reader. Rotation by size may split one
//! capture across several files; `stop` returns every path written.

use std::io::BufWriter;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use hound::{SampleFormat, WavSpec, WavWriter};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::audio::AudioFormat;

/// Errors surfaced by the recording service.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("no active recording for session {0}")]
    NotRecording(String),

    #[error("recording already active for session {0}")]
    AlreadyRecording(String),

    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A timestamped annotation stored alongside a recording.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingMarker {
    pub timestamp: f64,
    pub kind: String,
    pub data: Value,
}

struct ActiveRecording {
    base_path: PathBuf,
    writer: WavWriter<BufWriter<std::fs::File>>,
    spec: WavSpec,
    /// Bytes written to the current file.
    current_bytes: u64,
    /// Paths finalized so far (rotation) plus the live one.
    paths: Vec<PathBuf>,
    markers: Vec<RecordingMarker>,
    metadata: Value,
    rotation_index: u32,
}

/// Per-session WAV capture with markers and size rotation.
pub struct RecorderService {
    dir: PathBuf,
    /// Rotate past this many bytes per file; 0 disables rotation.
    rotate_bytes: u64,
    active: DashMap<String, ActiveRecording>,
}

impl RecorderService {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, rotate_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            rotate_bytes,
            active: DashMap::new(),
        }
    }

    fn wav_spec() -> WavSpec {
        let format = AudioFormat::HUB;
        WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: format.sample_width * 8,
            sample_format: SampleFormat::Int,
        }
    }

    fn open_writer(path: &Path) -> Result<WavWriter<BufWriter<std::fs::File>>, RecorderError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(WavWriter::create(path, Self::wav_spec())?)
    }

    /// Opens a recording handle for the session.
    pub fn start(
        &self,
        session_id: &str,
        filename: &str,
        metadata: Value,
    ) -> Result<(), RecorderError> {
        if self.active.contains_key(session_id) {
            return Err(RecorderError::AlreadyRecording(session_id.to_string()));
        }
        let base_path = self.dir.join(filename);
        let writer = Self::open_writer(&base_path)?;
        log::info!("[Recorder] {} -> {}", session_id, base_path.display());
        self.active.insert(
            session_id.to_string(),
            ActiveRecording {
                writer,
                spec: Self::wav_spec(),
                current_bytes: 0,
                paths: vec![base_path.clone()],
                markers: Vec::new(),
                metadata,
                rotation_index: 0,
                base_path,
            },
        );
        Ok(())
    }

    /// Appends hub-format PCM bytes, rotating by size when configured.
    pub fn write(&self, session_id: &str, audio: &[u8]) -> Result<(), RecorderError> {
        let mut entry = self
            .active
            .get_mut(session_id)
            .ok_or_else(|| RecorderError::NotRecording(session_id.to_string()))?;
        let recording = entry.value_mut();

        if self.rotate_bytes > 0 && recording.current_bytes + audio.len() as u64 > self.rotate_bytes
        {
            recording.rotation_index += 1;
            let rotated = rotated_path(&recording.base_path, recording.rotation_index);
            let old = std::mem::replace(&mut recording.writer, Self::open_writer(&rotated)?);
            old.finalize()?;
            recording.current_bytes = 0;
            recording.paths.push(rotated);
        }

        for pair in audio.chunks_exact(2) {
            recording
                .writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        recording.current_bytes += audio.len() as u64;
        Ok(())
    }

    /// Stores a `(timestamp, type, data)` annotation in the metadata sidecar.
    pub fn add_marker(
        &self,
        session_id: &str,
        timestamp: f64,
        kind: &str,
        data: Value,
    ) -> Result<(), RecorderError> {
        let mut entry = self
            .active
            .get_mut(session_id)
            .ok_or_else(|| RecorderError::NotRecording(session_id.to_string()))?;
        entry.value_mut().markers.push(RecordingMarker {
            timestamp,
            kind: kind.to_string(),
            data,
        });
        Ok(())
    }

    /// Finalizes the recording and writes the metadata sidecar.
    ///
    /// Returns every file path written (more than one after rotation).
    pub fn stop(&self, session_id: &str) -> Result<Vec<PathBuf>, RecorderError> {
        let (_, recording) = self
            .active
            .remove(session_id)
            .ok_or_else(|| RecorderError::NotRecording(session_id.to_string()))?;
        let ActiveRecording {
            writer,
            paths,
            markers,
            metadata,
            base_path,
            spec,
            ..
        } = recording;
        writer.finalize()?;

        let sidecar = base_path.with_extension("json");
        let body = serde_json::json!({
            "session_id": session_id,
            "sample_rate": spec.sample_rate,
            "channels": spec.channels,
            "files": paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
            "markers": markers,
            "metadata": metadata,
        });
        std::fs::write(&sidecar, serde_json::to_vec_pretty(&body).unwrap_or_default())?;

        log::info!(
            "[Recorder] {} finalized ({} file(s))",
            session_id,
            paths.len()
        );
        Ok(paths)
    }

    /// Whether the session currently records.
    #[must_use]
    pub fn is_recording(&self, session_id: &str) -> bool {
        self.active.contains_key(session_id)
    }
}

fn rotated_path(base: &Path, index: u32) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "recording".to_string());
    let ext = base
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "wav".to_string());
    base.with_file_name(format!("{stem}.{index:03}.{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::samples_to_pcm;

    #[test]
    fn start_write_stop_produces_wav_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = RecorderService::new(dir.path(), 0);
        recorder
            .start("s-1", "utterance.wav", serde_json::json!({"strategy": "non_streaming"}))
            .unwrap();
        recorder
            .write("s-1", &samples_to_pcm(&vec![100i16; 1600]))
            .unwrap();
        recorder
            .add_marker("s-1", 1.25, "wake", serde_json::json!({"keyword": "hi-hub"}))
            .unwrap();
        let paths = recorder.stop("s-1").unwrap();
        assert_eq!(paths.len(), 1);

        let reader = hound::WavReader::open(&paths[0]).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.len(), 1600);

        let sidecar = paths[0].with_extension("json");
        let meta: serde_json::Value =
            serde_json::from_slice(&std::fs::read(sidecar).unwrap()).unwrap();
        assert_eq!(meta["markers"][0]["kind"], "wake");
    }

    #[test]
    fn rotation_splits_files_by_size() {
        let dir = tempfile::tempdir().unwrap();
        // Rotate every 4000 bytes; three 3200-byte writes forces two files.
        let recorder = RecorderService::new(dir.path(), 4_000);
        recorder.start("s-1", "long.wav", Value::Null).unwrap();
        for _ in 0..3 {
            recorder
                .write("s-1", &samples_to_pcm(&vec![5i16; 1600]))
                .unwrap();
        }
        let paths = recorder.stop("s-1").unwrap();
        assert!(paths.len() >= 2, "expected rotation, got {paths:?}");
        for path in &paths {
            assert!(path.exists());
        }
    }

    #[test]
    fn double_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = RecorderService::new(dir.path(), 0);
        recorder.start("s-1", "a.wav", Value::Null).unwrap();
        assert!(matches!(
            recorder.start("s-1", "b.wav", Value::Null),
            Err(RecorderError::AlreadyRecording(_))
        ));
        recorder.stop("s-1").unwrap();
    }

    #[test]
    fn write_without_start_errors() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = RecorderService::new(dir.path(), 0);
        assert!(matches!(
            recorder.write("ghost", &[0, 0]),
            Err(RecorderError::NotRecording(_))
        ));
    }
}
