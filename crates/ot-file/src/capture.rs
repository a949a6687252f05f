//! Streaming capture writers
//!
//! A [`FrameWriter`] accepts interleaved blocks as the engine writes them
//! to the driver and finalizes the file on close. The factory recognizes
//! `.wav` (encoded in-process via hound), and `.flac`/`.opus` (streamed
//! as raw f32 frames into an `ffmpeg` child encoder); any other suffix is
//! an error the engine surfaces as a user-note.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};

use ot_core::Sample;

use crate::{FileError, FileResult};

/// Frame-accepting sink interface the engine captures into.
pub trait FrameWriter: Send {
    /// Append one interleaved block.
    fn write_frames(&mut self, interleaved: &[Sample]) -> FileResult<()>;

    /// Flush and finalize the file. Must be called exactly once.
    fn close(&mut self) -> FileResult<()>;
}

/// Resolve a capture writer from the filename suffix.
pub fn create_capture_writer(
    path: &Path,
    sample_rate: u32,
    n_channels: usize,
) -> FileResult<Box<dyn FrameWriter>> {
    let suffix = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match suffix.as_str() {
        "wav" => Ok(Box::new(WavCaptureWriter::create(path, sample_rate, n_channels)?)),
        "flac" => Ok(Box::new(FfmpegCaptureWriter::spawn(
            path,
            sample_rate,
            n_channels,
            &["-c:a", "flac", "-compression_level", "9"],
        )?)),
        "opus" => Ok(Box::new(FfmpegCaptureWriter::spawn(
            path,
            sample_rate,
            n_channels,
            &["-c:a", "libopus", "-b:a", "128k"],
        )?)),
        _ => Err(FileError::UnsupportedFormat(path.display().to_string())),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WAV WRITER
// ═══════════════════════════════════════════════════════════════════════════════

/// WAV capture via hound, 32-bit float samples.
pub struct WavCaptureWriter {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    frames_written: u64,
    n_channels: usize,
}

impl WavCaptureWriter {
    pub fn create(path: &Path, sample_rate: u32, n_channels: usize) -> FileResult<Self> {
        let spec = hound::WavSpec {
            channels: n_channels as u16,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = hound::WavWriter::create(path, spec)?;
        log::info!("capture started: {}", path.display());
        Ok(Self {
            writer: Some(writer),
            frames_written: 0,
            n_channels,
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl FrameWriter for WavCaptureWriter {
    fn write_frames(&mut self, interleaved: &[Sample]) -> FileResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| FileError::EncoderError("writer closed".into()))?;
        for &sample in interleaved {
            writer.write_sample(sample)?;
        }
        self.frames_written += (interleaved.len() / self.n_channels) as u64;
        Ok(())
    }

    fn close(&mut self) -> FileResult<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FFMPEG WRITER (FLAC / OPUS)
// ═══════════════════════════════════════════════════════════════════════════════

/// Compressed capture through an external `ffmpeg` encoder.
///
/// Raw little-endian f32 frames stream into the child's stdin; ffmpeg owns
/// the container and codec work.
pub struct FfmpegCaptureWriter {
    child: Option<Child>,
    /// Reused per block so capture writes stay allocation-free.
    byte_buf: Vec<u8>,
}

impl FfmpegCaptureWriter {
    pub fn spawn(
        path: &Path,
        sample_rate: u32,
        n_channels: usize,
        codec_args: &[&str],
    ) -> FileResult<Self> {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-f")
            .arg("f32le")
            .arg("-ar")
            .arg(sample_rate.to_string())
            .arg("-ac")
            .arg(n_channels.to_string())
            .arg("-i")
            .arg("pipe:0")
            .args(codec_args)
            .arg("-y")
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd
            .spawn()
            .map_err(|e| FileError::EncoderError(format!("failed to spawn ffmpeg: {}", e)))?;
        log::info!("capture started via ffmpeg: {}", path.display());
        Ok(Self {
            child: Some(child),
            byte_buf: Vec::new(),
        })
    }
}

impl FrameWriter for FfmpegCaptureWriter {
    fn write_frames(&mut self, interleaved: &[Sample]) -> FileResult<()> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| FileError::EncoderError("encoder closed".into()))?;
        let stdin = child
            .stdin
            .as_mut()
            .ok_or_else(|| FileError::EncoderError("encoder stdin gone".into()))?;

        self.byte_buf.clear();
        self.byte_buf.reserve(interleaved.len() * 4);
        for &sample in interleaved {
            self.byte_buf.extend_from_slice(&sample.to_le_bytes());
        }
        stdin.write_all(&self.byte_buf)?;
        Ok(())
    }

    fn close(&mut self) -> FileResult<()> {
        if let Some(mut child) = self.child.take() {
            drop(child.stdin.take());
            let status = child
                .wait()
                .map_err(|e| FileError::EncoderError(e.to_string()))?;
            if !status.success() {
                return Err(FileError::EncoderError(format!(
                    "ffmpeg exited with {}",
                    status
                )));
            }
        }
        Ok(())
    }
}

impl Drop for FfmpegCaptureWriter {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            drop(child.stdin.take());
            let _ = child.wait();
        }
    }
}
