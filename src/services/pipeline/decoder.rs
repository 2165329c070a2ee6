use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use log::{debug, warn};

use crate::config::{CHANNELS, SAMPLE_RATE};
use crate::error::{AppError, Result};

/// A stream of raw PCM (48 kHz, stereo, s16le).
pub trait PcmSource: Send {
    /// Fill `buf` completely. `false` once the stream is drained or broken.
    fn read_chunk(&mut self, buf: &mut [u8]) -> bool;
}

pub trait DecoderFactory: Send + Sync {
    fn open(&self, path: &Path, gain_db: f64) -> Result<Box<dyn PcmSource>>;
}

/// Spawns one ffmpeg process per track.
pub struct FfmpegDecoderFactory {
    ffmpeg: PathBuf,
    attenuation: f64,
}

impl FfmpegDecoderFactory {
    pub fn new(ffmpeg: PathBuf, attenuation: f64) -> Self {
        Self { ffmpeg, attenuation }
    }

    fn filter(&self, gain_db: f64) -> String {
        format!("volume={:.2}dB,volume={}", gain_db, self.attenuation)
    }
}

impl DecoderFactory for FfmpegDecoderFactory {
    fn open(&self, path: &Path, gain_db: f64) -> Result<Box<dyn PcmSource>> {
        let mut child = Command::new(&self.ffmpeg)
            .arg("-i")
            .arg(path)
            .args(["-nostdin", "-f", "s16le"])
            .args(["-ar", &SAMPLE_RATE.to_string()])
            .args(["-ac", &CHANNELS.to_string()])
            .args(["-vn", "-af", &self.filter(gain_db)])
            .args(["-loglevel", "quiet", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Codec("ffmpeg stdout not captured".to_string()))?;

        debug!("Started ffmpeg (pid {}) for {}", child.id(), path.display());
        Ok(Box::new(FfmpegDecoder { child, stdout }))
    }
}

pub struct FfmpegDecoder {
    child: Child,
    stdout: ChildStdout,
}

impl PcmSource for FfmpegDecoder {
    fn read_chunk(&mut self, buf: &mut [u8]) -> bool {
        match self.stdout.read_exact(buf) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => false,
            Err(e) => {
                warn!("Reading decoded audio failed: {}", e);
                false
            }
        }
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Fails unless the ffmpeg binary can be executed.
pub fn check_ffmpeg(ffmpeg: &Path) -> Result<()> {
    let status = Command::new(ffmpeg)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| AppError::Toolchain(format!("{}: {}", ffmpeg.display(), e)))?;

    if !status.success() {
        return Err(AppError::Toolchain(format!(
            "{} -version exited with {}",
            ffmpeg.display(),
            status
        )));
    }
    Ok(())
}
