//! Single-frame capture from a live playback URL via ffmpeg.

use crate::config::CaptureConfig;
use anyhow::{Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// JPEG start-of-image marker
const JPEG_MAGIC: [u8; 2] = [0xFF, 0xD8];

pub fn ffmpeg_args(playback_url: &str) -> Vec<String> {
    [
        "-loglevel", "error", "-i", playback_url, "-frames:v", "1", "-f", "image2", "-vcodec", "mjpeg",
        "pipe:1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Grab one JPEG frame. The child is killed if the timeout elapses.
pub async fn capture_frame(cfg: &CaptureConfig, playback_url: &str) -> Result<Vec<u8>> {
    let child = Command::new(&cfg.ffmpeg_path)
        .args(ffmpeg_args(playback_url))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn {}", cfg.ffmpeg_path))?;

    let timeout = Duration::from_secs(cfg.timeout_secs);
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .with_context(|| format!("Frame capture timed out after {:?}", timeout))?
        .context("Frame capture failed")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ffmpeg exited with {}: {}", output.status, stderr.trim());
    }
    if !output.stdout.starts_with(&JPEG_MAGIC) {
        anyhow::bail!("ffmpeg produced no JPEG frame ({} bytes)", output.stdout.len());
    }
    Ok(output.stdout)
}
