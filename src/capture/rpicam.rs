//! Capture through an `rpicam-vid` child process writing raw frames to stdout

use std::io::{self, Read};
use std::os::fd::AsFd;
use std::process::{Child, ChildStdout, Command, Stdio};

use nix::poll::{poll, PollFd, PollFlags};
use tracing::{debug, info, warn};

use crate::capture::CaptureSource;
use crate::{CaptureConfig, PixelFormat, SourceError};

const CAPTURE_PROGRAM: &str = "rpicam-vid";
const PROBE_PROGRAM: &str = "rpicam-hello";

pub struct RpiCamSource {
    program: String,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    /// Milliseconds one read may wait for the pipe to become readable
    poll_timeout_ms: u16,
}

impl RpiCamSource {
    pub fn new() -> Self {
        Self {
            program: CAPTURE_PROGRAM.into(),
            child: None,
            stdout: None,
            poll_timeout_ms: 5,
        }
    }

    /// Use another executable in place of `rpicam-vid`
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Command-line arguments for `config`
    pub fn build_args(config: &CaptureConfig) -> Result<Vec<String>, SourceError> {
        let mut args: Vec<String> = vec![
            "--camera".into(),
            config.camera_index.to_string(),
            "--width".into(),
            config.width.to_string(),
            "--height".into(),
            config.height.to_string(),
            // 0 keeps capturing until the process is stopped
            "--timeout".into(),
            config.timeout_ms.to_string(),
            "--nopreview".into(),
            "--inline".into(),
            "--flush".into(),
            "--framerate".into(),
            config.fps.to_string(),
            "--buffer-count".into(),
            config.buffer_count.to_string(),
            "--codec".into(),
        ];
        match config.format {
            PixelFormat::Yuv420 => args.push("yuv420".into()),
            PixelFormat::Mjpeg => {
                args.push("mjpeg".into());
                args.push("--quality".into());
                args.push(config.quality.to_string());
            }
            PixelFormat::Raw => {
                args.push("yuv420".into());
                args.push("--raw".into());
            }
            PixelFormat::Rgb => return Err(SourceError::UnsupportedFormat(config.format)),
        }
        args.push("--output".into());
        args.push("-".into());
        if config.verbose {
            args.push("--verbose".into());
        }
        Ok(args)
    }

    /// Camera indices that answer a short `rpicam-hello` run
    pub fn list_cameras() -> Vec<u32> {
        (0..2).filter(|&index| Self::test_camera(index)).collect()
    }

    pub fn test_camera(index: u32) -> bool {
        Command::new(PROBE_PROGRAM)
            .args(["--camera", &index.to_string(), "--timeout", "100"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }
}

impl Default for RpiCamSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for RpiCamSource {
    fn probe(&mut self, config: &CaptureConfig) -> Result<(), SourceError> {
        Self::build_args(config)?;
        let status = Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| SourceError::Unavailable(format!("{}: {e}", self.program)))?;
        if !status.success() {
            return Err(SourceError::Unavailable(format!(
                "{} --version exited with {status}",
                self.program
            )));
        }
        Ok(())
    }

    fn start(&mut self, config: &CaptureConfig) -> Result<(), SourceError> {
        self.stop();
        let args = Self::build_args(config)?;
        debug!(program = %self.program, ?args, "Spawning capture process");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(if config.verbose {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .spawn()
            .map_err(|e| SourceError::Unavailable(format!("{}: {e}", self.program)))?;
        let stdout = child.stdout.take().ok_or(SourceError::NotStarted)?;

        info!(pid = child.id(), "Capture process started");
        self.child = Some(child);
        self.stdout = Some(stdout);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "process not started"))?;

        let ready = {
            let mut fds = [PollFd::new(stdout.as_fd(), PollFlags::POLLIN)];
            poll(&mut fds, self.poll_timeout_ms)?
        };
        if ready == 0 {
            return Ok(0);
        }
        // a readable pipe returns at least one byte, or 0 once the process has exited
        stdout.read(buf)
    }

    fn stop(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!(error = %e, "Capture process already gone");
            }
            match child.wait() {
                Ok(status) => debug!(%status, "Capture process exited"),
                Err(e) => warn!(error = %e, "Failed to reap capture process"),
            }
        }
    }

    fn name(&self) -> &str {
        "rpicam"
    }
}

impl Drop for RpiCamSource {
    fn drop(&mut self) {
        self.stop();
    }
}
