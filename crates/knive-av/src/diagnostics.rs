//! Interpretation of ffmpeg's diagnostic output.

use std::sync::OnceLock;

use regex::Regex;

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)ffmpeg version").expect("valid regex"))
}

fn frame_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"frame=\s*(\d+)\s*fps").expect("valid regex"))
}

fn fps_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"fps=\s*(\d+\.?\d?)\s*q").expect("valid regex"))
}

fn audio_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"size= *(\d+)kB *time=\d+").expect("valid regex"))
}

/// What a single diagnostic line said.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    Version(String),
    /// Progress line with a frame counter but no readable rate.
    Stats { frame: u64 },
    /// Progress line with an encoding rate.
    Throughput { fps: f64 },
    /// Audio-only progress line.
    AudioStats { size_kb: u64 },
    Other,
}

/// Tracks encoder throughput against the configured frame rate.
#[derive(Debug)]
pub struct FfmpegDiagnostics {
    target_fps: f64,
    slow: bool,
    version: Option<String>,
    last_fps: Option<f64>,
}

impl FfmpegDiagnostics {
    pub fn new(target_fps: f64) -> Self {
        Self {
            target_fps,
            slow: false,
            version: None,
            last_fps: None,
        }
    }

    pub fn target_fps(&self) -> f64 {
        self.target_fps
    }

    /// Whether the last reported rate was below target.
    pub fn is_slow(&self) -> bool {
        self.slow
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn last_fps(&self) -> Option<f64> {
        self.last_fps
    }

    /// Classify one line and log what it means.
    pub fn observe(&mut self, line: &str) -> Diagnostic {
        if version_re().is_match(line) {
            tracing::info!("{}", line);
            self.version = Some(line.to_string());
            return Diagnostic::Version(line.to_string());
        }

        if let Some(fps) = fps_re()
            .captures(line)
            .and_then(|c| c[1].parse::<f64>().ok())
        {
            self.last_fps = Some(fps);
            if fps.floor() < self.target_fps.floor() {
                if !self.slow {
                    tracing::warn!(
                        "Encoder too slow: {} fps, expected {} fps",
                        fps,
                        self.target_fps
                    );
                }
                self.slow = true;
            } else if self.slow {
                tracing::info!("Encoder back at {} fps", fps);
                self.slow = false;
            }
            return Diagnostic::Throughput { fps };
        }

        if let Some(frame) = frame_re()
            .captures(line)
            .and_then(|c| c[1].parse::<u64>().ok())
        {
            tracing::trace!("Encoder at frame {}", frame);
            return Diagnostic::Stats { frame };
        }

        if let Some(size_kb) = audio_re()
            .captures(line)
            .and_then(|c| c[1].parse::<u64>().ok())
        {
            tracing::trace!("Encoder wrote {} kB", size_kb);
            return Diagnostic::AudioStats { size_kb };
        }

        tracing::debug!("{}", line);
        Diagnostic::Other
    }
}
