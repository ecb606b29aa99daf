use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    codec::{MediaFormat, SelectionPolicy, MIME_VIDEO_AVC},
    error::{Error, Result},
};

pub const DEFAULT_QUEUE_CAPACITY: usize = 80;
pub const DEFAULT_IDLE_BACKOFF_US: u64 = 1000;

/// How the encoder thread learns about free input and ready output buffers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Callbacks when the codec supports them, polling otherwise.
    #[default]
    Auto,
    Callback,
    Polling,
}

/// Where the codec's input comes from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// Frames are copied from the frame queue into codec input buffers.
    #[default]
    Buffer,
    /// The codec is fed behind the encoder's back (e.g. an input surface);
    /// only output is pumped and the frame queue stays closed.
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Names the encoder thread and labels the metrics.
    pub name: String,
    pub queue_capacity: usize,
    pub selection_policy: SelectionPolicy,
    pub execution: ExecutionMode,
    pub input: InputMode,
    /// Sleep after a polling iteration that made no progress or failed. Zero spins.
    pub idle_backoff_us: u64,
    pub format: MediaFormat,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            name: "encoder".to_owned(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            selection_policy: SelectionPolicy::default(),
            execution: ExecutionMode::default(),
            input: InputMode::default(),
            idle_backoff_us: DEFAULT_IDLE_BACKOFF_US,
            format: MediaFormat::video(MIME_VIDEO_AVC, 1280, 720)
                .with_frame_rate(30)
                .with_i_frame_interval(1),
        }
    }
}

impl EncoderConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("name must not be empty".into()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "queue_capacity must be greater than zero".into(),
            ));
        }
        if self.format.mime.is_empty() {
            return Err(Error::InvalidConfig("format.mime must be set".into()));
        }
        if self.format.is_video() {
            match (self.format.width, self.format.height) {
                (Some(w), Some(h)) if w > 0 && h > 0 => {}
                _ => {
                    return Err(Error::InvalidConfig(
                        "video format needs a non-zero width and height".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_micros(self.idle_backoff_us)
    }
}
