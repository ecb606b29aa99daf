use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

pub const MIME_VIDEO_AVC: &str = "video/avc";
pub const MIME_VIDEO_HEVC: &str = "video/hevc";
pub const MIME_AUDIO_AAC: &str = "audio/mp4a-latm";
pub const MIME_AUDIO_OPUS: &str = "audio/opus";

/// Which codec units may be picked when several support the requested type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Whatever unit is enumerated first.
    #[default]
    FirstCompatibleFound,
    /// Hardware units only.
    PreferHardware,
    /// Software units only.
    PreferSoftware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    Hardware,
    Software,
}

/// Describes one codec unit a [`CodecProvider`] can open.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodecDescriptor {
    pub name: String,
    pub kind: CodecKind,
    pub mime_types: Vec<String>,
}

impl CodecDescriptor {
    pub fn new<I, S>(name: impl Into<String>, kind: CodecKind, mime_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            kind,
            mime_types: mime_types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn hardware<I, S>(name: impl Into<String>, mime_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(name, CodecKind::Hardware, mime_types)
    }

    pub fn software<I, S>(name: impl Into<String>, mime_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(name, CodecKind::Software, mime_types)
    }

    pub fn supports(&self, mime: &str) -> bool {
        self.mime_types.iter().any(|m| m.eq_ignore_ascii_case(mime))
    }
}

/// Pick a codec for `mime` out of `candidates`, honoring `policy`.
///
/// Candidates are considered in enumeration order.
pub fn select_codec<'a>(
    candidates: &'a [CodecDescriptor],
    mime: &str,
    policy: SelectionPolicy,
) -> Option<&'a CodecDescriptor> {
    candidates
        .iter()
        .filter(|c| c.supports(mime))
        .find(|c| match policy {
            SelectionPolicy::FirstCompatibleFound => true,
            SelectionPolicy::PreferHardware => c.kind == CodecKind::Hardware,
            SelectionPolicy::PreferSoftware => c.kind == CodecKind::Software,
        })
}

bitflags::bitflags! {
    /// Per-buffer flags reported by the codec.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferFlags: u32 {
        /// The buffer holds a sync (key) frame.
        const KEY_FRAME = 1;
        /// The buffer holds codec configuration data (e.g. SPS/PPS) instead of media.
        const CODEC_CONFIG = 2;
        const END_OF_STREAM = 4;
        /// The buffer holds only part of a frame.
        const PARTIAL_FRAME = 8;
    }
}

impl Default for BufferFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Metadata describing the valid region of a codec buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub offset: usize,
    pub size: usize,
    pub presentation_time_us: i64,
    pub flags: BufferFlags,
}

impl BufferInfo {
    pub fn is_key_frame(&self) -> bool {
        self.flags.contains(BufferFlags::KEY_FRAME)
    }

    pub fn is_codec_config(&self) -> bool {
        self.flags.contains(BufferFlags::CODEC_CONFIG)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(BufferFlags::END_OF_STREAM)
    }
}

/// Stream format requested from, or reported by, a codec.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaFormat {
    pub mime: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
    /// Seconds between key frames.
    pub i_frame_interval: Option<u32>,
    pub bit_rate: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channel_count: Option<u32>,
    /// Codec specific data (`csd-0`, `csd-1`, ...), only known once the codec reports it.
    #[serde(skip)]
    pub codec_specific_data: Vec<Vec<u8>>,
}

impl MediaFormat {
    pub fn video(mime: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            mime: mime.into(),
            width: Some(width),
            height: Some(height),
            ..Default::default()
        }
    }

    pub fn audio(mime: impl Into<String>, sample_rate: u32, channel_count: u32) -> Self {
        Self {
            mime: mime.into(),
            sample_rate: Some(sample_rate),
            channel_count: Some(channel_count),
            ..Default::default()
        }
    }

    pub fn with_frame_rate(mut self, frame_rate: u32) -> Self {
        self.frame_rate = Some(frame_rate);
        self
    }

    pub fn with_i_frame_interval(mut self, seconds: u32) -> Self {
        self.i_frame_interval = Some(seconds);
        self
    }

    pub fn with_bit_rate(mut self, bit_rate: u32) -> Self {
        self.bit_rate = Some(bit_rate);
        self
    }

    pub fn with_codec_specific_data(mut self, csd: Vec<Vec<u8>>) -> Self {
        self.codec_specific_data = csd;
        self
    }

    pub fn is_video(&self) -> bool {
        self.mime.starts_with("video/")
    }

    pub fn is_audio(&self) -> bool {
        self.mime.starts_with("audio/")
    }
}

/// Result of a non-blocking output dequeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Ready(usize, BufferInfo),
    FormatChanged(MediaFormat),
    NotAvailable,
}

/// Notification pushed by a codec running in callback mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecEvent {
    InputAvailable(usize),
    OutputAvailable(usize, BufferInfo),
    FormatChanged(MediaFormat),
    Error(CodecError),
}

/// Handle a codec uses to push [`CodecEvent`]s to the encoder's worker thread.
#[derive(Clone)]
pub struct CodecNotifier(Arc<dyn Fn(CodecEvent) -> bool + Send + Sync>);

impl CodecNotifier {
    /// `deliver` returns `false` once nobody is listening any more.
    pub fn new(deliver: impl Fn(CodecEvent) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(deliver))
    }

    /// Returns `false` if the event could not be delivered.
    pub fn notify(&self, event: CodecEvent) -> bool {
        (self.0)(event)
    }
}

impl fmt::Debug for CodecNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecNotifier").finish()
    }
}

/// The buffer exchange primitives of a codec unit.
///
/// Every dequeue is non-blocking. Buffer indices handed out by the codec stay
/// owned by the caller until they are queued (input) or released (output).
pub trait Codec: Send {
    fn descriptor(&self) -> &CodecDescriptor;

    /// Whether the codec can push [`CodecEvent`]s instead of being polled.
    fn supports_callbacks(&self) -> bool;

    /// Install or remove the event sink. Must be called before [`start`](Codec::start).
    fn set_notifier(&mut self, notifier: Option<CodecNotifier>) -> Result<(), CodecError>;

    fn start(&mut self) -> Result<(), CodecError>;

    fn stop(&mut self) -> Result<(), CodecError>;

    /// Free every resource held by the codec. The codec is unusable afterwards.
    fn release(&mut self) -> Result<(), CodecError>;

    fn dequeue_input_buffer(&mut self) -> Result<Option<usize>, CodecError>;

    /// Writable view of a dequeued input buffer.
    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], CodecError>;

    fn queue_input_buffer(
        &mut self,
        index: usize,
        offset: usize,
        size: usize,
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), CodecError>;

    fn dequeue_output_buffer(&mut self) -> Result<OutputEvent, CodecError>;

    /// Read-only view of a dequeued output buffer, valid until it is released.
    fn output_buffer(&mut self, index: usize) -> Result<&[u8], CodecError>;

    fn release_output_buffer(&mut self, index: usize) -> Result<(), CodecError>;
}

/// Enumerates and opens codec units.
pub trait CodecProvider: Send + Sync {
    /// Every encoder that can produce `mime`, in enumeration order.
    fn encoders(&self, mime: &str) -> Vec<CodecDescriptor>;

    /// Create and configure the codec described by `descriptor`.
    fn open(
        &self,
        descriptor: &CodecDescriptor,
        format: &MediaFormat,
    ) -> Result<Box<dyn Codec>, CodecError>;
}

/// One encoded buffer on its way to the sink.
///
/// Borrows codec-owned memory, so it cannot outlive the pump iteration that
/// releases the buffer back to the codec.
#[derive(Debug, Clone, Copy)]
pub struct EncodedBuffer<'a> {
    data: &'a [u8],
    info: &'a BufferInfo,
    format: Option<&'a MediaFormat>,
}

impl<'a> EncodedBuffer<'a> {
    pub fn new(data: &'a [u8], info: &'a BufferInfo, format: Option<&'a MediaFormat>) -> Self {
        Self { data, info, format }
    }

    /// The valid payload (`info.offset .. info.offset + info.size`).
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn info(&self) -> &'a BufferInfo {
        self.info
    }

    pub fn presentation_time_us(&self) -> i64 {
        self.info.presentation_time_us
    }

    pub fn flags(&self) -> BufferFlags {
        self.info.flags
    }

    /// The most recent output format reported by the codec.
    pub fn format(&self) -> Option<&'a MediaFormat> {
        self.format
    }
}
