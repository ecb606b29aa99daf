//! A software passthrough codec.
//!
//! Frames are not compressed. Each queued input comes back as one output
//! buffer, wrapped in an Annex-B NAL unit for H.264. Before the first output
//! the codec reports its output format and emits a codec-config buffer, the
//! same sequence a hardware encoder produces.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crate::{
    codec::{
        BufferFlags, BufferInfo, Codec, CodecDescriptor, CodecEvent, CodecNotifier,
        CodecProvider, MediaFormat, OutputEvent, MIME_AUDIO_AAC, MIME_AUDIO_OPUS, MIME_VIDEO_AVC,
        MIME_VIDEO_HEVC,
    },
    error::CodecError,
};

const START_CODE: [u8; 4] = [0, 0, 0, 1];
const AVC_SPS: [u8; 9] = [0x67, 0x42, 0xc0, 0x1f, 0xda, 0x01, 0x40, 0x16, 0xe8];
const AVC_PPS: [u8; 4] = [0x68, 0xce, 0x3c, 0x80];
const NAL_IDR: u8 = 0x65;
const NAL_NON_IDR: u8 = 0x41;

const AAC_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    pub input_buffers: usize,
    pub output_buffers: usize,
    /// Capacity of each input buffer. Derived from the format when unset.
    pub input_buffer_size: Option<usize>,
    /// Every n-th frame is flagged as a key frame.
    pub key_frame_interval: u32,
    /// Whether the codec can run in callback mode.
    pub callbacks: bool,
    /// Make `start` fail, for exercising error paths.
    pub fail_start: bool,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            input_buffers: 4,
            output_buffers: 16,
            input_buffer_size: None,
            key_frame_interval: 30,
            callbacks: true,
            fail_start: false,
        }
    }
}

/// Counters shared by every codec a [`LoopbackProvider`] opens.
#[derive(Debug, Default)]
pub struct LoopbackStats {
    opened: AtomicUsize,
    inputs_queued: AtomicUsize,
    outputs_produced: AtomicUsize,
    outputs_released: AtomicUsize,
    released: AtomicUsize,
}

impl LoopbackStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn inputs_queued(&self) -> usize {
        self.inputs_queued.load(Ordering::SeqCst)
    }

    pub fn outputs_produced(&self) -> usize {
        self.outputs_produced.load(Ordering::SeqCst)
    }

    pub fn outputs_released(&self) -> usize {
        self.outputs_released.load(Ordering::SeqCst)
    }

    /// Number of codecs released.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct LoopbackProvider {
    descriptors: Vec<CodecDescriptor>,
    options: LoopbackOptions,
    stats: Arc<LoopbackStats>,
}

impl LoopbackProvider {
    pub fn new(descriptors: Vec<CodecDescriptor>, options: LoopbackOptions) -> Self {
        Self {
            descriptors,
            options,
            stats: Arc::default(),
        }
    }

    /// One hardware unit for video and one software unit for everything.
    pub fn default_descriptors() -> Vec<CodecDescriptor> {
        vec![
            CodecDescriptor::hardware("loopback.hw", [MIME_VIDEO_AVC, MIME_VIDEO_HEVC]),
            CodecDescriptor::software(
                "loopback.sw",
                [MIME_VIDEO_AVC, MIME_VIDEO_HEVC, MIME_AUDIO_AAC, MIME_AUDIO_OPUS],
            ),
        ]
    }

    pub fn stats(&self) -> Arc<LoopbackStats> {
        self.stats.clone()
    }
}

impl Default for LoopbackProvider {
    fn default() -> Self {
        Self::new(Self::default_descriptors(), LoopbackOptions::default())
    }
}

impl CodecProvider for LoopbackProvider {
    fn encoders(&self, mime: &str) -> Vec<CodecDescriptor> {
        self.descriptors
            .iter()
            .filter(|d| d.supports(mime))
            .cloned()
            .collect()
    }

    fn open(
        &self,
        descriptor: &CodecDescriptor,
        format: &MediaFormat,
    ) -> Result<Box<dyn Codec>, CodecError> {
        if !self.descriptors.contains(descriptor) {
            return Err(CodecError::Configure(format!(
                "unknown codec {}",
                descriptor.name
            )));
        }
        if !descriptor.supports(&format.mime) {
            return Err(CodecError::Configure(format!(
                "{} cannot encode {}",
                descriptor.name, format.mime
            )));
        }
        if self.options.input_buffers == 0 || self.options.output_buffers == 0 {
            return Err(CodecError::Configure("no buffers".into()));
        }

        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(codec = %descriptor.name, mime = %format.mime, "Loopback codec configured");

        Ok(Box::new(LoopbackCodec::new(
            descriptor.clone(),
            format.clone(),
            self.options.clone(),
            self.stats.clone(),
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Configured,
    Running,
    Stopped,
    Released,
}

pub struct LoopbackCodec {
    descriptor: CodecDescriptor,
    format: MediaFormat,
    options: LoopbackOptions,
    stats: Arc<LoopbackStats>,
    state: State,
    notifier: Option<CodecNotifier>,

    inputs: Vec<Vec<u8>>,
    input_owned: Vec<bool>,
    free_inputs: VecDeque<usize>,

    outputs: Vec<Vec<u8>>,
    output_owned: Vec<bool>,
    free_outputs: VecDeque<usize>,
    /// Filled outputs not yet dequeued (polling mode).
    ready: VecDeque<(usize, BufferInfo)>,
    /// Encoded data waiting for a free output buffer.
    backlog: VecDeque<(Vec<u8>, BufferInfo)>,

    format_pending: bool,
    config_sent: bool,
    frames: u64,
}

impl LoopbackCodec {
    fn new(
        descriptor: CodecDescriptor,
        format: MediaFormat,
        options: LoopbackOptions,
        stats: Arc<LoopbackStats>,
    ) -> Self {
        let input_size = options
            .input_buffer_size
            .unwrap_or_else(|| default_input_size(&format));

        Self {
            inputs: vec![vec![0; input_size]; options.input_buffers],
            input_owned: vec![false; options.input_buffers],
            free_inputs: VecDeque::new(),
            outputs: vec![Vec::new(); options.output_buffers],
            output_owned: vec![false; options.output_buffers],
            free_outputs: VecDeque::new(),
            ready: VecDeque::new(),
            backlog: VecDeque::new(),
            format_pending: false,
            config_sent: false,
            frames: 0,
            descriptor,
            format,
            options,
            stats,
            state: State::Configured,
            notifier: None,
        }
    }

    fn ensure_running(&self) -> Result<(), CodecError> {
        match self.state {
            State::Running => Ok(()),
            State::Released => Err(CodecError::IllegalState("codec released")),
            _ => Err(CodecError::IllegalState("codec not running")),
        }
    }

    fn owned_input(&self, index: usize) -> Result<(), CodecError> {
        self.ensure_running()?;
        match self.input_owned.get(index) {
            Some(true) => Ok(()),
            _ => Err(CodecError::InvalidIndex(index)),
        }
    }

    fn owned_output(&self, index: usize) -> Result<(), CodecError> {
        self.ensure_running()?;
        match self.output_owned.get(index) {
            Some(true) => Ok(()),
            _ => Err(CodecError::InvalidIndex(index)),
        }
    }

    fn is_avc(&self) -> bool {
        self.format.mime.eq_ignore_ascii_case(MIME_VIDEO_AVC)
    }

    fn codec_config(&self) -> Vec<Vec<u8>> {
        if self.is_avc() {
            return vec![
                [&START_CODE[..], &AVC_SPS[..]].concat(),
                [&START_CODE[..], &AVC_PPS[..]].concat(),
            ];
        }
        if self.format.mime.eq_ignore_ascii_case(MIME_AUDIO_AAC) {
            return vec![aac_audio_specific_config(&self.format).to_vec()];
        }
        Vec::new()
    }

    fn output_format(&self) -> MediaFormat {
        self.format.clone().with_codec_specific_data(self.codec_config())
    }

    fn reset(&mut self) {
        self.input_owned.iter_mut().for_each(|o| *o = false);
        self.output_owned.iter_mut().for_each(|o| *o = false);
        self.free_inputs = (0..self.inputs.len()).collect();
        self.free_outputs = (0..self.outputs.len()).collect();
        self.ready.clear();
        self.backlog.clear();
        self.format_pending = true;
        self.config_sent = false;
        self.frames = 0;
    }

    fn encode(&mut self, data: Vec<u8>, pts: i64, input_flags: BufferFlags) {
        if !self.config_sent {
            self.config_sent = true;
            let config = self.codec_config().concat();
            if !config.is_empty() {
                self.emit(config, pts, BufferFlags::CODEC_CONFIG);
            }
        }

        if !data.is_empty() {
            let interval = u64::from(self.options.key_frame_interval.max(1));
            let key = self.frames % interval == 0;
            self.frames += 1;

            let flags = if key {
                BufferFlags::KEY_FRAME
            } else {
                BufferFlags::empty()
            };
            let payload = if self.is_avc() {
                let nal = if key { NAL_IDR } else { NAL_NON_IDR };
                [&START_CODE[..], &[nal], &data[..]].concat()
            } else {
                data
            };
            self.emit(payload, pts, flags);
        }

        if input_flags.contains(BufferFlags::END_OF_STREAM) {
            self.emit(Vec::new(), pts, BufferFlags::END_OF_STREAM);
        }
    }

    fn emit(&mut self, payload: Vec<u8>, pts: i64, flags: BufferFlags) {
        let info = BufferInfo {
            offset: 0,
            size: payload.len(),
            presentation_time_us: pts,
            flags,
        };
        self.backlog.push_back((payload, info));
    }

    /// Move backlog into free output buffers and announce them.
    fn drain(&mut self) {
        while !self.backlog.is_empty() {
            let Some(slot) = self.free_outputs.pop_front() else {
                break;
            };
            let Some((payload, info)) = self.backlog.pop_front() else {
                break;
            };

            self.outputs[slot].clear();
            self.outputs[slot].extend_from_slice(&payload);
            self.stats.outputs_produced.fetch_add(1, Ordering::SeqCst);

            match &self.notifier {
                Some(notifier) => {
                    if self.format_pending {
                        self.format_pending = false;
                        notifier.notify(CodecEvent::FormatChanged(self.output_format()));
                    }
                    self.output_owned[slot] = true;
                    notifier.notify(CodecEvent::OutputAvailable(slot, info));
                }
                None => self.ready.push_back((slot, info)),
            }
        }
    }
}

impl Codec for LoopbackCodec {
    fn descriptor(&self) -> &CodecDescriptor {
        &self.descriptor
    }

    fn supports_callbacks(&self) -> bool {
        self.options.callbacks
    }

    fn set_notifier(&mut self, notifier: Option<CodecNotifier>) -> Result<(), CodecError> {
        match self.state {
            State::Configured | State::Stopped => {}
            State::Running => return Err(CodecError::IllegalState("codec already started")),
            State::Released => return Err(CodecError::IllegalState("codec released")),
        }
        if notifier.is_some() && !self.options.callbacks {
            return Err(CodecError::IllegalState("callbacks not supported"));
        }
        self.notifier = notifier;
        Ok(())
    }

    fn start(&mut self) -> Result<(), CodecError> {
        match self.state {
            State::Configured | State::Stopped => {}
            State::Running => return Err(CodecError::IllegalState("codec already started")),
            State::Released => return Err(CodecError::IllegalState("codec released")),
        }
        if self.options.fail_start {
            return Err(CodecError::Hardware {
                code: -1,
                message: "start failed".into(),
            });
        }

        self.reset();
        self.state = State::Running;

        if let Some(notifier) = &self.notifier {
            for index in self.free_inputs.drain(..) {
                self.input_owned[index] = true;
                notifier.notify(CodecEvent::InputAvailable(index));
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        if self.state == State::Released {
            return Err(CodecError::IllegalState("codec released"));
        }
        self.state = State::Stopped;
        self.ready.clear();
        self.backlog.clear();
        Ok(())
    }

    fn release(&mut self) -> Result<(), CodecError> {
        if self.state == State::Released {
            return Err(CodecError::IllegalState("codec already released"));
        }
        self.state = State::Released;
        self.notifier = None;
        self.inputs.clear();
        self.outputs.clear();
        self.stats.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn dequeue_input_buffer(&mut self) -> Result<Option<usize>, CodecError> {
        self.ensure_running()?;
        if self.notifier.is_some() {
            return Err(CodecError::IllegalState("dequeue in callback mode"));
        }
        let index = self.free_inputs.pop_front();
        if let Some(index) = index {
            self.input_owned[index] = true;
        }
        Ok(index)
    }

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], CodecError> {
        self.owned_input(index)?;
        Ok(self.inputs[index].as_mut_slice())
    }

    fn queue_input_buffer(
        &mut self,
        index: usize,
        offset: usize,
        size: usize,
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), CodecError> {
        self.owned_input(index)?;
        let capacity = self.inputs[index].len();
        let data = offset
            .checked_add(size)
            .and_then(|end| self.inputs[index].get(offset..end))
            .ok_or(CodecError::BufferOverflow { size, capacity })?
            .to_vec();

        self.input_owned[index] = false;
        self.stats.inputs_queued.fetch_add(1, Ordering::SeqCst);

        self.encode(data, presentation_time_us, flags);
        self.drain();

        match &self.notifier {
            Some(notifier) => {
                self.input_owned[index] = true;
                notifier.notify(CodecEvent::InputAvailable(index));
            }
            None => self.free_inputs.push_back(index),
        }
        Ok(())
    }

    fn dequeue_output_buffer(&mut self) -> Result<OutputEvent, CodecError> {
        self.ensure_running()?;
        if self.notifier.is_some() {
            return Err(CodecError::IllegalState("dequeue in callback mode"));
        }
        if self.ready.is_empty() {
            return Ok(OutputEvent::NotAvailable);
        }
        if self.format_pending {
            self.format_pending = false;
            return Ok(OutputEvent::FormatChanged(self.output_format()));
        }
        match self.ready.pop_front() {
            Some((index, info)) => {
                self.output_owned[index] = true;
                Ok(OutputEvent::Ready(index, info))
            }
            None => Ok(OutputEvent::NotAvailable),
        }
    }

    fn output_buffer(&mut self, index: usize) -> Result<&[u8], CodecError> {
        self.owned_output(index)?;
        Ok(self.outputs[index].as_slice())
    }

    fn release_output_buffer(&mut self, index: usize) -> Result<(), CodecError> {
        self.owned_output(index)?;
        self.output_owned[index] = false;
        self.free_outputs.push_back(index);
        self.stats.outputs_released.fetch_add(1, Ordering::SeqCst);
        self.drain();
        Ok(())
    }
}

fn default_input_size(format: &MediaFormat) -> usize {
    match (format.width, format.height) {
        (Some(w), Some(h)) if format.is_video() => (w as usize * h as usize * 3 / 2).max(1),
        _ if format.is_audio() => 8192,
        _ => 64 * 1024,
    }
}

/// Two byte AAC-LC AudioSpecificConfig.
fn aac_audio_specific_config(format: &MediaFormat) -> [u8; 2] {
    let sample_rate = format.sample_rate.unwrap_or(44100);
    let frequency_index = AAC_SAMPLE_RATES
        .iter()
        .position(|&r| r == sample_rate)
        .unwrap_or(4) as u16;
    let channels = format.channel_count.unwrap_or(2).min(7) as u16;

    let config = (2 << 11) | (frequency_index << 7) | (channels << 3);
    config.to_be_bytes()
}

#[cfg(test)]
mod test {
    use crossbeam::channel::{self, Receiver};

    use super::*;

    fn open(options: LoopbackOptions, format: MediaFormat) -> (Box<dyn Codec>, Arc<LoopbackStats>) {
        let provider = LoopbackProvider::new(LoopbackProvider::default_descriptors(), options);
        let descriptor = provider.encoders(&format.mime).remove(0);
        (provider.open(&descriptor, &format).unwrap(), provider.stats())
    }

    fn video() -> MediaFormat {
        MediaFormat::video(MIME_VIDEO_AVC, 4, 4)
    }

    fn callbacks(codec: &mut dyn Codec) -> Receiver<CodecEvent> {
        let (tx, rx) = channel::unbounded();
        codec
            .set_notifier(Some(CodecNotifier::new(move |e| tx.send(e).is_ok())))
            .unwrap();
        rx
    }

    fn feed(codec: &mut dyn Codec, index: usize, data: &[u8], pts: i64) {
        codec.input_buffer(index).unwrap()[..data.len()].copy_from_slice(data);
        codec
            .queue_input_buffer(index, 0, data.len(), pts, BufferFlags::empty())
            .unwrap();
    }

    #[test]
    fn polling_sequence() {
        let (mut codec, stats) = open(LoopbackOptions::default(), video());
        codec.start().unwrap();

        assert_eq!(codec.dequeue_output_buffer().unwrap(), OutputEvent::NotAvailable);

        let index = codec.dequeue_input_buffer().unwrap().unwrap();
        assert_eq!(codec.input_buffer(index).unwrap().len(), 24);
        feed(codec.as_mut(), index, &[9, 9], 100);

        let OutputEvent::FormatChanged(format) = codec.dequeue_output_buffer().unwrap() else {
            panic!("format change expected first");
        };
        assert_eq!(format.codec_specific_data.len(), 2);

        let OutputEvent::Ready(config, info) = codec.dequeue_output_buffer().unwrap() else {
            panic!("codec config expected");
        };
        assert!(info.is_codec_config());
        assert_eq!(&codec.output_buffer(config).unwrap()[4..5], &[0x67]);
        codec.release_output_buffer(config).unwrap();

        let OutputEvent::Ready(frame, info) = codec.dequeue_output_buffer().unwrap() else {
            panic!("frame expected");
        };
        assert!(info.is_key_frame());
        assert_eq!(info.presentation_time_us, 100);
        assert_eq!(codec.output_buffer(frame).unwrap(), &[0, 0, 0, 1, 0x65, 9, 9]);
        codec.release_output_buffer(frame).unwrap();

        assert_eq!(codec.dequeue_output_buffer().unwrap(), OutputEvent::NotAvailable);
        assert_eq!(stats.outputs_produced(), 2);
        assert_eq!(stats.outputs_released(), 2);
    }

    #[test]
    fn callback_sequence() {
        let (mut codec, _stats) = open(
            LoopbackOptions {
                input_buffers: 2,
                ..Default::default()
            },
            video(),
        );
        let events = callbacks(codec.as_mut());
        codec.start().unwrap();

        assert_eq!(events.try_recv().unwrap(), CodecEvent::InputAvailable(0));
        assert_eq!(events.try_recv().unwrap(), CodecEvent::InputAvailable(1));
        assert!(codec.dequeue_input_buffer().is_err());

        feed(codec.as_mut(), 0, &[1], 10);
        let seen: Vec<_> = events.try_iter().collect();
        assert!(matches!(seen[0], CodecEvent::FormatChanged(_)));
        assert!(
            matches!(seen[1], CodecEvent::OutputAvailable(_, info) if info.is_codec_config())
        );
        assert!(matches!(seen[2], CodecEvent::OutputAvailable(_, info) if info.is_key_frame()));
        assert_eq!(seen[3], CodecEvent::InputAvailable(0));
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn key_frame_interval() {
        let (mut codec, _stats) = open(
            LoopbackOptions {
                key_frame_interval: 3,
                ..Default::default()
            },
            video(),
        );
        codec.start().unwrap();

        let mut keys = Vec::new();
        for pts in 0..6 {
            let index = codec.dequeue_input_buffer().unwrap().unwrap();
            feed(codec.as_mut(), index, &[0], pts);
            loop {
                match codec.dequeue_output_buffer().unwrap() {
                    OutputEvent::Ready(i, info) => {
                        if !info.is_codec_config() {
                            keys.push(info.is_key_frame());
                        }
                        codec.release_output_buffer(i).unwrap();
                    }
                    OutputEvent::FormatChanged(_) => {}
                    OutputEvent::NotAvailable => break,
                }
            }
        }
        assert_eq!(keys, vec![true, false, false, true, false, false]);
    }

    #[test]
    fn backlog_waits_for_free_output() {
        let (mut codec, stats) = open(
            LoopbackOptions {
                output_buffers: 1,
                ..Default::default()
            },
            video(),
        );
        codec.start().unwrap();

        let index = codec.dequeue_input_buffer().unwrap().unwrap();
        feed(codec.as_mut(), index, &[1], 0);
        assert_eq!(stats.outputs_produced(), 1);

        assert!(matches!(
            codec.dequeue_output_buffer().unwrap(),
            OutputEvent::FormatChanged(_)
        ));
        let OutputEvent::Ready(slot, _) = codec.dequeue_output_buffer().unwrap() else {
            panic!("output expected");
        };
        assert_eq!(codec.dequeue_output_buffer().unwrap(), OutputEvent::NotAvailable);
        codec.release_output_buffer(slot).unwrap();
        assert_eq!(stats.outputs_produced(), 2);
        assert!(matches!(
            codec.dequeue_output_buffer().unwrap(),
            OutputEvent::Ready(_, _)
        ));
    }

    #[test]
    fn state_checks() {
        let (mut codec, stats) = open(LoopbackOptions::default(), video());
        assert!(codec.dequeue_input_buffer().is_err());
        codec.start().unwrap();
        assert!(codec.start().is_err());
        assert!(codec.release_output_buffer(0).is_err());
        assert!(codec.input_buffer(0).is_err());

        codec.stop().unwrap();
        codec.stop().unwrap();
        assert_eq!(
            codec.dequeue_input_buffer(),
            Err(CodecError::IllegalState("codec not running"))
        );

        codec.release().unwrap();
        assert_eq!(
            codec.release(),
            Err(CodecError::IllegalState("codec already released"))
        );
        assert!(codec.start().is_err());
        assert_eq!(stats.released(), 1);
    }

    #[test]
    fn open_rejects_unsupported_format() {
        let provider = LoopbackProvider::default();
        let hw = provider.encoders(MIME_VIDEO_AVC).remove(0);
        assert_eq!(hw.name, "loopback.hw");
        assert!(provider
            .open(&hw, &MediaFormat::audio(MIME_AUDIO_AAC, 48000, 2))
            .is_err());
        assert!(provider.encoders("video/x-unknown").is_empty());
    }

    #[test]
    fn aac_config() {
        let format = MediaFormat::audio(MIME_AUDIO_AAC, 48000, 2);
        assert_eq!(aac_audio_specific_config(&format), [0x11, 0x90]);
        let format = MediaFormat::audio(MIME_AUDIO_AAC, 44100, 2);
        assert_eq!(aac_audio_specific_config(&format), [0x12, 0x10]);
    }
}
