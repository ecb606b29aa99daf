use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::{
    codec::{EncodedBuffer, MediaFormat},
    encoder::EncoderHooks,
    sink::EncodedSink,
};

/// Hooks for audio encoders.
///
/// The codec config (e.g. AAC AudioSpecificConfig) is reported once per
/// session, from the codec-config buffer or from `csd-0`. Buffers whose
/// timestamp goes backwards are dropped.
pub struct AudioHooks<S> {
    sink: S,
    config_reported: AtomicBool,
    last_pts: AtomicI64,
}

impl<S: EncodedSink> AudioHooks<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            config_reported: AtomicBool::new(false),
            last_pts: AtomicI64::new(i64::MIN),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn report_config(&self, config: &[u8]) {
        if config.is_empty() || self.config_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(len = config.len(), "Obtained audio codec data");
        self.sink.on_audio_config(config);
    }
}

impl<S: EncodedSink> EncoderHooks for AudioHooks<S> {
    fn check_buffer(&self, buffer: &EncodedBuffer<'_>) {
        if self.config_reported.load(Ordering::SeqCst) {
            return;
        }
        if buffer.info().is_codec_config() {
            self.report_config(buffer.data());
        } else if let Some(csd) = buffer
            .format()
            .and_then(|f| f.codec_specific_data.first())
        {
            self.report_config(csd);
        }
    }

    fn send_buffer(&self, buffer: &EncodedBuffer<'_>) {
        if buffer.info().is_codec_config() {
            return;
        }

        let pts = buffer.presentation_time_us();
        let last = self.last_pts.load(Ordering::SeqCst);
        if pts < last {
            tracing::warn!(pts, last, "Audio timestamp went backwards, dropping buffer");
            return;
        }
        self.last_pts.store(pts, Ordering::SeqCst);
        self.sink.on_data(buffer);
    }

    fn format_changed(&self, format: &MediaFormat) {
        self.sink.on_format(format);
    }

    fn stop_imp(&self) {
        self.config_reported.store(false, Ordering::SeqCst);
        self.last_pts.store(i64::MIN, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use parking_lot::Mutex;

    use super::*;
    use crate::codec::{BufferFlags, BufferInfo, MIME_AUDIO_AAC};

    #[derive(Default)]
    struct Collect {
        configs: Mutex<Vec<Vec<u8>>>,
        pts: Mutex<Vec<i64>>,
    }

    impl EncodedSink for Collect {
        fn on_audio_config(&self, config: &[u8]) {
            self.configs.lock().push(config.to_vec());
        }

        fn on_data(&self, buffer: &EncodedBuffer<'_>) {
            self.pts.lock().push(buffer.presentation_time_us());
        }
    }

    fn info(pts: i64, flags: BufferFlags) -> BufferInfo {
        BufferInfo {
            offset: 0,
            size: 2,
            presentation_time_us: pts,
            flags,
        }
    }

    #[test]
    fn config_then_data() {
        let hooks = AudioHooks::new(Collect::default());

        let config = info(0, BufferFlags::CODEC_CONFIG);
        let buffer = EncodedBuffer::new(&[0x11, 0x90], &config, None);
        hooks.check_buffer(&buffer);
        hooks.send_buffer(&buffer);

        for pts in [0, 21_333, 10_000, 42_666] {
            let info = info(pts, BufferFlags::empty());
            let buffer = EncodedBuffer::new(&[1, 2], &info, None);
            hooks.check_buffer(&buffer);
            hooks.send_buffer(&buffer);
        }

        assert_eq!(*hooks.sink().configs.lock(), vec![vec![0x11, 0x90]]);
        assert_eq!(*hooks.sink().pts.lock(), vec![0, 21_333, 42_666]);
    }

    #[test]
    fn config_from_format_after_restart() {
        let hooks = AudioHooks::new(Collect::default());
        let format = MediaFormat::audio(MIME_AUDIO_AAC, 44100, 2)
            .with_codec_specific_data(vec![vec![0x12, 0x10]]);

        for _ in 0..2 {
            let info = info(5, BufferFlags::empty());
            hooks.check_buffer(&EncodedBuffer::new(&[1, 2], &info, Some(&format)));
            hooks.send_buffer(&EncodedBuffer::new(&[1, 2], &info, Some(&format)));
            hooks.stop_imp();
        }

        assert_eq!(hooks.sink().configs.lock().len(), 2);
        assert_eq!(*hooks.sink().pts.lock(), vec![5, 5]);
    }
}
