use std::{sync::Arc, thread, time::Duration};

use crate::{
    clock::Clock,
    codec::{BufferFlags, BufferInfo, CodecEvent, EncodedBuffer, MediaFormat, OutputEvent},
    config::InputMode,
    encoder::EncoderHooks,
    error::CodecError,
    frame::{CancelToken, FrameQueue, Interrupted},
    metrics::EncoderMetrics,
    session::CodecSession,
    worker::Task,
};

/// Moves frames from the queue into the codec and encoded buffers from the
/// codec into the hooks. Runs on the encoder thread only.
pub(crate) struct BufferPump<H> {
    pub session: Arc<CodecSession>,
    pub hooks: Arc<H>,
    pub queue: Arc<FrameQueue>,
    pub cancel: CancelToken,
    pub clock: Arc<dyn Clock>,
    pub metrics: EncoderMetrics,
    pub input: InputMode,
    pub idle_backoff: Duration,
}

impl<H: EncoderHooks> BufferPump<H> {
    pub fn handle(&self, task: Task) {
        match task {
            Task::Event(event) => self.handle_event(event),
            Task::Poll => self.run_polling(),
        }
    }

    fn handle_event(&self, event: CodecEvent) {
        let result = match event {
            CodecEvent::InputAvailable(index) if self.input == InputMode::External => {
                tracing::trace!(index, "Input fed externally, slot ignored");
                Ok(())
            }
            CodecEvent::InputAvailable(index) => self.input_available(index),
            CodecEvent::OutputAvailable(index, info) => self.output_available(index, &info),
            CodecEvent::FormatChanged(format) => {
                self.format_changed(format);
                Ok(())
            }
            CodecEvent::Error(e) => {
                self.metrics.codec_errors.inc();
                tracing::error!(?e, "Codec reported an error");
                Ok(())
            }
        };

        if let Err(e) = result {
            self.report(e);
        }
    }

    fn report(&self, e: CodecError) {
        self.metrics.codec_errors.inc();
        tracing::info!(?e, "Encoding error");
    }

    fn input_available(&self, index: usize) -> Result<(), CodecError> {
        let frame = match self.hooks.get_input_frame(&self.queue, &self.cancel) {
            Ok(frame) => frame,
            Err(Interrupted) => {
                self.cancel.cancel();
                tracing::debug!(index, "Frame acquisition interrupted");
                return Ok(());
            }
        };

        if self.cancel.is_cancelled() {
            tracing::debug!(index, "Encoder stopping, frame discarded");
            return Ok(());
        }

        let pts = self.clock.now_us() - self.session.presentation_base_us();
        let payload = frame.payload();

        let result = self.session.with_codec(|codec| {
            let capacity = codec.input_buffer(index)?.len();
            if payload.len() > capacity {
                codec.queue_input_buffer(index, 0, 0, pts, BufferFlags::empty())?;
                return Err(CodecError::BufferOverflow {
                    size: payload.len(),
                    capacity,
                });
            }

            codec.input_buffer(index)?[..payload.len()].copy_from_slice(payload);
            codec.queue_input_buffer(index, 0, payload.len(), pts, BufferFlags::empty())
        });

        match result {
            Ok(()) => {
                self.metrics.input_buffers_queued.inc();
                tracing::trace!(index, pts, size = payload.len(), "Input queued");
                Ok(())
            }
            Err(e @ CodecError::BufferOverflow { .. }) => {
                self.metrics.inputs_dropped.inc();
                tracing::warn!(?e, index, "Frame dropped");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn output_available(&self, index: usize, info: &BufferInfo) -> Result<(), CodecError> {
        let format = self.session.output_format();

        self.session.with_codec(|codec| {
            // Checked under the codec lock: once stop has taken that lock
            // after cancelling, no buffer reaches the hooks.
            if self.cancel.is_cancelled() {
                tracing::debug!(index, "Encoder stopping, output released undelivered");
                return codec.release_output_buffer(index);
            }

            let delivered = match codec.output_buffer(index) {
                Ok(data) => {
                    let range = info
                        .offset
                        .checked_add(info.size)
                        .and_then(|end| data.get(info.offset..end));
                    match range {
                        Some(payload) => {
                            let buffer = EncodedBuffer::new(payload, info, format.as_deref());
                            self.hooks.check_buffer(&buffer);
                            self.hooks.send_buffer(&buffer);
                            Ok(payload.len())
                        }
                        None => Err(CodecError::BufferOverflow {
                            size: info.offset.saturating_add(info.size),
                            capacity: data.len(),
                        }),
                    }
                }
                Err(e) => Err(e),
            };

            let released = codec.release_output_buffer(index);

            let size = delivered?;
            self.metrics.output_buffers_delivered.inc();
            self.metrics.output_bytes.inc_by(size as u64);
            tracing::trace!(
                index,
                pts = info.presentation_time_us,
                flags = ?info.flags,
                size,
                "Output delivered"
            );
            released
        })
    }

    fn format_changed(&self, format: MediaFormat) {
        tracing::info!(mime = %format.mime, "Output format changed");
        let format = self.session.set_output_format(format);
        self.hooks.format_changed(&format);
    }

    fn is_live(&self) -> bool {
        self.session.is_running() && !self.cancel.is_cancelled()
    }

    /// One polling iteration: feed at most one input, then drain every ready output.
    ///
    /// Returns whether any buffer moved.
    fn poll_once(&self) -> Result<bool, CodecError> {
        let mut progressed = false;

        if self.input == InputMode::Buffer {
            if let Some(index) = self.session.with_codec(|c| c.dequeue_input_buffer())? {
                if let Err(e) = self.input_available(index) {
                    self.report(e);
                }
                progressed = true;
            }
        }

        loop {
            match self.session.with_codec(|c| c.dequeue_output_buffer())? {
                OutputEvent::Ready(index, info) => {
                    if let Err(e) = self.output_available(index, &info) {
                        self.report(e);
                    }
                }
                OutputEvent::FormatChanged(format) => self.format_changed(format),
                OutputEvent::NotAvailable => break,
            }
            progressed = true;
        }

        Ok(progressed)
    }

    fn run_polling(&self) {
        tracing::debug!("Polling loop started");

        while self.is_live() {
            let idle = match self.poll_once() {
                Ok(progressed) => !progressed,
                Err(e) => {
                    self.report(e);
                    true
                }
            };

            if idle && !self.idle_backoff.is_zero() {
                thread::sleep(self.idle_backoff);
            }
        }

        tracing::debug!("Polling loop finished");
    }
}

#[cfg(test)]
mod test {
    use crossbeam::channel::{self, Receiver, Sender};
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        clock::ManualClock,
        codec::{Codec, CodecDescriptor, CodecNotifier, MIME_VIDEO_AVC, MIME_VIDEO_HEVC},
        frame::Frame,
    };

    /// Codec stub with scripted output and a log of every call.
    struct ScriptedCodec {
        descriptor: CodecDescriptor,
        input: Vec<u8>,
        output: Vec<u8>,
        outputs: Vec<OutputEvent>,
        calls: Sender<String>,
    }

    impl Codec for ScriptedCodec {
        fn descriptor(&self) -> &CodecDescriptor {
            &self.descriptor
        }

        fn supports_callbacks(&self) -> bool {
            false
        }

        fn set_notifier(&mut self, _: Option<CodecNotifier>) -> Result<(), CodecError> {
            Err(CodecError::IllegalState("no callbacks"))
        }

        fn start(&mut self) -> Result<(), CodecError> {
            Ok(())
        }

        fn stop(&mut self) -> Result<(), CodecError> {
            Ok(())
        }

        fn release(&mut self) -> Result<(), CodecError> {
            Ok(())
        }

        fn dequeue_input_buffer(&mut self) -> Result<Option<usize>, CodecError> {
            Ok(Some(0))
        }

        fn input_buffer(&mut self, _: usize) -> Result<&mut [u8], CodecError> {
            Ok(self.input.as_mut_slice())
        }

        fn queue_input_buffer(
            &mut self,
            index: usize,
            offset: usize,
            size: usize,
            pts: i64,
            _: BufferFlags,
        ) -> Result<(), CodecError> {
            let _ = self
                .calls
                .send(format!("queue {index} {offset} {size} {pts}"));
            Ok(())
        }

        fn dequeue_output_buffer(&mut self) -> Result<OutputEvent, CodecError> {
            if self.outputs.is_empty() {
                Ok(OutputEvent::NotAvailable)
            } else {
                Ok(self.outputs.remove(0))
            }
        }

        fn output_buffer(&mut self, _: usize) -> Result<&[u8], CodecError> {
            Ok(self.output.as_slice())
        }

        fn release_output_buffer(&mut self, index: usize) -> Result<(), CodecError> {
            let _ = self.calls.send(format!("release {index}"));
            Ok(())
        }
    }

    #[derive(Default)]
    struct LogHooks {
        log: Mutex<Vec<String>>,
    }

    impl EncoderHooks for LogHooks {
        fn check_buffer(&self, buffer: &EncodedBuffer<'_>) {
            self.log.lock().push(format!("check {}", buffer.data().len()));
        }

        fn send_buffer(&self, buffer: &EncodedBuffer<'_>) {
            self.log.lock().push(format!(
                "send {} {}",
                buffer.data().len(),
                buffer.format().map(|f| f.mime.as_str()).unwrap_or("-")
            ));
        }

        fn format_changed(&self, format: &MediaFormat) {
            self.log.lock().push(format!("format {}", format.mime));
        }
    }

    fn pump(outputs: Vec<OutputEvent>) -> (BufferPump<LogHooks>, Receiver<String>) {
        pump_with(InputMode::Buffer, outputs)
    }

    fn pump_with(
        input: InputMode,
        outputs: Vec<OutputEvent>,
    ) -> (BufferPump<LogHooks>, Receiver<String>) {
        let (calls, rx) = channel::unbounded();
        let session = Arc::new(CodecSession::new());
        session.install(Box::new(ScriptedCodec {
            descriptor: CodecDescriptor::software("scripted", [MIME_VIDEO_AVC]),
            input: vec![0; 8],
            output: (0..16).collect(),
            outputs,
            calls,
        }));
        session.set_running(true);
        session.set_presentation_base_us(1_000);

        let pump = BufferPump {
            session,
            hooks: Arc::new(LogHooks::default()),
            queue: Arc::new(FrameQueue::new(4)),
            cancel: CancelToken::new(),
            clock: Arc::new(ManualClock::new(1_500)),
            metrics: EncoderMetrics::new("pump-test").unwrap(),
            input,
            idle_backoff: Duration::ZERO,
        };
        (pump, rx)
    }

    #[test]
    fn input_is_stamped_relative_to_base() {
        let (pump, calls) = pump(vec![]);
        pump.queue.push(Frame::new(vec![1, 2, 3])).unwrap();

        pump.input_available(0).unwrap();

        assert_eq!(calls.try_recv().unwrap(), "queue 0 0 3 500");
        assert_eq!(pump.metrics.input_buffers_queued.get(), 1);
    }

    #[test]
    fn oversized_frame_returns_empty_slot() {
        let (pump, calls) = pump(vec![]);
        pump.queue.push(Frame::new(vec![0; 9])).unwrap();

        let err = pump.input_available(0).unwrap_err();

        assert_eq!(
            err,
            CodecError::BufferOverflow {
                size: 9,
                capacity: 8
            }
        );
        assert_eq!(calls.try_recv().unwrap(), "queue 0 0 0 500");
        assert_eq!(pump.metrics.inputs_dropped.get(), 1);
    }

    #[test]
    fn interrupted_input_queues_nothing() {
        let (pump, calls) = pump(vec![]);
        pump.queue.close();
        pump.cancel.cancel();

        pump.input_available(0).unwrap();

        assert!(calls.try_recv().is_err());
        assert!(pump.cancel.is_cancelled());
    }

    #[test]
    fn output_checked_sent_then_released() {
        let info = BufferInfo {
            offset: 2,
            size: 4,
            ..Default::default()
        };
        let (pump, calls) = pump(vec![]);
        pump.format_changed(MediaFormat::video(MIME_VIDEO_AVC, 16, 16));

        pump.output_available(3, &info).unwrap();

        assert_eq!(
            *pump.hooks.log.lock(),
            vec!["format video/avc", "check 4", "send 4 video/avc"]
        );
        assert_eq!(calls.try_recv().unwrap(), "release 3");
        assert!(calls.try_recv().is_err());
        assert_eq!(pump.metrics.output_bytes.get(), 4);
    }

    #[test]
    fn invalid_range_is_still_released() {
        let info = BufferInfo {
            offset: 10,
            size: 10,
            ..Default::default()
        };
        let (pump, calls) = pump(vec![]);

        assert!(pump.output_available(1, &info).is_err());

        assert!(pump.hooks.log.lock().is_empty());
        assert_eq!(calls.try_recv().unwrap(), "release 1");
    }

    #[test]
    fn poll_drains_all_output() {
        let info = BufferInfo {
            size: 2,
            ..Default::default()
        };
        let (pump, calls) = pump(vec![
            OutputEvent::FormatChanged(MediaFormat::video(MIME_VIDEO_AVC, 16, 16)),
            OutputEvent::Ready(0, info),
            OutputEvent::Ready(1, info),
        ]);
        pump.queue.push(Frame::new(vec![5])).unwrap();

        assert!(pump.poll_once().unwrap());

        let calls: Vec<_> = calls.try_iter().collect();
        assert_eq!(calls, vec!["queue 0 0 1 500", "release 0", "release 1"]);
        assert_eq!(pump.hooks.log.lock().len(), 5);
    }

    #[test]
    fn released_codec_is_reported_not_fatal() {
        let (pump, _calls) = pump(vec![]);
        pump.session.release();

        assert!(pump.poll_once().is_err());
        pump.handle_event(CodecEvent::OutputAvailable(0, BufferInfo::default()));
        assert_eq!(pump.metrics.codec_errors.get(), 1);
    }

    #[test]
    fn format_change_mid_stream() {
        let info = BufferInfo {
            size: 2,
            ..Default::default()
        };
        let (pump, calls) = pump_with(
            InputMode::External,
            vec![
                OutputEvent::FormatChanged(MediaFormat::video(MIME_VIDEO_AVC, 16, 16)),
                OutputEvent::Ready(0, info),
                OutputEvent::FormatChanged(MediaFormat::video(MIME_VIDEO_HEVC, 32, 32)),
                OutputEvent::Ready(1, info),
            ],
        );

        assert!(pump.poll_once().unwrap());

        assert_eq!(
            *pump.hooks.log.lock(),
            vec![
                "format video/avc",
                "check 2",
                "send 2 video/avc",
                "format video/hevc",
                "check 2",
                "send 2 video/hevc",
            ]
        );
        assert_eq!(pump.session.output_format().map(|f| f.width), Some(Some(32)));
        assert_eq!(calls.try_iter().collect::<Vec<_>>(), vec!["release 0", "release 1"]);
    }

    #[test]
    fn codec_error_event_keeps_session_alive() {
        let info = BufferInfo {
            size: 2,
            ..Default::default()
        };
        let (pump, calls) = pump(vec![]);

        pump.handle_event(CodecEvent::Error(CodecError::Hardware {
            code: -3,
            message: "transient".into(),
        }));
        assert_eq!(pump.metrics.codec_errors.get(), 1);
        assert!(pump.session.is_running());
        assert!(pump.session.has_codec());

        pump.handle_event(CodecEvent::OutputAvailable(5, info));
        assert_eq!(pump.hooks.log.lock().len(), 2);
        assert_eq!(calls.try_recv().unwrap(), "release 5");
        assert_eq!(pump.metrics.codec_errors.get(), 1);
    }

    #[test]
    fn output_after_cancel_is_released_undelivered() {
        let info = BufferInfo {
            size: 2,
            ..Default::default()
        };
        let (pump, calls) = pump(vec![]);
        pump.cancel.cancel();

        pump.handle_event(CodecEvent::OutputAvailable(2, info));

        assert!(pump.hooks.log.lock().is_empty());
        assert_eq!(calls.try_recv().unwrap(), "release 2");
        assert_eq!(pump.metrics.output_buffers_delivered.get(), 0);
        assert_eq!(pump.metrics.codec_errors.get(), 0);
    }

    #[test]
    fn external_input_only_pumps_output() {
        let info = BufferInfo {
            size: 2,
            ..Default::default()
        };
        let (pump, calls) = pump_with(InputMode::External, vec![OutputEvent::Ready(0, info)]);
        pump.queue.push(Frame::new(vec![5])).unwrap();

        pump.handle_event(CodecEvent::InputAvailable(1));
        assert!(pump.poll_once().unwrap());
        assert!(!pump.poll_once().unwrap());

        let calls: Vec<_> = calls.try_iter().collect();
        assert_eq!(calls, vec!["release 0"]);
        assert_eq!(pump.queue.len(), 1);
        assert_eq!(pump.metrics.input_buffers_queued.get(), 0);
    }
}
