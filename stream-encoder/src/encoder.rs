use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{
    clock::{Clock, MonotonicClock},
    codec::{
        select_codec, CodecDescriptor, CodecProvider, EncodedBuffer, MediaFormat, SelectionPolicy,
    },
    config::{EncoderConfig, ExecutionMode, InputMode},
    error::{Error, Result},
    frame::{CancelToken, Frame, FrameQueue, Interrupted, PushError, TryPushError},
    metrics::EncoderMetrics,
    pump::BufferPump,
    session::CodecSession,
    worker::{Task, Worker},
};

/// The per-kind behavior plugged into an [`Encoder`].
///
/// Every method except [`stop_imp`](Self::stop_imp) runs on the encoder
/// thread. [`check_buffer`](Self::check_buffer), [`send_buffer`](Self::send_buffer)
/// and [`format_changed`](Self::format_changed) are called while the codec is
/// locked and must not call [`Encoder::stop`].
pub trait EncoderHooks: Send + Sync + 'static {
    /// Pick the codec to open out of every unit that can produce `mime`.
    fn choose_encoder(
        &self,
        mime: &str,
        policy: SelectionPolicy,
        candidates: &[CodecDescriptor],
    ) -> Option<CodecDescriptor> {
        select_codec(candidates, mime, policy).cloned()
    }

    /// Block until the next raw frame is available.
    ///
    /// Must return [`Interrupted`] promptly once `cancel` is cancelled.
    fn get_input_frame(
        &self,
        queue: &FrameQueue,
        cancel: &CancelToken,
    ) -> std::result::Result<Frame, Interrupted> {
        queue.take_with(cancel)
    }

    /// Inspect an encoded buffer before it is sent.
    fn check_buffer(&self, buffer: &EncodedBuffer<'_>);

    fn send_buffer(&self, buffer: &EncodedBuffer<'_>);

    fn format_changed(&self, format: &MediaFormat);

    /// Kind-specific teardown, run on the stopping thread before the encoder
    /// thread is quiesced.
    fn stop_imp(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EncoderState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl EncoderState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => EncoderState::Starting,
            2 => EncoderState::Running,
            3 => EncoderState::Stopping,
            _ => EncoderState::Stopped,
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    worker: Option<Worker>,
    token: Option<CancelToken>,
}

/// Drives one codec session on a dedicated thread.
///
/// Frames pushed with [`queue_frame`](Self::queue_frame) are encoded while
/// the encoder is running and handed to `H`. The frame queue only accepts
/// frames while the encoder is running with [`InputMode::Buffer`]. Outputs
/// still pending when a stop begins are released without reaching `H`.
pub struct Encoder<H: EncoderHooks> {
    config: EncoderConfig,
    provider: Arc<dyn CodecProvider>,
    hooks: Arc<H>,
    queue: Arc<FrameQueue>,
    session: Arc<CodecSession>,
    clock: Arc<dyn Clock>,
    metrics: EncoderMetrics,
    policy: Mutex<SelectionPolicy>,
    state: AtomicU8,
    lifecycle: Mutex<Lifecycle>,
}

impl<H: EncoderHooks> Encoder<H> {
    pub fn new(config: EncoderConfig, provider: Arc<dyn CodecProvider>, hooks: H) -> Result<Self> {
        config.validate()?;

        let queue = FrameQueue::new(config.queue_capacity);
        queue.close();

        let metrics = EncoderMetrics::new(&config.name)?;

        Ok(Self {
            policy: Mutex::new(config.selection_policy),
            provider,
            hooks: Arc::new(hooks),
            queue: Arc::new(queue),
            session: Arc::new(CodecSession::new()),
            clock: Arc::new(MonotonicClock),
            metrics,
            state: AtomicU8::new(EncoderState::Stopped as u8),
            lifecycle: Mutex::new(Lifecycle::default()),
            config,
        })
    }

    /// Replace the clock presentation timestamps are derived from.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn metrics(&self) -> &EncoderMetrics {
        &self.metrics
    }

    pub fn frame_queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }

    pub fn state(&self) -> EncoderState {
        EncoderState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: EncoderState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.state() == EncoderState::Running
    }

    /// Whether a codec handle is currently installed.
    pub fn has_codec(&self) -> bool {
        self.session.has_codec()
    }

    pub fn presentation_base_us(&self) -> i64 {
        self.session.presentation_base_us()
    }

    pub fn selection_policy(&self) -> SelectionPolicy {
        *self.policy.lock()
    }

    /// Takes effect on the next start.
    pub fn set_selection_policy(&self, policy: SelectionPolicy) {
        *self.policy.lock() = policy;
    }

    /// Start a fresh session with timestamps counted from now.
    pub fn start(&self) -> Result<()> {
        self.start_session(true)
    }

    /// Start a session that continues the previous session's timestamps.
    pub fn restart(&self) -> Result<()> {
        self.start_session(false)
    }

    fn start_session(&self, reset_timestamps: bool) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if self.state() != EncoderState::Stopped {
            return Err(Error::AlreadyStarted);
        }

        // The codec is allocated before the encoder counts as starting.
        let callbacks = match self.open_codec() {
            Ok(callbacks) => callbacks,
            Err(e) => {
                tracing::error!(?e, encoder = %self.config.name, "Failed to open codec");
                return Err(e);
            }
        };

        self.set_state(EncoderState::Starting);
        match self.launch(&mut lifecycle, reset_timestamps, callbacks) {
            Ok(()) => {
                self.set_state(EncoderState::Running);
                tracing::info!(
                    encoder = %self.config.name,
                    base_us = self.session.presentation_base_us(),
                    "Encoder started"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(?e, encoder = %self.config.name, "Failed to start encoder");
                self.teardown(&mut lifecycle);
                self.set_state(EncoderState::Stopped);
                Err(e)
            }
        }
    }

    /// Choose, open and install a codec. Returns whether it will run in callback mode.
    fn open_codec(&self) -> Result<bool> {
        let format = &self.config.format;
        let policy = self.selection_policy();

        let candidates = self.provider.encoders(&format.mime);
        let descriptor = self
            .hooks
            .choose_encoder(&format.mime, policy, &candidates)
            .ok_or_else(|| Error::NoCompatibleCodec {
                mime: format.mime.clone(),
                policy,
            })?;
        tracing::info!(codec = %descriptor.name, kind = ?descriptor.kind, "Opening codec");

        let codec = self.provider.open(&descriptor, format)?;
        let callbacks = match self.config.execution {
            ExecutionMode::Auto => codec.supports_callbacks(),
            ExecutionMode::Callback if !codec.supports_callbacks() => {
                tracing::warn!(
                    codec = %descriptor.name,
                    "Codec has no callback support, polling instead"
                );
                false
            }
            ExecutionMode::Callback => true,
            ExecutionMode::Polling => false,
        };
        self.session.install(codec);

        Ok(callbacks)
    }

    fn launch(
        &self,
        lifecycle: &mut Lifecycle,
        reset_timestamps: bool,
        callbacks: bool,
    ) -> Result<()> {
        let token = CancelToken::new();
        if self.config.input == InputMode::Buffer {
            self.queue.open(token.clone());
        }
        lifecycle.token = Some(token.clone());

        let pump = BufferPump {
            session: self.session.clone(),
            hooks: self.hooks.clone(),
            queue: self.queue.clone(),
            cancel: token,
            clock: self.clock.clone(),
            metrics: self.metrics.clone(),
            input: self.config.input,
            idle_backoff: self.config.idle_backoff(),
        };
        let worker = Worker::spawn(&self.config.name, move |task| pump.handle(task))
            .map_err(Error::Spawn)?;

        if callbacks {
            let notifier = worker.notifier();
            self.session.with_codec(|c| c.set_notifier(Some(notifier)))?;
        }
        let worker = lifecycle.worker.insert(worker);

        if reset_timestamps {
            self.session.set_presentation_base_us(self.clock.now_us());
        }
        self.session.set_running(true);
        self.session.with_codec(|c| c.start())?;

        if !callbacks {
            worker.post(Task::Poll);
        }
        tracing::debug!(callbacks, "Encoder thread running");

        Ok(())
    }

    /// Stop the session and release the codec. Safe to call in any state.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if self.state() == EncoderState::Stopped {
            self.queue.clear();
            return;
        }

        self.set_state(EncoderState::Stopping);
        self.teardown(&mut lifecycle);
        self.set_state(EncoderState::Stopped);
        tracing::info!(encoder = %self.config.name, "Encoder stopped");
    }

    fn teardown(&self, lifecycle: &mut Lifecycle) {
        self.session.set_running(false);
        if let Some(token) = lifecycle.token.take() {
            token.cancel();
        }
        self.queue.close();

        // Deliveries check the token under the codec lock, so none can reach
        // the hooks once this returns.
        self.session.barrier();
        self.hooks.stop_imp();

        if let Some(worker) = lifecycle.worker.take() {
            worker.quit_safely();
        }

        let dropped = self.queue.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "Discarded queued frames");
        }

        self.session.release();
    }

    /// Push a raw frame, blocking while the queue is full.
    ///
    /// Fails with the frame handed back once the encoder stops.
    pub fn queue_frame(&self, frame: Frame) -> std::result::Result<(), PushError> {
        self.queue.push(frame)?;
        self.metrics.frames_queued.inc();
        Ok(())
    }

    /// Push a raw frame unless the queue is full or closed.
    pub fn try_queue_frame(&self, frame: Frame) -> std::result::Result<(), TryPushError> {
        self.queue.try_push(frame)?;
        self.metrics.frames_queued.inc();
        Ok(())
    }
}

impl<H: EncoderHooks> Drop for Encoder<H> {
    fn drop(&mut self) {
        self.stop();
    }
}
