use std::sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{
    codec::{Codec, MediaFormat},
    error::CodecError,
};

/// The codec handle and the per-session state shared between the encoder and
/// its worker thread.
///
/// The handle is present only between a successful open and the matching
/// release. Every codec call goes through [`with_codec`](Self::with_codec), so
/// a worker that races a stop observes `IllegalState` instead of a dangling
/// handle.
pub(crate) struct CodecSession {
    codec: Mutex<Option<Box<dyn Codec>>>,
    running: AtomicBool,
    presentation_base_us: AtomicI64,
    output_format: Mutex<Option<Arc<MediaFormat>>>,
}

impl CodecSession {
    pub fn new() -> Self {
        Self {
            codec: Mutex::new(None),
            running: AtomicBool::new(false),
            presentation_base_us: AtomicI64::new(0),
            output_format: Mutex::new(None),
        }
    }

    pub fn install(&self, codec: Box<dyn Codec>) {
        *self.output_format.lock() = None;
        *self.codec.lock() = Some(codec);
    }

    pub fn with_codec<T>(
        &self,
        f: impl FnOnce(&mut dyn Codec) -> Result<T, CodecError>,
    ) -> Result<T, CodecError> {
        let mut guard = self.codec.lock();
        match guard.as_mut() {
            Some(codec) => f(codec.as_mut()),
            None => Err(CodecError::IllegalState("codec released")),
        }
    }

    /// Wait for any codec call in flight on another thread to return.
    pub fn barrier(&self) {
        drop(self.codec.lock());
    }

    pub fn has_codec(&self) -> bool {
        self.codec.lock().is_some()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn presentation_base_us(&self) -> i64 {
        self.presentation_base_us.load(Ordering::SeqCst)
    }

    pub fn set_presentation_base_us(&self, base: i64) {
        self.presentation_base_us.store(base, Ordering::SeqCst);
    }

    pub fn output_format(&self) -> Option<Arc<MediaFormat>> {
        self.output_format.lock().clone()
    }

    pub fn set_output_format(&self, format: MediaFormat) -> Arc<MediaFormat> {
        let format = Arc::new(format);
        *self.output_format.lock() = Some(format.clone());
        format
    }

    /// Stop and release the codec if one is installed.
    ///
    /// Failures are logged and swallowed; the handle is gone afterwards either way.
    pub fn release(&self) {
        let codec = self.codec.lock().take();
        *self.output_format.lock() = None;

        let Some(mut codec) = codec else {
            return;
        };

        let name = codec.descriptor().name.clone();
        if let Err(e) = codec.stop() {
            tracing::error!(?e, codec = %name, "Failed to stop codec");
        }
        if let Err(e) = codec.release() {
            tracing::error!(?e, codec = %name, "Failed to release codec");
        }
        tracing::debug!(codec = %name, "Codec released");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        codec::{CodecProvider, MediaFormat, MIME_VIDEO_AVC},
        loopback::LoopbackProvider,
    };

    fn open() -> Box<dyn Codec> {
        let provider = LoopbackProvider::default();
        let descriptor = provider.encoders(MIME_VIDEO_AVC).remove(0);
        provider
            .open(&descriptor, &MediaFormat::video(MIME_VIDEO_AVC, 16, 16))
            .unwrap()
    }

    #[test]
    fn released_session_rejects_calls() {
        let session = CodecSession::new();
        assert_eq!(
            session.with_codec(|c| c.start()),
            Err(CodecError::IllegalState("codec released"))
        );

        session.install(open());
        assert!(session.has_codec());
        session.with_codec(|c| c.start()).unwrap();

        session.release();
        assert!(!session.has_codec());
        assert!(session.with_codec(|c| c.dequeue_input_buffer()).is_err());

        // Second release is a no-op.
        session.release();
    }

    #[test]
    fn release_clears_output_format() {
        let session = CodecSession::new();
        session.install(open());
        session.set_output_format(MediaFormat::video(MIME_VIDEO_AVC, 16, 16));
        assert!(session.output_format().is_some());
        session.release();
        assert!(session.output_format().is_none());
    }
}
