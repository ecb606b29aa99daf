use std::sync::Arc;

use crate::{
    codec::{EncodedBuffer, MediaFormat},
    video::ParameterSets,
};

/// Where the stock video and audio hooks deliver encoded output.
///
/// Called on the encoder thread with the codec locked; implementations
/// should copy what they need and return quickly.
pub trait EncodedSink: Send + Sync + 'static {
    fn on_format(&self, _format: &MediaFormat) {}

    /// H.264 SPS/PPS, reported once per session.
    fn on_parameter_sets(&self, _sets: &ParameterSets) {}

    /// AudioSpecificConfig or equivalent, reported once per session.
    fn on_audio_config(&self, _config: &[u8]) {}

    fn on_data(&self, buffer: &EncodedBuffer<'_>);
}

impl<S: EncodedSink + ?Sized> EncodedSink for Arc<S> {
    fn on_format(&self, format: &MediaFormat) {
        (**self).on_format(format)
    }

    fn on_parameter_sets(&self, sets: &ParameterSets) {
        (**self).on_parameter_sets(sets)
    }

    fn on_audio_config(&self, config: &[u8]) {
        (**self).on_audio_config(config)
    }

    fn on_data(&self, buffer: &EncodedBuffer<'_>) {
        (**self).on_data(buffer)
    }
}
