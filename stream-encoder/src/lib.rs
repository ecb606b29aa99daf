//! Driver for hardware-style streaming encoders.
//!
//! An [`Encoder`] owns one codec session, one bounded [`FrameQueue`] and one
//! dedicated worker thread. Raw frames flow from the queue into the codec and
//! encoded buffers flow out to the [`EncoderHooks`] implementation, whether
//! the codec pushes availability events or has to be polled.

pub mod audio;
pub mod clock;
pub mod codec;
pub mod config;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod loopback;
pub mod metrics;
pub mod sink;
pub mod video;

mod pump;
mod session;
mod worker;

pub use audio::AudioHooks;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use codec::{
    select_codec, BufferFlags, BufferInfo, Codec, CodecDescriptor, CodecEvent, CodecKind,
    CodecNotifier, CodecProvider, EncodedBuffer, MediaFormat, OutputEvent, SelectionPolicy,
};
pub use config::{EncoderConfig, ExecutionMode, InputMode};
pub use encoder::{Encoder, EncoderHooks, EncoderState};
pub use error::{CodecError, Error, Result};
pub use frame::{CancelToken, Frame, FrameQueue, Interrupted, PushError, TryPushError};
pub use loopback::{LoopbackOptions, LoopbackProvider, LoopbackStats};
pub use metrics::EncoderMetrics;
pub use sink::EncodedSink;
pub use video::{ParameterSets, VideoHooks};
