use prometheus::{core::Collector, IntCounter, Opts, Registry};

/// Counters for one encoder instance, labelled with `encoder=<name>`.
#[derive(Debug, Clone)]
pub struct EncoderMetrics {
    pub frames_queued: IntCounter,
    pub input_buffers_queued: IntCounter,
    pub inputs_dropped: IntCounter,
    pub output_buffers_delivered: IntCounter,
    pub output_bytes: IntCounter,
    pub codec_errors: IntCounter,
}

fn counter(encoder: &str, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    IntCounter::with_opts(Opts::new(name, help).const_label("encoder", encoder))
}

impl EncoderMetrics {
    pub fn new(encoder: &str) -> prometheus::Result<Self> {
        Ok(Self {
            frames_queued: counter(
                encoder,
                "encoder_frames_queued",
                "Raw frames accepted into the frame queue",
            )?,
            input_buffers_queued: counter(
                encoder,
                "encoder_input_buffers_queued",
                "Input buffers handed to the codec",
            )?,
            inputs_dropped: counter(
                encoder,
                "encoder_inputs_dropped",
                "Frames dropped because they did not fit an input buffer",
            )?,
            output_buffers_delivered: counter(
                encoder,
                "encoder_output_buffers_delivered",
                "Encoded buffers delivered to the sink",
            )?,
            output_bytes: counter(
                encoder,
                "encoder_output_bytes",
                "Encoded bytes delivered to the sink",
            )?,
            codec_errors: counter(
                encoder,
                "encoder_codec_errors",
                "Codec errors observed while pumping buffers",
            )?,
        })
    }

    fn collectors(&self) -> [&IntCounter; 6] {
        [
            &self.frames_queued,
            &self.input_buffers_queued,
            &self.inputs_dropped,
            &self.output_buffers_delivered,
            &self.output_bytes,
            &self.codec_errors,
        ]
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        for c in self.collectors() {
            registry.register(Box::new(c.clone()))?;
        }
        Ok(())
    }

    pub fn unregister(&self, registry: &Registry) {
        for c in self.collectors() {
            let _ = registry.unregister(Box::new(c.clone()) as Box<dyn Collector>);
        }
    }
}
