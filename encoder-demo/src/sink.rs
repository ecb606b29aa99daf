use bytes::Bytes;
use stream_encoder::{video::ParameterSets, EncodedBuffer, EncodedSink, MediaFormat};
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone)]
pub struct Sample {
    pub data: Bytes,
    pub pts_us: i64,
    pub key_frame: bool,
}

#[derive(Debug, Clone)]
pub enum CodecData {
    H264 { sps: Bytes, pps: Bytes },
}

/// Fans encoded output out to async consumers.
pub struct BroadcastSink {
    data_tx: broadcast::Sender<Sample>,
    codec_data_tx: watch::Sender<Option<CodecData>>,
}

impl BroadcastSink {
    pub fn new(
        data_tx: broadcast::Sender<Sample>,
        codec_data_tx: watch::Sender<Option<CodecData>>,
    ) -> Self {
        Self {
            data_tx,
            codec_data_tx,
        }
    }
}

impl EncodedSink for BroadcastSink {
    fn on_format(&self, format: &MediaFormat) {
        tracing::info!(
            mime = %format.mime,
            width = ?format.width,
            height = ?format.height,
            "Encoder output format"
        );
    }

    fn on_parameter_sets(&self, sets: &ParameterSets) {
        self.codec_data_tx.send_replace(Some(CodecData::H264 {
            sps: sets.sps.clone(),
            pps: sets.pps.clone(),
        }));
    }

    fn on_data(&self, buffer: &EncodedBuffer<'_>) {
        let sample = Sample {
            data: Bytes::copy_from_slice(buffer.data()),
            pts_us: buffer.presentation_time_us(),
            key_frame: buffer.info().is_key_frame(),
        };
        // No subscriber is not an error.
        self.data_tx.send(sample).ok();
    }
}
