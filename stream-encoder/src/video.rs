use bytes::Bytes;
use memchr::memmem;
use parking_lot::Mutex;

use crate::{
    codec::{EncodedBuffer, MediaFormat},
    encoder::EncoderHooks,
    sink::EncodedSink,
};

const START_CODE: &[u8] = &[0, 0, 1];
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;

/// H.264 sequence and picture parameter sets, without start codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSets {
    pub sps: Bytes,
    pub pps: Bytes,
}

/// Iterator over the NAL units of an Annex-B byte stream.
pub struct NalUnits<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        loop {
            let rest = self.data.get(self.pos..)?;
            let begin = self.pos + memmem::find(rest, START_CODE)? + START_CODE.len();
            let end = memmem::find(&self.data[begin..], START_CODE)
                .map(|i| begin + i)
                .unwrap_or(self.data.len());
            self.pos = end;

            // Zeros before the next start code belong to it.
            let mut nal = &self.data[begin..end];
            while let [head @ .., 0] = nal {
                nal = head;
            }
            if !nal.is_empty() {
                return Some(nal);
            }
            if end == self.data.len() {
                return None;
            }
        }
    }
}

pub fn nal_units(data: &[u8]) -> NalUnits<'_> {
    NalUnits { data, pos: 0 }
}

pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1f)
}

/// Find the first SPS and PPS in an Annex-B buffer.
pub fn extract_parameter_sets(data: &[u8]) -> Option<ParameterSets> {
    let mut sps = None;
    let mut pps = None;
    for nal in nal_units(data) {
        match nal_type(nal) {
            Some(NAL_SPS) if sps.is_none() => sps = Some(nal),
            Some(NAL_PPS) if pps.is_none() => pps = Some(nal),
            _ => {}
        }
    }

    Some(ParameterSets {
        sps: Bytes::copy_from_slice(sps?),
        pps: Bytes::copy_from_slice(pps?),
    })
}

/// Parameter sets from `csd-0`/`csd-1`, with or without start codes.
pub fn parameter_sets_from_format(format: &MediaFormat) -> Option<ParameterSets> {
    let [sps, pps, ..] = format.codec_specific_data.as_slice() else {
        return None;
    };
    let sps = nal_units(sps).next().unwrap_or(sps.as_slice());
    let pps = nal_units(pps).next().unwrap_or(pps.as_slice());
    if nal_type(sps) != Some(NAL_SPS) || nal_type(pps) != Some(NAL_PPS) {
        return None;
    }

    Some(ParameterSets {
        sps: Bytes::copy_from_slice(sps),
        pps: Bytes::copy_from_slice(pps),
    })
}

/// Hooks for H.264 video encoders.
///
/// Parameter sets are taken from the first codec-config buffer, or from the
/// output format when the codec only reports them there, and handed to the
/// sink once per session. Codec-config buffers are not forwarded as data.
pub struct VideoHooks<S> {
    sink: S,
    parameter_sets: Mutex<Option<ParameterSets>>,
}

impl<S: EncodedSink> VideoHooks<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            parameter_sets: Mutex::new(None),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn parameter_sets(&self) -> Option<ParameterSets> {
        self.parameter_sets.lock().clone()
    }
}

impl<S: EncodedSink> EncoderHooks for VideoHooks<S> {
    fn check_buffer(&self, buffer: &EncodedBuffer<'_>) {
        let mut known = self.parameter_sets.lock();
        if known.is_some() {
            return;
        }

        let found = buffer
            .info()
            .is_codec_config()
            .then(|| extract_parameter_sets(buffer.data()))
            .flatten()
            .or_else(|| buffer.format().and_then(parameter_sets_from_format));

        if let Some(sets) = found {
            tracing::info!(sps = sets.sps.len(), pps = sets.pps.len(), "Obtained codec data");
            self.sink.on_parameter_sets(&sets);
            *known = Some(sets);
        }
    }

    fn send_buffer(&self, buffer: &EncodedBuffer<'_>) {
        if buffer.info().is_codec_config() {
            return;
        }
        self.sink.on_data(buffer);
    }

    fn format_changed(&self, format: &MediaFormat) {
        self.sink.on_format(format);
    }

    fn stop_imp(&self) {
        self.parameter_sets.lock().take();
    }
}
