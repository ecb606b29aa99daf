use std::path::PathBuf;

use anyhow::{Context, Result};
use stream_encoder::video::nal_units;
use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
    sync::{broadcast, watch},
};

use crate::sink::{CodecData, Sample};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Raw H.264 elementary stream, every NAL unit behind a four byte start code.
struct AnnexBWriter<W> {
    out: BufWriter<W>,
    nals: u64,
}

impl<W: AsyncWrite + Unpin> AnnexBWriter<W> {
    fn new(out: W) -> Self {
        Self {
            out: BufWriter::new(out),
            nals: 0,
        }
    }

    async fn write_nal(&mut self, nal: &[u8]) -> Result<()> {
        self.out.write_all(&START_CODE).await?;
        self.out.write_all(nal).await?;
        self.nals += 1;
        Ok(())
    }

    /// Re-emit every NAL unit of an Annex-B access unit.
    async fn write_access_unit(&mut self, data: &[u8]) -> Result<usize> {
        let mut count = 0;
        for nal in nal_units(data) {
            self.write_nal(nal).await?;
            count += 1;
        }
        Ok(count)
    }

    async fn finish(mut self) -> Result<u64> {
        self.out.flush().await?;
        Ok(self.nals)
    }
}

async fn codec_data(rx: &mut watch::Receiver<Option<CodecData>>) -> Result<CodecData> {
    loop {
        if let Some(data) = rx.borrow_and_update().clone() {
            return Ok(data);
        }
        rx.changed()
            .await
            .context("Encoder went away before reporting codec data")?;
    }
}

/// Write the parameter sets, then every sample until the encoder goes away.
///
/// Returns the number of samples written.
pub async fn run(
    path: PathBuf,
    mut samples: broadcast::Receiver<Sample>,
    mut codec_data_rx: watch::Receiver<Option<CodecData>>,
) -> Result<u64> {
    let file = File::create(&path)
        .await
        .with_context(|| format!("Creating {}", path.display()))?;
    let mut writer = AnnexBWriter::new(file);

    let CodecData::H264 { sps, pps } = codec_data(&mut codec_data_rx).await?;
    writer.write_nal(&sps).await?;
    writer.write_nal(&pps).await?;

    let (mut written, mut key_frames) = (0, 0);
    loop {
        match samples.recv().await {
            Ok(sample) => {
                if writer.write_access_unit(&sample.data).await? == 0 {
                    tracing::warn!(pts_us = sample.pts_us, "Sample without NAL units skipped");
                    continue;
                }
                written += 1;
                key_frames += u64::from(sample.key_frame);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(n, "Writer lagged, samples skipped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    let nals = writer.finish().await?;
    tracing::info!(path = %path.display(), nals, key_frames, "Elementary stream written");
    Ok(written)
}
