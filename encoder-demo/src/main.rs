use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use once_cell::sync::OnceCell;
use prometheus::{Encoder as _, Registry, TextEncoder};
use stream_encoder::{
    codec::MIME_VIDEO_AVC, loopback::LoopbackProvider, video::VideoHooks, Encoder, EncoderConfig,
    MediaFormat,
};
use tokio::sync::{broadcast, watch};
use tracing_subscriber::EnvFilter;

mod sink;
mod source;
mod writer;

use sink::BroadcastSink;
use source::Producer;

const FRAMES_PER_SESSION: u32 = 60;

pub static TOKIO_RUNTIME: OnceCell<tokio::runtime::Runtime> = OnceCell::new();

fn default_config() -> EncoderConfig {
    EncoderConfig {
        name: "video".to_owned(),
        format: MediaFormat::video(MIME_VIDEO_AVC, 320, 180)
            .with_frame_rate(30)
            .with_i_frame_interval(1),
        ..Default::default()
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => EncoderConfig::from_file(&path)?,
        None => default_config(),
    };
    let output = PathBuf::from(args.next().unwrap_or_else(|| "encoded.h264".to_owned()));

    let runtime = TOKIO_RUNTIME.get_or_try_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
    })?;

    let (data_tx, data_rx) = broadcast::channel(64);
    let (codec_data_tx, codec_data_rx) = watch::channel(None);
    let writer = runtime.spawn(async move {
        let result = writer::run(output, data_rx, codec_data_rx).await;
        if let Err(e) = &result {
            tracing::error!(?e, "Writer failed");
        }
        result
    });

    let provider = Arc::new(LoopbackProvider::default());
    let hooks = VideoHooks::new(BroadcastSink::new(data_tx, codec_data_tx));
    let encoder = Arc::new(Encoder::new(config, provider, hooks)?);

    let registry = Registry::new();
    encoder.metrics().register(&registry)?;

    encoder.start()?;
    let sent = Producer::spawn(encoder.clone(), FRAMES_PER_SESSION).join();
    tracing::info!(sent, "First session fed");
    encoder.stop();

    // Timestamps continue from the first session. This one is cut short.
    encoder.restart()?;
    let producer = Producer::spawn(encoder.clone(), FRAMES_PER_SESSION);
    std::thread::sleep(Duration::from_secs(1));
    let sent = producer.finish();
    tracing::info!(sent, base_us = encoder.presentation_base_us(), "Second session fed");
    encoder.stop();

    // Dropping the encoder closes the sample channel and lets the writer finish.
    drop(encoder);
    let written = runtime.block_on(writer)??;
    tracing::info!(written, "Samples written");

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    println!("{}", String::from_utf8_lossy(&buffer));

    Ok(())
}
