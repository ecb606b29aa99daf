use std::{sync::Arc, thread::JoinHandle, time::Duration};

use bytes::Bytes;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use stream_encoder::{Encoder, EncoderHooks, Frame};

/// A moving diagonal gradient in NV12.
pub fn nv12_frame(width: u32, height: u32, index: u32) -> Bytes {
    let (w, h) = (width as usize, height as usize);
    let mut data = vec![0u8; w * h * 3 / 2];

    let (luma, chroma) = data.split_at_mut(w * h);
    for (y, row) in luma.chunks_exact_mut(w).enumerate() {
        for (x, px) in row.iter_mut().enumerate() {
            *px = (x + y + index as usize * 4) as u8;
        }
    }
    for (i, px) in chroma.iter_mut().enumerate() {
        *px = if i % 2 == 0 { 128 } else { (index * 2) as u8 };
    }

    data.into()
}

pub struct Producer {
    stop_tx: Sender<()>,
    handle: JoinHandle<u32>,
}

impl Producer {
    /// Feed `frames` synthetic frames into `encoder`, paced at the configured frame rate.
    pub fn spawn<H: EncoderHooks>(encoder: Arc<Encoder<H>>, frames: u32) -> Self {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);

        let handle = std::thread::spawn(move || {
            let format = &encoder.config().format;
            let (width, height) = (format.width.unwrap_or(320), format.height.unwrap_or(180));
            let frame_rate = format.frame_rate.unwrap_or(30).max(1);
            let interval = Duration::from_secs_f64(1.0 / frame_rate as f64);

            let mut sent = 0;
            while sent < frames {
                let frame = Frame::new(nv12_frame(width, height, sent));
                if let Err(e) = encoder.queue_frame(frame) {
                    tracing::info!(?e, "Producer stopped by encoder");
                    break;
                }
                sent += 1;

                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
            }
            sent
        });

        Self { stop_tx, handle }
    }

    /// Stop early and return how many frames were queued.
    pub fn finish(self) -> u32 {
        self.stop_tx.send(()).ok();
        self.join()
    }

    pub fn join(self) -> u32 {
        match self.handle.join() {
            Ok(sent) => sent,
            Err(_) => {
                tracing::error!("Producer thread panicked");
                0
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nv12_layout() {
        let frame = nv12_frame(4, 2, 1);
        assert_eq!(frame.len(), 12);
        assert_eq!(&frame[..4], &[4, 5, 6, 7]);
        assert_eq!(&frame[8..], &[128, 2, 128, 2]);
    }
}
