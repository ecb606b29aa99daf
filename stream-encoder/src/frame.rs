use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use crossbeam::channel::{self, select, Receiver, Select, Sender, TrySendError};
use parking_lot::Mutex;

/// One unit of raw input media.
///
/// The payload is shared, so cloning a frame does not copy pixel or sample data.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    data: Bytes,
    offset: usize,
    size: usize,
}

impl Frame {
    /// A frame covering the whole buffer.
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let size = data.len();
        Self {
            data,
            offset: 0,
            size,
        }
    }

    /// A frame covering `size` bytes of `data` starting at `offset`.
    ///
    /// Returns `None` if the range does not fit the buffer.
    pub fn with_range(data: impl Into<Bytes>, offset: usize, size: usize) -> Option<Self> {
        let data = data.into();
        let end = offset.checked_add(size)?;
        if end > data.len() {
            return None;
        }
        Some(Self { data, offset, size })
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The bytes that should be handed to the codec.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.size]
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

/// Returned by a blocking frame acquisition that was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Frame acquisition interrupted")]
pub struct Interrupted;

/// The queue was closed; the frame is handed back.
#[derive(Debug, thiserror::Error)]
#[error("Frame queue closed")]
pub struct PushError(pub Frame);

impl PushError {
    pub fn into_inner(self) -> Frame {
        self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TryPushError {
    #[error("Frame queue full")]
    Full(Frame),
    #[error("Frame queue closed")]
    Closed(Frame),
}

impl TryPushError {
    pub fn into_inner(self) -> Frame {
        match self {
            TryPushError::Full(frame) | TryPushError::Closed(frame) => frame,
        }
    }
}

#[derive(Debug)]
struct TokenInner {
    cancelled: AtomicBool,
    /// Dropped on cancel so that every blocked `signal` receiver wakes up.
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

/// Cooperative cancellation shared between the encoder, its worker thread and
/// every blocking wait on the frame queue.
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<TokenInner>);

impl CancelToken {
    pub fn new() -> Self {
        let (trigger, signal) = channel::bounded(0);
        Self(Arc::new(TokenInner {
            cancelled: AtomicBool::new(false),
            trigger: Mutex::new(Some(trigger)),
            signal,
        }))
    }

    /// Cancel the token. Idempotent.
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.trigger.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Becomes ready (disconnected) once the token is cancelled.
    pub(crate) fn signal(&self) -> &Receiver<()> {
        &self.0.signal
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded FIFO of raw frames between the producer and the encoder thread.
///
/// A full queue blocks the producer, an empty queue blocks the consumer, and
/// closing the queue wakes both. The queue outlives encoding sessions: it is
/// closed and drained on stop and reopened with a fresh token on start.
pub struct FrameQueue {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    capacity: usize,
    token: Mutex<CancelToken>,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = channel::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            token: Mutex::new(CancelToken::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// The token currently guarding blocking operations.
    pub fn token(&self) -> CancelToken {
        self.token.lock().clone()
    }

    /// Reopen the queue, guarded by `token` from now on.
    pub fn open(&self, token: CancelToken) {
        *self.token.lock() = token;
    }

    /// Cancel the current token, waking every blocked producer and consumer.
    ///
    /// Frames already queued stay queued until [`clear`](Self::clear).
    pub fn close(&self) {
        self.token.lock().cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.lock().is_cancelled()
    }

    /// Push a frame, blocking while the queue is full.
    pub fn push(&self, frame: Frame) -> Result<(), PushError> {
        let token = self.token();
        if token.is_cancelled() {
            return Err(PushError(frame));
        }

        let mut sel = Select::new();
        let send_index = sel.send(&self.tx);
        let cancel_index = sel.recv(token.signal());
        let oper = sel.select();

        match oper.index() {
            i if i == send_index => oper
                .send(&self.tx, frame)
                .map_err(|e| PushError(e.into_inner())),
            i if i == cancel_index => {
                let _ = oper.recv(token.signal());
                Err(PushError(frame))
            }
            _ => unreachable!(),
        }
    }

    /// Push a frame without blocking.
    pub fn try_push(&self, frame: Frame) -> Result<(), TryPushError> {
        if self.is_closed() {
            return Err(TryPushError::Closed(frame));
        }

        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(frame) => TryPushError::Full(frame),
            TrySendError::Disconnected(frame) => TryPushError::Closed(frame),
        })
    }

    /// Take the oldest frame, blocking until one arrives or the queue is closed.
    pub fn take(&self) -> Result<Frame, Interrupted> {
        let token = self.token();
        self.take_with(&token)
    }

    /// Like [`take`](Self::take), but interrupted by `cancel` instead of the
    /// queue's own token.
    pub fn take_with(&self, cancel: &CancelToken) -> Result<Frame, Interrupted> {
        if cancel.is_cancelled() {
            return Err(Interrupted);
        }

        select! {
            recv(self.rx) -> frame => frame.map_err(|_| Interrupted),
            recv(cancel.signal()) -> _ => Err(Interrupted),
        }
    }

    pub fn try_take(&self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Discard every queued frame, returning how many were dropped.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }
}

impl fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, thread, time::Duration};

    use crossbeam::channel::RecvTimeoutError;

    use super::*;

    fn frame(tag: u8) -> Frame {
        Frame::new(vec![tag; 4])
    }

    #[test]
    fn frame_range() {
        let frame = Frame::with_range(vec![1, 2, 3, 4, 5], 1, 3).unwrap();
        assert_eq!(frame.payload(), &[2, 3, 4]);
        assert_eq!(frame.offset(), 1);
        assert_eq!(frame.size(), 3);
        assert!(Frame::with_range(vec![1, 2, 3], 2, 2).is_none());
        assert!(Frame::with_range(vec![1, 2, 3], usize::MAX, 2).is_none());
    }

    #[test]
    fn fifo_order() {
        let queue = FrameQueue::new(8);
        for i in 0..5 {
            queue.push(frame(i)).unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.take().unwrap().payload()[0], i);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn full_queue_blocks_producer() {
        let queue = Arc::new(FrameQueue::new(80));
        for i in 0..80 {
            queue.push(frame(i)).unwrap();
        }
        assert_eq!(queue.len(), 80);

        let (done_tx, done_rx) = crossbeam::channel::bounded(1);
        let q = queue.clone();
        let producer = thread::spawn(move || {
            q.push(frame(80)).unwrap();
            done_tx.send(()).unwrap();
        });

        assert_eq!(
            done_rx.recv_timeout(Duration::from_millis(200)),
            Err(RecvTimeoutError::Timeout)
        );
        assert_eq!(queue.len(), 80);

        assert_eq!(queue.take().unwrap().payload()[0], 0);
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        producer.join().unwrap();
        assert_eq!(queue.len(), 80);
    }

    #[test]
    fn try_push_on_full_queue_returns_frame() {
        let queue = FrameQueue::new(1);
        queue.try_push(frame(1)).unwrap();
        match queue.try_push(frame(2)) {
            Err(TryPushError::Full(f)) => assert_eq!(f.payload()[0], 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let queue = Arc::new(FrameQueue::new(4));
        let q = queue.clone();
        let consumer = thread::spawn(move || q.take());

        thread::sleep(Duration::from_millis(50));
        queue.close();

        assert_eq!(consumer.join().unwrap().unwrap_err(), Interrupted);
    }

    #[test]
    fn close_wakes_blocked_producer() {
        let queue = Arc::new(FrameQueue::new(1));
        queue.push(frame(0)).unwrap();

        let q = queue.clone();
        let producer = thread::spawn(move || q.push(frame(1)));

        thread::sleep(Duration::from_millis(50));
        queue.close();

        let rejected = producer.join().unwrap().unwrap_err().into_inner();
        assert_eq!(rejected.payload()[0], 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn closed_queue_rejects_then_reopens() {
        let queue = FrameQueue::new(4);
        queue.push(frame(0)).unwrap();
        queue.close();

        assert!(queue.push(frame(1)).is_err());
        assert!(matches!(
            queue.try_push(frame(1)),
            Err(TryPushError::Closed(_))
        ));
        assert_eq!(queue.take(), Err(Interrupted));
        assert_eq!(queue.clear(), 1);

        queue.open(CancelToken::new());
        queue.push(frame(2)).unwrap();
        assert_eq!(queue.take().unwrap().payload()[0], 2);
    }

    #[test]
    fn take_with_external_token() {
        let queue = FrameQueue::new(4);
        let token = CancelToken::new();
        queue.push(frame(7)).unwrap();
        assert_eq!(queue.take_with(&token).unwrap().payload()[0], 7);
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(queue.take_with(&token), Err(Interrupted));
    }
}
