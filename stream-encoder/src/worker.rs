use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam::channel::{self, Sender};

use crate::codec::{CodecEvent, CodecNotifier};

/// Work items executed on the encoder thread.
#[derive(Debug)]
pub(crate) enum Task {
    Event(CodecEvent),
    /// Run the polling loop until the session is cancelled.
    Poll,
}

enum Message {
    Task(Task),
    Quit,
}

/// A dedicated thread draining a FIFO of [`Task`]s.
pub(crate) struct Worker {
    tx: Sender<Message>,
    discard: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(
        name: &str,
        mut handler: impl FnMut(Task) + Send + 'static,
    ) -> std::io::Result<Self> {
        let (tx, rx) = channel::unbounded::<Message>();
        let discard = Arc::new(AtomicBool::new(false));

        let thread_discard = discard.clone();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                for message in rx.iter() {
                    match message {
                        Message::Task(task) => {
                            if !thread_discard.load(Ordering::SeqCst) {
                                handler(task);
                            }
                        }
                        Message::Quit => break,
                    }
                }
                tracing::trace!("Encoder thread exited");
            })?;

        Ok(Self {
            tx,
            discard,
            handle: Some(handle),
        })
    }

    pub fn post(&self, task: Task) -> bool {
        self.tx.send(Message::Task(task)).is_ok()
    }

    /// Sink for codec callbacks; events land behind everything already posted.
    pub fn notifier(&self) -> CodecNotifier {
        let tx = self.tx.clone();
        CodecNotifier::new(move |event| tx.send(Message::Task(Task::Event(event))).is_ok())
    }

    /// Finish the tasks already posted, then exit and join the thread.
    ///
    /// Falls back to [`quit`](Self::quit) if the thread can no longer be reached.
    pub fn quit_safely(mut self) {
        if self.tx.send(Message::Quit).is_err() {
            tracing::warn!("Safe quit failed, quitting immediately");
            self.discard.store(true, Ordering::SeqCst);
        }
        self.join();
    }

    /// Drop pending tasks, exit after the current one and join the thread.
    pub fn quit(mut self) {
        self.discard.store(true, Ordering::SeqCst);
        let _ = self.tx.send(Message::Quit);
        self.join();
    }

    fn join(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        // Stopping from inside a hook runs on this very thread.
        if handle.thread().id() == thread::current().id() {
            tracing::debug!("Encoder thread quitting itself, not joining");
            return;
        }

        if handle.join().is_err() {
            tracing::error!("Encoder thread panicked");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.discard.store(true, Ordering::SeqCst);
            let _ = self.tx.send(Message::Quit);
            self.join();
        }
    }
}
