//! Async I/O dispatcher
//!
//! A small thread pool that runs blocking filesystem calls off the control
//! thread. The control thread submits [`Request`]s and later pops
//! [`Completion`]s; nothing else is shared. Workers never touch engine
//! state, so the engine's bookkeeping needs no locks.
//!
//! ```text
//! control thread ──Request──► [crossbeam channel] ──► walker-io-N threads
//!        ▲                                                   │
//!        └───────────Completion── [crossbeam channel] ◄──────┘
//! ```

use crate::error::WorkerError;
use crate::fs::dir::{close_fd, Dir};
use crate::fs::{stat_at, Stat, StatFlags};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};

/// In-flight requests allowed per worker thread
const DEPTH_PER_THREAD: usize = 64;

/// An operation for a worker to perform
#[derive(Debug)]
pub(crate) enum Request<T> {
    /// Open a directory stream at `dirfd`/`path`
    OpenDir { tag: T, dirfd: RawFd, path: CString },
    /// Stat `dirfd`/`path` into `buf`
    Stat {
        tag: T,
        dirfd: RawFd,
        path: CString,
        flags: StatFlags,
        buf: Box<Stat>,
    },
    /// Close a bare descriptor
    Close { fd: RawFd },
    /// Close a directory stream
    CloseDir { dir: Dir },
}

/// The result of a [`Request`]
#[derive(Debug)]
pub(crate) enum Completion<T> {
    OpenDir {
        tag: T,
        result: Result<Dir, i32>,
    },
    Stat {
        tag: T,
        flags: StatFlags,
        buf: Box<Stat>,
        result: Result<(), i32>,
    },
    Close {
        result: Result<(), i32>,
    },
    CloseDir {
        result: Result<(), i32>,
    },
}

fn errno_of(err: std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

fn service<T>(request: Request<T>, cancelled: &AtomicBool) -> Completion<T> {
    match request {
        Request::OpenDir { tag, dirfd, path } => {
            let result = if cancelled.load(Ordering::Relaxed) {
                Err(libc::ECANCELED)
            } else {
                Dir::open(dirfd, &path).map_err(errno_of)
            };
            Completion::OpenDir { tag, result }
        }
        Request::Stat {
            tag,
            dirfd,
            path,
            flags,
            mut buf,
        } => {
            let result = if cancelled.load(Ordering::Relaxed) {
                Err(libc::ECANCELED)
            } else {
                stat_at(dirfd, Some(&path), flags)
                    .map(|st| *buf = st)
                    .map_err(errno_of)
            };
            Completion::Stat {
                tag,
                flags,
                buf,
                result,
            }
        }
        // Closes always run, even after cancellation
        Request::Close { fd } => Completion::Close {
            result: close_fd(fd).map_err(errno_of),
        },
        Request::CloseDir { dir } => Completion::CloseDir {
            result: dir.close().map_err(errno_of),
        },
    }
}

/// Thread pool running filesystem requests
pub(crate) struct AsyncDispatcher<T> {
    requests: Option<Sender<Request<T>>>,
    completions: Receiver<Completion<T>>,
    workers: Vec<(usize, JoinHandle<()>)>,
    cancelled: Arc<AtomicBool>,
    /// Submitted and not yet popped
    pending: usize,
    depth: usize,
}

impl<T: Send + 'static> AsyncDispatcher<T> {
    /// Start `threads` workers
    pub fn new(threads: usize) -> Result<Self, WorkerError> {
        let (req_tx, req_rx) = unbounded::<Request<T>>();
        let (done_tx, done_rx) = unbounded::<Completion<T>>();
        let cancelled = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let rx = req_rx.clone();
            let tx = done_tx.clone();
            let cancelled = Arc::clone(&cancelled);
            let handle = thread::Builder::new()
                .name(format!("walker-io-{}", id))
                .spawn(move || worker_loop(id, rx, tx, cancelled))
                .map_err(|e| WorkerError::InitFailed {
                    id,
                    reason: e.to_string(),
                })?;
            workers.push((id, handle));
        }

        debug!(threads, "Async dispatcher started");

        Ok(Self {
            requests: Some(req_tx),
            completions: done_rx,
            workers,
            cancelled,
            pending: 0,
            depth: (threads * DEPTH_PER_THREAD).max(1),
        })
    }

    /// Number of worker threads
    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// How many more requests may be submitted
    pub fn capacity(&self) -> usize {
        self.depth.saturating_sub(self.pending)
    }

    /// Requests whose completions have not been popped yet
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Hand a request to the workers
    pub fn submit(&mut self, request: Request<T>) -> Result<(), WorkerError> {
        if self.capacity() == 0 {
            return Err(WorkerError::QueueFull);
        }
        let sender = self.requests.as_ref().ok_or(WorkerError::Disconnected)?;
        sender.send(request).map_err(|_| WorkerError::Disconnected)?;
        self.pending += 1;
        Ok(())
    }

    /// Take the next completion
    ///
    /// With `block` set, waits until one arrives. Returns `Ok(None)` when
    /// nothing is pending, or when nothing is ready and `block` is unset.
    pub fn pop(&mut self, block: bool) -> Result<Option<Completion<T>>, WorkerError> {
        if self.pending == 0 {
            return Ok(None);
        }

        let completion = if block {
            self.completions
                .recv()
                .map_err(|_| WorkerError::Disconnected)?
        } else {
            match self.completions.try_recv() {
                Ok(c) => c,
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => return Err(WorkerError::Disconnected),
            }
        };

        self.pending -= 1;
        Ok(Some(completion))
    }

    /// Fail outstanding opens and stats with `ECANCELED`; closes still run
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Accept work normally again after [`cancel`](Self::cancel)
    pub fn resume(&self) {
        self.cancelled.store(false, Ordering::Relaxed);
    }

    /// Stop the workers and wait for them
    ///
    /// Completions still in the channel are dropped, which closes any
    /// descriptors they carry.
    pub fn shutdown(mut self) -> Result<(), WorkerError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), WorkerError> {
        self.cancel();
        self.requests = None;

        let mut first_error = None;
        for (id, handle) in self.workers.drain(..) {
            if let Err(panic) = handle.join() {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                first_error.get_or_insert(WorkerError::Panicked { id, message });
            }
        }

        while self.completions.try_recv().is_ok() {}
        self.pending = 0;

        debug!("Async dispatcher stopped");
        first_error.map_or(Ok(()), Err)
    }
}

impl<T> Drop for AsyncDispatcher<T> {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.requests = None;
        for (_, handle) in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop<T>(
    id: usize,
    requests: Receiver<Request<T>>,
    completions: Sender<Completion<T>>,
    cancelled: Arc<AtomicBool>,
) {
    trace!(worker = id, "I/O worker starting");
    while let Ok(request) = requests.recv() {
        if completions.send(service(request, &cancelled)).is_err() {
            break;
        }
    }
    trace!(worker = id, "I/O worker exiting");
}
