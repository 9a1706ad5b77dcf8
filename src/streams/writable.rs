use super::error::StreamError;
use super::signal::{DeferredSignal, WakerSet};
use super::{CountQueuingStrategy, Locked, QueuingStrategy, StreamResult, Unlocked};
use crate::platform::{MaybeSend, SharedPtr};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::channel::oneshot;
use futures::future::poll_fn;
use futures::task::AtomicWaker;
use futures::{future, AsyncWrite, FutureExt, StreamExt};
use pin_project::pin_project;
use std::collections::VecDeque;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind};
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::task::{Context, Poll, Waker};
use tracing::{debug, trace};

/// Lifecycle of a writable stream.
///
/// `Erroring` is the transient phase between an error being signalled and the
/// stream settling into `Errored`: it exists so that an in-flight sink
/// operation can drain before the queue is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Writable,
    Erroring,
    Errored,
    Closed,
}

/// A write accepted from the producer but not yet handed to the sink.
/// `size` is whatever the queuing strategy said at enqueue time; the same
/// value is subtracted when the sink write settles.
struct QueuedWrite<T> {
    chunk: T,
    size: f64,
    completion: oneshot::Sender<StreamResult<()>>,
}

/// The abort request bookkeeping: all callers joined to it, the reason for
/// the sink, and whether the stream was already erroring when abort arrived
/// (in which case the original error wins and the reason is discarded).
struct PendingAbort {
    reason: Option<String>,
    was_already_erroring: bool,
    completions: Vec<oneshot::Sender<StreamResult<()>>>,
}

/// Commands sent to the driver task for state mutation
enum StreamCommand<T> {
    Write {
        chunk: T,
        completion: oneshot::Sender<StreamResult<()>>,
    },
    Flush {
        completion: oneshot::Sender<StreamResult<()>>,
    },
    Close {
        completion: oneshot::Sender<StreamResult<()>>,
    },
    Abort {
        reason: Option<String>,
        completion: oneshot::Sender<StreamResult<()>>,
    },
    AttachWriter {
        signals: WriterSignals,
    },
    DetachWriter,
    RegisterReadyWaker {
        waker: Waker,
    },
    RegisterClosedWaker {
        waker: Waker,
    },
}

/// The `ready`/`closed` signal pair belonging to the currently attached
/// writer. The driver settles them on state transitions; `releaseLock`
/// latches them so later transitions cannot touch a released writer.
#[derive(Clone)]
struct WriterSignals {
    ready: DeferredSignal,
    closed: DeferredSignal,
}

/// Snapshot of driver state shared with the handles for synchronous reads.
struct SharedState {
    backpressure: AtomicBool,
    closed: AtomicBool,
    errored: AtomicBool,
    erroring: AtomicBool,
    close_requested: AtomicBool,
    queue_total_size: RwLock<f64>,
    stored_error: RwLock<Option<StreamError>>,
}

impl SharedState {
    fn new(backpressure: bool) -> Self {
        Self {
            backpressure: AtomicBool::new(backpressure),
            closed: AtomicBool::new(false),
            errored: AtomicBool::new(false),
            erroring: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            queue_total_size: RwLock::new(0.0),
            stored_error: RwLock::new(None),
        }
    }

    fn stored_error(&self) -> StreamError {
        let guard = match self.stored_error.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone().unwrap_or_else(|| "Stream is errored".into())
    }

    fn set_stored_error(&self, err: StreamError) {
        let mut guard = match self.stored_error.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(err);
    }

    fn clear_stored_error(&self) {
        let mut guard = match self.stored_error.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = None;
    }

    fn queue_total(&self) -> f64 {
        match self.queue_total_size.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_queue_total(&self, total: f64) {
        let mut guard = match self.queue_total_size.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = total;
    }
}

#[pin_project]
pub struct WritableStream<T: MaybeSend + 'static, Sink, S = Unlocked> {
    command_tx: UnboundedSender<StreamCommand<T>>,
    shared: SharedPtr<SharedState>,
    locked: SharedPtr<AtomicBool>,
    high_water_mark: f64,
    pub(crate) controller: WritableStreamDefaultController,
    _sink: PhantomData<Sink>,
    _state: PhantomData<S>,
    #[pin]
    flush_receiver: Option<oneshot::Receiver<StreamResult<()>>>,
    #[pin]
    close_receiver: Option<oneshot::Receiver<StreamResult<()>>>,
    #[pin]
    write_receiver: Option<oneshot::Receiver<StreamResult<()>>>,
    pending_write_len: Option<usize>,
}

impl<T: MaybeSend, Sink, S> WritableStream<T, Sink, S> {
    pub fn locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    fn get_stored_error(&self) -> StreamError {
        self.shared.stored_error()
    }
}

impl<T, Sink> WritableStream<T, Sink, Unlocked>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T> + 'static,
{
    /// Abort the stream, signaling that no more data will be written.
    ///
    /// Writes that were queued but not yet handed to the sink reject with the
    /// abort reason; an in-flight sink operation is allowed to drain first,
    /// after which the sink's own abort algorithm runs (unless its close
    /// algorithm was already attempted). Rejects if the stream is locked.
    pub async fn abort(&self, reason: Option<String>) -> StreamResult<()> {
        if self.locked() {
            return Err(StreamError::Locked);
        }
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .unbounded_send(StreamCommand::Abort {
                reason,
                completion: tx,
            })
            .map_err(|_| StreamError::TaskDropped)?;
        rx.await.unwrap_or_else(|_| Err(StreamError::TaskDropped))
    }

    /// Close the stream once every previously accepted write has drained.
    ///
    /// Rejects if the stream is locked, a close was already requested, or the
    /// stream is closed or errored.
    pub async fn close(&self) -> StreamResult<()> {
        if self.locked() {
            return Err(StreamError::Locked);
        }
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .unbounded_send(StreamCommand::Close { completion: tx })
            .map_err(|_| StreamError::TaskDropped)?;
        rx.await.unwrap_or_else(|_| Err(StreamError::TaskDropped))
    }

    /// A future that resolves when the stream closes, or rejects with the
    /// stored error when it errors. Does not require taking the writer lock.
    pub fn closed(&self) -> impl Future<Output = StreamResult<()>> {
        let shared = SharedPtr::clone(&self.shared);
        let command_tx = self.command_tx.clone();
        poll_fn(move |cx| {
            if shared.errored.load(Ordering::SeqCst) {
                return Poll::Ready(Err(shared.stored_error()));
            }
            if shared.closed.load(Ordering::SeqCst) {
                return Poll::Ready(Ok(()));
            }
            let _ = command_tx.unbounded_send(StreamCommand::RegisterClosedWaker {
                waker: cx.waker().clone(),
            });
            // Re-check after registration to avoid a lost wakeup
            if shared.closed.load(Ordering::SeqCst) {
                return Poll::Ready(Ok(()));
            }
            if shared.errored.load(Ordering::SeqCst) {
                return Poll::Ready(Err(shared.stored_error()));
            }
            Poll::Pending
        })
    }

    /// Acquire the exclusive writer lock.
    ///
    /// Returns the locked stream alongside the writer handle. Fails with
    /// [`StreamError::Locked`] while another writer holds the lock.
    pub fn get_writer(
        &self,
    ) -> Result<
        (
            WritableStream<T, Sink, Locked>,
            WritableStreamDefaultWriter<T, Sink>,
        ),
        StreamError,
    > {
        // Attempt to atomically acquire the lock:
        if self
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StreamError::Locked);
        }

        let signals = WriterSignals {
            ready: DeferredSignal::new_pending(),
            closed: DeferredSignal::new_pending(),
        };
        if self
            .command_tx
            .unbounded_send(StreamCommand::AttachWriter {
                signals: signals.clone(),
            })
            .is_err()
        {
            self.locked.store(false, Ordering::SeqCst);
            return Err(StreamError::TaskDropped);
        }

        let locked = WritableStream {
            command_tx: self.command_tx.clone(),
            shared: SharedPtr::clone(&self.shared),
            locked: SharedPtr::clone(&self.locked),
            high_water_mark: self.high_water_mark,
            controller: self.controller.clone(),
            _sink: PhantomData,
            _state: PhantomData::<Locked>,
            flush_receiver: None,
            close_receiver: None,
            write_receiver: None,
            pending_write_len: None,
        };

        Ok((
            locked.clone(),
            WritableStreamDefaultWriter::new(locked, signals),
        ))
    }
}

impl<T: MaybeSend + 'static, Sink> WritableStream<T, Sink>
where
    T: 'static,
    Sink: WritableSink<T> + 'static,
{
    /// Common constructor logic shared between spawn variants
    pub(crate) fn new_inner(
        sink: Sink,
        strategy: crate::platform::BoxedStrategy<T>,
        high_water_mark: f64,
    ) -> (Self, impl Future<Output = ()>) {
        debug_assert!(high_water_mark.is_finite() && high_water_mark >= 0.0);

        let (command_tx, command_rx) = unbounded();
        let (ctrl_tx, ctrl_rx): (
            UnboundedSender<ControllerMsg>,
            UnboundedReceiver<ControllerMsg>,
        ) = unbounded();
        let controller = WritableStreamDefaultController::new(ctrl_tx);

        // With a zero high water mark the stream starts out backpressured.
        let backpressure = high_water_mark <= 0.0;
        let shared = SharedPtr::new(SharedState::new(backpressure));

        let inner = WritableStreamInner {
            state: StreamState::Writable,
            queue: VecDeque::new(),
            close_marker_queued: false,
            queue_total_size: 0.0,
            strategy,
            high_water_mark,
            sink: Some(sink),
            started: false,
            backpressure,
            close_requested: false,
            close_completion: None,
            pending_abort: None,
            in_flight: None,
            writer: None,
            shared: SharedPtr::clone(&shared),
            ready_wakers: WakerSet::new(),
            closed_wakers: WakerSet::new(),
            flush_waiters: Vec::new(),
            abort_requested: SharedPtr::clone(&controller.abort_requested),
            abort_waker: SharedPtr::clone(&controller.abort_waker),
        };

        let fut = stream_task(command_rx, inner, controller.clone(), ctrl_rx);

        let stream = Self {
            command_tx,
            shared,
            locked: SharedPtr::new(AtomicBool::new(false)),
            high_water_mark,
            controller,
            _sink: PhantomData,
            _state: PhantomData,
            flush_receiver: None,
            close_receiver: None,
            write_receiver: None,
            pending_write_len: None,
        };

        (stream, fut)
    }
}

impl<T: MaybeSend + 'static, Sink> Clone for WritableStream<T, Sink, Locked> {
    fn clone(&self) -> Self {
        Self {
            command_tx: self.command_tx.clone(),
            shared: SharedPtr::clone(&self.shared),
            locked: SharedPtr::clone(&self.locked),
            high_water_mark: self.high_water_mark,
            controller: self.controller.clone(),
            _sink: PhantomData,
            _state: PhantomData,
            flush_receiver: None,
            close_receiver: None,
            write_receiver: None,
            pending_write_len: None,
        }
    }
}

impl<T, SinkType> futures::Sink<T> for WritableStream<T, SinkType, Unlocked>
where
    T: MaybeSend + 'static,
    SinkType: WritableSink<T> + 'static,
{
    type Error = StreamError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.shared.errored.load(Ordering::SeqCst) || self.shared.erroring.load(Ordering::SeqCst)
        {
            return Poll::Ready(Err(self.get_stored_error()));
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            return Poll::Ready(Err(StreamError::Closed));
        }
        if self.shared.close_requested.load(Ordering::SeqCst) {
            return Poll::Ready(Err(StreamError::Closing));
        }

        if !self.shared.backpressure.load(Ordering::SeqCst) {
            Poll::Ready(Ok(()))
        } else {
            // Register waker to get notified when backpressure clears:
            let _ = self
                .command_tx
                .unbounded_send(StreamCommand::RegisterReadyWaker {
                    waker: cx.waker().clone(),
                });

            // Double-check backpressure after registering to avoid a lost wakeup
            if !self.shared.backpressure.load(Ordering::SeqCst) {
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            }
        }
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        if self.shared.errored.load(Ordering::SeqCst) || self.shared.erroring.load(Ordering::SeqCst)
        {
            return Err(self.get_stored_error());
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        if self.shared.close_requested.load(Ordering::SeqCst) {
            return Err(StreamError::Closing);
        }
        // Sink contract: start_send is only valid after poll_ready succeeded
        if self.shared.backpressure.load(Ordering::SeqCst) {
            return Err(StreamError::InvalidState(
                "start_send called while backpressure is active - call poll_ready first",
            ));
        }

        let (tx, _rx) = oneshot::channel();
        self.command_tx
            .unbounded_send(StreamCommand::Write {
                chunk: item,
                completion: tx,
            })
            .map_err(|_| StreamError::TaskDropped)?;

        // The write settles asynchronously in the driver; completion is
        // observed through poll_flush.
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let mut this = self.project();

        if this.shared.errored.load(Ordering::SeqCst) {
            return Poll::Ready(Err(this.shared.stored_error()));
        }

        // If there's no flush_receiver yet, initiate a flush and store the receiver
        if this.flush_receiver.is_none() {
            let (tx, rx) = oneshot::channel();
            if this
                .command_tx
                .unbounded_send(StreamCommand::Flush { completion: tx })
                .is_err()
            {
                return Poll::Ready(Err(StreamError::TaskDropped));
            }
            this.flush_receiver.set(Some(rx));
        }

        if let Some(rx) = this.flush_receiver.as_mut().as_pin_mut() {
            match rx.poll(cx) {
                Poll::Ready(Ok(result)) => {
                    this.flush_receiver.set(None);
                    Poll::Ready(result)
                }
                Poll::Ready(Err(_)) => {
                    this.flush_receiver.set(None);
                    Poll::Ready(Err(StreamError::TaskDropped))
                }
                Poll::Pending => Poll::Pending,
            }
        } else {
            Poll::Ready(Err(StreamError::InvalidState("flush receiver missing")))
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let mut this = self.project();

        if this.shared.closed.load(Ordering::SeqCst) {
            return Poll::Ready(Ok(()));
        }
        if this.shared.errored.load(Ordering::SeqCst) {
            return Poll::Ready(Err(this.shared.stored_error()));
        }

        if this.close_receiver.is_none() {
            let (tx, rx) = oneshot::channel();
            if this
                .command_tx
                .unbounded_send(StreamCommand::Close { completion: tx })
                .is_err()
            {
                return Poll::Ready(Err(StreamError::TaskDropped));
            }
            this.close_receiver.set(Some(rx));
        }

        if let Some(rx) = this.close_receiver.as_mut().as_pin_mut() {
            match rx.poll(cx) {
                Poll::Ready(Ok(result)) => {
                    this.close_receiver.set(None);
                    Poll::Ready(result)
                }
                Poll::Ready(Err(_)) => {
                    this.close_receiver.set(None);
                    Poll::Ready(Err(StreamError::TaskDropped))
                }
                Poll::Pending => Poll::Pending,
            }
        } else {
            Poll::Ready(Err(StreamError::InvalidState("close receiver missing")))
        }
    }
}

fn to_io_error(err: StreamError) -> IoError {
    let kind = match &err {
        StreamError::Closed | StreamError::Closing | StreamError::TaskDropped => {
            ErrorKind::BrokenPipe
        }
        StreamError::Aborted(_) => ErrorKind::Interrupted,
        StreamError::Locked | StreamError::Released => ErrorKind::PermissionDenied,
        StreamError::Range(_) => ErrorKind::InvalidInput,
        StreamError::InvalidState(_) | StreamError::Other(_) => ErrorKind::Other,
    };
    IoError::new(kind, err)
}

impl<T, Sink> AsyncWrite for WritableStream<T, Sink, Unlocked>
where
    T: for<'a> From<&'a [u8]> + MaybeSend + 'static,
    Sink: WritableSink<T> + 'static,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, IoError>> {
        let mut this = self.project();

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if this.shared.errored.load(Ordering::SeqCst) {
            return Poll::Ready(Err(to_io_error(this.shared.stored_error())));
        }
        if this.shared.closed.load(Ordering::SeqCst) {
            return Poll::Ready(Err(to_io_error(StreamError::Closed)));
        }

        // Backpressure check
        if this.shared.backpressure.load(Ordering::SeqCst) {
            let _ = this
                .command_tx
                .unbounded_send(StreamCommand::RegisterReadyWaker {
                    waker: cx.waker().clone(),
                });
            if this.shared.backpressure.load(Ordering::SeqCst) {
                return Poll::Pending;
            }
        }

        // If no write in progress, start one
        if this.write_receiver.is_none() {
            let chunk: T = T::from(buf);
            let (tx, rx) = oneshot::channel();

            if this
                .command_tx
                .unbounded_send(StreamCommand::Write {
                    chunk,
                    completion: tx,
                })
                .is_err()
            {
                return Poll::Ready(Err(to_io_error(StreamError::TaskDropped)));
            }

            this.write_receiver.set(Some(rx));
            *this.pending_write_len = Some(buf.len());
        }

        if let Some(rx) = this.write_receiver.as_mut().as_pin_mut() {
            match rx.poll(cx) {
                Poll::Ready(Ok(Ok(()))) => {
                    let written = this.pending_write_len.take().unwrap_or(0);
                    this.write_receiver.set(None);
                    Poll::Ready(Ok(written))
                }
                Poll::Ready(Ok(Err(stream_err))) => {
                    this.write_receiver.set(None);
                    this.pending_write_len.take();
                    Poll::Ready(Err(to_io_error(stream_err)))
                }
                Poll::Ready(Err(_)) => {
                    this.write_receiver.set(None);
                    this.pending_write_len.take();
                    Poll::Ready(Err(to_io_error(StreamError::TaskDropped)))
                }
                Poll::Pending => Poll::Pending,
            }
        } else {
            Poll::Ready(Err(to_io_error(StreamError::InvalidState(
                "write receiver missing",
            ))))
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IoError>> {
        let mut this = self.project();

        if this.shared.errored.load(Ordering::SeqCst) {
            return Poll::Ready(Err(to_io_error(this.shared.stored_error())));
        }

        if this.flush_receiver.is_none() {
            let (tx, rx) = oneshot::channel();
            if this
                .command_tx
                .unbounded_send(StreamCommand::Flush { completion: tx })
                .is_err()
            {
                return Poll::Ready(Err(to_io_error(StreamError::TaskDropped)));
            }
            this.flush_receiver.set(Some(rx));
        }

        if let Some(rx) = this.flush_receiver.as_mut().as_pin_mut() {
            match rx.poll(cx) {
                Poll::Ready(Ok(result)) => {
                    this.flush_receiver.set(None);
                    Poll::Ready(result.map_err(to_io_error))
                }
                Poll::Ready(Err(_)) => {
                    this.flush_receiver.set(None);
                    Poll::Ready(Err(to_io_error(StreamError::TaskDropped)))
                }
                Poll::Pending => Poll::Pending,
            }
        } else {
            Poll::Ready(Err(to_io_error(StreamError::InvalidState(
                "flush receiver missing",
            ))))
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IoError>> {
        let mut this = self.project();

        if this.shared.closed.load(Ordering::SeqCst) {
            return Poll::Ready(Ok(()));
        }
        if this.shared.errored.load(Ordering::SeqCst) {
            return Poll::Ready(Err(to_io_error(this.shared.stored_error())));
        }

        if this.close_receiver.is_none() {
            let (tx, rx) = oneshot::channel();
            if this
                .command_tx
                .unbounded_send(StreamCommand::Close { completion: tx })
                .is_err()
            {
                return Poll::Ready(Err(to_io_error(StreamError::TaskDropped)));
            }
            this.close_receiver.set(Some(rx));
        }

        if let Some(rx) = this.close_receiver.as_mut().as_pin_mut() {
            match rx.poll(cx) {
                Poll::Ready(Ok(result)) => {
                    this.close_receiver.set(None);
                    Poll::Ready(result.map_err(to_io_error))
                }
                Poll::Ready(Err(_)) => {
                    this.close_receiver.set(None);
                    Poll::Ready(Err(to_io_error(StreamError::TaskDropped)))
                }
                Poll::Pending => Poll::Pending,
            }
        } else {
            Poll::Ready(Err(to_io_error(StreamError::InvalidState(
                "close receiver missing",
            ))))
        }
    }
}

/// The underlying sink: the four algorithms a writable stream drives.
///
/// `write` is invoked once per chunk, strictly in producer order, and never
/// while another `write` or `close` is outstanding. `close` consumes the sink:
/// after it has been dispatched no other algorithm can run. `abort` runs at
/// most once, only if `close` was never attempted.
pub trait WritableSink<T: MaybeSend + 'static>: MaybeSend + Sized + 'static {
    /// Start the sink
    fn start(
        &mut self,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(())) // default no-op
    }

    /// Write a chunk to the sink
    fn write(
        &mut self,
        chunk: T,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Close the sink
    fn close(self) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        future::ready(Ok(())) // default no-op
    }

    /// Abort the sink
    fn abort(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(())) // default no-op
    }
}

/// The single sink operation currently outstanding.
///
/// At most one of these exists at a time; that is what serializes sink access.
enum InFlight<Sink> {
    Start {
        fut: crate::platform::PlatformBoxFutureStatic<(Sink, StreamResult<()>)>,
    },
    Write {
        fut: crate::platform::PlatformBoxFutureStatic<(Sink, StreamResult<()>)>,
        completion: oneshot::Sender<StreamResult<()>>,
        size: f64,
    },
    Close {
        fut: crate::platform::PlatformBoxFutureStatic<StreamResult<()>>,
        completion: Option<oneshot::Sender<StreamResult<()>>>,
    },
    Abort {
        fut: crate::platform::PlatformBoxFutureStatic<StreamResult<()>>,
    },
}

struct WritableStreamInner<T, Sink> {
    state: StreamState,
    /// Writes not yet handed to the sink. The in-flight write is no longer
    /// here but its size still counts toward `queue_total_size` until the
    /// sink settles it.
    queue: VecDeque<QueuedWrite<T>>,
    /// The terminal close marker: set when a close has been queued behind the
    /// remaining writes, cleared when the close is dispatched.
    close_marker_queued: bool,
    queue_total_size: f64,
    strategy: crate::platform::BoxedStrategyStatic<T>,
    high_water_mark: f64,
    /// `None` once the algorithms have been cleared: after close dispatch,
    /// after a write failure while writable, or after abort dispatch.
    sink: Option<Sink>,
    started: bool,
    backpressure: bool,
    /// True from close request until the close settles (queued or in flight).
    close_requested: bool,
    close_completion: Option<oneshot::Sender<StreamResult<()>>>,
    pending_abort: Option<PendingAbort>,
    in_flight: Option<InFlight<Sink>>,
    writer: Option<WriterSignals>,
    shared: SharedPtr<SharedState>,
    ready_wakers: WakerSet,
    closed_wakers: WakerSet,
    /// Flush barriers: each waits for the number of writes outstanding at the
    /// moment the flush was requested.
    flush_waiters: Vec<(oneshot::Sender<StreamResult<()>>, usize)>,
    abort_requested: SharedPtr<AtomicBool>,
    abort_waker: SharedPtr<AtomicWaker>,
}

impl<T, Sink> WritableStreamInner<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T> + 'static,
{
    fn stored_error(&self) -> StreamError {
        self.shared.stored_error()
    }

    fn desired_size(&self) -> f64 {
        self.high_water_mark - self.queue_total_size
    }

    fn has_in_flight_op(&self) -> bool {
        matches!(
            self.in_flight,
            Some(InFlight::Write { .. }) | Some(InFlight::Close { .. })
        )
    }

    /// Recompute backpressure from the desired size and notify the writer if
    /// it flipped. Only meaningful while writable with no close queued.
    fn update_backpressure(&mut self) {
        debug_assert_eq!(self.state, StreamState::Writable);
        debug_assert!(!self.close_requested);
        let backpressure = self.desired_size() <= 0.0;
        if backpressure != self.backpressure {
            if let Some(writer) = &self.writer {
                if backpressure {
                    writer.ready.reset_pending();
                } else {
                    writer.ready.resolve();
                }
            }
            self.backpressure = backpressure;
        }
    }

    fn writer_write(&mut self, chunk: T, completion: oneshot::Sender<StreamResult<()>>) {
        let size = self.strategy.size(&chunk);
        match self.state {
            StreamState::Errored | StreamState::Erroring => {
                let _ = completion.send(Err(self.stored_error()));
            }
            StreamState::Closed => {
                let _ = completion.send(Err(StreamError::Closed));
            }
            StreamState::Writable if self.close_requested => {
                let _ = completion.send(Err(StreamError::Closing));
            }
            StreamState::Writable => {
                if !size.is_finite() || size < 0.0 {
                    let err = StreamError::Range(format!(
                        "chunk size must be a non-negative, finite number, got {size}"
                    ));
                    self.error_if_needed(err);
                    let _ = completion.send(Err(self.stored_error()));
                    return;
                }
                self.queue.push_back(QueuedWrite {
                    chunk,
                    size,
                    completion,
                });
                self.queue_total_size += size;
                self.update_backpressure();
            }
        }
    }

    fn stream_close(&mut self, completion: oneshot::Sender<StreamResult<()>>) {
        if self.close_requested {
            let _ = completion.send(Err(StreamError::Closing));
            return;
        }
        match self.state {
            StreamState::Closed => {
                let _ = completion.send(Err(StreamError::Closed));
            }
            StreamState::Errored => {
                let _ = completion.send(Err(StreamError::InvalidState(
                    "cannot close an errored stream",
                )));
            }
            StreamState::Writable | StreamState::Erroring => {
                debug!("close requested");
                self.close_requested = true;
                self.close_completion = Some(completion);
                self.close_marker_queued = true;
                // Closing is not subject to backpressure
                if self.backpressure && self.state == StreamState::Writable {
                    if let Some(writer) = &self.writer {
                        writer.ready.resolve();
                    }
                }
            }
        }
    }

    fn stream_abort(&mut self, reason: Option<String>, completion: oneshot::Sender<StreamResult<()>>) {
        // A second abort while one is in progress joins it: the original
        // reason wins and the sink's abort algorithm runs at most once.
        if let Some(pending) = &mut self.pending_abort {
            pending.completions.push(completion);
            return;
        }
        if matches!(self.state, StreamState::Closed | StreamState::Errored) {
            let _ = completion.send(Ok(()));
            return;
        }
        let was_already_erroring = self.state == StreamState::Erroring;
        debug!(was_already_erroring, "abort requested");
        self.abort_requested.store(true, Ordering::SeqCst);
        self.abort_waker.wake();
        let stored = StreamError::Aborted(reason.clone());
        self.pending_abort = Some(PendingAbort {
            // The original error wins; the reason is not retained.
            reason: if was_already_erroring { None } else { reason },
            was_already_erroring,
            completions: vec![completion],
        });
        if !was_already_erroring {
            self.start_erroring(stored);
        }
    }

    fn flush_barrier(&mut self, completion: oneshot::Sender<StreamResult<()>>) {
        if matches!(self.state, StreamState::Errored | StreamState::Erroring) {
            let _ = completion.send(Err(self.stored_error()));
            return;
        }
        // Count the writes outstanding right now; the barrier settles once
        // exactly that many have completed.
        let in_flight_writes = usize::from(matches!(self.in_flight, Some(InFlight::Write { .. })));
        let waiting = self.queue.len() + in_flight_writes;
        if waiting == 0 {
            let _ = completion.send(Ok(()));
        } else {
            self.flush_waiters.push((completion, waiting));
        }
    }

    /// A write settled successfully; tick every flush barrier.
    fn note_write_settled(&mut self) {
        let mut i = 0;
        while i < self.flush_waiters.len() {
            let (_, count) = &mut self.flush_waiters[i];
            *count -= 1;
            if *count == 0 {
                let (sender, _) = self.flush_waiters.swap_remove(i);
                let _ = sender.send(Ok(()));
            } else {
                i += 1;
            }
        }
    }

    /// Bind a freshly created writer's signals, initialized from the current
    /// state.
    fn attach_writer(&mut self, signals: WriterSignals) {
        match self.state {
            StreamState::Writable => {
                if self.close_requested || !self.backpressure {
                    signals.ready.resolve();
                }
            }
            StreamState::Erroring => {
                signals.ready.reject(self.stored_error());
            }
            StreamState::Closed => {
                signals.ready.resolve();
                signals.closed.resolve();
            }
            StreamState::Errored => {
                let err = self.stored_error();
                signals.ready.reject(err.clone());
                signals.closed.reject(err);
            }
        }
        self.writer = Some(signals);
    }

    /// `controller.error` semantics: only a writable stream can begin erroring.
    fn error_if_needed(&mut self, err: StreamError) {
        if self.state == StreamState::Writable {
            self.start_erroring(err);
        }
    }

    fn start_erroring(&mut self, err: StreamError) {
        debug_assert_eq!(self.state, StreamState::Writable);
        debug!("stream erroring");
        self.shared.set_stored_error(err.clone());
        self.state = StreamState::Erroring;
        if let Some(writer) = &self.writer {
            writer.ready.reject(err);
        }
        if !self.has_in_flight_op() && self.started {
            self.finish_erroring();
        }
    }

    fn finish_erroring(&mut self) {
        debug_assert_eq!(self.state, StreamState::Erroring);
        debug_assert!(!self.has_in_flight_op());
        debug!("stream errored");
        self.state = StreamState::Errored;
        let err = self.stored_error();

        // Reset the queue. The sink algorithms stay in place: a pending abort
        // may still need them.
        self.close_marker_queued = false;
        self.queue_total_size = 0.0;
        for record in self.queue.drain(..) {
            let _ = record.completion.send(Err(err.clone()));
        }
        for (waiter, _) in self.flush_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }

        let Some(abort) = self.pending_abort.take() else {
            self.reject_close_and_closed();
            return;
        };
        if abort.was_already_erroring {
            for completion in abort.completions {
                let _ = completion.send(Err(err.clone()));
            }
            self.reject_close_and_closed();
            return;
        }
        match self.sink.take() {
            Some(mut sink) => {
                debug!("dispatching sink abort");
                let reason = abort.reason.clone();
                // Late abort() calls join this request while the sink drains.
                self.pending_abort = Some(abort);
                self.in_flight = Some(InFlight::Abort {
                    fut: Box::pin(async move { sink.abort(reason).await }),
                });
            }
            None => {
                for completion in abort.completions {
                    let _ = completion.send(Ok(()));
                }
                self.reject_close_and_closed();
            }
        }
    }

    fn reject_close_and_closed(&mut self) {
        let err = self.stored_error();
        if let Some(completion) = self.close_completion.take() {
            let _ = completion.send(Err(err.clone()));
        }
        if let Some(writer) = &self.writer {
            writer.closed.reject(err);
        }
    }

    /// Route a sink failure into the error machinery.
    fn deal_with_rejection(&mut self, err: StreamError) {
        match self.state {
            StreamState::Writable => self.start_erroring(err),
            StreamState::Erroring => self.finish_erroring(),
            // Nothing left to do in a terminal state.
            StreamState::Errored | StreamState::Closed => {}
        }
    }

    fn advance_queue_if_needed(&mut self, controller: &WritableStreamDefaultController) {
        if !self.started || self.in_flight.is_some() {
            return;
        }
        match self.state {
            StreamState::Closed | StreamState::Errored => return,
            StreamState::Erroring => {
                self.finish_erroring();
                return;
            }
            StreamState::Writable => {}
        }
        if let Some(record) = self.queue.pop_front() {
            self.process_write(record, controller);
        } else if self.close_marker_queued {
            self.process_close();
        }
    }

    fn process_write(&mut self, record: QueuedWrite<T>, controller: &WritableStreamDefaultController) {
        let Some(mut sink) = self.sink.take() else {
            let _ = record
                .completion
                .send(Err(StreamError::InvalidState("sink is no longer available")));
            self.error_if_needed(StreamError::InvalidState("sink is no longer available"));
            return;
        };
        trace!("dispatching chunk to sink");
        let mut ctrl = controller.clone();
        let chunk = record.chunk;
        self.in_flight = Some(InFlight::Write {
            fut: Box::pin(async move {
                let result = sink.write(chunk, &mut ctrl).await;
                (sink, result)
            }),
            completion: record.completion,
            size: record.size,
        });
    }

    fn process_close(&mut self) {
        debug_assert!(self.queue.is_empty());
        self.close_marker_queued = false;
        let completion = self.close_completion.take();
        match self.sink.take() {
            Some(sink) => {
                debug!("dispatching sink close");
                self.in_flight = Some(InFlight::Close {
                    fut: Box::pin(async move { sink.close().await }),
                    completion,
                });
            }
            None => {
                // No sink left to close; settle directly.
                self.state = StreamState::Closed;
                self.close_requested = false;
                if let Some(completion) = completion {
                    let _ = completion.send(Ok(()));
                }
                if let Some(writer) = &self.writer {
                    writer.closed.resolve();
                }
            }
        }
    }

    fn finish_start(&mut self, sink: Sink, result: StreamResult<()>) {
        self.started = true;
        self.sink = Some(sink);
        match result {
            Ok(()) => trace!("sink started"),
            Err(err) => {
                debug!("sink start failed");
                self.deal_with_rejection(err);
            }
        }
    }

    fn finish_in_flight_write(
        &mut self,
        sink: Sink,
        result: StreamResult<()>,
        completion: oneshot::Sender<StreamResult<()>>,
        size: f64,
    ) {
        match result {
            Ok(()) => {
                self.sink = Some(sink);
                let _ = completion.send(Ok(()));
                self.note_write_settled();
                // Dequeue the record now that the sink settled it
                self.queue_total_size = (self.queue_total_size - size).max(0.0);
                if !self.close_requested && self.state == StreamState::Writable {
                    self.update_backpressure();
                }
            }
            Err(err) => {
                if self.state == StreamState::Writable {
                    // The sink is dead; no algorithm may run after a write
                    // failure in the writable state.
                    drop(sink);
                } else {
                    // While erroring, a pending abort may still need the sink.
                    self.sink = Some(sink);
                }
                let _ = completion.send(Err(err.clone()));
                self.deal_with_rejection(err);
            }
        }
    }

    fn finish_in_flight_close(
        &mut self,
        result: StreamResult<()>,
        completion: Option<oneshot::Sender<StreamResult<()>>>,
    ) {
        match result {
            Ok(()) => {
                if self.state == StreamState::Erroring {
                    // A late error loses to a completed close.
                    self.shared.clear_stored_error();
                    if let Some(abort) = self.pending_abort.take() {
                        for waiter in abort.completions {
                            let _ = waiter.send(Ok(()));
                        }
                    }
                }
                self.state = StreamState::Closed;
                self.close_requested = false;
                if let Some(completion) = completion {
                    let _ = completion.send(Ok(()));
                }
                if let Some(writer) = &self.writer {
                    writer.closed.resolve();
                }
                debug!("stream closed");
            }
            Err(err) => {
                // The sink's close algorithm was attempted, so its abort
                // algorithm must never run: settle the pending abort here.
                if let Some(abort) = self.pending_abort.take() {
                    for waiter in abort.completions {
                        let _ = waiter.send(Err(err.clone()));
                    }
                }
                if let Some(completion) = completion {
                    let _ = completion.send(Err(err.clone()));
                }
                self.close_requested = false;
                self.deal_with_rejection(err);
            }
        }
    }

    fn finish_abort(&mut self, result: StreamResult<()>) {
        debug_assert_eq!(self.state, StreamState::Errored);
        if let Some(abort) = self.pending_abort.take() {
            for completion in abort.completions {
                let _ = completion.send(result.clone());
            }
        }
        self.reject_close_and_closed();
    }

    /// Mirror driver state into the shared snapshot and wake handle-side
    /// waiters whose condition now holds.
    fn publish(&self) {
        let shared = &self.shared;
        shared
            .backpressure
            .store(self.backpressure, Ordering::SeqCst);
        shared
            .closed
            .store(self.state == StreamState::Closed, Ordering::SeqCst);
        shared
            .errored
            .store(self.state == StreamState::Errored, Ordering::SeqCst);
        shared
            .erroring
            .store(self.state == StreamState::Erroring, Ordering::SeqCst);
        shared
            .close_requested
            .store(self.close_requested, Ordering::SeqCst);
        shared.set_queue_total(self.queue_total_size);

        if matches!(self.state, StreamState::Closed | StreamState::Errored) {
            self.closed_wakers.wake_all();
        }
        if !self.backpressure {
            self.ready_wakers.wake_all();
        }
    }
}

// Helper to process each command. Broken out to keep the task flat.
fn process_command<T, Sink>(cmd: StreamCommand<T>, inner: &mut WritableStreamInner<T, Sink>)
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T> + 'static,
{
    match cmd {
        StreamCommand::Write { chunk, completion } => inner.writer_write(chunk, completion),
        StreamCommand::Flush { completion } => inner.flush_barrier(completion),
        StreamCommand::Close { completion } => inner.stream_close(completion),
        StreamCommand::Abort { reason, completion } => inner.stream_abort(reason, completion),
        StreamCommand::AttachWriter { signals } => inner.attach_writer(signals),
        StreamCommand::DetachWriter => inner.writer = None,
        StreamCommand::RegisterReadyWaker { waker } => {
            inner.ready_wakers.register(&waker);
            // Wake immediately if the condition already holds
            if !inner.backpressure {
                inner.ready_wakers.wake_all();
            }
        }
        StreamCommand::RegisterClosedWaker { waker } => {
            inner.closed_wakers.register(&waker);
            if matches!(inner.state, StreamState::Closed | StreamState::Errored) {
                inner.closed_wakers.wake_all();
            }
        }
    }
}

fn process_controller_msgs<T, Sink>(
    inner: &mut WritableStreamInner<T, Sink>,
    ctrl_rx: &mut UnboundedReceiver<ControllerMsg>,
    cx: &mut Context<'_>,
) where
    T: MaybeSend + 'static,
    Sink: WritableSink<T> + 'static,
{
    loop {
        match ctrl_rx.poll_next_unpin(cx) {
            Poll::Ready(Some(ControllerMsg::Error(err))) => inner.error_if_needed(err),
            Poll::Ready(None) | Poll::Pending => break,
        }
    }
}

async fn stream_task<T, Sink>(
    mut command_rx: UnboundedReceiver<StreamCommand<T>>,
    mut inner: WritableStreamInner<T, Sink>,
    controller: WritableStreamDefaultController,
    mut ctrl_rx: UnboundedReceiver<ControllerMsg>,
) where
    T: MaybeSend + 'static,
    Sink: WritableSink<T> + 'static,
{
    // Kick off the sink's start algorithm. Commands arriving while it runs
    // are accepted and queued; delivery begins once start settles.
    if let Some(mut sink) = inner.sink.take() {
        trace!("starting underlying sink");
        let mut start_controller = controller.clone();
        inner.in_flight = Some(InFlight::Start {
            fut: Box::pin(async move {
                let result = sink.start(&mut start_controller).await;
                (sink, result)
            }),
        });
    } else {
        inner.started = true;
    }
    inner.publish();

    poll_fn(|cx| {
        process_controller_msgs(&mut inner, &mut ctrl_rx, cx);

        // Drain all pending commands
        loop {
            match command_rx.poll_next_unpin(cx) {
                Poll::Ready(Some(cmd)) => process_command(cmd, &mut inner),
                Poll::Ready(None) => return Poll::Ready(()),
                Poll::Pending => break,
            }
        }

        inner.advance_queue_if_needed(&controller);

        // Drive the single outstanding sink operation, if any
        if let Some(op) = inner.in_flight.take() {
            match op {
                InFlight::Start { mut fut } => match fut.as_mut().poll(cx) {
                    Poll::Ready((sink, result)) => {
                        inner.finish_start(sink, result);
                        inner.publish();
                        cx.waker().wake_by_ref();
                    }
                    Poll::Pending => inner.in_flight = Some(InFlight::Start { fut }),
                },
                InFlight::Write {
                    mut fut,
                    completion,
                    size,
                } => match fut.as_mut().poll(cx) {
                    Poll::Ready((sink, result)) => {
                        inner.finish_in_flight_write(sink, result, completion, size);
                        inner.publish();
                        cx.waker().wake_by_ref();
                    }
                    Poll::Pending => {
                        inner.in_flight = Some(InFlight::Write {
                            fut,
                            completion,
                            size,
                        })
                    }
                },
                InFlight::Close { mut fut, completion } => match fut.as_mut().poll(cx) {
                    Poll::Ready(result) => {
                        inner.finish_in_flight_close(result, completion);
                        inner.publish();
                        cx.waker().wake_by_ref();
                    }
                    Poll::Pending => inner.in_flight = Some(InFlight::Close { fut, completion }),
                },
                InFlight::Abort { mut fut } => match fut.as_mut().poll(cx) {
                    Poll::Ready(result) => {
                        inner.finish_abort(result);
                        inner.publish();
                        cx.waker().wake_by_ref();
                    }
                    Poll::Pending => inner.in_flight = Some(InFlight::Abort { fut }),
                },
            }
        }

        inner.publish();
        Poll::Pending
    })
    .await;
}

enum ControllerMsg {
    /// Trigger a stream error (controller.error(...))
    Error(StreamError),
}

/// Handed to the sink's `start` and `write` algorithms.
#[derive(Clone)]
pub struct WritableStreamDefaultController {
    tx: UnboundedSender<ControllerMsg>,
    abort_requested: SharedPtr<AtomicBool>,
    abort_waker: SharedPtr<AtomicWaker>,
}

impl WritableStreamDefaultController {
    fn new(sender: UnboundedSender<ControllerMsg>) -> Self {
        Self {
            tx: sender,
            abort_requested: SharedPtr::new(AtomicBool::new(false)),
            abort_waker: SharedPtr::new(AtomicWaker::new()),
        }
    }

    /// Signal an error on the stream.
    ///
    /// Only effective while the stream is writable; in any other state this
    /// is a no-op.
    pub fn error(&self, error: StreamError) {
        // ignore send failure if receiver is dropped
        let _ = self.tx.unbounded_send(ControllerMsg::Error(error));
    }

    /// Returns `true` if an abort of the stream has been requested.
    ///
    /// The stream itself never interrupts an in-flight write; this flag lets
    /// a sink volunteer to stop early.
    pub fn is_aborted(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    /// Returns a future that resolves once an abort has been requested.
    ///
    /// Sink implementors can `select!` on this future alongside their actual
    /// write work to stop promptly when the producer aborts:
    ///
    /// ```ignore
    /// async fn write(
    ///     &mut self,
    ///     chunk: Vec<u8>,
    ///     controller: &mut WritableStreamDefaultController,
    /// ) -> StreamResult<()> {
    ///     tokio::select! {
    ///         _ = controller.aborted() => Err(StreamError::Aborted(None)),
    ///         _ = async {
    ///             // do actual I/O
    ///         } => Ok(()),
    ///     }
    /// }
    /// ```
    pub fn aborted(&self) -> impl Future<Output = ()> {
        let waker = SharedPtr::clone(&self.abort_waker);
        let flag = SharedPtr::clone(&self.abort_requested);
        poll_fn(move |cx| {
            if flag.load(Ordering::SeqCst) {
                Poll::Ready(())
            } else {
                // register so request_abort's wake() reaches us
                waker.register(cx.waker());
                Poll::Pending
            }
        })
    }

    /// Races a future against the abort signal.
    ///
    /// If the abort fires first, returns `Err(StreamError::Aborted(None))`.
    /// Otherwise, returns the result of the future wrapped in `Ok`.
    pub fn with_abort<F, T>(&self, fut: F) -> impl Future<Output = Result<T, StreamError>>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        let abort_fut = Box::pin(self.aborted());
        let fut = Box::pin(fut);

        futures::future::select(fut, abort_fut).map(|either| match either {
            futures::future::Either::Left((value, _)) => Ok(value),
            futures::future::Either::Right((_unit, _)) => Err(StreamError::Aborted(None)),
        })
    }
}

/// The producer-facing handle obtained from [`WritableStream::get_writer`].
pub struct WritableStreamDefaultWriter<T: MaybeSend + 'static, Sink> {
    stream: WritableStream<T, Sink, Locked>,
    signals: WriterSignals,
    released: SharedPtr<AtomicBool>,
}

impl<T: MaybeSend + 'static, Sink> WritableStreamDefaultWriter<T, Sink> {
    fn new(stream: WritableStream<T, Sink, Locked>, signals: WriterSignals) -> Self {
        Self {
            stream,
            signals,
            released: SharedPtr::new(AtomicBool::new(false)),
        }
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Release the writer lock.
    ///
    /// `ready` and `closed` settle to a [`StreamError::Released`] rejection
    /// that no later stream transition can overwrite, and every subsequent
    /// operation on this writer rejects the same way. The stream itself is
    /// unaffected and can be locked by a new writer. Idempotent.
    pub fn release_lock(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.signals.ready.latch_rejected(StreamError::Released);
        self.signals.closed.latch_rejected(StreamError::Released);
        let _ = self
            .stream
            .command_tx
            .unbounded_send(StreamCommand::DetachWriter);
        self.stream.locked.store(false, Ordering::SeqCst);
    }

    /// How much more data the stream wants before backpressure engages.
    ///
    /// `None` while the stream is erroring or errored, `Some(0.0)` once
    /// closed; may be negative while the queue is over the high water mark.
    pub fn desired_size(&self) -> StreamResult<Option<f64>> {
        if self.is_released() {
            return Err(StreamError::Released);
        }
        let shared = &self.stream.shared;
        if shared.errored.load(Ordering::SeqCst) || shared.erroring.load(Ordering::SeqCst) {
            return Ok(None);
        }
        if shared.closed.load(Ordering::SeqCst) {
            return Ok(Some(0.0));
        }
        Ok(Some(self.stream.high_water_mark - shared.queue_total()))
    }

    /// Resolves while the stream can accept a write without exceeding the
    /// high water mark; replaced with a pending signal whenever backpressure
    /// re-engages.
    pub fn ready(&self) -> impl Future<Output = StreamResult<()>> {
        self.signals.ready.wait()
    }

    /// Settles when the stream closes (success) or errors (rejection with
    /// the stored error).
    pub fn closed(&self) -> impl Future<Output = StreamResult<()>> {
        self.signals.closed.wait()
    }
}

impl<T: MaybeSend + 'static, Sink> WritableStreamDefaultWriter<T, Sink>
where
    T: 'static,
    Sink: WritableSink<T> + 'static,
{
    /// Write a chunk to the stream by immediately enqueueing it.
    ///
    /// The returned future resolves once the sink has fully processed the
    /// chunk, and rejects if the chunk is dropped because the stream errored
    /// or was aborted first.
    ///
    /// Calling `write()` repeatedly without awaiting the returned futures (or
    /// [`ready()`]) ignores backpressure and lets the internal queue grow
    /// without bound; await [`ready()`] first to cooperate with the stream's
    /// flow control.
    ///
    /// [`ready()`]: Self::ready
    pub fn write(&self, chunk: T) -> impl Future<Output = StreamResult<()>> {
        let (tx, rx) = oneshot::channel();
        let enqueue_result = if self.is_released() {
            Err(StreamError::Released)
        } else {
            self.stream
                .command_tx
                .unbounded_send(StreamCommand::Write {
                    chunk,
                    completion: tx,
                })
                .map_err(|_| StreamError::TaskDropped)
        };

        async move {
            enqueue_result?;
            rx.await.unwrap_or_else(|_| Err(StreamError::TaskDropped))
        }
    }

    /// Waits for the stream to be ready (no backpressure), then enqueues the
    /// write without awaiting its completion.
    pub async fn enqueue_when_ready(&self, chunk: T) -> StreamResult<()> {
        if self.is_released() {
            return Err(StreamError::Released);
        }
        self.ready().await?;
        let _write_future = self.write(chunk);
        Ok(())
    }

    /// Immediately enqueue a chunk without waiting for completion.
    ///
    /// Fire-and-forget: no completion notification, no backpressure
    /// cooperation. Returns `Err` only if the chunk could not be enqueued at
    /// all.
    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        if self.is_released() {
            return Err(StreamError::Released);
        }
        if self.stream.shared.errored.load(Ordering::SeqCst) {
            return Err(self.stream.get_stored_error());
        }
        if self.stream.shared.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }

        let (tx, _rx) = oneshot::channel(); // Drop the receiver since we don't wait
        self.stream
            .command_tx
            .unbounded_send(StreamCommand::Write {
                chunk,
                completion: tx,
            })
            .map_err(|_| StreamError::TaskDropped)
    }

    /// Close the stream once every accepted write has drained.
    pub async fn close(&self) -> StreamResult<()> {
        if self.is_released() {
            return Err(StreamError::Released);
        }
        let (tx, rx) = oneshot::channel();
        self.stream
            .command_tx
            .unbounded_send(StreamCommand::Close { completion: tx })
            .map_err(|_| StreamError::TaskDropped)?;
        rx.await.unwrap_or_else(|_| Err(StreamError::TaskDropped))
    }

    /// Close, treating an already closing or closed stream as success.
    ///
    /// Useful for pipe-like consumers: an errored stream rejects with its
    /// stored error instead of a state error.
    pub async fn close_with_error_propagation(&self) -> StreamResult<()> {
        if self.is_released() {
            return Err(StreamError::Released);
        }
        let shared = &self.stream.shared;
        if shared.close_requested.load(Ordering::SeqCst) || shared.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if shared.errored.load(Ordering::SeqCst) {
            return Err(shared.stored_error());
        }
        self.close().await
    }

    /// Abort the stream with an optional reason.
    pub async fn abort(&self, reason: Option<String>) -> StreamResult<()> {
        if self.is_released() {
            return Err(StreamError::Released);
        }
        let (tx, rx) = oneshot::channel();
        self.stream
            .command_tx
            .unbounded_send(StreamCommand::Abort {
                reason,
                completion: tx,
            })
            .map_err(|_| StreamError::TaskDropped)?;
        rx.await.unwrap_or_else(|_| Err(StreamError::TaskDropped))
    }

    /// Wait until every write outstanding at this moment has settled.
    pub async fn flush(&self) -> StreamResult<()> {
        if self.is_released() {
            return Err(StreamError::Released);
        }
        let (tx, rx) = oneshot::channel();
        self.stream
            .command_tx
            .unbounded_send(StreamCommand::Flush { completion: tx })
            .map_err(|_| StreamError::TaskDropped)?;
        rx.await.unwrap_or_else(|_| Err(StreamError::TaskDropped))
    }
}

impl<T: MaybeSend + 'static, Sink> Clone for WritableStreamDefaultWriter<T, Sink> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
            signals: self.signals.clone(),
            released: SharedPtr::clone(&self.released),
        }
    }
}

impl<T: MaybeSend + 'static, Sink> Drop for WritableStreamDefaultWriter<T, Sink> {
    fn drop(&mut self) {
        self.release_lock();
    }
}

pub struct WritableStreamBuilder<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T> + 'static,
{
    sink: Sink,
    strategy: crate::platform::BoxedStrategyStatic<T>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T: MaybeSend + 'static, Sink> WritableStreamBuilder<T, Sink>
where
    T: 'static,
    Sink: WritableSink<T> + 'static,
{
    fn new(sink: Sink) -> Self {
        Self {
            sink,
            strategy: Box::new(CountQueuingStrategy::new(1.0)),
            _phantom: PhantomData,
        }
    }

    pub fn strategy<S: QueuingStrategy<T> + MaybeSend + 'static>(mut self, s: S) -> Self {
        self.strategy = Box::new(s);
        self
    }

    /// Return stream + driver future without spawning.
    ///
    /// Fails if the strategy's high water mark is negative or not finite.
    pub fn prepare(
        self,
    ) -> StreamResult<(WritableStream<T, Sink, Unlocked>, impl Future<Output = ()>)> {
        let high_water_mark = self.strategy.high_water_mark();
        if !high_water_mark.is_finite() || high_water_mark < 0.0 {
            return Err(StreamError::Range(format!(
                "high water mark must be a non-negative, finite number, got {high_water_mark}"
            )));
        }
        Ok(WritableStream::new_inner(
            self.sink,
            self.strategy,
            high_water_mark,
        ))
    }

    /// Spawn with an owned spawner function
    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<WritableStream<T, Sink, Unlocked>>
    where
        F: FnOnce(crate::platform::PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok(stream)
    }

    /// Spawn using a static spawner function reference
    pub fn spawn_ref<F, R>(self, spawn_fn: &'static F) -> StreamResult<WritableStream<T, Sink, Unlocked>>
    where
        F: Fn(crate::platform::PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok(stream)
    }
}

impl<T, Sink> WritableStream<T, Sink, Unlocked>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T> + 'static,
{
    /// Returns a builder for this writable stream
    pub fn builder(sink: Sink) -> WritableStreamBuilder<T, Sink> {
        WritableStreamBuilder::new(sink)
    }
}
