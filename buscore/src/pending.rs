//! Pending method calls.
//!
//! A [PendingCall] wraps the transport's handle for one outstanding method call. The
//! transport reports completion through a [Notifier] that the pending call installs on
//! the handle. The notifier owns a strong reference to the pending call and the
//! transport releases it exactly once: either by calling [Notifier::notify] or by
//! dropping it.

use {
    crate::{reply::remote_error, Error},
    parking_lot::{Condvar, Mutex},
    pin_project::pin_project,
    std::{
        future::Future,
        mem,
        num::NonZeroU32,
        pin::Pin,
        sync::Arc,
        task::{Context, Poll},
        time::{Duration, Instant},
    },
    tokio::sync::oneshot,
    zbus::{message::Type, Message},
};

/// The result of a method call.
///
/// Error messages sent by the peer are delivered as [Error::Remote].
pub type Reply = Result<Message, Error>;

type Callback = Box<dyn FnOnce(Reply) + Send>;

/// Why a transport refused a [Notifier].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NotifyError {
    /// The handle already carries a notifier.
    AlreadyInstalled,
    /// The transport could not register the notifier.
    Rejected,
}

/// The transport-side handle of an outstanding method call.
pub trait RawPendingCall: Send + Sync {
    /// The serial of the method call message.
    fn serial(&self) -> NonZeroU32;

    /// Returns whether the call has completed.
    fn is_completed(&self) -> bool;

    /// Takes the reply out of a completed call.
    ///
    /// Returns `None` if the call has not completed or the reply has already been
    /// taken.
    fn steal_reply(&self) -> Option<Reply>;

    /// Installs the completion notifier.
    ///
    /// The transport must either call [Notifier::notify] once the call completes or
    /// drop the notifier. A notifier installed on an already completed call is never
    /// notified. If this function returns an error, the notifier has been dropped.
    ///
    /// This function must not invoke the notifier itself.
    fn set_notify(&self, notifier: Notifier) -> Result<(), NotifyError>;

    /// Asks the transport to abandon the call.
    fn cancel(&self);
}

/// The completion cookie handed to a transport.
#[must_use]
pub struct Notifier {
    call: Arc<Inner>,
}

impl Notifier {
    /// Reports that the call has completed.
    pub fn notify(self) {
        self.call.on_completed();
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Pending,
    Completed,
}

struct State {
    phase: Phase,
    reply: Option<Reply>,
    callback: Option<Callback>,
    futures: Vec<oneshot::Sender<Reply>>,
}

struct Inner {
    raw: Arc<dyn RawPendingCall>,
    state: Mutex<State>,
    completed: Condvar,
}

/// What has to happen once a reply is stored and the lock is released.
struct Delivery {
    reply: Reply,
    callback: Option<Callback>,
    futures: Vec<oneshot::Sender<Reply>>,
}

impl Delivery {
    fn run(self) {
        for future in self.futures {
            let _ = future.send(self.reply.clone());
        }
        if let Some(callback) = self.callback {
            callback(self.reply);
        }
    }
}

/// An outstanding method call.
///
/// This object can be cloned cheaply. All clones refer to the same call.
#[derive(Clone)]
pub struct PendingCall {
    inner: Arc<Inner>,
}

impl Inner {
    fn on_completed(&self) {
        let delivery = {
            let mut state = self.state.lock();
            if !self.raw.is_completed() {
                return;
            }
            let Some(reply) = self.raw.steal_reply() else {
                return;
            };
            state.complete(reply)
        };
        self.completed.notify_all();
        if let Some(delivery) = delivery {
            delivery.run();
        }
    }
}

impl State {
    /// Stores the reply and returns the deliveries to run once the lock is released.
    fn complete(&mut self, reply: Reply) -> Option<Delivery> {
        if mem::replace(&mut self.phase, Phase::Completed) == Phase::Completed {
            return None;
        }
        let reply = match reply {
            Ok(msg) if msg.message_type() == Type::Error => Err(remote_error(&msg)),
            r => r,
        };
        self.reply = Some(reply.clone());
        Some(Delivery {
            reply,
            callback: self.callback.take(),
            futures: mem::take(&mut self.futures),
        })
    }
}

impl PendingCall {
    /// Wraps a transport handle.
    ///
    /// Fails with [Error::InvalidArgument] if the handle already belongs to another
    /// pending call and with [Error::SetupFailed] if the transport refuses the notifier.
    pub fn create(raw: Arc<dyn RawPendingCall>) -> Result<Self, Error> {
        let inner = Arc::new(Inner {
            raw: raw.clone(),
            state: Mutex::new(State {
                phase: Phase::Pending,
                reply: None,
                callback: None,
                futures: vec![],
            }),
            completed: Condvar::new(),
        });
        // Held until the late check below is done so that a notifier running on
        // another thread observes a fully set up call.
        let mut state = inner.state.lock();
        let notifier = Notifier {
            call: inner.clone(),
        };
        match raw.set_notify(notifier) {
            Ok(()) => {}
            Err(NotifyError::AlreadyInstalled) => {
                return Err(Error::InvalidArgument(
                    "the call handle is owned by another pending call",
                ))
            }
            Err(NotifyError::Rejected) => return Err(Error::SetupFailed),
        }
        // The reply might have arrived before the notifier was in place.
        if raw.is_completed() {
            if let Some(reply) = raw.steal_reply() {
                // Nobody can be waiting yet, so nothing needs to run.
                let _ = state.complete(reply);
            }
        }
        drop(state);
        Ok(Self { inner })
    }

    /// The serial of the method call.
    pub fn serial(&self) -> NonZeroU32 {
        self.inner.raw.serial()
    }

    /// Returns whether the reply has been received.
    pub fn is_completed(&self) -> bool {
        self.inner.state.lock().phase == Phase::Completed
    }

    /// Sets the callback invoked with the reply.
    ///
    /// A previously set callback is replaced and will not be called. If the reply has
    /// already been received, the callback is invoked immediately on this thread.
    /// Otherwise it runs on whatever thread completes the call.
    pub fn then(&self, callback: impl FnOnce(Reply) + Send + 'static) {
        let reply = {
            let mut state = self.inner.state.lock();
            match &state.reply {
                Some(reply) => reply.clone(),
                None => {
                    state.callback = Some(Box::new(callback));
                    return;
                }
            }
        };
        callback(reply);
    }

    /// Requests cancellation.
    ///
    /// The call still completes through the regular path, usually with
    /// [Error::Cancelled]. This function does not wait for that to happen.
    pub fn cancel(&self) {
        self.inner.raw.cancel();
    }

    /// Blocks the current thread until the reply arrives or the timeout expires.
    ///
    /// Callbacks set with [Self::then] are left in place. A timeout leaves the call
    /// untouched and it can be waited on again.
    ///
    /// Do not call this on the thread running [Executor::run](crate::Executor::run).
    /// That thread delivers the reply, so the wait would always run into the timeout.
    /// [Executor::wait](crate::Executor::wait) refuses to do that.
    pub fn wait(&self, timeout: Duration) -> Reply {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.inner.state.lock();
        while state.reply.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.inner.completed.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.inner.completed.wait(&mut state),
            }
        }
        state.reply.clone().unwrap_or(Err(Error::Timeout))
    }

    /// Returns a future that resolves to the reply.
    ///
    /// Callbacks set with [Self::then] are left in place.
    pub fn reply(&self) -> ReplyFuture {
        let (send, recv) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            match &state.reply {
                Some(reply) => {
                    let _ = send.send(reply.clone());
                }
                None => state.futures.push(send),
            }
        }
        ReplyFuture {
            call: self.clone(),
            recv,
        }
    }
}

/// A future representing a method call reply.
#[pin_project]
pub struct ReplyFuture {
    call: PendingCall,
    #[pin]
    recv: oneshot::Receiver<Reply>,
}

impl ReplyFuture {
    /// The call this future waits for.
    pub fn call(&self) -> &PendingCall {
        &self.call
    }
}

impl Future for ReplyFuture {
    type Output = Reply;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project()
            .recv
            .poll(cx)
            .map(|v| v.unwrap_or(Err(Error::ConnectionLost)))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::raw::RawCall,
        std::{
            sync::{
                atomic::{AtomicUsize, Ordering::SeqCst},
                Barrier,
            },
            thread,
        },
    };

    fn serial(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    fn reply_msg() -> Message {
        let call = Message::method_call("/org/freedesktop/DBus", "ListNames")
            .unwrap()
            .build(&())
            .unwrap();
        Message::method_return(&call.header())
            .unwrap()
            .build(&"hello")
            .unwrap()
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce(Reply) + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move |reply: Reply| {
            assert!(reply.is_ok());
            c.fetch_add(1, SeqCst);
        })
    }

    #[test]
    fn callback_after_completion_fires_once_synchronously() {
        let raw = Arc::new(RawCall::new(serial(1)));
        let call = PendingCall::create(raw.clone()).unwrap();
        raw.complete(Ok(reply_msg()));
        assert!(call.is_completed());
        let (count, cb) = counter();
        call.then(cb);
        assert_eq!(count.load(SeqCst), 1);
    }

    #[test]
    fn callback_before_completion_fires_on_completion() {
        let raw = Arc::new(RawCall::new(serial(2)));
        let call = PendingCall::create(raw.clone()).unwrap();
        let (count, cb) = counter();
        call.then(cb);
        assert_eq!(count.load(SeqCst), 0);
        raw.complete(Ok(reply_msg()));
        raw.complete(Ok(reply_msg()));
        assert_eq!(count.load(SeqCst), 1);
    }

    #[test]
    fn reply_stored_before_notifier_is_picked_up() {
        let raw = Arc::new(RawCall::new(serial(3)));
        raw.complete(Ok(reply_msg()));
        let call = PendingCall::create(raw.clone()).unwrap();
        assert!(call.is_completed());
        let (count, cb) = counter();
        call.then(cb);
        assert_eq!(count.load(SeqCst), 1);
    }

    #[test]
    fn then_replaces_previous_callback() {
        let raw = Arc::new(RawCall::new(serial(4)));
        let call = PendingCall::create(raw.clone()).unwrap();
        let (first, cb) = counter();
        call.then(cb);
        let (second, cb) = counter();
        call.then(cb);
        raw.complete(Ok(reply_msg()));
        assert_eq!(first.load(SeqCst), 0);
        assert_eq!(second.load(SeqCst), 1);
    }

    #[test]
    fn error_message_becomes_remote_error() {
        let raw = Arc::new(RawCall::new(serial(5)));
        let call = PendingCall::create(raw.clone()).unwrap();
        let request = Message::method_call("/", "Frobnicate").unwrap().build(&()).unwrap();
        let err = Message::error(&request.header(), "org.example.Error.Nope")
            .unwrap()
            .build(&"no")
            .unwrap();
        raw.complete(Ok(err));
        let res = call.wait(Duration::from_secs(1));
        assert_eq!(res.unwrap_err().remote_name(), Some("org.example.Error.Nope"));
    }

    #[test]
    fn handle_cannot_back_two_calls() {
        let raw = Arc::new(RawCall::new(serial(6)));
        let _call = PendingCall::create(raw.clone()).unwrap();
        assert!(matches!(
            PendingCall::create(raw),
            Err(Error::InvalidArgument(_))
        ));
    }

    struct Rejecting;

    impl RawPendingCall for Rejecting {
        fn serial(&self) -> NonZeroU32 {
            serial(7)
        }

        fn is_completed(&self) -> bool {
            false
        }

        fn steal_reply(&self) -> Option<Reply> {
            None
        }

        fn set_notify(&self, notifier: Notifier) -> Result<(), NotifyError> {
            drop(notifier);
            Err(NotifyError::Rejected)
        }

        fn cancel(&self) {}
    }

    #[test]
    fn rejected_notifier_is_setup_failure() {
        let raw: Arc<dyn RawPendingCall> = Arc::new(Rejecting);
        assert!(matches!(
            PendingCall::create(raw.clone()),
            Err(Error::SetupFailed)
        ));
        // The notifier and the pending call it referenced are gone.
        assert_eq!(Arc::strong_count(&raw), 1);
    }

    #[test]
    fn notifier_is_released_after_completion() {
        let raw = Arc::new(RawCall::new(serial(8)));
        let call = PendingCall::create(raw.clone()).unwrap();
        assert_eq!(Arc::strong_count(&call.inner), 2);
        raw.complete(Ok(reply_msg()));
        assert_eq!(Arc::strong_count(&call.inner), 1);
    }

    #[test]
    fn wait_times_out_without_completing() {
        let raw = Arc::new(RawCall::new(serial(9)));
        let call = PendingCall::create(raw.clone()).unwrap();
        assert!(matches!(
            call.wait(Duration::from_millis(10)),
            Err(Error::Timeout)
        ));
        assert!(!call.is_completed());
        raw.complete(Ok(reply_msg()));
        assert!(call.wait(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn callback_may_reenter_the_call() {
        let raw = Arc::new(RawCall::new(serial(10)));
        let call = PendingCall::create(raw.clone()).unwrap();
        let c = call.clone();
        let (count, cb) = counter();
        call.then(move |reply| {
            assert!(c.is_completed());
            c.then(|_| {});
            cb(reply);
        });
        raw.complete(Ok(reply_msg()));
        assert_eq!(count.load(SeqCst), 1);
    }

    #[test]
    fn racing_then_and_completion_deliver_once() {
        for i in 0..500 {
            let raw = Arc::new(RawCall::new(serial(1000 + i)));
            let call = PendingCall::create(raw.clone()).unwrap();
            let (count, cb) = counter();
            let barrier = Arc::new(Barrier::new(2));
            let b = barrier.clone();
            let completer = thread::spawn(move || {
                b.wait();
                raw.complete(Ok(reply_msg()));
            });
            barrier.wait();
            call.then(cb);
            completer.join().unwrap();
            assert_eq!(count.load(SeqCst), 1, "iteration {i}");
        }
    }

    #[test]
    fn racing_setup_and_completion_deliver_once() {
        for i in 0..500 {
            let raw = Arc::new(RawCall::new(serial(5000 + i)));
            let barrier = Arc::new(Barrier::new(2));
            let b = barrier.clone();
            let r = raw.clone();
            let completer = thread::spawn(move || {
                b.wait();
                r.complete(Ok(reply_msg()));
            });
            barrier.wait();
            let call = PendingCall::create(raw).unwrap();
            completer.join().unwrap();
            let (count, cb) = counter();
            call.then(cb);
            assert_eq!(count.load(SeqCst), 1, "iteration {i}");
        }
    }

    #[test]
    fn then_does_not_disturb_a_blocked_waiter() {
        let raw = Arc::new(RawCall::new(serial(11)));
        let call = PendingCall::create(raw.clone()).unwrap();
        let c = call.clone();
        let waiter = thread::spawn(move || c.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        let (count, cb) = counter();
        call.then(cb);
        assert!(!waiter.is_finished());
        raw.complete(Ok(reply_msg()));
        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(count.load(SeqCst), 1);
    }

    #[test]
    fn wait_keeps_the_callback() {
        let raw = Arc::new(RawCall::new(serial(12)));
        let call = PendingCall::create(raw.clone()).unwrap();
        let (count, cb) = counter();
        call.then(cb);
        assert!(matches!(
            call.wait(Duration::from_millis(10)),
            Err(Error::Timeout)
        ));
        raw.complete(Ok(reply_msg()));
        assert!(call.wait(Duration::from_millis(10)).is_ok());
        assert_eq!(count.load(SeqCst), 1);
    }

    #[test]
    fn reply_future_resolves() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let raw = Arc::new(RawCall::new(serial(13)));
        let call = PendingCall::create(raw.clone()).unwrap();
        let (count, cb) = counter();
        call.then(cb);
        let future = call.reply();
        assert_eq!(future.call().serial(), serial(13));
        let r = raw.clone();
        let completer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            r.complete(Ok(reply_msg()));
        });
        let msg = rt.block_on(future).unwrap();
        assert_eq!(msg.body().deserialize::<String>().unwrap(), "hello");
        completer.join().unwrap();
        assert_eq!(count.load(SeqCst), 1);
        // A future created after completion resolves right away.
        assert!(rt.block_on(call.reply()).is_ok());
    }
}
