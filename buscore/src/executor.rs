//! The dispatch loop.
//!
//! An [Executor] owns one [Transport]. One thread calls [Executor::run] and from then on
//! receives every incoming message: replies complete the matching [PendingCall], signals
//! are fanned out to the [SignalRouter]s, and method calls are handed to the method
//! handler. Any other thread may send messages and wait for replies at the same time.

use {
    crate::{
        bus::{ADD_MATCH, DBUS_INTERFACE, DBUS_NAME, DBUS_PATH, REMOVE_MATCH},
        raw::RawCall,
        reply::{decode_reply, ERROR_NO_REPLY, ERROR_UNKNOWN_METHOD},
        router::panic_message,
        transport::Transport,
        Error, MatchRule, PendingCall, PendingReply, Reply, SignalRouter,
    },
    error_reporter::Report,
    parking_lot::Mutex,
    serde::Serialize,
    std::{
        collections::HashMap,
        mem,
        num::NonZeroU32,
        panic::{self, AssertUnwindSafe},
        sync::{
            atomic::{AtomicBool, Ordering::Relaxed},
            Arc, Weak,
        },
        thread::{self, ThreadId},
        time::{Duration, Instant},
    },
    zbus::{
        message::{Builder, Flags, Type},
        names::{BusName, InterfaceName, MemberName},
        zvariant::{DynamicDeserialize, DynamicType, ObjectPath},
        Message,
    },
};

/// Tuning knobs of an [Executor].
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// How long a method call may go unanswered before it fails with
    /// `org.freedesktop.DBus.Error.NoReply`. `None` disables the limit.
    pub call_timeout: Option<Duration>,
    /// The longest time [Executor::run] sleeps before checking for timeouts and for
    /// [Executor::stop].
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            call_timeout: Some(Duration::from_secs(25)),
            poll_interval: Duration::from_millis(100),
        }
    }
}

type MethodHandler = Arc<dyn Fn(PendingReply) + Send + Sync>;
type RouterKey = (String, String);

struct Outstanding {
    raw: Arc<RawCall>,
    deadline: Option<Instant>,
}

struct SharedMut {
    calls: HashMap<NonZeroU32, Outstanding>,
    routers: HashMap<RouterKey, Vec<Weak<SignalRouter>>>,
    method_handler: Option<MethodHandler>,
    dispatch_thread: Option<ThreadId>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    config: ExecutorConfig,
    shared: Mutex<SharedMut>,
    killed: AtomicBool,
    stopped: AtomicBool,
    running: AtomicBool,
}

/// A holder object for an [Executor].
///
/// When this object is dropped, the executor is torn down: outstanding calls fail with
/// [Error::ConnectionLost], routers stop receiving signals, and the transport is closed.
#[non_exhaustive]
pub struct ExecutorHolder {
    /// The [Executor].
    pub executor: Arc<Executor>,
}

impl Drop for ExecutorHolder {
    fn drop(&mut self) {
        self.executor.shared.kill();
    }
}

/// Pumps a transport and routes its messages.
pub struct Executor {
    shared: Arc<Shared>,
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shared.kill();
    }
}

struct RunGuard<'a>(&'a Shared);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.shared.lock().dispatch_thread = None;
        self.0.running.store(false, Relaxed);
    }
}

impl Shared {
    fn kill(&self) {
        let (calls, routers, handler) = {
            let mut shared = self.shared.lock();
            self.killed.store(true, Relaxed);
            (
                mem::take(&mut shared.calls),
                mem::take(&mut shared.routers),
                shared.method_handler.take(),
            )
        };
        drop(routers);
        drop(handler);
        for (_, call) in calls {
            call.raw.complete(Err(Error::ConnectionLost));
        }
        self.transport.close();
    }

    /// Completes a tracked call. Returns `false` if the serial is not tracked.
    fn finish(&self, serial: NonZeroU32, reply: Reply) -> bool {
        let call = self.shared.lock().calls.remove(&serial);
        match call {
            Some(call) => {
                call.raw.complete(reply);
                true
            }
            None => false,
        }
    }

    fn send_with_reply(self: &Arc<Self>, msg: Message) -> Result<PendingCall, Error> {
        let serial = msg.primary_header().serial_num();
        let weak = Arc::downgrade(self);
        let raw = Arc::new(RawCall::with_cancel_hook(serial, move |serial| {
            if let Some(shared) = weak.upgrade() {
                shared.finish(serial, Err(Error::Cancelled));
            }
        }));
        let killed = {
            let mut shared = self.shared.lock();
            let killed = self.killed.load(Relaxed);
            if !killed {
                let deadline = self.config.call_timeout.map(|t| Instant::now() + t);
                let call = Outstanding {
                    raw: raw.clone(),
                    deadline,
                };
                shared.calls.insert(serial, call);
            }
            killed
        };
        if killed {
            raw.complete(Err(Error::ConnectionLost));
        }
        let call = match PendingCall::create(raw) {
            Ok(c) => c,
            Err(e) => {
                self.shared.lock().calls.remove(&serial);
                return Err(e);
            }
        };
        if !killed {
            if let Err(e) = self.transport.send(msg) {
                self.finish(serial, Err(e));
            }
        }
        Ok(call)
    }

    fn send_no_reply(&self, msg: Message) -> Result<(), Error> {
        if self.killed.load(Relaxed) {
            return Err(Error::ConnectionLost);
        }
        self.transport.send(msg)
    }

    fn pump(self: &Arc<Self>) -> Result<(), Error> {
        loop {
            if self.stopped.load(Relaxed) || self.killed.load(Relaxed) {
                return Ok(());
            }
            self.expire_calls();
            match self.transport.recv(self.config.poll_interval) {
                Ok(Some(msg)) => self.dispatch(msg),
                Ok(None) => {}
                Err(_) if self.killed.load(Relaxed) => return Ok(()),
                Err(e) => {
                    log::error!("The bus connection failed: {}", Report::new(e.clone()));
                    self.kill();
                    return Err(e);
                }
            }
        }
    }

    fn expire_calls(&self) {
        let now = Instant::now();
        let mut expired = vec![];
        self.shared.lock().calls.retain(|_, call| {
            let overdue = call.deadline.is_some_and(|d| d <= now);
            if overdue {
                expired.push(call.raw.clone());
            }
            !overdue
        });
        for raw in expired {
            raw.complete(Err(Error::Remote {
                name: ERROR_NO_REPLY.to_string(),
                description: "Did not receive a reply before the timeout expired".to_string(),
            }));
        }
    }

    fn dispatch(&self, msg: Message) {
        match msg.message_type() {
            Type::MethodReturn | Type::Error => {
                let serial = msg.header().reply_serial();
                let Some(serial) = serial else {
                    return;
                };
                if !self.finish(serial, Ok(msg)) {
                    log::debug!("Ignoring the reply to untracked call {serial}");
                }
            }
            Type::Signal => self.dispatch_signal(&msg),
            Type::MethodCall => self.dispatch_call(msg),
        }
    }

    fn dispatch_signal(&self, msg: &Message) {
        let key = {
            let header = msg.header();
            match (header.interface(), header.member()) {
                (Some(i), Some(m)) => (i.to_string(), m.to_string()),
                _ => return,
            }
        };
        let routers: Vec<Arc<SignalRouter>> = {
            let shared = self.shared.lock();
            if self.killed.load(Relaxed) {
                return;
            }
            match shared.routers.get(&key) {
                Some(list) => list.iter().filter_map(Weak::upgrade).collect(),
                None => return,
            }
        };
        for router in &routers {
            if self.killed.load(Relaxed) {
                break;
            }
            router.dispatch(msg);
        }
    }

    fn dispatch_call(&self, msg: Message) {
        let handler = self.shared.lock().method_handler.clone();
        let mut pr = PendingReply::new(msg, self.transport.clone());
        let Some(handler) = handler else {
            let member = pr
                .message()
                .header()
                .member()
                .map(|m| m.to_string())
                .unwrap_or_default();
            pr.send_named_err(
                ERROR_UNKNOWN_METHOD,
                &format!("No handler for method {member}"),
            );
            return;
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(pr))) {
            log::error!("The method handler panicked: {}", panic_message(&*payload));
        }
    }

    fn release_router(&self, router: &SignalRouter) {
        let key = (router.interface().to_string(), router.member().to_string());
        {
            let mut shared = self.shared.lock();
            if let Some(list) = shared.routers.get_mut(&key) {
                list.retain(|r| r.strong_count() > 0);
                if list.is_empty() {
                    shared.routers.remove(&key);
                }
            }
        }
        if self.killed.load(Relaxed) {
            return;
        }
        let rule = router.rule().compile();
        let res = bus_call(REMOVE_MATCH)
            .and_then(|b| b.with_flags(Flags::NoReplyExpected))
            .and_then(|b| b.build(&rule))
            .map_err(Error::send)
            .and_then(|msg| self.send_no_reply(msg));
        if let Err(e) = res {
            log::warn!("Could not remove match rule {rule}: {}", Report::new(e));
        }
    }
}

fn bus_call(member: MemberName<'static>) -> zbus::Result<Builder<'static>> {
    Message::method_call(DBUS_PATH, member)?
        .destination(DBUS_NAME)?
        .interface(DBUS_INTERFACE)
}

impl Executor {
    /// Creates an executor for a transport.
    ///
    /// Note that the executor can only be used while you are holding on to the
    /// [ExecutorHolder].
    pub fn attach(transport: impl Transport, config: ExecutorConfig) -> ExecutorHolder {
        let shared = Arc::new(Shared {
            transport: Arc::new(transport),
            config,
            shared: Mutex::new(SharedMut {
                calls: Default::default(),
                routers: Default::default(),
                method_handler: None,
                dispatch_thread: None,
            }),
            killed: Default::default(),
            stopped: Default::default(),
            running: Default::default(),
        });
        ExecutorHolder {
            executor: Arc::new(Self { shared }),
        }
    }

    /// Pumps the transport on the current thread until [Self::stop] is called, the
    /// executor is torn down, or the connection fails.
    ///
    /// Returns immediately if [Self::stop] has already been called. Returns
    /// [Error::InvalidArgument] if another thread is already running the executor.
    pub fn run(&self) -> Result<(), Error> {
        if self.shared.running.swap(true, Relaxed) {
            return Err(Error::InvalidArgument("the executor is already running"));
        }
        let _guard = RunGuard(&self.shared);
        self.shared.shared.lock().dispatch_thread = Some(thread::current().id());
        self.shared.pump()
    }

    /// Makes [Self::run] return.
    ///
    /// This can be called from any thread, including from callbacks running on the
    /// dispatch thread. The request is sticky: an executor that has been stopped cannot
    /// be run again.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Relaxed);
    }

    /// Returns whether [Self::stop] has been called.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Relaxed)
    }

    /// The unique name of the connection, if it has one.
    pub fn unique_name(&self) -> Option<String> {
        self.shared.transport.unique_name()
    }

    /// Sends a message.
    ///
    /// Method calls that expect a reply return the [PendingCall] tracking the reply.
    /// Everything else returns `None`.
    pub fn send(&self, msg: Message) -> Result<Option<PendingCall>, Error> {
        let wants_reply = msg.message_type() == Type::MethodCall
            && !msg
                .primary_header()
                .flags()
                .contains(Flags::NoReplyExpected);
        if wants_reply {
            return self.shared.send_with_reply(msg).map(Some);
        }
        self.shared.send_no_reply(msg)?;
        Ok(None)
    }

    /// Calls a method.
    pub fn call<'a>(
        &self,
        destination: impl Into<BusName<'a>>,
        interface: impl Into<InterfaceName<'a>>,
        path: impl Into<ObjectPath<'a>>,
        method: impl Into<MemberName<'a>>,
        body: &(impl Serialize + DynamicType),
    ) -> Result<PendingCall, Error> {
        let msg = Message::method_call(path.into(), method.into())
            .and_then(|b| b.destination(destination.into()))
            .and_then(|b| b.interface(interface.into()))
            .and_then(|b| b.build(body))
            .map_err(Error::send)?;
        self.shared.send_with_reply(msg)
    }

    /// Calls a method and blocks until the reply arrives.
    ///
    /// The call is cancelled if no reply arrives within `timeout`. This function cannot
    /// be used on the thread running [Self::run] since that thread is the one that
    /// would receive the reply.
    pub fn invoke_sync<'a, R>(
        &self,
        destination: impl Into<BusName<'a>>,
        interface: impl Into<InterfaceName<'a>>,
        path: impl Into<ObjectPath<'a>>,
        method: impl Into<MemberName<'a>>,
        body: &(impl Serialize + DynamicType),
        timeout: Duration,
    ) -> Result<R, Error>
    where
        R: for<'b> DynamicDeserialize<'b>,
    {
        self.check_blocking()?;
        let call = self.call(destination, interface, path, method, body)?;
        let msg = call.wait(timeout).inspect_err(|e| {
            if matches!(e, Error::Timeout) {
                call.cancel();
            }
        })?;
        decode_reply(&msg)
    }

    /// Blocks until a call completes or the timeout expires.
    ///
    /// Like [Self::invoke_sync], this refuses to block the dispatch thread.
    pub fn wait(&self, call: &PendingCall, timeout: Duration) -> Reply {
        self.check_blocking()?;
        call.wait(timeout)
    }

    fn check_blocking(&self) -> Result<(), Error> {
        let dispatch = self.shared.shared.lock().dispatch_thread;
        if dispatch == Some(thread::current().id()) {
            return Err(Error::InvalidArgument(
                "cannot block the thread that dispatches replies",
            ));
        }
        Ok(())
    }

    /// Emits a signal.
    pub fn emit_signal<'a>(
        &self,
        path: impl Into<ObjectPath<'a>>,
        interface: impl Into<InterfaceName<'a>>,
        member: impl Into<MemberName<'a>>,
        body: &(impl Serialize + DynamicType),
    ) -> Result<(), Error> {
        let msg = Message::signal(path.into(), interface.into(), member.into())
            .and_then(|b| b.build(body))
            .map_err(Error::send)?;
        self.shared.send_no_reply(msg)
    }

    /// Returns the router for a signal rule.
    ///
    /// Requests for equal rules share one router. The first request registers the rule
    /// with the bus. The rule is removed from the bus once the last reference to the
    /// router is gone.
    pub fn signal(&self, rule: MatchRule) -> Result<Arc<SignalRouter>, Error> {
        let mut router = SignalRouter::new(rule)?;
        let key = (router.interface().to_string(), router.member().to_string());
        let (router, created, live) = {
            let mut shared = self.shared.shared.lock();
            if self.shared.killed.load(Relaxed) {
                return Err(Error::ConnectionLost);
            }
            let list = shared.routers.entry(key).or_default();
            let live: Vec<_> = list.iter().filter_map(Weak::upgrade).collect();
            list.retain(|r| r.strong_count() > 0);
            let existing = live.iter().find(|r| r.rule() == router.rule()).cloned();
            match existing {
                Some(found) => (found, false, live),
                None => {
                    let weak = Arc::downgrade(&self.shared);
                    router.set_release_hook(move |router| {
                        if let Some(shared) = weak.upgrade() {
                            shared.release_router(router);
                        }
                    });
                    let router = Arc::new(router);
                    list.push(Arc::downgrade(&router));
                    (router, true, live)
                }
            }
        };
        drop(live);
        if created {
            let rule = router.rule().compile();
            let res = self.call(DBUS_NAME, DBUS_INTERFACE, DBUS_PATH, ADD_MATCH, &rule);
            match res {
                Ok(call) => call.then(move |res| {
                    if let Err(e) = res {
                        log::error!("Could not add match rule {rule}: {}", Report::new(e));
                    }
                }),
                Err(e) => log::error!("Could not add match rule {rule}: {}", Report::new(e)),
            }
        }
        Ok(router)
    }

    /// Installs the handler for incoming method calls.
    ///
    /// The [PendingReply] passed into the handler should be used to reply to the call.
    /// Without a handler, every call is answered with
    /// `org.freedesktop.DBus.Error.UnknownMethod`.
    pub fn set_method_handler(&self, handler: impl Fn(PendingReply) + Send + Sync + 'static) {
        let mut shared = self.shared.shared.lock();
        if !self.shared.killed.load(Relaxed) {
            shared.method_handler = Some(Arc::new(handler));
        }
    }
}
