use {
    crate::{match_rule::string_arg, Error, MatchRule},
    error_reporter::Report,
    parking_lot::{Mutex, ReentrantMutex},
    std::{
        any::Any,
        fmt,
        panic::{self, AssertUnwindSafe},
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering::Relaxed},
            Arc,
        },
    },
    zbus::{
        message::Type,
        zvariant::{DynamicDeserialize, Structure},
        Message,
    },
};

/// Requires the string argument at `index` to equal `value`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArgFilter {
    /// The position of the argument in the message body.
    pub index: u8,
    /// The required value. Non-string arguments never match.
    pub value: String,
}

impl ArgFilter {
    /// Creates a filter on argument `index`.
    pub fn new(index: u8, value: impl Into<String>) -> Self {
        Self {
            index,
            value: value.into(),
        }
    }

    /// Returns whether the body of `msg` carries `value` at `index`.
    pub fn matches(&self, msg: &Message) -> bool {
        let body = msg.body();
        match body.deserialize::<Structure<'_>>() {
            Ok(s) => string_arg(s.fields(), self.index) == Some(self.value.as_str()),
            Err(_) => false,
        }
    }
}

type Callback = dyn Fn(&Message) + Send + Sync;

struct Subscriber {
    id: u64,
    disabled: AtomicBool,
    filter: Option<ArgFilter>,
    callback: Box<Callback>,
}

type ReleaseHook = Box<dyn FnOnce(&SignalRouter) + Send + Sync>;

/// Delivers one kind of signal to any number of subscribers.
///
/// Routers are usually obtained from [Executor::signal](crate::Executor::signal) which
/// feeds them all matching signals received on the connection.
///
/// Subscribers are invoked in the order in which they subscribed. Calls to
/// [Self::dispatch] never overlap. A subscriber that panics is logged and does not
/// affect the other subscribers.
pub struct SignalRouter {
    interface: String,
    member: String,
    rule: MatchRule,
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    dispatching: ReentrantMutex<()>,
    next_id: AtomicU64,
    on_release: Option<ReleaseHook>,
}

impl fmt::Debug for SignalRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalRouter")
            .field("rule", &self.rule)
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

impl SignalRouter {
    /// Creates a router for the signals selected by `rule`.
    ///
    /// The rule must name an interface and a member. Its message type is forced to
    /// signal.
    pub fn new(rule: MatchRule) -> Result<Self, Error> {
        let interface = rule
            .get_interface()
            .ok_or(Error::InvalidArgument("signal rule without interface"))?
            .to_string();
        let member = rule
            .get_member()
            .ok_or(Error::InvalidArgument("signal rule without member"))?
            .to_string();
        Ok(Self {
            interface,
            member,
            rule: rule.msg_type(Type::Signal),
            subscribers: Default::default(),
            dispatching: ReentrantMutex::new(()),
            next_id: AtomicU64::new(0),
            on_release: None,
        })
    }

    /// Sets a function that runs when the router is dropped.
    pub(crate) fn set_release_hook(
        &mut self,
        hook: impl FnOnce(&SignalRouter) + Send + Sync + 'static,
    ) {
        self.on_release = Some(Box::new(hook));
    }

    /// The interface of the signals this router receives.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// The member of the signals this router receives.
    pub fn member(&self) -> &str {
        &self.member
    }

    /// The rule selecting the signals this router dispatches.
    pub fn rule(&self) -> &MatchRule {
        &self.rule
    }

    /// The number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Adds a subscriber that receives the raw signal message.
    ///
    /// If `filter` is set, only signals whose arguments satisfy it are delivered.
    /// Dropping the returned [Subscription] removes the subscriber.
    pub fn subscribe(
        self: &Arc<Self>,
        filter: Option<ArgFilter>,
        callback: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Relaxed);
        self.subscribers.lock().push(Arc::new(Subscriber {
            id,
            disabled: Default::default(),
            filter,
            callback: Box::new(callback),
        }));
        Subscription {
            router: self.clone(),
            id,
            detached: false,
        }
    }

    /// Adds a subscriber that receives the deserialized signal arguments.
    ///
    /// Signals whose body cannot be deserialized into `B` are logged and skipped.
    pub fn subscribe_typed<B>(
        self: &Arc<Self>,
        filter: Option<ArgFilter>,
        callback: impl Fn(B) + Send + Sync + 'static,
    ) -> Subscription
    where
        B: for<'a> DynamicDeserialize<'a> + Send + 'static,
    {
        let name = format!("{}.{}", self.interface, self.member);
        self.subscribe(filter, move |msg: &Message| {
            match msg.body().deserialize().map_err(Error::deserialize) {
                Ok(body) => callback(body),
                Err(e) => {
                    log::error!("Could not deserialize {name} signal body: {}", Report::new(e));
                }
            }
        })
    }

    fn unsubscribe(&self, id: u64) {
        let removed = {
            let mut subscribers = self.subscribers.lock();
            let pos = subscribers.iter().position(|s| s.id == id);
            pos.map(|pos| subscribers.remove(pos))
        };
        if let Some(sub) = removed {
            sub.disabled.store(true, Relaxed);
        }
    }

    /// Delivers a signal to the subscribers.
    ///
    /// Messages that do not satisfy [Self::rule] are ignored.
    pub fn dispatch(&self, msg: &Message) {
        if !self.rule.matches(msg) {
            return;
        }
        let _serialized = self.dispatching.lock();
        let subscribers = self.subscribers.lock().clone();
        for sub in subscribers {
            if sub.disabled.load(Relaxed) {
                continue;
            }
            if let Some(filter) = &sub.filter {
                if !filter.matches(msg) {
                    continue;
                }
            }
            let res = panic::catch_unwind(AssertUnwindSafe(|| (sub.callback)(msg)));
            if let Err(payload) = res {
                log::error!(
                    "A subscriber of {}.{} panicked: {}",
                    self.interface,
                    self.member,
                    panic_message(&*payload),
                );
            }
        }
    }
}

impl Drop for SignalRouter {
    fn drop(&mut self) {
        if let Some(hook) = self.on_release.take() {
            hook(self);
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}

/// A subscription to a [SignalRouter].
///
/// Dropping this object removes the subscriber unless you call [Self::detach]. The
/// subscription keeps the router alive.
#[must_use]
pub struct Subscription {
    router: Arc<SignalRouter>,
    id: u64,
    detached: bool,
}

impl Subscription {
    pub fn router(&self) -> &Arc<SignalRouter> {
        &self.router
    }

    /// Detaches the subscriber from this object.
    ///
    /// The subscriber will not be removed when this object is dropped. It stays
    /// installed for as long as the router exists.
    pub fn detach(&mut self) {
        self.detached = true;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.detached {
            self.router.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::sync::Mutex as StdMutex};

    fn router() -> Arc<SignalRouter> {
        let rule = MatchRule::new()
            .interface("org.example.Iface")
            .member("Changed");
        Arc::new(SignalRouter::new(rule).unwrap())
    }

    fn changed(a: &str, b: &str) -> Message {
        Message::signal("/org/example", "org.example.Iface", "Changed")
            .unwrap()
            .build(&(a, b))
            .unwrap()
    }

    fn recorder(
        log: &Arc<StdMutex<Vec<&'static str>>>,
        tag: &'static str,
    ) -> impl Fn(&Message) + Send + Sync + 'static {
        let log = log.clone();
        move |_: &Message| log.lock().unwrap().push(tag)
    }

    #[test]
    fn rule_needs_interface_and_member() {
        assert!(SignalRouter::new(MatchRule::new().member("Changed")).is_err());
        assert!(SignalRouter::new(MatchRule::new().interface("a.b")).is_err());
        let router = router();
        assert_eq!(router.rule().get_msg_type(), Some(Type::Signal));
    }

    #[test]
    fn subscribers_run_in_order_and_can_leave() {
        let router = router();
        let log = Arc::new(StdMutex::new(vec![]));
        let _a = router.subscribe(None, recorder(&log, "a"));
        let b = router.subscribe(None, recorder(&log, "b"));
        let _c = router.subscribe(None, recorder(&log, "c"));
        router.dispatch(&changed("x", "y"));
        assert_eq!(*log.lock().unwrap(), ["a", "b", "c"]);
        drop(b);
        log.lock().unwrap().clear();
        router.dispatch(&changed("x", "y"));
        assert_eq!(*log.lock().unwrap(), ["a", "c"]);
    }

    #[test]
    fn filter_selects_arguments() {
        let router = router();
        let log = Arc::new(StdMutex::new(vec![]));
        let _all = router.subscribe(None, recorder(&log, "all"));
        let _x = router.subscribe(Some(ArgFilter::new(0, "x")), recorder(&log, "x"));
        let _empty = router.subscribe(Some(ArgFilter::new(1, "")), recorder(&log, "empty"));
        router.dispatch(&changed("x", "y"));
        router.dispatch(&changed("z", ""));
        assert_eq!(*log.lock().unwrap(), ["all", "x", "all", "empty"]);
    }

    #[test]
    fn foreign_signals_are_ignored() {
        let router = router();
        let log = Arc::new(StdMutex::new(vec![]));
        let _s = router.subscribe(None, recorder(&log, "s"));
        let other = Message::signal("/org/example", "org.example.Iface", "Other")
            .unwrap()
            .build(&())
            .unwrap();
        router.dispatch(&other);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        let router = router();
        let log = Arc::new(StdMutex::new(vec![]));
        let _a = router.subscribe(None, recorder(&log, "a"));
        let _p = router.subscribe(None, |_| panic!("subscriber failure"));
        let _c = router.subscribe(None, recorder(&log, "c"));
        router.dispatch(&changed("x", "y"));
        router.dispatch(&changed("x", "y"));
        assert_eq!(*log.lock().unwrap(), ["a", "c", "a", "c"]);
    }

    #[test]
    fn typed_subscribers_receive_arguments() {
        let router = router();
        let seen = Arc::new(StdMutex::new(vec![]));
        let s = seen.clone();
        let _sub = router.subscribe_typed(None, move |(a, b): (String, String)| {
            s.lock().unwrap().push(format!("{a}/{b}"));
        });
        router.dispatch(&changed("x", "y"));
        assert_eq!(*seen.lock().unwrap(), ["x/y"]);
    }

    #[test]
    fn subscriber_removed_during_dispatch_is_skipped() {
        let router = router();
        let log = Arc::new(StdMutex::new(vec![]));
        let victim: Arc<StdMutex<Option<Subscription>>> = Default::default();
        let v = victim.clone();
        let _first = router.subscribe(None, move |_| {
            v.lock().unwrap().take();
        });
        *victim.lock().unwrap() = Some(router.subscribe(None, recorder(&log, "victim")));
        router.dispatch(&changed("x", "y"));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(router.subscriber_count(), 1);
    }

    #[test]
    fn detached_subscriber_stays() {
        let router = router();
        let log = Arc::new(StdMutex::new(vec![]));
        let mut sub = router.subscribe(None, recorder(&log, "d"));
        sub.detach();
        drop(sub);
        router.dispatch(&changed("x", "y"));
        assert_eq!(*log.lock().unwrap(), ["d"]);
    }

    #[test]
    fn release_hook_runs_on_drop() {
        let released = Arc::new(AtomicBool::new(false));
        let r = released.clone();
        let rule = MatchRule::new().interface("a.b").member("C");
        let mut router = SignalRouter::new(rule).unwrap();
        router.set_release_hook(move |router| {
            assert_eq!(router.member(), "C");
            r.store(true, Relaxed);
        });
        let router = Arc::new(router);
        let sub = router.subscribe(None, |_| ());
        drop(router);
        assert!(!released.load(Relaxed));
        drop(sub);
        assert!(released.load(Relaxed));
    }
}
