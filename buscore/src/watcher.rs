//! Name-ownership tracking.

use {
    crate::{
        bus::{DBUS_INTERFACE, DBUS_NAME, DBUS_PATH, NAME_OWNER_CHANGED},
        ArgFilter, Error, Executor, MatchRule, SignalRouter, Subscription,
    },
    parking_lot::Mutex,
    std::sync::Arc,
    zbus::message::Type,
};

/// Which ownership changes a [ServiceWatcher] reports.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum WatchMode {
    /// Every change.
    #[default]
    OwnerChange,
    /// Only changes where the name had no owner before.
    Registration,
    /// Only changes where the name has no owner afterwards.
    Unregistration,
}

impl WatchMode {
    fn filter(self) -> Option<ArgFilter> {
        match self {
            WatchMode::OwnerChange => None,
            WatchMode::Registration => Some(ArgFilter::new(1, "")),
            WatchMode::Unregistration => Some(ArgFilter::new(2, "")),
        }
    }
}

/// What a [ServiceWatcher] last learned about its name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OwnerState {
    /// No ownership change has been observed yet.
    #[default]
    Unknown,
    /// The name is owned by the connection with this unique name.
    Owned(String),
    /// The name has no owner.
    Unowned,
}

type OwnerChanged = dyn Fn(&str, &str) + Send + Sync;
type Notify = dyn Fn() + Send + Sync;

#[derive(Default)]
struct Inner {
    state: OwnerState,
    owner_changed: Option<Arc<OwnerChanged>>,
    registered: Option<Arc<Notify>>,
    unregistered: Option<Arc<Notify>>,
}

impl Inner {
    fn handle(inner: &Mutex<Inner>, old: &str, new: &str) {
        let (owner_changed, follow_up) = {
            let mut inner = inner.lock();
            inner.state = match new {
                "" => OwnerState::Unowned,
                n => OwnerState::Owned(n.to_string()),
            };
            let follow_up = match new {
                "" => inner.unregistered.clone(),
                _ => inner.registered.clone(),
            };
            (inner.owner_changed.clone(), follow_up)
        };
        if let Some(cb) = owner_changed {
            cb(old, new);
        }
        if let Some(cb) = follow_up {
            cb();
        }
    }
}

/// Watches the owner of a bus name.
///
/// The watcher reports changes for as long as it exists. Callbacks run on the thread
/// that dispatches signals. For each change, the owner-changed callback runs first,
/// followed by either the registered or the unregistered callback.
pub struct ServiceWatcher {
    name: String,
    mode: WatchMode,
    inner: Arc<Mutex<Inner>>,
    subscription: Subscription,
}

impl ServiceWatcher {
    /// The rule selecting `NameOwnerChanged` signals for `name`.
    pub fn rule(name: &str) -> MatchRule {
        MatchRule::new()
            .msg_type(Type::Signal)
            .sender(DBUS_NAME.as_str())
            .interface(DBUS_INTERFACE.as_str())
            .member(NAME_OWNER_CHANGED.as_str())
            .path(DBUS_PATH.as_str())
            .arg(0, name)
    }

    /// Starts watching `name` on the executor's connection.
    pub fn new(executor: &Executor, name: &str, mode: WatchMode) -> Result<Self, Error> {
        let router = executor.signal(Self::rule(name))?;
        Self::attach(router, name, mode)
    }

    /// Starts watching `name` through an existing router.
    ///
    /// The router must only pass `NameOwnerChanged` signals for `name`.
    pub fn attach(router: Arc<SignalRouter>, name: &str, mode: WatchMode) -> Result<Self, Error> {
        let rule = router.rule();
        let scoped = rule.get_interface() == Some(DBUS_INTERFACE.as_str())
            && rule.get_member() == Some(NAME_OWNER_CHANGED.as_str())
            && rule.get_args().any(|(idx, value)| idx == 0 && value == name);
        if !scoped {
            return Err(Error::InvalidArgument(
                "the router does not select NameOwnerChanged for this name",
            ));
        }
        let inner = Arc::new(Mutex::new(Inner::default()));
        let i = inner.clone();
        let subscription = router.subscribe_typed(
            mode.filter(),
            move |(_, old, new): (String, String, String)| Inner::handle(&i, &old, &new),
        );
        Ok(Self {
            name: name.to_string(),
            mode,
            inner,
            subscription,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> WatchMode {
        self.mode
    }

    pub fn router(&self) -> &Arc<SignalRouter> {
        self.subscription.router()
    }

    /// The last observed ownership state.
    pub fn state(&self) -> OwnerState {
        self.inner.lock().state.clone()
    }

    /// Sets the callback invoked with the old and new owner. An empty string means no
    /// owner.
    pub fn on_owner_changed(&self, callback: impl Fn(&str, &str) + Send + Sync + 'static) {
        self.inner.lock().owner_changed = Some(Arc::new(callback));
    }

    /// Sets the callback invoked when the name gains an owner.
    pub fn on_registered(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.inner.lock().registered = Some(Arc::new(callback));
    }

    /// Sets the callback invoked when the name loses its owner.
    pub fn on_unregistered(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.inner.lock().unregistered = Some(Arc::new(callback));
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::Mutex as StdMutex,
        zbus::Message,
    };

    const NAME: &str = "org.example.Watched";

    fn owner_changed(name: &str, old: &str, new: &str) -> Message {
        Message::signal(DBUS_PATH, DBUS_INTERFACE, NAME_OWNER_CHANGED)
            .unwrap()
            .sender("org.freedesktop.DBus")
            .unwrap()
            .build(&(name, old, new))
            .unwrap()
    }

    fn watcher(mode: WatchMode) -> (ServiceWatcher, Arc<StdMutex<Vec<String>>>) {
        let router = Arc::new(SignalRouter::new(ServiceWatcher::rule(NAME)).unwrap());
        let watcher = ServiceWatcher::attach(router, NAME, mode).unwrap();
        let log = Arc::new(StdMutex::new(vec![]));
        let l = log.clone();
        watcher.on_owner_changed(move |old, new| {
            l.lock().unwrap().push(format!("changed '{old}' -> '{new}'"));
        });
        let l = log.clone();
        watcher.on_registered(move || l.lock().unwrap().push("registered".to_string()));
        let l = log.clone();
        watcher.on_unregistered(move || l.lock().unwrap().push("unregistered".to_string()));
        (watcher, log)
    }

    #[test]
    fn rule_scopes_to_the_name() {
        assert_eq!(
            ServiceWatcher::rule(NAME).compile(),
            "type='signal',sender='org.freedesktop.DBus',interface='org.freedesktop.DBus',\
             member='NameOwnerChanged',path='/org/freedesktop/DBus',arg0='org.example.Watched'"
        );
    }

    #[test]
    fn owner_change_reports_everything() {
        let (watcher, log) = watcher(WatchMode::OwnerChange);
        assert_eq!(watcher.state(), OwnerState::Unknown);
        watcher.router().dispatch(&owner_changed(NAME, "", "owner1"));
        assert_eq!(watcher.state(), OwnerState::Owned("owner1".into()));
        watcher.router().dispatch(&owner_changed(NAME, "owner1", ""));
        assert_eq!(watcher.state(), OwnerState::Unowned);
        assert_eq!(
            *log.lock().unwrap(),
            [
                "changed '' -> 'owner1'",
                "registered",
                "changed 'owner1' -> ''",
                "unregistered",
            ]
        );
    }

    #[test]
    fn unrelated_names_are_ignored() {
        let (watcher, log) = watcher(WatchMode::OwnerChange);
        watcher
            .router()
            .dispatch(&owner_changed("org.example.Other", "", "owner1"));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(watcher.state(), OwnerState::Unknown);
    }

    #[test]
    fn registration_mode_skips_unregistration() {
        let (watcher, log) = watcher(WatchMode::Registration);
        watcher.router().dispatch(&owner_changed(NAME, "owner1", ""));
        watcher.router().dispatch(&owner_changed(NAME, "", "owner2"));
        assert_eq!(*log.lock().unwrap(), ["changed '' -> 'owner2'", "registered"]);
    }

    #[test]
    fn unregistration_mode_skips_registration() {
        let (watcher, log) = watcher(WatchMode::Unregistration);
        watcher.router().dispatch(&owner_changed(NAME, "", "owner2"));
        watcher.router().dispatch(&owner_changed(NAME, "owner2", ""));
        assert_eq!(*log.lock().unwrap(), ["changed 'owner2' -> ''", "unregistered"]);
    }

    #[test]
    fn foreign_router_is_rejected() {
        let rule = MatchRule::new()
            .interface(DBUS_INTERFACE.as_str())
            .member(NAME_OWNER_CHANGED.as_str())
            .arg(0, "org.example.Other");
        let router = Arc::new(SignalRouter::new(rule).unwrap());
        assert!(ServiceWatcher::attach(router, NAME, WatchMode::OwnerChange).is_err());
    }
}
