//! An in-process bus.
//!
//! [MemoryBus] plays the role of the bus daemon for any number of [MemoryTransport]
//! peers living in the same process. It routes method calls by destination, replies by
//! serial, and signals by the match rules the peers registered with `AddMatch`. It
//! implements the name-ownership part of the daemon interface and emits
//! `NameOwnerChanged` whenever a name changes hands.
//!
//! Names are never queued: `RequestName` for a name owned by another peer replies
//! `Exists`.

use {
    crate::{
        bus::{
            ADD_MATCH, DBUS_INTERFACE, DBUS_NAME, DBUS_PATH, GET_NAME_OWNER, HELLO, LIST_NAMES,
            NAME_HAS_OWNER, NAME_OWNER_CHANGED, RELEASE_NAME, REMOVE_MATCH, REQUEST_NAME,
        },
        reply::{ERROR_NO_REPLY, ERROR_UNKNOWN_METHOD},
        transport::Transport,
        Error, MatchRule,
    },
    error_reporter::Report,
    parking_lot::{Condvar, Mutex},
    serde::Serialize,
    std::{
        collections::{HashMap, VecDeque},
        num::NonZeroU32,
        sync::Arc,
        time::{Duration, Instant},
    },
    zbus::{
        message::{Flags, Type},
        zvariant::DynamicType,
        Message,
    },
};

const BUS_SENDER: &str = "org.freedesktop.DBus";
const ERROR_SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
const ERROR_NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
const ERROR_MATCH_RULE_INVALID: &str = "org.freedesktop.DBus.Error.MatchRuleInvalid";
const ERROR_MATCH_RULE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.MatchRuleNotFound";

#[derive(Default)]
struct QueueState {
    messages: VecDeque<Message>,
    closed: bool,
}

#[derive(Default)]
struct Queue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl Queue {
    fn push(&self, msg: Message) {
        let mut state = self.state.lock();
        if !state.closed {
            state.messages.push_back(msg);
            self.ready.notify_one();
        }
    }

    fn pop(&self, timeout: Duration) -> Result<Option<Message>, Error> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(msg) = state.messages.pop_front() {
                return Ok(Some(msg));
            }
            if state.closed {
                return Err(Error::ConnectionLost);
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return Ok(state.messages.pop_front());
            }
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.messages.clear();
        self.ready.notify_all();
    }
}

struct Peer {
    queue: Arc<Queue>,
    rules: Vec<MatchRule>,
}

struct RoutedCall {
    call: Message,
    caller: String,
    callee: String,
}

#[derive(Default)]
struct BusState {
    next_peer: u64,
    peers: HashMap<String, Peer>,
    names: HashMap<String, String>,
    calls: HashMap<NonZeroU32, RoutedCall>,
}

/// An in-process bus daemon.
///
/// Cloning this object yields another handle to the same bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

/// A connection to a [MemoryBus].
pub struct MemoryTransport {
    bus: MemoryBus,
    unique: String,
    queue: Arc<Queue>,
}

fn bus_reply(call: &Message, body: &(impl Serialize + DynamicType)) -> zbus::Result<Message> {
    Message::method_return(&call.header())?
        .sender(BUS_SENDER)?
        .build(body)
}

fn bus_error(call: &Message, name: &str, description: &str) -> zbus::Result<Message> {
    Message::error(&call.header(), name)?
        .sender(BUS_SENDER)?
        .build(&description)
}

fn name_owner_changed(name: &str, old: &str, new: &str) -> zbus::Result<Message> {
    Message::signal(DBUS_PATH, DBUS_INTERFACE, NAME_OWNER_CHANGED)?
        .sender(BUS_SENDER)?
        .build(&(name, old, new))
}

fn expects_reply(msg: &Message) -> bool {
    !msg.primary_header()
        .flags()
        .contains(Flags::NoReplyExpected)
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a new peer and assigns it a unique name.
    pub fn connect(&self) -> MemoryTransport {
        let queue = Arc::new(Queue::default());
        let mut state = self.state.lock();
        state.next_peer += 1;
        let unique = format!(":1.{}", state.next_peer);
        state.peers.insert(
            unique.clone(),
            Peer {
                queue: queue.clone(),
                rules: vec![],
            },
        );
        state.emit_owner_changed(&unique, "", &unique);
        MemoryTransport {
            bus: self.clone(),
            unique,
            queue,
        }
    }

    /// The current owner of a name.
    pub fn owner(&self, name: &str) -> Option<String> {
        self.state.lock().resolve(name)
    }

    fn route(&self, from: &str, msg: Message) -> Result<(), Error> {
        let mut state = self.state.lock();
        if !state.peers.contains_key(from) {
            return Err(Error::ConnectionLost);
        }
        match msg.message_type() {
            Type::MethodCall => state.route_call(from, msg),
            Type::MethodReturn | Type::Error => state.route_reply(msg),
            Type::Signal => state.route_signal(msg),
        }
        Ok(())
    }

    fn disconnect(&self, unique: &str) {
        let mut state = self.state.lock();
        let Some(peer) = state.peers.remove(unique) else {
            return;
        };
        peer.queue.close();
        let owned: Vec<_> = state
            .names
            .iter()
            .filter(|(_, owner)| *owner == unique)
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            state.names.remove(&name);
            state.emit_owner_changed(&name, unique, "");
        }
        state.emit_owner_changed(unique, unique, "");
        let orphaned: Vec<_> = state
            .calls
            .iter()
            .filter(|(_, c)| c.caller == unique || c.callee == unique)
            .map(|(serial, _)| *serial)
            .collect();
        for serial in orphaned {
            let Some(call) = state.calls.remove(&serial) else {
                continue;
            };
            if call.callee == unique {
                let err = bus_error(&call.call, ERROR_NO_REPLY, "The peer disconnected");
                state.deliver(&call.caller, err);
            }
        }
    }
}

impl BusState {
    fn resolve(&self, name: &str) -> Option<String> {
        if name == DBUS_NAME.as_str() {
            return Some(name.to_string());
        }
        if name.starts_with(':') {
            return self.peers.contains_key(name).then(|| name.to_string());
        }
        self.names.get(name).cloned()
    }

    fn deliver(&self, to: &str, msg: zbus::Result<Message>) {
        match msg {
            Ok(msg) => {
                if let Some(peer) = self.peers.get(to) {
                    peer.queue.push(msg);
                }
            }
            Err(e) => log::error!("Could not build a bus message: {}", Report::new(e)),
        }
    }

    fn emit_owner_changed(&self, name: &str, old: &str, new: &str) {
        match name_owner_changed(name, old, new) {
            Ok(msg) => self.route_signal(msg),
            Err(e) => log::error!("Could not build NameOwnerChanged: {}", Report::new(e)),
        }
    }

    fn route_signal(&self, msg: Message) {
        let dest = msg.header().destination().map(|d| d.to_string());
        if let Some(dest) = dest {
            if let Some(unique) = self.resolve(&dest) {
                self.deliver(&unique, Ok(msg));
            }
            return;
        }
        for peer in self.peers.values() {
            if peer.rules.iter().any(|r| r.matches(&msg)) {
                peer.queue.push(msg.clone());
            }
        }
    }

    fn route_reply(&mut self, msg: Message) {
        let serial = msg.header().reply_serial();
        let Some(serial) = serial else {
            return;
        };
        if let Some(call) = self.calls.remove(&serial) {
            self.deliver(&call.caller, Ok(msg));
        }
    }

    fn route_call(&mut self, from: &str, msg: Message) {
        let dest = msg.header().destination().map(|d| d.to_string());
        let Some(dest) = dest else {
            if expects_reply(&msg) {
                let err = bus_error(&msg, ERROR_SERVICE_UNKNOWN, "Missing destination");
                self.deliver(from, err);
            }
            return;
        };
        if dest == DBUS_NAME.as_str() {
            let reply = self.handle_daemon_call(from, &msg);
            if expects_reply(&msg) {
                self.deliver(from, reply);
            }
            return;
        }
        let Some(callee) = self.resolve(&dest) else {
            if expects_reply(&msg) {
                let description = format!("{dest} is not on the bus");
                let err = bus_error(&msg, ERROR_SERVICE_UNKNOWN, &description);
                self.deliver(from, err);
            }
            return;
        };
        if expects_reply(&msg) {
            self.calls.insert(
                msg.primary_header().serial_num(),
                RoutedCall {
                    call: msg.clone(),
                    caller: from.to_string(),
                    callee: callee.clone(),
                },
            );
        }
        self.deliver(&callee, Ok(msg));
    }

    fn handle_daemon_call(&mut self, from: &str, msg: &Message) -> zbus::Result<Message> {
        let header = msg.header();
        let Some(member) = header.member() else {
            return bus_error(msg, ERROR_UNKNOWN_METHOD, "Missing member");
        };
        let body = msg.body();
        let invalid_args = |e: zbus::Error| bus_error(msg, ERROR_INVALID_ARGS, &e.to_string());
        match member.as_str() {
            m if m == HELLO.as_str() => bus_reply(msg, &from),
            m if m == LIST_NAMES.as_str() => {
                let mut names = vec![DBUS_NAME.to_string()];
                names.extend(self.peers.keys().cloned());
                names.extend(self.names.keys().cloned());
                bus_reply(msg, &names)
            }
            m if m == GET_NAME_OWNER.as_str() => {
                let name: String = match body.deserialize() {
                    Ok(n) => n,
                    Err(e) => return invalid_args(e),
                };
                match self.resolve(&name) {
                    Some(owner) => bus_reply(msg, &owner),
                    None => bus_error(
                        msg,
                        ERROR_NAME_HAS_NO_OWNER,
                        &format!("Could not get owner of name '{name}': no such name"),
                    ),
                }
            }
            m if m == NAME_HAS_OWNER.as_str() => {
                let name: String = match body.deserialize() {
                    Ok(n) => n,
                    Err(e) => return invalid_args(e),
                };
                bus_reply(msg, &self.resolve(&name).is_some())
            }
            m if m == REQUEST_NAME.as_str() => {
                let (name, _flags): (String, u32) = match body.deserialize() {
                    Ok(n) => n,
                    Err(e) => return invalid_args(e),
                };
                if name.starts_with(':') || name == DBUS_NAME.as_str() {
                    return bus_error(msg, ERROR_INVALID_ARGS, "Cannot acquire this name");
                }
                let reply: u32 = match self.names.get(&name).cloned() {
                    Some(owner) if owner == from => 4,
                    Some(_) => 3,
                    None => {
                        self.names.insert(name.clone(), from.to_string());
                        self.emit_owner_changed(&name, "", from);
                        1
                    }
                };
                bus_reply(msg, &reply)
            }
            m if m == RELEASE_NAME.as_str() => {
                let name: String = match body.deserialize() {
                    Ok(n) => n,
                    Err(e) => return invalid_args(e),
                };
                let reply: u32 = match self.names.get(&name).cloned() {
                    None => 2,
                    Some(owner) if owner != from => 3,
                    Some(_) => {
                        self.names.remove(&name);
                        self.emit_owner_changed(&name, from, "");
                        1
                    }
                };
                bus_reply(msg, &reply)
            }
            m if m == ADD_MATCH.as_str() || m == REMOVE_MATCH.as_str() => {
                let rule: String = match body.deserialize() {
                    Ok(n) => n,
                    Err(e) => return invalid_args(e),
                };
                let rule: MatchRule = match rule.parse() {
                    Ok(r) => r,
                    Err(e) => return bus_error(msg, ERROR_MATCH_RULE_INVALID, &e.to_string()),
                };
                let Some(peer) = self.peers.get_mut(from) else {
                    return bus_error(msg, ERROR_SERVICE_UNKNOWN, "Unknown peer");
                };
                if m == ADD_MATCH.as_str() {
                    peer.rules.push(rule);
                } else {
                    let Some(pos) = peer.rules.iter().position(|r| *r == rule) else {
                        return bus_error(msg, ERROR_MATCH_RULE_NOT_FOUND, "No such rule");
                    };
                    peer.rules.remove(pos);
                }
                bus_reply(msg, &())
            }
            m => bus_error(
                msg,
                ERROR_UNKNOWN_METHOD,
                &format!("Unknown method {m} on the bus interface"),
            ),
        }
    }
}

impl Transport for MemoryTransport {
    fn unique_name(&self) -> Option<String> {
        Some(self.unique.clone())
    }

    fn send(&self, msg: Message) -> Result<(), Error> {
        self.bus.route(&self.unique, msg)
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Message>, Error> {
        self.queue.pop(timeout)
    }

    fn close(&self) {
        self.bus.disconnect(&self.unique);
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}
