//! # buscore
//!
//! buscore is a client-side runtime for D-Bus that does not require async/await.
//!
//! It provides the following:
//!
//! - A [PendingCall] for every outgoing method call. The reply is delivered exactly once
//!   to the callback attached with [PendingCall::then]. Threads blocked in
//!   [PendingCall::wait] are woken independently of that callback. A callback attached
//!   after the reply has arrived runs immediately.
//! - A dispatch loop, [Executor::run], that reads the connection on a single thread.
//!   Replies, signals, and incoming method calls are handled in the order in which they
//!   arrive. Any other thread can send messages and block on replies at the same time.
//! - [SignalRouter]s that fan signals selected by a [MatchRule] out to any number of
//!   subscribers, and a [ServiceWatcher] built on top of them that tracks the owner of a
//!   bus name.
//! - When you handle a method call, you get a [PendingReply] object that you can hold on
//!   to for as long as you want without blocking any other progress.
//!
//! Message encoding is left to [zbus].
//!
//! # Example
//!
//! ```rust,no_run
//! # use {buscore::*, std::{thread, time::Duration}};
//! # fn f() -> Result<(), Error> {
//! let holder = Executor::attach(ZbusTransport::session()?, ExecutorConfig::default());
//! let executor = holder.executor.clone();
//! thread::spawn(move || executor.run());
//!
//! let bus = Bus::new(&holder.executor);
//! let owner = bus.get_name_owner("org.freedesktop.DBus")?;
//! println!("The name org.freedesktop.DBus is owned by {owner}");
//!
//! let watcher = bus.watch_service("org.example.Service", WatchMode::OwnerChange)?;
//! watcher.on_registered(|| println!("org.example.Service appeared"));
//! # Ok(())
//! # }
//! ```

pub use {
    bus::{Bus, ReleaseNameReply, RequestNameFlags, RequestNameReply},
    error::Error,
    executor::{Executor, ExecutorConfig, ExecutorHolder},
    match_rule::MatchRule,
    pending::{Notifier, NotifyError, PendingCall, RawPendingCall, Reply, ReplyFuture},
    raw::RawCall,
    reply::{check_reply, decode_reply, remote_error, PendingReply},
    router::{ArgFilter, SignalRouter, Subscription},
    transport::{
        connection::ZbusTransport,
        memory::{MemoryBus, MemoryTransport},
        Transport,
    },
    watcher::{OwnerState, ServiceWatcher, WatchMode},
};

pub mod bus;
mod error;
mod executor;
mod match_rule;
mod pending;
mod raw;
mod reply;
mod router;
pub mod transport;
mod watcher;
