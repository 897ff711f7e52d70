use {
    crate::pending::{Notifier, NotifyError, RawPendingCall, Reply},
    parking_lot::Mutex,
    std::{mem, num::NonZeroU32},
};

type CancelHook = Box<dyn Fn(NonZeroU32) + Send + Sync>;

enum Slot {
    Empty,
    Installed(Notifier),
    Spent,
}

struct RawState {
    completed: bool,
    reply: Option<Reply>,
    notifier: Slot,
}

/// The transport-side state of one outstanding method call.
///
/// The [Executor](crate::Executor) creates one of these per call, keyed by the serial
/// of the call message, and completes it when the reply arrives.
pub struct RawCall {
    serial: NonZeroU32,
    state: Mutex<RawState>,
    on_cancel: Option<CancelHook>,
}

impl RawCall {
    pub fn new(serial: NonZeroU32) -> Self {
        Self {
            serial,
            state: Mutex::new(RawState {
                completed: false,
                reply: None,
                notifier: Slot::Empty,
            }),
            on_cancel: None,
        }
    }

    /// Creates a call whose cancellation is forwarded to `hook`.
    pub fn with_cancel_hook(
        serial: NonZeroU32,
        hook: impl Fn(NonZeroU32) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_cancel: Some(Box::new(hook)),
            ..Self::new(serial)
        }
    }

    /// Completes the call and fires the notifier if one is installed.
    ///
    /// Only the first completion has an effect.
    pub fn complete(&self, reply: Reply) {
        let notifier = {
            let mut state = self.state.lock();
            if state.completed {
                return;
            }
            state.completed = true;
            state.reply = Some(reply);
            // An empty slot stays empty so that a late `set_notify` sees the completion.
            match mem::replace(&mut state.notifier, Slot::Spent) {
                Slot::Installed(n) => Some(n),
                other => {
                    state.notifier = other;
                    None
                }
            }
        };
        if let Some(n) = notifier {
            n.notify();
        }
    }
}

impl RawPendingCall for RawCall {
    fn serial(&self) -> NonZeroU32 {
        self.serial
    }

    fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    fn steal_reply(&self) -> Option<Reply> {
        let mut state = self.state.lock();
        match state.completed {
            true => state.reply.take(),
            false => None,
        }
    }

    fn set_notify(&self, notifier: Notifier) -> Result<(), NotifyError> {
        let mut state = self.state.lock();
        if !matches!(state.notifier, Slot::Empty) {
            return Err(NotifyError::AlreadyInstalled);
        }
        if state.completed {
            // Too late to be notified. The caller checks for completion itself.
            state.notifier = Slot::Spent;
            drop(state);
            drop(notifier);
            return Ok(());
        }
        state.notifier = Slot::Installed(notifier);
        Ok(())
    }

    fn cancel(&self) {
        if let Some(hook) = &self.on_cancel {
            hook(self.serial);
        }
    }
}
