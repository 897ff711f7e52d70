//! The `org.freedesktop.DBus` interface of the bus daemon.

use {
    crate::{Error, Executor, ServiceWatcher, WatchMode},
    std::{ops::BitOr, sync::Arc, time::Duration},
    zbus::{
        names::{InterfaceName, MemberName, WellKnownName},
        zvariant::ObjectPath,
    },
};

pub const DBUS_NAME: WellKnownName<'static> =
    WellKnownName::from_static_str_unchecked("org.freedesktop.DBus");
pub const DBUS_INTERFACE: InterfaceName<'static> =
    InterfaceName::from_static_str_unchecked("org.freedesktop.DBus");
pub const DBUS_PATH: ObjectPath<'static> =
    ObjectPath::from_static_str_unchecked("/org/freedesktop/DBus");
pub const NAME_OWNER_CHANGED: MemberName<'static> =
    MemberName::from_static_str_unchecked("NameOwnerChanged");
pub const HELLO: MemberName<'static> = MemberName::from_static_str_unchecked("Hello");
pub const REQUEST_NAME: MemberName<'static> = MemberName::from_static_str_unchecked("RequestName");
pub const RELEASE_NAME: MemberName<'static> = MemberName::from_static_str_unchecked("ReleaseName");
pub const GET_NAME_OWNER: MemberName<'static> =
    MemberName::from_static_str_unchecked("GetNameOwner");
pub const NAME_HAS_OWNER: MemberName<'static> =
    MemberName::from_static_str_unchecked("NameHasOwner");
pub const LIST_NAMES: MemberName<'static> = MemberName::from_static_str_unchecked("ListNames");
pub const ADD_MATCH: MemberName<'static> = MemberName::from_static_str_unchecked("AddMatch");
pub const REMOVE_MATCH: MemberName<'static> = MemberName::from_static_str_unchecked("RemoveMatch");

/// Flags for [Bus::request_name].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestNameFlags(pub u32);

impl RequestNameFlags {
    pub const NONE: Self = Self(0);
    pub const ALLOW_REPLACEMENT: Self = Self(1);
    pub const REPLACE_EXISTING: Self = Self(2);
    pub const DO_NOT_QUEUE: Self = Self(4);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for RequestNameFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The reply to `RequestName`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner = 1,
    InQueue = 2,
    Exists = 3,
    AlreadyOwner = 4,
}

impl TryFrom<u32> for RequestNameReply {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        let reply = match value {
            1 => Self::PrimaryOwner,
            2 => Self::InQueue,
            3 => Self::Exists,
            4 => Self::AlreadyOwner,
            _ => return Err(Error::InvalidArgument("unknown RequestName reply")),
        };
        Ok(reply)
    }
}

/// The reply to `ReleaseName`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released = 1,
    NonExistent = 2,
    NotOwner = 3,
}

impl TryFrom<u32> for ReleaseNameReply {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        let reply = match value {
            1 => Self::Released,
            2 => Self::NonExistent,
            3 => Self::NotOwner,
            _ => return Err(Error::InvalidArgument("unknown ReleaseName reply")),
        };
        Ok(reply)
    }
}

/// Blocking access to the bus daemon.
///
/// All methods block the calling thread until the daemon replies. They must not be used
/// on the thread running [Executor::run].
pub struct Bus {
    executor: Arc<Executor>,
    timeout: Duration,
}

impl Bus {
    pub fn new(executor: &Arc<Executor>) -> Self {
        Self {
            executor: executor.clone(),
            timeout: Duration::from_secs(25),
        }
    }

    /// Sets how long each method waits for the daemon.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn list_names(&self) -> Result<Vec<String>, Error> {
        self.invoke(LIST_NAMES, &())
    }

    pub fn get_name_owner(&self, name: &str) -> Result<String, Error> {
        self.invoke(GET_NAME_OWNER, &name)
    }

    pub fn name_has_owner(&self, name: &str) -> Result<bool, Error> {
        self.invoke(NAME_HAS_OWNER, &name)
    }

    pub fn request_name(
        &self,
        name: &str,
        flags: RequestNameFlags,
    ) -> Result<RequestNameReply, Error> {
        let reply: u32 = self.invoke(REQUEST_NAME, &(name, flags.0))?;
        reply.try_into()
    }

    pub fn release_name(&self, name: &str) -> Result<ReleaseNameReply, Error> {
        let reply: u32 = self.invoke(RELEASE_NAME, &name)?;
        reply.try_into()
    }

    /// Starts watching the owner of `name`.
    pub fn watch_service(&self, name: &str, mode: WatchMode) -> Result<ServiceWatcher, Error> {
        ServiceWatcher::new(&self.executor, name, mode)
    }

    fn invoke<R>(
        &self,
        member: MemberName<'static>,
        body: &(impl serde::Serialize + zbus::zvariant::DynamicType),
    ) -> Result<R, Error>
    where
        R: for<'a> zbus::zvariant::DynamicDeserialize<'a>,
    {
        self.executor.invoke_sync(
            DBUS_NAME,
            DBUS_INTERFACE,
            DBUS_PATH,
            member,
            body,
            self.timeout,
        )
    }
}
