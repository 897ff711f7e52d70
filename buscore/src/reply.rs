use {
    crate::{transport::Transport, Error},
    error_reporter::Report,
    serde::Serialize,
    std::sync::Arc,
    zbus::{
        message::{Flags, Type},
        names::BusName,
        zvariant::{DynamicDeserialize, DynamicType},
        Message,
    },
};

pub(crate) const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
pub(crate) const ERROR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
pub(crate) const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";

/// Converts an error message into [Error::Remote].
///
/// The description is the first body argument if it is a string and empty otherwise.
pub fn remote_error(msg: &Message) -> Error {
    let header = msg.header();
    let name = match header.error_name() {
        Some(n) => n.to_string(),
        None => ERROR_FAILED.to_string(),
    };
    let description = msg.body().deserialize::<String>().unwrap_or_default();
    Error::Remote { name, description }
}

/// Checks that a message is a successful reply.
///
/// Error messages become [Error::Remote]. Method calls and signals are not replies at
/// all and produce [Error::UnexpectedMessage]. The body of a method return is not
/// inspected.
pub fn check_reply(msg: &Message) -> Result<(), Error> {
    match msg.message_type() {
        Type::MethodReturn => Ok(()),
        Type::Error => Err(remote_error(msg)),
        ty => Err(Error::UnexpectedMessage(ty)),
    }
}

/// Checks a reply with [check_reply] and deserializes its body.
pub fn decode_reply<R>(msg: &Message) -> Result<R, Error>
where
    R: for<'a> DynamicDeserialize<'a>,
{
    check_reply(msg)?;
    msg.body().deserialize().map_err(Error::deserialize)
}

/// A pending reply to a method call.
///
/// Use this object to reply to method calls. You can hang on to this object for as long
/// as you like. If it is dropped without a reply, the caller receives an error.
pub struct PendingReply {
    msg: Message,
    transport: Arc<dyn Transport>,
    replied: bool,
}

impl PendingReply {
    pub(crate) fn new(msg: Message, transport: Arc<dyn Transport>) -> Self {
        Self {
            msg,
            transport,
            replied: false,
        }
    }

    /// Returns the request message.
    pub fn message(&self) -> &Message {
        &self.msg
    }

    /// Returns the name of the sender.
    pub fn sender(&self) -> Option<BusName<'static>> {
        self.msg.header().sender().map(|u| u.to_owned().into())
    }

    /// Deserializes the request body.
    pub fn args<B>(&self) -> Result<B, Error>
    where
        B: for<'a> DynamicDeserialize<'a>,
    {
        self.msg.body().deserialize().map_err(Error::deserialize)
    }

    /// Sends a success reply.
    pub fn send(&mut self, body: &(impl Serialize + DynamicType)) {
        self.replied = true;
        let msg = match Message::method_return(&self.msg.header()).and_then(|b| b.build(body)) {
            Ok(m) => m,
            Err(e) => {
                log::error!("Could not build a method return: {}", Report::new(e));
                return;
            }
        };
        self.dispatch(msg);
    }

    /// Sends an error reply with the generic `Failed` error name.
    pub fn send_err(&mut self, description: &str) {
        self.send_named_err(ERROR_FAILED, description);
    }

    /// Sends an error reply.
    pub fn send_named_err(&mut self, name: &str, description: &str) {
        self.replied = true;
        let msg = match Message::error(&self.msg.header(), name).and_then(|b| b.build(&description))
        {
            Ok(m) => m,
            Err(e) => {
                log::error!("Could not build an error reply: {}", Report::new(e));
                return;
            }
        };
        self.dispatch(msg);
    }

    fn dispatch(&self, msg: Message) {
        if let Err(e) = self.transport.send(msg) {
            log::warn!("Could not send a reply: {}", Report::new(e));
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        let no_reply = self
            .msg
            .primary_header()
            .flags()
            .contains(Flags::NoReplyExpected);
        if !self.replied && !no_reply {
            self.send_err("Application did not send a reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call() -> Message {
        Message::method_call("/org/freedesktop/DBus", "ListNames")
            .unwrap()
            .destination("org.freedesktop.DBus")
            .unwrap()
            .interface("org.freedesktop.DBus")
            .unwrap()
            .build(&())
            .unwrap()
    }

    #[test]
    fn error_reply_is_remote_error() {
        let msg = Message::error(&call().header(), "does.not.exist.MyError")
            .unwrap()
            .build(&"MyErrorDescription")
            .unwrap();
        let err = check_reply(&msg).unwrap_err();
        assert_eq!(err.remote_name(), Some("does.not.exist.MyError"));
        assert_eq!(err.to_string(), "does.not.exist.MyError: MyErrorDescription");
        assert!(decode_reply::<i32>(&msg).is_err());
    }

    #[test]
    fn method_call_is_not_a_reply() {
        assert!(matches!(
            check_reply(&call()),
            Err(Error::UnexpectedMessage(Type::MethodCall))
        ));
    }

    #[test]
    fn unit_check_ignores_body() {
        let reply = Message::method_return(&call().header())
            .unwrap()
            .build(&42i32)
            .unwrap();
        assert!(check_reply(&reply).is_ok());
        assert_eq!(decode_reply::<i32>(&reply).unwrap(), 42);
    }

    #[test]
    fn empty_return_cannot_be_decoded() {
        let reply = Message::method_return(&call().header())
            .unwrap()
            .build(&())
            .unwrap();
        assert!(matches!(
            decode_reply::<i32>(&reply),
            Err(Error::Deserialize(_))
        ));
    }
}
