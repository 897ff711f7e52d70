//! Match rules.
//!
//! A [MatchRule] describes which messages a subscriber wants to see. Its string form is
//! the one understood by the bus daemon's `AddMatch` method.

use {
    crate::Error,
    std::{collections::BTreeMap, fmt, str::FromStr},
    zbus::{
        message::Type,
        zvariant::{Structure, Value},
        Message,
    },
};

/// A message filter.
///
/// All setters overwrite previous values of the same predicate.
///
/// ```
/// # use buscore::MatchRule;
/// let rule = MatchRule::new()
///     .path("/org/freedesktop/DBus")
///     .member("ListNames");
/// assert_eq!(rule.compile(), "member='ListNames',path='/org/freedesktop/DBus'");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchRule {
    msg_type: Option<Type>,
    sender: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    path: Option<String>,
    args: BTreeMap<u8, String>,
}

fn type_str(ty: Type) -> &'static str {
    match ty {
        Type::MethodCall => "method_call",
        Type::MethodReturn => "method_return",
        Type::Error => "error",
        Type::Signal => "signal",
    }
}

fn parse_type(s: &str) -> Option<Type> {
    let ty = match s {
        "method_call" => Type::MethodCall,
        "method_return" => Type::MethodReturn,
        "error" => Type::Error,
        "signal" => Type::Signal,
        _ => return None,
    };
    Some(ty)
}

impl MatchRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn msg_type(mut self, ty: Type) -> Self {
        self.msg_type = Some(ty);
        self
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Requires the string argument at `index` to equal `value`.
    pub fn arg(mut self, index: u8, value: impl Into<String>) -> Self {
        self.args.insert(index, value.into());
        self
    }

    pub fn get_msg_type(&self) -> Option<Type> {
        self.msg_type
    }

    pub fn get_sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn get_interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn get_member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    pub fn get_path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn get_args(&self) -> impl Iterator<Item = (u8, &str)> {
        self.args.iter().map(|(i, v)| (*i, v.as_str()))
    }

    /// Produces the canonical string form.
    ///
    /// Keys appear in the order `type`, `sender`, `interface`, `member`, `path`,
    /// followed by the `argN` keys in ascending order. Unset predicates are omitted.
    pub fn compile(&self) -> String {
        self.to_string()
    }

    /// Returns whether a message satisfies every predicate of this rule.
    pub fn matches(&self, msg: &Message) -> bool {
        if let Some(ty) = self.msg_type {
            if msg.message_type() != ty {
                return false;
            }
        }
        let header = msg.header();
        let fields = [
            (&self.sender, header.sender().map(|s| s.as_str())),
            (&self.interface, header.interface().map(|s| s.as_str())),
            (&self.member, header.member().map(|s| s.as_str())),
            (&self.path, header.path().map(|s| s.as_str())),
        ];
        for (expected, actual) in fields {
            if let Some(expected) = expected {
                if actual != Some(expected.as_str()) {
                    return false;
                }
            }
        }
        if self.args.is_empty() {
            return true;
        }
        let body = msg.body();
        let Ok(structure) = body.deserialize::<Structure<'_>>() else {
            return false;
        };
        self.args
            .iter()
            .all(|(idx, expected)| string_arg(structure.fields(), *idx) == Some(expected.as_str()))
    }
}

pub(crate) fn string_arg<'a>(fields: &'a [Value<'_>], idx: u8) -> Option<&'a str> {
    match fields.get(idx as usize)? {
        Value::Str(s) => Some(s.as_str()),
        _ => None,
    }
}

fn write_value(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    let mut parts = value.split('\'');
    if let Some(first) = parts.next() {
        write!(f, "'{first}'")?;
    }
    for part in parts {
        write!(f, "\\''{part}'")?;
    }
    Ok(())
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut key = |f: &mut fmt::Formatter<'_>, key: &dyn fmt::Display| {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{key}=")
        };
        if let Some(ty) = self.msg_type {
            key(f, &"type")?;
            write_value(f, type_str(ty))?;
        }
        let named = [
            ("sender", &self.sender),
            ("interface", &self.interface),
            ("member", &self.member),
            ("path", &self.path),
        ];
        for (name, value) in named {
            if let Some(value) = value {
                key(f, &name)?;
                write_value(f, value)?;
            }
        }
        for (idx, value) in &self.args {
            key(f, &format_args!("arg{idx}"))?;
            write_value(f, value)?;
        }
        Ok(())
    }
}

impl FromStr for MatchRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| Error::InvalidMatchRule {
            rule: s.to_string(),
            reason,
        };
        let mut rule = MatchRule::new();
        let mut rest = s;
        while !rest.is_empty() {
            let Some((key, tail)) = rest.split_once('=') else {
                return Err(invalid("missing `=`"));
            };
            let (value, tail) = parse_value(tail).ok_or_else(|| invalid("malformed value"))?;
            rest = match tail.strip_prefix(',') {
                Some("") => return Err(invalid("trailing comma")),
                Some(t) => t,
                None if tail.is_empty() => tail,
                None => return Err(invalid("expected `,`")),
            };
            rule = match key {
                "type" => rule.msg_type(parse_type(&value).ok_or_else(|| invalid("unknown type"))?),
                "sender" => rule.sender(value),
                "interface" => rule.interface(value),
                "member" => rule.member(value),
                "path" => rule.path(value),
                _ => {
                    let idx = key
                        .strip_prefix("arg")
                        .and_then(|i| i.parse::<u8>().ok())
                        .ok_or_else(|| invalid("unknown key"))?;
                    rule.arg(idx, value)
                }
            };
        }
        Ok(rule)
    }
}

/// Parses a quoted value, returning the unescaped value and the remaining input.
fn parse_value(mut s: &str) -> Option<(String, &str)> {
    let mut value = String::new();
    let mut seen = false;
    loop {
        if let Some(t) = s.strip_prefix('\'') {
            let end = t.find('\'')?;
            value.push_str(&t[..end]);
            s = &t[end + 1..];
        } else if let Some(t) = s.strip_prefix("\\'") {
            value.push('\'');
            s = t;
        } else {
            return seen.then_some((value, s));
        }
        seen = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_rule_uses_canonical_order() {
        let rule = MatchRule::new()
            .msg_type(Type::Signal)
            .sender("org.freedesktop.DBus")
            .interface("org.freedesktop.DBus")
            .member("ListNames")
            .path("/org/freedesktop/DBus");
        assert_eq!(
            rule.compile(),
            "type='signal',sender='org.freedesktop.DBus',interface='org.freedesktop.DBus',\
             member='ListNames',path='/org/freedesktop/DBus'"
        );
    }

    #[test]
    fn order_does_not_depend_on_call_order() {
        let rule = MatchRule::new()
            .arg(2, "")
            .path("/org/freedesktop/DBus")
            .arg(0, "org.example.Foo")
            .member("ListNames")
            .msg_type(Type::Signal);
        assert_eq!(
            rule.compile(),
            "type='signal',member='ListNames',path='/org/freedesktop/DBus',\
             arg0='org.example.Foo',arg2=''"
        );
    }

    #[test]
    fn unset_fields_leave_no_commas() {
        let rule = MatchRule::new()
            .member("ListNames")
            .path("/org/freedesktop/DBus");
        assert_eq!(rule.compile(), "member='ListNames',path='/org/freedesktop/DBus'");
        assert_eq!(MatchRule::new().compile(), "");
    }

    #[test]
    fn setters_overwrite() {
        let rule = MatchRule::new()
            .member("A")
            .member("B")
            .arg(1, "x")
            .arg(1, "y");
        assert_eq!(rule.compile(), "member='B',arg1='y'");
    }

    #[test]
    fn parse_inverts_compile() {
        let rules = [
            MatchRule::new(),
            MatchRule::new().msg_type(Type::MethodReturn).sender(":1.42"),
            MatchRule::new()
                .interface("org.freedesktop.DBus")
                .member("NameOwnerChanged")
                .arg(0, "org.example.Name")
                .arg(1, ""),
            MatchRule::new().member("it's").arg(3, "a,b='c'"),
        ];
        for rule in rules {
            let parsed: MatchRule = rule.compile().parse().unwrap();
            assert_eq!(parsed, rule);
        }
    }

    #[test]
    fn quotes_are_escaped() {
        let rule = MatchRule::new().member("it's");
        assert_eq!(rule.compile(), "member='it'\\''s'");
    }

    #[test]
    fn malformed_rules_are_rejected() {
        for s in [
            "member",
            "member=ListNames",
            "member='ListNames',",
            "member='ListNames' path='/'",
            "type='bogus'",
            "destination=':1.2'",
            "argx='a'",
        ] {
            assert!(s.parse::<MatchRule>().is_err(), "{s}");
        }
    }

    fn signal(member: &str, body: &(&str, &str, &str)) -> Message {
        Message::signal("/org/freedesktop/DBus", "org.freedesktop.DBus", member)
            .unwrap()
            .build(body)
            .unwrap()
    }

    #[test]
    fn matches_header_and_args() {
        let msg = signal("NameOwnerChanged", &("org.example.Foo", "", ":1.7"));
        let base = MatchRule::new()
            .msg_type(Type::Signal)
            .interface("org.freedesktop.DBus")
            .member("NameOwnerChanged")
            .path("/org/freedesktop/DBus");
        assert!(base.matches(&msg));
        assert!(base.clone().arg(0, "org.example.Foo").arg(1, "").matches(&msg));
        assert!(!base.clone().arg(0, "org.example.Bar").matches(&msg));
        assert!(!base.clone().arg(2, "").matches(&msg));
        assert!(!base.clone().arg(5, "").matches(&msg));
        assert!(!base.clone().member("Other").matches(&msg));
        assert!(!base.msg_type(Type::MethodCall).matches(&msg));
    }

    #[test]
    fn sender_must_be_present() {
        let msg = signal("NameOwnerChanged", &("a", "b", "c"));
        assert!(!MatchRule::new().sender("org.freedesktop.DBus").matches(&msg));
    }
}
