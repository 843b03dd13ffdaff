//! Signal subscription filters.
//!
//! Rules are written as comma-separated `key='value'` pairs:
//!
//! ```text
//! type='signal',interface='org.meshbus.Bus',member='NameOwnerChanged'
//! ```
//!
//! Recognised keys are `type`, `interface`, `member`, `path` and `sender`.
//! A missing key matches anything. Values may contain commas; a quote inside a
//! value is written `\'`.

use core::fmt;
use core::str::FromStr;

use meshbus_core::{Message, MessageType};

use crate::error::RouterError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    pub msg_type: Option<MessageType>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    /// Unique or well-known name of the sender.
    pub sender: Option<String>,
}

fn type_name(t: MessageType) -> &'static str {
    match t {
        MessageType::MethodCall => "method_call",
        MessageType::MethodReturn => "method_return",
        MessageType::Error => "error",
        MessageType::Signal => "signal",
    }
}

fn invalid(reason: impl Into<String>) -> RouterError {
    RouterError::InvalidMatchRule(reason.into())
}

impl MatchRule {
    pub fn signals() -> Self {
        Self {
            msg_type: Some(MessageType::Signal),
            ..Self::default()
        }
    }

    /// Whether `msg` passes every filter.
    ///
    /// `sender_is` decides the `sender` filter, since a well-known name in the
    /// rule must be checked against the current owner.
    pub fn matches(&self, msg: &Message, sender_is: impl FnOnce(&str) -> bool) -> bool {
        if self.msg_type.is_some_and(|t| t != msg.msg_type) {
            return false;
        }
        let field_ok = |want: &Option<String>, have: &Option<String>| match want {
            Some(want) => have.as_deref() == Some(want.as_str()),
            None => true,
        };
        if !field_ok(&self.interface, &msg.interface)
            || !field_ok(&self.member, &msg.member)
            || !field_ok(&self.path, &msg.path)
        {
            return false;
        }
        match &self.sender {
            Some(sender) => sender_is(sender),
            None => true,
        }
    }
}

impl FromStr for MatchRule {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rule = MatchRule::default();
        let mut chars = s.chars().peekable();

        loop {
            while chars.next_if(|c| c.is_whitespace() || *c == ',').is_some() {}
            if chars.peek().is_none() {
                break;
            }

            let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
            let key = key.trim().to_owned();
            if chars.next() != Some('\'') {
                return Err(invalid(format!("value of `{key}` must be quoted")));
            }
            let mut value = String::new();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' if chars.peek() == Some(&'\'') => {
                        value.push('\'');
                        chars.next();
                    }
                    '\'' => {
                        closed = true;
                        break;
                    }
                    c => value.push(c),
                }
            }
            if !closed {
                return Err(invalid(format!("unterminated value for `{key}`")));
            }
            if let Some(c) = chars.peek() {
                if *c != ',' {
                    return Err(invalid(format!("expected `,` after `{key}`")));
                }
            }

            let slot = match key.as_str() {
                "type" => {
                    rule.msg_type = Some(match value.as_str() {
                        "signal" => MessageType::Signal,
                        "method_call" => MessageType::MethodCall,
                        "method_return" => MessageType::MethodReturn,
                        "error" => MessageType::Error,
                        other => return Err(invalid(format!("unknown message type `{other}`"))),
                    });
                    continue;
                }
                "interface" => &mut rule.interface,
                "member" => &mut rule.member,
                "path" => &mut rule.path,
                "sender" => &mut rule.sender,
                "" => return Err(invalid("missing key")),
                other => return Err(invalid(format!("unknown key `{other}`"))),
            };
            if slot.is_some() {
                return Err(invalid(format!("duplicate key `{key}`")));
            }
            *slot = Some(value);
        }
        Ok(rule)
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(t) = self.msg_type {
            parts.push(format!("type='{}'", type_name(t)));
        }
        let fields = [
            ("interface", &self.interface),
            ("member", &self.member),
            ("path", &self.path),
            ("sender", &self.sender),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                parts.push(format!("{key}='{}'", value.replace('\'', "\\'")));
            }
        }
        f.write_str(&parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal() -> Message {
        Message::signal("/org/example", "org.example.Iface", "Changed")
    }

    #[test]
    fn parses_all_keys() {
        let rule: MatchRule =
            "type='signal', interface='org.example.Iface',member='Changed',path='/org/example',sender='org.example.Svc'"
                .parse()
                .unwrap();
        assert_eq!(rule.msg_type, Some(MessageType::Signal));
        assert_eq!(rule.interface.as_deref(), Some("org.example.Iface"));
        assert_eq!(rule.member.as_deref(), Some("Changed"));
        assert_eq!(rule.path.as_deref(), Some("/org/example"));
        assert_eq!(rule.sender.as_deref(), Some("org.example.Svc"));
    }

    #[test]
    fn empty_rule_matches_everything() {
        let rule: MatchRule = "".parse().unwrap();
        assert_eq!(rule, MatchRule::default());
        assert!(rule.matches(&signal(), |_| false));
    }

    #[test]
    fn filters_apply() {
        let rule: MatchRule = "type='signal',member='Changed'".parse().unwrap();
        assert!(rule.matches(&signal(), |_| true));

        let other: MatchRule = "member='Removed'".parse().unwrap();
        assert!(!other.matches(&signal(), |_| true));

        let calls: MatchRule = "type='method_call'".parse().unwrap();
        assert!(!calls.matches(&signal(), |_| true));
    }

    #[test]
    fn sender_filter_is_delegated() {
        let rule: MatchRule = "sender=':abcd0123.4'".parse().unwrap();
        assert!(rule.matches(&signal(), |s| s == ":abcd0123.4"));
        assert!(!rule.matches(&signal(), |_| false));
    }

    #[test]
    fn quoted_values_may_hold_commas_and_quotes() {
        let rule: MatchRule = r"path='/a,b',member='it\'s'".parse().unwrap();
        assert_eq!(rule.path.as_deref(), Some("/a,b"));
        assert_eq!(rule.member.as_deref(), Some("it's"));
        let again: MatchRule = rule.to_string().parse().unwrap();
        assert_eq!(again, rule);
    }

    #[test]
    fn malformed_rules_are_rejected() {
        for bad in [
            "type=signal",
            "type='bogus'",
            "colour='red'",
            "member='x",
            "member='a'member='b'",
            "member='a',member='b'",
            "='x'",
        ] {
            assert!(bad.parse::<MatchRule>().is_err(), "{bad} should not parse");
        }
    }
}
