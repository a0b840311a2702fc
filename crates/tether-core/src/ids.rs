//! Branded ID newtypes.
//!
//! Message IDs and transport link IDs are distinct types so one cannot be
//! passed where the other is expected. Both are UUID v7 (time-ordered)
//! generated via [`uuid::Uuid::now_v7`], which makes every ID minted by a
//! bridge instance unique for its lifetime.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh prefixed UUID v7.
            #[must_use]
            pub fn new() -> Self {
                Self(format!(concat!($prefix, "_{}"), Uuid::now_v7()))
            }

            /// The ID text.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
                out.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

branded_id!(
    /// Identifies one message. Also used as the correlation key for
    /// request/acknowledgment pairs.
    MessageId,
    "msg"
);

branded_id!(
    /// Identifies one opened transport link (one physical connection).
    LinkId,
    "link"
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn message_ids_are_unique() {
        let ids: HashSet<MessageId> = (0..10_000).map(|_| MessageId::new()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn prefixes() {
        assert!(MessageId::new().as_str().starts_with("msg_"));
        assert!(LinkId::new().as_str().starts_with("link_"));
    }

    #[test]
    fn wire_form_is_the_bare_string() {
        let id = MessageId::from("msg_abc");
        assert_eq!(serde_json::to_value(&id).unwrap(), serde_json::json!("msg_abc"));
        let back: MessageId = serde_json::from_value(serde_json::json!("msg_abc")).unwrap();
        assert_eq!(back, id);
        assert_eq!(LinkId::from(String::from("link_7")).to_string(), "link_7");
    }
}
