//! Message ids and JSON bodies spoken by the gate.

use serde::{Deserialize, Serialize};

/// Server to client, first frame on an encrypted connection: the 16 raw
/// session key bytes, sent unencrypted.
pub const MSG_SESSION_KEY: u32 = 1;
/// Client to server: a [`ChatLine`] to normalize.
pub const MSG_CHAT: u32 = 10;
/// Server to client: a [`NormalizedLine`].
pub const MSG_CHAT_REPLY: u32 = 11;
/// Client to server: empty body.
pub const MSG_STATS: u32 = 20;
/// Server to client: a [`GateStats`].
pub const MSG_STATS_REPLY: u32 = 21;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatLine {
    pub text: String,
}

/// `seq` counts chat lines per connection, starting at 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedLine {
    pub seq: u64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStats {
    pub connections: usize,
    pub handled: u64,
}

/// Trims the line and collapses every whitespace run to one space.
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize("  hello \t\n  world  "), "hello world");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   "), "");
        assert_eq!(normalize("single"), "single");
    }
}
