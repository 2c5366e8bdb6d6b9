//! Colon-tokenized notification protocol for lockpoint channels.
//!
//! Delivery is best-effort and at-most-once, so every message is purely a
//! wake hint: a dropped or malformed message costs latency, never
//! correctness. Parsers therefore reject anything that does not match the
//! canonical shapes below and the dispatcher discards the message.
//!
//! | pattern | meaning |
//! |---|---|
//! | `#:<lockpoint>` | the lockpoint became free |
//! | `o:<lockpoint>` | the lockpoint opened for readers |
//! | `s:<lockpoint>` | a shared batch was handed off |
//! | `u:<client>:<lock_id>:<lockpoint>` | directed hand-off to one waiter |
//! | `l:<client>:<lock_id>:<lease_ms>:<lockpoint>` | grant notice + lease |

/// One parsed channel notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The lockpoint is free; one unfair waiter may retry.
    Free {
        /// The lockpoint that became free.
        lockpoint: String,
    },
    /// The lockpoint is open for shared access.
    Open {
        /// The lockpoint that opened.
        lockpoint: String,
    },
    /// A batch of shared waiters was handed off; every read waiter retries.
    Shared {
        /// The lockpoint that was handed off.
        lockpoint: String,
    },
    /// Directed hand-off to the waiter popped from the fair queue.
    Unlock {
        /// Client id of the popped waiter.
        client_id: String,
        /// Lock id of the popped waiter.
        lock_id: u64,
        /// The lockpoint being handed off.
        lockpoint: String,
    },
    /// A grant was made; subscribers arm their watchdog for the lease.
    Lock {
        /// Client id of the grantee.
        client_id: String,
        /// Lock id of the grantee.
        lock_id: u64,
        /// Lease attached to the grant, in milliseconds.
        lease_ms: u64,
        /// The lockpoint that was granted.
        lockpoint: String,
    },
}

impl Notification {
    /// Parse a raw channel payload. Returns `None` for anything malformed.
    pub fn parse(raw: &str) -> Option<Notification> {
        let parts: Vec<&str> = raw.split(':').collect();
        match (parts.first().copied()?, parts.len()) {
            ("#", 2) => Some(Notification::Free {
                lockpoint: non_empty(parts[1])?.to_string(),
            }),
            ("o", 2) => Some(Notification::Open {
                lockpoint: non_empty(parts[1])?.to_string(),
            }),
            ("s", 2) => Some(Notification::Shared {
                lockpoint: non_empty(parts[1])?.to_string(),
            }),
            ("u", 4) => Some(Notification::Unlock {
                client_id: non_empty(parts[1])?.to_string(),
                lock_id: parts[2].parse().ok()?,
                lockpoint: non_empty(parts[3])?.to_string(),
            }),
            ("l", 5) => Some(Notification::Lock {
                client_id: non_empty(parts[1])?.to_string(),
                lock_id: parts[2].parse().ok()?,
                lease_ms: parts[3].parse().ok()?,
                lockpoint: non_empty(parts[4])?.to_string(),
            }),
            _ => None,
        }
    }

    /// Encode back to the wire shape. Inverse of [`Notification::parse`].
    pub fn encode(&self) -> String {
        match self {
            Notification::Free { lockpoint } => format!("#:{lockpoint}"),
            Notification::Open { lockpoint } => format!("o:{lockpoint}"),
            Notification::Shared { lockpoint } => format!("s:{lockpoint}"),
            Notification::Unlock {
                client_id,
                lock_id,
                lockpoint,
            } => format!("u:{client_id}:{lock_id}:{lockpoint}"),
            Notification::Lock {
                client_id,
                lock_id,
                lease_ms,
                lockpoint,
            } => format!("l:{client_id}:{lock_id}:{lease_ms}:{lockpoint}"),
        }
    }

    /// The lockpoint this notification is about.
    pub fn lockpoint(&self) -> &str {
        match self {
            Notification::Free { lockpoint }
            | Notification::Open { lockpoint }
            | Notification::Shared { lockpoint }
            | Notification::Unlock { lockpoint, .. }
            | Notification::Lock { lockpoint, .. } => lockpoint,
        }
    }
}

fn non_empty(part: &str) -> Option<&str> {
    if part.is_empty() { None } else { Some(part) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_free_open_shared() {
        assert_eq!(
            Notification::parse("#:orders"),
            Some(Notification::Free {
                lockpoint: "orders".into()
            })
        );
        assert_eq!(
            Notification::parse("o:orders"),
            Some(Notification::Open {
                lockpoint: "orders".into()
            })
        );
        assert_eq!(
            Notification::parse("s:orders"),
            Some(Notification::Shared {
                lockpoint: "orders".into()
            })
        );
    }

    #[test]
    fn test_parse_unlock_carries_waiter_token() {
        let parsed = Notification::parse("u:client-a:17:orders").unwrap();
        assert_eq!(
            parsed,
            Notification::Unlock {
                client_id: "client-a".into(),
                lock_id: 17,
                lockpoint: "orders".into(),
            }
        );
        assert_eq!(parsed.lockpoint(), "orders");
    }

    #[test]
    fn test_parse_lock_grant() {
        let parsed = Notification::parse("l:client-a:9:30000:orders").unwrap();
        assert_eq!(
            parsed,
            Notification::Lock {
                client_id: "client-a".into(),
                lock_id: 9,
                lease_ms: 30_000,
                lockpoint: "orders".into(),
            }
        );
    }

    #[test]
    fn test_encode_round_trips() {
        for raw in [
            "#:a",
            "o:a",
            "s:a",
            "u:c:1:a",
            "l:c:1:5000:a",
        ] {
            let parsed = Notification::parse(raw).unwrap();
            assert_eq!(parsed.encode(), raw);
        }
    }

    #[test]
    fn test_malformed_messages_rejected() {
        // Superseded drafts and garbage all fail to parse.
        for raw in [
            "",
            "x:orders",
            "#:",
            "u:orders",
            "u:c:orders",
            "u:c:notanumber:orders",
            "l:c:1:orders",
            "l:c:1:ms:orders",
            "l:c:1:5000:orders:extra",
        ] {
            assert_eq!(Notification::parse(raw), None, "accepted {raw:?}");
        }
    }
}
