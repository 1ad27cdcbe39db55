//! Message model and the ping/pong health protocol.
//!
//! A message is any JSON object carrying a string `id`. The framework
//! reserves exactly two shapes for itself: `Ping` and `Pong`, used for the
//! liveness handshake that tells a real daemon apart from a wedged process
//! that merely holds the endpoint open. Everything else passes through
//! opaquely between the client and the user's handler.

use serde_json::{Map, Value, json};
use std::sync::OnceLock;
use std::time::Instant;

/// Sentinel field shared by pings and pongs.
pub const PING_FIELD: &str = "PING";

const PING_VALUE: &str = "PING";
const PONG_VALUE: &str = "PONG";

/// Milliseconds on a process-wide monotonic clock.
///
/// The absolute value is meaningless across processes; a pong echoes the
/// ping's `sent` verbatim, so round-trip time is always measured against the
/// sender's own clock.
#[must_use]
pub fn monotonic_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    u64::try_from(epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Build a ping: `{id, PING: "PING", sent}` with a fresh `sent`.
#[must_use]
pub fn ping(id: &str) -> Value {
    json!({
        "id": id,
        PING_FIELD: PING_VALUE,
        "sent": monotonic_ms(),
    })
}

/// Build the pong for a ping: the ping copied, sentinel overwritten, and the
/// responder's `pid` added. `id` and `sent` are echoed untouched.
#[must_use]
pub fn pong(ping: &Value, pid: u32) -> Value {
    let mut fields = match ping.as_object() {
        Some(obj) => obj.clone(),
        None => Map::new(),
    };
    fields.insert(PING_FIELD.to_string(), Value::from(PONG_VALUE));
    fields.insert("pid".to_string(), Value::from(pid));
    Value::Object(fields)
}

/// Exact ping shape: precisely `{id: string, PING: "PING", sent: number}`.
#[must_use]
pub fn is_ping(msg: &Value) -> bool {
    let Some(obj) = msg.as_object() else {
        return false;
    };
    obj.len() == 3
        && obj.get("id").is_some_and(Value::is_string)
        && obj.get(PING_FIELD).and_then(Value::as_str) == Some(PING_VALUE)
        && obj.get("sent").is_some_and(Value::is_number)
}

/// Exact pong shape: precisely `{id, PING: "PONG", sent, pid: number}`.
///
/// With `expected`, `id` and `sent` must additionally match the original
/// ping exactly; without it, only the shape is checked.
#[must_use]
pub fn is_pong(msg: &Value, expected: Option<&Value>) -> bool {
    let Some(obj) = msg.as_object() else {
        return false;
    };
    let shape_ok = obj.len() == 4
        && obj.get("id").is_some_and(Value::is_string)
        && obj.get(PING_FIELD).and_then(Value::as_str) == Some(PONG_VALUE)
        && obj.get("sent").is_some_and(Value::is_number)
        && obj.get("pid").is_some_and(Value::is_number);
    if !shape_ok {
        return false;
    }
    match expected.and_then(Value::as_object) {
        Some(exp) => obj.get("id") == exp.get("id") && obj.get("sent") == exp.get("sent"),
        None => true,
    }
}

/// The `id` of a message, when it has one.
#[must_use]
pub fn message_id(msg: &Value) -> Option<&str> {
    msg.as_object()?.get("id")?.as_str()
}

/// Default request predicate: any object with a string `id` that is not one
/// of the reserved ping/pong shapes.
#[must_use]
pub fn is_request(msg: &Value) -> bool {
    message_id(msg).is_some() && !is_ping(msg) && !is_pong(msg, None)
}

/// Default response predicate, mirror of [`is_request`].
#[must_use]
pub fn is_response(msg: &Value) -> bool {
    is_request(msg)
}

/// Attach the round-trip time to a resolved pong: `duration = now − sent`,
/// measured on the caller's monotonic clock.
pub fn attach_duration(pong: &mut Value) {
    let sent = pong
        .as_object()
        .and_then(|obj| obj.get("sent"))
        .and_then(Value::as_u64);
    if let (Some(sent), Some(obj)) = (sent, pong.as_object_mut()) {
        let duration = monotonic_ms().saturating_sub(sent);
        obj.insert("duration".to_string(), Value::from(duration));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_shape() {
        let p = ping("x");
        let obj = p.as_object().unwrap();
        assert_eq!(obj.len(), 3, "a ping has exactly three fields");
        assert_eq!(obj.get("id").unwrap(), "x");
        assert_eq!(obj.get(PING_FIELD).unwrap(), "PING");
        assert!(obj.get("sent").unwrap().is_number());
        assert!(is_ping(&p));
    }

    #[test]
    fn test_pong_echoes_ping() {
        let p = json!({"id": "x", PING_FIELD: "PING", "sent": 7});
        let q = pong(&p, 4242);
        let obj = q.as_object().unwrap();
        assert_eq!(obj.len(), 4, "a pong has exactly four fields");
        assert_eq!(obj.get("id").unwrap(), "x");
        assert_eq!(obj.get(PING_FIELD).unwrap(), "PONG");
        assert_eq!(obj.get("sent").unwrap(), 7);
        assert_eq!(obj.get("pid").unwrap(), 4242);
        assert!(is_pong(&q, None));
        assert!(is_pong(&q, Some(&p)));
    }

    #[test]
    fn test_validators_reject_extra_and_missing_fields() {
        assert!(!is_ping(&json!({"id": "x", PING_FIELD: "PING"})));
        assert!(!is_ping(
            &json!({"id": "x", PING_FIELD: "PING", "sent": 1, "extra": true})
        ));
        assert!(!is_ping(&json!({"id": 9, PING_FIELD: "PING", "sent": 1})));
        assert!(!is_ping(&json!("PING")));

        assert!(!is_pong(
            &json!({"id": "x", PING_FIELD: "PONG", "sent": 1}),
            None
        ));
        assert!(!is_pong(
            &json!({"id": "x", PING_FIELD: "PONG", "sent": 1, "pid": 2, "more": 3}),
            None
        ));
        // A ping is not a pong
        assert!(!is_pong(&ping("x"), None));
    }

    #[test]
    fn test_pong_matching_is_exact() {
        let p = ping("a");
        let q = pong(&p, 1);
        assert!(is_pong(&q, Some(&p)));

        let other = ping("b");
        assert!(!is_pong(&q, Some(&other)), "id mismatch must fail");

        let mut stale = p.clone();
        stale["sent"] = json!(0);
        assert!(!is_pong(&q, Some(&stale)), "sent mismatch must fail");
    }

    #[test]
    fn test_request_classification() {
        assert!(is_request(&json!({"id": "1", "cmd": "fmt"})));
        assert!(!is_request(&ping("1")));
        assert!(!is_request(&pong(&ping("1"), 2)));
        assert!(!is_request(&json!({"cmd": "fmt"})));
        assert!(!is_request(&json!(["id"])));
    }

    #[test]
    fn test_attach_duration() {
        let mut q = pong(&ping("x"), 1);
        attach_duration(&mut q);
        let duration = q["duration"].as_u64().unwrap();
        // Monotonic: sent was taken moments ago
        assert!(duration < 10_000);
    }

    #[test]
    fn test_monotonic_ms_is_nondecreasing() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }
}
