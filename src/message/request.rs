//! Stratum request messages.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value, json};

use crate::error::{StratumError, StratumResult};

/// Counter backing [`next_request_id`].
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Produce a unique identifier for the next locally-initiated request.
///
/// Identifiers are decimal strings drawn from an atomic counter starting at
/// 1, so successive calls yield a strictly increasing sequence for the
/// lifetime of the process.
pub fn next_request_id() -> String {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed).to_string()
}

/// A Stratum request message.
///
/// Requests must include:
///
/// - an `id` field, which may be null if no response is expected,
/// - a `method` field naming the method being invoked,
/// - a `params` field, an array that may be empty.
///
/// The one exception is the distinguished *poll* request used by polled
/// transports to ask the remote end for pending messages: it carries
/// neither id nor method and serialises to an empty JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    id: Option<String>,
    method: Option<String>,
    params: Vec<Value>,
}

impl Request {
    /// Create a request.
    ///
    /// Pass `None` for `id` when no response is expected (fire-and-forget).
    /// An empty method name is rejected.
    pub fn new(
        id: Option<String>,
        method: impl Into<String>,
        params: Vec<Value>,
    ) -> StratumResult<Self> {
        let method = method.into();
        if method.is_empty() {
            return Err(StratumError::EmptyMethodName);
        }

        Ok(Self {
            id,
            method: Some(method),
            params,
        })
    }

    /// Create the distinguished poll request.
    ///
    /// Polled transports send this to ask "anything pending?" without
    /// inventing a method name. It serialises to `{}`.
    pub fn poll() -> Self {
        Self {
            id: None,
            method: None,
            params: Vec::new(),
        }
    }

    /// Parse a request from its JSON object form.
    ///
    /// The object must contain `id` (which may be null), a non-empty string
    /// `method`, and an array `params`.
    pub fn from_json(json: &Value) -> StratumResult<Self> {
        let object = json
            .as_object()
            .ok_or_else(|| StratumError::malformed_detail("request is not an object", json))?;

        let id = parse_id(object, json)?;
        let method = parse_method(object, json)?;
        let params = parse_params(object, json)?;

        Ok(Self {
            id,
            method: Some(method),
            params,
        })
    }

    /// The request identifier, or `None` for fire-and-forget requests.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The method name. `None` only for the poll request.
    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// The ordered method parameters.
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Whether this is the distinguished poll request.
    pub fn is_poll(&self) -> bool {
        self.method.is_none()
    }

    /// Render the request as a JSON object.
    ///
    /// The poll request renders as `{}`; all other requests emit `id`
    /// (null when absent), `method`, and `params` in insertion order.
    pub fn to_json(&self) -> Value {
        let Some(method) = &self.method else {
            return json!({});
        };

        json!({
            "id": self.id,
            "method": method,
            "params": self.params,
        })
    }
}

fn parse_id(object: &Map<String, Value>, payload: &Value) -> StratumResult<Option<String>> {
    let id = object
        .get("id")
        .ok_or_else(|| StratumError::malformed_detail("missing 'id'", payload))?;

    Ok(match id {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    })
}

fn parse_method(object: &Map<String, Value>, payload: &Value) -> StratumResult<String> {
    let method = object
        .get("method")
        .ok_or_else(|| StratumError::malformed_detail("missing 'method'", payload))?
        .as_str()
        .ok_or_else(|| StratumError::malformed_detail("'method' is not a string", payload))?;

    if method.is_empty() {
        return Err(StratumError::malformed_detail("empty 'method'", payload));
    }

    Ok(method.to_string())
}

fn parse_params(object: &Map<String, Value>, payload: &Value) -> StratumResult<Vec<Value>> {
    let params = object
        .get("params")
        .ok_or_else(|| StratumError::malformed_detail("missing 'params'", payload))?
        .as_array()
        .ok_or_else(|| StratumError::malformed_detail("'params' is not an array", payload))?;

    Ok(params.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_request() {
        let json = json!({
            "id": "7",
            "method": "mining.subscribe",
            "params": ["agent/1.0", 4],
        });

        let req = Request::from_json(&json).unwrap();
        assert_eq!(req.id(), Some("7"));
        assert_eq!(req.method(), Some("mining.subscribe"));
        assert_eq!(req.params(), &[json!("agent/1.0"), json!(4)]);
        assert!(!req.is_poll());
    }

    #[test]
    fn null_id_means_fire_and_forget() {
        let json = json!({"id": null, "method": "mining.notify", "params": []});

        let req = Request::from_json(&json).unwrap();
        assert_eq!(req.id(), None);
    }

    #[test]
    fn integer_id_is_stringified() {
        let json = json!({"id": 42, "method": "foo", "params": []});

        let req = Request::from_json(&json).unwrap();
        assert_eq!(req.id(), Some("42"));
    }

    #[test]
    fn empty_params_round_trip() {
        let json = json!({"id": "1", "method": "foo", "params": []});

        let req = Request::from_json(&json).unwrap();
        assert!(req.params().is_empty());
        assert_eq!(req.to_json(), json);
    }

    #[test]
    fn missing_fields_are_malformed() {
        for json in [
            json!({"method": "foo", "params": []}),
            json!({"id": "1", "params": []}),
            json!({"id": "1", "method": "foo"}),
        ] {
            let err = Request::from_json(&json).unwrap_err();
            assert!(matches!(err, StratumError::MalformedMessage { .. }), "accepted {json}");
        }
    }

    #[test]
    fn empty_or_non_string_method_is_malformed() {
        let json = json!({"id": "1", "method": "", "params": []});
        assert!(Request::from_json(&json).is_err());

        let json = json!({"id": "1", "method": 3, "params": []});
        assert!(Request::from_json(&json).is_err());
    }

    #[test]
    fn non_array_params_is_malformed() {
        let json = json!({"id": "1", "method": "foo", "params": {"a": 1}});
        assert!(Request::from_json(&json).is_err());
    }

    #[test]
    fn poll_request_serialises_to_empty_object() {
        let poll = Request::poll();
        assert!(poll.is_poll());
        assert_eq!(poll.id(), None);
        assert_eq!(poll.method(), None);
        assert_eq!(poll.to_json(), json!({}));
    }

    #[test]
    fn constructing_with_empty_method_is_rejected() {
        let err = Request::new(None, "", vec![]).unwrap_err();
        assert!(matches!(err, StratumError::EmptyMethodName));
    }

    #[test]
    fn id_less_request_serialises_null_id() {
        let req = Request::new(None, "foo", vec![json!(1), json!("x")]).unwrap();
        assert_eq!(
            req.to_json().to_string(),
            r#"{"id":null,"method":"foo","params":[1,"x"]}"#
        );
    }

    #[test]
    fn round_trip_preserves_structure() {
        let req = Request::new(
            Some("19".into()),
            "mining.submit",
            vec![json!("worker"), json!("job-1"), json!(255)],
        )
        .unwrap();

        let parsed = Request::from_json(&req.to_json()).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn id_generator_is_strictly_increasing() {
        let ids: Vec<u64> = (0..16)
            .map(|_| next_request_id().parse().unwrap())
            .collect();

        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "ids not increasing: {pair:?}");
        }
    }
}
