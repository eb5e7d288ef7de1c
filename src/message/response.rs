//! Stratum response messages.

use serde_json::{Map, Value, json};

use crate::error::{StratumError, StratumResult};
use crate::marshaller::ResponseKind;

use super::result::ResultData;

/// A Stratum response message.
///
/// Responses must include:
///
/// - an `id` field matching the triggering request's identifier (never
///   null; integer ids on the wire are accepted and stringified),
/// - a `result` field, which may be null,
/// - an `error` field, null on success.
///
/// The wire format permits both `result` and `error` to be populated for
/// partial success; the error dominates, so [`Response::was_successful`]
/// is false. Note that a response whose `result` and `error` are both null
/// reports *success* with a null value result; failures that omit the
/// error slot are indistinguishable from successes.
///
/// Serialisation always writes both slots, emitting JSON null for an
/// absent one.
#[derive(Debug, Clone)]
pub struct Response {
    id: String,
    result: Option<ResultData>,
    error: Option<String>,
    /// Routing metadata attached when this response was matched against a
    /// pending request; not part of the wire form.
    kind: Option<ResponseKind>,
}

impl Response {
    /// A successful response carrying a result.
    pub fn success(id: impl Into<String>, result: ResultData) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
            kind: None,
        }
    }

    /// A failed response carrying an error description.
    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.into()),
            kind: None,
        }
    }

    /// A partial-success response carrying both a result and an error.
    pub fn with_result_and_error(
        id: impl Into<String>,
        result: ResultData,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: Some(error.into()),
            kind: None,
        }
    }

    /// The error response for a request naming a method the receiver does
    /// not support.
    pub fn unsupported_method(id: impl Into<String>, method: &str) -> Self {
        Self::failure(id, format!("Method not supported: {method}"))
    }

    /// Parse a response from its JSON object form.
    pub fn from_json(json: &Value) -> StratumResult<Self> {
        let object = json
            .as_object()
            .ok_or_else(|| StratumError::malformed_detail("response is not an object", json))?;

        let id = parse_id(object, json)?;
        let result = parse_result(object, json)?;
        let error = parse_error(object);

        Ok(Self {
            id,
            result: Some(result),
            error,
            kind: None,
        })
    }

    /// The identifier of the request this response answers.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The result payload, if one was supplied.
    pub fn result(&self) -> Option<&ResultData> {
        self.result.as_ref()
    }

    /// The error description, if the request failed.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Whether the request was processed successfully.
    ///
    /// Equivalent to `self.error().is_none()`; the error slot dominates
    /// even when a result is also present.
    pub fn was_successful(&self) -> bool {
        self.error.is_none()
    }

    /// The response kind the marshaller resolved from the pending-request
    /// table, when this response arrived over the wire.
    pub fn kind(&self) -> Option<ResponseKind> {
        self.kind
    }

    pub(crate) fn with_kind(mut self, kind: ResponseKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Render the response as a JSON object. Both the `result` and `error`
    /// slots are always present, null when absent.
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "result": self.result.as_ref().map(ResultData::to_json),
            "error": self.error,
        })
    }
}

/// Wire-field equality: `id`, `result`, and `error`. The routing `kind` is
/// metadata about how a response was matched, not part of the message.
impl PartialEq for Response {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.result == other.result && self.error == other.error
    }
}

fn parse_id(object: &Map<String, Value>, payload: &Value) -> StratumResult<String> {
    let id = object
        .get("id")
        .ok_or_else(|| StratumError::malformed_detail("missing 'id'", payload))?;

    match id {
        Value::Null => Err(StratumError::malformed_detail(
            "response 'id' cannot be null",
            payload,
        )),
        Value::String(text) => Ok(text.clone()),
        other => Ok(other.to_string()),
    }
}

fn parse_result(object: &Map<String, Value>, payload: &Value) -> StratumResult<ResultData> {
    let result = object
        .get("result")
        .ok_or_else(|| StratumError::malformed_detail("missing 'result'", payload))?;

    ResultData::from_json(result)
}

fn parse_error(object: &Map<String, Value>) -> Option<String> {
    match object.get("error") {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text.clone()),
        Some(other) => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_successful_response() {
        let json = json!({"id": "42", "result": true, "error": null});

        let res = Response::from_json(&json).unwrap();
        assert_eq!(res.id(), "42");
        assert_eq!(res.result(), Some(&ResultData::Value(json!(true))));
        assert_eq!(res.error(), None);
        assert!(res.was_successful());
    }

    #[test]
    fn integer_id_is_stringified() {
        let json = json!({"id": 1, "result": true, "error": null});

        let res = Response::from_json(&json).unwrap();
        assert_eq!(res.id(), "1");
    }

    #[test]
    fn null_id_is_malformed() {
        let json = json!({"id": null, "result": true, "error": null});
        assert!(Response::from_json(&json).is_err());
    }

    #[test]
    fn missing_result_key_is_malformed() {
        let json = json!({"id": "1", "error": null});
        assert!(Response::from_json(&json).is_err());
    }

    #[test]
    fn error_dominates_result() {
        // Partial success: both slots populated. Error wins.
        let json = json!({"id": "1", "result": "partial", "error": "went sideways"});

        let res = Response::from_json(&json).unwrap();
        assert_eq!(res.result(), Some(&ResultData::Value(json!("partial"))));
        assert_eq!(res.error(), Some("went sideways"));
        assert!(!res.was_successful());
    }

    #[test]
    fn null_result_and_error_is_a_success() {
        let json = json!({"id": "1", "result": null, "error": null});

        let res = Response::from_json(&json).unwrap();
        assert!(res.was_successful());
        assert_eq!(res.result(), Some(&ResultData::Value(Value::Null)));
    }

    #[test]
    fn non_string_error_is_stringified() {
        let json = json!({"id": "1", "result": null, "error": 20});

        let res = Response::from_json(&json).unwrap();
        assert_eq!(res.error(), Some("20"));
        assert!(!res.was_successful());
    }

    #[test]
    fn serialisation_always_emits_both_slots() {
        let res = Response::failure("9", "nope");
        assert_eq!(
            res.to_json(),
            json!({"id": "9", "result": null, "error": "nope"})
        );

        let res = Response::success("9", ResultData::Value(json!(true)));
        assert_eq!(
            res.to_json(),
            json!({"id": "9", "result": true, "error": null})
        );
    }

    #[test]
    fn unsupported_method_response_text() {
        let res = Response::unsupported_method("3", "mining.bogus");
        assert_eq!(res.error(), Some("Method not supported: mining.bogus"));
        assert!(!res.was_successful());
    }

    #[test]
    fn round_trip_preserves_wire_fields() {
        use crate::message::ArrayResult;

        let res = Response::with_result_and_error(
            "15",
            ResultData::Array(ArrayResult::new(vec![json!("a"), json!(1)])),
            "partial failure",
        );

        let parsed = Response::from_json(&res.to_json()).unwrap();
        assert_eq!(parsed, res);
        assert_eq!(parsed.to_json(), res.to_json());
    }

    #[test]
    fn equality_ignores_routing_kind() {
        let plain = Response::success("1", ResultData::Value(json!(true)));
        let tagged = plain.clone().with_kind(ResponseKind("test.kind"));
        assert_eq!(plain, tagged);
    }
}
