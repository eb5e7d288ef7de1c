//! The result slot of a response message.
//!
//! A Stratum result is either a single value echoed verbatim, or an array
//! of data optionally prefixed by a *subject tuple* giving the receiving
//! party context for the result.

use serde_json::Value;

use crate::error::{StratumError, StratumResult};

/// The payload of a response's `result` slot.
///
/// Produced from raw JSON by [`ResultData::from_json`], which picks the
/// variant from the shape of the value: arrays become [`ResultData::Array`]
/// (with subject-tuple detection), and everything else (including null,
/// scalars, and objects) is wrapped verbatim as [`ResultData::Value`].
#[derive(Debug, Clone, PartialEq)]
pub enum ResultData {
    /// A single JSON value, carried verbatim
    Value(Value),

    /// An ordered list of data with an optional subject tuple prefix
    Array(ArrayResult),
}

impl ResultData {
    /// Map a raw JSON result payload to the appropriate variant.
    pub fn from_json(json: &Value) -> StratumResult<Self> {
        match json {
            Value::Array(elements) => Ok(ResultData::Array(ArrayResult::from_elements(elements)?)),
            other => Ok(ResultData::Value(other.clone())),
        }
    }

    /// Render the result as a JSON value.
    pub fn to_json(&self) -> Value {
        match self {
            ResultData::Value(value) => value.clone(),
            ResultData::Array(array) => array.to_json(),
        }
    }
}

impl From<Value> for ResultData {
    /// Wrap a single JSON value. For array payloads build an
    /// [`ArrayResult`] instead; this conversion does no shape detection.
    fn from(value: Value) -> Self {
        ResultData::Value(value)
    }
}

/// An array result: ordered data with an optional subject tuple.
///
/// With a subject present, the serialised form leads with the tuple:
///
/// ```json
/// [["mining.notify", "ae6812eb4cd7735a302a8a9dd95cf71f"], "08000002", 4]
/// ```
///
/// Without one, the array contains only data:
///
/// ```json
/// ["1DiiVSnksihdpdP1Pex7jghMAZffZiBY9q"]
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayResult {
    subject: Option<SubjectTuple>,
    data: Vec<Value>,
}

impl ArrayResult {
    /// An array result with no subject.
    pub fn new(data: Vec<Value>) -> Self {
        Self {
            subject: None,
            data,
        }
    }

    /// An array result carrying a subject tuple.
    pub fn with_subject(subject: SubjectTuple, data: Vec<Value>) -> Self {
        Self {
            subject: Some(subject),
            data,
        }
    }

    /// Parse the elements of a JSON result array.
    ///
    /// If the first element is itself an array it is taken to be the
    /// subject tuple; anything else means the whole array is data.
    fn from_elements(elements: &[Value]) -> StratumResult<Self> {
        let Some(Value::Array(tuple)) = elements.first() else {
            return Ok(Self::new(elements.to_vec()));
        };

        let subject = SubjectTuple::from_elements(tuple, elements)?;

        Ok(Self {
            subject: Some(subject),
            data: elements[1..].to_vec(),
        })
    }

    /// The subject tuple, if the sender provided one.
    pub fn subject(&self) -> Option<&SubjectTuple> {
        self.subject.as_ref()
    }

    /// The data elements (after the subject tuple, when present).
    pub fn data(&self) -> &[Value] {
        &self.data
    }

    /// Render as a JSON array, subject tuple first when present.
    pub fn to_json(&self) -> Value {
        let mut elements = Vec::with_capacity(self.data.len() + 1);

        if let Some(subject) = &self.subject {
            elements.push(subject.to_json());
        }

        elements.extend(self.data.iter().cloned());
        Value::Array(elements)
    }
}

/// The optional context header of an array result.
///
/// On the wire this is a leading sub-array of one or two strings: a
/// human-readable subject, and optionally an opaque *subject key* the
/// receiver can quote back later in the conversation to reference the
/// context. A key without a subject cannot be represented, which is
/// exactly the protocol invariant.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectTuple {
    subject: String,
    key: Option<String>,
}

impl SubjectTuple {
    /// A subject with no key.
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            key: None,
        }
    }

    /// A subject together with its correlation key.
    pub fn with_key(subject: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            key: Some(key.into()),
        }
    }

    fn from_elements(tuple: &[Value], payload: &[Value]) -> StratumResult<Self> {
        let context = || Value::Array(payload.to_vec());

        match tuple {
            [] => Err(StratumError::malformed_detail("empty subject tuple", context())),
            [subject] => Ok(Self::new(string_element(subject, "subject", &context)?)),
            [subject, key] => Ok(Self::with_key(
                string_element(subject, "subject", &context)?,
                string_element(key, "subject key", &context)?,
            )),
            _ => Err(StratumError::malformed_detail(
                "subject tuple has more than two elements",
                context(),
            )),
        }
    }

    /// The subject of the result.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// The opaque correlation key, if the sender offered one.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    fn to_json(&self) -> Value {
        let mut tuple = vec![Value::String(self.subject.clone())];

        if let Some(key) = &self.key {
            tuple.push(Value::String(key.clone()));
        }

        Value::Array(tuple)
    }
}

fn string_element(
    value: &Value,
    what: &str,
    context: &impl Fn() -> Value,
) -> StratumResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| StratumError::malformed_detail(format!("{what} is not a string"), context()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_results_wrap_any_value_verbatim() {
        for value in [json!(true), json!(42), json!("ok"), json!(null), json!({"k": 1})] {
            let result = ResultData::from_json(&value).unwrap();
            assert_eq!(result, ResultData::Value(value.clone()));
            assert_eq!(result.to_json(), value);
        }
    }

    #[test]
    fn array_without_subject_is_all_data() {
        // First element is a string, not an array, so there is no subject.
        let json = json!(["1DiiVSnksihdpdP1Pex7jghMAZffZiBY9q"]);

        let ResultData::Array(array) = ResultData::from_json(&json).unwrap() else {
            panic!("expected array result");
        };
        assert!(array.subject().is_none());
        assert_eq!(array.data(), &[json!("1DiiVSnksihdpdP1Pex7jghMAZffZiBY9q")]);
        assert_eq!(array.to_json(), json);
    }

    #[test]
    fn subject_tuple_with_key_is_detected() {
        let json = json!([
            ["mining.notify", "ae6812eb4cd7735a302a8a9dd95cf71f"],
            "08000002",
            4
        ]);

        let ResultData::Array(array) = ResultData::from_json(&json).unwrap() else {
            panic!("expected array result");
        };
        let subject = array.subject().expect("subject tuple");
        assert_eq!(subject.subject(), "mining.notify");
        assert_eq!(subject.key(), Some("ae6812eb4cd7735a302a8a9dd95cf71f"));
        assert_eq!(array.data(), &[json!("08000002"), json!(4)]);
        assert_eq!(array.to_json(), json);
    }

    #[test]
    fn subject_tuple_without_key_is_accepted() {
        let json = json!([["mining.notify"], "data"]);

        let ResultData::Array(array) = ResultData::from_json(&json).unwrap() else {
            panic!("expected array result");
        };
        let subject = array.subject().expect("subject tuple");
        assert_eq!(subject.subject(), "mining.notify");
        assert_eq!(subject.key(), None);
        assert_eq!(array.to_json(), json);
    }

    #[test]
    fn empty_subject_tuple_is_malformed() {
        let json = json!([[], "data"]);
        assert!(ResultData::from_json(&json).is_err());
    }

    #[test]
    fn oversized_subject_tuple_is_malformed() {
        let json = json!([["a", "b", "c"], "data"]);
        assert!(ResultData::from_json(&json).is_err());
    }

    #[test]
    fn non_string_subject_is_malformed() {
        let json = json!([[42], "data"]);
        assert!(ResultData::from_json(&json).is_err());

        let json = json!([["subject", 42], "data"]);
        assert!(ResultData::from_json(&json).is_err());
    }

    #[test]
    fn empty_array_result_is_empty_data() {
        let ResultData::Array(array) = ResultData::from_json(&json!([])).unwrap() else {
            panic!("expected array result");
        };
        assert!(array.subject().is_none());
        assert!(array.data().is_empty());
    }

    #[test]
    fn serialised_length_matches_data_plus_subject() {
        let bare = ArrayResult::new(vec![json!(1), json!(2)]);
        assert_eq!(bare.to_json().as_array().unwrap().len(), 2);

        let with_subject = ArrayResult::with_subject(
            SubjectTuple::with_key("s", "k"),
            vec![json!(1), json!(2)],
        );
        assert_eq!(with_subject.to_json().as_array().unwrap().len(), 3);
    }
}
