//! Payload and failure conversion.
//!
//! The payload converter is a composite: encoders are tried in registration
//! order and the first that claims a value produces the payload; decoding
//! dispatches on the payload's `encoding` metadata. `serde_json::Value` is
//! the interchange representation between typed values and encoders.

use crate::error::{
    ActivityError, ApplicationError, CanceledError, ChildWorkflowError, TerminatedError,
    TimeoutError, WorkflowError,
};
use capstan_types::failure::{FailureInfo, TemporalFailure};
use capstan_types::payload::{
    ENCODING_BINARY_NULL, ENCODING_BINARY_PLAIN, ENCODING_JSON, Payload,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// One encoding scheme inside the composite converter.
pub trait EncodingConverter {
    fn encoding(&self) -> &'static str;

    /// Claim `value` and produce a payload, or pass with `Ok(None)`.
    fn try_to_payload(&self, value: &Value) -> Result<Option<Payload>, WorkflowError>;

    fn to_value(&self, payload: &Payload) -> Result<Value, WorkflowError>;
}

/// Encodes unit and `None` as an empty `binary/null` payload.
pub struct BinaryNullConverter;

impl EncodingConverter for BinaryNullConverter {
    fn encoding(&self) -> &'static str {
        ENCODING_BINARY_NULL
    }

    fn try_to_payload(&self, value: &Value) -> Result<Option<Payload>, WorkflowError> {
        if value.is_null() {
            Ok(Some(Payload::new(ENCODING_BINARY_NULL, Vec::new())))
        } else {
            Ok(None)
        }
    }

    fn to_value(&self, _payload: &Payload) -> Result<Value, WorkflowError> {
        Ok(Value::Null)
    }
}

/// Decodes raw byte payloads produced by peers. Never claims a value on the
/// encode side; byte-oriented peers write these, JSON is our native output.
pub struct BinaryPlainConverter;

impl EncodingConverter for BinaryPlainConverter {
    fn encoding(&self) -> &'static str {
        ENCODING_BINARY_PLAIN
    }

    fn try_to_payload(&self, _value: &Value) -> Result<Option<Payload>, WorkflowError> {
        Ok(None)
    }

    fn to_value(&self, payload: &Payload) -> Result<Value, WorkflowError> {
        Ok(Value::Array(
            payload
                .data
                .iter()
                .map(|byte| Value::from(*byte))
                .collect(),
        ))
    }
}

/// The default encoding: any JSON-representable value.
pub struct JsonPlainConverter;

impl EncodingConverter for JsonPlainConverter {
    fn encoding(&self) -> &'static str {
        ENCODING_JSON
    }

    fn try_to_payload(&self, value: &Value) -> Result<Option<Payload>, WorkflowError> {
        let data = serde_json::to_vec(value)
            .map_err(|err| WorkflowError::conversion(err.to_string()))?;
        Ok(Some(Payload::new(ENCODING_JSON, data)))
    }

    fn to_value(&self, payload: &Payload) -> Result<Value, WorkflowError> {
        serde_json::from_slice(&payload.data)
            .map_err(|err| WorkflowError::conversion(err.to_string()))
    }
}

/// Composite converter over an ordered encoder list.
pub struct PayloadConverter {
    converters: Vec<Box<dyn EncodingConverter>>,
}

impl Default for PayloadConverter {
    /// binary/null first so absent values stay compact, JSON last as the
    /// catch-all.
    fn default() -> Self {
        Self {
            converters: vec![
                Box::new(BinaryNullConverter),
                Box::new(BinaryPlainConverter),
                Box::new(JsonPlainConverter),
            ],
        }
    }
}

impl PayloadConverter {
    pub fn new(converters: Vec<Box<dyn EncodingConverter>>) -> Self {
        Self { converters }
    }

    pub fn to_payload<T: Serialize>(&self, value: &T) -> Result<Payload, WorkflowError> {
        let value = serde_json::to_value(value)
            .map_err(|err| WorkflowError::conversion(err.to_string()))?;
        for converter in &self.converters {
            if let Some(payload) = converter.try_to_payload(&value)? {
                return Ok(payload);
            }
        }
        Err(WorkflowError::conversion(
            "no payload converter claimed the value",
        ))
    }

    pub fn from_payload<T: DeserializeOwned>(&self, payload: &Payload) -> Result<T, WorkflowError> {
        let encoding = payload
            .encoding()
            .ok_or_else(|| WorkflowError::conversion("payload has no encoding metadata"))?;
        let converter = self
            .converters
            .iter()
            .find(|converter| converter.encoding() == encoding)
            .ok_or_else(|| {
                WorkflowError::conversion(format!("unsupported payload encoding `{encoding}`"))
            })?;
        let value = converter.to_value(payload)?;
        serde_json::from_value(value).map_err(|err| WorkflowError::conversion(err.to_string()))
    }

    /// Decode the conventional single-argument list. An absent argument
    /// decodes as JSON null so `()` and `Option` targets work.
    pub fn from_arguments<T: DeserializeOwned>(
        &self,
        arguments: &[Payload],
    ) -> Result<T, WorkflowError> {
        match arguments.first() {
            Some(payload) => self.from_payload(payload),
            None => serde_json::from_value(Value::Null)
                .map_err(|err| WorkflowError::conversion(err.to_string())),
        }
    }

    /// Encode an optional result; `None` means the value was unit-like.
    pub fn to_result_payload<T: Serialize>(
        &self,
        value: &T,
    ) -> Result<Option<Payload>, WorkflowError> {
        let payload = self.to_payload(value)?;
        if payload.encoding() == Some(ENCODING_BINARY_NULL) {
            Ok(None)
        } else {
            Ok(Some(payload))
        }
    }
}

/// Maps author-facing errors onto wire failures and back.
#[derive(Default)]
pub struct FailureConverter;

impl FailureConverter {
    pub fn to_failure(&self, error: &WorkflowError) -> TemporalFailure {
        match error {
            WorkflowError::Application(app) => TemporalFailure {
                message: app.message.clone(),
                stack_trace: None,
                cause: None,
                info: FailureInfo::Application {
                    error_type: app.error_type.clone(),
                    non_retryable: app.non_retryable,
                    details: app.details.clone(),
                },
            },
            WorkflowError::Canceled(canceled) => {
                TemporalFailure::canceled(canceled.message.clone())
            }
            WorkflowError::Timeout(timeout) => {
                TemporalFailure::timeout(timeout.message.clone(), timeout.timeout_type)
            }
            WorkflowError::Terminated(terminated) => {
                TemporalFailure::terminated(terminated.message.clone())
            }
            WorkflowError::Activity(activity) => TemporalFailure {
                message: format!("activity {} failed", activity.activity_type),
                stack_trace: None,
                cause: Some(Box::new(self.to_failure(&activity.cause))),
                info: FailureInfo::Activity {
                    activity_type: activity.activity_type.clone(),
                    activity_id: activity.activity_id.clone(),
                },
            },
            WorkflowError::ChildWorkflow(child) => TemporalFailure {
                message: format!("child workflow {} failed", child.workflow_type),
                stack_trace: None,
                cause: Some(Box::new(self.to_failure(&child.cause))),
                info: FailureInfo::ChildWorkflowExecution {
                    namespace: child.namespace.clone(),
                    workflow_id: child.workflow_id.clone(),
                    run_id: child.run_id.clone(),
                    workflow_type: child.workflow_type.clone(),
                },
            },
            // Kinds with no wire shape of their own degrade to application
            // failures carrying the display message.
            other => TemporalFailure::application(other.to_string(), "WorkflowError"),
        }
    }

    pub fn from_failure(&self, failure: &TemporalFailure) -> WorkflowError {
        match &failure.info {
            FailureInfo::Application {
                error_type,
                non_retryable,
                details,
            } => WorkflowError::Application(ApplicationError {
                message: failure.message.clone(),
                error_type: error_type.clone(),
                non_retryable: *non_retryable,
                details: details.clone(),
            }),
            FailureInfo::Canceled { .. } => WorkflowError::Canceled(CanceledError {
                message: failure.message.clone(),
            }),
            FailureInfo::Terminated => WorkflowError::Terminated(TerminatedError {
                message: failure.message.clone(),
            }),
            FailureInfo::Timeout { timeout_type } => WorkflowError::Timeout(TimeoutError {
                message: failure.message.clone(),
                timeout_type: *timeout_type,
            }),
            FailureInfo::ChildWorkflowExecution {
                namespace,
                workflow_id,
                run_id,
                workflow_type,
            } => WorkflowError::ChildWorkflow(ChildWorkflowError {
                namespace: namespace.clone(),
                workflow_id: workflow_id.clone(),
                run_id: run_id.clone(),
                workflow_type: workflow_type.clone(),
                cause: Box::new(match &failure.cause {
                    Some(cause) => self.from_failure(cause),
                    None => WorkflowError::application(failure.message.clone()),
                }),
            }),
            FailureInfo::Activity {
                activity_type,
                activity_id,
            } => WorkflowError::Activity(ActivityError {
                activity_type: activity_type.clone(),
                activity_id: activity_id.clone(),
                cause: Box::new(match &failure.cause {
                    Some(cause) => self.from_failure(cause),
                    None => WorkflowError::application(failure.message.clone()),
                }),
            }),
            FailureInfo::Server { .. } => WorkflowError::Application(ApplicationError::new(
                failure.message.clone(),
                "ServerFailure",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_types::failure::TimeoutType;

    #[test]
    fn round_trips_typical_values() {
        let converter = PayloadConverter::default();
        let payload = converter.to_payload(&vec!["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(payload.encoding(), Some(ENCODING_JSON));
        let back: Vec<String> = converter.from_payload(&payload).unwrap();
        assert_eq!(back, vec!["a", "b"]);
    }

    #[test]
    fn unit_values_use_binary_null() {
        let converter = PayloadConverter::default();
        let payload = converter.to_payload(&()).unwrap();
        assert_eq!(payload.encoding(), Some(ENCODING_BINARY_NULL));
        assert!(payload.data.is_empty());
        let back: Option<u32> = converter.from_payload(&payload).unwrap();
        assert_eq!(back, None);
        assert_eq!(converter.to_result_payload(&()).unwrap(), None);
    }

    #[test]
    fn binary_plain_payloads_decode_to_bytes() {
        let converter = PayloadConverter::default();
        let payload = Payload::new(ENCODING_BINARY_PLAIN, vec![1, 2, 255]);
        let back: Vec<u8> = converter.from_payload(&payload).unwrap();
        assert_eq!(back, vec![1, 2, 255]);
    }

    #[test]
    fn unknown_encoding_is_rejected() {
        let converter = PayloadConverter::default();
        let payload = Payload::new("msgpack/plain", vec![1]);
        let err = converter.from_payload::<u32>(&payload).unwrap_err();
        assert!(matches!(err, WorkflowError::Conversion { .. }));
    }

    #[test]
    fn missing_argument_decodes_as_unit() {
        let converter = PayloadConverter::default();
        let decoded: Option<String> = converter.from_arguments(&[]).unwrap();
        assert_eq!(decoded, None);
    }

    #[test]
    fn failure_round_trip_preserves_kind_and_cause() {
        let failures = FailureConverter;
        let original = WorkflowError::Activity(ActivityError {
            activity_type: "A".into(),
            activity_id: "1".into(),
            cause: Box::new(WorkflowError::Timeout(TimeoutError {
                message: "took too long".into(),
                timeout_type: TimeoutType::StartToClose,
            })),
        });
        let wire = failures.to_failure(&original);
        let back = failures.from_failure(&wire);
        assert_eq!(back, original);
    }

    #[test]
    fn terminated_failures_reconstruct_typed() {
        let failures = FailureConverter;
        let wire = TemporalFailure::terminated(
            "Workflow execution terminated: by parent close policy",
        );
        match failures.from_failure(&wire) {
            WorkflowError::Terminated(t) => {
                assert!(t.message.contains("parent close policy"));
            }
            other => panic!("expected terminated, got {other:?}"),
        }
    }
}
