//! Method channel
//!
//! Wire types for the JSON-lines transport and the dispatch of named method
//! calls onto [`ControlFacade`], including the error codes callers match on.

use crate::backend::VpnBackend;
use crate::error::{Error, Field};
use crate::facade::ControlFacade;
use crate::types::Credentials;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request read from the transport
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Invoke a named method
    Call {
        /// Echoed in the reply
        id: u64,
        /// Method name
        method: String,
        /// Named arguments object
        #[serde(default)]
        arguments: Value,
    },
    /// Attach the status stream listener
    Listen,
    /// Detach the status stream listener
    Cancel,
}

/// Message written to the transport
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Successful method reply
    Result {
        /// Id of the call
        id: u64,
        /// Returned value
        value: Value,
    },
    /// Failed method reply
    Error {
        /// Id of the call
        id: u64,
        /// See [`MethodError::code`]
        code: String,
        /// See [`MethodError::message`]
        message: String,
        /// See [`MethodError::details`]
        details: Option<String>,
    },
    /// Status stream item
    Event {
        /// Stage or traffic-stats string
        value: String,
    },
}

impl Response {
    /// Reply for the call `id`
    pub fn reply(id: u64, result: Result<Value, MethodError>) -> Self {
        match result {
            Ok(value) => Response::Result { id, value },
            Err(e) => Response::Error {
                id,
                code: e.code,
                message: e.message,
                details: e.details,
            },
        }
    }
}

/// Error reply of a method call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodError {
    /// Stable code callers branch on
    pub code: String,
    /// Human readable summary
    pub message: String,
    /// OS supplied detail, when there is one
    pub details: Option<String>,
}

impl MethodError {
    fn new(code: &str, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details,
        }
    }

    fn not_implemented(method: &str) -> Self {
        Self::new(
            "notImplemented",
            format!("Method '{}' is not implemented", method),
            None,
        )
    }
}

/// What a dispatched call produced
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Send this value back
    Reply(Value),
    /// Fire-and-forget method, nothing to send
    NoReply,
}

fn field_code(field: Field) -> &'static str {
    match field {
        Field::BundleIdentifier => "-2",
        Field::DisplayLabel => "-3",
        Field::GroupIdentifier => "-4",
        Field::Config => "-2",
    }
}

fn initialize_error(err: Error) -> MethodError {
    match err {
        Error::InvalidArgument(field) => {
            MethodError::new(field_code(field), err.to_string(), None)
        }
        other => {
            let details = other.detail().map(String::from);
            MethodError::new("-4", other.to_string(), details)
        }
    }
}

fn connect_error(err: Error) -> MethodError {
    match err {
        Error::NotInitialized => MethodError::new("-1", err.to_string(), None),
        Error::InvalidArgument(field) => MethodError::new(
            field_code(field),
            err.to_string(),
            Some(format!("{} must not be empty", field)),
        ),
        Error::CredentialsMissing => MethodError::new("-2", err.to_string(), None),
        other => {
            let details = other
                .detail()
                .map(String::from)
                .unwrap_or_else(|| other.to_string());
            MethodError::new("99", "permission denied", Some(details))
        }
    }
}

/// String argument; absent, `null` or non-string values read as `None`
fn string_arg(arguments: &Value, key: &str) -> Option<String> {
    arguments.get(key)?.as_str().map(String::from)
}

/// Run `method` against `facade`
pub async fn dispatch<B: VpnBackend>(
    facade: &ControlFacade<B>,
    method: &str,
    arguments: &Value,
) -> Result<Outcome, MethodError> {
    log::debug!("Dispatching {}", method);
    match method {
        "status" => Ok(Outcome::Reply(
            facade.traffic_stats().map(Value::String).unwrap_or(Value::Null),
        )),
        "stage" => Ok(Outcome::Reply(Value::from(
            facade.current_status().as_str(),
        ))),
        "initialize" => {
            let bundle = string_arg(arguments, "providerBundleIdentifier").unwrap_or_default();
            let label = string_arg(arguments, "localizedDescription").unwrap_or_default();
            let group = string_arg(arguments, "groupIdentifier").unwrap_or_default();
            let status = facade
                .initialize(&bundle, &label, &group)
                .await
                .map_err(initialize_error)?;
            Ok(Outcome::Reply(Value::from(status.as_str())))
        }
        "connect" => {
            let config = string_arg(arguments, "config").unwrap_or_default();
            let credentials = Credentials::new(
                string_arg(arguments, "username"),
                string_arg(arguments, "password"),
            );
            facade
                .connect(&config, credentials)
                .await
                .map_err(connect_error)?;
            Ok(Outcome::Reply(Value::Null))
        }
        "disconnect" => {
            facade.disconnect().await;
            Ok(Outcome::NoReply)
        }
        "dispose" => {
            facade.dispose();
            Ok(Outcome::NoReply)
        }
        other => Err(MethodError::not_implemented(other)),
    }
}
