use core::error::Error;

use api_types::ErrorBody;
use api_types::ResponseEnvelope;
use derive_more::Display;
use error_stack::AttachmentKind;
use error_stack::FrameKind;
use error_stack::Report;

use crate::compute_policy::PolicyError;

pub type RequestResult<T> = Result<T, Report<RequestError>>;

/// Errors answered to vCD with a non-2xx envelope
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[display("Bad request: {message}")]
    BadRequest { message: String },

    #[display("{resource} not found")]
    NotFound { resource: String },

    #[display("Access denied: {message}")]
    Forbidden { message: String },

    #[display("Method {method} is not allowed on {path}")]
    MethodNotAllowed { method: String, path: String },

    #[display("CSE service is disabled")]
    Unavailable,

    #[display("Internal error: {message}")]
    Internal { message: String },

    #[display("{operation} is not implemented")]
    NotImplemented { operation: String },
}

impl Error for RequestError {}

impl RequestError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::Forbidden { .. } => 403,
            Self::MethodNotAllowed { .. } => 405,
            Self::Unavailable => 503,
            Self::Internal { .. } => 500,
            Self::NotImplemented { .. } => 501,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "Bad Request",
            Self::NotFound { .. } => "Not Found",
            Self::Forbidden { .. } => "Forbidden",
            Self::MethodNotAllowed { .. } => "Method Not Allowed",
            Self::Unavailable => "Service Unavailable",
            Self::Internal { .. } => "Internal Server Error",
            Self::NotImplemented { .. } => "Not Implemented",
        }
    }

    pub fn minor_error_code(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "BAD_REQUEST",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Forbidden { .. } => "ACCESS_TO_RESOURCE_IS_FORBIDDEN",
            Self::MethodNotAllowed { .. } => "METHOD_NOT_ALLOWED",
            Self::Unavailable => "SERVICE_UNAVAILABLE",
            Self::Internal { .. } => "INTERNAL_SERVER_ERROR",
            Self::NotImplemented { .. } => "NOT_IMPLEMENTED",
        }
    }
}

fn status_context(status: Option<u16>, resource: &str, fallback: RequestError) -> RequestError {
    match status {
        Some(404) => RequestError::NotFound {
            resource: resource.to_string(),
        },
        Some(403) | Some(401) => RequestError::Forbidden {
            message: format!("no access to {resource}"),
        },
        Some(400) => RequestError::bad_request(format!("vCD rejected the request on {resource}")),
        _ => fallback,
    }
}

/// Maps a vCD status found anywhere in `report` to the matching request
/// error, `fallback` otherwise.
pub fn from_vcd_status<C>(report: Report<C>, resource: &str, fallback: RequestError) -> Report<RequestError> {
    let context = status_context(vcd_client::http_status(&report), resource, fallback);
    report.change_context(context)
}

pub fn from_policy_error(report: Report<PolicyError>) -> Report<RequestError> {
    let context = match report.current_context() {
        PolicyError::EntityNotFound { name } => RequestError::NotFound {
            resource: format!("Compute policy '{name}'"),
        },
        error @ (PolicyError::InvalidName { .. }
        | PolicyError::OperationNotSupported { .. }
        | PolicyError::GlobalPvdcComputePolicyNotSupported { .. }) => RequestError::bad_request(error.to_string()),
        PolicyError::Vcd { operation } => status_context(
            vcd_client::http_status(&report),
            operation,
            RequestError::internal(operation.clone()),
        ),
    };
    report.change_context(context)
}

fn stacktrace<C>(report: &Report<C>) -> Vec<String> {
    report
        .frames()
        .filter_map(|frame| match frame.kind() {
            FrameKind::Context(context) => Some(context.to_string()),
            FrameKind::Attachment(AttachmentKind::Printable(printable)) => Some(printable.to_string()),
            _ => None,
        })
        .collect()
}

/// Response envelope for a failed request. The message is the outermost
/// context; the stacktrace lists every context and printable attachment.
pub fn error_envelope(id: &str, report: &Report<RequestError>) -> ResponseEnvelope {
    let error = report.current_context();
    let body = ErrorBody {
        message: error.to_string(),
        minor_error_code: error.minor_error_code().to_string(),
        reason: error.reason().to_string(),
        description: error.to_string(),
        stacktrace: stacktrace(report),
    };
    ResponseEnvelope {
        id: id.to_string(),
        status_code: error.status_code(),
        headers: Default::default(),
        body: serde_json::to_value(body).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn envelope_carries_status_and_codes() {
        let report = Report::new(RequestError::NotFound {
            resource: "Org VDC abc".into(),
        })
        .attach_printable("looked up by id");
        let envelope = error_envelope("req-1", &report);
        assert_eq!(envelope.status_code, 404);
        assert_eq!(envelope.id, "req-1");
        assert_eq!(
            envelope.body,
            json!({
                "message": "Org VDC abc not found",
                "minorErrorCode": "NOT_FOUND",
                "reason": "Not Found",
                "description": "Org VDC abc not found",
                "stacktrace": ["looked up by id", "Org VDC abc not found"]
            })
        );
    }

    #[test]
    fn policy_errors_map_to_request_errors() {
        let not_found = from_policy_error(Report::new(PolicyError::EntityNotFound { name: "x".into() }));
        assert_eq!(not_found.current_context().status_code(), 404);

        let invalid = from_policy_error(Report::new(PolicyError::InvalidName {
            name: "cse----x".into(),
            reason: "reserved prefix".into(),
        }));
        assert_eq!(invalid.current_context().status_code(), 400);

        let vcd = from_policy_error(Report::new(PolicyError::vcd("list")));
        assert_eq!(vcd.current_context().status_code(), 500);
    }
}
