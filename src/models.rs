//! Response envelopes shared by the API
//!
//! Request DTOs live next to the handlers that use them.

use serde::Serialize;

/// Generic success response
#[derive(Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub data: Option<T>,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn with_data(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Envelope for an operation that completed but did not do what was asked
    pub fn declined(message: impl Into<String>, data: T) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: Some(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Payload {
        count: usize,
    }

    #[test]
    fn test_data_is_flattened_into_envelope() {
        let body = serde_json::to_value(SuccessResponse::with_data("ok", Payload { count: 2 })).unwrap();
        assert_eq!(body, json!({"success": true, "message": "ok", "count": 2}));

        let body = serde_json::to_value(SuccessResponse::declined("no", Payload { count: 0 })).unwrap();
        assert_eq!(body["success"], false);
    }
}
