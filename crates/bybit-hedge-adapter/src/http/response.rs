/*
[INPUT]:  Raw response bodies from REST endpoints
[OUTPUT]: Validated `ApiResponse` envelopes or classified errors
[POS]:    HTTP layer - envelope validation shared by public and signed calls
[UPDATE]: When the envelope shape or the return code allow-list changes
*/

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::http::error::{ALLOWED_RET_CODES, BybitError, Result, TRANSIENT_RET_CODES};

/// Validated exchange envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub ret_code: i64,
    pub ret_msg: String,
    pub result: Value,
    pub time: Option<i64>,
}

impl ApiResponse {
    /// Return code the retry layer should re-send without backoff
    pub fn is_transient(&self) -> bool {
        TRANSIENT_RET_CODES.contains(&self.ret_code)
    }

    /// `result.list`, or an empty slice when the endpoint returned none
    pub fn list(&self) -> &[Value] {
        self.result
            .get("list")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Non-empty `result.nextPageCursor`
    pub fn next_page_cursor(&self) -> Option<&str> {
        self.result
            .get("nextPageCursor")
            .and_then(Value::as_str)
            .filter(|cursor| !cursor.is_empty())
    }

    /// Deserialize `result` into a typed payload
    pub fn result_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.result.clone())?)
    }

    /// Deserialize each entry of `result.list`
    pub fn list_as<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.list()
            .iter()
            .map(|item| serde_json::from_value(item.clone()).map_err(BybitError::from))
            .collect()
    }
}

/// Check that a body is a well-formed envelope and that its return code is allowed.
pub fn validate_response(body: &str) -> Result<ApiResponse> {
    let value: Value = serde_json::from_str(body)
        .map_err(|err| BybitError::InvalidResponse(format!("body is not JSON: {err}")))?;

    let Some(object) = value.as_object() else {
        return Err(BybitError::InvalidResponse(format!(
            "unexpected response format: {body}"
        )));
    };

    let ret_code = object.get("retCode").and_then(Value::as_i64);
    let ret_msg = object.get("retMsg").and_then(Value::as_str);
    let (Some(ret_code), Some(ret_msg)) = (ret_code, ret_msg) else {
        return Err(BybitError::InvalidResponse(format!(
            "missing retCode/retMsg: {body}"
        )));
    };

    if !ALLOWED_RET_CODES.contains(&ret_code) {
        return Err(BybitError::Api {
            code: ret_code,
            message: ret_msg.to_string(),
        });
    }

    Ok(ApiResponse {
        ret_code,
        ret_msg: ret_msg.to_string(),
        result: object.get("result").cloned().unwrap_or(Value::Null),
        time: object.get("time").and_then(Value::as_i64),
    })
}
