use serde_json::Value;
use tracing::{debug, instrument};

use crate::{
    error::ServiceError,
    types::{GenerationRequest, SuggestRequest},
};

/// Default number of new tokens, when the request does not set it
pub const DEFAULT_MAX_NEW_TOKENS: usize = 24;
/// Lower bound of `maxNewTokens`
pub const MIN_NEW_TOKENS: i64 = 1;
/// Upper bound of `maxNewTokens`
pub const MAX_NEW_TOKENS: i64 = 48;
/// Default temperature, when the request does not set it
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
/// Lower bound of `temperature`
pub const MIN_TEMPERATURE: f64 = 0.1;
/// Upper bound of `temperature`
pub const MAX_TEMPERATURE: f64 = 1.5;

const MAX_NEW_TOKENS_FIELD: &str = "maxNewTokens";
const TEMPERATURE_FIELD: &str = "temperature";

/// Parses a raw request body. An empty or `null` body is treated as an
/// empty object, so that it is reported as a missing prompt.
pub fn parse_body(body: &[u8]) -> Result<SuggestRequest, ServiceError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(SuggestRequest::default());
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ServiceError::InvalidRequest(format!("Invalid JSON body: {e}")))?;
    match value {
        Value::Null => Ok(SuggestRequest::default()),
        Value::Object(_) => serde_json::from_value(value)
            .map_err(|e| ServiceError::InvalidRequest(format!("Invalid JSON body: {e}"))),
        _ => Err(ServiceError::InvalidRequest(
            "Request body must be a JSON object.".to_string(),
        )),
    }
}

/// Validates a raw request into a [`GenerationRequest`].
///
/// The prompt is required and must not be blank. Numeric parameters are
/// coerced then clamped into their bounds, out of range values are
/// corrected silently rather than rejected.
#[instrument(level = "debug", skip_all)]
pub fn validate(request: SuggestRequest) -> Result<GenerationRequest, ServiceError> {
    let SuggestRequest {
        prompt,
        max_new_tokens,
        temperature,
    } = request;

    let prompt = match prompt {
        None => return Err(ServiceError::missing_prompt()),
        Some(Value::String(prompt)) => prompt,
        Some(_) => {
            return Err(ServiceError::InvalidRequest(
                "'prompt' must be a string.".to_string(),
            ))
        }
    };
    if prompt.trim().is_empty() {
        return Err(ServiceError::missing_prompt());
    }

    let max_new_tokens = match max_new_tokens {
        Some(value) => clamp_max_new_tokens(coerce_int(MAX_NEW_TOKENS_FIELD, &value)?),
        None => DEFAULT_MAX_NEW_TOKENS,
    };
    let temperature = match temperature {
        Some(value) => clamp_temperature(coerce_float(TEMPERATURE_FIELD, &value)?),
        None => DEFAULT_TEMPERATURE,
    };

    debug!(
        prompt_chars = prompt.chars().count(),
        max_new_tokens, temperature, "Validated suggestion request"
    );

    Ok(GenerationRequest {
        prompt,
        max_new_tokens,
        temperature,
    })
}

/// Saturates `value` into `[1, 48]`
pub fn clamp_max_new_tokens(value: i64) -> usize {
    value.clamp(MIN_NEW_TOKENS, MAX_NEW_TOKENS) as usize
}

/// Saturates `value` into `[0.1, 1.5]`. `value` must be finite.
pub fn clamp_temperature(value: f64) -> f64 {
    value.clamp(MIN_TEMPERATURE, MAX_TEMPERATURE)
}

fn invalid_number(field: &str) -> ServiceError {
    ServiceError::InvalidRequest(format!("Invalid '{field}': expected a number."))
}

/// Coerces a JSON value into an integer. Floats are truncated toward zero,
/// values beyond the `i64` range saturate.
fn coerce_int(field: &str, value: &Value) -> Result<i64, ServiceError> {
    match value {
        Value::Number(number) => {
            if let Some(value) = number.as_i64() {
                Ok(value)
            } else if number.as_u64().is_some() {
                Ok(i64::MAX)
            } else {
                number
                    .as_f64()
                    .filter(|value| value.is_finite())
                    .map(|value| value.trunc() as i64)
                    .ok_or_else(|| invalid_number(field))
            }
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(value) = s.parse::<i64>() {
                return Ok(value);
            }
            s.parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .map(|value| value.trunc() as i64)
                .ok_or_else(|| invalid_number(field))
        }
        _ => Err(invalid_number(field)),
    }
}

/// Coerces a JSON value into a finite float
fn coerce_float(field: &str, value: &Value) -> Result<f64, ServiceError> {
    let value = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    value
        .filter(|value| value.is_finite())
        .ok_or_else(|| invalid_number(field))
}
