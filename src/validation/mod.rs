use std::fmt;

pub const WALLET_ADDRESS_HEX_LEN: usize = 40;
pub const ORDER_ID_MAX_LEN: usize = 64;
pub const CHANNEL_MAX_LEN: usize = 32;
pub const NOTIFY_URL_MAX_LEN: usize = 512;
pub const API_PATH_KEY_MAX_LEN: usize = 256;
pub const ALLOWED_HTTP_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub type ValidationResult = Result<(), ValidationError>;

pub fn sanitize_string(value: &str) -> String {
    value
        .chars()
        .filter(|ch| !ch.is_control())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn validate_required(field: &'static str, value: &str) -> ValidationResult {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }

    Ok(())
}

pub fn validate_max_len(field: &'static str, value: &str, max_len: usize) -> ValidationResult {
    if value.len() > max_len {
        return Err(ValidationError::new(
            field,
            format!("must be at most {} characters", max_len),
        ));
    }

    Ok(())
}

pub fn validate_enum(field: &'static str, value: &str, allowed: &[&str]) -> ValidationResult {
    if allowed.iter().all(|candidate| value != *candidate) {
        return Err(ValidationError::new(
            field,
            format!("must be one of: {}", allowed.join(", ")),
        ));
    }

    Ok(())
}

/// `0x` followed by 40 hex digits. Checksum casing is not enforced.
pub fn validate_evm_address(field: &'static str, address: &str) -> ValidationResult {
    validate_required(field, address)?;

    let Some(hex_part) = address.strip_prefix("0x").or_else(|| address.strip_prefix("0X")) else {
        return Err(ValidationError::new(field, "must start with '0x'"));
    };

    if hex_part.len() != WALLET_ADDRESS_HEX_LEN {
        return Err(ValidationError::new(
            field,
            format!("must have exactly {} hex digits", WALLET_ADDRESS_HEX_LEN),
        ));
    }

    if !hex_part.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err(ValidationError::new(field, "must contain only hex digits"));
    }

    Ok(())
}

pub fn validate_chain_id(chain_id: i64) -> ValidationResult {
    if chain_id <= 0 {
        return Err(ValidationError::new("chainId", "must be a positive integer"));
    }

    Ok(())
}

pub fn validate_order_id(order_id: &str) -> ValidationResult {
    validate_required("orderId", order_id)?;
    validate_max_len("orderId", order_id, ORDER_ID_MAX_LEN)?;

    if !order_id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | ':' | '.'))
    {
        return Err(ValidationError::new(
            "orderId",
            "may contain only letters, digits, '-', '_', ':' and '.'",
        ));
    }

    Ok(())
}

pub fn validate_channel(channel: &str) -> ValidationResult {
    validate_max_len("channel", channel, CHANNEL_MAX_LEN)
}

pub fn validate_notify_url(notify_url: &str) -> ValidationResult {
    validate_max_len("notifyUrl", notify_url, NOTIFY_URL_MAX_LEN)?;

    let parsed = url::Url::parse(notify_url)
        .map_err(|_| ValidationError::new("notifyUrl", "must be a valid URL"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ValidationError::new("notifyUrl", "must use http or https"));
    }

    Ok(())
}

pub fn validate_http_method(method: &str) -> ValidationResult {
    validate_enum("method", method, ALLOWED_HTTP_METHODS)
}

pub fn validate_api_path_key(key: &str) -> ValidationResult {
    validate_required("apiPathKey", key)?;
    validate_max_len("apiPathKey", key, API_PATH_KEY_MAX_LEN)
}
