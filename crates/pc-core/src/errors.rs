use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Failure codes shared by the service and the client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthRequired,
    ConfigMissing,
    PromptMissing,
    RefMissing,
    LockConflict,
    NetworkError,
    ServerError,
    InvalidInput,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::ConfigMissing => "CONFIG_MISSING",
            ErrorCode::PromptMissing => "PROMPT_MISSING",
            ErrorCode::RefMissing => "REF_MISSING",
            ErrorCode::LockConflict => "LOCK_CONFLICT",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::InvalidInput => "INVALID_INPUT",
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::AuthRequired => "Authentication is required.",
            ErrorCode::ConfigMissing => "A required provider configuration is missing.",
            ErrorCode::PromptMissing => "Prompt data is missing or invalid.",
            ErrorCode::RefMissing => "Required references are missing.",
            ErrorCode::LockConflict => "Another active run is already using this target.",
            ErrorCode::NetworkError => "Network request failed.",
            ErrorCode::InvalidInput => "The request was missing required input.",
            ErrorCode::ServerError => "Unexpected server error.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_uppercase().as_str() {
            "AUTH_REQUIRED" => Ok(ErrorCode::AuthRequired),
            "CONFIG_MISSING" => Ok(ErrorCode::ConfigMissing),
            "PROMPT_MISSING" => Ok(ErrorCode::PromptMissing),
            "REF_MISSING" => Ok(ErrorCode::RefMissing),
            "LOCK_CONFLICT" => Ok(ErrorCode::LockConflict),
            "NETWORK_ERROR" => Ok(ErrorCode::NetworkError),
            "SERVER_ERROR" => Ok(ErrorCode::ServerError),
            "INVALID_INPUT" => Ok(ErrorCode::InvalidInput),
            other => Err(format!("Unknown error code: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub code: String,
    pub message: String,
}

impl ClassifiedError {
    /// Message shown to the user; falls back to the code's default text.
    pub fn user_message(&self) -> String {
        let trimmed = self.message.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
        self.code
            .parse::<ErrorCode>()
            .unwrap_or(ErrorCode::ServerError)
            .default_message()
            .to_string()
    }
}

/// Classifies a failure. An explicit code wins, then the fallback code, then
/// keywords in the message.
pub fn classify(message: &str, code: Option<&str>, fallback: Option<ErrorCode>) -> ClassifiedError {
    let explicit = code
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| fallback.map(|value| value.as_str().to_string()));

    let code = explicit.unwrap_or_else(|| code_from_message(message).as_str().to_string());
    let message = if message.trim().is_empty() {
        code.parse::<ErrorCode>()
            .unwrap_or(ErrorCode::ServerError)
            .default_message()
            .to_string()
    } else {
        message.to_string()
    };
    ClassifiedError { code, message }
}

fn code_from_message(message: &str) -> ErrorCode {
    let lower = message.to_lowercase();
    if lower.contains("auth") {
        ErrorCode::AuthRequired
    } else if lower.contains("replicate") && lower.contains("key") {
        ErrorCode::ConfigMissing
    } else if lower.contains("prompt") {
        ErrorCode::PromptMissing
    } else if lower.contains("reference") {
        ErrorCode::RefMissing
    } else if lower.contains("lock") {
        ErrorCode::LockConflict
    } else if lower.contains("network") || lower.contains("failed to fetch") || lower.contains("http")
    {
        ErrorCode::NetworkError
    } else {
        ErrorCode::ServerError
    }
}
