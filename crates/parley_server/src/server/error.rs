#![forbid(unsafe_code)]

use thiserror::Error;

/// Failure taxonomy for the delivery subsystem.
///
/// `Conflict` is recovered internally by the private-chat resolver and
/// never reaches a client; `Unavailable` on best-effort paths (presence,
/// typing) is logged and swallowed, while on the message path it turns
/// into a failure envelope for the sender only.
#[derive(Debug, Error)]
pub enum DeliveryError {
	#[error("unauthenticated: {0}")]
	Unauthenticated(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("conflict: {0}")]
	Conflict(String),

	#[error("store unavailable")]
	Unavailable(#[from] anyhow::Error),
}

impl From<sqlx::Error> for DeliveryError {
	fn from(e: sqlx::Error) -> Self {
		match e {
			sqlx::Error::RowNotFound => DeliveryError::NotFound("row not found".to_string()),
			other => DeliveryError::Unavailable(anyhow::Error::new(other)),
		}
	}
}
