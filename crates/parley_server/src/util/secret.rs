#![forbid(unsafe_code)]

use core::fmt;

/// String wrapper that never prints its contents in Debug/Display output.
/// Used for auth secrets loaded from config or env.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	/// Access the underlying secret. Call sites should be the only places
	/// the raw value crosses into a crypto or network API.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(****)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("****")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn debug_output_is_redacted() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s:?}"), "SecretString(****)");
		assert_eq!(s.to_string(), "****");
		assert_eq!(s.expose(), "hunter2");
	}
}
