use std::str::FromStr;

use crate::error::CniError;

/// Identifies the operation a plugin is dispatched with.
///
/// ADD, DEL, and CHECK travel over either transport; VERSION is only ever
/// answered by a local executable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
	/// The ADD command.
	Add,

	/// The DEL command.
	Del,

	/// The CHECK command.
	///
	/// Introduced in spec version 0.4.0; the driver refuses to dispatch it
	/// for older configurations.
	Check,

	/// The VERSION command.
	Version,
}

impl FromStr for Command {
	type Err = CniError;

	/// Parses the Command from exactly ADD, DEL, CHECK, or VERSION only.
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"ADD" => Ok(Self::Add),
			"DEL" => Ok(Self::Del),
			"CHECK" => Ok(Self::Check),
			"VERSION" => Ok(Self::Version),
			other => Err(CniError::Generic(format!("unknown CNI command: {}", other))),
		}
	}
}

impl AsRef<str> for Command {
	/// Returns one of ADD, DEL, CHECK, or VERSION.
	fn as_ref(&self) -> &'static str {
		match self {
			Command::Add => "ADD",
			Command::Del => "DEL",
			Command::Check => "CHECK",
			Command::Version => "VERSION",
		}
	}
}
