//! The version registry: which spec versions the driver knows, and how to
//! read a version out of an arbitrary document.

use std::str::FromStr;

use semver::Version;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{
	error::CniError,
	result::{CniResult, Result040, Result100},
};

/// The spec versions this driver can parse results for and convert between.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// The version used to probe plugins with the VERSION command.
pub const PROBE_VERSION: &str = "1.0.0";

/// The wire family a supported version belongs to.
///
/// 0.3.0, 0.3.1, and 0.4.0 share a result format; 1.0.0 has its own.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Family {
	V040,
	V100,
}

pub(crate) fn family(version: &Version) -> Option<Family> {
	match (version.major, version.minor, version.patch) {
		(0, 3, 0) | (0, 3, 1) | (0, 4, 0) => Some(Family::V040),
		(1, 0, 0) => Some(Family::V100),
		_ => None,
	}
}

/// The supported versions, parsed.
pub fn supported_versions() -> Vec<Version> {
	SUPPORTED_VERSIONS
		.iter()
		.map(|v| Version::parse(v).unwrap())
		.collect()
	// UNWRAP: parsing const version strings
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VersionPayload {
	#[serde(deserialize_with = "deserialize_version")]
	pub cni_version: Version,
}

/// Extracts the `cniVersion` field from an arbitrary JSON document.
pub fn parse_version(bytes: &[u8]) -> Result<Version, CniError> {
	let payload: VersionPayload = serde_json::from_slice(bytes)?;
	Ok(payload.cni_version)
}

/// Constructs the [`CniResult`] variant for `version` from raw plugin
/// output, restamped with `version` itself.
///
/// Fails with [`CniError::UnsupportedVersion`] for versions outside
/// [`SUPPORTED_VERSIONS`], and with a JSON error if the bytes do not conform
/// to that version's format.
pub fn new_result(version: &Version, bytes: &[u8]) -> Result<CniResult, CniError> {
	match family(version) {
		Some(Family::V040) => {
			let mut result: Result040 = serde_json::from_slice(bytes)?;
			result.cni_version = version.clone();
			Ok(CniResult::V040(result))
		}
		Some(Family::V100) => {
			let mut result: Result100 = serde_json::from_slice(bytes)?;
			result.cni_version = version.clone();
			Ok(CniResult::V100(result))
		}
		None => Err(CniError::UnsupportedVersion(version.clone())),
	}
}

/// The reply to a VERSION probe.
///
/// Plugins answer with the exhaustive list of spec versions they implement;
/// validation matches a configuration's declared version against that list.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionReply {
	/// The version of the probe payload the plugin was answering.
	#[serde(deserialize_with = "deserialize_version")]
	#[serde(serialize_with = "serialize_version")]
	pub cni_version: Version,

	/// The versions the plugin supports.
	#[serde(deserialize_with = "deserialize_version_list")]
	#[serde(serialize_with = "serialize_version_list")]
	pub supported_versions: Vec<Version>,
}

pub(crate) fn serialize_version<S>(version: &Version, serializer: S) -> Result<S::Ok, S::Error>
where
	S: Serializer,
{
	version.to_string().serialize(serializer)
}

pub(crate) fn serialize_version_list<S>(list: &[Version], serializer: S) -> Result<S::Ok, S::Error>
where
	S: Serializer,
{
	list.iter()
		.map(Version::to_string)
		.collect::<Vec<String>>()
		.serialize(serializer)
}

pub(crate) fn deserialize_version<'de, D>(deserializer: D) -> Result<Version, D::Error>
where
	D: Deserializer<'de>,
{
	use serde::de::Error;
	let j = String::deserialize(deserializer)?;
	Version::from_str(&j).map_err(Error::custom)
}

pub(crate) fn deserialize_version_list<'de, D>(deserializer: D) -> Result<Vec<Version>, D::Error>
where
	D: Deserializer<'de>,
{
	use serde::de::Error;
	let j = Vec::<String>::deserialize(deserializer)?;
	j.iter()
		.map(|s| Version::from_str(s).map_err(Error::custom))
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_version_reads_any_document() {
		let version = parse_version(br#"{"cniVersion": "0.4.0", "whatever": [1, 2]}"#).unwrap();
		assert_eq!(version, Version::new(0, 4, 0));
	}

	#[test]
	fn parse_version_requires_the_field() {
		assert!(parse_version(br#"{"name": "net1"}"#).is_err());
	}

	#[test]
	fn new_result_rejects_unknown_versions() {
		let err = new_result(&Version::new(0, 2, 0), br#"{"cniVersion": "0.2.0"}"#).unwrap_err();
		assert!(matches!(err, CniError::UnsupportedVersion(_)));
	}

	#[test]
	fn new_result_restamps_the_requested_version() {
		let result = new_result(
			&Version::new(0, 3, 1),
			br#"{"cniVersion": "0.4.0", "ips": [{"address": "10.0.0.2/24"}]}"#,
		)
		.unwrap();
		assert_eq!(result.cni_version(), &Version::new(0, 3, 1));
	}

	#[test]
	fn every_supported_version_has_a_family() {
		for version in supported_versions() {
			assert!(family(&version).is_some(), "{} has no family", version);
		}
	}

	#[test]
	fn version_reply_round_trips() {
		let reply: VersionReply = serde_json::from_str(
			r#"{"cniVersion": "1.0.0", "supportedVersions": ["0.3.1", "0.4.0", "1.0.0"]}"#,
		)
		.unwrap();
		assert_eq!(reply.supported_versions.len(), 3);

		let json = serde_json::to_string(&reply).unwrap();
		assert!(json.contains(r#""supportedVersions":["0.3.1","0.4.0","1.0.0"]"#));
	}
}
