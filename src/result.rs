//! Versioned plugin results.
//!
//! A plugin replies to ADD with a result document in the version its input
//! config declared. Two wire families cover the supported versions: the
//! 0.3.0/0.3.1/0.4.0 family, where each `ips` entry carries a `"4"`/`"6"`
//! address-family discriminator, and the 1.0.0 family, which dropped it.
//! [`CniResult`] is the sum of both; the chain driver only ever handles the
//! sum, converting at the seams where a version is pinned (dispatch input,
//! cache read-back).

use std::{collections::HashMap, net::IpAddr, path::PathBuf};

use ipnetwork::IpNetwork;
use macaddr::MacAddr6;
use semver::Version;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::{
	error::CniError,
	version::{self, deserialize_version, serialize_version, Family},
};

/// A plugin result in whichever version it was produced.
///
/// Construction goes through [`version::new_result`], which picks the
/// variant for a stated version; there is deliberately no self-describing
/// deserialization, as the two wire formats are not distinguishable without
/// the version in hand.
#[derive(Clone, Debug, PartialEq)]
pub enum CniResult {
	/// A result in the 0.3.0, 0.3.1, or 0.4.0 wire format.
	V040(Result040),

	/// A result in the 1.0.0 wire format.
	V100(Result100),
}

impl CniResult {
	/// The version this result is currently expressed in.
	pub fn cni_version(&self) -> &Version {
		match self {
			CniResult::V040(r) => &r.cni_version,
			CniResult::V100(r) => &r.cni_version,
		}
	}

	/// Serializes to the JSON bytes a plugin would see as `prevResult`.
	pub fn to_bytes(&self) -> Result<Vec<u8>, CniError> {
		match self {
			CniResult::V040(r) => Ok(serde_json::to_vec(r)?),
			CniResult::V100(r) => Ok(serde_json::to_vec(r)?),
		}
	}

	/// Serializes to a JSON value, for injection into a derived config.
	pub fn to_value(&self) -> Result<Value, CniError> {
		match self {
			CniResult::V040(r) => Ok(serde_json::to_value(r)?),
			CniResult::V100(r) => Ok(serde_json::to_value(r)?),
		}
	}

	/// Re-expresses this result in `target`.
	///
	/// Within a wire family this is a restamp of the version field, and so is
	/// idempotent when source and target already match. Across families the
	/// `ips` entries change shape. Targets outside the supported set fail
	/// with [`CniError::UnsupportedConversion`].
	pub fn convert_to(&self, target: &Version) -> Result<CniResult, CniError> {
		let family = version::family(target).ok_or_else(|| CniError::UnsupportedConversion {
			from: self.cni_version().clone(),
			to: target.clone(),
		})?;

		Ok(match (self, family) {
			(CniResult::V040(r), Family::V040) => {
				let mut r = r.clone();
				r.cni_version = target.clone();
				CniResult::V040(r)
			}
			(CniResult::V100(r), Family::V100) => {
				let mut r = r.clone();
				r.cni_version = target.clone();
				CniResult::V100(r)
			}
			(CniResult::V040(r), Family::V100) => CniResult::V100(Result100 {
				cni_version: target.clone(),
				interfaces: r.interfaces.clone(),
				ips: r.ips.iter().map(Ip::from).collect(),
				routes: r.routes.clone(),
				dns: r.dns.clone(),
				specific: r.specific.clone(),
			}),
			(CniResult::V100(r), Family::V040) => CniResult::V040(Result040 {
				cni_version: target.clone(),
				interfaces: r.interfaces.clone(),
				ips: r.ips.iter().map(Ip040::from).collect(),
				routes: r.routes.clone(),
				dns: r.dns.clone(),
				specific: r.specific.clone(),
			}),
		})
	}
}

/// A result in the 0.3.0/0.3.1/0.4.0 wire format.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Result040 {
	/// The version of this result document.
	#[serde(deserialize_with = "deserialize_version")]
	#[serde(serialize_with = "serialize_version")]
	pub cni_version: Version,

	/// All interfaces created by the chain so far.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub interfaces: Vec<Interface>,

	/// All IPs assigned by the chain so far.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub ips: Vec<Ip040>,

	/// All routes created by the chain so far.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub routes: Vec<Route>,

	/// Final DNS configuration for the namespace.
	#[serde(default, skip_serializing_if = "Dns::is_empty")]
	pub dns: Dns,

	/// Off-spec fields, passed through untouched.
	#[serde(flatten)]
	pub specific: HashMap<String, Value>,
}

/// A result in the 1.0.0 wire format.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Result100 {
	/// The version of this result document.
	#[serde(deserialize_with = "deserialize_version")]
	#[serde(serialize_with = "serialize_version")]
	pub cni_version: Version,

	/// All interfaces created by the chain so far.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub interfaces: Vec<Interface>,

	/// All IPs assigned by the chain so far.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub ips: Vec<Ip>,

	/// All routes created by the chain so far.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub routes: Vec<Route>,

	/// Final DNS configuration for the namespace.
	#[serde(default, skip_serializing_if = "Dns::is_empty")]
	pub dns: Dns,

	/// Off-spec fields, passed through untouched.
	#[serde(flatten)]
	pub specific: HashMap<String, Value>,
}

/// Interface structure for result types.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
	/// The name of the interface.
	pub name: String,

	/// The hardware address of the interface (if applicable).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	#[serde(deserialize_with = "deserialize_mac")]
	#[serde(serialize_with = "serialize_mac")]
	pub mac: Option<MacAddr6>,

	/// The path to the namespace the interface is in, as passed via
	/// `CNI_NETNS`, or unset for a host interface.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sandbox: Option<PathBuf>,
}

/// IP structure for the 1.0.0 wire format.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ip {
	/// The IP address.
	pub address: IpNetwork,

	/// The default gateway for this subnet, if one exists.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub gateway: Option<IpAddr>,

	/// Index into the parent result's `interfaces` list.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub interface: Option<usize>,
}

/// IP structure for the 0.3.x/0.4.0 wire format.
///
/// Identical to [`Ip`] except for the `version` address-family discriminator
/// those versions required.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ip040 {
	/// `"4"` or `"6"`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,

	/// The IP address.
	pub address: IpNetwork,

	/// The default gateway for this subnet, if one exists.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub gateway: Option<IpAddr>,

	/// Index into the parent result's `interfaces` list.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub interface: Option<usize>,
}

impl From<&Ip040> for Ip {
	fn from(ip: &Ip040) -> Self {
		Self {
			address: ip.address,
			gateway: ip.gateway,
			interface: ip.interface,
		}
	}
}

impl From<&Ip> for Ip040 {
	fn from(ip: &Ip) -> Self {
		Self {
			version: Some(
				match ip.address {
					IpNetwork::V4(_) => "4",
					IpNetwork::V6(_) => "6",
				}
				.into(),
			),
			address: ip.address,
			gateway: ip.gateway,
			interface: ip.interface,
		}
	}
}

/// Route structure for result types.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
	/// The destination of the route.
	pub dst: IpNetwork,

	/// The next hop address, if the plugin set one.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub gw: Option<IpAddr>,
}

/// DNS configuration or settings.
///
/// All fields are optional; empty fields are left off the wire.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dns {
	/// Priority-ordered list of DNS nameservers this network is aware of.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub nameservers: Vec<IpAddr>,

	/// The local domain used for short hostname lookups.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub domain: Option<String>,

	/// Priority-ordered list of search domains for short hostname lookups.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub search: Vec<String>,

	/// List of options to be passed to the resolver.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub options: Vec<String>,
}

impl Dns {
	/// True if no field is set, in which case the whole object stays off the
	/// wire.
	pub fn is_empty(&self) -> bool {
		self.nameservers.is_empty()
			&& self.domain.is_none()
			&& self.search.is_empty()
			&& self.options.is_empty()
	}
}

/// The document a plugin prints alongside a non-zero exit.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorReply {
	pub code: i32,
	pub msg: String,
	#[serde(default)]
	pub details: String,
}

fn serialize_mac<S>(mac: &Option<MacAddr6>, serializer: S) -> Result<S::Ok, S::Error>
where
	S: Serializer,
{
	match mac {
		Some(mac) => mac.to_string().serialize(serializer),
		None => serializer.serialize_none(),
	}
}

fn deserialize_mac<'de, D>(deserializer: D) -> Result<Option<MacAddr6>, D::Error>
where
	D: Deserializer<'de>,
{
	let j = Option::<String>::deserialize(deserializer)?;
	j.map(|s| s.parse().map_err(de::Error::custom)).transpose()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn v(s: &str) -> Version {
		Version::parse(s).unwrap()
	}

	fn sample() -> CniResult {
		crate::version::new_result(
			&v("0.4.0"),
			br#"{
				"cniVersion": "0.4.0",
				"interfaces": [{"name": "eth0", "mac": "aa:bb:cc:dd:ee:ff", "sandbox": "/var/run/netns/c1"}],
				"ips": [{"version": "4", "address": "10.1.0.5/16", "gateway": "10.1.0.1", "interface": 0}],
				"routes": [{"dst": "0.0.0.0/0"}],
				"dns": {"nameservers": ["10.1.0.1"]}
			}"#,
		)
		.unwrap()
	}

	#[test]
	fn convert_is_idempotent_on_same_version() {
		let result = sample();
		let same = result.convert_to(&v("0.4.0")).unwrap();
		assert_eq!(result, same);
	}

	#[test]
	fn convert_up_drops_address_family_discriminator() {
		let up = sample().convert_to(&v("1.0.0")).unwrap();
		assert_eq!(up.cni_version(), &v("1.0.0"));

		let value: Value = serde_json::from_slice(&up.to_bytes().unwrap()).unwrap();
		let ip = &value["ips"][0];
		assert!(ip.get("version").is_none());
		assert_eq!(ip["address"], "10.1.0.5/16");
		assert_eq!(ip["interface"], 0);
	}

	#[test]
	fn convert_down_recovers_address_family_discriminator() {
		let down = sample()
			.convert_to(&v("1.0.0"))
			.unwrap()
			.convert_to(&v("0.4.0"))
			.unwrap();

		let value: Value = serde_json::from_slice(&down.to_bytes().unwrap()).unwrap();
		assert_eq!(value["ips"][0]["version"], "4");
	}

	#[test]
	fn convert_within_family_restamps() {
		let moved = sample().convert_to(&v("0.3.1")).unwrap();
		assert_eq!(moved.cni_version(), &v("0.3.1"));
	}

	#[test]
	fn convert_to_unknown_version_fails() {
		let err = sample().convert_to(&v("0.2.0")).unwrap_err();
		assert!(matches!(err, CniError::UnsupportedConversion { .. }));
	}

	#[test]
	fn empty_fields_stay_off_the_wire() {
		let result = crate::version::new_result(
			&v("0.4.0"),
			br#"{"cniVersion": "0.4.0", "ips": [{"address": "10.0.0.2/24"}]}"#,
		)
		.unwrap();

		let value: Value = serde_json::from_slice(&result.to_bytes().unwrap()).unwrap();
		let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
		assert_eq!(keys.len(), 2, "unexpected keys: {:?}", keys);
		assert_eq!(value["cniVersion"], "0.4.0");
		assert_eq!(value["ips"][0]["address"], "10.0.0.2/24");
	}
}
