//! Network configuration documents and the per-dispatch derivation of them.

use std::{collections::HashMap, path::PathBuf};

use regex::Regex;
use semver::Version;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{
	error::CniError,
	result::CniResult,
	version::deserialize_version,
};

/// The parsed view of a single plugin configuration.
///
/// Only the fields the driver acts on are modeled; everything else rides in
/// `specific` and survives re-serialization through the raw bytes.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
	#[serde(deserialize_with = "deserialize_version")]
	pub cni_version: Version,
	#[serde(default)]
	pub name: String,
	#[serde(rename = "type")]
	pub plugin: String,
	#[serde(default)]
	pub capabilities: HashMap<String, bool>,
	#[serde(default, rename = "runtimeConfig")]
	pub runtime: Option<Value>,
	#[serde(default)]
	pub prev_result: Option<Value>,
	#[serde(flatten)]
	pub specific: HashMap<String, Value>,
}

/// A single plugin configuration: the parsed view plus the original bytes it
/// was parsed from.
///
/// The pair is immutable; [`inject_conf`] and [`build_one_config`] return
/// fresh pairs whose bytes are the canonical serialization of the amended
/// document.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
	/// The parsed view.
	pub config: NetConf,

	/// The document as the plugin will see it on stdin.
	pub bytes: Vec<u8>,
}

impl NetworkConfig {
	/// Parses a plugin configuration, keeping the original bytes alongside.
	pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, CniError> {
		let config: NetConf = serde_json::from_slice(&bytes)?;
		Ok(Self { config, bytes })
	}
}

/// An ordered, non-empty sequence of plugin configurations sharing a name
/// and version.
#[derive(Clone, Debug)]
pub struct NetworkConfigList {
	/// The network name, restamped into every plugin's derived document.
	pub name: String,

	/// The list's declared version, restamped likewise.
	pub cni_version: Version,

	/// Skips plugin dispatch on CHECK when set.
	pub disable_check: bool,

	/// The plugin sequence, in ADD order.
	pub plugins: Vec<NetworkConfig>,

	/// The document the list was parsed from.
	pub bytes: Vec<u8>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPayload {
	#[serde(deserialize_with = "deserialize_version")]
	cni_version: Version,
	name: String,
	#[serde(default)]
	disable_check: bool,
	#[serde(default)]
	plugins: Vec<Value>,
}

impl NetworkConfigList {
	/// Parses a configuration list document.
	///
	/// Each entry of `plugins` is re-serialized on its own so that the
	/// per-plugin original bytes exist independently of the enclosing list.
	pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, CniError> {
		let payload: ListPayload = serde_json::from_slice(&bytes)?;
		if payload.plugins.is_empty() {
			return Err(CniError::MissingField("plugins"));
		}

		let plugins = payload
			.plugins
			.iter()
			.map(|p| NetworkConfig::from_bytes(serde_json::to_vec(p)?))
			.collect::<Result<Vec<NetworkConfig>, CniError>>()?;

		Ok(Self {
			name: payload.name,
			cni_version: payload.cni_version,
			disable_check: payload.disable_check,
			plugins,
			bytes,
		})
	}
}

/// The per-invocation runtime inputs to a chain operation.
#[derive(Clone, Debug, Default)]
pub struct RuntimeConf {
	/// The container the interface belongs to.
	pub container_id: String,

	/// Reference to the network namespace, as handed to plugins via
	/// `CNI_NETNS`. May be empty on DEL.
	pub net_ns: String,

	/// The interface name inside the container.
	pub if_name: String,

	/// Ordered `(key, value)` pairs for `CNI_ARGS`.
	pub args: Vec<(String, String)>,

	/// Capability-specific data, keyed by capability name.
	///
	/// Only keys matching a capability the plugin declares enabled are
	/// forwarded, inside the derived document's `runtimeConfig`; values are
	/// opaque to the driver.
	pub capability_args: HashMap<String, Value>,

	/// Overrides the default cache root for this invocation.
	pub cache_dir: Option<PathBuf>,
}

impl RuntimeConf {
	/// Checks the container ID against the charset plugins are entitled to
	/// assume.
	pub fn validate(&self) -> Result<(), CniError> {
		let re = Regex::new(r"^[a-z0-9][a-z0-9_.\-]*$").unwrap();
		// UNWRAP: const regex
		if !re.is_match(&self.container_id) {
			return Err(CniError::InvalidContainerId(self.container_id.clone()));
		}

		Ok(())
	}

	/// Encodes the argument pairs as `k1=v1;k2=v2;` for `CNI_ARGS`.
	///
	/// The trailing semicolon is part of the format, and values are not
	/// escaped; plugins parse this byte-for-byte.
	pub(crate) fn args_string(&self) -> String {
		let mut s = String::new();
		for (key, value) in &self.args {
			s.push_str(key);
			s.push('=');
			s.push_str(value);
			s.push(';');
		}

		s
	}
}

/// Returns a new configuration whose document has the keys of `values` set
/// at top level, overwriting collisions. The original is untouched.
pub fn inject_conf(orig: &NetworkConfig, values: Map<String, Value>) -> Result<NetworkConfig, CniError> {
	let mut doc: Map<String, Value> = serde_json::from_slice(&orig.bytes)?;

	for (key, value) in values {
		if key.is_empty() {
			return Err(CniError::Generic("injected keys must not be empty".into()));
		}
		if value.is_null() {
			return Err(CniError::Generic(format!(
				"injected value for key {:?} must not be null",
				key
			)));
		}

		doc.insert(key, value);
	}

	NetworkConfig::from_bytes(serde_json::to_vec(&doc)?)
}

/// Composes the derived document for one plugin dispatch.
///
/// The enclosing list's `name` and `cniVersion` replace whatever the plugin's
/// own document declared; `prevResult` is threaded iff present; and the
/// capability-filtered runtime data lands under `runtimeConfig` iff any of it
/// survives the filter.
pub fn build_one_config(
	name: &str,
	cni_version: &Version,
	orig: &NetworkConfig,
	prev_result: Option<&CniResult>,
	rt: &RuntimeConf,
) -> Result<NetworkConfig, CniError> {
	let mut inject = Map::new();
	inject.insert("name".into(), Value::String(name.into()));
	inject.insert("cniVersion".into(), Value::String(cni_version.to_string()));
	if let Some(prev) = prev_result {
		inject.insert("prevResult".into(), prev.to_value()?);
	}

	let conf = inject_conf(orig, inject)?;
	inject_runtime_config(conf, rt)
}

/// Filters `rt.capability_args` through the plugin's declared capabilities
/// and injects the survivors as `runtimeConfig`.
///
/// A key with no matching enabled capability is dropped, never an error.
fn inject_runtime_config(conf: NetworkConfig, rt: &RuntimeConf) -> Result<NetworkConfig, CniError> {
	let mut rc = Map::new();
	for (capability, &enabled) in &conf.config.capabilities {
		if !enabled {
			continue;
		}
		if let Some(data) = rt.capability_args.get(capability) {
			rc.insert(capability.clone(), data.clone());
		}
	}

	if rc.is_empty() {
		return Ok(conf);
	}

	let mut inject = Map::new();
	inject.insert("runtimeConfig".into(), Value::Object(rc));
	inject_conf(&conf, inject)
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn conf(doc: Value) -> NetworkConfig {
		NetworkConfig::from_bytes(serde_json::to_vec(&doc).unwrap()).unwrap()
	}

	fn doc(config: &NetworkConfig) -> Value {
		serde_json::from_slice(&config.bytes).unwrap()
	}

	#[test]
	fn inject_returns_a_fresh_pair() {
		let orig = conf(json!({"cniVersion": "0.4.0", "type": "bridge", "mtu": 1400}));
		let before = orig.bytes.clone();

		let mut values = Map::new();
		values.insert("name".into(), json!("net1"));
		let injected = inject_conf(&orig, values).unwrap();

		assert_eq!(orig.bytes, before);
		assert_eq!(doc(&injected)["name"], "net1");
		assert_eq!(doc(&injected)["mtu"], 1400);
		assert_eq!(injected.config.name, "net1");
	}

	#[test]
	fn inject_overwrites_collisions() {
		let orig = conf(json!({"cniVersion": "0.4.0", "type": "bridge", "name": "stale"}));

		let mut values = Map::new();
		values.insert("name".into(), json!("fresh"));
		let injected = inject_conf(&orig, values).unwrap();

		assert_eq!(doc(&injected)["name"], "fresh");
	}

	#[test]
	fn inject_rejects_null_values() {
		let orig = conf(json!({"cniVersion": "0.4.0", "type": "bridge"}));

		let mut values = Map::new();
		values.insert("name".into(), Value::Null);
		assert!(inject_conf(&orig, values).is_err());
	}

	#[test]
	fn derived_document_carries_the_list_identity() {
		let orig = conf(json!({
			"cniVersion": "0.3.1",
			"name": "ignored",
			"type": "bridge"
		}));

		let derived = build_one_config(
			"net1",
			&Version::new(0, 4, 0),
			&orig,
			None,
			&RuntimeConf::default(),
		)
		.unwrap();

		let value = doc(&derived);
		assert_eq!(value["name"], "net1");
		assert_eq!(value["cniVersion"], "0.4.0");
		assert!(value.get("prevResult").is_none());
		assert!(value.get("runtimeConfig").is_none());
	}

	#[test]
	fn derived_document_threads_prev_result() {
		let orig = conf(json!({"cniVersion": "0.4.0", "type": "bridge"}));
		let prev = crate::version::new_result(
			&Version::new(0, 4, 0),
			br#"{"cniVersion": "0.4.0", "ips": [{"address": "10.0.0.2/24"}]}"#,
		)
		.unwrap();

		let derived = build_one_config(
			"net1",
			&Version::new(0, 4, 0),
			&orig,
			Some(&prev),
			&RuntimeConf::default(),
		)
		.unwrap();

		let value = doc(&derived);
		assert_eq!(value["prevResult"]["ips"][0]["address"], "10.0.0.2/24");
		assert_eq!(value["prevResult"]["cniVersion"], "0.4.0");
	}

	#[test]
	fn runtime_config_keeps_only_enabled_declared_capabilities() {
		let orig = conf(json!({
			"cniVersion": "0.4.0",
			"type": "ptp",
			"capabilities": {"portMappings": true, "bandwidth": false}
		}));

		let rt = RuntimeConf {
			capability_args: [
				("portMappings".into(), json!([{"hostPort": 8080, "containerPort": 80}])),
				("ipRanges".into(), json!([{"subnet": "10.0.0.0/24"}])),
				("bandwidth".into(), json!({"ingressRate": 1000})),
			]
			.into_iter()
			.collect(),
			..RuntimeConf::default()
		};

		let derived =
			build_one_config("net1", &Version::new(0, 4, 0), &orig, None, &rt).unwrap();

		let value = doc(&derived);
		let rc = value["runtimeConfig"].as_object().unwrap();
		assert_eq!(rc.len(), 1);
		assert_eq!(rc["portMappings"][0]["hostPort"], 8080);
	}

	#[test]
	fn runtime_config_is_left_off_when_nothing_survives() {
		let orig = conf(json!({
			"cniVersion": "0.4.0",
			"type": "ptp",
			"capabilities": {"portMappings": true}
		}));

		let derived = build_one_config(
			"net1",
			&Version::new(0, 4, 0),
			&orig,
			None,
			&RuntimeConf::default(),
		)
		.unwrap();

		assert!(doc(&derived).get("runtimeConfig").is_none());
	}

	#[test]
	fn args_encode_with_trailing_semicolon() {
		let rt = RuntimeConf {
			args: vec![
				("IgnoreUnknown".into(), "1".into()),
				("K8S_POD_NAME".into(), "web-0".into()),
			],
			..RuntimeConf::default()
		};

		assert_eq!(rt.args_string(), "IgnoreUnknown=1;K8S_POD_NAME=web-0;");
		assert_eq!(RuntimeConf::default().args_string(), "");
	}

	#[test]
	fn container_ids_are_validated() {
		let ok = RuntimeConf {
			container_id: "c1-web.0".into(),
			..RuntimeConf::default()
		};
		assert!(ok.validate().is_ok());

		for bad in ["", "-leading", "UPPER", "sp ace"] {
			let rt = RuntimeConf {
				container_id: bad.into(),
				..RuntimeConf::default()
			};
			assert!(rt.validate().is_err(), "{:?} should be rejected", bad);
		}
	}

	#[test]
	fn list_parsing_requires_plugins() {
		let empty = serde_json::to_vec(&json!({
			"cniVersion": "0.4.0",
			"name": "net1",
			"plugins": []
		}))
		.unwrap();
		assert!(NetworkConfigList::from_bytes(empty).is_err());

		let list = NetworkConfigList::from_bytes(
			serde_json::to_vec(&json!({
				"cniVersion": "0.4.0",
				"name": "net1",
				"disableCheck": true,
				"plugins": [
					{"type": "bridge", "cniVersion": "0.3.1"},
					{"type": "portmap", "cniVersion": "0.3.1", "capabilities": {"portMappings": true}}
				]
			}))
			.unwrap(),
		)
		.unwrap();

		assert_eq!(list.name, "net1");
		assert!(list.disable_check);
		assert_eq!(list.plugins.len(), 2);
		assert_eq!(list.plugins[1].config.plugin, "portmap");
		assert_eq!(list.plugins[1].config.capabilities["portMappings"], true);
	}
}
