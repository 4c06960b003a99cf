//! The chain driver: sequences plugins for ADD, CHECK, and DEL.

use std::{path::PathBuf, time::Duration};

use log::{debug, info};
use semver::Version;

use crate::{
	cache,
	command::Command,
	config::{build_one_config, NetworkConfig, NetworkConfigList, RuntimeConf},
	error::CniError,
	exec,
	grpc::GrpcClient,
	result::CniResult,
	version::{self, VersionReply},
};

/// How plugin dispatches leave the process.
///
/// Both realizations answer the same contract; the driver dispatches without
/// knowing which it holds.
pub enum Transport {
	/// Fork/exec of a plugin resolved on the search path.
	Exec {
		/// Cap on each plugin run. The child is killed and reaped when it
		/// lapses, and likewise when the whole chain future is dropped.
		timeout: Option<Duration>,
	},

	/// Unary calls to a remote dispatch service.
	Grpc(GrpcClient),
}

impl Transport {
	async fn invoke(
		&self,
		command: Command,
		plugin: &str,
		config: &[u8],
		rt: &RuntimeConf,
		path: &[PathBuf],
		want_result: bool,
	) -> Result<Option<CniResult>, CniError> {
		let stdout = match self {
			Transport::Exec { timeout } => {
				let program = exec::find_in_path(plugin, path)?;
				exec::exec_plugin(&program, command, config, rt, path, *timeout).await?
			}
			Transport::Grpc(client) => client.invoke(command, config, rt).await?,
		};

		if !want_result {
			return Ok(None);
		}
		if stdout.is_empty() {
			return Err(CniError::MissingOutput);
		}

		// Plugins answer in the version their input config declared, which
		// the derived document restamped to the list's.
		let version = version::parse_version(config)?;
		version::new_result(&version, &stdout).map(Some)
	}
}

// CHECK, and the cached prevResult context for DEL, arrived in 0.4.0.
fn at_least_040(version: &Version) -> bool {
	*version >= Version::new(0, 4, 0)
}

/// Drives chains of plugins over a search path and a transport.
///
/// Stateless across calls apart from the on-disk result cache; concurrent
/// calls on disjoint `(network, container, interface)` triples need no
/// coordination.
pub struct CniConfig {
	/// Directories searched for plugin executables, in order.
	///
	/// Also used to resolve VERSION probes when the dispatch transport is
	/// remote, since the service has no VERSION call.
	pub path: Vec<PathBuf>,

	transport: Transport,
}

impl CniConfig {
	/// A driver running plugins locally from `path`.
	pub fn new(path: Vec<PathBuf>) -> Self {
		Self {
			path,
			transport: Transport::Exec { timeout: None },
		}
	}

	/// A driver dispatching through the given transport.
	pub fn with_transport(path: Vec<PathBuf>, transport: Transport) -> Self {
		Self { path, transport }
	}

	/// Executes the chain with ADD, threading each plugin's result into the
	/// next, and caches the final result.
	///
	/// The first failure aborts the walk; earlier plugins are not rolled
	/// back, that being the caller's [`del_list`][CniConfig::del_list]
	/// responsibility. A result that cannot be cached is an error too.
	pub async fn add_list(
		&self,
		list: &NetworkConfigList,
		rt: &RuntimeConf,
	) -> Result<CniResult, CniError> {
		rt.validate()?;
		info!(
			"ADD chain for network {} with {} plugins",
			list.name,
			list.plugins.len()
		);

		let mut result = None;
		for conf in &list.plugins {
			result = Some(
				self.add_plugin(&list.name, &list.cni_version, conf, result.take(), rt)
					.await?,
			);
		}

		let result = result.ok_or(CniError::MissingField("plugins"))?;
		cache::set(&result, &list.name, rt)?;
		Ok(result)
	}

	/// Replays the chain with CHECK, presenting the cached ADD result to
	/// every plugin.
	pub async fn check_list(
		&self,
		list: &NetworkConfigList,
		rt: &RuntimeConf,
	) -> Result<(), CniError> {
		if !at_least_040(&list.cni_version) {
			return Err(CniError::CheckUnsupported(list.cni_version.clone()));
		}
		if list.disable_check {
			debug!("CHECK disabled for network {}", list.name);
			return Ok(());
		}

		let cached = cache::get(&list.name, &list.cni_version, rt)?;
		for conf in &list.plugins {
			self.run_plugin(
				Command::Check,
				&list.name,
				&list.cni_version,
				conf,
				cached.as_ref(),
				rt,
			)
			.await?;
		}

		Ok(())
	}

	/// Unwinds the chain with DEL, in reverse ADD order.
	///
	/// The cached result rides along as `prevResult` on lists of 0.4.0 and
	/// newer; a missing cache entry means no context, not failure. The cache
	/// entry survives a failed walk so a retry sees the same context, and is
	/// removed best-effort after a complete one.
	pub async fn del_list(
		&self,
		list: &NetworkConfigList,
		rt: &RuntimeConf,
	) -> Result<(), CniError> {
		info!(
			"DEL chain for network {} with {} plugins",
			list.name,
			list.plugins.len()
		);

		let cached = if at_least_040(&list.cni_version) {
			cache::get(&list.name, &list.cni_version, rt)?
		} else {
			None
		};

		for conf in list.plugins.iter().rev() {
			self.run_plugin(
				Command::Del,
				&list.name,
				&list.cni_version,
				conf,
				cached.as_ref(),
				rt,
			)
			.await?;
		}

		cache::delete(&list.name, rt);
		Ok(())
	}

	/// ADD for a single plugin configuration, using its own name and
	/// version.
	pub async fn add(&self, conf: &NetworkConfig, rt: &RuntimeConf) -> Result<CniResult, CniError> {
		rt.validate()?;

		let result = self
			.add_plugin(&conf.config.name, &conf.config.cni_version, conf, None, rt)
			.await?;
		cache::set(&result, &conf.config.name, rt)?;
		Ok(result)
	}

	/// CHECK for a single plugin configuration.
	pub async fn check(&self, conf: &NetworkConfig, rt: &RuntimeConf) -> Result<(), CniError> {
		if !at_least_040(&conf.config.cni_version) {
			return Err(CniError::CheckUnsupported(conf.config.cni_version.clone()));
		}

		let cached = cache::get(&conf.config.name, &conf.config.cni_version, rt)?;
		self.run_plugin(
			Command::Check,
			&conf.config.name,
			&conf.config.cni_version,
			conf,
			cached.as_ref(),
			rt,
		)
		.await
	}

	/// DEL for a single plugin configuration.
	pub async fn del(&self, conf: &NetworkConfig, rt: &RuntimeConf) -> Result<(), CniError> {
		let cached = if at_least_040(&conf.config.cni_version) {
			cache::get(&conf.config.name, &conf.config.cni_version, rt)?
		} else {
			None
		};

		self.run_plugin(
			Command::Del,
			&conf.config.name,
			&conf.config.cni_version,
			conf,
			cached.as_ref(),
			rt,
		)
		.await?;

		cache::delete(&conf.config.name, rt);
		Ok(())
	}

	/// Checks every plugin in the list against the list's declared version
	/// and returns the union of enabled capabilities.
	///
	/// All plugins are probed even after a failure, so the error aggregates
	/// everything wrong with the list at once.
	pub async fn validate_list(&self, list: &NetworkConfigList) -> Result<Vec<String>, CniError> {
		let mut capabilities: Vec<String> = Vec::new();
		let mut errors = Vec::new();

		for conf in &list.plugins {
			if let Err(err) = self
				.validate_plugin(&conf.config.plugin, &list.cni_version)
				.await
			{
				errors.push(err);
			}

			for (capability, &enabled) in &conf.config.capabilities {
				if enabled && !capabilities.contains(capability) {
					capabilities.push(capability.clone());
				}
			}
		}

		if errors.is_empty() {
			Ok(capabilities)
		} else {
			Err(CniError::Validation(errors))
		}
	}

	/// [`validate_list`][CniConfig::validate_list] for a single plugin
	/// configuration.
	pub async fn validate(&self, conf: &NetworkConfig) -> Result<Vec<String>, CniError> {
		self.validate_plugin(&conf.config.plugin, &conf.config.cni_version)
			.await?;

		Ok(conf
			.config
			.capabilities
			.iter()
			.filter(|(_, &enabled)| enabled)
			.map(|(capability, _)| capability.clone())
			.collect())
	}

	/// The cached result of the previous [`add_list`][CniConfig::add_list]
	/// for this list, if any, in the list's version.
	pub fn cached_list_result(
		&self,
		list: &NetworkConfigList,
		rt: &RuntimeConf,
	) -> Result<Option<CniResult>, CniError> {
		cache::get(&list.name, &list.cni_version, rt)
	}

	/// The cached result of the previous [`add`][CniConfig::add] for this
	/// configuration, if any, in its declared version.
	pub fn cached_result(
		&self,
		conf: &NetworkConfig,
		rt: &RuntimeConf,
	) -> Result<Option<CniResult>, CniError> {
		cache::get(&conf.config.name, &conf.config.cni_version, rt)
	}

	/// Asks a plugin which spec versions it implements.
	///
	/// Always resolved and run locally; the remote dispatch service has no
	/// VERSION call.
	pub async fn version_info(&self, plugin: &str) -> Result<VersionReply, CniError> {
		let timeout = match &self.transport {
			Transport::Exec { timeout } => *timeout,
			Transport::Grpc(_) => None,
		};

		exec::version_info(plugin, &self.path, timeout).await
	}

	async fn add_plugin(
		&self,
		name: &str,
		cni_version: &Version,
		conf: &NetworkConfig,
		prev: Option<CniResult>,
		rt: &RuntimeConf,
	) -> Result<CniResult, CniError> {
		debug!("ADD plugin {} for network {}", conf.config.plugin, name);

		let derived = build_one_config(name, cni_version, conf, prev.as_ref(), rt)?;
		let result = self
			.transport
			.invoke(
				Command::Add,
				&conf.config.plugin,
				&derived.bytes,
				rt,
				&self.path,
				true,
			)
			.await?;

		result.ok_or(CniError::MissingOutput)
	}

	async fn run_plugin(
		&self,
		command: Command,
		name: &str,
		cni_version: &Version,
		conf: &NetworkConfig,
		prev: Option<&CniResult>,
		rt: &RuntimeConf,
	) -> Result<(), CniError> {
		debug!(
			"{} plugin {} for network {}",
			command.as_ref(),
			conf.config.plugin,
			name
		);

		let derived = build_one_config(name, cni_version, conf, prev, rt)?;
		self.transport
			.invoke(
				command,
				&conf.config.plugin,
				&derived.bytes,
				rt,
				&self.path,
				false,
			)
			.await?;

		Ok(())
	}

	async fn validate_plugin(&self, plugin: &str, expected: &Version) -> Result<(), CniError> {
		let info = self.version_info(plugin).await?;
		if info.supported_versions.iter().any(|v| v == expected) {
			Ok(())
		} else {
			Err(CniError::Generic(format!(
				"plugin {} does not support config version {}",
				plugin, expected
			)))
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn list(doc: serde_json::Value) -> NetworkConfigList {
		NetworkConfigList::from_bytes(serde_json::to_vec(&doc).unwrap()).unwrap()
	}

	fn rt() -> RuntimeConf {
		RuntimeConf {
			container_id: "c1".into(),
			if_name: "eth0".into(),
			..RuntimeConf::default()
		}
	}

	#[tokio::test]
	async fn check_is_gated_before_any_dispatch() {
		// No plugin exists on the (empty) search path, so reaching dispatch
		// would fail with a missing plugin, not the gate error.
		let driver = CniConfig::new(Vec::new());
		let list = list(json!({
			"cniVersion": "0.3.1",
			"name": "net1",
			"plugins": [{"type": "definitely-not-installed", "cniVersion": "0.3.1"}]
		}));

		let err = driver.check_list(&list, &rt()).await.unwrap_err();
		assert!(matches!(err, CniError::CheckUnsupported(_)));
	}

	#[tokio::test]
	async fn disable_check_short_circuits() {
		let driver = CniConfig::new(Vec::new());
		let list = list(json!({
			"cniVersion": "0.4.0",
			"name": "net1",
			"disableCheck": true,
			"plugins": [{"type": "definitely-not-installed", "cniVersion": "0.4.0"}]
		}));

		driver.check_list(&list, &rt()).await.unwrap();
	}

	#[tokio::test]
	async fn add_refuses_invalid_container_ids() {
		let driver = CniConfig::new(Vec::new());
		let list = list(json!({
			"cniVersion": "0.4.0",
			"name": "net1",
			"plugins": [{"type": "definitely-not-installed", "cniVersion": "0.4.0"}]
		}));

		let bad = RuntimeConf {
			container_id: "NOT OK".into(),
			..rt()
		};
		let err = driver.add_list(&list, &bad).await.unwrap_err();
		assert!(matches!(err, CniError::InvalidContainerId(_)));
	}
}
