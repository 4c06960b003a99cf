//! Local-exec realization of the plugin dispatch contract.
//!
//! A plugin is an executable resolved against the search path, handed the
//! derived configuration on stdin and the invocation context in exactly five
//! environment variables: `CNI_COMMAND`, `CNI_CONTAINERID`, `CNI_NETNS`,
//! `CNI_IFNAME`, `CNI_ARGS`, `CNI_PATH`. Inherited `CNI_`-prefixed variables
//! are scrubbed first so plugins never see a stale context.

use std::{
	env, io,
	path::{Path, PathBuf},
	process::Stdio,
	time::Duration,
};

use log::{debug, info};
use tokio::{io::copy_buf, process::Command as Process, time};
use which::which_in;

use crate::{
	command::Command,
	config::RuntimeConf,
	error::CniError,
	result::ErrorReply,
	version::{VersionReply, PROBE_VERSION},
};

pub(crate) fn find_in_path(plugin: &str, path: &[PathBuf]) -> Result<PathBuf, CniError> {
	let cwd = env::current_dir()?;
	let joined = env::join_paths(path)
		.map_err(|err| CniError::Generic(format!("invalid plugin search path: {}", err)))?;

	which_in(plugin, Some(joined), cwd).map_err(|err| CniError::MissingPlugin {
		name: plugin.into(),
		err,
	})
}

pub(crate) async fn exec_plugin(
	program: &Path,
	command: Command,
	config: &[u8],
	rt: &RuntimeConf,
	path: &[PathBuf],
	timeout: Option<Duration>,
) -> Result<Vec<u8>, CniError> {
	let cni_path = env::join_paths(path)
		.map_err(|err| CniError::Generic(format!("invalid plugin search path: {}", err)))?;

	info!(
		"dispatching command={} to plugin at {}",
		command.as_ref(),
		program.display()
	);

	debug!("spawning child process");
	let mut child = Process::new(program)
		.env_clear()
		.envs(env::vars().filter(|(key, _)| !key.starts_with("CNI_")))
		.env("CNI_COMMAND", command.as_ref())
		.env("CNI_CONTAINERID", &rt.container_id)
		.env("CNI_NETNS", &rt.net_ns)
		.env("CNI_IFNAME", &rt.if_name)
		.env("CNI_ARGS", rt.args_string())
		.env("CNI_PATH", &cni_path)
		.stdin(Stdio::piped())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.kill_on_drop(true)
		.spawn()?;

	{
		debug!("taking child stdin");
		let mut stdin = child.stdin.take().unwrap();
		// UNWRAP: stdin configured above

		debug!("copying bytes={} to stdin", config.len());
		let mut bytes = config;
		match copy_buf(&mut bytes, &mut stdin).await {
			Ok(written) => debug!("wrote bytes={} to stdin", written),
			// A plugin that fails fast may exit without draining stdin;
			// its exit status and stderr say more than the pipe does.
			Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
				debug!("plugin closed stdin early");
			}
			Err(err) => return Err(err.into()),
		}

		debug!("dropping stdin handle");
	}

	debug!("awaiting child");
	let output = match timeout {
		// The child rides inside the awaited future, so losing the race
		// drops it, and kill_on_drop reaps it.
		Some(limit) => time::timeout(limit, child.wait_with_output())
			.await
			.map_err(|_| CniError::Timeout {
				plugin: program.display().to_string(),
				seconds: limit.as_secs(),
			})??,
		None => child.wait_with_output().await?,
	};

	info!(
		"plugin at {} returned status={} stdout bytes={}",
		program.display(),
		output.status,
		output.stdout.len()
	);

	if output.status.success() {
		return Ok(output.stdout);
	}

	if let Ok(error) = serde_json::from_slice::<ErrorReply>(&output.stdout) {
		return Err(CniError::Plugin {
			code: error.code,
			msg: error.msg,
			details: error.details,
		});
	}

	Err(CniError::Generic(format!(
		"plugin {} failed with {}: {}",
		program.display(),
		output.status,
		String::from_utf8_lossy(&output.stderr).trim(),
	)))
}

/// Asks a plugin which spec versions it implements.
pub(crate) async fn version_info(
	plugin: &str,
	path: &[PathBuf],
	timeout: Option<Duration>,
) -> Result<VersionReply, CniError> {
	let program = find_in_path(plugin, path)?;
	let probe = format!(r#"{{"cniVersion":"{}"}}"#, PROBE_VERSION);

	let stdout = exec_plugin(
		&program,
		Command::Version,
		probe.as_bytes(),
		&RuntimeConf::default(),
		path,
		timeout,
	)
	.await?;

	if stdout.is_empty() {
		return Err(CniError::MissingOutput);
	}

	Ok(serde_json::from_slice(&stdout)?)
}
