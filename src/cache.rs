//! On-disk cache of the last successful ADD result.
//!
//! One file per `(network name, container id, interface name)` triple, under
//! `${cache_dir}/results/`. The triple's components are joined with `-` and
//! not escaped, so names containing `-` can collide; this is a documented
//! limitation of the layout. There is no locking: concurrent writers on the
//! same key race and the last one wins.

use std::{
	fs, io,
	io::Write,
	os::unix::fs::{DirBuilderExt, OpenOptionsExt},
	path::{Path, PathBuf},
};

use log::debug;
use semver::Version;

use crate::{config::RuntimeConf, error::CniError, result::CniResult, version};

/// Cache root used when the runtime does not override it.
pub const DEFAULT_CACHE_DIR: &str = "/var/lib/cni";

fn results_path(net_name: &str, rt: &RuntimeConf) -> PathBuf {
	rt.cache_dir
		.clone()
		.unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR))
		.join("results")
		.join(format!(
			"{}-{}-{}",
			net_name, rt.container_id, rt.if_name
		))
}

/// Stores the final result of an ADD, overwriting any previous entry.
///
/// The parent directory is created mode 0700 and the file written mode 0600;
/// cached results can embed addresses and runtime data not meant for other
/// users.
pub fn set(result: &CniResult, net_name: &str, rt: &RuntimeConf) -> Result<(), CniError> {
	let data = result.to_bytes()?;
	let path = results_path(net_name, rt);
	debug!("caching result bytes={} at {}", data.len(), path.display());

	write_restricted(&path, &data).map_err(|err| CniError::Cache {
		name: net_name.into(),
		err,
	})
}

fn write_restricted(path: &Path, data: &[u8]) -> io::Result<()> {
	if let Some(dir) = path.parent() {
		fs::DirBuilder::new()
			.recursive(true)
			.mode(0o700)
			.create(dir)?;
	}

	let mut file = fs::OpenOptions::new()
		.write(true)
		.create(true)
		.truncate(true)
		.mode(0o600)
		.open(path)?;
	file.write_all(data)
}

/// Reads back the cached result, converted to `cni_version`.
///
/// A result that cannot be read is treated as absent, never an error; a
/// result that reads but does not parse is an error. If conversion fails but
/// the stored version already equals the requested one, the result is
/// returned unchanged (the absent converter means no conversion was needed).
pub fn get(
	net_name: &str,
	cni_version: &Version,
	rt: &RuntimeConf,
) -> Result<Option<CniResult>, CniError> {
	let path = results_path(net_name, rt);
	let data = match fs::read(&path) {
		Ok(data) => data,
		Err(err) => {
			debug!("no cached result at {}: {}", path.display(), err);
			return Ok(None);
		}
	};

	let stored = version::parse_version(&data)?;
	let result = version::new_result(&stored, &data)?;

	match result.convert_to(cni_version) {
		Ok(converted) => Ok(Some(converted)),
		Err(_) if stored == *cni_version => Ok(Some(result)),
		Err(err) => Err(err),
	}
}

/// Best-effort removal of the cache entry. Absence is not an error.
pub fn delete(net_name: &str, rt: &RuntimeConf) {
	let path = results_path(net_name, rt);
	if let Err(err) = fs::remove_file(&path) {
		debug!(
			"could not remove cached result at {}: {}",
			path.display(),
			err
		);
	}
}

#[cfg(test)]
mod tests {
	use std::os::unix::fs::PermissionsExt;

	use tempfile::TempDir;

	use super::*;

	fn rt(dir: &TempDir) -> RuntimeConf {
		RuntimeConf {
			container_id: "c1".into(),
			if_name: "eth0".into(),
			cache_dir: Some(dir.path().to_path_buf()),
			..RuntimeConf::default()
		}
	}

	fn result(json: &str) -> CniResult {
		let version = version::parse_version(json.as_bytes()).unwrap();
		version::new_result(&version, json.as_bytes()).unwrap()
	}

	#[test]
	fn set_then_get_round_trips() {
		let dir = TempDir::new().unwrap();
		let rt = rt(&dir);
		let stored = result(r#"{"cniVersion": "0.4.0", "ips": [{"address": "10.0.0.2/24"}]}"#);

		set(&stored, "net1", &rt).unwrap();
		let read = get("net1", &Version::new(0, 4, 0), &rt).unwrap().unwrap();
		assert_eq!(read, stored);

		let path = dir.path().join("results").join("net1-c1-eth0");
		assert!(path.is_file());
		assert_eq!(
			fs::metadata(&path).unwrap().permissions().mode() & 0o777,
			0o600
		);
		assert_eq!(
			fs::metadata(path.parent().unwrap())
				.unwrap()
				.permissions()
				.mode() & 0o777,
			0o700
		);
	}

	#[test]
	fn set_overwrites_the_previous_entry() {
		let dir = TempDir::new().unwrap();
		let rt = rt(&dir);

		let first = result(r#"{"cniVersion": "0.4.0", "ips": [{"address": "10.0.0.2/24"}]}"#);
		let second = result(r#"{"cniVersion": "0.4.0", "ips": [{"address": "10.0.0.9/24"}]}"#);
		set(&first, "net1", &rt).unwrap();
		set(&second, "net1", &rt).unwrap();

		let read = get("net1", &Version::new(0, 4, 0), &rt).unwrap().unwrap();
		assert_eq!(read, second);
	}

	#[test]
	fn get_converts_to_the_requested_version() {
		let dir = TempDir::new().unwrap();
		let rt = rt(&dir);
		let stored =
			result(r#"{"cniVersion": "0.4.0", "ips": [{"version": "4", "address": "10.0.0.2/24"}]}"#);
		set(&stored, "net1", &rt).unwrap();

		let read = get("net1", &Version::new(1, 0, 0), &rt).unwrap().unwrap();
		assert_eq!(read.cni_version(), &Version::new(1, 0, 0));
	}

	#[test]
	fn missing_entry_reads_as_none() {
		let dir = TempDir::new().unwrap();
		assert!(get("net1", &Version::new(0, 4, 0), &rt(&dir))
			.unwrap()
			.is_none());
	}

	#[test]
	fn corrupt_entry_is_an_error() {
		let dir = TempDir::new().unwrap();
		let rt = rt(&dir);
		let path = dir.path().join("results");
		fs::create_dir_all(&path).unwrap();
		fs::write(path.join("net1-c1-eth0"), b"not json").unwrap();

		assert!(get("net1", &Version::new(0, 4, 0), &rt).is_err());
	}

	#[test]
	fn delete_tolerates_absence() {
		let dir = TempDir::new().unwrap();
		let rt = rt(&dir);
		delete("net1", &rt);

		let stored = result(r#"{"cniVersion": "0.4.0", "ips": [{"address": "10.0.0.2/24"}]}"#);
		set(&stored, "net1", &rt).unwrap();
		delete("net1", &rt);
		assert!(get("net1", &Version::new(0, 4, 0), &rt).unwrap().is_none());
	}
}
