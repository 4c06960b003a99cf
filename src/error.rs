//! Error type for driver operations.

use semver::Version;
use thiserror::Error;

/// Every way a chain operation can fail.
///
/// The driver performs no local recovery: any error aborts the current chain
/// and is returned to the caller, which is responsible for unwinding a
/// partial ADD with a DEL. The only silent recoveries live elsewhere (a
/// missing cache file reads as no previous result, and a failed cache delete
/// after a successful DEL is ignored).
#[derive(Debug, Error)]
pub enum CniError {
	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),

	#[error("unsupported CNI version: {0}")]
	UnsupportedVersion(Version),

	#[error("cannot convert result from version {from} to {to}")]
	UnsupportedConversion {
		from: Version,
		to: Version,
	},

	#[error("configuration version {0} does not support the CHECK command")]
	CheckUnsupported(Version),

	#[error("missing field in network configuration: {0}")]
	MissingField(&'static str),

	#[error("missing plugin {name}: {err}")]
	MissingPlugin {
		name: String,
		#[source]
		err: which::Error,
	},

	/// A plugin exited non-zero with a well-formed error document.
	///
	/// Code, message, and details are the plugin's own, verbatim. Codes 1-99
	/// are reserved by the spec; 100+ are plugin-specific.
	#[error("plugin error: code={code} msg={msg:?} details={details:?}")]
	Plugin {
		code: i32,
		msg: String,
		details: String,
	},

	#[error("plugin produced no output")]
	MissingOutput,

	#[error("plugin {plugin} timed out after {seconds}s")]
	Timeout {
		plugin: String,
		seconds: u64,
	},

	#[error("failed to cache result for network {name:?}: {err}")]
	Cache {
		name: String,
		#[source]
		err: std::io::Error,
	},

	#[error("gRPC call failed: {0}")]
	Grpc(#[from] tonic::Status),

	#[error("gRPC transport failure: {0}")]
	GrpcTransport(#[from] tonic::transport::Error),

	#[error("container ID must be lowercase alphanumerics plus `_.-`, got {0:?}")]
	InvalidContainerId(String),

	#[error("invalid plugin configuration: [{}]", join_errors(.0))]
	Validation(Vec<CniError>),

	#[error("{0}")]
	Generic(String),
}

fn join_errors(errs: &[CniError]) -> String {
	errs.iter()
		.map(|e| e.to_string())
		.collect::<Vec<String>>()
		.join("; ")
}
