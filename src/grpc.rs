//! Remote-gRPC realization of the plugin dispatch contract.
//!
//! The same four inputs travel as for local exec, encapsulated in a unary
//! request per command: the derived configuration document, the container
//! id, the namespace reference, the interface name, the encoded `CNI_ARGS`
//! string, and the capability-filtered runtime data as JSON. ADD answers
//! with the plugin's stdout; CHECK and DEL answer with an error string or
//! nothing.
//!
//! The server half of the service is here too: it resolves the plugin named
//! by the configuration's `type` and runs it locally, which lets a runtime
//! on a restricted host delegate chain execution to a peer that has the
//! plugin binaries.

use std::{
	net::SocketAddr,
	path::{Path, PathBuf},
	time::Duration,
};

use log::{debug, info};
use serde_json::Value;
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{
	transport::{Channel, Endpoint, Server, Uri},
	Request, Response, Status,
};
use tower::service_fn;

use crate::{
	command::Command,
	config::{NetworkConfig, RuntimeConf},
	error::CniError,
	exec,
};

pub(crate) mod proto {
	tonic::include_proto!("cniserver");
}

use proto::cni_server_client::CniServerClient;
use proto::cni_server_server::{CniServer, CniServerServer};

/// Socket the server binds when nothing else is asked for.
pub const DEFAULT_SOCKET_PATH: &str = "/run/cni/grpc.sock";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client end of the dispatch service.
///
/// Holds one channel for the life of the driver; unary calls multiplex over
/// it. An errored RPC is surfaced as-is and never retried here.
#[derive(Clone, Debug)]
pub struct GrpcClient {
	client: CniServerClient<Channel>,
}

impl GrpcClient {
	/// Connects over TCP, e.g. `http://127.0.0.1:7777`.
	pub async fn connect_tcp(endpoint: impl Into<String>) -> Result<Self, CniError> {
		let endpoint = endpoint.into();
		info!("connecting to CNI gRPC server at {}", endpoint);

		let channel = Endpoint::from_shared(endpoint)
			.map_err(CniError::GrpcTransport)?
			.connect_timeout(CONNECT_TIMEOUT)
			.timeout(REQUEST_TIMEOUT)
			.connect()
			.await?;

		Ok(Self {
			client: CniServerClient::new(channel),
		})
	}

	/// Connects over a unix-domain socket.
	pub async fn connect_unix(socket: impl AsRef<Path>) -> Result<Self, CniError> {
		let socket = socket.as_ref().to_path_buf();
		info!("connecting to CNI gRPC server at {}", socket.display());

		// The URI is mandatory but never resolved; the connector below
		// carries the actual address.
		let channel = Endpoint::try_from("http://[::1]:50051")
			.map_err(CniError::GrpcTransport)?
			.connect_timeout(CONNECT_TIMEOUT)
			.timeout(REQUEST_TIMEOUT)
			.connect_with_connector(service_fn(move |_: Uri| {
				UnixStream::connect(socket.clone())
			}))
			.await?;

		Ok(Self {
			client: CniServerClient::new(channel),
		})
	}

	pub(crate) async fn invoke(
		&self,
		command: Command,
		config: &[u8],
		rt: &RuntimeConf,
	) -> Result<Vec<u8>, CniError> {
		let conf = String::from_utf8_lossy(config).into_owned();
		let cap_args = cap_args_json(config)?;
		let mut client = self.client.clone();

		debug!(
			"sending command={} conf bytes={} cap args bytes={}",
			command.as_ref(),
			conf.len(),
			cap_args.len()
		);

		let error = match command {
			Command::Add => {
				let reply = client
					.cni_add(Request::new(proto::CniAddMsg {
						conf,
						container_id: rt.container_id.clone(),
						net_ns: rt.net_ns.clone(),
						if_name: rt.if_name.clone(),
						cni_args: rt.args_string(),
						cap_args,
					}))
					.await?
					.into_inner();

				if reply.error.is_empty() {
					return Ok(reply.std_out.into_bytes());
				}
				reply.error
			}
			Command::Check => {
				let reply = client
					.cni_check(Request::new(proto::CniCheckMsg {
						conf,
						container_id: rt.container_id.clone(),
						net_ns: rt.net_ns.clone(),
						if_name: rt.if_name.clone(),
						cni_args: rt.args_string(),
						cap_args,
					}))
					.await?
					.into_inner();

				if reply.error.is_empty() {
					return Ok(Vec::new());
				}
				reply.error
			}
			Command::Del => {
				let reply = client
					.cni_del(Request::new(proto::CniDelMsg {
						conf,
						container_id: rt.container_id.clone(),
						net_ns: rt.net_ns.clone(),
						if_name: rt.if_name.clone(),
						cni_args: rt.args_string(),
						cap_args,
					}))
					.await?
					.into_inner();

				if reply.error.is_empty() {
					return Ok(Vec::new());
				}
				reply.error
			}
			Command::Version => {
				return Err(CniError::Generic(
					"the gRPC dispatch service has no VERSION call".into(),
				));
			}
		};

		Err(CniError::Generic(error))
	}
}

// The derived document already holds the filtered capability data; lift it
// back out rather than re-filtering.
fn cap_args_json(config: &[u8]) -> Result<String, CniError> {
	let doc: Value = serde_json::from_slice(config)?;
	Ok(doc
		.get("runtimeConfig")
		.map(Value::to_string)
		.unwrap_or_default())
}

/// Server end of the dispatch service: answers each RPC by running the
/// plugin named in the configuration's `type` against the local search path.
#[derive(Clone, Debug)]
pub struct CniGrpcService {
	path: Vec<PathBuf>,
	timeout: Option<Duration>,
}

impl CniGrpcService {
	/// A service resolving plugins against `path`.
	pub fn new(path: Vec<PathBuf>) -> Self {
		Self {
			path,
			timeout: None,
		}
	}

	/// Caps each plugin run at `timeout`.
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	async fn dispatch(
		&self,
		command: Command,
		conf: String,
		container_id: String,
		net_ns: String,
		if_name: String,
		cni_args: String,
	) -> Result<Vec<u8>, CniError> {
		let conf = NetworkConfig::from_bytes(conf.into_bytes())?;
		let rt = RuntimeConf {
			container_id,
			net_ns,
			if_name,
			args: parse_args(&cni_args),
			..RuntimeConf::default()
		};

		let program = exec::find_in_path(&conf.config.plugin, &self.path)?;
		exec::exec_plugin(&program, command, &conf.bytes, &rt, &self.path, self.timeout).await
	}
}

// Inverse of the `k1=v1;k2=v2;` encoding. Values are unescaped by contract,
// so splitting on the separators is exact.
fn parse_args(encoded: &str) -> Vec<(String, String)> {
	encoded
		.split(';')
		.filter(|pair| !pair.is_empty())
		.filter_map(|pair| pair.split_once('='))
		.map(|(key, value)| (key.to_owned(), value.to_owned()))
		.collect()
}

#[tonic::async_trait]
impl CniServer for CniGrpcService {
	async fn cni_add(
		&self,
		request: Request<proto::CniAddMsg>,
	) -> Result<Response<proto::CniAddReply>, Status> {
		let msg = request.into_inner();
		let reply = match self
			.dispatch(
				Command::Add,
				msg.conf,
				msg.container_id,
				msg.net_ns,
				msg.if_name,
				msg.cni_args,
			)
			.await
		{
			Ok(stdout) => proto::CniAddReply {
				std_out: String::from_utf8_lossy(&stdout).into_owned(),
				error: String::new(),
			},
			Err(err) => proto::CniAddReply {
				std_out: String::new(),
				error: err.to_string(),
			},
		};

		Ok(Response::new(reply))
	}

	async fn cni_check(
		&self,
		request: Request<proto::CniCheckMsg>,
	) -> Result<Response<proto::CniCheckReply>, Status> {
		let msg = request.into_inner();
		let reply = match self
			.dispatch(
				Command::Check,
				msg.conf,
				msg.container_id,
				msg.net_ns,
				msg.if_name,
				msg.cni_args,
			)
			.await
		{
			Ok(_) => proto::CniCheckReply {
				error: String::new(),
			},
			Err(err) => proto::CniCheckReply {
				error: err.to_string(),
			},
		};

		Ok(Response::new(reply))
	}

	async fn cni_del(
		&self,
		request: Request<proto::CniDelMsg>,
	) -> Result<Response<proto::CniDelReply>, Status> {
		let msg = request.into_inner();
		let reply = match self
			.dispatch(
				Command::Del,
				msg.conf,
				msg.container_id,
				msg.net_ns,
				msg.if_name,
				msg.cni_args,
			)
			.await
		{
			Ok(_) => proto::CniDelReply {
				error: String::new(),
			},
			Err(err) => proto::CniDelReply {
				error: err.to_string(),
			},
		};

		Ok(Response::new(reply))
	}
}

/// Serves the dispatch service on a unix-domain socket until the task is
/// cancelled or the listener fails.
pub async fn serve_unix(service: CniGrpcService, socket: impl AsRef<Path>) -> Result<(), CniError> {
	let socket = socket.as_ref();
	let _ = std::fs::remove_file(socket);
	let listener = UnixListener::bind(socket)?;

	info!("starting CNI gRPC server on {}", socket.display());
	Server::builder()
		.add_service(CniServerServer::new(service))
		.serve_with_incoming(UnixListenerStream::new(listener))
		.await?;

	Ok(())
}

/// Serves the dispatch service on a TCP address.
pub async fn serve_tcp(service: CniGrpcService, address: SocketAddr) -> Result<(), CniError> {
	info!("starting CNI gRPC server on {}", address);
	Server::builder()
		.add_service(CniServerServer::new(service))
		.serve(address)
		.await?;

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn args_decode_back_to_pairs() {
		assert_eq!(
			parse_args("IgnoreUnknown=1;K8S_POD_NAME=web-0;"),
			vec![
				("IgnoreUnknown".to_owned(), "1".to_owned()),
				("K8S_POD_NAME".to_owned(), "web-0".to_owned()),
			]
		);
		assert!(parse_args("").is_empty());
	}

	#[test]
	fn cap_args_lift_the_runtime_config_out() {
		let config = br#"{"name": "net1", "runtimeConfig": {"portMappings": []}}"#;
		assert_eq!(cap_args_json(config).unwrap(), r#"{"portMappings":[]}"#);

		let bare = br#"{"name": "net1"}"#;
		assert_eq!(cap_args_json(bare).unwrap(), "");
	}
}
