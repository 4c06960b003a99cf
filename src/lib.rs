#![warn(missing_docs)]

//! Library to drive chains of CNI plugins.
//!
//! Where a plugin library answers one command read from its environment,
//! this is the other side: the piece a container runtime embeds to sequence
//! a whole chain of plugins for ADD, CHECK, and DEL, thread each plugin's
//! result into the next dispatch, and cache the final result so later
//! operations replay the exact same context. Plugins run as local
//! executables or behind a remote gRPC dispatch service; the driver does not
//! care which.
//!
//! # Quick start
//!
//! ```no_run
//! use cni_driver::{
//! 	config::{NetworkConfigList, RuntimeConf},
//! 	install_logger, CniConfig,
//! };
//!
//! # async fn demo() -> Result<(), cni_driver::error::CniError> {
//! install_logger("cni-driver");
//!
//! let list = NetworkConfigList::from_bytes(std::fs::read("/etc/cni/net.d/10-net.conflist")?)?;
//! let rt = RuntimeConf {
//! 	container_id: "c1".into(),
//! 	net_ns: "/var/run/netns/c1".into(),
//! 	if_name: "eth0".into(),
//! 	..RuntimeConf::default()
//! };
//!
//! let driver = CniConfig::new(vec!["/opt/cni/bin".into()]);
//! let result = driver.add_list(&list, &rt).await?;
//! println!("{}", String::from_utf8_lossy(&result.to_bytes()?));
//! driver.del_list(&list, &rt).await?;
//! # Ok(())
//! # }
//! ```

pub use command::Command;
pub use driver::{CniConfig, Transport};
pub use logger::install_logger;

pub mod cache;
pub mod config;
pub mod error;
pub mod grpc;
pub mod result;
pub mod version;

mod command;
mod driver;
mod exec;
mod logger;
