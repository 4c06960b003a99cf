use std::{
	fs::OpenOptions,
	path::{Path, PathBuf},
};

/// Installs the driver's logger: warnings to stderr always, plus a full
/// debug log to `<logname>.log` in debug builds.
///
/// The debug log lands in `$CNI_DRIVER_LOG_DIR` when set, else the current
/// directory. Plugins never inherit the variable; the dispatch environment
/// is scrubbed of everything `CNI_`-prefixed.
pub fn install_logger(logname: impl AsRef<Path>) {
	use simplelog::*;

	let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
		LevelFilter::Warn,
		Default::default(),
		TerminalMode::Stderr,
		ColorChoice::Never,
	)];

	if cfg!(debug_assertions) {
		let logdir = std::env::var_os("CNI_DRIVER_LOG_DIR")
			.map(PathBuf::from)
			.or_else(|| std::env::current_dir().ok())
			.unwrap_or_else(|| PathBuf::from("/var/log/cni"));

		let mut logfile = logdir.join(logname);
		logfile.set_extension("log");

		if let Some(dir) = logfile.parent() {
			std::fs::create_dir_all(dir).unwrap();
		}

		loggers.push(WriteLogger::new(
			LevelFilter::Debug,
			Default::default(),
			OpenOptions::new()
				.append(true)
				.create(true)
				.open(logfile)
				.unwrap(),
		));
	}

	CombinedLogger::init(loggers).unwrap();
}
