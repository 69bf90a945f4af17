use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};

use webserv::config_parser::load_config;
use webserv::log::{LogSink, Logger};
use webserv::poller::EpollPoller;
use webserv::server::Server;
use webserv::sys::{OsFileSystemOps, OsProcessOps, OsSocketOps};

/// Number of termination signals received so far.
static SIGNALS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn count_signal(_signal: libc::c_int) {
    SIGNALS.fetch_add(1, Ordering::Relaxed);
}

fn usage(argv0: &str) {
    eprintln!("usage:\t{} <config file>", argv0);
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        usage(args.first().map_or(env!("CARGO_PKG_NAME"), String::as_str));
        std::process::exit(1);
    }
    let config_path = &args[1];

    let config = load_config(Path::new(config_path))
        .with_context(|| format!("failed to load config file {}", config_path))?;
    let sink = LogSink::open(&config.error_log)
        .with_context(|| format!("failed to open error log {}", config.error_log))?;
    let mut logger = Logger::new(sink, config.log_level);
    logger.info(format_args!(
        "{}/{} starting with {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        config_path
    ));

    // set signal handlers
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(count_signal)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(count_signal)) }
        .context("failed to set SIGTERM handler")?;
    unsafe { signal(Signal::SIGQUIT, SigHandler::Handler(count_signal)) }
        .context("failed to set SIGQUIT handler")?;

    let poller = EpollPoller::new().context("failed to create epoll instance")?;
    let mut server = Server::new(
        config,
        logger,
        poller,
        OsSocketOps,
        OsFileSystemOps,
        OsProcessOps,
    );
    server
        .init_virtual_servers()
        .context("failed to set up virtual servers")?;
    server.run(&SIGNALS).context("event loop failed")?;
    Ok(())
}
