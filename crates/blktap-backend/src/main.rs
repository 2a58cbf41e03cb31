//! tapback daemon entry point

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use blktap_backend::{Backend, SystemTapClient, XsSocketStore};

#[derive(Parser, Debug)]
#[command(name = "tapback", about = "XenBus backend for tapdisk VBDs")]
struct Args {
    /// Backend name to serve under backend/<name>
    #[arg(short, long, default_value = "vbd")]
    name: String,

    /// Stay in the foreground and log to stderr
    #[arg(short = 'D', long)]
    debug: bool,

    /// Log filter, e.g. "info" or "blktap_backend=debug"
    #[arg(short, long, default_value = "info")]
    log: String,
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signo: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter = if args.debug && args.log == "info" {
        "debug".to_string()
    } else {
        args.log.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).context("bad log filter")?)
        .with_writer(std::io::stderr)
        .init();

    install_signal_handlers();

    let store = Arc::new(
        XsSocketStore::connect_system().context("connecting to xenstored")?,
    );
    let tap = Box::new(SystemTapClient::system());
    let mut backend =
        Backend::new(&args.name, store, tap).context("registering backend watch")?;

    // Mirror the process-global signal flag into the backend's stop flag
    let stop = backend.stop_flag();
    std::thread::spawn(move || loop {
        if STOP.load(Ordering::SeqCst) {
            stop.store(true, Ordering::SeqCst);
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    });

    info!(name = %backend.name(), "tapback starting");
    backend.run().context("backend event loop")?;
    Ok(())
}
