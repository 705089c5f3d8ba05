use proc_watchdog::cli::{Cli, WatchdogSetup};
use proc_watchdog::logging::session::SessionLog;
use proc_watchdog::supervisor::{ShutdownHandle, Supervisor};
use std::error::Error;
use std::process::exit;
use tracing::{error, info, Level};

fn main() {
    let setup = Cli::init().resolve().unwrap_or_else(|cli_error| {
        eprintln!("Error: {}", cli_error);
        exit(1);
    });

    if let Err(err) = setup.logging.try_init() {
        eprintln!("Error: {}", err);
        exit(1);
    }

    if let Err(e) = _main(setup) {
        error!("The watchdog exited with an error: {}", e);
        exit(1);
    }
}

// Errors are propagated up to here and logged once in string format by `main`.
fn _main(setup: WatchdogSetup) -> Result<(), Box<dyn Error>> {
    // Held until the end so every pending session log line reaches the file.
    let (session_log, _session_guard) = SessionLog::create(setup.logging.dir())?;
    info!(path = %session_log.path().display(), "Session log created");
    let camera_only = format!("Camera-only mode: {}", setup.camera_only);
    info!("{}", camera_only);
    session_log.record(Level::INFO, camera_only);

    let supervisor = Supervisor::new(setup.supervisor, session_log)?;

    create_shutdown_signal_handler(supervisor.shutdown_handle())?;

    let outcome = supervisor.run().into_result()?;
    info!(restarts = outcome.restarts, "exiting gracefully");
    Ok(())
}

pub fn create_shutdown_signal_handler(shutdown: ShutdownHandle) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        info!("Received termination signal. Stopping watchdog");
        shutdown.request_shutdown();
    })
    .map_err(|e| {
        error!("Could not set signal handler: {}", e);
        e
    })?;

    Ok(())
}
