//! Main edge host executable entry point.
//!
//! # Architecture
//!
//! The executable runs the edge host of one producer:
//!
//!     - Initialise the session, logging and parameters
//!     - Bind the inbound socket
//!     - Main loop:
//!         - Drain the inbox into the host
//!         - Advance the timers of every component to the session time
//!         - Flush the outbox to the transport
//!         - Close the sockets released by stopped controllers
//!
//! Controllers are instantiated inside the host by its coordinator.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

// External
use color_eyre::{eyre::WrapErr, Report};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use structopt::StructOpt;

// Internal
use comms_if::net::{zmq, Inbox, Outbox};
use platoon_lib::host::{EdgeHost, HostParams};
use util::{
    host,
    logger::{logger_init, logger_init_with, LevelFilter},
    session::{self, Session},
};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Parameter file loaded from `$PLATOON_SW_ROOT/params` when none is given
const DEFAULT_PARAMS_FILE: &str = "edge_host.toml";

/// Maximum number of envelopes taken from the inbox in one cycle
const MAX_RECV_PER_CYCLE: usize = 1000;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, StructOpt)]
#[structopt(name = "platoon_exec", about = "Platoon coordination edge host")]
struct Opt {
    /// Parameter file of the host, defaults to `edge_host.toml` in the software root
    #[structopt(long, parse(from_os_str))]
    params: Option<PathBuf>,

    /// Increase the log level (`-v` debug, `-vv` trace, `-vvv` trace including control laws)
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Executable main function, entry point.
fn main() -> Result<(), Report> {
    color_eyre::install()?;

    let opt = Opt::from_args();

    // ---- EARLY INITIALISATION ----

    // Initialise session
    let session =
        Session::new("platoon_exec", "sessions").wrap_err("Failed to create the session")?;

    // Initialise logger, control law traces are only wanted at the highest verbosity
    match opt.verbose {
        0 => logger_init(LevelFilter::Info, &session),
        1 => logger_init(LevelFilter::Debug, &session),
        2 => logger_init_with(
            LevelFilter::Trace,
            &[("platoon_lib::control_law", LevelFilter::Debug)],
            &session,
        ),
        _ => logger_init(LevelFilter::Trace, &session),
    }
    .wrap_err("Failed to initialise logging")?;

    // Log information on this execution.
    info!("Platoon Edge Host Executable\n");
    info!("Running on: {}", host::get_hostname());
    info!("Session directory: {:?}\n", session.session_root);

    // ---- LOAD PARAMETERS ----

    let params: HostParams = match opt.params {
        Some(ref path) => util::params::load_path(path)
            .wrap_err_with(|| format!("Could not load host params from {:?}", path))?,
        None => util::params::load(DEFAULT_PARAMS_FILE).wrap_err("Could not load host params")?,
    };

    info!("Exec parameters loaded");

    // ---- INITIALISE NETWORK ----

    let zmq_ctx = zmq::Context::new();

    let inbox = Inbox::new(&zmq_ctx, &params.net).wrap_err("Failed to bind the inbox")?;
    let mut outbox = Outbox::new(&zmq_ctx, &params.net);

    info!("Inbox bound to {}", params.net.bind_endpoint);

    // ---- INITIALISE HOST ----

    let cycle_period = Duration::from_secs_f64(params.cycle_period_s);
    let mut edge_host = EdgeHost::new(params);

    info!("Initialisation complete, begining main loop\n");

    // ---- MAIN LOOP ----

    loop {
        let cycle_start_instant = Instant::now();

        // ---- INBOX ----

        for _ in 0..MAX_RECV_PER_CYCLE {
            match inbox.recv() {
                Ok(Some(envelope)) => {
                    debug!(
                        "Received {} from {} for {}",
                        envelope.msg.name(),
                        envelope.from,
                        envelope.to
                    );
                    if let Err(e) = edge_host.handle(envelope) {
                        warn!("Dropped inbound envelope: {}", e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Error receiving from the inbox: {}", e);
                    break;
                }
            }
        }

        // ---- TIMERS ----

        edge_host.advance(session::get_elapsed_seconds());

        // ---- OUTBOX ----

        for envelope in edge_host.drain_outbox() {
            if let Err(e) = outbox.send(&envelope) {
                warn!("Could not send {} to {}: {}", envelope.msg.name(), envelope.to, e);

                // Drop the socket so the next send reconnects
                outbox.disconnect(&envelope.to.socket_addr());
            }
        }

        for socket_addr in edge_host.drain_released_sockets() {
            outbox.disconnect(&socket_addr);
        }

        // ---- CYCLE MANAGEMENT ----

        let cycle_dur = Instant::now() - cycle_start_instant;

        // Get sleep duration
        match cycle_period.checked_sub(cycle_dur) {
            Some(d) => thread::sleep(d),
            None => warn!(
                "Cycle overran by {:.06} s",
                cycle_dur.as_secs_f64() - cycle_period.as_secs_f64()
            ),
        }
    }
}
