use mirage::{Policy, Supervisor};
use std::env;
use std::process::{exit, Command};
use tracing::error;
use tracing_subscriber::EnvFilter;

fn usage(program: &str) -> ! {
    eprintln!("Usage: {program} [-v] <program> [args...]");
    exit(1);
}

fn main() {
    let mut args = env::args();
    let self_name = args.next().unwrap_or_else(|| "mirage".into());
    let mut rest: Vec<String> = args.collect();

    let mut verbose = false;
    if rest.first().map(String::as_str) == Some("-v") {
        verbose = true;
        rest.remove(0);
    }
    if rest.is_empty() {
        usage(&self_name);
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" })),
        )
        .init();

    let mut cmd = Command::new(&rest[0]);
    cmd.args(&rest[1..]);

    let mut supervisor = match Supervisor::spawn(cmd, Policy::supervisor_default()) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            error!("failed to start target: {err:#}");
            exit(spawn_exit_code(&err));
        }
    };

    let stop = supervisor.stop_flag();
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(err) = signal_hook::flag::register(sig, stop.clone()) {
            error!("failed to install signal handler: {err}");
        }
    }

    match supervisor.run() {
        Ok(status) => exit(status),
        Err(err) => {
            error!("trace failed: {err:#}");
            exit(2);
        }
    }
}

/// Fork/exec problems surface as I/O errors in the chain; anything else is
/// the debugger refusing the attach.
fn spawn_exit_code(err: &anyhow::Error) -> i32 {
    if err
        .chain()
        .any(|cause| cause.downcast_ref::<std::io::Error>().is_some())
    {
        1
    } else {
        2
    }
}
