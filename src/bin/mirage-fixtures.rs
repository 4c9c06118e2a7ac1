//! Seeds the fixture trees the interception rules redirect into. Run once
//! before starting a supervised or preloaded target.

use std::process::exit;

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = mirage::fixtures::seed() {
        eprintln!("mirage-fixtures: {err:#}");
        exit(1);
    }
    println!("fixtures seeded under /tmp");
}
