//! Thin host binary: runs a JSON topology description to quiescence.

use std::time::Duration;

use anyhow::{bail, Context};
use millrace::{Runtime, Topology};
use tracing_subscriber::EnvFilter;

fn usage(program: &str, opts: &getopts::Options) -> String {
    opts.usage(&format!("Usage: {program} [options] TOPOLOGY.json"))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(()) => {}
        Err(error) => {
            eprintln!("millrace: {error:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let program = args
        .first()
        .cloned()
        .unwrap_or_else(|| "millrace".to_owned());

    let mut opts = getopts::Options::new();
    opts.optopt(
        "i",
        "idle",
        "idle duration in milliseconds before the topology counts as quiescent",
        "MS",
    );
    opts.optflag("h", "help", "print this help text");

    let matches = match opts.parse(&args[1..]) {
        Ok(matches) => matches,
        Err(error) => bail!("{error}\n{}", usage(&program, &opts)),
    };
    if matches.opt_present("h") {
        println!("{}", usage(&program, &opts));
        return Ok(());
    }
    let path = match matches.free.first() {
        Some(path) => path.clone(),
        None => bail!("{}", usage(&program, &opts)),
    };
    let idle_ms: u64 = matches
        .opt_str("i")
        .map(|s| s.parse())
        .transpose()
        .context("--idle expects milliseconds")?
        .unwrap_or(500);

    let runtime = Runtime::new();
    let topology =
        Topology::from_json(&runtime, &path).context("failed to build the topology")?;
    topology.commit().context("commit failed")?;
    tracing::info!(path = %path, "topology committed; waiting for quiescence");

    topology.wait_inactive(Duration::from_millis(idle_ms), Duration::ZERO);

    topology.disconnect_all();
    if let Err(error) = topology.commit() {
        tracing::error!(%error, "teardown commit failed");
    }
    Ok(())
}
