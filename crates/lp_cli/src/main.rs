//! `leakpatrol-start`: enable watching in an instrumented process.
//!
//! The instrumented process creates the shared watch-switch file at startup
//! (`ALLOC_COMM_FILE`, `/tmp/alloc-comm` by default) with watching off; this
//! command writes the `Watching` word into it at a moment of the operator's
//! choosing, typically after application warm-up.

use std::path::PathBuf;

use anyhow::Context as _;

use lp_core::{Environment, WatchState, WatchSwitch};

#[derive(argh::FromArgs)]
/// Enable leak watching in a process instrumented with the leakpatrol shim.
struct Args {
    /// path of the shared watch-switch file (default: $ALLOC_COMM_FILE or
    /// /tmp/alloc-comm)
    #[argh(option)]
    comm_file: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();
    let comm_file = args
        .comm_file
        .map(PathBuf::from)
        .unwrap_or_else(|| Environment::from_env().comm_file_path);

    let switch = WatchSwitch::open_existing(&comm_file)
        .with_context(|| format!("is an instrumented process running with {comm_file:?}?"))?;
    switch.set(WatchState::Watching);

    println!("watching enabled via {}", comm_file.display());
    Ok(())
}
