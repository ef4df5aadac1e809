use anyhow::{Context, Result, bail};
use appliance_harness::CancellationToken;
use certify::report::{summary_line, summary_table};
use certify::{RunOptions, Suite, run_suite};
use std::path::Path;
use tracing::{info, warn};

pub async fn run(suite_path: &Path, fail_fast: bool) -> Result<()> {
    let suite = Suite::from_file(suite_path)?;
    let context = suite
        .harness
        .resolved_context()
        .context("Failed to resolve context parameters")?;
    let manager = suite
        .harness
        .build_manager()
        .context("Failed to set up the VM manager")?;

    let cancel = CancellationToken::new();
    install_signal_handlers(cancel.clone())?;

    let report = run_suite(&manager, &suite, context, RunOptions { fail_fast }, &cancel).await;

    // Anything still registered could not be destroyed during the run
    match manager.release_all().await {
        Ok(0) => {}
        Ok(n) => info!("Destroyed {} leftover instances", n),
        Err(e) => warn!("Leftover instances may still be running: {}", e),
    }

    println!("{}", summary_table(&report));
    println!("{}", summary_line(&report));

    if cancel.is_cancelled() {
        bail!("run interrupted");
    }
    if !report.passed() {
        bail!("suite '{}' failed", report.suite);
    }
    Ok(())
}

/// Cancel the run on the first SIGINT / SIGTERM, exit on the second
fn install_signal_handlers(cancel: CancellationToken) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("Failed to register signal handler")?;

    std::thread::spawn(move || {
        for sig in signals.forever() {
            if cancel.is_cancelled() {
                eprintln!("Received signal {} again, exiting without cleanup", sig);
                std::process::exit(130);
            }
            eprintln!("Received signal {}, cancelling and releasing the instance", sig);
            cancel.cancel();
        }
    });

    Ok(())
}
