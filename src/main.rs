use clap::Parser;
use stomp_load_test::cli::{run_compare, run_generate_accounts, run_load_test, Cli};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// The first Ctrl-C cancels the run; later ones are ignored so the
/// drain can finish and the report still gets written.
fn install_signal_handler(cancel: CancellationToken) -> anyhow::Result<()> {
    let fired = Arc::new(AtomicBool::new(false));
    ctrlc::set_handler(move || {
        if !fired.swap(true, Ordering::SeqCst) {
            eprintln!("\nInterrupt received, draining sessions...");
            cancel.cancel();
        }
    })
    .map_err(|e| anyhow::anyhow!("Failed to set signal handler: {}", e))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let result = match cli {
        Cli::GenerateAccounts {
            prefix,
            start,
            count,
            domain,
            password_pattern,
            output,
            append,
        } => run_generate_accounts(&prefix, start, count, &domain, &password_pattern, &output, append),
        Cli::Run {
            config,
            output,
            csv,
            server_url,
            probe_interval_ms,
        } => {
            let cancel = CancellationToken::new();
            match install_signal_handler(cancel.clone()) {
                Ok(()) => run_load_test(
                    &config,
                    output.as_deref(),
                    csv.as_deref(),
                    server_url,
                    probe_interval_ms,
                    cancel,
                )
                .await
                .map(|_| ()),
                Err(e) => Err(e),
            }
        }
        Cli::Compare { current, previous } => run_compare(&current, &previous),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
