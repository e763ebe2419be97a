use mirrorcache::cache::BatchProgress;
use mirrorcache::{AppState, Config};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const USAGE: &str = "usage: mirrorcache <probe | ranking | preload URL... | refresh URL... | stats | clear>";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let Some(command) = args.next() else {
        error!("{}", USAGE);
        std::process::exit(2);
    };
    let urls: Vec<String> = args.collect();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let state = match AppState::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    // Ctrl-C cancels in-flight batch work; already-dispatched fetches finish
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let log_progress = |p: BatchProgress| info!("[{}/{}] {}", p.completed, p.total, p.url);

    match command.as_str() {
        "probe" => {
            state.selector.force_retest().await;
            log_ranking(&state);
        }
        "ranking" => {
            state.selector.initialize().await;
            log_ranking(&state);
        }
        "preload" | "refresh" if urls.is_empty() => {
            error!("{} needs at least one URL", command);
            std::process::exit(2);
        }
        "preload" => {
            state.selector.initialize().await;
            let summary = state.cache.preload_many(&urls, log_progress, &cancel).await;
            if summary.failed > 0 {
                std::process::exit(1);
            }
        }
        "refresh" => {
            state.selector.initialize().await;
            let summary = state.cache.refresh_stale(&urls, log_progress, &cancel).await;
            if summary.failed > 0 {
                std::process::exit(1);
            }
        }
        "stats" => {
            let stats = state.cache.get_cache_stats().await;
            info!(
                "{} entries, {} bytes in {}",
                stats.entry_count,
                stats.total_bytes,
                state.config.cache_dir.display()
            );
        }
        "clear" => {
            let report = state.cache.clear_cache().await;
            if report.failed > 0 {
                error!("{} cache files could not be removed", report.failed);
                std::process::exit(1);
            }
        }
        other => {
            error!("Unknown command '{}'. {}", other, USAGE);
            std::process::exit(2);
        }
    }
}

fn log_ranking(state: &AppState) {
    for (rank, result) in state.selector.probe_results().iter().enumerate() {
        if result.reachable {
            info!(
                "#{} {} {:?} {:.0} KB/s",
                rank + 1,
                result.endpoint,
                result.latency(),
                result.throughput_kbps
            );
        } else {
            info!("#{} {} unreachable", rank + 1, result.endpoint);
        }
    }
}
