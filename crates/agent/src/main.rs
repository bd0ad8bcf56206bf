use anyhow::Context;
use clap::Parser;
use std::sync::Arc;

fn main() -> Result<(), anyhow::Error> {
    // Use reasonable defaults for printing structured logs to stderr.
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(if matches!(std::env::var("NO_COLOR"), Ok(v) if v == "1") {
            false
        } else {
            true
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = agent::config::Args::parse();
    let config = agent::Config::resolve(args)?;
    tracing::info!(?config, "started!");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let task = runtime.spawn(async move { async_main(config).await });
    let result = runtime.block_on(task);

    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result?
}

async fn async_main(config: agent::Config) -> Result<(), anyhow::Error> {
    // Bind early in the application lifecycle, to not fail requests which
    // may dispatch as soon as the process is up.
    let api_listener = tokio::net::TcpListener::bind(format!("[::]:{}", config.api_port))
        .await
        .context("failed to bind server port")?;

    let serve_poller = config.serve_poller;
    let app = Arc::new(agent::App::new(config));
    let prometheus = agent::metrics::install_recorder();

    // Share-able signal which fires when the agent should exit.
    let shutdown = tokio_util::sync::CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("caught signal; draining...");
                shutdown.cancel();
            }
        });
    }

    // Wire up the agent's API server.
    let api_router = agent::api::build_router(app.clone(), prometheus)?;
    let api_server = {
        let shutdown = shutdown.clone();
        axum::serve(api_listener, api_router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
    };
    let api_server = async move { anyhow::Result::Ok(api_server.await?) };

    // Wire up the queue-drain loop.
    let poller_fut = if serve_poller {
        futures::FutureExt::boxed(agent::poller::Poller::new(app.clone()).run(shutdown.clone()))
    } else {
        futures::FutureExt::boxed(futures::future::ready(Ok(())))
    };

    let ((), ()) = tokio::try_join!(api_server, poller_fut)?;
    Ok(())
}
