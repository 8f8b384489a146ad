use clap::Parser;
use fabstream::config::{BusBackend, CliArgs, Settings};
use fabstream::http::{self, AppState, Shutdown};
use fabstream::logging::init_tracing;
use fabstream::{DispatcherConfig, HistoricalQueryEngine, InfluxClient, LiveCacheDispatcher, MemoryBus};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    init_tracing();

    // Initialize settings
    let settings = Settings::new(CliArgs::parse())?;
    tracing::info!(?settings, "loaded configuration");

    // Message bus
    let dispatcher_config = DispatcherConfig::from(&settings);
    let (dispatcher, bus) = match settings.bus.backend {
        BusBackend::Memory => {
            let bus = MemoryBus::new();
            let dispatcher = LiveCacheDispatcher::new(bus.source_factory(), dispatcher_config);
            (dispatcher, Some(bus))
        }
        #[cfg(feature = "kafka")]
        BusBackend::Kafka => {
            let factory = fabstream::source::KafkaSource::factory(settings.bus.clone());
            (LiveCacheDispatcher::new(factory, dispatcher_config), None)
        }
        #[cfg(not(feature = "kafka"))]
        BusBackend::Kafka => {
            return Err("bus.backend = \"kafka\" requires building with the `kafka` feature".into());
        }
    };
    let dispatcher = Arc::new(dispatcher);

    if settings.stream.autostart {
        let outcome = dispatcher.start().await?;
        tracing::info!(status = outcome.message(), "dispatcher autostart");
    }

    // Time-series store
    let store = InfluxClient::new(&settings.store)?;
    let history = HistoricalQueryEngine::new(
        Arc::new(store),
        settings.store.bucket.clone(),
        settings.history.timezone()?,
    );

    let state = AppState {
        dispatcher: Arc::clone(&dispatcher),
        history,
        chunk: settings.history.chunk_duration(),
        allow_raw_query: settings.history.allow_raw_query,
        bus,
        shutdown: Shutdown::new(),
    };

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    http::serve(listener, state, shutdown_signal()).await?;

    // no-op unless serve returned without the signal
    dispatcher.stop().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
