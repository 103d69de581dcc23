//! Haflow daemon
//!
//! Assembles the full ingestion path: connection supervisor, registry
//! discovery, event pipeline, batch writer, webhook dispatcher, aggregation
//! scheduler, and the read-side HTTP API. Components communicate over
//! bounded channels and share nothing except the catalog store and the
//! broadcast tee of the event stream.

use anyhow::Context;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use haflow_aggregator::AggregationScheduler;
use haflow_batch_writer::{BatchWriter, EnrichmentCache, EnrichmentProvider};
use haflow_catalog::{CatalogReplica, CatalogStore, RegistryDiscoverer};
use haflow_common::{HttpTimeSeriesStore, StatusRegistry, TimeSeriesStore};
use haflow_config::Config;
use haflow_connection::ConnectionManager;
use haflow_daemon::{api, supervisor};
use haflow_event_ingestor::{EventIngestor, EventPipeline};
use haflow_webhook_dispatcher::WebhookDispatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    haflow_common::init_tracing();

    info!("starting haflow");
    let config = Config::load().context("failed to load configuration")?;
    info!(
        endpoints = config.ha.endpoints.len(),
        pipeline_capacity = config.pipeline.capacity,
        timeseries = %config.timeseries.url,
        "configuration loaded"
    );

    // Stores
    let catalog = CatalogStore::connect(
        &config.catalog.database_url,
        config.catalog.max_connections,
    )
    .await
    .context("failed to open catalog store")?;

    let store: Arc<dyn TimeSeriesStore> = Arc::new(
        HttpTimeSeriesStore::new(
            &config.timeseries.url,
            config.timeseries.token.clone(),
            config.timeseries.request_timeout,
        )
        .context("failed to build time-series client")?,
    );

    let status = StatusRegistry::new();
    status.set_healthy("connection");
    status.set_healthy("catalog");
    status.set_healthy("batch-writer");
    status.set_healthy("webhooks");
    status.set_healthy("aggregator");

    // Coordinated shutdown for every component task
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let cancel = CancellationToken::new();

    // Pipeline: ingestor -> writer, with the broadcast tee for webhooks
    let (pipeline, pipeline_rx) = EventPipeline::new(config.pipeline.capacity);

    // Enrichment providers are registered here as external adapters are
    // wired in; the cache and refresh machinery run regardless
    let enrichment = EnrichmentCache::new();
    let providers: Vec<Arc<dyn EnrichmentProvider>> = Vec::new();
    let enrichment_config = config.enrichment.clone();
    let _refreshers = enrichment.spawn_refreshers(
        providers,
        move |source| enrichment_config.ttl_for(source),
        cancel.clone(),
    );

    // Batch writer (raw bucket)
    let writer = BatchWriter::new(
        config.writer.clone(),
        config.timeseries.raw_bucket.clone(),
        Arc::clone(&store),
        pipeline.backpressure_flag(),
        Arc::clone(&enrichment),
    )
    .context("failed to build batch writer")?;
    let mut writer_handle = tokio::spawn(writer.run(pipeline_rx, shutdown_tx.subscribe()));

    // Webhook dispatcher
    let dispatcher = WebhookDispatcher::new(catalog.clone(), config.webhook.clone())
        .context("failed to build webhook dispatcher")?;
    let dispatcher_handle = tokio::spawn(dispatcher.run(pipeline.subscribe(), shutdown_tx.subscribe()));

    // Aggregation scheduler
    let scheduler = AggregationScheduler::new(
        catalog.clone(),
        Arc::clone(&store),
        config.schedule.clone(),
        &config.timeseries,
        &config.catalog,
        Arc::clone(&enrichment),
    );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    // Connection supervisor: session + discovery + ingestion
    let manager = ConnectionManager::new(config.ha.clone(), config.breaker);
    let replica = CatalogReplica::new();
    let discoverer = Arc::new(RegistryDiscoverer::new(catalog.clone(), Arc::clone(&replica)));
    let ingestor = Arc::new(EventIngestor::new(pipeline.clone(), replica));
    let supervisor_handle = tokio::spawn(supervisor::run(
        Arc::clone(&manager),
        discoverer,
        ingestor,
        status.clone(),
        shutdown_tx.subscribe(),
    ));

    // Read-side API
    let api_state = api::ApiState {
        catalog,
        status: status.clone(),
        manager,
    };
    let api_host = config.api.host.clone();
    let api_port = config.api.port;
    tokio::spawn(async move {
        if let Err(e) = api::serve(api_state, &api_host, api_port).await {
            warn!(error = %e, "read-side API stopped");
        }
    });

    info!("haflow is ready");

    // The writer exiting on its own means a fatal condition (spool
    // corruption); anything else waits for the shutdown signal
    let mut fatal: Option<anyhow::Error> = None;
    let mut writer_done = false;
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
        result = &mut writer_handle => {
            writer_done = true;
            match result {
                Ok(Err(e)) => {
                    error!(error = %e, "batch writer failed fatally");
                    status.set_failed("batch-writer", e.to_string());
                    fatal = Some(e);
                }
                Ok(Ok(())) => warn!("batch writer exited unexpectedly"),
                Err(e) => {
                    error!(error = %e, "batch writer panicked");
                    fatal = Some(e.into());
                }
            }
        }
    }

    // Broadcast shutdown; components finish their current atomic unit and
    // drain within the configured grace period
    let _ = shutdown_tx.send(());
    cancel.cancel();

    let drain = config.writer.drain_timeout;
    if !writer_done {
        match tokio::time::timeout(drain, &mut writer_handle).await {
            Ok(Ok(Err(e))) => {
                error!(error = %e, "batch writer failed during drain");
                fatal.get_or_insert(e);
            }
            Ok(Ok(Ok(()))) => {}
            Ok(Err(e)) => error!(error = %e, "batch writer join failed"),
            Err(_) => warn!("batch writer did not drain within the grace period"),
        }
    }
    let _ = tokio::time::timeout(drain, async {
        let _ = dispatcher_handle.await;
        let _ = scheduler_handle.await;
        let _ = supervisor_handle.await;
    })
    .await;

    match fatal {
        Some(e) => {
            error!(error = %e, "haflow exiting after fatal error");
            Err(e)
        }
        None => {
            info!("haflow stopped");
            Ok(())
        }
    }
}
