mod poller;
mod problem;
mod queue;
mod registry;
mod router;
mod telemetry;
mod trigger;
mod webhook;

#[cfg(test)]
mod test_support;

use std::{net::SocketAddr, sync::Arc};

use regex::Regex;
use sns_trigger_aws::{ReqwestHttpApi, SignatureVerifier};
use sns_trigger_storage::Database;
use sns_trigger_util::{load_env_file, AppConfig};
use tracing::{error, info, warn};

use crate::poller::PollWorker;
use crate::queue::DatabaseBuildQueuer;
use crate::registry::TriggerRegistry;
use crate::trigger::TriggerService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let registry = match &config.triggers_file {
        Some(path) => TriggerRegistry::from_file(path)?,
        None => {
            warn!(stage = "app", "SNS_TRIGGERS_FILE is not set; no triggers are served");
            TriggerRegistry::default()
        }
    };

    let http = Arc::new(ReqwestHttpApi::new(config.http_timeout)?);
    let cert_host = config
        .cert_host_pattern
        .as_deref()
        .map(Regex::new)
        .transpose()?;
    let verifier = Arc::new(SignatureVerifier::new(
        http.clone(),
        cert_host,
        config.cert_cache_capacity,
    ));

    let queuer = Arc::new(DatabaseBuildQueuer::new(&database));
    let service = TriggerService::new(database, queuer, config.flush_max_retries);

    for entry in registry.entries().filter(|entry| entry.enabled()) {
        if let Err(err) = service.activate(entry).await {
            error!(
                stage = "trigger",
                trigger = %entry.descriptor().name(),
                error = %err,
                "trigger activation failed"
            );
        }
    }
    info!(stage = "app", triggers = registry.len(), "trigger registry loaded");

    PollWorker::new(registry.clone(), service.clone(), config.poll_interval).spawn();

    let state = router::AppState::new(metrics, registry, service, verifier, http);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
