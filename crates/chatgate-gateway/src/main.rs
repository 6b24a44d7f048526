//! chatgate gateway binary: load configuration, wire the collaborators once,
//! serve the router.

use chatgate_core::evidence::{HttpLocalSearch, LocalSearch, TavilySearch, WebSearch};
use chatgate_core::{
    Coordinator, DataAnalysisProvider, EvidenceRetriever, GatewayConfig, GeneralProvider,
    ProviderSet, ResearchProvider, SledHistoryStore,
};
use chatgate_gateway::{router, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::load()?;
    let coordinator = build_coordinator(config.clone())?;
    let app = router(AppState::new(coordinator));

    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(target: "chatgate::gateway", %addr, version = chatgate_core::version(), "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

fn build_coordinator(config: GatewayConfig) -> Result<Coordinator, Box<dyn std::error::Error>> {
    let retrieval = &config.retrieval;
    let local: Option<Arc<dyn LocalSearch>> = if retrieval.local_endpoint.trim().is_empty() {
        tracing::info!(target: "chatgate::gateway", "local search disabled: no endpoint configured");
        None
    } else {
        Some(Arc::new(HttpLocalSearch::new(retrieval.local_endpoint.clone())?))
    };
    let web: Option<Arc<dyn WebSearch>> = if retrieval.web_enabled {
        if retrieval.web_api_key.trim().is_empty() {
            tracing::warn!(target: "chatgate::gateway", "web search enabled without an API key");
        }
        Some(Arc::new(TavilySearch::new(
            retrieval.web_endpoint.clone(),
            retrieval.web_api_key.clone(),
            retrieval.web_search_depth.clone(),
        )?))
    } else {
        None
    };
    let retriever = EvidenceRetriever::new(local, web, retrieval.clone());

    let providers = ProviderSet {
        general: Arc::new(GeneralProvider::new(config.general.clone())?),
        research: Arc::new(ResearchProvider::new(config.research.clone())?),
        data: Arc::new(DataAnalysisProvider::new(config.data.clone())?),
    };
    let history = Arc::new(SledHistoryStore::open(&config.history.path)?);
    tracing::info!(target: "chatgate::gateway", path = %config.history.path, "history store opened");

    Ok(Coordinator::new(config, retriever, providers, history))
}
