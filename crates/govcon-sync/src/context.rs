//! Production wiring: Postgres store and advisory locks, the shared HTTP
//! fetcher, and the services built on top of them.

use std::sync::Arc;

use anyhow::Context;
use govcon_adapters::{DescriptionSource, HttpDescriptionSource, SamListingClient};
use govcon_storage::{HttpFetcher, PgAdvisoryMutex, PgStore};
use tracing::info;

use crate::backfill::BackfillOrchestrator;
use crate::config::{AppConfig, BackfillConfig};
use crate::description::DescriptionService;
use crate::ingest::IngestionService;
use crate::pipeline::DescriptionPipeline;

/// Advisory locks pin a pooled connection each, so leave headroom above the
/// backfill worker ceiling.
const POOL_SIZE: u32 = 20;

pub struct AppContext {
    pub config: AppConfig,
    pub store: Arc<PgStore>,
    pub mutex: Arc<PgAdvisoryMutex>,
    pub http: Arc<HttpFetcher>,
    pub pipeline: DescriptionPipeline,
}

impl AppContext {
    pub async fn connect(config: AppConfig) -> anyhow::Result<Self> {
        let store = PgStore::connect(&config.database_url, POOL_SIZE)
            .await
            .context("connecting to postgres")?;
        let mutex = PgAdvisoryMutex::new(store.pool().clone());
        let http = HttpFetcher::new(config.fetch.http_client_config())?;
        let pipeline = DescriptionPipeline::new(config.extractor()?);
        info!(api_key = config.sam_api_key.is_some(), "application context ready");

        Ok(Self {
            config,
            store: Arc::new(store),
            mutex: Arc::new(mutex),
            http: Arc::new(http),
            pipeline,
        })
    }

    pub fn description_source(&self) -> Arc<dyn DescriptionSource> {
        Arc::new(HttpDescriptionSource::new(self.http.clone(), self.config.sam_api_key.clone()))
    }

    pub fn description_service(&self) -> DescriptionService {
        DescriptionService::new(
            self.store.clone(),
            self.store.clone(),
            self.description_source(),
            self.mutex.clone(),
            self.pipeline.clone(),
            self.config.description.clone(),
        )
    }

    pub fn ingestion_service(&self) -> anyhow::Result<IngestionService> {
        let api_key = self
            .config
            .sam_api_key
            .clone()
            .context("SAM_API_KEY is required for ingestion")?;
        let listing = SamListingClient::new(self.http.clone(), &self.config.sam_search_url, api_key)?;
        Ok(IngestionService::new(Arc::new(listing), self.store.clone()))
    }

    pub fn backfill(&self, config: BackfillConfig) -> BackfillOrchestrator {
        BackfillOrchestrator::new(
            self.store.clone(),
            self.description_source(),
            self.mutex.clone(),
            self.pipeline.clone(),
            config,
        )
    }
}
