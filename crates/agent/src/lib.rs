pub mod api;
pub mod assembler;
pub mod config;
pub mod errors;
pub mod idempotency;
pub mod metrics;
pub mod pipeline;
pub mod poller;
pub mod providers;
pub mod publisher;
pub mod supported_objects;
pub mod tracking;
pub mod worker_state;

pub use config::Config;
pub use errors::GenError;
pub use worker_state::WorkerState;

use std::sync::Arc;

/// Shared service state: configuration plus every long-lived collaborator.
/// One instance per process, shared by the HTTP surface and the poller.
pub struct App {
    pub config: Config,
    pub sf: Arc<sf_api::Client>,
    pub cache: Arc<template_cache::TemplateCache>,
    pub pool: Arc<convert::ConversionPool>,
    pub providers: Arc<providers::ProviderRegistry>,
    pub worker: Arc<WorkerState>,
    pub jwks: api::jwks::JwksCache,
    /// Client for JWKS fetches and external template images.
    pub http: reqwest::Client,
}

impl App {
    pub fn new(config: Config) -> Self {
        let sf = Arc::new(sf_api::Client::new(config.sf_auth()));
        let cache = Arc::new(template_cache::TemplateCache::new(
            config.template_cache_max_bytes,
        ));
        let pool = Arc::new(convert::ConversionPool::new(config.pool_config()));
        let jwks = api::jwks::JwksCache::new(config.jwks_uri.clone());

        Self {
            config,
            sf,
            cache,
            pool,
            providers: Arc::new(providers::ProviderRegistry::default()),
            worker: Arc::new(WorkerState::new()),
            jwks,
            http: reqwest::Client::new(),
        }
    }
}
