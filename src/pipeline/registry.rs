//! Provider pipeline registry
//!
//! Maps each [`Provider`] to its stage machine. Built once at startup and
//! shared by the driver; there is no global instance.

use std::collections::HashMap;
use std::sync::Arc;

use super::Pipeline;
use crate::config::ProvidersConfig;
use crate::error::ScrapeError;
use crate::providers::{
    GitHubPipeline, ProductHuntPipeline, Provider, StackExchangePipeline, TwitchPipeline,
    WakaTimePipeline, YouTubePipeline,
};

#[derive(Clone, Default)]
pub struct PipelineRegistry {
    pipelines: HashMap<Provider, Arc<dyn Pipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every supported provider wired to its configured endpoint.
    pub fn from_config(config: &ProvidersConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(GitHubPipeline::new(&config.github_api_base)));
        registry.register(Arc::new(StackExchangePipeline::new(
            &config.stackexchange_api_base,
            &config.stackexchange_site,
            config.stackexchange_key.clone(),
        )));
        registry.register(Arc::new(TwitchPipeline::new(
            &config.twitch_api_base,
            config.twitch_client_id.clone(),
        )));
        registry.register(Arc::new(YouTubePipeline::new(&config.youtube_api_base)));
        registry.register(Arc::new(WakaTimePipeline::new(&config.wakatime_api_base)));
        registry.register(Arc::new(ProductHuntPipeline::new(
            &config.producthunt_api_base,
        )));
        registry
    }

    /// Registers a pipeline, replacing any previous one for the same provider.
    pub fn register(&mut self, pipeline: Arc<dyn Pipeline>) {
        self.pipelines.insert(pipeline.provider(), pipeline);
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn Pipeline>, ScrapeError> {
        self.pipelines
            .get(&provider)
            .cloned()
            .ok_or(ScrapeError::UnregisteredProvider(provider))
    }

    /// Registered providers in stable order.
    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<_> = self.pipelines.keys().copied().collect();
        providers.sort();
        providers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_covers_every_provider() {
        let registry = PipelineRegistry::from_config(&ProvidersConfig::default());
        assert_eq!(registry.providers(), Provider::ALL.to_vec());
    }

    #[test]
    fn every_pipeline_ends_in_a_terminal_save_stage() {
        let registry = PipelineRegistry::from_config(&ProvidersConfig::default());
        for provider in Provider::ALL {
            let pipeline = registry.get(provider).unwrap();
            let names = pipeline.stage_names();
            assert_eq!(names.last(), Some(&"save"), "{provider}");

            // Walking the table from the first stage reaches the terminal stage
            let mut current = pipeline.first_stage().unwrap();
            let mut visited = vec![current];
            while let Some(next) = pipeline.next_stage(current).unwrap() {
                visited.push(next);
                current = next;
            }
            assert_eq!(visited, names, "{provider}");
        }
    }

    #[test]
    fn missing_provider_is_a_typed_error() {
        let registry = PipelineRegistry::new();
        assert!(matches!(
            registry.get(Provider::Twitch),
            Err(ScrapeError::UnregisteredProvider(Provider::Twitch))
        ));
    }

    #[test]
    fn unknown_stage_name_is_rejected() {
        let registry = PipelineRegistry::from_config(&ProvidersConfig::default());
        let pipeline = registry.get(Provider::GitHub).unwrap();
        assert!(matches!(
            pipeline.next_stage("nonsense"),
            Err(ScrapeError::UnknownStage { .. })
        ));
    }
}
