//! WakaTime stage machine
//!
//! The stats endpoint answers `202 Accepted` while the report is still being
//! computed; the handler reports that as [`StepOutcome::NotReady`] and the
//! driver schedules the delayed retry.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::Provider;
use crate::error::ScrapeError;
use crate::job_state::StoreKey;
use crate::pipeline::{ScrapeOutput, Stage, StageMachine, StepContext, StepOutcome};

const SCRAPE_TYPE: &str = "stats";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakaTimeStage {
    Stats,
    Save,
}

impl Stage for WakaTimeStage {
    const ORDER: &'static [Self] = &[WakaTimeStage::Stats, WakaTimeStage::Save];

    fn name(self) -> &'static str {
        match self {
            WakaTimeStage::Stats => "stats",
            WakaTimeStage::Save => "save",
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatsEnvelope {
    data: Value,
}

fn stats_doc_key() -> StoreKey {
    StoreKey::sub("stats", "doc")
}

pub struct WakaTimePipeline {
    api_base: String,
}

impl WakaTimePipeline {
    pub fn new(api_base: &str) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    async fn stats(&self, cx: &StepContext<'_>) -> Result<StepOutcome, ScrapeError> {
        let token = cx.access_token()?;
        let request = cx
            .http
            .get(&format!(
                "{}/api/v1/users/current/stats/last_7_days",
                self.api_base
            ))
            .bearer_auth(token);
        let response = cx
            .http
            .send(Provider::WakaTime, request)
            .await
            .map_err(ScrapeError::account_gone_if_missing)?;

        if response.is_accepted() {
            debug!(tries = cx.tries, "Stats report is still being computed");
            return Ok(StepOutcome::NotReady);
        }

        let envelope: StatsEnvelope = response.json()?;
        if !envelope.data.is_object() {
            return Err(ScrapeError::malformed(
                Provider::WakaTime,
                "stats response has no data object",
            ));
        }
        cx.job
            .set(&stats_doc_key(), &envelope.data.to_string())
            .await?;
        Ok(StepOutcome::Advance)
    }

    async fn save(&self, cx: &StepContext<'_>) -> Result<StepOutcome, ScrapeError> {
        let stats: Value = match cx.job.get(&stats_doc_key()).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(|err| {
                ScrapeError::malformed(Provider::WakaTime, format!("stored stats: {err}"))
            })?,
            None => {
                return Err(ScrapeError::malformed(
                    Provider::WakaTime,
                    "stats document missing from job state",
                ));
            }
        };
        let total_seconds = stats["total_seconds"].as_f64().unwrap_or(0.0);
        let hours = total_seconds / 3600.0;

        let profile = json!({
            "username": stats["username"],
            "range": stats["range"],
            "total_hours": hours,
            "daily_average_seconds": stats["daily_average"],
        });
        Ok(StepOutcome::Complete(
            ScrapeOutput::new(SCRAPE_TYPE, stats)
                .with_score(hours)
                .with_profile(profile),
        ))
    }
}

#[async_trait]
impl StageMachine for WakaTimePipeline {
    type Stage = WakaTimeStage;

    fn provider(&self) -> Provider {
        Provider::WakaTime
    }

    async fn handle(
        &self,
        stage: WakaTimeStage,
        cx: &StepContext<'_>,
    ) -> Result<StepOutcome, ScrapeError> {
        match stage {
            WakaTimeStage::Stats => self.stats(cx).await,
            WakaTimeStage::Save => self.save(cx).await,
        }
    }
}
