//! Twitch stage machine
//!
//! Helix paginates with an opaque `pagination.cursor` in the body. A page
//! with no cursor, or with an empty `data` array, ends the listing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::Provider;
use crate::error::ScrapeError;
use crate::job_state::StoreKey;
use crate::pipeline::{ScrapeOutput, Stage, StageMachine, StepContext, StepOutcome, dedupe_by};

const SCRAPE_TYPE: &str = "videos";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwitchStage {
    Videos,
    Save,
}

impl Stage for TwitchStage {
    const ORDER: &'static [Self] = &[TwitchStage::Videos, TwitchStage::Save];

    fn name(self) -> &'static str {
        match self {
            TwitchStage::Videos => "videos",
            TwitchStage::Save => "save",
        }
    }
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    data: Vec<Video>,
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Debug, Default, Deserialize)]
struct Pagination {
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Video {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    view_count: u64,
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
}

fn videos_key() -> StoreKey {
    StoreKey::new("videos")
}

fn cursor_key() -> StoreKey {
    StoreKey::sub("videos", "cursor")
}

pub struct TwitchPipeline {
    api_base: String,
    client_id: Option<String>,
}

impl TwitchPipeline {
    pub fn new(api_base: &str, client_id: Option<String>) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            client_id,
        }
    }

    async fn videos(&self, cx: &StepContext<'_>) -> Result<StepOutcome, ScrapeError> {
        let token = cx.access_token()?;
        let client_id = self
            .client_id
            .as_deref()
            .ok_or(ScrapeError::MissingCredentials {
                connection_id: cx.connection.id,
            })?;

        let mut query = vec![
            ("user_id", cx.connection.external_id.clone()),
            ("first", "100".to_string()),
        ];
        if let Some(cursor) = cx.job.get(&cursor_key()).await? {
            query.push(("after", cursor));
        }

        let request = cx
            .http
            .get(&format!("{}/helix/videos", self.api_base))
            .query(&query)
            .bearer_auth(token)
            .header("Client-Id", client_id);
        let response = cx
            .http
            .send(Provider::Twitch, request)
            .await
            .map_err(ScrapeError::account_gone_if_missing)?;
        let page: Page = response.json()?;
        let exhausted = page.data.is_empty();
        cx.job.push_json(&videos_key(), &page.data).await?;

        match page.pagination.cursor.filter(|c| !c.is_empty() && !exhausted) {
            Some(cursor) => {
                cx.job.set(&cursor_key(), &cursor).await?;
                Ok(StepOutcome::Continue)
            }
            None => {
                cx.job.del(&cursor_key()).await?;
                Ok(StepOutcome::Advance)
            }
        }
    }

    async fn save(&self, cx: &StepContext<'_>) -> Result<StepOutcome, ScrapeError> {
        let videos: Vec<Video> =
            dedupe_by(cx.job.list_json(&videos_key()).await?, |v| v.id.clone());
        let total_views: u64 = videos.iter().map(|v| v.view_count).sum();

        let profile = json!({ "video_count": videos.len(), "total_views": total_views });
        Ok(StepOutcome::Complete(
            ScrapeOutput::new(SCRAPE_TYPE, json!({ "videos": videos }))
                .with_score(total_views as f64)
                .with_profile(profile),
        ))
    }
}

#[async_trait]
impl StageMachine for TwitchPipeline {
    type Stage = TwitchStage;

    fn provider(&self) -> Provider {
        Provider::Twitch
    }

    async fn handle(
        &self,
        stage: TwitchStage,
        cx: &StepContext<'_>,
    ) -> Result<StepOutcome, ScrapeError> {
        match stage {
            TwitchStage::Videos => self.videos(cx).await,
            TwitchStage::Save => self.save(cx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_state::JobScope;
    use crate::providers::test_support;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn follows_body_cursor_and_sends_client_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/helix/videos"))
            .and(query_param("after", "c1"))
            .and(header("Client-Id", "client-abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "v2", "title": "second", "view_count": 5}],
                "pagination": {}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/helix/videos"))
            .and(query_param("user_id", "777"))
            .and(header("Client-Id", "client-abc"))
            .and(header("Authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "v1", "title": "first", "view_count": 10}],
                "pagination": {"cursor": "c1"}
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let pipeline = TwitchPipeline::new(&server.uri(), Some("client-abc".into()));
        let (store, job_id) = test_support::store();
        let job = JobScope::new(&store, &job_id);
        let connection = test_support::connection(Provider::Twitch, "777");
        let http = test_support::client();
        let cx = StepContext {
            connection: &connection,
            job: &job,
            http: &http,
            tries: 0,
        };

        assert_eq!(
            pipeline.handle(TwitchStage::Videos, &cx).await.unwrap(),
            StepOutcome::Continue
        );
        assert_eq!(job.get(&cursor_key()).await.unwrap().as_deref(), Some("c1"));
        assert_eq!(
            pipeline.handle(TwitchStage::Videos, &cx).await.unwrap(),
            StepOutcome::Advance
        );

        let StepOutcome::Complete(output) = pipeline.handle(TwitchStage::Save, &cx).await.unwrap()
        else {
            panic!("save must complete");
        };
        assert_eq!(output.score, Some(15.0));
        assert_eq!(output.data["videos"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_page_with_cursor_still_ends_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/helix/videos"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [],
                "pagination": {"cursor": "dangling"}
            })))
            .mount(&server)
            .await;

        let pipeline = TwitchPipeline::new(&server.uri(), Some("client-abc".into()));
        let (store, job_id) = test_support::store();
        let job = JobScope::new(&store, &job_id);
        let connection = test_support::connection(Provider::Twitch, "777");
        let http = test_support::client();
        let cx = StepContext {
            connection: &connection,
            job: &job,
            http: &http,
            tries: 0,
        };

        assert_eq!(
            pipeline.handle(TwitchStage::Videos, &cx).await.unwrap(),
            StepOutcome::Advance
        );
        assert_eq!(job.get(&cursor_key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_client_id_is_a_credentials_error() {
        let pipeline = TwitchPipeline::new("http://127.0.0.1:1", None);
        let (store, job_id) = test_support::store();
        let job = JobScope::new(&store, &job_id);
        let connection = test_support::connection(Provider::Twitch, "777");
        let http = test_support::client();
        let cx = StepContext {
            connection: &connection,
            job: &job,
            http: &http,
            tries: 0,
        };

        let err = pipeline.handle(TwitchStage::Videos, &cx).await.unwrap_err();
        assert!(matches!(err, ScrapeError::MissingCredentials { .. }));
    }
}
