//! Stack Exchange stage machine
//!
//! Answers are paged by a client-side page number; the `has_more` flag in
//! the `{items, has_more}` wrapper is the only end-of-data signal.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::Provider;
use crate::error::ScrapeError;
use crate::job_state::StoreKey;
use crate::pipeline::{ScrapeOutput, Stage, StageMachine, StepContext, StepOutcome, dedupe_by};

const SCRAPE_TYPE: &str = "answers";
const PAGE_SIZE: &str = "100";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackExchangeStage {
    Answers,
    Save,
}

impl Stage for StackExchangeStage {
    const ORDER: &'static [Self] = &[StackExchangeStage::Answers, StackExchangeStage::Save];

    fn name(self) -> &'static str {
        match self {
            StackExchangeStage::Answers => "answers",
            StackExchangeStage::Save => "save",
        }
    }
}

#[derive(Debug, Deserialize)]
struct Wrapper {
    #[serde(default)]
    items: Vec<Answer>,
    #[serde(default)]
    has_more: bool,
    /// Seconds the API asks clients to wait before the next call.
    #[serde(default)]
    backoff: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Answer {
    answer_id: u64,
    question_id: u64,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    is_accepted: bool,
    #[serde(default)]
    creation_date: i64,
    #[serde(default)]
    tags: Vec<String>,
}

fn answers_key() -> StoreKey {
    StoreKey::new("answers")
}

fn page_key() -> StoreKey {
    StoreKey::sub("answers", "page")
}

pub struct StackExchangePipeline {
    api_base: String,
    site: String,
    key: Option<String>,
}

impl StackExchangePipeline {
    pub fn new(api_base: &str, site: &str, key: Option<String>) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            site: site.to_string(),
            key,
        }
    }

    async fn answers(&self, cx: &StepContext<'_>) -> Result<StepOutcome, ScrapeError> {
        let token = cx.access_token()?;
        let page: u32 = match cx.job.get(&page_key()).await? {
            Some(raw) => raw.parse().map_err(|_| {
                ScrapeError::malformed(Provider::StackExchange, format!("bad stored page '{raw}'"))
            })?,
            None => 1,
        };

        let url = format!(
            "{}/users/{}/answers",
            self.api_base, cx.connection.external_id
        );
        let page_param = page.to_string();
        let mut query = vec![
            ("site", self.site.as_str()),
            ("page", page_param.as_str()),
            ("pagesize", PAGE_SIZE),
            ("order", "desc"),
            ("sort", "activity"),
            ("filter", "default"),
            ("access_token", token),
        ];
        if let Some(key) = &self.key {
            query.push(("key", key.as_str()));
        }

        let response = cx
            .http
            .send(Provider::StackExchange, cx.http.get(&url).query(&query))
            .await
            .map_err(ScrapeError::account_gone_if_missing)?;
        let wrapper: Wrapper = response.json()?;
        cx.job.push_json(&answers_key(), &wrapper.items).await?;

        if wrapper.has_more {
            cx.job.set(&page_key(), &(page + 1).to_string()).await?;
            match wrapper.backoff {
                Some(backoff) => {
                    debug!(backoff_secs = backoff, "Stack Exchange requested backoff");
                    Ok(StepOutcome::ContinueAfter(Duration::from_secs(backoff)))
                }
                None => Ok(StepOutcome::Continue),
            }
        } else {
            cx.job.del(&page_key()).await?;
            Ok(StepOutcome::Advance)
        }
    }

    async fn save(&self, cx: &StepContext<'_>) -> Result<StepOutcome, ScrapeError> {
        let answers: Vec<Answer> =
            dedupe_by(cx.job.list_json(&answers_key()).await?, |a| a.answer_id);
        let accepted = answers.iter().filter(|a| a.is_accepted).count();
        let total_score: i64 = answers.iter().map(|a| a.score).sum();

        let profile = json!({
            "site": self.site,
            "answer_count": answers.len(),
            "accepted_count": accepted,
        });
        let data = json!({ "site": self.site, "answers": answers });
        Ok(StepOutcome::Complete(
            ScrapeOutput::new(SCRAPE_TYPE, data)
                .with_score(total_score as f64)
                .with_profile(profile),
        ))
    }
}

#[async_trait]
impl StageMachine for StackExchangePipeline {
    type Stage = StackExchangeStage;

    fn provider(&self) -> Provider {
        Provider::StackExchange
    }

    async fn handle(
        &self,
        stage: StackExchangeStage,
        cx: &StepContext<'_>,
    ) -> Result<StepOutcome, ScrapeError> {
        match stage {
            StackExchangeStage::Answers => self.answers(cx).await,
            StackExchangeStage::Save => self.save(cx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_state::JobScope;
    use crate::providers::test_support;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn pages_by_number_until_has_more_is_false() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/42/answers"))
            .and(query_param("page", "1"))
            .and(query_param("site", "stackoverflow"))
            .and(query_param("key", "app-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"answer_id": 1, "question_id": 10, "score": 5, "is_accepted": true}],
                "has_more": true
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/42/answers"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"answer_id": 2, "question_id": 11, "score": 2}],
                "has_more": false
            })))
            .expect(1)
            .mount(&server)
            .await;

        let pipeline =
            StackExchangePipeline::new(&server.uri(), "stackoverflow", Some("app-key".into()));
        let (store, job_id) = test_support::store();
        let job = JobScope::new(&store, &job_id);
        let connection = test_support::connection(Provider::StackExchange, "42");
        let http = test_support::client();
        let cx = StepContext {
            connection: &connection,
            job: &job,
            http: &http,
            tries: 0,
        };

        assert_eq!(
            pipeline.handle(StackExchangeStage::Answers, &cx).await.unwrap(),
            StepOutcome::Continue
        );
        assert_eq!(job.get(&page_key()).await.unwrap().as_deref(), Some("2"));
        assert_eq!(
            pipeline.handle(StackExchangeStage::Answers, &cx).await.unwrap(),
            StepOutcome::Advance
        );
        assert_eq!(job.get(&page_key()).await.unwrap(), None);

        let StepOutcome::Complete(output) =
            pipeline.handle(StackExchangeStage::Save, &cx).await.unwrap()
        else {
            panic!("save must complete");
        };
        assert_eq!(output.data["answers"].as_array().unwrap().len(), 2);
        assert_eq!(output.score, Some(7.0));
        assert_eq!(output.profile.unwrap()["accepted_count"], 1);
    }

    #[tokio::test]
    async fn backoff_delays_the_next_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/7/answers"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"answer_id": 1, "question_id": 10, "score": 1}],
                "has_more": true,
                "backoff": 10
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/7/answers"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [],
                "has_more": false,
                "backoff": 10
            })))
            .mount(&server)
            .await;

        let pipeline = StackExchangePipeline::new(&server.uri(), "stackoverflow", None);
        let (store, job_id) = test_support::store();
        let job = JobScope::new(&store, &job_id);
        let connection = test_support::connection(Provider::StackExchange, "7");
        let http = test_support::client();
        let cx = StepContext {
            connection: &connection,
            job: &job,
            http: &http,
            tries: 0,
        };

        assert_eq!(
            pipeline.handle(StackExchangeStage::Answers, &cx).await.unwrap(),
            StepOutcome::ContinueAfter(Duration::from_secs(10))
        );
        // No further call follows the last page, so its backoff is moot
        assert_eq!(
            pipeline.handle(StackExchangeStage::Answers, &cx).await.unwrap(),
            StepOutcome::Advance
        );
    }
}
