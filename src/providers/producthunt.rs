//! Product Hunt stage machine
//!
//! Posts come from the GraphQL API with relay-style `pageInfo`; the stored
//! resumption pointer is `endCursor`, cleared once `hasNextPage` is false.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::Provider;
use crate::error::ScrapeError;
use crate::job_state::StoreKey;
use crate::pipeline::{ScrapeOutput, Stage, StageMachine, StepContext, StepOutcome, dedupe_by};

const SCRAPE_TYPE: &str = "posts";
const PAGE_SIZE: u32 = 20;

const MADE_POSTS_QUERY: &str = r#"
query MadePosts($first: Int!, $after: String) {
  viewer {
    user {
      id
      username
      name
      madePosts(first: $first, after: $after) {
        pageInfo { endCursor hasNextPage }
        edges { node { id name tagline url votesCount commentsCount createdAt } }
      }
    }
  }
}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductHuntStage {
    Posts,
    Save,
}

impl Stage for ProductHuntStage {
    const ORDER: &'static [Self] = &[ProductHuntStage::Posts, ProductHuntStage::Save];

    fn name(self) -> &'static str {
        match self {
            ProductHuntStage::Posts => "posts",
            ProductHuntStage::Save => "save",
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<ViewerData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ViewerData {
    viewer: Option<Viewer>,
}

#[derive(Debug, Deserialize)]
struct Viewer {
    user: Option<User>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct User {
    id: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    name: Option<String>,
    made_posts: Connection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Connection {
    page_info: PageInfo,
    #[serde(default)]
    edges: Vec<Edge>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    #[serde(default)]
    end_cursor: Option<String>,
    #[serde(default)]
    has_next_page: bool,
}

#[derive(Debug, Deserialize)]
struct Edge {
    node: Post,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Post {
    id: String,
    name: String,
    #[serde(default)]
    tagline: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    votes_count: u64,
    #[serde(default)]
    comments_count: u64,
    #[serde(default)]
    created_at: Option<String>,
}

fn posts_key() -> StoreKey {
    StoreKey::new("posts")
}

fn cursor_key() -> StoreKey {
    StoreKey::sub("posts", "cursor")
}

fn maker_key() -> StoreKey {
    StoreKey::sub("posts", "maker")
}

pub struct ProductHuntPipeline {
    api_base: String,
}

impl ProductHuntPipeline {
    pub fn new(api_base: &str) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    async fn posts(&self, cx: &StepContext<'_>) -> Result<StepOutcome, ScrapeError> {
        let token = cx.access_token()?;
        let after = cx.job.get(&cursor_key()).await?;
        let body = json!({
            "query": MADE_POSTS_QUERY,
            "variables": { "first": PAGE_SIZE, "after": after },
        });

        let request = cx
            .http
            .post(&format!("{}/v2/api/graphql", self.api_base))
            .bearer_auth(token)
            .json(&body);
        let response = cx
            .http
            .send(Provider::ProductHunt, request)
            .await
            .map_err(ScrapeError::account_gone_if_missing)?;
        let parsed: GraphQlResponse = response.json()?;

        // GraphQL reports failures with a 200 and an `errors` array
        if !parsed.errors.is_empty() {
            let messages: Vec<&str> = parsed.errors.iter().map(|e| e.message.as_str()).collect();
            return Err(ScrapeError::malformed(
                Provider::ProductHunt,
                messages.join("; "),
            ));
        }
        let Some(user) = parsed.data.and_then(|d| d.viewer).and_then(|v| v.user) else {
            return Err(ScrapeError::AccountGone {
                provider: Provider::ProductHunt,
            });
        };

        let maker = json!({ "id": user.id, "username": user.username, "name": user.name });
        cx.job.set(&maker_key(), &maker.to_string()).await?;
        let posts: Vec<Post> = user.made_posts.edges.into_iter().map(|e| e.node).collect();
        cx.job.push_json(&posts_key(), &posts).await?;

        let page_info = user.made_posts.page_info;
        match page_info.end_cursor.filter(|_| page_info.has_next_page) {
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
        let posts: Vec<Post> = dedupe_by(cx.job.list_json(&posts_key()).await?, |p| p.id.clone());
        let votes: u64 = posts.iter().map(|p| p.votes_count).sum();
        let maker = match cx.job.get(&maker_key()).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(|err| {
                ScrapeError::malformed(Provider::ProductHunt, format!("stored maker: {err}"))
            })?,
            None => serde_json::Value::Null,
        };

        let profile = json!({
            "maker": maker,
            "post_count": posts.len(),
            "total_votes": votes,
        });
        Ok(StepOutcome::Complete(
            ScrapeOutput::new(SCRAPE_TYPE, json!({ "posts": posts }))
                .with_score(votes as f64)
                .with_profile(profile),
        ))
    }
}

#[async_trait]
impl StageMachine for ProductHuntPipeline {
    type Stage = ProductHuntStage;

    fn provider(&self) -> Provider {
        Provider::ProductHunt
    }

    async fn handle(
        &self,
        stage: ProductHuntStage,
        cx: &StepContext<'_>,
    ) -> Result<StepOutcome, ScrapeError> {
        match stage {
            ProductHuntStage::Posts => self.posts(cx).await,
            ProductHuntStage::Save => self.save(cx).await,
        }
    }
}
