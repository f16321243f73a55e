//! YouTube stage machine
//!
//! `channel` resolves the authenticated channel's uploads playlist and
//! caches its statistics; `videos` walks that playlist with `nextPageToken`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use super::Provider;
use crate::error::ScrapeError;
use crate::job_state::StoreKey;
use crate::pipeline::{ScrapeOutput, Stage, StageMachine, StepContext, StepOutcome, dedupe_by};

const SCRAPE_TYPE: &str = "videos";
const PAGE_SIZE: &str = "50";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YouTubeStage {
    Channel,
    Videos,
    Save,
}

impl Stage for YouTubeStage {
    const ORDER: &'static [Self] = &[YouTubeStage::Channel, YouTubeStage::Videos, YouTubeStage::Save];

    fn name(self) -> &'static str {
        match self {
            YouTubeStage::Channel => "channel",
            YouTubeStage::Videos => "videos",
            YouTubeStage::Save => "save",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChannelList {
    #[serde(default)]
    items: Vec<Channel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Channel {
    id: String,
    #[serde(default)]
    snippet: Option<ChannelSnippet>,
    #[serde(default)]
    statistics: Option<ChannelStatistics>,
    content_details: ContentDetails,
}

#[derive(Debug, Deserialize)]
struct ChannelSnippet {
    #[serde(default)]
    title: String,
}

/// The Data API reports counts as decimal strings.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelStatistics {
    #[serde(default)]
    subscriber_count: Option<String>,
    #[serde(default)]
    view_count: Option<String>,
    #[serde(default)]
    video_count: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentDetails {
    related_playlists: RelatedPlaylists,
}

#[derive(Debug, Deserialize)]
struct RelatedPlaylists {
    uploads: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistPage {
    #[serde(default)]
    items: Vec<PlaylistItem>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItem {
    snippet: PlaylistSnippet,
    #[serde(default)]
    content_details: Option<PlaylistContentDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistSnippet {
    #[serde(default)]
    title: String,
    #[serde(default)]
    published_at: Option<String>,
    resource_id: ResourceId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceId {
    video_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistContentDetails {
    #[serde(default)]
    video_published_at: Option<String>,
}

/// Flattened record kept in the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Video {
    video_id: String,
    title: String,
    published_at: Option<String>,
}

fn uploads_key() -> StoreKey {
    StoreKey::sub("channel", "uploads")
}

fn profile_key() -> StoreKey {
    StoreKey::sub("channel", "profile")
}

fn videos_key() -> StoreKey {
    StoreKey::new("videos")
}

fn page_token_key() -> StoreKey {
    StoreKey::sub("videos", "page_token")
}

fn parse_count(raw: Option<&str>) -> u64 {
    raw.and_then(|v| v.parse().ok()).unwrap_or(0)
}

pub struct YouTubePipeline {
    api_base: String,
}

impl YouTubePipeline {
    pub fn new(api_base: &str) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    async fn channel(&self, cx: &StepContext<'_>) -> Result<StepOutcome, ScrapeError> {
        let token = cx.access_token()?;
        let request = cx
            .http
            .get(&format!("{}/youtube/v3/channels", self.api_base))
            .query(&[("part", "contentDetails,statistics,snippet"), ("mine", "true")])
            .bearer_auth(token);
        let response = cx
            .http
            .send(Provider::YouTube, request)
            .await
            .map_err(ScrapeError::account_gone_if_missing)?;
        let list: ChannelList = response.json()?;

        // A token whose account no longer owns a channel
        let Some(channel) = list.items.into_iter().next() else {
            return Err(ScrapeError::AccountGone {
                provider: Provider::YouTube,
            });
        };

        let stats = channel.statistics.unwrap_or_default();
        let profile = json!({
            "channel_id": channel.id,
            "title": channel.snippet.map(|s| s.title),
            "subscriber_count": parse_count(stats.subscriber_count.as_deref()),
            "view_count": parse_count(stats.view_count.as_deref()),
            "video_count": parse_count(stats.video_count.as_deref()),
        });
        cx.job.set(&profile_key(), &profile.to_string()).await?;
        cx.job
            .set(&uploads_key(), &channel.content_details.related_playlists.uploads)
            .await?;
        Ok(StepOutcome::Advance)
    }

    async fn videos(&self, cx: &StepContext<'_>) -> Result<StepOutcome, ScrapeError> {
        let token = cx.access_token()?;
        let playlist = cx.job.get(&uploads_key()).await?.ok_or_else(|| {
            ScrapeError::malformed(Provider::YouTube, "uploads playlist was never resolved")
        })?;

        let mut query = vec![
            ("part", "snippet,contentDetails".to_string()),
            ("playlistId", playlist),
            ("maxResults", PAGE_SIZE.to_string()),
        ];
        if let Some(page_token) = cx.job.get(&page_token_key()).await? {
            query.push(("pageToken", page_token));
        }

        let request = cx
            .http
            .get(&format!("{}/youtube/v3/playlistItems", self.api_base))
            .query(&query)
            .bearer_auth(token);
        let page: PlaylistPage = match cx.http.send(Provider::YouTube, request).await {
            Ok(response) => response.json()?,
            // A channel that never uploaded has no uploads playlist
            Err(ScrapeError::NotFound { .. }) => {
                debug!("Uploads playlist not found, treating it as empty");
                PlaylistPage::default()
            }
            Err(err) => return Err(err),
        };

        let videos: Vec<Video> = page
            .items
            .into_iter()
            .map(|item| Video {
                video_id: item.snippet.resource_id.video_id,
                title: item.snippet.title,
                published_at: item
                    .content_details
                    .and_then(|d| d.video_published_at)
                    .or(item.snippet.published_at),
            })
            .collect();
        cx.job.push_json(&videos_key(), &videos).await?;

        match page.next_page_token.filter(|t| !t.is_empty()) {
            Some(next) => {
                cx.job.set(&page_token_key(), &next).await?;
                Ok(StepOutcome::Continue)
            }
            None => {
                cx.job.del(&page_token_key()).await?;
                Ok(StepOutcome::Advance)
            }
        }
    }

    async fn save(&self, cx: &StepContext<'_>) -> Result<StepOutcome, ScrapeError> {
        let videos: Vec<Video> =
            dedupe_by(cx.job.list_json(&videos_key()).await?, |v| v.video_id.clone());
        let profile: Value = match cx.job.get(&profile_key()).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(|err| {
                ScrapeError::malformed(Provider::YouTube, format!("stored profile: {err}"))
            })?,
            None => Value::Null,
        };
        let subscribers = profile["subscriber_count"].as_u64().unwrap_or(0);

        let data = json!({
            "channel_id": profile["channel_id"],
            "videos": videos,
        });
        let mut output = ScrapeOutput::new(SCRAPE_TYPE, data).with_score(subscribers as f64);
        if !profile.is_null() {
            output = output.with_profile(profile);
        }
        Ok(StepOutcome::Complete(output))
    }
}

#[async_trait]
impl StageMachine for YouTubePipeline {
    type Stage = YouTubeStage;

    fn provider(&self) -> Provider {
        Provider::YouTube
    }

    async fn handle(
        &self,
        stage: YouTubeStage,
        cx: &StepContext<'_>,
    ) -> Result<StepOutcome, ScrapeError> {
        match stage {
            YouTubeStage::Channel => self.channel(cx).await,
            YouTubeStage::Videos => self.videos(cx).await,
            YouTubeStage::Save => self.save(cx).await,
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

    fn playlist_item(video_id: &str) -> Value {
        json!({
            "snippet": {"title": video_id, "resourceId": {"videoId": video_id}},
            "contentDetails": {"videoPublishedAt": "2026-01-01T00:00:00Z"}
        })
    }

    #[tokio::test]
    async fn channel_then_token_paged_uploads() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/youtube/v3/channels"))
            .and(query_param("mine", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{
                    "id": "UC1",
                    "snippet": {"title": "Chan"},
                    "statistics": {"subscriberCount": "1200", "viewCount": "9", "videoCount": "3"},
                    "contentDetails": {"relatedPlaylists": {"uploads": "UU1"}}
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/youtube/v3/playlistItems"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [playlist_item("b"), playlist_item("a")]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/youtube/v3/playlistItems"))
            .and(query_param("playlistId", "UU1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [playlist_item("a")],
                "nextPageToken": "p2"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let pipeline = YouTubePipeline::new(&server.uri());
        let (store, job_id) = test_support::store();
        let job = JobScope::new(&store, &job_id);
        let connection = test_support::connection(Provider::YouTube, "UC1");
        let http = test_support::client();
        let cx = StepContext {
            connection: &connection,
            job: &job,
            http: &http,
            tries: 0,
        };

        assert_eq!(
            pipeline.handle(YouTubeStage::Channel, &cx).await.unwrap(),
            StepOutcome::Advance
        );
        assert_eq!(
            pipeline.handle(YouTubeStage::Videos, &cx).await.unwrap(),
            StepOutcome::Continue
        );
        assert_eq!(
            pipeline.handle(YouTubeStage::Videos, &cx).await.unwrap(),
            StepOutcome::Advance
        );

        let StepOutcome::Complete(output) = pipeline.handle(YouTubeStage::Save, &cx).await.unwrap()
        else {
            panic!("save must complete");
        };
        // "a" appears on both pages
        assert_eq!(output.data["videos"].as_array().unwrap().len(), 2);
        assert_eq!(output.score, Some(1200.0));
        assert_eq!(output.profile.unwrap()["title"], "Chan");
    }

    #[tokio::test]
    async fn no_channel_means_account_gone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/youtube/v3/channels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [] })))
            .mount(&server)
            .await;

        let pipeline = YouTubePipeline::new(&server.uri());
        let (store, job_id) = test_support::store();
        let job = JobScope::new(&store, &job_id);
        let connection = test_support::connection(Provider::YouTube, "UC1");
        let http = test_support::client();
        let cx = StepContext {
            connection: &connection,
            job: &job,
            http: &http,
            tries: 0,
        };

        let err = pipeline.handle(YouTubeStage::Channel, &cx).await.unwrap_err();
        assert!(matches!(err, ScrapeError::AccountGone { .. }));
    }

    #[tokio::test]
    async fn missing_uploads_playlist_is_an_empty_last_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/youtube/v3/playlistItems"))
            .and(query_param("playlistId", "UU-empty"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"code": 404, "message": "playlistNotFound"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let pipeline = YouTubePipeline::new(&server.uri());
        let (store, job_id) = test_support::store();
        let job = JobScope::new(&store, &job_id);
        job.set(&uploads_key(), "UU-empty").await.unwrap();
        job.set(&page_token_key(), "stale").await.unwrap();
        job.set(&profile_key(), &json!({"channel_id": "UC9", "subscriber_count": 3}).to_string())
            .await
            .unwrap();
        let connection = test_support::connection(Provider::YouTube, "UC9");
        let http = test_support::client();
        let cx = StepContext {
            connection: &connection,
            job: &job,
            http: &http,
            tries: 0,
        };

        assert_eq!(
            pipeline.handle(YouTubeStage::Videos, &cx).await.unwrap(),
            StepOutcome::Advance
        );
        assert_eq!(job.get(&page_token_key()).await.unwrap(), None);

        let StepOutcome::Complete(output) = pipeline.handle(YouTubeStage::Save, &cx).await.unwrap()
        else {
            panic!("save must complete");
        };
        assert_eq!(output.data["videos"], json!([]));
        assert_eq!(output.score, Some(3.0));
    }
}
