//! GitHub stage machine
//!
//! `repos` pages through the user's own repositories via the `Link` header,
//! then seeds one work list per repository for `stargazers` and
//! `contributors`. Those stages pop one repository at a time (following its
//! own `Link` pages) so every step stays a small, bounded number of calls.
//! `followers` is another `Link`-paged listing, and `save` merges it all
//! into one `repositories` record.

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::Provider;
use crate::error::ScrapeError;
use crate::job_state::StoreKey;
use crate::pipeline::{
    ScrapeOutput, Stage, StageMachine, StepContext, StepOutcome, dedupe_by, finish_work_item,
    peek_work_item, reset_work_list,
};

const SCRAPE_TYPE: &str = "repositories";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitHubStage {
    Repos,
    Stargazers,
    Contributors,
    Followers,
    Save,
}

impl Stage for GitHubStage {
    const ORDER: &'static [Self] = &[
        GitHubStage::Repos,
        GitHubStage::Stargazers,
        GitHubStage::Contributors,
        GitHubStage::Followers,
        GitHubStage::Save,
    ];

    fn name(self) -> &'static str {
        match self {
            GitHubStage::Repos => "repos",
            GitHubStage::Stargazers => "stargazers",
            GitHubStage::Contributors => "contributors",
            GitHubStage::Followers => "followers",
            GitHubStage::Save => "save",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Repo {
    id: u64,
    name: String,
    full_name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    fork: bool,
    #[serde(default)]
    stargazers_count: u64,
    #[serde(default)]
    forks_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Account {
    id: u64,
    login: String,
}

/// A user attached to one repository (stargazer or contributor).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RepoUser {
    repo: String,
    id: u64,
    login: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    contributions: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Contributor {
    id: u64,
    login: String,
    #[serde(default)]
    contributions: Option<u64>,
}

/// Store keys of a per-repository fan-out stage.
struct FanOut {
    stage: &'static str,
    endpoint: &'static str,
}

const STARGAZERS: FanOut = FanOut {
    stage: "stargazers",
    endpoint: "stargazers",
};

const CONTRIBUTORS: FanOut = FanOut {
    stage: "contributors",
    endpoint: "contributors",
};

impl FanOut {
    fn queue(&self) -> StoreKey {
        StoreKey::sub(self.stage, "queue")
    }

    fn cursor(&self) -> StoreKey {
        StoreKey::sub(self.stage, "next")
    }

    fn items(&self) -> StoreKey {
        StoreKey::new(self.stage)
    }
}

fn repos_key() -> StoreKey {
    StoreKey::new("repos")
}

fn repos_cursor() -> StoreKey {
    StoreKey::sub("repos", "next")
}

fn followers_key() -> StoreKey {
    StoreKey::new("followers")
}

fn followers_cursor() -> StoreKey {
    StoreKey::sub("followers", "next")
}

pub struct GitHubPipeline {
    api_base: String,
}

impl GitHubPipeline {
    pub fn new(api_base: &str) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    fn authed(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        request
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn repos(&self, cx: &StepContext<'_>) -> Result<StepOutcome, ScrapeError> {
        let token = cx.access_token()?;
        let url = match cx.job.get(&repos_cursor()).await? {
            Some(next) => next,
            None => format!("{}/user/repos?per_page=100&type=owner", self.api_base),
        };

        let response = cx
            .http
            .send(Provider::GitHub, self.authed(cx.http.get(&url), token))
            .await
            .map_err(ScrapeError::account_gone_if_missing)?;
        let page: Vec<Repo> = response.json()?;
        cx.job.push_json(&repos_key(), &page).await?;

        if let Some(next) = response.next_link() {
            cx.job.set(&repos_cursor(), &next).await?;
            return Ok(StepOutcome::Continue);
        }
        cx.job.del(&repos_cursor()).await?;

        let repos: Vec<Repo> = dedupe_by(cx.job.list_json(&repos_key()).await?, |r| r.id);
        let names: Vec<String> = repos.iter().map(|r| r.full_name.clone()).collect();
        reset_work_list(cx.job, &STARGAZERS.queue(), &names).await?;
        reset_work_list(cx.job, &CONTRIBUTORS.queue(), &names).await?;
        debug!(repositories = names.len(), "Repository listing complete");
        Ok(StepOutcome::Advance)
    }

    /// One page of one repository's users, then move to the next repository.
    async fn fan_out(
        &self,
        cx: &StepContext<'_>,
        fan: &FanOut,
    ) -> Result<StepOutcome, ScrapeError> {
        let token = cx.access_token()?;
        let Some(repo) = peek_work_item(cx.job, &fan.queue()).await? else {
            return Ok(StepOutcome::Advance);
        };
        let url = match cx.job.get(&fan.cursor()).await? {
            Some(next) => next,
            None => format!("{}/repos/{}/{}?per_page=100", self.api_base, repo, fan.endpoint),
        };

        let (users, next) = match cx
            .http
            .send(Provider::GitHub, self.authed(cx.http.get(&url), token))
            .await
        {
            Ok(response) if response.is_empty() => (Vec::new(), None),
            Ok(response) => (response.json::<Vec<Contributor>>()?, response.next_link()),
            // Deleted or made private since the listing; nothing to collect
            Err(ScrapeError::NotFound { .. }) => {
                debug!(repo = %repo, stage = fan.stage, "Repository not found, skipping");
                (Vec::new(), None)
            }
            Err(err) => return Err(err),
        };

        let records: Vec<RepoUser> = users
            .into_iter()
            .map(|user| RepoUser {
                repo: repo.clone(),
                id: user.id,
                login: user.login,
                contributions: user.contributions,
            })
            .collect();
        cx.job.push_json(&fan.items(), &records).await?;

        if let Some(next) = next {
            cx.job.set(&fan.cursor(), &next).await?;
            return Ok(StepOutcome::Continue);
        }
        cx.job.del(&fan.cursor()).await?;

        if finish_work_item(cx.job, &fan.queue()).await? {
            Ok(StepOutcome::Continue)
        } else {
            Ok(StepOutcome::Advance)
        }
    }

    async fn followers(&self, cx: &StepContext<'_>) -> Result<StepOutcome, ScrapeError> {
        let token = cx.access_token()?;
        let url = match cx.job.get(&followers_cursor()).await? {
            Some(next) => next,
            None => format!("{}/user/followers?per_page=100", self.api_base),
        };

        let response = cx
            .http
            .send(Provider::GitHub, self.authed(cx.http.get(&url), token))
            .await
            .map_err(ScrapeError::account_gone_if_missing)?;
        let page: Vec<Account> = response.json()?;
        cx.job.push_json(&followers_key(), &page).await?;

        match response.next_link() {
            Some(next) => {
                cx.job.set(&followers_cursor(), &next).await?;
                Ok(StepOutcome::Continue)
            }
            None => {
                cx.job.del(&followers_cursor()).await?;
                Ok(StepOutcome::Advance)
            }
        }
    }

    async fn save(&self, cx: &StepContext<'_>) -> Result<StepOutcome, ScrapeError> {
        let repos: Vec<Repo> = dedupe_by(cx.job.list_json(&repos_key()).await?, |r| r.id);
        let stargazers: Vec<RepoUser> =
            dedupe_by(cx.job.list_json(&STARGAZERS.items()).await?, |u| {
                (u.repo.clone(), u.id)
            });
        let contributors: Vec<RepoUser> =
            dedupe_by(cx.job.list_json(&CONTRIBUTORS.items()).await?, |u| {
                (u.repo.clone(), u.id)
            });
        let followers: Vec<Account> =
            dedupe_by(cx.job.list_json(&followers_key()).await?, |a| a.id);

        let repositories: Vec<_> = repos
            .iter()
            .map(|repo| {
                let starred_by: Vec<&str> = stargazers
                    .iter()
                    .filter(|u| u.repo == repo.full_name)
                    .map(|u| u.login.as_str())
                    .collect();
                let contributed_by: Vec<_> = contributors
                    .iter()
                    .filter(|u| u.repo == repo.full_name)
                    .map(|u| json!({ "login": u.login, "contributions": u.contributions }))
                    .collect();
                json!({
                    "id": repo.id,
                    "name": repo.name,
                    "full_name": repo.full_name,
                    "description": repo.description,
                    "language": repo.language,
                    "html_url": repo.html_url,
                    "fork": repo.fork,
                    "stargazers_count": repo.stargazers_count,
                    "forks_count": repo.forks_count,
                    "stargazers": starred_by,
                    "contributors": contributed_by,
                })
            })
            .collect();

        let total_stars: u64 = repos.iter().map(|r| r.stargazers_count).sum();
        let follower_logins: Vec<&str> = followers.iter().map(|a| a.login.as_str()).collect();
        let score = total_stars as f64 + followers.len() as f64;

        let data = json!({
            "repositories": repositories,
            "followers": follower_logins,
        });
        let profile = json!({
            "public_repos": repos.len(),
            "followers": followers.len(),
            "total_stars": total_stars,
        });
        Ok(StepOutcome::Complete(
            ScrapeOutput::new(SCRAPE_TYPE, data)
                .with_score(score)
                .with_profile(profile),
        ))
    }
}

#[async_trait]
impl StageMachine for GitHubPipeline {
    type Stage = GitHubStage;

    fn provider(&self) -> Provider {
        Provider::GitHub
    }

    async fn handle(
        &self,
        stage: GitHubStage,
        cx: &StepContext<'_>,
    ) -> Result<StepOutcome, ScrapeError> {
        match stage {
            GitHubStage::Repos => self.repos(cx).await,
            GitHubStage::Stargazers => self.fan_out(cx, &STARGAZERS).await,
            GitHubStage::Contributors => self.fan_out(cx, &CONTRIBUTORS).await,
            GitHubStage::Followers => self.followers(cx).await,
            GitHubStage::Save => self.save(cx).await,
        }
    }
}
