//! Provider stage machines
//!
//! Each submodule implements one upstream platform as an ordered stage table
//! plus a handler per stage. Shared HTTP plumbing (status classification,
//! pagination pointers) lives in [`http`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod github;
pub mod http;
pub mod producthunt;
pub mod stackexchange;
pub mod twitch;
pub mod wakatime;
pub mod youtube;

pub use github::GitHubPipeline;
pub use http::{ProviderClient, ProviderResponse};
pub use producthunt::ProductHuntPipeline;
pub use stackexchange::StackExchangePipeline;
pub use twitch::TwitchPipeline;
pub use wakatime::WakaTimePipeline;
pub use youtube::YouTubePipeline;

/// Upstream platform a connection is linked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "github")]
    GitHub,
    #[serde(rename = "stackexchange")]
    StackExchange,
    #[serde(rename = "twitch")]
    Twitch,
    #[serde(rename = "youtube")]
    YouTube,
    #[serde(rename = "wakatime")]
    WakaTime,
    #[serde(rename = "producthunt")]
    ProductHunt,
}

impl Provider {
    pub const ALL: [Provider; 6] = [
        Provider::GitHub,
        Provider::StackExchange,
        Provider::Twitch,
        Provider::YouTube,
        Provider::WakaTime,
        Provider::ProductHunt,
    ];

    /// Stable identifier stored in the database and carried in task payloads.
    pub fn slug(self) -> &'static str {
        match self {
            Provider::GitHub => "github",
            Provider::StackExchange => "stackexchange",
            Provider::Twitch => "twitch",
            Provider::YouTube => "youtube",
            Provider::WakaTime => "wakatime",
            Provider::ProductHunt => "producthunt",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown provider '{0}'")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|provider| provider.slug() == value)
            .ok_or_else(|| UnknownProvider(value.to_string()))
    }
}
