//! Buddy avatar fetching and own avatar upload.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, Method};
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{GgError, Result};
use crate::oauth::{self, Consumer, Nonce, Token};

/// Shared flag telling in-flight requests whether their session still exists.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn kill(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Buddies whose avatar needs checking, plus the timestamp of the avatar we
/// last saw for each of them.
#[derive(Debug, Default)]
pub struct AvatarQueue {
    pending: VecDeque<u32>,
    in_flight: HashSet<u32>,
    known: HashMap<u32, i64>,
}

impl AvatarQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `uin` for a check. Returns false if a check is already queued
    /// or running.
    pub fn request(&mut self, uin: u32) -> bool {
        if self.pending.contains(&uin) || self.in_flight.contains(&uin) {
            return false;
        }
        self.pending.push_back(uin);
        true
    }

    /// Next buddy to check and the timestamp we already have for it. The
    /// buddy counts as in flight until [`complete`](Self::complete).
    pub fn next(&mut self) -> Option<(u32, Option<i64>)> {
        let uin = self.pending.pop_front()?;
        self.in_flight.insert(uin);
        Some((uin, self.known.get(&uin).copied()))
    }

    /// Finish a check, remembering the timestamp it found, if any.
    pub fn complete(&mut self, uin: u32, timestamp: Option<i64>) {
        self.in_flight.remove(&uin);
        if let Some(timestamp) = timestamp {
            self.known.insert(uin, timestamp);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn known(&self, uin: u32) -> Option<i64> {
        self.known.get(&uin).copied()
    }

    pub fn remember(&mut self, uin: u32, timestamp: i64) {
        self.known.insert(uin, timestamp);
    }

    pub fn forget(&mut self, uin: u32) {
        self.known.remove(&uin);
        self.in_flight.remove(&uin);
        self.pending.retain(|u| *u != uin);
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.in_flight.clear();
        self.known.clear();
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AvatarInfo {
    pub timestamp: i64,
    #[serde(default, rename = "bigAvatar")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvatarUpdate {
    Unchanged,
    Removed { timestamp: i64 },
    Image { timestamp: i64, data: Vec<u8> },
}

/// Outcome of one buddy check, delivered back to the session.
#[derive(Debug)]
pub struct FetchedAvatar {
    pub uin: u32,
    pub result: Result<AvatarUpdate>,
}

/// HTTP side of the avatar service.
#[derive(Debug, Clone)]
pub struct AvatarApi {
    client: Client,
    api_base: Url,
    avatar_base: Url,
}

fn with_trailing_slash(base: &str) -> std::result::Result<Url, url::ParseError> {
    Url::parse(&format!("{}/", base.trim_end_matches('/')))
}

impl AvatarApi {
    pub fn new(client: Client, api_base: &str, avatar_base: &str) -> Result<Self> {
        Ok(Self {
            client,
            api_base: with_trailing_slash(api_base)?,
            avatar_base: with_trailing_slash(avatar_base)?,
        })
    }

    pub fn info_url(&self, uin: u32) -> Result<Url> {
        Ok(self.api_base.join(&format!("avatars/{uin}/0.json"))?)
    }

    pub fn upload_url(&self) -> Result<Url> {
        Ok(self.avatar_base.join("upload")?)
    }

    pub async fn info(&self, uin: u32) -> Result<AvatarInfo> {
        let response = self.client.get(self.info_url(uin)?).send().await?;
        if !response.status().is_success() {
            return Err(GgError::Status {
                endpoint: "avatar info".to_string(),
                status: response.status().as_u16(),
            });
        }
        response.json::<AvatarInfo>().await.map_err(|e| GgError::Malformed {
            endpoint: "avatar info".to_string(),
            reason: e.to_string(),
        })
    }

    pub async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(GgError::Status {
                endpoint: "avatar image".to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Look up the current avatar of `uin`; the image is only downloaded when
    /// its timestamp differs from `known`.
    #[instrument(skip(self))]
    pub async fn fetch(&self, uin: u32, known: Option<i64>) -> Result<AvatarUpdate> {
        let info = self.info(uin).await?;
        if known == Some(info.timestamp) {
            debug!("avatar unchanged");
            return Ok(AvatarUpdate::Unchanged);
        }
        match info.url.as_deref().filter(|u| !u.is_empty()) {
            None => Ok(AvatarUpdate::Removed {
                timestamp: info.timestamp,
            }),
            Some(url) => {
                let data = self.download(url).await?;
                debug!(size = data.len(), "avatar downloaded");
                Ok(AvatarUpdate::Image {
                    timestamp: info.timestamp,
                    data,
                })
            }
        }
    }

    /// Upload our own avatar, signed with an OAuth access token.
    #[instrument(skip(self, password, token, image), fields(size = image.len()))]
    pub async fn upload(&self, uin: u32, password: &str, token: &Token, image: &[u8]) -> Result<()> {
        let url = self.upload_url()?;
        let uin = uin.to_string();
        let photo = STANDARD.encode(image);
        let form = [("uin", uin.as_str()), ("photo", photo.as_str())];
        let consumer = Consumer {
            key: uin.clone(),
            secret: password.to_string(),
        };
        let header = oauth::authorization_header(
            &Method::POST,
            &url,
            &form,
            &consumer,
            Some(token),
            &Nonce::fresh(),
        );

        let response = self
            .client
            .post(url)
            .header(reqwest::header::AUTHORIZATION, header)
            .form(&form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GgError::Status {
                endpoint: "avatar upload".to_string(),
                status: response.status().as_u16(),
            });
        }
        debug!("own avatar uploaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_coalesces_repeated_requests() {
        let mut queue = AvatarQueue::new();
        assert!(queue.request(42));
        assert!(!queue.request(42));
        assert!(queue.request(7));

        assert_eq!(queue.next(), Some((42, None)));
        assert_eq!(queue.next(), Some((7, None)));
        assert_eq!(queue.next(), None);

        // still running
        assert!(!queue.request(42));
        queue.complete(42, Some(10));
        assert!(queue.request(42));
        assert_eq!(queue.next(), Some((42, Some(10))));
    }

    #[test]
    fn failed_checks_keep_the_old_timestamp() {
        let mut queue = AvatarQueue::new();
        queue.remember(42, 5);
        queue.request(42);
        queue.next();
        queue.complete(42, None);
        assert_eq!(queue.known(42), Some(5));
    }

    #[test]
    fn queue_hands_out_the_last_known_timestamp() {
        let mut queue = AvatarQueue::new();
        queue.remember(42, 1_700_000_000);
        queue.request(42);
        assert_eq!(queue.next(), Some((42, Some(1_700_000_000))));
    }

    #[test]
    fn forgetting_drops_pending_checks() {
        let mut queue = AvatarQueue::new();
        queue.remember(42, 1);
        queue.request(42);
        queue.forget(42);
        assert!(queue.is_empty());
        assert_eq!(queue.known(42), None);
    }

    #[test]
    fn liveness_is_shared_between_clones() {
        let live = Liveness::new();
        let task = live.clone();
        assert!(task.is_alive());
        live.kill();
        assert!(!task.is_alive());
    }

    #[test]
    fn urls_are_built_from_the_configured_bases() {
        let api = AvatarApi::new(Client::new(), "https://api.example.test", "http://avatars.example.test/")
            .unwrap();
        assert_eq!(
            api.info_url(123456).unwrap().as_str(),
            "https://api.example.test/avatars/123456/0.json"
        );
        assert_eq!(api.upload_url().unwrap().as_str(), "http://avatars.example.test/upload");
    }
}
