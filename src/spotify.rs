use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashSet;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

pub const ACCOUNTS_BASE: &str = "https://accounts.spotify.com";
pub const API_BASE: &str = "https://api.spotify.com/v1";

/// Upstream cap on ids per audio-features request.
pub const FEATURE_BATCH_LIMIT: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}

#[derive(Debug, Clone)]
pub struct RawPlayEvent {
    pub track_id: String,
    pub track_name: String,
    pub artist_name: String,
    pub played_at: OffsetDateTime,
    pub album_cover_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioFeature {
    pub id: String,
    pub valence: f64,
    pub energy: f64,
    pub danceability: f64,
}

#[derive(Debug)]
pub enum SpotifyError {
    Network(String),
    /// Access token expired or invalid (401 from a data endpoint).
    Unauthorized,
    /// Token exchange or refresh rejected by the accounts server.
    Auth(String),
    Upstream { status: u16, message: String },
}

impl std::fmt::Display for SpotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpotifyError::Network(msg) => write!(f, "Network error: {}", msg),
            SpotifyError::Unauthorized => write!(f, "Access token expired or invalid"),
            SpotifyError::Auth(msg) => write!(f, "Auth error: {}", msg),
            SpotifyError::Upstream { status, message } => {
                write!(f, "Spotify API error: {} - {}", status, message)
            }
        }
    }
}

impl std::error::Error for SpotifyError {}

/// Deduplicates ids (first occurrence wins), drops empties, caps at the
/// upstream batch limit.
pub fn dedupe_ids(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for id in ids {
        if id.is_empty() {
            continue;
        }
        if seen.insert(id.as_str()) {
            out.push(id.clone());
            if out.len() == FEATURE_BATCH_LIMIT {
                break;
            }
        }
    }
    out
}

fn upstream_error(status: reqwest::StatusCode, body: &str) -> SpotifyError {
    // Non-2xx responses carry {"error":{"message":...}}
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|json| {
            json.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(|m| m.to_string())
        })
        .unwrap_or_else(|| body.to_string());
    SpotifyError::Upstream {
        status: status.as_u16(),
        message,
    }
}

pub struct SpotifyAuthClient {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    client: reqwest::Client,
}

impl SpotifyAuthClient {
    pub fn new(client_id: String, client_secret: String, redirect_uri: String) -> Self {
        Self {
            client_id,
            client_secret,
            redirect_uri,
            client: reqwest::Client::new(),
        }
    }

    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant, SpotifyError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &self.redirect_uri),
        ])
        .await
    }

    pub async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenGrant, SpotifyError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenGrant, SpotifyError> {
        let auth = BASE64_STANDARD.encode(format!("{}:{}", self.client_id, self.client_secret));
        let url = format!("{}/api/token", ACCOUNTS_BASE);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Basic {}", auth))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .form(params)
            .send()
            .await
            .map_err(|e| SpotifyError::Network(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(SpotifyError::Auth(format!(
                "Token exchange failed: {} - {}",
                status, text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| SpotifyError::Network(format!("Parse failed: {}", e)))
    }
}

#[derive(Debug, Deserialize)]
struct RecentlyPlayedResponse {
    items: Vec<PlayHistoryItem>,
}

#[derive(Debug, Deserialize)]
struct PlayHistoryItem {
    track: Option<TrackObject>,
    played_at: String,
}

#[derive(Debug, Deserialize)]
struct TrackObject {
    id: Option<String>,
    name: String,
    artists: Vec<ArtistObject>,
    album: Option<AlbumObject>,
}

#[derive(Debug, Deserialize)]
struct ArtistObject {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AlbumObject {
    images: Option<Vec<ImageObject>>,
}

#[derive(Debug, Deserialize)]
struct ImageObject {
    url: String,
}

#[derive(Debug, Deserialize)]
struct AudioFeaturesResponse {
    audio_features: Vec<Option<AudioFeature>>,
}

pub struct SpotifyClient {
    client: reqwest::Client,
}

impl SpotifyClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Fetches the user's recent listening events, most-recent-first.
    /// Requires user-read-recently-played scope.
    pub async fn fetch_recent(
        &self,
        access_token: &str,
        limit: u32,
    ) -> Result<Vec<RawPlayEvent>, SpotifyError> {
        let url = format!("{}/me/player/recently-played?limit={}", API_BASE, limit);

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", access_token))
            .send()
            .await
            .map_err(|e| SpotifyError::Network(format!("Request failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SpotifyError::Unauthorized);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(upstream_error(status, &text));
        }

        let payload: RecentlyPlayedResponse = response
            .json()
            .await
            .map_err(|e| SpotifyError::Network(format!("Parse failed: {}", e)))?;

        let mut events = Vec::with_capacity(payload.items.len());
        for item in payload.items {
            let track = match item.track {
                Some(t) => t,
                None => continue,
            };
            // Local files come back without an id; they can't be joined
            // against audio features.
            let track_id = match track.id {
                Some(id) => id,
                None => {
                    warn!("Skipping play event without track id: {}", track.name);
                    continue;
                }
            };
            let played_at = match OffsetDateTime::parse(&item.played_at, &Rfc3339) {
                Ok(ts) => ts,
                Err(e) => {
                    warn!(
                        "Skipping play event with bad timestamp {}: {}",
                        item.played_at, e
                    );
                    continue;
                }
            };
            events.push(RawPlayEvent {
                track_id,
                track_name: track.name,
                artist_name: track
                    .artists
                    .first()
                    .map(|a| a.name.clone())
                    .unwrap_or_default(),
                played_at,
                album_cover_url: track
                    .album
                    .and_then(|a| a.images)
                    .and_then(|imgs| imgs.into_iter().next())
                    .map(|img| img.url),
            });
        }

        Ok(events)
    }

    /// Fetches audio features for the given track ids. The id set is deduped
    /// and capped at the upstream batch limit before the call; an empty set
    /// returns an empty sequence without touching the network. Returned
    /// entries are position-aligned with the deduped request and may contain
    /// holes for ids the provider doesn't know.
    pub async fn fetch_features(
        &self,
        access_token: &str,
        ids: &[String],
    ) -> Result<Vec<Option<AudioFeature>>, SpotifyError> {
        let ids = dedupe_ids(ids);
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/audio-features?ids={}", API_BASE, ids.join(","));

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", access_token))
            .send()
            .await
            .map_err(|e| SpotifyError::Network(format!("Request failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SpotifyError::Unauthorized);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(upstream_error(status, &text));
        }

        let payload: AudioFeaturesResponse = response
            .json()
            .await
            .map_err(|e| SpotifyError::Network(format!("Parse failed: {}", e)))?;

        Ok(payload.audio_features)
    }
}

impl Default for SpotifyClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn dedupe_ids_keeps_first_occurrence_in_order() {
        assert_eq!(
            dedupe_ids(&ids(&["a", "b", "a", "c", "b"])),
            ids(&["a", "b", "c"])
        );
    }

    #[test]
    fn dedupe_ids_drops_empty_ids() {
        assert_eq!(dedupe_ids(&ids(&["", "a", ""])), ids(&["a"]));
    }

    #[test]
    fn dedupe_ids_of_empty_set_is_empty() {
        assert!(dedupe_ids(&[]).is_empty());
    }

    #[test]
    fn dedupe_ids_caps_at_batch_limit() {
        let many: Vec<String> = (0..250).map(|i| format!("track{}", i % 120)).collect();
        let deduped = dedupe_ids(&many);
        assert_eq!(deduped.len(), FEATURE_BATCH_LIMIT);
        assert_eq!(deduped[0], "track0");
        assert_eq!(deduped[99], "track99");
    }

    #[test]
    fn upstream_error_extracts_provider_message() {
        let err = upstream_error(
            reqwest::StatusCode::FORBIDDEN,
            r#"{"error":{"status":403,"message":"Insufficient client scope"}}"#,
        );
        match err {
            SpotifyError::Upstream { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "Insufficient client scope");
            }
            other => panic!("expected Upstream, got {:?}", other),
        }
    }

    #[test]
    fn upstream_error_falls_back_to_raw_body() {
        let err = upstream_error(reqwest::StatusCode::BAD_GATEWAY, "<html>nope</html>");
        match err {
            SpotifyError::Upstream { status, message } => {
                assert_eq!(status, 502);
                assert_eq!(message, "<html>nope</html>");
            }
            other => panic!("expected Upstream, got {:?}", other),
        }
    }

    #[test]
    fn recently_played_payload_maps_to_events() {
        let body = r#"{
            "items": [
                {
                    "track": {
                        "id": "t1",
                        "name": "Helicopter",
                        "artists": [{"name": "Bloc Party"}],
                        "album": {"images": [{"url": "https://img/cover1"}]}
                    },
                    "played_at": "2024-03-01T12:30:00Z"
                },
                {
                    "track": {
                        "id": null,
                        "name": "Local File",
                        "artists": [],
                        "album": null
                    },
                    "played_at": "2024-03-01T12:00:00Z"
                }
            ]
        }"#;
        let payload: RecentlyPlayedResponse = serde_json::from_str(body).unwrap();
        assert_eq!(payload.items.len(), 2);
        let track = payload.items[0].track.as_ref().unwrap();
        assert_eq!(track.id.as_deref(), Some("t1"));
        assert!(payload.items[1].track.as_ref().unwrap().id.is_none());
    }

    #[test]
    fn audio_features_payload_preserves_holes() {
        let body = r#"{
            "audio_features": [
                {"id": "t1", "valence": 0.5, "energy": 0.8, "danceability": 0.6},
                null
            ]
        }"#;
        let payload: AudioFeaturesResponse = serde_json::from_str(body).unwrap();
        assert_eq!(payload.audio_features.len(), 2);
        assert!(payload.audio_features[0].is_some());
        assert!(payload.audio_features[1].is_none());
    }
}
