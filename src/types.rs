use serde::{Deserialize, Serialize};

use crate::aggregate::EnrichedTrack;

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshParams {
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MoodDataParams {
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ReflectionRequest {
    pub tracks: Option<Vec<TrackPayload>>,
}

#[derive(Debug, Serialize)]
pub struct ReflectionResponse {
    pub message: String,
}

/// Track shape the frontend posts back for reflection; extra fields from the
/// enriched track JSON are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackPayload {
    pub name: String,
    pub artist: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,
}

impl From<&EnrichedTrack> for TrackPayload {
    fn from(track: &EnrichedTrack) -> Self {
        Self {
            name: track.name.clone(),
            artist: track.artist.clone(),
            valence: track.valence,
            energy: track.energy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn enriched_track_converts_to_reflection_payload() {
        let enriched = EnrichedTrack {
            id: "t1".to_string(),
            name: "Helicopter".to_string(),
            artist: "Bloc Party".to_string(),
            played_at: datetime!(2024-03-01 12:00 UTC),
            album_cover_url: Some("https://img/cover".to_string()),
            valence: Some(0.4),
            energy: Some(0.9),
            danceability: None,
        };

        let payload = TrackPayload::from(&enriched);
        assert_eq!(payload.name, "Helicopter");
        assert_eq!(payload.artist, "Bloc Party");
        assert_eq!(payload.valence, Some(0.4));
        assert_eq!(payload.energy, Some(0.9));
    }

    #[test]
    fn reflection_request_tolerates_extra_track_fields() {
        let body = r#"{
            "tracks": [
                {
                    "id": "t1",
                    "name": "Helicopter",
                    "artist": "Bloc Party",
                    "played_at": "2024-03-01T12:00:00Z",
                    "valence": 0.4,
                    "energy": 0.9,
                    "danceability": 0.7
                }
            ]
        }"#;
        let request: ReflectionRequest = serde_json::from_str(body).unwrap();
        let tracks = request.tracks.unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].valence, Some(0.4));
    }

    #[test]
    fn reflection_request_without_tracks_is_none() {
        let request: ReflectionRequest = serde_json::from_str("{}").unwrap();
        assert!(request.tracks.is_none());
    }
}
