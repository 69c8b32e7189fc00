use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use time::OffsetDateTime;

use crate::spotify::{AudioFeature, RawPlayEvent, SpotifyClient, SpotifyError};

/// A play event joined with its audio features. Feature fields are absent
/// when the lookup had no matching entry; that is a gap in the chart, never
/// a failure.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichedTrack {
    pub id: String,
    pub name: String,
    pub artist: String,
    #[serde(with = "time::serde::rfc3339")]
    pub played_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album_cover_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub danceability: Option<f64>,
}

/// Seam over the history and feature endpoints so the aggregation and the
/// refresh-retry cycle can be exercised against a scripted source.
#[async_trait]
pub trait ListeningSource: Send + Sync {
    async fn fetch_recent(
        &self,
        access_token: &str,
        limit: u32,
    ) -> Result<Vec<RawPlayEvent>, SpotifyError>;

    async fn fetch_features(
        &self,
        access_token: &str,
        ids: &[String],
    ) -> Result<Vec<Option<AudioFeature>>, SpotifyError>;
}

#[async_trait]
impl ListeningSource for SpotifyClient {
    async fn fetch_recent(
        &self,
        access_token: &str,
        limit: u32,
    ) -> Result<Vec<RawPlayEvent>, SpotifyError> {
        SpotifyClient::fetch_recent(self, access_token, limit).await
    }

    async fn fetch_features(
        &self,
        access_token: &str,
        ids: &[String],
    ) -> Result<Vec<Option<AudioFeature>>, SpotifyError> {
        SpotifyClient::fetch_features(self, access_token, ids).await
    }
}

/// Joins play events with their features by track id. Output length and
/// ordering match the input events exactly; duplicate plays of one track
/// share the same feature entry.
pub fn enrich(events: Vec<RawPlayEvent>, features: &[Option<AudioFeature>]) -> Vec<EnrichedTrack> {
    let by_id: HashMap<&str, &AudioFeature> = features
        .iter()
        .flatten()
        .map(|f| (f.id.as_str(), f))
        .collect();

    events
        .into_iter()
        .map(|event| {
            let feature = by_id.get(event.track_id.as_str());
            EnrichedTrack {
                id: event.track_id,
                name: event.track_name,
                artist: event.artist_name,
                played_at: event.played_at,
                album_cover_url: event.album_cover_url,
                valence: feature.map(|f| f.valence),
                energy: feature.map(|f| f.energy),
                danceability: feature.map(|f| f.danceability),
            }
        })
        .collect()
}

/// One aggregation pass: recent plays, then features for their ids, then the
/// join. Unauthorized propagates so the caller can refresh and retry.
pub async fn aggregate<S>(
    source: &S,
    access_token: &str,
    limit: u32,
) -> Result<Vec<EnrichedTrack>, SpotifyError>
where
    S: ListeningSource + ?Sized,
{
    let events = source.fetch_recent(access_token, limit).await?;
    let ids: Vec<String> = events.iter().map(|e| e.track_id.clone()).collect();
    let features = source.fetch_features(access_token, &ids).await?;
    Ok(enrich(events, &features))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn event(id: &str, name: &str, minute: u8) -> RawPlayEvent {
        RawPlayEvent {
            track_id: id.to_string(),
            track_name: name.to_string(),
            artist_name: "Artist".to_string(),
            played_at: datetime!(2024-03-01 12:00 UTC) + time::Duration::minutes(minute as i64),
            album_cover_url: None,
        }
    }

    fn feature(id: &str, valence: f64) -> AudioFeature {
        AudioFeature {
            id: id.to_string(),
            valence,
            energy: 0.5,
            danceability: 0.5,
        }
    }

    #[test]
    fn enrich_preserves_event_length_and_order() {
        let events = vec![event("a", "A", 2), event("b", "B", 1), event("c", "C", 0)];
        let features = vec![Some(feature("a", 0.1)), Some(feature("b", 0.2)), None];

        let enriched = enrich(events, &features);

        assert_eq!(enriched.len(), 3);
        assert_eq!(enriched[0].id, "a");
        assert_eq!(enriched[1].id, "b");
        assert_eq!(enriched[2].id, "c");
    }

    #[test]
    fn enrich_maps_holes_to_absent_features() {
        let events = vec![event("a", "A", 0), event("unknown", "U", 1)];
        let features = vec![Some(feature("a", 0.9)), None];

        let enriched = enrich(events, &features);

        assert_eq!(enriched[0].valence, Some(0.9));
        assert!(enriched[1].valence.is_none());
        assert!(enriched[1].energy.is_none());
        assert!(enriched[1].danceability.is_none());
    }

    #[test]
    fn enrich_shares_features_across_duplicate_plays() {
        // Provider doesn't dedupe the history; the feature request does.
        let events = vec![event("a", "A", 0), event("a", "A", 5)];
        let features = vec![Some(feature("a", 0.7))];

        let enriched = enrich(events, &features);

        assert_eq!(enriched.len(), 2);
        assert_eq!(enriched[0].valence, Some(0.7));
        assert_eq!(enriched[1].valence, Some(0.7));
    }

    #[test]
    fn enrich_of_no_events_is_empty() {
        let enriched = enrich(Vec::new(), &[]);
        assert!(enriched.is_empty());
    }
}
