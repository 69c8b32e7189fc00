use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::TrackPayload;

const COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";
const TEMPERATURE: f32 = 0.7;

/// Canned reflections substituted when the completion call fails, so the UI
/// stays non-blocking and never shows a raw provider error.
pub const FALLBACK_REFLECTIONS: [&str; 3] = [
    "Your recent listening has its own quiet rhythm, and that says something good about how \
     you're moving through your days. Whatever the mix of moods, you're giving yourself room \
     to feel them - keep doing that.",
    "Looking at the songs you've been drawn to lately, there's a real range of feeling in \
     there. Music like that usually means you're processing things in a healthy way, so be \
     gentle with yourself and let the soundtrack carry you.",
    "Your recent tracks trace a little emotional journey, with ups and downs that feel very \
     human. Take it as a reminder that every mood passes, and you clearly know how to find \
     the right song for each one.",
];

#[derive(Debug)]
pub enum GenerationError {
    Network(String),
    RateLimited,
    Api { status: u16, message: String },
    /// The completion came back without usable text.
    Empty,
}

impl std::fmt::Display for GenerationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationError::Network(msg) => write!(f, "Network error: {}", msg),
            GenerationError::RateLimited => write!(f, "Completion API rate limited"),
            GenerationError::Api { status, message } => {
                write!(f, "Completion API error: {} - {}", status, message)
            }
            GenerationError::Empty => write!(f, "Completion contained no text"),
        }
    }
}

impl std::error::Error for GenerationError {}

fn format_score(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.2}", v),
        None => "n/a".to_string(),
    }
}

/// Deterministic per-track summary, one line per track in input order.
pub fn summarize(tracks: &[TrackPayload]) -> String {
    tracks
        .iter()
        .map(|t| {
            format!(
                "{} by {} - valence: {}, energy: {}",
                t.name,
                t.artist,
                format_score(t.valence),
                format_score(t.energy)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_prompt(summary: &str) -> String {
    format!(
        "You're an empathetic AI mood companion. A user listened to these tracks recently:\n\n\
         {}\n\n\
         Based on the audio features (valence = happiness, energy = activity), reflect on the \
         emotional state of the listener in a short, supportive paragraph. Be friendly, \
         insightful, and gentle.",
        summary
    )
}

/// Deterministic pick from the canned set, keyed off the track count.
pub fn fallback_reflection(track_count: usize) -> &'static str {
    FALLBACK_REFLECTIONS[track_count % FALLBACK_REFLECTIONS.len()]
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

pub struct ReflectionClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl ReflectionClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }

    /// Submits the fixed prompt built from the track summary and returns the
    /// completion text.
    pub async fn generate(&self, tracks: &[TrackPayload]) -> Result<String, GenerationError> {
        let prompt = build_prompt(&summarize(tracks));
        let payload = CompletionRequest {
            model: &self.model,
            messages: vec![Message {
                role: "user",
                content: &prompt,
            }],
            temperature: TEMPERATURE,
        };

        let response = self
            .client
            .post(COMPLETIONS_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| GenerationError::Network(format!("Request failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GenerationError::RateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|json| {
                    json.get("error")
                        .and_then(|e| e.get("message"))
                        .and_then(|m| m.as_str())
                        .map(|m| m.to_string())
                })
                .unwrap_or(text);
            return Err(GenerationError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Network(format!("Parse failed: {}", e)))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or(GenerationError::Empty)
    }

    /// Like generate, but masks failures with a canned reflection; never
    /// returns an empty string.
    pub async fn generate_with_fallback(&self, tracks: &[TrackPayload]) -> String {
        match self.generate(tracks).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Reflection generation failed, using fallback: {}", e);
                fallback_reflection(tracks.len()).to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(name: &str, artist: &str, valence: Option<f64>, energy: Option<f64>) -> TrackPayload {
        TrackPayload {
            name: name.to_string(),
            artist: artist.to_string(),
            valence,
            energy,
        }
    }

    #[test]
    fn summarize_formats_scores_to_two_decimals() {
        let tracks = vec![track("A", "B", Some(0.5), Some(0.333))];
        assert_eq!(summarize(&tracks), "A by B - valence: 0.50, energy: 0.33");
    }

    #[test]
    fn summarize_joins_lines_in_input_order() {
        let tracks = vec![
            track("First", "X", Some(0.1), Some(0.2)),
            track("Second", "Y", Some(0.9), Some(0.8)),
        ];
        assert_eq!(
            summarize(&tracks),
            "First by X - valence: 0.10, energy: 0.20\nSecond by Y - valence: 0.90, energy: 0.80"
        );
    }

    #[test]
    fn summarize_marks_missing_features() {
        let tracks = vec![track("Hole", "Z", None, Some(0.25))];
        assert_eq!(summarize(&tracks), "Hole by Z - valence: n/a, energy: 0.25");
    }

    #[test]
    fn summarize_of_no_tracks_is_empty() {
        assert_eq!(summarize(&[]), "");
    }

    #[test]
    fn prompt_embeds_summary_and_framing() {
        let tracks = vec![track("A", "B", Some(0.5), Some(0.5))];
        let prompt = build_prompt(&summarize(&tracks));
        assert!(prompt.contains("empathetic AI mood companion"));
        assert!(prompt.contains("A by B - valence: 0.50, energy: 0.50"));
        assert!(prompt.contains("short, supportive paragraph"));
    }

    #[test]
    fn fallback_reflection_is_always_a_canned_string() {
        for count in 0..10 {
            let text = fallback_reflection(count);
            assert!(!text.is_empty());
            assert!(FALLBACK_REFLECTIONS.contains(&text));
        }
    }

    #[test]
    fn fallback_selection_is_deterministic() {
        assert_eq!(fallback_reflection(4), fallback_reflection(4));
        assert_eq!(fallback_reflection(0), FALLBACK_REFLECTIONS[0]);
        assert_eq!(fallback_reflection(5), FALLBACK_REFLECTIONS[2]);
    }
}
