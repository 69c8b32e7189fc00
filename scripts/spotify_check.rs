// Quick diagnostic: test Spotify token refresh and the listening-data endpoints
// Run: cargo run --bin spotify_check

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let client_id = std::env::var("SPOTIFY_CLIENT_ID").expect("SPOTIFY_CLIENT_ID");
    let client_secret = std::env::var("SPOTIFY_CLIENT_SECRET").expect("SPOTIFY_CLIENT_SECRET");
    let refresh_token = std::env::var("SPOTIFY_REFRESH_TOKEN").expect("SPOTIFY_REFRESH_TOKEN");

    let client = reqwest::Client::new();

    // 1. Get access token
    println!("1. Refreshing token...");
    let auth = BASE64_STANDARD.encode(format!("{}:{}", client_id, client_secret));
    let token_resp = client
        .post("https://accounts.spotify.com/api/token")
        .header("Authorization", format!("Basic {}", auth))
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", &refresh_token),
        ])
        .send()
        .await
        .expect("token request failed");

    let token_status = token_resp.status();
    let token_body = token_resp.text().await.unwrap_or_default();

    if !token_status.is_success() {
        println!(
            "   FAIL: Token refresh returned {}:\n{}",
            token_status, token_body
        );
        return;
    }

    let token_json: serde_json::Value = serde_json::from_str(&token_body).expect("parse token");
    let access_token = token_json["access_token"].as_str().expect("access_token");
    let scopes = token_json["scope"].as_str().unwrap_or("(not in response)");
    println!("   OK. Scopes in token: {}", scopes);

    // 2. Get current user (verify token works)
    println!("\n2. Getting current user (GET /v1/me)...");
    let me_resp = client
        .get("https://api.spotify.com/v1/me")
        .header("Authorization", format!("Bearer {}", access_token))
        .send()
        .await
        .expect("me request failed");

    let me_status = me_resp.status();
    let me_body = me_resp.text().await.unwrap_or_default();

    if !me_status.is_success() {
        println!("   FAIL: {} - {}", me_status, me_body);
        return;
    }
    let me_json: serde_json::Value = serde_json::from_str(&me_body).expect("parse me");
    println!(
        "   OK. User: {} ({})",
        me_json["display_name"].as_str().unwrap_or("?"),
        me_json["id"].as_str().unwrap_or("?")
    );

    // 3. Fetch recent plays (needs user-read-recently-played)
    println!("\n3. Fetching recently played (GET /v1/me/player/recently-played)...");
    let recent_resp = client
        .get("https://api.spotify.com/v1/me/player/recently-played?limit=5")
        .header("Authorization", format!("Bearer {}", access_token))
        .send()
        .await
        .expect("recently-played request failed");

    let recent_status = recent_resp.status();
    let recent_body = recent_resp.text().await.unwrap_or_default();

    if !recent_status.is_success() {
        println!("   FAIL: {} - {}", recent_status, recent_body);
        return;
    }

    let recent_json: serde_json::Value =
        serde_json::from_str(&recent_body).expect("parse recently-played");
    let items = recent_json["items"].as_array().cloned().unwrap_or_default();
    println!("   OK. {} play event(s):", items.len());

    let mut track_ids = Vec::new();
    for item in &items {
        let name = item["track"]["name"].as_str().unwrap_or("?");
        let artist = item["track"]["artists"][0]["name"].as_str().unwrap_or("?");
        let played_at = item["played_at"].as_str().unwrap_or("?");
        println!("      {} - {} ({})", artist, name, played_at);
        if let Some(id) = item["track"]["id"].as_str() {
            track_ids.push(id.to_string());
        }
    }

    if track_ids.is_empty() {
        println!("\n4. No track ids to look up audio features for - done.");
        return;
    }

    // 4. Fetch audio features for those tracks
    println!(
        "\n4. Fetching audio features for {} track(s) (GET /v1/audio-features)...",
        track_ids.len()
    );
    let features_resp = client
        .get(format!(
            "https://api.spotify.com/v1/audio-features?ids={}",
            track_ids.join(",")
        ))
        .header("Authorization", format!("Bearer {}", access_token))
        .send()
        .await
        .expect("audio-features request failed");

    let features_status = features_resp.status();
    let features_body = features_resp.text().await.unwrap_or_default();

    if !features_status.is_success() {
        println!("   FAIL: {} - {}", features_status, features_body);
        return;
    }

    let features_json: serde_json::Value =
        serde_json::from_str(&features_body).expect("parse audio-features");
    let features = features_json["audio_features"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    let holes = features.iter().filter(|f| f.is_null()).count();
    println!("   OK. {} feature entries, {} hole(s):", features.len(), holes);
    for feature in features.iter().filter(|f| !f.is_null()) {
        println!(
            "      {}: valence={} energy={} danceability={}",
            feature["id"].as_str().unwrap_or("?"),
            feature["valence"],
            feature["energy"],
            feature["danceability"]
        );
    }

    println!("\n   SUCCESS - all listening-data endpoints reachable.");
}
