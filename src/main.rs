mod aggregate;
mod reflect;
mod session;
mod spotify;
mod types;

use axum::{
    extract::{Query, RawQuery, State},
    http::StatusCode,
    response::{Json, Redirect},
    routing::{get, post},
    Router,
};
use reflect::{fallback_reflection, ReflectionClient};
use serde_json::{json, Value};
use session::{login_url, CycleError, CycleOutcome, Session};
use spotify::{SpotifyAuthClient, SpotifyClient};
use std::sync::Arc;
use tracing::{error, info, warn};
use types::{CallbackParams, MoodDataParams, RefreshParams, ReflectionRequest, ReflectionResponse};

#[derive(Clone)]
struct AppState {
    auth: Arc<SpotifyAuthClient>,
    spotify: Arc<SpotifyClient>,
    reflection: Option<Arc<ReflectionClient>>,
    config: Config,
}

#[derive(Clone)]
struct Config {
    client_id: String,
    redirect_uri: String,
    frontend_uri: String,
    recent_limit: u32,
}

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "moodtrace=info".into()),
        )
        .init();

    // Read configuration
    let client_id =
        std::env::var("SPOTIFY_CLIENT_ID").expect("SPOTIFY_CLIENT_ID must be set in .env file");
    let client_secret = std::env::var("SPOTIFY_CLIENT_SECRET")
        .expect("SPOTIFY_CLIENT_SECRET must be set in .env file");

    let port = std::env::var("PORT")
        .unwrap_or_else(|_| "4000".to_string())
        .parse::<u16>()
        .expect("PORT must be a valid u16");
    let redirect_uri = std::env::var("SPOTIFY_REDIRECT_URI").unwrap_or_else(|_| {
        let fallback = format!("http://127.0.0.1:{}/callback", port);
        warn!("SPOTIFY_REDIRECT_URI not set, defaulting to {}", fallback);
        fallback
    });
    let frontend_uri = std::env::var("FRONTEND_URI").unwrap_or_else(|_| {
        warn!("FRONTEND_URI not set, defaulting to http://127.0.0.1:3000");
        "http://127.0.0.1:3000".to_string()
    });
    let recent_limit = std::env::var("RECENT_LIMIT")
        .unwrap_or_else(|_| "20".to_string())
        .parse::<u32>()
        .expect("RECENT_LIMIT must be a valid u32");

    // Completion API key (optional - reflections fall back to canned text)
    let openai_api_key = std::env::var("OPENAI_API_KEY").unwrap_or_else(|_| {
        eprintln!("\n⚠️  WARNING: OPENAI_API_KEY not set");
        eprintln!("   The server will start but mood reflections will use canned text.");
        eprintln!("   Get a key from: https://platform.openai.com/api-keys\n");
        String::new()
    });
    let openai_model =
        std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-3.5-turbo".to_string());

    // Initialize clients
    let auth = Arc::new(SpotifyAuthClient::new(
        client_id.clone(),
        client_secret,
        redirect_uri.clone(),
    ));
    let reflection = if openai_api_key.is_empty() {
        None
    } else {
        Some(Arc::new(ReflectionClient::new(openai_api_key, openai_model)))
    };

    let config = Config {
        client_id,
        redirect_uri,
        frontend_uri,
        recent_limit,
    };

    let state = AppState {
        auth,
        spotify: Arc::new(SpotifyClient::new()),
        reflection,
        config,
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/login", get(login_handler))
        .route("/callback", get(callback_handler))
        .route("/refresh_token", get(refresh_handler))
        .route("/mood-data", get(mood_data_handler))
        .route("/generate-reflection", post(generate_reflection_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state);

    // Start server
    let addr = format!("0.0.0.0:{}", port);
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn login_handler(State(state): State<AppState>) -> Redirect {
    let url = login_url(&state.config.client_id, &state.config.redirect_uri);
    info!("Redirecting to Spotify consent screen");
    Redirect::temporary(&url)
}

fn token_failure() -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "Failed to get tokens"})),
    )
}

async fn callback_handler(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Result<Redirect, (StatusCode, Json<Value>)> {
    if let Some(error) = params.error {
        warn!("Authorization denied by provider: {}", error);
        return Err(token_failure());
    }
    let code = match params.code {
        Some(code) => code,
        None => {
            warn!("Callback hit without a code");
            return Err(token_failure());
        }
    };

    match state.auth.exchange_code(&code).await {
        Ok(grant) => {
            // Tokens travel to the frontend as query parameters; its
            // bootstrap strips them from the visible URL.
            let mut params = vec![format!(
                "access_token={}",
                urlencoding::encode(&grant.access_token)
            )];
            if let Some(ref refresh_token) = grant.refresh_token {
                params.push(format!(
                    "refresh_token={}",
                    urlencoding::encode(refresh_token)
                ));
            }
            params.push(format!("expires_in={}", grant.expires_in));

            let target = format!("{}/?{}", state.config.frontend_uri, params.join("&"));
            Ok(Redirect::temporary(&target))
        }
        Err(e) => {
            error!("Error getting tokens: {}", e);
            Err(token_failure())
        }
    }
}

async fn refresh_handler(
    State(state): State<AppState>,
    Query(params): Query<RefreshParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let refresh_failure = || {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Failed to refresh token"})),
        )
    };

    let refresh_token = match params.refresh_token {
        Some(token) if !token.is_empty() => token,
        _ => {
            warn!("refresh_token query parameter missing");
            return Err(refresh_failure());
        }
    };

    match state.auth.refresh_access_token(&refresh_token).await {
        Ok(grant) => Ok(Json(json!({"access_token": grant.access_token}))),
        Err(e) => {
            error!("Error refreshing token: {}", e);
            Err(refresh_failure())
        }
    }
}

/// Runs one aggregation cycle for the caller's tokens: recent plays joined
/// with audio features, with a single refresh-and-retry on an expired access
/// token. The response carries the (possibly refreshed) access token so the
/// frontend can re-persist it.
async fn mood_data_handler(
    State(state): State<AppState>,
    Query(params): Query<MoodDataParams>,
    RawQuery(query): RawQuery,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let session = Session::new();
    let url = format!("/mood-data?{}", query.unwrap_or_default());
    if session.bootstrap(&url).credential.is_none() {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Not logged in"})),
        ));
    }

    let limit = params.limit.unwrap_or(state.config.recent_limit);
    match session
        .run_cycle(&*state.spotify, &*state.auth, limit)
        .await
    {
        Ok(CycleOutcome::Completed(tracks)) => {
            let access_token = session
                .store()
                .load()
                .map(|c| c.access_token)
                .unwrap_or_default();
            Ok(Json(json!({"tracks": tracks, "access_token": access_token})))
        }
        Ok(CycleOutcome::Superseded) => Err((
            StatusCode::CONFLICT,
            Json(json!({"error": "Superseded by a newer cycle"})),
        )),
        Err(CycleError::LoggedOut)
        | Err(CycleError::Unauthorized)
        | Err(CycleError::Refresh(_)) => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Please log in again"})),
        )),
        Err(CycleError::Spotify(e)) => {
            warn!("Aggregation cycle failed: {}", e);
            Err((
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "Failed to fetch listening data. Please try again."})),
            ))
        }
    }
}

async fn generate_reflection_handler(
    State(state): State<AppState>,
    Json(request): Json<ReflectionRequest>,
) -> Result<Json<ReflectionResponse>, (StatusCode, Json<Value>)> {
    let tracks = match request.tracks {
        Some(tracks) => tracks,
        None => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Missing or invalid tracks"})),
            ))
        }
    };

    // Generation failures are masked with canned text; this endpoint never
    // surfaces a raw provider error.
    let message = match &state.reflection {
        Some(client) => client.generate_with_fallback(&tracks).await,
        None => {
            warn!("OPENAI_API_KEY not configured, serving canned reflection");
            fallback_reflection(tracks.len()).to_string()
        }
    };

    Ok(Json(ReflectionResponse { message }))
}
