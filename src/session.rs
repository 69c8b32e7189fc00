use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::aggregate::{aggregate, EnrichedTrack, ListeningSource};
use crate::spotify::{SpotifyAuthClient, SpotifyError, TokenGrant, ACCOUNTS_BASE};

/// Storage keys for the persisted credential. The credential is the only
/// state that outlives a page, and it is read/write exclusive to this module.
pub const ACCESS_TOKEN_KEY: &str = "spotify_access_token";
pub const REFRESH_TOKEN_KEY: &str = "spotify_refresh_token";

/// Scopes requested on the consent screen.
pub const LOGIN_SCOPES: &str = "user-read-recently-played user-top-read user-library-read";

const TOKEN_PARAMS: [&str; 3] = ["access_token", "refresh_token", "expires_in"];

#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

#[derive(Debug)]
pub enum RefreshError {
    NoRefreshToken,
    Exchange(SpotifyError),
}

impl std::fmt::Display for RefreshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshError::NoRefreshToken => write!(f, "No refresh token stored"),
            RefreshError::Exchange(e) => write!(f, "Refresh exchange failed: {}", e),
        }
    }
}

impl std::error::Error for RefreshError {}

/// Seam over the refresh exchange so the retry cycle is testable without the
/// accounts server.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, SpotifyError>;
}

#[async_trait]
impl TokenRefresher for SpotifyAuthClient {
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, SpotifyError> {
        SpotifyAuthClient::refresh_access_token(self, refresh_token).await
    }
}

/// Session-scoped credential store: exactly two string values under fixed
/// keys, no expiry metadata.
pub struct TokenStore {
    values: DashMap<String, String>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
        }
    }

    pub fn save(&self, credential: &Credential) {
        self.values
            .insert(ACCESS_TOKEN_KEY.to_string(), credential.access_token.clone());
        if let Some(ref refresh_token) = credential.refresh_token {
            self.values
                .insert(REFRESH_TOKEN_KEY.to_string(), refresh_token.clone());
        }
    }

    pub fn load(&self) -> Option<Credential> {
        let access_token = self.values.get(ACCESS_TOKEN_KEY)?.clone();
        Some(Credential {
            access_token,
            refresh_token: self.values.get(REFRESH_TOKEN_KEY).map(|v| v.clone()),
            expires_in: None,
        })
    }

    pub fn clear(&self) {
        self.values.remove(ACCESS_TOKEN_KEY);
        self.values.remove(REFRESH_TOKEN_KEY);
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Bootstrap {
    pub credential: Option<Credential>,
    /// The incoming URL with token parameters stripped.
    pub sanitized_url: String,
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|kv| !kv.is_empty())
        .map(|kv| {
            let mut parts = kv.splitn(2, '=');
            let key = parts.next().unwrap_or("");
            let value = parts.next().unwrap_or("");
            (
                urlencoding::decode(key)
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| key.to_string()),
                urlencoding::decode(value)
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| value.to_string()),
            )
        })
        .collect()
}

fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
        .filter(|v| !v.is_empty())
}

/// Adopts tokens arriving via URL parameters, persisting them and stripping
/// them from the URL so they don't leak through history or referrers. Falls
/// back to a previously persisted credential; returns no credential when
/// neither source has one.
pub fn bootstrap(url: &str, store: &TokenStore) -> Bootstrap {
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base, query),
        None => (url, ""),
    };
    let params = parse_query(query);

    let access_token = match param(&params, "access_token") {
        Some(token) => token.to_string(),
        None => {
            return Bootstrap {
                credential: store.load(),
                sanitized_url: url.to_string(),
            }
        }
    };

    let credential = Credential {
        access_token,
        refresh_token: param(&params, "refresh_token").map(|v| v.to_string()),
        expires_in: param(&params, "expires_in").and_then(|v| v.parse().ok()),
    };
    store.save(&credential);

    let kept: Vec<String> = params
        .iter()
        .filter(|(k, _)| !TOKEN_PARAMS.contains(&k.as_str()))
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect();
    let sanitized_url = if kept.is_empty() {
        base.to_string()
    } else {
        format!("{}?{}", base, kept.join("&"))
    };

    Bootstrap {
        credential: Some(credential),
        sanitized_url,
    }
}

/// The Authorization Server consent URL for the interactive login redirect.
pub fn login_url(client_id: &str, redirect_uri: &str) -> String {
    format!(
        "{}/authorize?response_type=code&client_id={}&scope={}&redirect_uri={}",
        ACCOUNTS_BASE,
        urlencoding::encode(client_id),
        urlencoding::encode(LOGIN_SCOPES),
        urlencoding::encode(redirect_uri)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    LoggedOut,
    Authenticated,
    Refreshing,
}

/// Liveness flag scoped to one aggregation cycle. A newer cycle supersedes
/// every guard handed out before it; superseded results must be discarded,
/// not applied.
pub struct CycleGuard {
    generation: Arc<AtomicU64>,
    started: u64,
}

impl CycleGuard {
    pub fn is_live(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.started
    }
}

#[derive(Debug)]
pub enum CycleError {
    LoggedOut,
    /// The retried fetch came back 401 again; terminal for this cycle.
    Unauthorized,
    Refresh(RefreshError),
    Spotify(SpotifyError),
}

impl std::fmt::Display for CycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleError::LoggedOut => write!(f, "Not logged in"),
            CycleError::Unauthorized => write!(f, "Access token rejected after refresh"),
            CycleError::Refresh(e) => write!(f, "{}", e),
            CycleError::Spotify(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CycleError {}

#[derive(Debug)]
pub enum CycleOutcome {
    Completed(Vec<EnrichedTrack>),
    /// A newer cycle started while this one was in flight; its results were
    /// discarded.
    Superseded,
}

/// One user session: the credential store, the auth state machine, and the
/// cycle generation counter. Only one aggregation cycle is applied at a time;
/// re-entrant triggers supersede the in-flight one.
pub struct Session {
    store: TokenStore,
    state: Mutex<SessionState>,
    generation: Arc<AtomicU64>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            store: TokenStore::new(),
            state: Mutex::new(SessionState::LoggedOut),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Bootstraps the session from an incoming URL, moving to Authenticated
    /// when a credential is found.
    pub fn bootstrap(&self, url: &str) -> Bootstrap {
        let result = bootstrap(url, &self.store);
        self.set_state(if result.credential.is_some() {
            SessionState::Authenticated
        } else {
            SessionState::LoggedOut
        });
        result
    }

    pub fn begin_cycle(&self) -> CycleGuard {
        let started = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        CycleGuard {
            generation: Arc::clone(&self.generation),
            started,
        }
    }

    /// Exchanges the stored refresh token for a new access token. On failure
    /// the store is cleared and the session returns to logged-out; the caller
    /// treats that as "must re-login".
    pub async fn refresh<R>(&self, refresher: &R) -> Result<Credential, RefreshError>
    where
        R: TokenRefresher + ?Sized,
    {
        let stored = self.store.load();
        let refresh_token = match stored.and_then(|c| c.refresh_token) {
            Some(token) => token,
            None => {
                self.set_state(SessionState::LoggedOut);
                return Err(RefreshError::NoRefreshToken);
            }
        };

        self.set_state(SessionState::Refreshing);
        match refresher.refresh_access_token(&refresh_token).await {
            Ok(grant) => {
                // The provider may omit the refresh token on a refresh grant;
                // the old one stays valid.
                let credential = Credential {
                    access_token: grant.access_token,
                    refresh_token: grant.refresh_token.or(Some(refresh_token)),
                    expires_in: Some(grant.expires_in),
                };
                self.store.save(&credential);
                self.set_state(SessionState::Authenticated);
                info!("Access token refreshed");
                Ok(credential)
            }
            Err(e) => {
                warn!("Refresh exchange failed: {}", e);
                self.store.clear();
                self.set_state(SessionState::LoggedOut);
                Err(RefreshError::Exchange(e))
            }
        }
    }

    /// Runs one aggregation cycle. On Unauthorized, refreshes once and
    /// retries once; a second Unauthorized is terminal. Results from a cycle
    /// superseded mid-flight are discarded.
    pub async fn run_cycle<S, R>(
        &self,
        source: &S,
        refresher: &R,
        limit: u32,
    ) -> Result<CycleOutcome, CycleError>
    where
        S: ListeningSource + ?Sized,
        R: TokenRefresher + ?Sized,
    {
        let guard = self.begin_cycle();
        let access_token = match self.store.load() {
            Some(credential) => credential.access_token,
            None => return Err(CycleError::LoggedOut),
        };

        let tracks = match aggregate(source, &access_token, limit).await {
            Ok(tracks) => tracks,
            Err(SpotifyError::Unauthorized) => {
                let credential = self
                    .refresh(refresher)
                    .await
                    .map_err(CycleError::Refresh)?;
                match aggregate(source, &credential.access_token, limit).await {
                    Ok(tracks) => tracks,
                    Err(SpotifyError::Unauthorized) => return Err(CycleError::Unauthorized),
                    Err(e) => return Err(CycleError::Spotify(e)),
                }
            }
            Err(e) => return Err(CycleError::Spotify(e)),
        };

        if !guard.is_live() {
            info!("Discarding results from superseded cycle");
            return Ok(CycleOutcome::Superseded);
        }
        Ok(CycleOutcome::Completed(tracks))
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
