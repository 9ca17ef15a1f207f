//! Control and proxy endpoints.
//!
//! All handlers are thin: session issuance, the ICE config cache, the
//! integration test, catalog proxies, audio identification, and the admin
//! read surface. Third-party failures degrade to empty payloads; they are
//! never fatal.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Path, Query, State};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::AppState;
use crate::error::{CastError, CastResult};
use crate::protocol_constants::{ICE_CACHE_TTL_SECS, MAX_IDENTIFY_BODY, SESSION_TTL_SECS};
use crate::session::{constant_time_eq, Session, SESSION_COOKIE};
use crate::source_client::{self, SourceCredentials, SourceKind};

/// Public catalog the search/detail proxies talk to.
const CATALOG_API_BASE: &str = "https://api.deezer.com";

/// Fingerprinting collaborator for `/api/identify-audio`.
const FINGERPRINT_API_URL: &str = "https://api.acoustid.org/v2/lookup";

const PUBLIC_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

// ─────────────────────────────────────────────────────────────────────────────
// Auth plumbing
// ─────────────────────────────────────────────────────────────────────────────

/// Rejects plain-HTTP requests when TLS is enforced. Terminated TLS shows up
/// as a forwarded-proto header.
fn check_tls(state: &AppState, headers: &HeaderMap) -> CastResult<()> {
    if !state.config.require_tls {
        return Ok(());
    }
    let https = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').next().unwrap_or(v).trim() == "https");
    if https {
        Ok(())
    } else {
        Err(CastError::TlsRequired)
    }
}

/// Extracts and validates the session cookie.
fn authed_session(state: &AppState, headers: &HeaderMap) -> CastResult<Session> {
    check_tls(state, headers)?;
    headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|c| state.sessions.validate_cookie_header(c))
        .ok_or(CastError::AuthRequired)
}

fn session_cookie(state: &AppState, token: &str, max_age_secs: u64) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE, token, max_age_secs
    );
    if state.config.require_tls {
        cookie.push_str("; Secure");
    }
    cookie
}

// ─────────────────────────────────────────────────────────────────────────────
// Session endpoints
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> CastResult<Response> {
    check_tls(&state, &headers)?;
    if !state.limits.login.check(peer.ip()) {
        return Err(CastError::RateLimited);
    }
    let (Some(expected), true) = (
        state.config.admin_password.as_deref(),
        state.sessions.configured(),
    ) else {
        return Err(CastError::Configuration(
            "login disabled: ADMIN_PASSWORD or SESSION_SECRET unset".into(),
        ));
    };
    if request.username.is_empty()
        || !constant_time_eq(request.password.as_bytes(), expected.as_bytes())
    {
        log::warn!("[Api] Failed login attempt from {}", peer.ip());
        return Err(CastError::AuthRequired);
    }

    let token = state
        .sessions
        .create(&request.username)
        .ok_or_else(|| CastError::Internal("token creation failed".into()))?;
    log::info!("[Api] Session created for {}", request.username);
    Ok((
        [(SET_COOKIE, session_cookie(&state, &token, SESSION_TTL_SECS))],
        Json(json!({ "username": request.username })),
    )
        .into_response())
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> CastResult<Response> {
    // Destroying a session is clearing the cookie; tokens are stateless.
    authed_session(&state, &headers)?;
    Ok((
        [(SET_COOKIE, session_cookie(&state, "", 0))],
        Json(json!({ "ok": true })),
    )
        .into_response())
}

pub async fn session_probe(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> CastResult<Json<Value>> {
    let session = authed_session(&state, &headers)?;
    Ok(Json(json!({ "username": session.username })))
}

// ─────────────────────────────────────────────────────────────────────────────
// ICE configuration
// ─────────────────────────────────────────────────────────────────────────────

pub async fn ice_config(State(state): State<AppState>) -> Json<Value> {
    let mut servers: Vec<Value> = PUBLIC_STUN_SERVERS
        .iter()
        .map(|url| json!({ "urls": url }))
        .collect();

    if let Some(provider_url) = state.config.ice_credentials_url.clone() {
        if let Some(extra) = provider_ice_servers(&state, &provider_url).await {
            servers.extend(extra);
        }
    } else if let Some(turn_url) = state.config.turn_url.clone() {
        servers.push(json!({
            "urls": turn_url,
            "username": state.config.turn_username.clone().unwrap_or_default(),
            "credential": state.config.turn_credential.clone().unwrap_or_default(),
        }));
    }

    Json(json!({ "iceServers": servers }))
}

/// Fetches provider TURN credentials with a 5-minute process-wide cache.
async fn provider_ice_servers(state: &AppState, provider_url: &str) -> Option<Vec<Value>> {
    let cached = {
        let cache = state.ice_cache.lock();
        cache.as_ref().and_then(|(fetched_at, value)| {
            (fetched_at.elapsed() < Duration::from_secs(ICE_CACHE_TTL_SECS))
                .then(|| value.clone())
        })
    };
    let value = match cached {
        Some(value) => value,
        None => {
            let response = state
                .http_client
                .get(provider_url)
                .send()
                .await
                .ok()?
                .json::<Value>()
                .await
                .ok()?;
            *state.ice_cache.lock() = Some((Instant::now(), response.clone()));
            response
        }
    };
    // Providers answer either a bare array of servers or an object wrapping
    // one under `iceServers`.
    match value {
        Value::Array(list) => Some(list),
        Value::Object(ref map) => match map.get("iceServers") {
            Some(Value::Array(list)) => Some(list.clone()),
            _ => Some(vec![value]),
        },
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Integration test
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct IntegrationTestRequest {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub credentials: SourceCredentials,
}

pub async fn integration_test(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<IntegrationTestRequest>,
) -> CastResult<Json<Value>> {
    authed_session(&state, &headers)?;
    if !state.limits.integration_test.check(peer.ip()) {
        return Err(CastError::RateLimited);
    }
    let outcome = source_client::test_connection(request.kind, &request.credentials).await;
    Ok(Json(serde_json::to_value(outcome).unwrap_or_default()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Catalog proxies
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

pub async fn music_search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Json<Value> {
    if query.q.trim().is_empty() {
        return Json(json!({ "results": [] }));
    }
    let response = state
        .http_client
        .get(format!("{}/search", CATALOG_API_BASE))
        .query(&[("q", query.q.as_str())])
        .send()
        .await;
    let results = match response {
        Ok(resp) => resp
            .json::<Value>()
            .await
            .ok()
            .and_then(|v| v.get("data").and_then(Value::as_array).cloned())
            .map(|entries| entries.iter().map(normalize_search_entry).collect::<Vec<_>>())
            .unwrap_or_default(),
        Err(e) => {
            log::warn!("[Api] Catalog search failed: {}", e);
            Vec::new()
        }
    };
    Json(json!({ "results": results }))
}

pub async fn music_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> CastResult<Json<Value>> {
    // The id is numeric upstream; refuse anything else early.
    let id: u64 = id
        .parse()
        .map_err(|_| CastError::InvalidRequest("track id must be numeric".into()))?;
    let response = state
        .http_client
        .get(format!("{}/track/{}", CATALOG_API_BASE, id))
        .send()
        .await;
    let detail = match response {
        Ok(resp) => resp
            .json::<Value>()
            .await
            .map(|v| normalize_detail(&v))
            .unwrap_or_else(|_| json!({})),
        Err(e) => {
            log::warn!("[Api] Catalog detail failed: {}", e);
            json!({})
        }
    };
    Ok(Json(detail))
}

fn normalize_search_entry(entry: &Value) -> Value {
    json!({
        "id": entry["id"],
        "title": entry["title"],
        "artist": entry["artist"]["name"],
        "album": entry["album"]["title"],
        "durationSec": entry["duration"],
        "explicit": entry["explicit_lyrics"],
        "cover": entry["album"]["cover"],
        "coverMedium": entry["album"]["cover_medium"],
    })
}

fn normalize_detail(entry: &Value) -> Value {
    let contributors: Vec<Value> = entry["contributors"]
        .as_array()
        .map(|list| list.iter().map(|c| c["name"].clone()).collect())
        .unwrap_or_default();
    json!({
        "id": entry["id"],
        "title": entry["title"],
        "artist": entry["artist"]["name"],
        "album": entry["album"]["title"],
        "durationSec": entry["duration"],
        "releaseDate": entry["release_date"],
        "isrc": entry["isrc"],
        "bpm": entry["bpm"],
        "trackPos": entry["track_position"],
        "discNum": entry["disk_number"],
        "explicit": entry["explicit_lyrics"],
        "contributors": contributors,
        "cover": entry["album"]["cover"],
        "coverMedium": entry["album"]["cover_medium"],
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Audio identification
// ─────────────────────────────────────────────────────────────────────────────

pub async fn identify_audio(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> CastResult<Json<Value>> {
    authed_session(&state, &headers)?;
    if !state.limits.identify.check(peer.ip()) {
        return Err(CastError::RateLimited);
    }
    if body.len() > MAX_IDENTIFY_BODY {
        return Err(CastError::InvalidRequest("audio sample too large".into()));
    }
    let Some(api_key) = state.config.acoustid_api_key.clone() else {
        return Err(CastError::Configuration("ACOUSTID_API_KEY unset".into()));
    };

    let response = state
        .http_client
        .post(FINGERPRINT_API_URL)
        .query(&[("client", api_key.as_str()), ("format", "json")])
        .header(axum::http::header::CONTENT_TYPE, "application/octet-stream")
        .body(body)
        .send()
        .await;
    let matched = match response {
        Ok(resp) if resp.status().is_success() => resp
            .json::<Value>()
            .await
            .ok()
            .and_then(|v| v.get("results").and_then(|r| r.get(0)).cloned()),
        Ok(resp) => {
            log::warn!("[Api] Fingerprint lookup rejected: HTTP {}", resp.status());
            None
        }
        Err(e) => {
            log::warn!("[Api] Fingerprint lookup failed: {}", e);
            None
        }
    };
    Ok(Json(json!({ "match": matched })))
}

// ─────────────────────────────────────────────────────────────────────────────
// Admin surface
// ─────────────────────────────────────────────────────────────────────────────

pub async fn admin_rooms(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> CastResult<Json<Value>> {
    authed_session(&state, &headers)?;
    let rooms = state.registry.room_summaries();
    Ok(Json(json!({ "rooms": rooms })))
}

pub async fn list_room_slugs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> CastResult<Json<Value>> {
    authed_session(&state, &headers)?;
    Ok(Json(json!({ "slugs": state.registry.list_slug_history() })))
}

pub async fn delete_room_slug(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(slug): Path<String>,
) -> CastResult<StatusCode> {
    authed_session(&state, &headers)?;
    if state.registry.remove_slug(&slug) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(CastError::RoomNotFound(slug))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_state() -> AppState {
        let dir = tempfile::tempdir().unwrap().into_path();
        let mut config = Config::default();
        config.session_secret = Some("secret".into());
        config.admin_password = Some("hunter2".into());
        config.slug_history_path = dir.join("slugs.json");
        AppState::build(config)
    }

    fn peer() -> ConnectInfo<SocketAddr> {
        ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000)))
    }

    fn cookie_headers(state: &AppState, username: &str) -> HeaderMap {
        let token = state.sessions.create(username).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            format!("{}={}", SESSION_COOKIE, token).parse().unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn login_issues_a_cookie_for_the_right_password() {
        let state = test_state();
        let response = login(
            State(state.clone()),
            peer(),
            HeaderMap::new(),
            Json(LoginRequest {
                username: "dj".into(),
                password: "hunter2".into(),
            }),
        )
        .await
        .unwrap();
        let cookie = response.headers()[SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.starts_with(SESSION_COOKIE));
        assert!(cookie.contains("HttpOnly"));

        // The issued token passes the session probe.
        let token = cookie
            .split_once('=')
            .unwrap()
            .1
            .split(';')
            .next()
            .unwrap()
            .to_string();
        assert_eq!(state.sessions.validate(&token).unwrap().username, "dj");
    }

    #[tokio::test]
    async fn wrong_password_is_unauthorized() {
        let state = test_state();
        let err = login(
            State(state),
            peer(),
            HeaderMap::new(),
            Json(LoginRequest {
                username: "dj".into(),
                password: "wrong".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn login_without_configuration_is_503() {
        let dir = tempfile::tempdir().unwrap().into_path();
        let mut config = Config::default();
        config.slug_history_path = dir.join("slugs.json");
        let state = AppState::build(config);
        let err = login(
            State(state),
            peer(),
            HeaderMap::new(),
            Json(LoginRequest {
                username: "dj".into(),
                password: "x".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn login_attempts_are_rate_limited() {
        let state = test_state();
        for _ in 0..10 {
            let _ = login(
                State(state.clone()),
                peer(),
                HeaderMap::new(),
                Json(LoginRequest {
                    username: "dj".into(),
                    password: "wrong".into(),
                }),
            )
            .await;
        }
        let err = login(
            State(state),
            peer(),
            HeaderMap::new(),
            Json(LoginRequest {
                username: "dj".into(),
                password: "hunter2".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn session_probe_requires_a_valid_cookie() {
        let state = test_state();
        let err = session_probe(State(state.clone()), HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);

        let probe = session_probe(State(state.clone()), cookie_headers(&state, "dj"))
            .await
            .unwrap();
        assert_eq!(probe.0["username"], "dj");
    }

    #[tokio::test]
    async fn tls_enforcement_blocks_plain_requests() {
        let dir = tempfile::tempdir().unwrap().into_path();
        let mut config = Config::default();
        config.session_secret = Some("secret".into());
        config.require_tls = true;
        config.slug_history_path = dir.join("slugs.json");
        let state = AppState::build(config);

        let err = session_probe(State(state.clone()), cookie_headers(&state, "dj"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);

        let mut headers = cookie_headers(&state, "dj");
        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        assert!(session_probe(State(state), headers).await.is_ok());
    }

    #[tokio::test]
    async fn ice_config_uses_static_turn_when_no_provider() {
        let dir = tempfile::tempdir().unwrap().into_path();
        let mut config = Config::default();
        config.turn_url = Some("turn:turn.example:3478".into());
        config.turn_username = Some("u".into());
        config.turn_credential = Some("c".into());
        config.slug_history_path = dir.join("slugs.json");
        let state = AppState::build(config);

        let Json(value) = ice_config(State(state)).await;
        let servers = value["iceServers"].as_array().unwrap();
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[2]["urls"], "turn:turn.example:3478");
        assert_eq!(servers[2]["username"], "u");
    }

    #[tokio::test]
    async fn slug_admin_round_trip() {
        let state = test_state();
        state.registry.create(Some("friday-show")).unwrap();
        let headers = cookie_headers(&state, "dj");

        let Json(listed) = list_room_slugs(State(state.clone()), headers.clone())
            .await
            .unwrap();
        assert_eq!(listed["slugs"][0], "friday-show");

        let status = delete_room_slug(
            State(state.clone()),
            headers.clone(),
            Path("friday-show".into()),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let err = delete_room_slug(State(state), headers, Path("friday-show".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn catalog_normalization_flattens_nested_fields() {
        let entry = json!({
            "id": 3135556,
            "title": "Harder, Better, Faster, Stronger",
            "duration": 224,
            "explicit_lyrics": false,
            "isrc": "GBDUW0000059",
            "bpm": 123.4,
            "release_date": "2001-03-07",
            "track_position": 4,
            "disk_number": 1,
            "artist": {"name": "Daft Punk"},
            "album": {"title": "Discovery", "cover": "c", "cover_medium": "cm"},
            "contributors": [{"name": "Daft Punk"}]
        });
        let normalized = normalize_detail(&entry);
        assert_eq!(normalized["artist"], "Daft Punk");
        assert_eq!(normalized["album"], "Discovery");
        assert_eq!(normalized["durationSec"], 224);
        assert_eq!(normalized["releaseDate"], "2001-03-07");
        assert_eq!(normalized["trackPos"], 4);
        assert_eq!(normalized["contributors"][0], "Daft Punk");

        let search = normalize_search_entry(&entry);
        assert_eq!(search["coverMedium"], "cm");
    }
}
