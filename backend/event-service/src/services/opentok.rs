/// OpenTok client.
///
/// Wraps the vendor REST API for session creation, broadcast and archive
/// control, and mints connection tokens locally. The lifecycle and
/// orchestration code depends on the `VideoPlatform` trait, not on this
/// client, so tests run against in-process fakes.
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Per-admin vendor credentials, unsealed for the duration of a call.
#[derive(Debug, Clone)]
pub struct PlatformCredentials {
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Producer,
    Fan,
    Host,
    Celebrity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveMode {
    Composed,
    Individual,
}

impl ArchiveMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Composed => "composed",
            Self::Individual => "individual",
        }
    }

    /// Uncomposed events record one file per participant.
    pub fn for_event(uncomposed: bool) -> Self {
        if uncomposed {
            Self::Individual
        } else {
            Self::Composed
        }
    }
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("broadcast already started")]
    AlreadyStarted,
    #[error("platform request failed: {0}")]
    Request(String),
    #[error("unexpected platform response: {0}")]
    Response(String),
    #[error("token signing failed: {0}")]
    Token(String),
}

#[derive(Debug, Clone)]
pub struct BroadcastStarted {
    pub id: String,
    pub hls_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait VideoPlatform: Send + Sync {
    async fn create_session(&self, creds: &PlatformCredentials) -> Result<String, PlatformError>;

    fn create_token(
        &self,
        creds: &PlatformCredentials,
        session_id: &str,
        role: ParticipantRole,
        data: Option<serde_json::Value>,
    ) -> Result<String, PlatformError>;

    async fn start_broadcast(
        &self,
        creds: &PlatformCredentials,
        session_id: &str,
        hls: bool,
        rtmp_url: Option<&str>,
    ) -> Result<BroadcastStarted, PlatformError>;

    async fn stop_broadcast(
        &self,
        creds: &PlatformCredentials,
        broadcast_id: &str,
    ) -> Result<(), PlatformError>;

    async fn start_archive(
        &self,
        creds: &PlatformCredentials,
        session_id: &str,
        name: &str,
        mode: ArchiveMode,
    ) -> Result<String, PlatformError>;

    async fn stop_archive(
        &self,
        creds: &PlatformCredentials,
        archive_id: &str,
    ) -> Result<(), PlatformError>;
}

// ========================================
// REST client
// ========================================

const AUTH_HEADER: &str = "X-OPENTOK-AUTH";
const PROJECT_TOKEN_TTL_SECS: i64 = 60;
const CONNECTION_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Serialize)]
struct ProjectClaims<'a> {
    iss: &'a str,
    ist: &'a str,
    iat: i64,
    exp: i64,
    jti: String,
}

#[derive(Serialize, Deserialize)]
struct ConnectionClaims {
    iss: String,
    session_id: String,
    role: ParticipantRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct CreatedSession {
    session_id: String,
}

#[derive(Deserialize)]
struct BroadcastUrls {
    hls: Option<String>,
}

#[derive(Deserialize)]
struct BroadcastResponse {
    id: String,
    #[serde(rename = "broadcastUrls")]
    broadcast_urls: Option<BroadcastUrls>,
    #[serde(rename = "createdAt")]
    created_at: Option<i64>,
}

#[derive(Deserialize)]
struct ArchiveResponse {
    id: String,
}

pub struct OpenTokClient {
    http: reqwest::Client,
    api_url: String,
}

impl OpenTokClient {
    pub fn new(api_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    /// Short-lived project JWT expected in the auth header of every call.
    fn project_jwt(creds: &PlatformCredentials) -> Result<String, PlatformError> {
        let now = Utc::now().timestamp();
        let claims = ProjectClaims {
            iss: &creds.api_key,
            ist: "project",
            iat: now,
            exp: now + PROJECT_TOKEN_TTL_SECS,
            jti: Uuid::new_v4().to_string(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(creds.api_secret.as_bytes()),
        )
        .map_err(|e| PlatformError::Token(e.to_string()))
    }

    fn project_url(&self, creds: &PlatformCredentials, path: &str) -> String {
        format!("{}/v2/project/{}/{path}", self.api_url, creds.api_key)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, PlatformError> {
        let status = response.status();
        if status == reqwest::StatusCode::CONFLICT {
            return Err(PlatformError::AlreadyStarted);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PlatformError::Response(format!("{status}: {body}")));
        }
        Ok(response)
    }
}

/// The broadcast API still hands back plain-http URLs on occasion.
fn ensure_https(url: &str) -> String {
    if url.starts_with("https") {
        url.to_string()
    } else if let Some(rest) = url.strip_prefix("http") {
        format!("https{rest}")
    } else {
        url.to_string()
    }
}

#[async_trait]
impl VideoPlatform for OpenTokClient {
    async fn create_session(&self, creds: &PlatformCredentials) -> Result<String, PlatformError> {
        let response = self
            .http
            .post(format!("{}/session/create", self.api_url))
            .header(AUTH_HEADER, Self::project_jwt(creds)?)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[("mediaMode", "routed")])
            .send()
            .await
            .map_err(|e| PlatformError::Request(e.to_string()))?;

        let sessions: Vec<CreatedSession> = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| PlatformError::Response(e.to_string()))?;
        sessions
            .into_iter()
            .next()
            .map(|s| s.session_id)
            .ok_or_else(|| PlatformError::Response("empty session list".to_string()))
    }

    fn create_token(
        &self,
        creds: &PlatformCredentials,
        session_id: &str,
        role: ParticipantRole,
        data: Option<serde_json::Value>,
    ) -> Result<String, PlatformError> {
        let now = Utc::now().timestamp();
        let claims = ConnectionClaims {
            iss: creds.api_key.clone(),
            session_id: session_id.to_string(),
            role,
            data,
            iat: now,
            exp: now + CONNECTION_TOKEN_TTL_SECS,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(creds.api_secret.as_bytes()),
        )
        .map_err(|e| PlatformError::Token(e.to_string()))
    }

    async fn start_broadcast(
        &self,
        creds: &PlatformCredentials,
        session_id: &str,
        hls: bool,
        rtmp_url: Option<&str>,
    ) -> Result<BroadcastStarted, PlatformError> {
        let mut outputs = serde_json::Map::new();
        if hls {
            outputs.insert("hls".to_string(), serde_json::json!({}));
        }
        if let Some(url) = rtmp_url {
            outputs.insert("rtmp".to_string(), serde_json::json!({ "url": url }));
        }
        let body = serde_json::json!({
            "sessionId": session_id,
            "outputs": outputs,
        });

        let response = self
            .http
            .post(self.project_url(creds, "broadcast"))
            .header(AUTH_HEADER, Self::project_jwt(creds)?)
            .json(&body)
            .send()
            .await
            .map_err(|e| PlatformError::Request(e.to_string()))?;

        let parsed: BroadcastResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| PlatformError::Response(e.to_string()))?;

        let created_at = parsed
            .created_at
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        Ok(BroadcastStarted {
            id: parsed.id,
            hls_url: parsed
                .broadcast_urls
                .and_then(|urls| urls.hls)
                .map(|url| ensure_https(&url)),
            created_at,
        })
    }

    async fn stop_broadcast(
        &self,
        creds: &PlatformCredentials,
        broadcast_id: &str,
    ) -> Result<(), PlatformError> {
        let response = self
            .http
            .post(self.project_url(creds, &format!("broadcast/{broadcast_id}/stop")))
            .header(AUTH_HEADER, Self::project_jwt(creds)?)
            .send()
            .await
            .map_err(|e| PlatformError::Request(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn start_archive(
        &self,
        creds: &PlatformCredentials,
        session_id: &str,
        name: &str,
        mode: ArchiveMode,
    ) -> Result<String, PlatformError> {
        let body = serde_json::json!({
            "sessionId": session_id,
            "name": name,
            "outputMode": mode.as_str(),
        });
        let response = self
            .http
            .post(self.project_url(creds, "archive"))
            .header(AUTH_HEADER, Self::project_jwt(creds)?)
            .json(&body)
            .send()
            .await
            .map_err(|e| PlatformError::Request(e.to_string()))?;

        let parsed: ArchiveResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| PlatformError::Response(e.to_string()))?;
        Ok(parsed.id)
    }

    async fn stop_archive(
        &self,
        creds: &PlatformCredentials,
        archive_id: &str,
    ) -> Result<(), PlatformError> {
        let response = self
            .http
            .post(self.project_url(creds, &format!("archive/{archive_id}/stop")))
            .header(AUTH_HEADER, Self::project_jwt(creds)?)
            .send()
            .await
            .map_err(|e| PlatformError::Request(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

    fn creds() -> PlatformCredentials {
        PlatformCredentials {
            api_key: "46112222".to_string(),
            api_secret: "sekrit".to_string(),
        }
    }

    #[test]
    fn ensure_https_rewrites_plain_http() {
        assert_eq!(
            ensure_https("http://cdn.example.com/playlist.m3u8"),
            "https://cdn.example.com/playlist.m3u8"
        );
        assert_eq!(
            ensure_https("https://cdn.example.com/playlist.m3u8"),
            "https://cdn.example.com/playlist.m3u8"
        );
    }

    #[test]
    fn archive_mode_follows_composition_flag() {
        assert_eq!(ArchiveMode::for_event(false), ArchiveMode::Composed);
        assert_eq!(ArchiveMode::for_event(true), ArchiveMode::Individual);
        assert_eq!(ArchiveMode::Composed.as_str(), "composed");
        assert_eq!(ArchiveMode::Individual.as_str(), "individual");
    }

    #[test]
    fn connection_token_carries_role_and_session() {
        let client = OpenTokClient::new("https://api.opentok.com".to_string());
        let token = client
            .create_token(
                &creds(),
                "2_session",
                ParticipantRole::Fan,
                Some(serde_json::json!({"fanUrl": "spring-show"})),
            )
            .unwrap();

        let decoded = decode::<ConnectionClaims>(
            &token,
            &DecodingKey::from_secret(b"sekrit"),
            &Validation::new(Algorithm::HS256),
        )
        .unwrap();
        assert_eq!(decoded.claims.session_id, "2_session");
        assert_eq!(decoded.claims.role, ParticipantRole::Fan);
        assert_eq!(decoded.claims.iss, "46112222");
    }
}
