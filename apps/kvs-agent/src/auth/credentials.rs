use async_trait::async_trait;
use directories::BaseDirs;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;

const CONTAINER_CREDENTIALS_HOST: &str = "http://169.254.170.2";
const INSTANCE_METADATA_ENDPOINT: &str = "http://169.254.169.254";
const IMDS_TOKEN_TTL_SECS: &str = "21600";
const CREDENTIALS_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const STS_API_VERSION: &str = "2011-06-15";
const DEFAULT_PROFILE: &str = "default";
const CHECKED_SOURCES: &str =
    "environment, web identity, shared credentials file, container endpoint, instance metadata";

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("no usable AWS credentials found (checked {0})")]
    Unavailable(String),
    #[error("credentials file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("credentials request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Access key material used to sign channel URLs and control-plane calls.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: session_token.filter(|token| !token.trim().is_empty()),
            expires_at: None,
        }
    }

    pub fn is_usable(&self) -> bool {
        !self.access_key_id.trim().is_empty() && !self.secret_access_key.trim().is_empty()
    }

    /// Reads the standard `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` /
    /// `AWS_SESSION_TOKEN` triple through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let access_key_id = lookup("AWS_ACCESS_KEY_ID")?;
        let secret_access_key = lookup("AWS_SECRET_ACCESS_KEY")?;
        let credentials = Self::new(
            access_key_id,
            secret_access_key,
            lookup("AWS_SESSION_TOKEN"),
        );
        credentials.is_usable().then_some(credentials)
    }
}

#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn credentials(&self) -> Result<Credentials, CredentialsError>;
}

/// Fixed credentials, mostly useful when keys are injected by the caller.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub Credentials);

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn credentials(&self) -> Result<Credentials, CredentialsError> {
        if self.0.is_usable() {
            Ok(self.0.clone())
        } else {
            Err(CredentialsError::Unavailable("static credentials".into()))
        }
    }
}

/// Environment variables, then a web identity token exchanged with STS,
/// then the shared credentials file, then the container (task role)
/// endpoint, then the EC2 instance metadata service (IMDSv2).
pub struct DefaultCredentialsChain {
    vars: HashMap<String, String>,
    http: reqwest::Client,
    container_host: String,
}

impl DefaultCredentialsChain {
    /// Snapshots the process environment once.
    pub fn from_env() -> Self {
        Self::with_vars(std::env::vars())
    }

    pub fn with_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(CREDENTIALS_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            vars: vars.into_iter().collect(),
            http,
            container_host: CONTAINER_CREDENTIALS_HOST.to_string(),
        }
    }

    pub fn with_container_host(mut self, host: impl Into<String>) -> Self {
        self.container_host = host.into();
        self
    }

    fn var(&self, key: &str) -> Option<String> {
        self.vars
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn shared_credentials_path(&self) -> Option<PathBuf> {
        if let Some(path) = self.var("AWS_SHARED_CREDENTIALS_FILE") {
            return Some(PathBuf::from(path));
        }
        BaseDirs::new().map(|dirs| dirs.home_dir().join(".aws").join("credentials"))
    }

    fn from_shared_file(&self) -> Result<Option<Credentials>, CredentialsError> {
        let Some(path) = self.shared_credentials_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let profile = self
            .var("AWS_PROFILE")
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string());
        let credentials = parse_shared_credentials(&contents, &profile);
        if credentials.is_some() {
            tracing::debug!(
                target: "kvs_agent::auth",
                path = %path.display(),
                profile = %profile,
                "loaded credentials from shared credentials file"
            );
        }
        Ok(credentials)
    }

    async fn from_container(&self) -> Result<Option<Credentials>, CredentialsError> {
        let uri = match (
            self.var("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI"),
            self.var("AWS_CONTAINER_CREDENTIALS_FULL_URI"),
        ) {
            (Some(relative), _) => format!("{}{relative}", self.container_host),
            (None, Some(full)) => full,
            (None, None) => return Ok(None),
        };

        let mut request = self.http.get(&uri);
        if let Some(token) = self.var("AWS_CONTAINER_AUTHORIZATION_TOKEN") {
            request = request.header(reqwest::header::AUTHORIZATION, token);
        }
        let response: RoleCredentials = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        tracing::debug!(
            target: "kvs_agent::auth",
            expires_at = ?response.expiration,
            "loaded credentials from container endpoint"
        );
        let mut credentials = Credentials::new(
            response.access_key_id,
            response.secret_access_key,
            response.token,
        );
        credentials.expires_at = response.expiration;
        Ok(credentials.is_usable().then_some(credentials))
    }

    fn sts_endpoint(&self) -> String {
        if let Some(endpoint) = self.var("AWS_ENDPOINT_URL_STS") {
            return endpoint;
        }
        match self.var("AWS_REGION").or_else(|| self.var("AWS_DEFAULT_REGION")) {
            Some(region) => format!("https://sts.{region}.amazonaws.com"),
            None => "https://sts.amazonaws.com".to_string(),
        }
    }

    /// `AssumeRoleWithWebIdentity` with the token file named by
    /// `AWS_WEB_IDENTITY_TOKEN_FILE` (EKS service accounts and similar).
    async fn from_web_identity(&self) -> Result<Option<Credentials>, CredentialsError> {
        let (Some(token_file), Some(role_arn)) = (
            self.var("AWS_WEB_IDENTITY_TOKEN_FILE"),
            self.var("AWS_ROLE_ARN"),
        ) else {
            return Ok(None);
        };
        let token = std::fs::read_to_string(&token_file)?;
        let session_name = self.var("AWS_ROLE_SESSION_NAME").unwrap_or_else(|| {
            format!("kvs-agent-{}", OffsetDateTime::now_utc().unix_timestamp())
        });

        let response: WebIdentityEnvelope = self
            .http
            .post(self.sts_endpoint())
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("Action", "AssumeRoleWithWebIdentity"),
                ("Version", STS_API_VERSION),
                ("RoleArn", role_arn.as_str()),
                ("RoleSessionName", session_name.as_str()),
                ("WebIdentityToken", token.trim()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let issued = response.response.result.credentials;
        tracing::debug!(
            target: "kvs_agent::auth",
            role_arn = %role_arn,
            session = %session_name,
            "assumed role with web identity"
        );
        let mut credentials = Credentials::new(
            issued.access_key_id,
            issued.secret_access_key,
            issued.session_token,
        );
        credentials.expires_at = issued
            .expiration
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs as i64).ok());
        Ok(credentials.is_usable().then_some(credentials))
    }

    /// Role credentials from the EC2 instance metadata service, session
    /// token flow only.
    async fn from_instance_metadata(&self) -> Result<Option<Credentials>, CredentialsError> {
        if self
            .var("AWS_EC2_METADATA_DISABLED")
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
        {
            return Ok(None);
        }
        let endpoint = self
            .var("AWS_EC2_METADATA_SERVICE_ENDPOINT")
            .unwrap_or_else(|| INSTANCE_METADATA_ENDPOINT.to_string());
        let endpoint = endpoint.trim_end_matches('/');

        let token = self
            .http
            .put(format!("{endpoint}/latest/api/token"))
            .header("x-aws-ec2-metadata-token-ttl-seconds", IMDS_TOKEN_TTL_SECS)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let roles_url = format!("{endpoint}/latest/meta-data/iam/security-credentials/");
        let roles = self
            .http
            .get(&roles_url)
            .header("x-aws-ec2-metadata-token", token.trim())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let Some(role) = roles.lines().map(str::trim).find(|line| !line.is_empty()) else {
            return Ok(None);
        };

        let response: RoleCredentials = self
            .http
            .get(format!("{roles_url}{role}"))
            .header("x-aws-ec2-metadata-token", token.trim())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        tracing::debug!(
            target: "kvs_agent::auth",
            role = %role,
            expires_at = ?response.expiration,
            "loaded credentials from instance metadata"
        );
        let mut credentials = Credentials::new(
            response.access_key_id,
            response.secret_access_key,
            response.token,
        );
        credentials.expires_at = response.expiration;
        Ok(credentials.is_usable().then_some(credentials))
    }
}

#[async_trait]
impl CredentialsProvider for DefaultCredentialsChain {
    async fn credentials(&self) -> Result<Credentials, CredentialsError> {
        if let Some(credentials) = Credentials::from_lookup(|key| self.var(key)) {
            tracing::info!(target: "kvs_agent::auth", "using credentials from environment");
            return Ok(credentials);
        }

        match self.from_web_identity().await {
            Ok(Some(credentials)) => {
                tracing::info!(target: "kvs_agent::auth", "using role credentials from web identity");
                return Ok(credentials);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    target: "kvs_agent::auth",
                    error = %err,
                    "web identity exchange failed; trying shared credentials file"
                );
            }
        }

        match self.from_shared_file() {
            Ok(Some(credentials)) => return Ok(credentials),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    target: "kvs_agent::auth",
                    error = %err,
                    "shared credentials file unreadable; trying container endpoint"
                );
            }
        }

        match self.from_container().await {
            Ok(Some(credentials)) => {
                tracing::info!(target: "kvs_agent::auth", "using role credentials from container endpoint");
                return Ok(credentials);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!(
                    target: "kvs_agent::auth",
                    error = %err,
                    "container credentials lookup failed"
                );
                return Err(CredentialsError::Unavailable(format!(
                    "{CHECKED_SOURCES} ({err})"
                )));
            }
        }

        // Off EC2 the metadata host is simply unreachable; that is not an error.
        match self.from_instance_metadata().await {
            Ok(Some(credentials)) => {
                tracing::info!(target: "kvs_agent::auth", "using role credentials from instance metadata");
                Ok(credentials)
            }
            Ok(None) => Err(CredentialsError::Unavailable(CHECKED_SOURCES.into())),
            Err(err) => {
                tracing::debug!(target: "kvs_agent::auth", error = %err, "instance metadata unavailable");
                Err(CredentialsError::Unavailable(CHECKED_SOURCES.into()))
            }
        }
    }
}

/// Body served by both the container endpoint and instance metadata.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleCredentials {
    access_key_id: String,
    secret_access_key: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    expiration: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize)]
struct WebIdentityEnvelope {
    #[serde(rename = "AssumeRoleWithWebIdentityResponse")]
    response: WebIdentityResponse,
}

#[derive(Debug, Deserialize)]
struct WebIdentityResponse {
    #[serde(rename = "AssumeRoleWithWebIdentityResult")]
    result: WebIdentityResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WebIdentityResult {
    credentials: IssuedCredentials,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IssuedCredentials {
    access_key_id: String,
    secret_access_key: String,
    #[serde(default)]
    session_token: Option<String>,
    /// Seconds since the epoch.
    #[serde(default)]
    expiration: Option<f64>,
}

/// Extracts one profile from an INI-style shared credentials file.
pub fn parse_shared_credentials(contents: &str, profile: &str) -> Option<Credentials> {
    let mut in_profile = false;
    let mut values: HashMap<&str, &str> = HashMap::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            let section = section.trim();
            let name = section.strip_prefix("profile ").unwrap_or(section).trim();
            in_profile = name == profile;
            continue;
        }
        if !in_profile {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            values.insert(key.trim(), value.trim());
        }
    }

    Credentials::from_lookup(|key| {
        let ini_key = match key {
            "AWS_ACCESS_KEY_ID" => "aws_access_key_id",
            "AWS_SECRET_ACCESS_KEY" => "aws_secret_access_key",
            "AWS_SESSION_TOKEN" => "aws_session_token",
            _ => return None,
        };
        values.get(ini_key).map(|value| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn lookup_requires_key_and_secret() {
        let env: HashMap<&str, &str> = [("AWS_ACCESS_KEY_ID", "AKID")].into_iter().collect();
        assert!(Credentials::from_lookup(|k| env.get(k).map(|v| v.to_string())).is_none());
    }

    #[test]
    fn blank_session_token_is_dropped() {
        let creds = Credentials::new("AKID", "secret", Some("  ".into()));
        assert_eq!(creds.session_token, None);
    }

    #[test]
    fn debug_output_hides_secrets() {
        let creds = Credentials::new("AKID", "very-secret", Some("token".into()));
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("AKID"));
        assert!(!rendered.contains("very-secret"));
        assert!(!rendered.contains("token\""));
    }

    #[test]
    fn parses_requested_profile_only() {
        let contents = "\
[default]
aws_access_key_id = DEFAULTKEY
aws_secret_access_key = defaultsecret

# comment
[profile agent]
aws_access_key_id=AGENTKEY
aws_secret_access_key=agentsecret
aws_session_token = agenttoken
";
        let default = parse_shared_credentials(contents, "default").unwrap();
        assert_eq!(default.access_key_id, "DEFAULTKEY");
        assert_eq!(default.session_token, None);

        let agent = parse_shared_credentials(contents, "agent").unwrap();
        assert_eq!(agent.access_key_id, "AGENTKEY");
        assert_eq!(agent.secret_access_key, "agentsecret");
        assert_eq!(agent.session_token.as_deref(), Some("agenttoken"));

        assert!(parse_shared_credentials(contents, "missing").is_none());
    }

    #[tokio::test]
    async fn chain_prefers_environment() {
        let chain = DefaultCredentialsChain::with_vars(vars(&[
            ("AWS_ACCESS_KEY_ID", "ENVKEY"),
            ("AWS_SECRET_ACCESS_KEY", "envsecret"),
            ("AWS_SHARED_CREDENTIALS_FILE", "/nonexistent/credentials"),
        ]));
        let creds = chain.credentials().await.unwrap();
        assert_eq!(creds.access_key_id, "ENVKEY");
    }

    #[tokio::test]
    async fn chain_falls_back_to_shared_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[default]\naws_access_key_id = FILEKEY\naws_secret_access_key = filesecret"
        )
        .unwrap();
        let chain = DefaultCredentialsChain::with_vars(vars(&[(
            "AWS_SHARED_CREDENTIALS_FILE",
            file.path().to_str().unwrap(),
        )]));
        let creds = chain.credentials().await.unwrap();
        assert_eq!(creds.access_key_id, "FILEKEY");
    }

    #[tokio::test]
    async fn chain_reports_unavailable_when_nothing_configured() {
        let chain = DefaultCredentialsChain::with_vars(vars(&[
            ("AWS_SHARED_CREDENTIALS_FILE", "/nonexistent/credentials"),
            ("AWS_EC2_METADATA_DISABLED", "true"),
        ]));
        let err = chain.credentials().await.unwrap_err();
        assert!(matches!(err, CredentialsError::Unavailable(_)));
        assert!(err.to_string().contains("instance metadata"), "{err}");
    }

    #[tokio::test]
    async fn static_credentials_must_be_usable() {
        let provider = StaticCredentials(Credentials::new("", "", None));
        assert!(matches!(
            provider.credentials().await,
            Err(CredentialsError::Unavailable(_))
        ));
    }

    #[test]
    fn sts_endpoint_follows_region_and_override() {
        let regional = DefaultCredentialsChain::with_vars(vars(&[("AWS_REGION", "eu-west-1")]));
        assert_eq!(regional.sts_endpoint(), "https://sts.eu-west-1.amazonaws.com");

        let global = DefaultCredentialsChain::with_vars(vars(&[]));
        assert_eq!(global.sts_endpoint(), "https://sts.amazonaws.com");

        let custom = DefaultCredentialsChain::with_vars(vars(&[
            ("AWS_REGION", "eu-west-1"),
            ("AWS_ENDPOINT_URL_STS", "http://127.0.0.1:4566"),
        ]));
        assert_eq!(custom.sts_endpoint(), "http://127.0.0.1:4566");
    }

    #[tokio::test]
    async fn unreadable_token_file_falls_through_to_shared_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[default]\naws_access_key_id = FILEKEY\naws_secret_access_key = filesecret"
        )
        .unwrap();
        let chain = DefaultCredentialsChain::with_vars(vars(&[
            ("AWS_WEB_IDENTITY_TOKEN_FILE", "/nonexistent/token"),
            ("AWS_ROLE_ARN", "arn:aws:iam::123456789012:role/agent"),
            ("AWS_SHARED_CREDENTIALS_FILE", file.path().to_str().unwrap()),
        ]));
        let creds = chain.credentials().await.unwrap();
        assert_eq!(creds.access_key_id, "FILEKEY");
    }
}
