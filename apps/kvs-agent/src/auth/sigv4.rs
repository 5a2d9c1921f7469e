//! AWS Signature Version 4 for the signaling channel URL (query variant) and
//! for control-plane requests (header variant).

use std::fmt;

use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::{Duration as TimeDuration, OffsetDateTime, UtcOffset};
use url::Url;

use super::credentials::Credentials;

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of a presigned channel URL.
pub const SIGNED_URL_LIFETIME_SECS: i64 = 299;
pub const SIGNALING_SERVICE: &str = "kinesisvideo";

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

// RFC 3986 unreserved characters stay literal, everything else is escaped.
const AWS_URI_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("credentials unavailable: access key or secret is empty")]
    CredentialsUnavailable,
    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
}

/// A presigned `wss://` URL. Consumed by exactly one channel-open attempt.
pub struct SignedChannelUrl {
    url: Url,
    expires_at: OffsetDateTime,
}

impl SignedChannelUrl {
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    pub(crate) fn into_url(self) -> Url {
        self.url
    }
}

impl fmt::Debug for SignedChannelUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedChannelUrl")
            .field("host", &self.url.host_str())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct UrlSigner {
    region: String,
    service: String,
}

impl UrlSigner {
    pub fn new(region: impl Into<String>) -> Self {
        Self::for_service(region, SIGNALING_SERVICE)
    }

    pub fn for_service(region: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            service: service.into(),
        }
    }

    pub fn sign(
        &self,
        base_endpoint: &str,
        channel_arn: &str,
        client_id: &str,
        credentials: &Credentials,
    ) -> Result<SignedChannelUrl, SigningError> {
        self.sign_at(
            base_endpoint,
            channel_arn,
            client_id,
            credentials,
            OffsetDateTime::now_utc(),
        )
    }

    pub fn sign_at(
        &self,
        base_endpoint: &str,
        channel_arn: &str,
        client_id: &str,
        credentials: &Credentials,
        now: OffsetDateTime,
    ) -> Result<SignedChannelUrl, SigningError> {
        let url = self.presign(
            base_endpoint,
            &[("X-Amz-ChannelARN", channel_arn), ("X-Amz-ClientId", client_id)],
            credentials,
            now,
            SIGNED_URL_LIFETIME_SECS,
        )?;
        Ok(SignedChannelUrl {
            url,
            expires_at: now + TimeDuration::seconds(SIGNED_URL_LIFETIME_SECS),
        })
    }

    /// Query-string presigning of a `GET` against `endpoint`.
    pub fn presign(
        &self,
        endpoint: &str,
        extra_params: &[(&str, &str)],
        credentials: &Credentials,
        now: OffsetDateTime,
        expires_secs: i64,
    ) -> Result<Url, SigningError> {
        if !credentials.is_usable() {
            return Err(SigningError::CredentialsUnavailable);
        }
        let mut url = parse_endpoint(endpoint)?;
        let host = host_header(&url, endpoint)?;
        let stamp = SigningTime::new(now);
        let scope = self.scope(&stamp);

        let mut params: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        params.extend(
            extra_params
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string())),
        );
        params.push(("X-Amz-Algorithm".into(), ALGORITHM.into()));
        params.push((
            "X-Amz-Credential".into(),
            format!("{}/{scope}", credentials.access_key_id),
        ));
        params.push(("X-Amz-Date".into(), stamp.amz_date.clone()));
        params.push(("X-Amz-Expires".into(), expires_secs.to_string()));
        if let Some(token) = &credentials.session_token {
            params.push(("X-Amz-Security-Token".into(), token.clone()));
        }
        params.push(("X-Amz-SignedHeaders".into(), "host".into()));

        let query = canonical_query(params);
        let canonical_request = format!(
            "GET\n{}\n{query}\nhost:{host}\n\nhost\n{UNSIGNED_PAYLOAD}",
            url.path()
        );
        let signature = self.signature(credentials, &stamp, &scope, &canonical_request);

        url.set_query(Some(&format!("{query}&X-Amz-Signature={signature}")));
        Ok(url)
    }

    /// Header signing for control-plane requests. Returns the headers to add,
    /// lowercase names, `authorization` last.
    pub fn sign_request_headers(
        &self,
        method: &str,
        url: &Url,
        body: &[u8],
        credentials: &Credentials,
        now: OffsetDateTime,
    ) -> Result<Vec<(String, String)>, SigningError> {
        if !credentials.is_usable() {
            return Err(SigningError::CredentialsUnavailable);
        }
        let host = host_header(url, url.as_str())?;
        let stamp = SigningTime::new(now);
        let scope = self.scope(&stamp);

        let mut headers = vec![
            ("host".to_string(), host),
            ("x-amz-date".to_string(), stamp.amz_date.clone()),
        ];
        if let Some(token) = &credentials.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort();

        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{name}:{}\n", value.trim()))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let query = canonical_query(url.query_pairs().into_owned().collect());
        let canonical_request = format!(
            "{method}\n{}\n{query}\n{canonical_headers}\n{signed_headers}\n{}",
            url.path(),
            hex::encode(Sha256::digest(body))
        );
        let signature = self.signature(credentials, &stamp, &scope, &canonical_request);

        let authorization = format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            credentials.access_key_id
        );
        let mut out: Vec<(String, String)> =
            headers.into_iter().filter(|(name, _)| name != "host").collect();
        out.push(("authorization".to_string(), authorization));
        Ok(out)
    }

    fn scope(&self, stamp: &SigningTime) -> String {
        format!(
            "{}/{}/{}/aws4_request",
            stamp.date, self.region, self.service
        )
    }

    fn signature(
        &self,
        credentials: &Credentials,
        stamp: &SigningTime,
        scope: &str,
        canonical_request: &str,
    ) -> String {
        let string_to_sign = format!(
            "{ALGORITHM}\n{}\n{scope}\n{}",
            stamp.amz_date,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let key = signing_key(
            &credentials.secret_access_key,
            &stamp.date,
            &self.region,
            &self.service,
        );
        hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()))
    }
}

struct SigningTime {
    amz_date: String,
    date: String,
}

impl SigningTime {
    fn new(now: OffsetDateTime) -> Self {
        let now = now.to_offset(UtcOffset::UTC);
        let date = format!(
            "{:04}{:02}{:02}",
            now.year(),
            u8::from(now.month()),
            now.day()
        );
        let amz_date = format!(
            "{date}T{:02}{:02}{:02}Z",
            now.hour(),
            now.minute(),
            now.second()
        );
        Self { amz_date, date }
    }
}

pub(crate) fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn canonical_query(mut params: Vec<(String, String)>) -> String {
    let mut encoded: Vec<(String, String)> = params
        .drain(..)
        .map(|(key, value)| (encode(&key), encode(&value)))
        .collect();
    encoded.sort();
    encoded
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, AWS_URI_ENCODE).to_string()
}

fn parse_endpoint(endpoint: &str) -> Result<Url, SigningError> {
    Url::parse(endpoint).map_err(|err| SigningError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: err.to_string(),
    })
}

fn host_header(url: &Url, endpoint: &str) -> Result<String, SigningError> {
    let host = url.host_str().ok_or_else(|| SigningError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: "missing host".into(),
    })?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
