//! Looks up the signaling channel endpoints and relay servers through the
//! Kinesis Video control plane.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header::CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use time::OffsetDateTime;
use url::Url;

use crate::auth::{Credentials, SigningError, UrlSigner};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl ConnectivityServer {
    /// The regional STUN server every viewer gets first.
    pub fn regional_stun(region: &str) -> Self {
        Self {
            urls: vec![format!("stun:stun.kinesisvideo.{region}.amazonaws.com:443")],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub channel_arn: String,
    pub wss_endpoint: String,
    pub https_endpoint: String,
    pub ice_servers: Vec<ConnectivityServer>,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{operation} returned {status}: {body}")]
    UnexpectedStatus {
        operation: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("request encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("channel has no {0} endpoint for viewers")]
    MissingEndpoint(&'static str),
}

#[async_trait]
pub trait ConnectionInfoResolver: Send + Sync {
    async fn resolve(
        &self,
        channel_name: &str,
        client_id: &str,
        credentials: &Credentials,
    ) -> Result<ConnectionInfo, ResolveError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeChannelResponse {
    channel_info: ChannelInfo,
}

#[derive(Debug, Deserialize)]
struct ChannelInfo {
    #[serde(rename = "ChannelARN")]
    channel_arn: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EndpointResponse {
    #[serde(default)]
    resource_endpoint_list: Vec<ResourceEndpoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResourceEndpoint {
    protocol: String,
    resource_endpoint: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IceConfigResponse {
    #[serde(default)]
    ice_server_list: Vec<IceServer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IceServer {
    #[serde(default)]
    uris: Vec<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    ttl: Option<u64>,
}

#[derive(Clone)]
pub struct KinesisVideoResolver {
    http: Client,
    region: String,
    control_plane: String,
    signer: UrlSigner,
}

impl KinesisVideoResolver {
    pub fn new(region: impl Into<String>, control_plane: impl Into<String>) -> Self {
        let region = region.into();
        Self {
            http: Client::new(),
            signer: UrlSigner::new(region.clone()),
            control_plane: control_plane.into().trim_end_matches('/').to_string(),
            region,
        }
    }

    pub fn default_control_plane(region: &str) -> String {
        format!("https://kinesisvideo.{region}.amazonaws.com")
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        url: Url,
        body: Value,
        credentials: &Credentials,
    ) -> Result<T, ResolveError>
    where
        T: DeserializeOwned,
    {
        let body = serde_json::to_vec(&body)?;
        let headers = self.signer.sign_request_headers(
            "POST",
            &url,
            &body,
            credentials,
            OffsetDateTime::now_utc(),
        )?;
        let mut request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let res = request.send().await?;
        if res.status().is_success() {
            Ok(res.json::<T>().await?)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(ResolveError::UnexpectedStatus {
                operation,
                status,
                body,
            })
        }
    }
}

#[async_trait]
impl ConnectionInfoResolver for KinesisVideoResolver {
    async fn resolve(
        &self,
        channel_name: &str,
        client_id: &str,
        credentials: &Credentials,
    ) -> Result<ConnectionInfo, ResolveError> {
        let control_plane = Url::parse(&self.control_plane)?;

        let described: DescribeChannelResponse = self
            .call(
                "DescribeSignalingChannel",
                control_plane.join("/describeSignalingChannel")?,
                json!({ "ChannelName": channel_name }),
                credentials,
            )
            .await?;
        let channel_arn = described.channel_info.channel_arn;
        tracing::debug!(target: "kvs_agent::resolver", channel_arn = %channel_arn, "resolved channel arn");

        let endpoints: EndpointResponse = self
            .call(
                "GetSignalingChannelEndpoint",
                control_plane.join("/getSignalingChannelEndpoint")?,
                json!({
                    "ChannelARN": channel_arn,
                    "SingleMasterChannelEndpointConfiguration": {
                        "Protocols": ["WSS", "HTTPS"],
                        "Role": "VIEWER",
                    },
                }),
                credentials,
            )
            .await?;
        let endpoint_for = |protocol: &'static str| {
            endpoints
                .resource_endpoint_list
                .iter()
                .find(|endpoint| endpoint.protocol.eq_ignore_ascii_case(protocol))
                .map(|endpoint| endpoint.resource_endpoint.clone())
                .ok_or(ResolveError::MissingEndpoint(protocol))
        };
        let wss_endpoint = endpoint_for("WSS")?;
        let https_endpoint = endpoint_for("HTTPS")?;

        let ice_config: IceConfigResponse = self
            .call(
                "GetIceServerConfig",
                Url::parse(&https_endpoint)?.join("/v1/get-ice-server-config")?,
                json!({
                    "ChannelARN": channel_arn,
                    "ClientId": client_id,
                    "Service": "TURN",
                }),
                credentials,
            )
            .await?;

        let mut ice_servers = vec![ConnectivityServer::regional_stun(&self.region)];
        ice_servers.extend(
            ice_config
                .ice_server_list
                .into_iter()
                .filter(|server| !server.uris.is_empty())
                .map(|server| {
                    tracing::debug!(
                        target: "kvs_agent::resolver",
                        uris = ?server.uris,
                        ttl = ?server.ttl,
                        "turn server"
                    );
                    ConnectivityServer {
                        urls: server.uris,
                        username: server.username,
                        credential: server.password,
                    }
                }),
        );

        tracing::info!(
            target: "kvs_agent::resolver",
            wss = %wss_endpoint,
            https = %https_endpoint,
            servers = ice_servers.len(),
            "resolved signaling channel"
        );
        Ok(ConnectionInfo {
            channel_arn,
            wss_endpoint,
            https_endpoint,
            ice_servers,
        })
    }
}
