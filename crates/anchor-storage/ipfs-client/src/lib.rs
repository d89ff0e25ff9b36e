use std::time::Duration;

use base64::{
    Engine,
    engine::general_purpose::STANDARD,
};
use reqwest::{
    Client,
    RequestBuilder,
    StatusCode,
    multipart,
};
use serde::{
    Deserialize,
    Serialize,
    de::DeserializeOwned,
};
use tracing::{
    debug,
    warn,
};
use url::Url;

pub use anchor_storage_core::ContentId;

pub mod unixfs;

/// Connection and retry settings for [`IpfsClient`].
#[derive(Debug, Clone)]
pub struct IpfsConfig {
    /// Base URL of the IPFS HTTP API, e.g. `http://localhost:5001`.
    pub url: String,
    /// Upper bound for a single request attempt, body included.
    pub timeout: Duration,
    /// Additional attempts made after a transport failure.
    pub max_retries: u32,
    pub delay_between_retries: Duration,
}

impl Default for IpfsConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5001".to_string(),
            timeout: Duration::from_secs(10),
            max_retries: 3,
            delay_between_retries: Duration::from_millis(100),
        }
    }
}

/// A client for the IPFS HTTP API.
///
/// Every request is raced against the configured timeout. The losing request
/// future is dropped, which aborts the underlying connection.
///
/// ``` no_run
/// use anchor_storage_ipfs::{IpfsClient, IpfsConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let ipfs = IpfsClient::new(IpfsConfig::default()).unwrap();
///     let id = ipfs.add("hello").await.unwrap();
///     let object = ipfs.read(&id).await.unwrap();
///     assert_eq!(object.content, "hello");
/// }
/// ```
#[derive(Debug, Clone)]
pub struct IpfsClient {
    client: Client,
    base_url: Url,
    config: IpfsConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum IpfsClientError {
    #[error("IPFS gateway error: {0}")]
    GatewayError(#[from] reqwest::Error),
    #[error("IPFS gateway returned HTTP {0}")]
    HttpStatus(StatusCode),
    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),
    #[error("Malformed IPFS response: {0}")]
    MalformedResponse(String),
    #[error("IPFS gateway reported an error: {0}")]
    GatewayReportedError(String),
    #[error("IPFS request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Content not found: {0}")]
    NotFound(ContentId),
}

impl IpfsClientError {
    /// Transport failures and server side errors are worth another attempt.
    fn is_transient(&self) -> bool {
        match self {
            Self::GatewayError(err) => !err.is_decode(),
            Self::HttpStatus(status) => status.is_server_error(),
            _ => false,
        }
    }
}

/// An object read back from IPFS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpfsObject {
    pub content: String,
    /// Size of the marshaled UnixFS node, the same measure `object/stat`
    /// reports as `DataSize`.
    pub ipfs_size: u64,
    pub ipfs_links: Vec<IpfsLink>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpfsLink {
    pub name: String,
    pub hash: String,
    pub size: u64,
}

/// Error body returned with a non-success status.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorEnvelope {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AddResponse {
    hash: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ObjectGetResponse {
    #[serde(rename = "Type")]
    kind: Option<String>,
    message: Option<String>,
    data: Option<String>,
    #[serde(default)]
    links: Vec<IpfsLink>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ObjectStatResponse {
    data_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PinResponse {
    pins: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmConnectResponse {
    #[serde(rename = "Type")]
    kind: Option<String>,
    message: Option<String>,
    strings: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BootstrapListResponse {
    peers: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IdResponse {
    #[serde(rename = "ID")]
    id: Option<String>,
}

impl IpfsClient {
    /// Create a new IPFS client
    pub fn new(config: IpfsConfig) -> Result<Self, IpfsClientError> {
        let base_url = Url::parse(&config.url)?;
        let client = Client::builder().use_rustls_tls().build()?;

        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    pub fn config(&self) -> &IpfsConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> Result<Url, IpfsClientError> {
        Ok(self.base_url.join(&format!("api/v0/{path}"))?)
    }

    /// Sends the request built by `build`, retrying transient failures.
    ///
    /// The request is rebuilt for every attempt since multipart bodies can
    /// only be sent once.
    async fn request<T, F>(
        &self,
        operation: &'static str,
        timeout: Duration,
        build: F,
    ) -> Result<T, IpfsClientError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            metrics::counter!("anchor_storage_ipfs_requests_total", "operation" => operation)
                .increment(1);

            let result = match tokio::time::timeout(timeout, Self::execute(build())).await {
                Ok(result) => result,
                Err(_elapsed) => Err(IpfsClientError::Timeout(timeout)),
            };

            match result {
                Err(err) if err.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(target: "ipfs", operation, attempt, error = %err, "Retrying IPFS request");
                    tokio::time::sleep(self.config.delay_between_retries).await;
                }
                Err(err) => {
                    debug!(target: "ipfs", operation, error = %err, "IPFS request failed");
                    return Err(err);
                }
                Ok(value) => return Ok(value),
            }
        }
    }

    async fn execute<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, IpfsClientError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            return Err(match serde_json::from_slice::<ErrorEnvelope>(&body) {
                Ok(envelope) => IpfsClientError::GatewayReportedError(envelope.message),
                Err(_) => IpfsClientError::HttpStatus(status),
            });
        }

        serde_json::from_slice(&body).map_err(|e| IpfsClientError::MalformedResponse(e.to_string()))
    }

    /// Add `content` to IPFS and return its content id.
    pub async fn add(&self, content: &str) -> Result<ContentId, IpfsClientError> {
        let url = self.endpoint("add")?;
        let response: AddResponse = self
            .request("add", self.config.timeout, || {
                let part = multipart::Part::text(content.to_string()).file_name("data");
                self.client
                    .post(url.clone())
                    .multipart(multipart::Form::new().part("file", part))
            })
            .await?;

        response.hash.ok_or_else(|| {
            IpfsClientError::MalformedResponse("add response has no Hash field".to_string())
        })
    }

    /// Read the content stored under `id`.
    ///
    /// The payload is unwrapped from its UnixFS node and stripped of control
    /// characters other than line feeds.
    pub async fn read(&self, id: &str) -> Result<IpfsObject, IpfsClientError> {
        let url = self.endpoint("object/get")?;
        let response: ObjectGetResponse = self
            .request("object/get", self.config.timeout, || {
                self.client
                    .post(url.clone())
                    .query(&[("arg", id), ("data-encoding", "base64")])
            })
            .await?;

        if response.kind.as_deref() == Some("error") {
            return Err(IpfsClientError::GatewayReportedError(
                response.message.unwrap_or_default(),
            ));
        }

        let encoded = response.data.ok_or_else(|| {
            IpfsClientError::MalformedResponse("object/get response has no Data field".to_string())
        })?;
        let marshaled = STANDARD
            .decode(encoded)
            .map_err(|e| IpfsClientError::MalformedResponse(format!("invalid base64 data: {e}")))?;
        let payload = unixfs::unmarshal_data(&marshaled)
            .map_err(|e| IpfsClientError::MalformedResponse(format!("invalid unixfs node: {e}")))?;
        let content = std::str::from_utf8(payload)
            .map_err(|e| IpfsClientError::MalformedResponse(format!("content is not utf-8: {e}")))?;

        Ok(IpfsObject {
            content: unixfs::strip_control_characters(content),
            ipfs_size: marshaled.len() as u64,
            ipfs_links: response.links,
        })
    }

    /// Stored size of `id` as reported by `object/stat`, without fetching
    /// the content.
    pub async fn get_content_length(&self, id: &str) -> Result<u64, IpfsClientError> {
        let url = self.endpoint("object/stat")?;
        let response: ObjectStatResponse = self
            .request("object/stat", self.config.timeout, || {
                self.client.post(url.clone()).query(&[("arg", id)])
            })
            .await?;

        response.data_size.ok_or_else(|| {
            IpfsClientError::MalformedResponse(
                "object/stat response has no DataSize field".to_string(),
            )
        })
    }

    /// Pin `ids` in one batched request.
    ///
    /// `timeout` replaces the client's request timeout for this call, since
    /// pinning content that has to be fetched from peers can be slow.
    pub async fn pin(
        &self,
        ids: &[ContentId],
        timeout: Option<Duration>,
    ) -> Result<Vec<ContentId>, IpfsClientError> {
        let url = self.endpoint("pin/add")?;
        let args: Vec<(&str, &str)> = ids.iter().map(|id| ("arg", id.as_str())).collect();
        let response: PinResponse = self
            .request("pin/add", timeout.unwrap_or(self.config.timeout), || {
                self.client.post(url.clone()).query(&args)
            })
            .await?;

        response.pins.ok_or_else(|| {
            IpfsClientError::MalformedResponse("pin/add response has no Pins field".to_string())
        })
    }

    /// Connect the node to the peer at `multiaddr`.
    pub async fn swarm_connect(&self, multiaddr: &str) -> Result<Vec<String>, IpfsClientError> {
        let url = self.endpoint("swarm/connect")?;
        let response: SwarmConnectResponse = self
            .request("swarm/connect", self.config.timeout, || {
                self.client.post(url.clone()).query(&[("arg", multiaddr)])
            })
            .await?;

        if response.kind.as_deref() == Some("error") {
            return Err(IpfsClientError::GatewayReportedError(
                response.message.unwrap_or_default(),
            ));
        }

        Ok(response.strings.unwrap_or_default())
    }

    pub async fn bootstrap_list(&self) -> Result<Vec<String>, IpfsClientError> {
        let url = self.endpoint("bootstrap/list")?;
        let response: BootstrapListResponse = self
            .request("bootstrap/list", self.config.timeout, || {
                self.client.post(url.clone())
            })
            .await?;

        response.peers.ok_or_else(|| {
            IpfsClientError::MalformedResponse(
                "bootstrap/list response has no Peers field".to_string(),
            )
        })
    }

    /// Peer id of the connected node.
    pub async fn node_id(&self) -> Result<String, IpfsClientError> {
        let url = self.endpoint("id")?;
        let response: IdResponse = self
            .request("id", self.config.timeout, || self.client.post(url.clone()))
            .await?;

        response.id.ok_or_else(|| {
            IpfsClientError::MalformedResponse("id response has no ID field".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::{
        Mock,
        MockServer,
        ResponseTemplate,
        matchers::{
            method,
            path,
            query_param,
        },
    };

    use super::*;

    fn client_for(server: &MockServer) -> IpfsClient {
        IpfsClient::new(IpfsConfig {
            url: server.uri(),
            timeout: Duration::from_millis(500),
            max_retries: 2,
            delay_between_retries: Duration::from_millis(1),
        })
        .unwrap()
    }

    fn object_body(content: &str) -> serde_json::Value {
        json!({
            "Links": [],
            "Data": STANDARD.encode(unixfs::marshal_file(content.as_bytes())),
        })
    }

    #[tokio::test]
    async fn test_add_returns_hash() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/add"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Name": "data",
                "Hash": "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG",
                "Size": "13",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let id = client_for(&server).add("hello").await.unwrap();
        assert_eq!(id, "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG");
    }

    #[tokio::test]
    async fn test_add_without_hash_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/add"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Name": "data" })))
            .mount(&server)
            .await;

        let err = client_for(&server).add("hello").await.unwrap_err();
        assert_matches!(err, IpfsClientError::MalformedResponse(_));
    }

    #[tokio::test]
    async fn test_read_unwraps_unixfs_content() {
        let content = "first line\nsecond line with ünïcödé and 漢字";
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/object/get"))
            .and(query_param("arg", "QmContent"))
            .and(query_param("data-encoding", "base64"))
            .respond_with(ResponseTemplate::new(200).set_body_json(object_body(content)))
            .mount(&server)
            .await;

        let object = client_for(&server).read("QmContent").await.unwrap();

        assert_eq!(object.content, content);
        assert_eq!(
            object.ipfs_size,
            unixfs::marshal_file(content.as_bytes()).len() as u64
        );
        assert!(object.ipfs_links.is_empty());
    }

    #[tokio::test]
    async fn test_read_error_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/object/get"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Type": "error",
                "Message": "merkledag: not found",
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).read("QmMissing").await.unwrap_err();
        assert_matches!(err, IpfsClientError::GatewayReportedError(msg) if msg == "merkledag: not found");
    }

    #[tokio::test]
    async fn test_server_error_body_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/object/stat"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "Message": "invalid path \"nope\"",
                "Code": 0,
                "Type": "error",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server)
            .get_content_length("nope")
            .await
            .unwrap_err();
        assert_matches!(err, IpfsClientError::GatewayReportedError(_));
    }

    #[tokio::test]
    async fn test_content_length_from_stat() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/object/stat"))
            .and(query_param("arg", "QmContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Hash": "QmContent",
                "NumLinks": 0,
                "DataSize": 18,
            })))
            .mount(&server)
            .await;

        let length = client_for(&server)
            .get_content_length("QmContent")
            .await
            .unwrap();
        assert_eq!(length, 18);
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/object/stat"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v0/object/stat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "DataSize": 7 })))
            .expect(1)
            .mount(&server)
            .await;

        let length = client_for(&server)
            .get_content_length("QmContent")
            .await
            .unwrap();
        assert_eq!(length, 7);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/object/stat"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&server)
            .await;

        let err = client_for(&server)
            .get_content_length("QmContent")
            .await
            .unwrap_err();
        assert_matches!(err, IpfsClientError::HttpStatus(StatusCode::BAD_GATEWAY));
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/add"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "Hash": "QmLate" }))
                    .set_delay(Duration::from_secs(5)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server).add("slow").await.unwrap_err();
        assert_matches!(err, IpfsClientError::Timeout(_));
    }

    #[tokio::test]
    async fn test_pin_sends_every_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/pin/add"))
            .respond_with(|request: &wiremock::Request| {
                let pins: Vec<String> = request
                    .url
                    .query_pairs()
                    .filter(|(key, _)| key == "arg")
                    .map(|(_, value)| value.into_owned())
                    .collect();
                ResponseTemplate::new(200).set_body_json(json!({ "Pins": pins }))
            })
            .mount(&server)
            .await;

        let ids = vec!["QmOne".to_string(), "QmTwo".to_string()];
        let pinned = client_for(&server)
            .pin(&ids, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(pinned, ids);
    }

    #[tokio::test]
    async fn test_pin_without_pins_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/pin/add"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Progress": 1 })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .pin(&["QmOne".to_string()], None)
            .await
            .unwrap_err();
        assert_matches!(err, IpfsClientError::MalformedResponse(_));
    }

    #[tokio::test]
    async fn test_swarm_connect_error_type() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/swarm/connect"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Type": "error",
                "Message": "dial backoff",
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .swarm_connect("/dns4/peer.example/tcp/4001/ipfs/QmPeer")
            .await
            .unwrap_err();
        assert_matches!(err, IpfsClientError::GatewayReportedError(msg) if msg == "dial backoff");
    }
}
