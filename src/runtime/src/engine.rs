//! Container engine build client.
//!
//! - `BuildEngine`: the seam the build pipeline talks to.
//! - `DockerEngine`: Docker Engine API client backed by bollard, over a Unix
//!   socket or TCP.
//!
//! Engine responses are handed back as a lazy message stream; nothing is read
//! from the engine until the caller polls it.

use std::path::PathBuf;

use async_trait::async_trait;
use bollard::errors::Error as DockerError;
use bollard::models::BuildInfo;
use bollard::query_parameters::{BuildImageOptionsBuilder, TagImageOptionsBuilder};
use bollard::{ClientVersion, Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use http_body_util::{Either, Full};

use kiln_core::config::EngineConfig;
use kiln_core::error::{KilnError, Result};
use kiln_core::message::BuildMessage;

use crate::archive::ContextArchive;

/// Raw response chunks, e.g. a captured build log.
pub type ByteStream<'a> = BoxStream<'a, Result<Bytes>>;

/// Decoded build messages in arrival order. Dropping it abandons the response.
pub type MessageStream<'a> = BoxStream<'a, Result<BuildMessage>>;

/// Seconds bollard waits for the engine to answer a request.
const REQUEST_TIMEOUT_SECS: u64 = 600;

/// Options for a single build request.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOptions {
    /// Path of the Dockerfile inside the build context
    pub dockerfile: String,
    /// Tags applied to the resulting image
    pub tags: Vec<String>,
    /// Remove intermediate containers after a successful build
    pub remove_intermediate: bool,
}

/// A container engine able to run a build from a context archive.
#[async_trait]
pub trait BuildEngine: Send + Sync {
    /// Submit a build and return the engine's message stream.
    ///
    /// Only the first of `options.tags` is applied by the build itself; the
    /// caller adds the rest with [`tag_image`](Self::tag_image).
    async fn submit_build<'a>(
        &'a self,
        context: ContextArchive,
        options: &BuildOptions,
    ) -> Result<MessageStream<'a>>;

    /// Add `tag` (`repo[:tag]`) to an existing image.
    async fn tag_image(&self, image: &str, tag: &str) -> Result<()>;
}

/// Where the engine listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEndpoint {
    /// `unix:///var/run/docker.sock`
    Unix(PathBuf),
    /// `tcp://host:port`, stored as `host:port`
    Tcp(String),
}

impl EngineEndpoint {
    /// Parse a `DOCKER_HOST`-style address.
    pub fn parse(host: &str) -> Result<Self> {
        if let Some(path) = host.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(KilnError::ConfigError(format!(
                    "engine host '{}' has no socket path",
                    host
                )));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        let addr = host
            .strip_prefix("tcp://")
            .or_else(|| host.strip_prefix("http://"))
            .map(|a| a.trim_end_matches('/'))
            .ok_or_else(|| {
                KilnError::ConfigError(format!(
                    "unsupported engine host '{}' (expected unix:// or tcp://)",
                    host
                ))
            })?;

        if addr.is_empty() {
            return Err(KilnError::ConfigError(format!(
                "engine host '{}' has no address",
                host
            )));
        }
        Ok(Self::Tcp(addr.to_string()))
    }
}

impl std::fmt::Display for EngineEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

/// Docker Engine API client.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
    endpoint: EngineEndpoint,
}

impl DockerEngine {
    /// Create a client for `endpoint`, pinned to `api_version` (`1.41` or
    /// `v1.41`) when given.
    pub fn connect(endpoint: EngineEndpoint, api_version: Option<&str>) -> Result<Self> {
        let pinned = api_version.map(parse_api_version).transpose()?;
        let version = pinned.as_ref().unwrap_or(API_DEFAULT_VERSION);

        let docker = match &endpoint {
            #[cfg(unix)]
            EngineEndpoint::Unix(path) => {
                Docker::connect_with_unix(&path.to_string_lossy(), REQUEST_TIMEOUT_SECS, version)
            }
            #[cfg(not(unix))]
            EngineEndpoint::Unix(path) => {
                return Err(KilnError::ConfigError(format!(
                    "unix sockets are not supported on this platform: {}",
                    path.display()
                )))
            }
            EngineEndpoint::Tcp(addr) => {
                Docker::connect_with_http(addr, REQUEST_TIMEOUT_SECS, version)
            }
        }
        .map_err(|e| {
            KilnError::ConnectionError(format!(
                "Failed to connect to engine at {}: {}",
                endpoint, e
            ))
        })?;

        tracing::debug!(endpoint = %endpoint, "Engine client ready");
        Ok(Self { docker, endpoint })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::connect(
            EngineEndpoint::parse(&config.host)?,
            config.api_version.as_deref(),
        )
    }

    pub fn endpoint(&self) -> &EngineEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl BuildEngine for DockerEngine {
    async fn submit_build<'a>(
        &'a self,
        context: ContextArchive,
        options: &BuildOptions,
    ) -> Result<MessageStream<'a>> {
        let mut builder = BuildImageOptionsBuilder::default()
            .dockerfile(&options.dockerfile)
            .rm(options.remove_intermediate);
        if let Some(tag) = options.tags.first() {
            builder = builder.t(tag);
        }

        tracing::info!(
            endpoint = %self.endpoint,
            dockerfile = %options.dockerfile,
            context_bytes = context.len(),
            digest = %context.prefixed_digest(),
            "Submitting build"
        );

        let body = Either::Left(Full::new(Bytes::from(context.bytes)));
        let endpoint = self.endpoint.to_string();
        let mut position = 0usize;

        let messages = self
            .docker
            .build_image(builder.build(), None, Some(body))
            .map(move |item| {
                position += 1;
                into_message(item, position, &endpoint)
            });
        Ok(messages.boxed())
    }

    async fn tag_image(&self, image: &str, tag: &str) -> Result<()> {
        let (repo, version) = split_tag(tag);
        let mut builder = TagImageOptionsBuilder::default().repo(repo);
        if let Some(version) = version {
            builder = builder.tag(version);
        }

        self.docker
            .tag_image(image, Some(builder.build()))
            .await
            .map_err(|e| engine_error(e, 0, &self.endpoint.to_string()))?;
        tracing::debug!(image = %image, tag = %tag, "Tagged image");
        Ok(())
    }
}

/// Convert one item of bollard's build stream.
///
/// `position` is the 1-based index of the item in the response.
fn into_message(
    item: std::result::Result<BuildInfo, DockerError>,
    position: usize,
    endpoint: &str,
) -> Result<BuildMessage> {
    match item {
        Ok(info) => serde_json::to_value(&info)
            .and_then(serde_json::from_value)
            .map_err(|e| KilnError::DecodeError {
                line: position,
                reason: e.to_string(),
            }),
        // In-band build errors are surfaced by bollard as stream errors
        Err(DockerError::DockerStreamError { error, .. }) => Ok(BuildMessage::error(error)),
        Err(e) => Err(engine_error(e, position, endpoint)),
    }
}

/// Map a bollard failure onto the kiln error taxonomy.
fn engine_error(err: DockerError, position: usize, endpoint: &str) -> KilnError {
    match &err {
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => KilnError::EngineError {
            status: *status_code,
            message: message.clone(),
        },
        DockerError::JsonSerdeError { .. } => KilnError::DecodeError {
            line: position,
            reason: err.to_string(),
        },
        DockerError::RequestTimeoutError { .. } => {
            KilnError::TimeoutError(format!("engine at {} did not answer: {}", endpoint, err))
        }
        _ if position <= 1 => KilnError::ConnectionError(format!(
            "Failed to connect to engine at {}: {}",
            endpoint, err
        )),
        _ => KilnError::ConnectionError(format!(
            "Build response from {} interrupted: {}",
            endpoint, err
        )),
    }
}

/// Parse `1.41` / `v1.41` into a client version.
fn parse_api_version(version: &str) -> Result<ClientVersion> {
    let trimmed = version.trim().trim_start_matches('v');
    trimmed
        .split_once('.')
        .and_then(|(major, minor)| {
            Some(ClientVersion {
                major_version: major.parse().ok()?,
                minor_version: minor.parse().ok()?,
            })
        })
        .ok_or_else(|| {
            KilnError::ConfigError(format!(
                "invalid engine API version '{}' (expected MAJOR.MINOR)",
                version
            ))
        })
}

/// Split `repo[:tag]`, leaving a registry port (`host:5000/app`) in the repo.
fn split_tag(reference: &str) -> (&str, Option<&str>) {
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, Some(tag)),
        _ => (reference, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::BuildContext;
    use std::io::Read;
    use tempfile::TempDir;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
    use tokio::task::JoinHandle;

    fn options() -> BuildOptions {
        BuildOptions {
            dockerfile: "Dockerfile.abc".to_string(),
            tags: vec!["build:sample".to_string()],
            remove_intermediate: true,
        }
    }

    fn context() -> ContextArchive {
        BuildContext::single("Dockerfile.abc", "FROM alpine:3.8\n")
            .unwrap()
            .into_archive()
            .unwrap()
    }

    fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    /// Decode a chunked request body.
    fn dechunk(mut raw: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            let eol = find_subslice(raw, b"\r\n").unwrap();
            let size_field = String::from_utf8_lossy(&raw[..eol]).to_string();
            let size = usize::from_str_radix(size_field.split(';').next().unwrap().trim(), 16)
                .unwrap();
            raw = &raw[eol + 2..];
            if size == 0 {
                return body;
            }
            body.extend_from_slice(&raw[..size]);
            raw = &raw[size + 2..];
        }
    }

    /// Accept one connection, capture the request and reply with `response`.
    fn serve_once<F, C>(accept: F, response: Vec<u8>) -> JoinHandle<(String, Vec<u8>)>
    where
        F: std::future::Future<Output = C> + Send + 'static,
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut stream = accept.await;
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];

            let header_end = loop {
                let n = stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client closed before sending headers");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
                    break pos + 4;
                }
            };

            let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
            let header = |name: &str| {
                head.lines().find_map(|line| {
                    let (key, value) = line.split_once(':')?;
                    key.eq_ignore_ascii_case(name)
                        .then(|| value.trim().to_string())
                })
            };

            let body = if let Some(len) = header("content-length") {
                let len: usize = len.parse().unwrap();
                while buf.len() < header_end + len {
                    let n = stream.read(&mut chunk).await.unwrap();
                    assert!(n > 0, "client closed before sending body");
                    buf.extend_from_slice(&chunk[..n]);
                }
                buf[header_end..header_end + len].to_vec()
            } else if header("transfer-encoding").is_some() {
                while find_subslice(&buf[header_end..], b"0\r\n\r\n").is_none() {
                    let n = stream.read(&mut chunk).await.unwrap();
                    assert!(n > 0, "client closed before finishing body");
                    buf.extend_from_slice(&chunk[..n]);
                }
                dechunk(&buf[header_end..])
            } else {
                Vec::new()
            };

            stream.write_all(&response).await.unwrap();
            stream.shutdown().await.unwrap();
            (head, body)
        })
    }

    fn unix_server(
        dir: &TempDir,
        response: Vec<u8>,
    ) -> (EngineEndpoint, JoinHandle<(String, Vec<u8>)>) {
        let path = dir.path().join("engine.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let handle = serve_once(
            async move { listener.accept().await.unwrap().0 },
            response,
        );
        (EngineEndpoint::Unix(path), handle)
    }

    fn json_response(status: &str, body: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        )
        .into_bytes()
    }

    fn chunked(parts: &[&str]) -> Vec<u8> {
        let mut out = String::from(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
        );
        for part in parts {
            out.push_str(&format!("{:x}\r\n{}\r\n", part.len(), part));
        }
        out.push_str("0\r\n\r\n");
        out.into_bytes()
    }

    async fn collect(engine: &DockerEngine) -> Vec<Result<BuildMessage>> {
        engine
            .submit_build(context(), &options())
            .await
            .unwrap()
            .collect()
            .await
    }

    #[test]
    fn test_parse_unix_endpoint() {
        assert_eq!(
            EngineEndpoint::parse("unix:///var/run/docker.sock").unwrap(),
            EngineEndpoint::Unix(PathBuf::from("/var/run/docker.sock"))
        );
    }

    #[test]
    fn test_parse_tcp_endpoint() {
        assert_eq!(
            EngineEndpoint::parse("tcp://127.0.0.1:2375").unwrap(),
            EngineEndpoint::Tcp("127.0.0.1:2375".to_string())
        );
        assert_eq!(
            EngineEndpoint::parse("http://docker:2375/").unwrap(),
            EngineEndpoint::Tcp("docker:2375".to_string())
        );
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(matches!(
            EngineEndpoint::parse("npipe:////./pipe/docker_engine"),
            Err(KilnError::ConfigError(_))
        ));
        assert!(EngineEndpoint::parse("unix://").is_err());
        assert!(EngineEndpoint::parse("tcp://").is_err());
    }

    #[test]
    fn test_endpoint_display() {
        let endpoint = EngineEndpoint::parse("tcp://localhost:2375").unwrap();
        assert_eq!(endpoint.to_string(), "tcp://localhost:2375");
    }

    #[test]
    fn test_parse_api_version() {
        let version = parse_api_version("v1.41").unwrap();
        assert_eq!((version.major_version, version.minor_version), (1, 41));
        let version = parse_api_version("1.24").unwrap();
        assert_eq!((version.major_version, version.minor_version), (1, 24));

        assert!(matches!(
            parse_api_version("latest"),
            Err(KilnError::ConfigError(_))
        ));
        assert!(parse_api_version("1.x").is_err());
    }

    #[test]
    fn test_split_tag() {
        assert_eq!(split_tag("build:sample"), ("build", Some("sample")));
        assert_eq!(split_tag("app"), ("app", None));
        assert_eq!(
            split_tag("registry.local:5000/app:1.2"),
            ("registry.local:5000/app", Some("1.2"))
        );
        assert_eq!(
            split_tag("registry.local:5000/app"),
            ("registry.local:5000/app", None)
        );
    }

    #[tokio::test]
    async fn test_from_config_rejects_bad_version() {
        let config = EngineConfig {
            api_version: Some("one".to_string()),
            ..EngineConfig::default()
        };
        assert!(matches!(
            DockerEngine::from_config(&config),
            Err(KilnError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_build_over_unix_socket() {
        let dir = TempDir::new().unwrap();
        let body = "{\"stream\":\"Step 1/1 : FROM alpine:3.8\\n\"}\r\n{\"aux\":{\"ID\":\"sha256:beef\"}}\r\n";
        let (endpoint, server) = unix_server(&dir, json_response("200 OK", body));

        let engine = DockerEngine::connect(endpoint, Some("1.41")).unwrap();
        let archive = context();
        let messages: Vec<BuildMessage> = engine
            .submit_build(archive.clone(), &options())
            .await
            .unwrap()
            .map(|m| m.unwrap())
            .collect()
            .await;

        assert_eq!(
            messages[0].stream.as_deref(),
            Some("Step 1/1 : FROM alpine:3.8\n")
        );
        assert_eq!(messages[1].image_id(), Some("sha256:beef"));

        let (head, sent) = server.await.unwrap();
        assert!(head.starts_with("POST /v1.41/build?"), "head: {head}");
        assert!(head.contains("dockerfile=Dockerfile.abc"));
        assert!(head.contains("t=build%3Asample"));
        assert!(head.contains("rm=true"));
        assert!(head.to_lowercase().contains("content-type: application/x-tar"));
        assert_eq!(sent, archive.bytes);

        let mut tar = tar::Archive::new(&sent[..]);
        let mut entry = tar.entries().unwrap().next().unwrap().unwrap();
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some("Dockerfile.abc"));
        assert_eq!(content, "FROM alpine:3.8\n");
    }

    #[tokio::test]
    async fn test_submit_build_chunked_response() {
        let dir = TempDir::new().unwrap();
        let parts = ["{\"stream\":\"a\"}\r\n", "{\"str", "eam\":\"b\"}\r\n"];
        let (endpoint, server) = unix_server(&dir, chunked(&parts));

        let engine = DockerEngine::connect(endpoint, None).unwrap();
        let streams: Vec<Option<String>> = collect(&engine)
            .await
            .into_iter()
            .map(|m| m.unwrap().stream)
            .collect();
        assert_eq!(streams, vec![Some("a".to_string()), Some("b".to_string())]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_build_in_band_error() {
        let dir = TempDir::new().unwrap();
        let body = "{\"stream\":\"Step 1/2\\n\"}\r\n{\"errorDetail\":{\"message\":\"no such file\"},\"error\":\"no such file\"}\r\n";
        let (endpoint, server) = unix_server(&dir, json_response("200 OK", body));

        let engine = DockerEngine::connect(endpoint, None).unwrap();
        let mut messages = engine.submit_build(context(), &options()).await.unwrap();

        let first = messages.next().await.unwrap().unwrap();
        assert_eq!(first.stream.as_deref(), Some("Step 1/2\n"));
        let second = messages.next().await.unwrap().unwrap();
        assert!(second.is_error());
        assert_eq!(second.error_message().as_deref(), Some("no such file"));

        drop(messages);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_build_engine_rejects() {
        let dir = TempDir::new().unwrap();
        let body = r#"{"message":"Cannot locate specified Dockerfile: Dockerfile.abc"}"#;
        let (endpoint, server) =
            unix_server(&dir, json_response("500 Internal Server Error", body));

        let engine = DockerEngine::connect(endpoint, None).unwrap();
        let results = collect(&engine).await;
        match results.into_iter().next() {
            Some(Err(KilnError::EngineError { status, message })) => {
                assert_eq!(status, 500);
                assert_eq!(message, "Cannot locate specified Dockerfile: Dockerfile.abc");
            }
            other => panic!("expected EngineError, got {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_build_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = serve_once(
            async move { listener.accept().await.unwrap().0 },
            json_response("200 OK", "{\"stream\":\"ok\\n\"}\n"),
        );

        let engine =
            DockerEngine::connect(EngineEndpoint::Tcp(addr.to_string()), Some("1.41")).unwrap();
        let results = collect(&engine).await;
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].as_ref().unwrap().stream.as_deref(),
            Some("ok\n")
        );

        let (head, _) = server.await.unwrap();
        assert!(head.starts_with("POST /v1.41/build?"), "head: {head}");
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let dir = TempDir::new().unwrap();
        let missing = EngineEndpoint::Unix(dir.path().join("missing.sock"));

        let outcome: Result<()> = async {
            let engine = DockerEngine::connect(missing, None)?;
            let mut messages = engine.submit_build(context(), &options()).await?;
            match messages.next().await {
                Some(item) => item.map(|_| ()),
                None => Ok(()),
            }
        }
        .await;

        match outcome {
            Err(KilnError::ConnectionError(message)) => {
                assert!(message.starts_with("Failed to connect to engine at unix://"))
            }
            other => panic!("expected ConnectionError, got {other:?}"),
        }
    }
}
