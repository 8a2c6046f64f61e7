use std::{
    error::Error,
    fmt::Debug,
    io,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    str::FromStr,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use axum::{
    body::Body as AxumBody,
    response::{IntoResponse, Response as AxumResponse},
};
use bon::Builder;
use http::{
    HeaderMap, HeaderName, HeaderValue, Uri, Version,
    header::{CONNECTION, HOST, UPGRADE},
    uri::Authority,
};
use hyper::{Request, Response, StatusCode, body::Body};
use hyper_util::rt::TokioIo;
use tokio::{io::copy_bidirectional_with_sizes, net::TcpStream, time::timeout};
use tracing::{debug, info, warn};

use crate::router::{DEFAULT_HTTP_PORT, DomainRouter, RouteNotFound};

pub(crate) static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub(crate) static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub(crate) static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub(crate) static X_FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");

// Response whose body logs the request once it's been fully sent (or dropped).
struct TimedResponse {
    response: AxumResponse,
    log: Option<Box<dyn FnOnce() + Send + Sync + 'static>>,
}

struct TimedResponseBody {
    body: AxumBody,
    log: Option<Box<dyn FnOnce() + Send + Sync + 'static>>,
}

impl IntoResponse for TimedResponse {
    fn into_response(self) -> AxumResponse {
        let (parts, body) = self.response.into_parts();
        Response::from_parts(
            parts,
            AxumBody::new(TimedResponseBody {
                body,
                log: self.log,
            }),
        )
    }
}

impl Body for TimedResponseBody {
    type Data = bytes::Bytes;

    type Error = axum::Error;

    #[inline]
    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<hyper::body::Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.body).poll_frame(cx)
    }

    #[inline]
    fn size_hint(&self) -> hyper::body::SizeHint {
        self.body.size_hint()
    }

    #[inline]
    fn is_end_stream(&self) -> bool {
        self.body.is_end_stream()
    }
}

impl Drop for TimedResponseBody {
    fn drop(&mut self) {
        if let Some(log) = self.log.take() {
            (log)()
        }
    }
}

#[derive(Builder)]
struct HttpLog {
    ip: IpAddr,
    status: u16,
    method: String,
    host: String,
    uri: String,
    local_port: u16,
    elapsed_time: Duration,
}

fn http_log(data: HttpLog) {
    let HttpLog {
        ip,
        status,
        method,
        host,
        uri,
        local_port,
        elapsed_time,
    } = data;
    info!(
        %status,
        %method,
        %host,
        %uri,
        %ip,
        %local_port,
        elapsed = ?elapsed_time,
        "Proxied request."
    );
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum HttpError {
    #[error("Hyper error: {0}")]
    HyperError(#[from] hyper::Error),
    #[error(transparent)]
    RouteNotFound(#[from] RouteNotFound),
    #[error("Header to string error: {0}")]
    HeaderToStrError(#[from] http::header::ToStrError),
    #[error("Missing URI host")]
    MissingUriHost,
    #[error("Missing Host header")]
    MissingHostHeader,
    #[error("Invalid Host header")]
    InvalidHostHeader,
    #[error("Invalid HTTP version {0:?}")]
    InvalidHttpVersion(Version),
    #[error("Unable to reach local port {port}: {source}")]
    UpstreamUnavailable { port: u16, source: io::Error },
    #[error("Request timeout")]
    RequestTimeout,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> AxumResponse {
        debug!(error = %self, "HTTP proxy error.");
        let status = match self {
            HttpError::HeaderToStrError(_)
            | HttpError::MissingUriHost
            | HttpError::MissingHostHeader
            | HttpError::InvalidHostHeader
            | HttpError::InvalidHttpVersion(_) => StatusCode::BAD_REQUEST,
            HttpError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            HttpError::UpstreamUnavailable { .. } | HttpError::HyperError(_) => {
                StatusCode::BAD_GATEWAY
            }
            HttpError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        };
        (status, format!("{self}\n")).into_response()
    }
}

// Data shared between every request handled by the reverse proxy.
#[derive(Builder)]
pub(crate) struct ProxyData {
    // Routes from the request's host to a local port.
    router: Arc<DomainRouter>,
    // Address where forwarded sessions listen.
    upstream_address: IpAddr,
    // Port the proxy itself listens on, for X-Forwarded-Port.
    listen_port: u16,
    // Buffer size for bidirectional copying of upgraded connections.
    buffer_size: usize,
    // Optional duration until an outgoing request is canceled.
    http_request_timeout: Option<Duration>,
}

// Append a value to a header, keeping any value set by a previous proxy.
pub(crate) fn append_to_header(headers: &mut HeaderMap, name: &HeaderName, value: &str) {
    let Ok(value) = HeaderValue::from_str(value) else {
        return;
    };
    match headers.get(name).map(|existing| existing.as_bytes().to_vec()) {
        Some(mut existing) if !existing.is_empty() => {
            existing.extend_from_slice(b", ");
            existing.extend_from_slice(value.as_bytes());
            if let Ok(value) = HeaderValue::from_bytes(&existing) {
                headers.insert(name, value);
            }
        }
        _ => {
            headers.insert(name, value);
        }
    }
}

// Split a Host header or URI authority into a lowercase host and its declared port.
pub(crate) fn parse_host(value: &str) -> Result<(String, u16), HttpError> {
    let authority = Authority::from_str(value).map_err(|_| HttpError::InvalidHostHeader)?;
    if authority.host().is_empty() {
        return Err(HttpError::InvalidHostHeader);
    }
    Ok((
        authority.host().to_ascii_lowercase(),
        authority.port_u16().unwrap_or(DEFAULT_HTTP_PORT),
    ))
}

// Receive an HTTP request and proxy it to the local port of the matching route,
// with a possible upgrade to WebSocket.
pub(crate) async fn proxy_handler<B>(
    request: Request<B>,
    tcp_address: SocketAddr,
    proxy_data: Arc<ProxyData>,
) -> color_eyre::Result<AxumResponse>
where
    B: Body + Debug + Send + Unpin + 'static,
    <B as Body>::Data: Send + Sync + 'static,
    <B as Body>::Error: Error + Send + Sync + 'static,
{
    match proxy_handler_inner(request, tcp_address, proxy_data).await {
        Ok(response) => Ok(response.into_response()),
        Err(error) => Ok(error.into_response()),
    }
}

#[cfg_attr(
    not(coverage_nightly),
    tracing::instrument(skip(proxy_data), level = "debug")
)]
async fn proxy_handler_inner<B>(
    mut request: Request<B>,
    tcp_address: SocketAddr,
    proxy_data: Arc<ProxyData>,
) -> Result<TimedResponse, HttpError>
where
    B: Body + Debug + Send + Unpin + 'static,
    <B as Body>::Data: Send + Sync + 'static,
    <B as Body>::Error: Error + Send + Sync + 'static,
{
    let timer = Instant::now();
    // Retrieve host and declared port from the headers
    let (host, port) = match request.version() {
        Version::HTTP_2 => parse_host(
            request
                .uri()
                .authority()
                .ok_or(HttpError::MissingUriHost)?
                .as_str(),
        )?,
        Version::HTTP_10 | Version::HTTP_11 => match request.headers().get(HOST) {
            Some(header_value) => parse_host(header_value.to_str()?)?,
            None => return Err(HttpError::MissingHostHeader),
        },
        version => return Err(HttpError::InvalidHttpVersion(version)),
    };
    let local_port = proxy_data.router.resolve(&host, port)?;
    let ip = tcp_address.ip().to_canonical();
    let http_log_builder = HttpLog::builder()
        .ip(ip)
        .host(host.clone())
        .uri(request.uri().path().into())
        .method(request.method().as_str().into())
        .local_port(local_port);

    // Add proxied info to the proper headers, but don't overwrite any existing proxy headers
    let headers = request.headers_mut();
    append_to_header(headers, &X_FORWARDED_FOR, &ip.to_string());
    append_to_header(headers, &X_FORWARDED_HOST, &host);
    append_to_header(headers, &X_FORWARDED_PROTO, "http");
    append_to_header(
        headers,
        &X_FORWARDED_PORT,
        &proxy_data.listen_port.to_string(),
    );
    // Ensure the upstream request is in origin-form with a Host header
    if !request.headers().contains_key(HOST) {
        let authority = if port == DEFAULT_HTTP_PORT {
            host.clone()
        } else {
            format!("{host}:{port}")
        };
        if let Ok(value) = HeaderValue::from_str(&authority) {
            request.headers_mut().insert(HOST, value);
        }
    }
    let origin_form = request
        .uri()
        .path_and_query()
        .and_then(|path| Uri::from_str(path.as_str()).ok())
        .unwrap_or_else(|| Uri::from_static("/"));
    *request.uri_mut() = origin_form;
    *request.version_mut() = Version::HTTP_11;

    let stream = TcpStream::connect((proxy_data.upstream_address, local_port))
        .await
        .map_err(|source| HttpError::UpstreamUnavailable {
            port: local_port,
            source,
        })?;
    if let Err(error) = stream.set_nodelay(true) {
        warn!(%error, %local_port, "Error setting nodelay.");
    }
    // Create an HTTP/1.1 handshake over the forwarded session
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

    // Check for an Upgrade header
    let upgrade = match request.headers().get(UPGRADE) {
        Some(value) => Some(value.to_str()?.to_string()),
        None => None,
    };
    let Some(request_type) = upgrade else {
        // If Upgrade header is not present, simply handle the request
        tokio::spawn(async move {
            if let Err(error) = conn.await {
                warn!(%error, "HTTP/1.1 connection failed.");
            }
        });
        let response = send_request(&mut sender, request, proxy_data.http_request_timeout).await?;
        let http_log_builder = http_log_builder.status(response.status().as_u16());
        return Ok(TimedResponse {
            response: response.into_response(),
            log: Some(Box::new(move || {
                http_log(http_log_builder.elapsed_time(timer.elapsed()).build())
            })),
        });
    };

    tokio::spawn(async move {
        if let Err(error) = conn.with_upgrades().await {
            warn!(%error, "HTTP/1.1 connection with upgrades failed.");
        }
    });
    // Keep the upgrade request headers for the local service.
    request
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("upgrade"));
    // Retrieve the OnUpgrade from the incoming request
    let upgraded_request = hyper::upgrade::on(&mut request);
    let mut response = send_request(&mut sender, request, proxy_data.http_request_timeout).await?;
    // Check if the underlying server accepts the Upgrade request
    let accepted = response.status() == StatusCode::SWITCHING_PROTOCOLS
        && response
            .headers()
            .get(UPGRADE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case(&request_type));
    if accepted {
        // Retrieve the upgraded connection from the response
        let upgraded_response = hyper::upgrade::on(&mut response).await?;
        let buffer_size = proxy_data.buffer_size;
        // Start a task to copy data between the two upgraded parts
        tokio::spawn(async move {
            let upgraded_request = match upgraded_request.await {
                Ok(upgraded) => upgraded,
                Err(error) => {
                    warn!(%error, "Client connection failed to upgrade.");
                    return;
                }
            };
            let mut upgraded_request = TokioIo::new(upgraded_request);
            let mut upgraded_response = TokioIo::new(upgraded_response);
            let _ = copy_bidirectional_with_sizes(
                &mut upgraded_response,
                &mut upgraded_request,
                buffer_size,
                buffer_size,
            )
            .await;
        });
    }
    let http_log_builder = http_log_builder.status(response.status().as_u16());
    Ok(TimedResponse {
        response: response.into_response(),
        log: Some(Box::new(move || {
            http_log(http_log_builder.elapsed_time(timer.elapsed()).build())
        })),
    })
}

async fn send_request<B>(
    sender: &mut hyper::client::conn::http1::SendRequest<B>,
    request: Request<B>,
    request_timeout: Option<Duration>,
) -> Result<Response<hyper::body::Incoming>, HttpError>
where
    B: Body + Send + 'static,
    <B as Body>::Data: Send,
    <B as Body>::Error: Into<Box<dyn Error + Send + Sync>>,
{
    match request_timeout {
        // Await for a response under the given duration.
        Some(duration) => match timeout(duration, sender.send_request(request)).await {
            Ok(response) => Ok(response?),
            Err(_) => Err(HttpError::RequestTimeout),
        },
        None => Ok(sender.send_request(request).await?),
    }
}
