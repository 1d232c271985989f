use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, stream};
use hyper::body::{HttpBody, to_bytes};
use hyper::client::HttpConnector;
use hyper::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use hyper::{Body, Client, Request, Response, StatusCode, Uri};
use hyper_rustls::HttpsConnector;
use rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore};
use tokio::time::timeout;
use webpki_roots::TLS_SERVER_ROOTS;

use crate::traits::{GatewayResult, TransportError};

pub(crate) type HyperClient = Client<HttpsConnector<HttpConnector>, Body>;

#[allow(clippy::unnecessary_wraps)]
pub(crate) fn build_https_client() -> GatewayResult<HyperClient> {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(TLS_SERVER_ROOTS.iter().map(|anchor| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            anchor.subject,
            anchor.spki,
            anchor.name_constraints,
        )
    }));

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let mut http = HttpConnector::new();
    http.enforce_http(false);

    let connector = HttpsConnector::from((http, Arc::new(config)));

    Ok(Client::builder().build::<_, Body>(connector))
}

/// Normalises a provider base URL so endpoint paths can be appended.
pub(crate) fn sanitize_base_url(provider: &str, input: &str) -> GatewayResult<String> {
    let mut base = input.trim().to_owned();
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(TransportError::configuration(format!(
            "{provider} base URL must start with http:// or https://"
        )));
    }
    if !base.ends_with('/') {
        base.push('/');
    }
    base.parse::<Uri>().map_err(|err| {
        TransportError::configuration(format!("invalid {provider} base URL: {err}"))
    })?;
    Ok(base)
}

/// Posts a JSON payload and returns the response once headers arrive.
///
/// Non-success statuses are drained and mapped through [`status_error`].
pub(crate) async fn post_json(
    client: &HyperClient,
    provider: &str,
    endpoint: &Uri,
    headers: &[(HeaderName, String)],
    body: Vec<u8>,
    limit: Duration,
) -> GatewayResult<Response<Body>> {
    let mut builder = Request::post(endpoint.clone()).header(CONTENT_TYPE, "application/json");
    for (name, value) in headers {
        builder = builder.header(name, value.as_str());
    }

    let request = builder.body(Body::from(body)).map_err(|err| {
        TransportError::rejected(format!("failed to build {provider} request: {err}"))
    })?;

    let response = timeout(limit, client.request(request))
        .await
        .map_err(|_| TransportError::unavailable(format!("{provider} request timed out")))?
        .map_err(|err| TransportError::unavailable(format!("{provider} request failed: {err}")))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(response.headers());
    let bytes = to_bytes(response.into_body()).await.unwrap_or_default();
    Err(status_error(
        provider,
        status,
        retry_after,
        &String::from_utf8_lossy(&bytes),
    ))
}

/// Reads the complete body of a successful response.
pub(crate) async fn read_body(provider: &str, response: Response<Body>) -> GatewayResult<Vec<u8>> {
    to_bytes(response.into_body())
        .await
        .map(|bytes| bytes.to_vec())
        .map_err(|err| TransportError::unavailable(format!("failed to read {provider} response: {err}")))
}

/// Maps an HTTP status onto the transport error taxonomy.
pub(crate) fn status_error(
    provider: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> TransportError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        TransportError::RateLimited { retry_after }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        TransportError::unavailable(format!("{provider} returned {status}: {body}"))
    } else {
        TransportError::rejected(format!("{provider} returned {status}: {body}"))
    }
}

fn parse_retry_after(headers: &HeaderMap<HeaderValue>) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Splits raw byte chunks into newline-terminated text lines.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Appends bytes and returns every complete, non-blank line.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line).trim().to_owned();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        lines
    }

    /// Returns the trailing unterminated line, if any.
    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&rest).trim().to_owned();
        (!text.is_empty()).then_some(text)
    }
}

struct LineState {
    body: Body,
    buffer: LineBuffer,
    ready: VecDeque<String>,
    exhausted: bool,
    provider: &'static str,
}

/// Streams a response body as text lines.
pub(crate) fn body_lines(
    provider: &'static str,
    body: Body,
) -> impl Stream<Item = GatewayResult<String>> + Send {
    let state = LineState {
        body,
        buffer: LineBuffer::default(),
        ready: VecDeque::new(),
        exhausted: false,
        provider,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.ready.pop_front() {
                return Some((Ok(line), state));
            }
            if state.exhausted {
                return None;
            }
            match state.body.data().await {
                Some(Ok(bytes)) => state.ready.extend(state.buffer.push(&bytes)),
                Some(Err(err)) => {
                    state.exhausted = true;
                    let error = TransportError::unavailable(format!(
                        "{} stream interrupted: {err}",
                        state.provider
                    ));
                    return Some((Err(error), state));
                }
                None => {
                    state.exhausted = true;
                    state.ready.extend(state.buffer.finish());
                }
            }
        }
    })
}
