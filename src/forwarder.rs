//! C7 — the forwarder: drives the full per-request lifecycle described in
//! SPEC_FULL §4.5, wiring the router, rewriter, usage parser, health
//! recorder and log store together around one shared HTTP client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use crate::cli::CliVariant;
use crate::error::ForwardError;
use crate::health::HealthRecorder;
use crate::rewrite::{build_forward_headers, filter_response_headers, rewrite_model_in_body, rewrite_model_in_path};
use crate::router::Router;
use crate::store::config_store::{ConfigStore, GatewaySettings, Provider, TimeoutSettings};
use crate::store::log_store::{LogStore, RequestLogEntry};
use crate::usage::parse_usage;

const NO_PROVIDER_PLACEHOLDER: &str = "[NO_PROVIDER]";
const LOG_BODY_TRUNCATE_AT: usize = 100_000;

pub struct Forwarder {
    client: reqwest::Client,
    config_store: Arc<ConfigStore>,
    log_store: Arc<LogStore>,
    router: Router,
    health: Arc<HealthRecorder>,
}

impl Forwarder {
    pub fn new(config_store: Arc<ConfigStore>, log_store: Arc<LogStore>) -> Self {
        let router = Router::new(config_store.clone(), log_store.clone());
        let health = Arc::new(HealthRecorder::new(config_store.clone(), log_store.clone()));
        Self {
            client: Self::build_client(),
            config_store,
            log_store,
            router,
            health,
        }
    }

    /// One shared client for the process lifetime (SPEC_FULL §5) — every
    /// forward borrows a pooled connection rather than opening a fresh one.
    fn build_client() -> reqwest::Client {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(20)
            .build()
            .expect("static client configuration is always valid")
    }

    #[tracing::instrument(
        skip(self, headers, body),
        fields(cli_type = tracing::field::Empty, provider = tracing::field::Empty, request_id = %Uuid::new_v4())
    )]
    pub async fn forward(&self, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
        let start = Instant::now();
        let now = now_epoch();
        let client_method = method.to_string();
        let client_path = uri.to_string();

        let cli_type = CliVariant::detect(
            headers
                .get(axum::http::header::USER_AGENT)
                .and_then(|v| v.to_str().ok()),
        );
        tracing::Span::current().record("cli_type", tracing::field::display(cli_type));

        let provider = match self.router.select(cli_type, now).await {
            Ok(Some(provider)) => provider,
            Ok(None) => {
                self.log_request(RequestLogEntry {
                    cli_type: cli_type.as_str().to_string(),
                    provider_name: NO_PROVIDER_PLACEHOLDER.to_string(),
                    success: false,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    client_method,
                    client_path,
                    error_message: Some("no healthy provider available".to_string()),
                    ..Default::default()
                })
                .await;
                return ForwardError::NoProvider.into_response();
            }
            Err(e) => {
                tracing::error!(error = %e, "provider selection failed");
                return ForwardError::UpstreamError(e.to_string()).into_response();
            }
        };
        tracing::Span::current().record("provider", tracing::field::display(&provider.name));

        let timeouts = self
            .config_store
            .get_timeout_settings()
            .await
            .unwrap_or(TimeoutSettings {
                stream_first_byte_timeout: 30,
                stream_idle_timeout: 60,
                non_stream_timeout: 120,
            });
        let gateway_settings = self
            .config_store
            .get_gateway_settings()
            .await
            .unwrap_or(GatewaySettings { debug_log: false });

        let model_maps = self.config_store.list_model_maps(provider.id).await.unwrap_or_default();

        let path = uri.path().trim_start_matches('/').to_string();
        let query = uri.query().map(|q| format!("?{q}")).unwrap_or_default();

        let (forward_path, model_id) = if cli_type == CliVariant::C {
            let (rewritten, info) = rewrite_model_in_path(&path, &model_maps);
            (rewritten, info.final_model)
        } else {
            (path, None)
        };

        let (forward_body, model_id) = if matches!(cli_type, CliVariant::A | CliVariant::B) {
            let (rewritten, info) = rewrite_model_in_body(&body, &model_maps);
            (rewritten, info.final_model)
        } else {
            (body.to_vec(), model_id)
        };

        let base = provider.base_url.trim_end_matches('/');
        let url = format!("{base}/{forward_path}{query}");
        let forward_headers = build_forward_headers(&headers, cli_type, &provider.api_key);
        let streaming = classify_stream(cli_type, &forward_path, &forward_body);

        let common = RequestContext {
            start,
            now,
            cli_type,
            provider,
            model_id,
            client_method,
            client_path,
            debug_log: gateway_settings.debug_log,
        };

        if streaming {
            self.forward_streaming(method, url, forward_headers, forward_body, timeouts, common)
                .await
        } else {
            self.forward_non_streaming(method, url, forward_headers, forward_body, timeouts, common)
                .await
        }
    }

    async fn forward_non_streaming(
        &self,
        method: Method,
        url: String,
        headers: HeaderMap,
        body: Vec<u8>,
        timeouts: TimeoutSettings,
        ctx: RequestContext,
    ) -> Response {
        let send = self
            .client
            .request(method, url.as_str())
            .headers(headers)
            .body(body)
            .timeout(Duration::from_secs(timeouts.non_stream_timeout))
            .send()
            .await;

        let upstream = match send {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                self.health.record_failure(ctx.provider.id, ctx.now).await.ok();
                self.record_usage(&ctx, false, 0, 0).await;
                if ctx.debug_log {
                    self.log_request(ctx.into_entry(None, false, None, Some("Upstream timeout".to_string())))
                        .await;
                }
                return ForwardError::UpstreamTimeout.into_response();
            }
            Err(e) => {
                self.health.record_failure(ctx.provider.id, ctx.now).await.ok();
                self.record_usage(&ctx, false, 0, 0).await;
                if ctx.debug_log {
                    self.log_request(ctx.into_entry(None, false, None, Some(e.to_string()))).await;
                }
                return ForwardError::UpstreamError(e.to_string()).into_response();
            }
        };

        let status = upstream.status();
        let response_headers = filter_response_headers(upstream.headers(), &ctx.provider.name);
        let response_bytes = match upstream.bytes().await {
            Ok(b) => b,
            Err(e) => {
                self.health.record_failure(ctx.provider.id, ctx.now).await.ok();
                self.record_usage(&ctx, false, 0, 0).await;
                if ctx.debug_log {
                    self.log_request(ctx.into_entry(Some(status.as_u16()), false, None, Some(e.to_string())))
                        .await;
                }
                return ForwardError::UpstreamError(e.to_string()).into_response();
            }
        };

        let usage = parse_usage(&response_bytes, ctx.cli_type);
        let success = status.as_u16() < 400;
        if success {
            self.health.record_success(ctx.provider.id, ctx.now).await.ok();
        } else {
            self.health.record_failure(ctx.provider.id, ctx.now).await.ok();
        }
        self.record_usage(&ctx, success, usage.input_tokens, usage.output_tokens).await;

        if ctx.debug_log {
            let response_body_log = truncate_body_for_log(&response_bytes);
            self.log_request(ctx.into_entry(
                Some(status.as_u16()),
                success,
                Some(response_body_log),
                None,
            ))
            .await;
        }

        let mut builder = Response::builder().status(status);
        if let Some(headers_mut) = builder.headers_mut() {
            *headers_mut = response_headers;
        }
        builder
            .body(axum::body::Body::from(response_bytes))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
    }

    async fn forward_streaming(
        &self,
        method: Method,
        url: String,
        headers: HeaderMap,
        body: Vec<u8>,
        timeouts: TimeoutSettings,
        ctx: RequestContext,
    ) -> Response {
        let send = self.client.request(method, url.as_str()).headers(headers).body(body).send().await;

        let upstream = match send {
            Ok(r) => r,
            Err(e) => {
                self.health.record_failure(ctx.provider.id, ctx.now).await.ok();
                self.record_usage(&ctx, false, 0, 0).await;
                if ctx.debug_log {
                    self.log_request(ctx.into_entry(None, false, None, Some(e.to_string()))).await;
                }
                return ForwardError::UpstreamError(e.to_string()).into_response();
            }
        };

        let status = upstream.status();
        if status.as_u16() >= 400 {
            let response_headers = filter_response_headers(upstream.headers(), &ctx.provider.name);
            let error_body = upstream.bytes().await.unwrap_or_default();
            self.health.record_failure(ctx.provider.id, ctx.now).await.ok();
            self.record_usage(&ctx, false, 0, 0).await;
            if ctx.debug_log {
                self.log_request(ctx.into_entry(
                    Some(status.as_u16()),
                    false,
                    Some(truncate_body_for_log(&error_body)),
                    None,
                ))
                .await;
            }

            let mut builder = Response::builder().status(status);
            if let Some(headers_mut) = builder.headers_mut() {
                *headers_mut = response_headers;
            }
            return builder
                .body(axum::body::Body::from(error_body))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
        }

        let response_headers = filter_response_headers(upstream.headers(), &ctx.provider.name);

        let (tx, mut rx) = mpsc::channel::<Bytes>(16);
        let health = self.health.clone();
        let log_store = self.log_store.clone();
        let first_byte_timeout = Duration::from_secs(timeouts.stream_first_byte_timeout);
        let idle_timeout = Duration::from_secs(timeouts.stream_idle_timeout);

        tokio::spawn(
            async move {
                let mut byte_stream = upstream.bytes_stream();
                let mut accumulator: Vec<u8> = Vec::new();
                let mut first_chunk = true;
                let mut success = false;

                loop {
                    let wait = if first_chunk { first_byte_timeout } else { idle_timeout };
                    match tokio::time::timeout(wait, byte_stream.next()).await {
                        Ok(Some(Ok(chunk))) => {
                            first_chunk = false;
                            accumulator.extend_from_slice(&chunk);
                            if tx.send(chunk).await.is_err() {
                                // client disconnected mid-stream
                                break;
                            }
                        }
                        Ok(Some(Err(e))) => {
                            let frame = sse_error_frame("error", &e.to_string());
                            let _ = tx.send(frame).await;
                            break;
                        }
                        Ok(None) => {
                            success = true;
                            break;
                        }
                        Err(_elapsed) => {
                            let label = if first_chunk { "First byte" } else { "Idle" };
                            let frame = sse_error_frame("timeout", &format!("{label} timeout"));
                            let _ = tx.send(frame).await;
                            break;
                        }
                    }
                }

                // Usage is parsed once against the fully accumulated buffer rather than
                // incrementally per chunk, which sidesteps SSE events that straddle a
                // chunk boundary without needing a second re-parse pass.
                let usage = parse_usage(&accumulator, ctx.cli_type);

                if success {
                    health.record_success(ctx.provider.id, ctx.now).await.ok();
                } else {
                    health.record_failure(ctx.provider.id, ctx.now).await.ok();
                }
                let usage_date = today_date_string(ctx.now);
                let _ = log_store
                    .record_usage(
                        &usage_date,
                        &ctx.provider.name,
                        ctx.cli_type.as_str(),
                        success,
                        usage.input_tokens,
                        usage.output_tokens,
                    )
                    .await;

                if ctx.debug_log {
                    let _ = log_store
                        .create_request_log(
                            ctx.now,
                            RequestLogEntry {
                                cli_type: ctx.cli_type.as_str().to_string(),
                                provider_name: ctx.provider.name.clone(),
                                model_id: ctx.model_id.clone(),
                                success,
                                status_code: Some(status.as_u16()),
                                elapsed_ms: ctx.start.elapsed().as_millis() as u64,
                                input_tokens: usage.input_tokens,
                                output_tokens: usage.output_tokens,
                                client_method: ctx.client_method.clone(),
                                client_path: ctx.client_path.clone(),
                                response_body: Some(truncate_body_for_log(&accumulator)),
                                ..Default::default()
                            },
                        )
                        .await;
                }
            }
            .in_current_span(),
        );

        let body_stream = async_stream::stream! {
            while let Some(chunk) = rx.recv().await {
                yield Ok::<Bytes, std::io::Error>(chunk);
            }
        };

        let mut builder = Response::builder().status(StatusCode::OK);
        if let Some(headers_mut) = builder.headers_mut() {
            *headers_mut = response_headers;
        }
        builder
            .body(axum::body::Body::from_stream(body_stream))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
    }

    async fn record_usage(&self, ctx: &RequestContext, success: bool, input_tokens: u64, output_tokens: u64) {
        let usage_date = today_date_string(ctx.now);
        let _ = self
            .log_store
            .record_usage(&usage_date, &ctx.provider.name, ctx.cli_type.as_str(), success, input_tokens, output_tokens)
            .await;
    }

    async fn log_request(&self, entry: RequestLogEntry) {
        let now = now_epoch();
        if let Err(e) = self.log_store.create_request_log(now, entry).await {
            tracing::warn!(error = %e, "failed to persist request log");
        }
    }
}

struct RequestContext {
    start: Instant,
    now: i64,
    cli_type: CliVariant,
    provider: Provider,
    model_id: Option<String>,
    client_method: String,
    client_path: String,
    debug_log: bool,
}

impl RequestContext {
    fn into_entry(
        self,
        status_code: Option<u16>,
        success: bool,
        response_body: Option<String>,
        error_message: Option<String>,
    ) -> RequestLogEntry {
        RequestLogEntry {
            cli_type: self.cli_type.as_str().to_string(),
            provider_name: self.provider.name,
            model_id: self.model_id,
            success,
            status_code,
            elapsed_ms: self.start.elapsed().as_millis() as u64,
            client_method: self.client_method,
            client_path: self.client_path,
            response_body,
            error_message,
            ..Default::default()
        }
    }
}

fn classify_stream(cli_type: CliVariant, path: &str, body: &[u8]) -> bool {
    match cli_type {
        CliVariant::C => path.contains(":streamGenerateContent"),
        CliVariant::A | CliVariant::B => serde_json::from_slice::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("stream").and_then(|s| s.as_bool()))
            .unwrap_or(false),
    }
}

fn sse_error_frame(kind: &str, message: &str) -> Bytes {
    let payload = serde_json::json!({ "type": kind, "message": message });
    Bytes::from(format!("event: error\ndata: {payload}\n\n"))
}

fn truncate_body_for_log(bytes: &[u8]) -> String {
    if bytes.len() < LOG_BODY_TRUNCATE_AT {
        String::from_utf8_lossy(bytes).to_string()
    } else {
        format!("[streaming] {} bytes", bytes.len())
    }
}

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

fn today_date_string(now: i64) -> String {
    chrono::DateTime::from_timestamp(now, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_stream_detects_gemini_streaming_path() {
        assert!(classify_stream(
            CliVariant::C,
            "v1beta/models/gemini-2.5-pro:streamGenerateContent",
            b""
        ));
        assert!(!classify_stream(CliVariant::C, "v1beta/models/gemini-2.5-pro:generateContent", b""));
    }

    #[test]
    fn classify_stream_reads_stream_flag_for_a_and_b() {
        assert!(classify_stream(CliVariant::A, "v1/messages", br#"{"stream":true}"#));
        assert!(!classify_stream(CliVariant::B, "v1/responses", br#"{"stream":false}"#));
        assert!(!classify_stream(CliVariant::A, "v1/messages", b"not json"));
    }

    #[test]
    fn truncate_body_for_log_switches_to_placeholder_past_threshold() {
        let small = b"hello";
        assert_eq!(truncate_body_for_log(small), "hello");

        let large = vec![b'x'; LOG_BODY_TRUNCATE_AT + 1];
        assert_eq!(truncate_body_for_log(&large), format!("[streaming] {} bytes", large.len()));
    }

    #[test]
    fn sse_error_frame_has_expected_wire_shape() {
        let frame = sse_error_frame("timeout", "Idle timeout");
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert!(text.starts_with("event: error\ndata: "));
        assert!(text.ends_with("\n\n"));
        assert!(text.contains("\"type\":\"timeout\""));
        assert!(text.contains("Idle timeout"));
    }

    #[test]
    fn today_date_string_formats_epoch_seconds() {
        // 2026-03-20T00:00:00Z
        assert_eq!(today_date_string(1_773_964_800), "2026-03-20");
    }
}
