//! The translation endpoint. Wires auth identity, translation, the
//! streaming adapter, and post-stream bookkeeping together, with per-phase
//! timings on the way through.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Extension,
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::auth::{Caller, client_ip};
use crate::db::{Store, UsageRow};
use crate::error::GatewayError;
use crate::metrics::{MetricsWorker, UsageCapture};
use crate::pricing;
use crate::request_context::RequestContext;
use crate::transforms::{
    StreamAdapter, converse_sse_stream, parse_request, prepare_invoke_body, translate,
};

/// Ids for one request; stamped onto every response
#[derive(Clone)]
struct RequestIds {
    request_id: String,
    trace_id: String,
}

impl RequestIds {
    fn from_headers(headers: &HeaderMap) -> Self {
        let trace_id = headers
            .get("x-trace-id")
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            request_id: Uuid::new_v4().to_string(),
            trace_id,
        }
    }

    fn apply(&self, mut response: Response) -> Response {
        let headers = response.headers_mut();
        if let Ok(v) = HeaderValue::from_str(&self.request_id) {
            headers.insert("x-request-id", v);
        }
        if let Ok(v) = HeaderValue::from_str(&self.trace_id) {
            headers.insert("x-trace-id", v);
        }
        response
    }
}

pub async fn messages(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    caller: Option<Extension<Caller>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ids = RequestIds::from_headers(&headers);
    let mut ctx = RequestContext::new(ids.request_id.clone(), ids.trace_id.clone());

    info!(
        request_id = %ids.request_id,
        trace_id = %ids.trace_id,
        "request received"
    );

    // A caller with a bound inference profile is required for dispatch
    let caller = match caller {
        Some(Extension(caller)) if !caller.default_inference_profile.is_empty() => caller,
        _ => {
            error!(request_id = %ids.request_id, "caller missing inference profile");
            return ids.apply(GatewayError::ProfileMissing.into_response());
        }
    };
    let model_id = caller.default_inference_profile.clone();

    let parse_start = Instant::now();
    let parsed = (|| -> Result<_, GatewayError> {
        let raw: Value = serde_json::from_slice(&body)
            .map_err(|e| GatewayError::ParseError(e.to_string()))?;
        let request = parse_request(&raw)?;
        Ok((raw, request))
    })();
    let (raw_body, request) = match parsed {
        Ok(p) => p,
        Err(err) => {
            error!(request_id = %ids.request_id, error = %err, "failed to parse request body");
            return ids.apply(err.into_response());
        }
    };

    if !request.stream {
        ctx.record_phase("parse_request", parse_start.elapsed());
        return invoke_passthrough(&state, &ids, &mut ctx, &model_id, &raw_body).await;
    }

    let translated = match translate(&request, state.bedrock.config()) {
        Ok(t) => t,
        Err(err) => {
            error!(request_id = %ids.request_id, error = %err, "request translation failed");
            return ids.apply(err.into_response());
        }
    };
    ctx.record_phase("parse_request", parse_start.elapsed());

    info!(
        request_id = %ids.request_id,
        requested_model = request.model.as_deref().unwrap_or("unknown"),
        messages = translated.converse.messages.len(),
        system_blocks = translated.converse.system.len(),
        max_tokens = translated.converse.inference_config.max_tokens,
        parse_ms = ctx.phase_millis("parse_request"),
        "request parsing completed"
    );

    let signed = match ctx.phase("sign_request", || {
        state
            .bedrock
            .sign_converse_stream(&model_id, &translated.converse)
    }) {
        Ok(r) => r,
        Err(err) => {
            error!(request_id = %ids.request_id, error = %err, "request signing failed");
            return ids.apply(err.into_response());
        }
    };

    let upstream = match state.bedrock.send_converse_stream(signed).await {
        Ok(r) => r,
        Err(err) => {
            error!(request_id = %ids.request_id, error = %err, "converse stream call failed");
            return ids.apply(err.into_response());
        }
    };

    // Post-stream bookkeeping data; the guard fires even on client hang-up
    let mut bookkeeper = (state.store.clone())
        .zip(state.metrics.clone())
        .map(|(store, worker)| {
            StreamBookkeeper::new(
                store,
                worker,
                caller,
                model_id.clone(),
                state.bedrock.region().to_string(),
                ctx,
                client_ip(&headers, peer),
                headers
                    .get(header::USER_AGENT)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string(),
            )
        });

    let adapter = StreamAdapter::new(model_id, state.config.tag_buffer.max_size);
    let sse = converse_sse_stream(upstream, adapter, move |chunk| {
        if let Some(bookkeeper) = bookkeeper.as_mut() {
            bookkeeper.observe(chunk);
        }
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(sse))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());

    ids.apply(response)
}

/// Non-streaming path: rewrite the raw body, sign it, and relay the invoke
/// response verbatim.
async fn invoke_passthrough(
    state: &Arc<AppState>,
    ids: &RequestIds,
    ctx: &mut RequestContext,
    model_id: &str,
    raw_body: &Value,
) -> Response {
    let signed = match ctx.phase("sign_request", || -> Result<_, GatewayError> {
        let body = prepare_invoke_body(raw_body, state.bedrock.config());
        let body = serde_json::to_vec(&body)
            .map_err(|e| GatewayError::UpstreamSigningError(e.to_string()))?;
        state.bedrock.sign_invoke(model_id, body)
    }) {
        Ok(r) => r,
        Err(err) => {
            error!(request_id = %ids.request_id, error = %err, "request signing failed");
            return ids.apply(err.into_response());
        }
    };

    let call_start = Instant::now();
    let upstream = state.bedrock.send(signed).await;
    ctx.record_phase("bedrock_call", call_start.elapsed());

    let upstream = match upstream {
        Ok(r) => r,
        Err(err) => {
            error!(
                request_id = %ids.request_id,
                error = %err,
                call_ms = ctx.phase_millis("bedrock_call"),
                "bedrock call failed"
            );
            return ids.apply(err.into_response());
        }
    };

    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));
    let bytes = match upstream.bytes().await {
        Ok(b) => b,
        Err(e) => {
            return ids.apply(
                GatewayError::UpstreamCallError(format!("failed to read response: {e}"))
                    .into_response(),
            );
        }
    };

    info!(
        request_id = %ids.request_id,
        status = status.as_u16(),
        call_ms = ctx.phase_millis("bedrock_call"),
        "bedrock call completed"
    );
    ctx.log_summary();

    let response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());

    ids.apply(response)
}

/// Observes every outbound SSE chunk and, once the stream ends or the
/// client hangs up, hands the collected usage to a detached task: cost,
/// usage row, quota debit, block check. Request completion never waits on
/// any of it.
struct StreamBookkeeper {
    capture: UsageCapture,
    post: Option<PostStream>,
}

struct PostStream {
    store: Store,
    worker: Arc<MetricsWorker>,
    caller: Caller,
    model_id: String,
    region: String,
    ctx: RequestContext,
    source_ip: String,
    user_agent: String,
    started_at: DateTime<Utc>,
    stream_start: Instant,
}

impl StreamBookkeeper {
    #[allow(clippy::too_many_arguments)]
    fn new(
        store: Store,
        worker: Arc<MetricsWorker>,
        caller: Caller,
        model_id: String,
        region: String,
        ctx: RequestContext,
        source_ip: String,
        user_agent: String,
    ) -> Self {
        Self {
            capture: UsageCapture::new(),
            post: Some(PostStream {
                store,
                worker,
                caller,
                model_id,
                region,
                ctx,
                source_ip,
                user_agent,
                started_at: Utc::now(),
                stream_start: Instant::now(),
            }),
        }
    }

    fn observe(&mut self, chunk: &str) {
        self.capture.observe(chunk);
    }
}

impl Drop for StreamBookkeeper {
    fn drop(&mut self) {
        let Some(post) = self.post.take() else {
            return;
        };
        let capture = std::mem::take(&mut self.capture);
        // Detached: post-processing runs even when the client went away
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(post_process(post, capture));
        } else {
            warn!("no runtime for post-stream processing, usage lost");
        }
    }
}

async fn post_process(mut post: PostStream, capture: UsageCapture) {
    post.ctx
        .record_phase("streaming", post.stream_start.elapsed());
    let phase_start = Instant::now();

    let cost = pricing::calculate_cost(
        &post.model_id,
        capture.input_tokens,
        capture.output_tokens,
        capture.cache_read_tokens,
        capture.cache_write_tokens,
    );

    let row = UsageRow {
        user_id: post.caller.user_id.clone(),
        team: post.caller.team.clone(),
        person: post.caller.person.clone(),
        request_timestamp: post.started_at,
        model_id: post.model_id.clone(),
        request_id: post.ctx.request_id.clone(),
        source_ip: post.source_ip.clone(),
        user_agent: post.user_agent.clone(),
        aws_region: post.region.clone(),
        tokens_input: capture.input_tokens as i64,
        tokens_output: capture.output_tokens as i64,
        tokens_cache_read: capture.cache_read_tokens as i64,
        tokens_cache_creation: capture.cache_write_tokens as i64,
        cost_usd: cost,
        processing_time_ms: post.ctx.total_elapsed().as_millis() as i64,
        response_status: capture.outcome().to_string(),
        error_message: capture.error_message.clone(),
    };

    if let Err(e) = post.worker.record(row) {
        warn!(request_id = %post.ctx.request_id, error = %e, "failed to record usage row");
    }

    if let Err(e) = post
        .store
        .update_quota_and_counters(&post.caller.user_id, cost)
        .await
    {
        error!(user_id = %post.caller.user_id, error = %e, "failed to update quota");
    }

    if let Err(e) = post.store.check_and_block_user(&post.caller.user_id).await {
        error!(user_id = %post.caller.user_id, error = %e, "failed to run block check");
    }

    post.ctx
        .record_phase("post_processing", phase_start.elapsed());
    post.ctx.log_summary();

    info!(
        request_id = %post.ctx.request_id,
        user_id = %post.caller.user_id,
        input_tokens = capture.input_tokens,
        output_tokens = capture.output_tokens,
        cache_read = capture.cache_read_tokens,
        cache_write = capture.cache_write_tokens,
        cost_usd = cost,
        outcome = capture.outcome(),
        "request completed"
    );
}
