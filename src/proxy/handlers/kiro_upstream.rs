//! Upstream dispatch: hand the built request to the account's adapter and
//! translate the reply — streaming bytes into Claude SSE frames, or a
//! buffered body into one Messages object. Outcome marking happens here so
//! every exit path settles the account's health exactly once.

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tracing::{info, warn};

use crate::models::PoolAccount;
use crate::proxy::adapter::AdapterError;
use crate::proxy::common::errors::{sse_error_frame, ErrorKind};
use crate::proxy::mappers::claude::ClaudeRequest;
use crate::proxy::server::AppState;
use crate::proxy::tokenizer::estimate_request_tokens;
use crate::proxy::upstream::parsers::parse_events_from_buffer;
use crate::proxy::upstream::sse::SseBuilder;

/// Send the request through `account`. Pre-stream failures surface as `Err`
/// so the pipeline can fall back to another account; once the SSE response
/// has started, failures become in-band `event: error` frames.
pub async fn dispatch(
    state: &AppState,
    account: PoolAccount,
    request: &ClaudeRequest,
    trace_id: &str,
) -> Result<Response, AdapterError> {
    let adapter = state.pool.adapter_for(&account);

    if !request.stream {
        let response_json = adapter.generate_content(request).await?;
        state.pool.mark_healthy(&account.uuid, None).await;
        info!("[{}] Unary response complete", trace_id);

        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::to_string(&response_json).unwrap_or_default(),
            ))
            .unwrap_or_default());
    }

    let upstream = adapter.generate_content_stream(request).await?;

    let model = request.model.clone();
    let estimated_input = estimate_request_tokens(request);
    let trace_id = trace_id.to_string();
    let pool = state.pool.clone();
    let account_uuid = account.uuid.clone();

    let sse_stream = async_stream::stream! {
        let mut builder = SseBuilder::new(&model, estimated_input);
        let mut buffer = BytesMut::new();
        let mut byte_stream = upstream.bytes_stream();
        let mut chunk_count: usize = 0;
        let mut upstream_failed = false;

        while let Some(chunk_result) = byte_stream.next().await {
            match chunk_result {
                Ok(chunk) => {
                    chunk_count += 1;
                    buffer.extend_from_slice(&chunk);

                    let (events, consumed) = parse_events_from_buffer(&buffer);
                    if consumed > 0 {
                        let _ = buffer.split_to(consumed);
                    }
                    for event in events {
                        let sse_text = builder.process_event(event);
                        if !sse_text.is_empty() {
                            yield Ok::<Bytes, std::io::Error>(Bytes::from(sse_text));
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "[{}] Upstream stream error after {} chunks: {}",
                        trace_id, chunk_count, e
                    );
                    upstream_failed = true;
                    pool.mark_unhealthy(&account_uuid, &format!("stream error: {}", e)).await;

                    let kind = if e.is_timeout() {
                        ErrorKind::TimeoutError
                    } else {
                        ErrorKind::NetworkError
                    };
                    // One error frame, then nothing: the caller must not see
                    // partial message frames after it.
                    yield Ok::<Bytes, std::io::Error>(Bytes::from(sse_error_frame(
                        kind,
                        &format!("upstream stream failed: {}", e),
                    )));
                    break;
                }
            }
        }

        if !upstream_failed {
            let final_sse = builder.finalize();
            if !final_sse.is_empty() {
                yield Ok::<Bytes, std::io::Error>(Bytes::from(final_sse));
            }
            pool.mark_healthy(&account_uuid, None).await;
            info!("[{}] Stream complete after {} chunks", trace_id, chunk_count);
        }
    };

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(sse_stream))
        .unwrap_or_default())
}
