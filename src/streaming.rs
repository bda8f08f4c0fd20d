//! C4: log and event streaming over SSE (§4.4). Creation logs come from the
//! orchestrator; runtime logs are tailed over SSH inside the agent
//! container. Grounded on the teacher's axum handler conventions, adapted
//! to `axum::response::sse` since the teacher has no streaming precedent.

use axum::http::HeaderValue;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::models::{InstanceStatus, LogType};
use crate::orchestrator::Orchestrator;
use crate::ssh::SshPool;

fn data_event(line: String) -> Event {
    Event::default().data(line)
}

/// Adds the `X-Accel-Buffering: no` header axum's `Sse` type doesn't set on
/// its own (§4.4 HTTP surface); `Sse` already sets `Content-Type` and
/// `Cache-Control`.
fn with_no_buffering(sse: impl IntoResponse) -> Response {
    let mut response = sse.into_response();
    response
        .headers_mut()
        .insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

/// `StreamCreationLogs` (§4.4). Short-circuits with a single advisory line
/// when the instance has already left the creation phase (S2).
pub async fn stream_creation_logs(
    orchestrator: Arc<dyn Orchestrator>,
    instance_name: String,
    current_status: InstanceStatus,
) -> Response {
    let stream: std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> =
        if current_status.is_terminal_for_creation() {
            let line = "Instance is not in creation phase. Switch to Runtime logs or restart the instance to see creation logs.";
            Box::pin(tokio_stream::once(Ok(data_event(line.to_string()))))
        } else {
            match orchestrator.stream_creation_logs(&instance_name).await {
                Ok(rx) => Box::pin(ReceiverStream::new(rx).map(|line| Ok(data_event(line)))),
                Err(e) => {
                    warn!("creation log stream failed: {e}");
                    Box::pin(tokio_stream::once(Ok(data_event(format!(
                        "creation log stream unavailable: {e}"
                    )))))
                }
            }
        };

    with_no_buffering(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// `StreamInstanceLogs` (§4.4). Execs `tail [-f] -n <n>` over SSH against
/// the instance's configured log path and streams lines as SSE events.
pub async fn stream_instance_logs(
    pool: Arc<SshPool>,
    instance_id: u64,
    log_path: String,
    log_type: LogType,
    tail: usize,
    follow: bool,
    cancel: CancellationToken,
) -> Result<Response, crate::error::AppError> {
    let handle = pool.get_client(instance_id).await?;

    let command = if follow {
        format!("tail -n {tail} -f {log_path}")
    } else {
        format!("tail -n {tail} {log_path}")
    };

    let rx = crate::ssh::client::exec_stream(&handle, &command, cancel)
        .await
        .map_err(crate::ssh::SshError::from)?;

    tracing::debug!(instance_id, ?log_type, "streaming instance logs");

    let stream = ReceiverStream::new(rx).map(|line| Ok(data_event(line)));
    Ok(with_no_buffering(
        Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::NullOrchestrator;

    #[tokio::test]
    async fn creation_logs_short_circuit_on_terminal_status() {
        let orchestrator: Arc<dyn Orchestrator> = Arc::new(NullOrchestrator::new());
        let sse = stream_creation_logs(orchestrator, "inst-1".into(), InstanceStatus::Running).await;
        let _ = sse;
    }
}
