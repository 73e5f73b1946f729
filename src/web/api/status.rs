use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use crate::config::Topology;
use crate::predict::Pass;
use crate::relay::LinkState;
use crate::scheduler::{CaptureJob, Control, Progress, SchedulerStatus};
use crate::web::api::error::{ApiError, ApiResult};
use crate::web::AppState;

const MAX_EVENT_WAIT_SECS: u64 = 300;

#[derive(Debug, Serialize)]
pub struct LinkStatus {
    #[serde(flatten)]
    pub state: LinkState,
    pub reported_overruns: u64,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: SchedulerStatus,
    pub current_pass: Option<Pass>,
    pub progress: Option<Progress>,
    pub current_job: Option<CaptureJob>,
    pub gain: f64,
    pub gain_control_active: bool,
    pub topology: Topology,
    pub link: Option<LinkStatus>,
}

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.scheduler.snapshot.read().await;
    Json(StatusResponse {
        status: snapshot.status,
        current_pass: snapshot.current_pass.clone(),
        progress: snapshot.progress,
        current_job: snapshot.current_job.clone(),
        gain: snapshot.gain,
        gain_control_active: snapshot.gain_control_active,
        topology: state.topology,
        link: state.link.as_ref().map(|m| LinkStatus {
            state: m.state(),
            reported_overruns: m.reported_overruns(),
        }),
    })
}

#[derive(Debug, Serialize)]
pub struct PassesResponse {
    pub upcoming: Vec<Pass>,
    pub scan_windows: Vec<Pass>,
}

pub async fn passes(State(state): State<AppState>) -> Json<PassesResponse> {
    let snapshot = state.scheduler.snapshot.read().await;
    Json(PassesResponse {
        upcoming: snapshot.upcoming.clone(),
        scan_windows: snapshot.scan_windows.clone(),
    })
}

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    pub limit: Option<usize>,
}

/// Finished jobs, newest first.
pub async fn jobs(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> Json<Vec<CaptureJob>> {
    let snapshot = state.scheduler.snapshot.read().await;
    let limit = query.limit.unwrap_or(usize::MAX);
    Json(snapshot.history.iter().take(limit).cloned().collect())
}

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    pub timeout_secs: Option<u64>,
}

/// Long-poll for the next status event; 204 if nothing happened in time.
pub async fn next_event(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> ApiResult<Response> {
    let wait = query.timeout_secs.unwrap_or(30);
    if wait > MAX_EVENT_WAIT_SECS {
        return Err(ApiError::Validation(format!(
            "timeout_secs must be at most {MAX_EVENT_WAIT_SECS}"
        )));
    }

    let mut events = state.scheduler.events.subscribe();
    let received = tokio::time::timeout(Duration::from_secs(wait), async {
        loop {
            match events.recv().await {
                Err(RecvError::Lagged(_)) => continue,
                other => return other,
            }
        }
    })
    .await;

    match received {
        Ok(Ok(event)) => Ok(Json(event).into_response()),
        Ok(Err(_)) => Err(ApiError::SchedulerUnavailable),
        Err(_) => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

pub async fn stop(State(state): State<AppState>) -> ApiResult<StatusCode> {
    send(&state, Control::Stop).await
}

pub async fn refresh(State(state): State<AppState>) -> ApiResult<StatusCode> {
    send(&state, Control::Refresh).await
}

async fn send(state: &AppState, control: Control) -> ApiResult<StatusCode> {
    state
        .scheduler
        .control
        .send(control)
        .await
        .map_err(|_| ApiError::SchedulerUnavailable)?;
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{SchedulerHandle, SchedulerSnapshot, StatusEvent};
    use std::sync::Arc;
    use tokio::sync::{broadcast, mpsc, RwLock};

    fn state() -> (AppState, mpsc::Receiver<Control>) {
        let (events, _) = broadcast::channel(4);
        let (control, control_rx) = mpsc::channel(4);
        let snapshot = SchedulerSnapshot {
            gain: 25.0,
            ..SchedulerSnapshot::default()
        };
        let state = AppState {
            scheduler: SchedulerHandle {
                snapshot: Arc::new(RwLock::new(snapshot)),
                events,
                control,
            },
            topology: Topology::Full,
            link: None,
        };
        (state, control_rx)
    }

    #[tokio::test]
    async fn reports_status() {
        let (state, _rx) = state();
        let Json(body) = status(State(state)).await;
        assert_eq!(body.status, SchedulerStatus::Idle);
        assert_eq!(body.gain, 25.0);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], "idle");
        assert_eq!(json["topology"], "full");
        assert!(json["link"].is_null());
    }

    #[tokio::test]
    async fn stop_is_forwarded_to_the_scheduler() {
        let (state, mut rx) = state();
        assert_eq!(stop(State(state.clone())).await.ok(), Some(StatusCode::ACCEPTED));
        assert_eq!(rx.recv().await, Some(Control::Stop));

        drop(rx);
        assert!(matches!(
            refresh(State(state)).await,
            Err(ApiError::SchedulerUnavailable)
        ));
    }

    #[tokio::test]
    async fn long_poll_returns_next_event() {
        let (state, _rx) = state();
        let events = state.scheduler.events.clone();
        let waiter = tokio::spawn(next_event(
            State(state.clone()),
            Query(EventQuery {
                timeout_secs: Some(5),
            }),
        ));
        // Wait for the subscription before publishing.
        while events.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }
        events
            .send(StatusEvent {
                status: SchedulerStatus::Waiting,
                current_pass: None,
                progress: None,
            })
            .unwrap();
        let response = waiter.await.unwrap().ok().unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let quiet = next_event(
            State(state.clone()),
            Query(EventQuery {
                timeout_secs: Some(0),
            }),
        )
        .await
        .ok()
        .unwrap();
        assert_eq!(quiet.status(), StatusCode::NO_CONTENT);

        assert!(matches!(
            next_event(State(state), Query(EventQuery { timeout_secs: Some(301) })).await,
            Err(ApiError::Validation(_))
        ));
    }
}
