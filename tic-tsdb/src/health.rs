use std::collections::HashMap;
use std::fmt;
use std::ops::Add;
use std::sync::{Arc, PoisonError, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

/// Lifecycle of one pipeline run. States only move forward.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    #[default]
    Idle,
    ConnectingDatabase,
    ApplyingMigrations,
    ConnectingBroker,
    Subscribing,
    Running,
    /// Shutdown requested: no new deliveries, queued events are still written.
    Draining,
    Terminated,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered
    Starting,
    /// Recently reported healthy, will need to report again before the date
    HealthyUntil(OffsetDateTime),
    /// Reported unhealthy
    Unhealthy,
    /// Automatically set when the HealthyUntil deadline is reached
    Stalled,
}

/// Snapshot served on the liveness and readiness endpoints.
#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub state: PipelineState,
    pub failure: Option<String>,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Default, Debug)]
struct Inner {
    state: PipelineState,
    failure: Option<String>,
    components: HashMap<String, ComponentStatus>,
}

/// Pipeline state plus the liveness of its long-running loops (MQTT delivery,
/// database writer). Cheap to clone, every clone sees the same data.
#[derive(Clone, Default)]
pub struct PipelineHealth {
    inner: Arc<RwLock<Inner>>,
}

pub struct HealthHandle {
    component: String,
    deadline: Duration,
    inner: Arc<RwLock<Inner>>,
}

impl HealthHandle {
    /// Must be called more frequently than the configured deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().add(self.deadline),
        ))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        _ = inner.components.insert(self.component.clone(), status);
    }
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PipelineState {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Move to `next`. Returns false, and leaves the state alone, for a backwards move.
    pub fn advance(&self, next: PipelineState) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if next < inner.state {
            warn!("ignoring pipeline transition {} -> {}", inner.state, next);
            return false;
        }
        if next != inner.state {
            info!("pipeline {} -> {}", inner.state, next);
            inner.state = next;
        }
        true
    }

    /// Record the error that stopped the pipeline and terminate it.
    pub fn fail(&self, error: &dyn fmt::Display) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.failure = Some(error.to_string());
        inner.state = PipelineState::Terminated;
    }

    /// Registers a new component. The returned handle should be passed to the
    /// component, to allow it to frequently report its health status.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            inner: self.inner.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Liveness: every component reported in time and the pipeline has not terminated.
    pub fn get_status(&self) -> HealthStatus {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let now = OffsetDateTime::now_utc();

        let mut status = HealthStatus {
            healthy: inner.state != PipelineState::Terminated,
            state: inner.state,
            failure: inner.failure.clone(),
            components: HashMap::with_capacity(inner.components.len()),
        };

        for (name, component) in inner.components.iter() {
            let component = match component {
                ComponentStatus::HealthyUntil(until) if *until > now => component.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            // A component still starting up does not fail liveness, only readiness.
            if matches!(
                component,
                ComponentStatus::Unhealthy | ComponentStatus::Stalled
            ) {
                status.healthy = false;
            }
            _ = status.components.insert(name.clone(), component);
        }

        if !status.healthy {
            warn!("liveness check failed: {:?}", status);
        }
        status
    }

    /// Readiness: events are being consumed.
    pub fn readiness(&self) -> HealthStatus {
        let mut status = self.get_status();
        status.healthy = status.healthy && status.state == PipelineState::Running;
        status
    }
}
