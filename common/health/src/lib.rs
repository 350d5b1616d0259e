use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Health reporting for the background loops of a service.
///
/// Each component registers with a deadline and must report healthy more often than
/// that deadline. The registry is healthy when at least one component is registered
/// and every component reported healthy within its deadline. Keep one registry per
/// probe; liveness and readiness answer different questions.
#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// Maps the overall status to a status code, with each component in the body.
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, no report yet
    Starting,
    /// Must report again before this instant
    HealthyUntil(DateTime<Utc>),
    Unhealthy,
    /// The `HealthyUntil` deadline passed without a new report
    Stalled,
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: chrono::Duration,
    components: Components,
}

impl HealthHandle {
    /// Must be called more frequently than the configured deadline.
    pub fn report_healthy(&self) {
        self.report_healthy_at(Utc::now())
    }

    pub fn report_healthy_at(&self, now: DateTime<Utc>) {
        self.report_status(ComponentStatus::HealthyUntil(now + self.deadline))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        let mut components = self
            .components
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        components.insert(self.component.clone(), status);
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Registers a component in `Starting`. Deadlines too large for a timestamp are
    /// capped at one year.
    pub fn register(&self, component: impl Into<String>, deadline: Duration) -> HealthHandle {
        let deadline =
            chrono::Duration::from_std(deadline).unwrap_or_else(|_| chrono::Duration::days(365));
        let handle = HealthHandle {
            component: component.into(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Overall status of all registered components. Usable as an axum handler body.
    pub fn get_status(&self) -> HealthStatus {
        self.get_status_at(Utc::now())
    }

    pub fn get_status_at(&self, now: DateTime<Utc>) -> HealthStatus {
        let components = self
            .components
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };
        for (name, status) in components.iter() {
            let status = match status {
                ComponentStatus::HealthyUntil(until) if *until > now => status.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(status, ComponentStatus::HealthyUntil(_)) {
                result.healthy = false;
            }
            result.components.insert(name.clone(), status);
        }

        match result.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}
