//! SPARQL-backed schedule repository.
//!
//! Placeholder for querying a graph store (e.g. Jena Fuseki) instead of the
//! relational schedule. The endpoint is taken from configuration so the
//! selection plumbing is exercised end to end, but every query currently
//! reports `NotImplemented`; callers see it as HTTP 501. Select the sqlite
//! backend to serve real data.

use async_trait::async_trait;

use super::{DepartureQuery, DepartureRecord, ScheduleError, ScheduleRepository};

pub struct SparqlScheduleRepository {
    endpoint: String,
}

impl SparqlScheduleRepository {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ScheduleRepository for SparqlScheduleRepository {
    async fn next_departures(
        &self,
        _query: &DepartureQuery,
    ) -> Result<Vec<DepartureRecord>, ScheduleError> {
        Err(ScheduleError::NotImplemented(format!(
            "SPARQL schedule queries against '{}' are not available yet; select the sqlite backend",
            self.endpoint
        )))
    }
}
