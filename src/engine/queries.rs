use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: String,
    pub calendar_id: String,
    pub hours: OpeningHours,
}

impl Engine {
    pub async fn resource_info(&self, id: Ulid) -> Option<ResourceInfo> {
        let rs = self.get_resource(&id)?;
        let guard = rs.read().await;
        Some(ResourceInfo {
            id: guard.id,
            name: guard.name.clone(),
            calendar_id: guard.calendar_id.clone(),
            hours: guard.hours,
        })
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let resource_id = self
            .get_resource_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Spans of blocking reservations overlapping `window`, sorted by start.
    pub async fn blocking_spans(&self, resource_id: Ulid, window: &Span) -> Result<Vec<Span>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard.blocking_overlapping(window).map(|r| r.span()).collect())
    }

    /// Reservations of any status whose date lies in `[from, to]`.
    pub async fn reservations_between(
        &self,
        resource_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Reservation>, EngineError> {
        if to < from {
            return Ok(Vec::new());
        }
        if (to - from).num_days() > MAX_QUERY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard
            .reservations
            .iter()
            .filter(|r| r.date >= from && r.date <= to)
            .cloned()
            .collect())
    }

    /// Every reservation the payer pays for, across resources, oldest first.
    pub async fn reservations_for_payer(&self, payer_id: &str) -> Vec<Reservation> {
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut found = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            found.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.payer_id == payer_id)
                    .cloned(),
            );
        }
        found.sort_by_key(|r| r.span().start);
        found
    }
}
