use crate::limits::*;
use crate::model::*;

use super::mutations::ReservationDraft;
use super::EngineError;

pub(crate) fn validate_draft(draft: &ReservationDraft) -> Result<(), EngineError> {
    if draft.duration_minutes == 0 {
        return Err(EngineError::LimitExceeded("empty reservation"));
    }
    if draft.payer_id.is_empty() || draft.booker_id.is_empty() {
        return Err(EngineError::LimitExceeded("missing payer or booker"));
    }
    if draft.payer_id.len() > MAX_ID_LEN || draft.booker_id.len() > MAX_ID_LEN {
        return Err(EngineError::LimitExceeded("id too long"));
    }
    if let Some(ref n) = draft.notes
        && n.len() > MAX_NOTES_LEN {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
    // end_time is stored as a time of day on `date`
    if draft.span().end.date() != draft.date {
        return Err(EngineError::LimitExceeded("reservation crosses midnight"));
    }
    Ok(())
}

pub(crate) fn check_capacity(rs: &ResourceState, cap: usize) -> Result<(), EngineError> {
    if rs.reservations.iter().filter(|r| r.is_blocking()).count() >= cap {
        return Err(EngineError::LimitExceeded("too many reservations on resource"));
    }
    Ok(())
}

/// Any blocking reservation overlapping `span` is a conflict. Single-capacity room.
pub(crate) fn check_no_conflict(rs: &ResourceState, span: &Span) -> Result<(), EngineError> {
    match rs.blocking_overlapping(span).next() {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}
