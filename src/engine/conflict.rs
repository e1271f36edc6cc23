use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

pub(crate) fn validate_window(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::InvalidArgument("window end must be after start"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > Ms::from(MAX_DURATION_HOURS) * HOUR_MS {
        return Err(EngineError::LimitExceeded("window too wide"));
    }
    Ok(())
}

/// First live reservation on the slot overlapping `window`. Reservations past
/// their `expires_at` no longer hold the slot, swept or not.
pub fn find_conflict<'a>(slot: &'a SlotState, window: &Span, now: Ms) -> Option<&'a Reservation> {
    slot.overlapping(window).find(|r| r.is_live(now))
}
