use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Check a requested booking window against `now`.
///
/// Order: ordering, range, then past checks. Both `start` and `end` must not
/// lie before `now`.
pub(crate) fn validate_booking_span(start: Ms, end: Ms, now: Ms) -> Result<Span, EngineError> {
    let span = Span::try_new(start, end).ok_or_else(|| {
        EngineError::bad_request(format!("start {start} must be before end {end}"))
    })?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::bad_request("timestamp out of range"));
    }
    if span.start < now {
        return Err(EngineError::bad_request(format!("start {start} is in the past")));
    }
    if span.end < now {
        return Err(EngineError::bad_request(format!("end {end} is in the past")));
    }
    Ok(span)
}

/// Any positive size is accepted; sizes above `MAX_PAGE_SIZE` are clamped.
pub(crate) fn validate_page(req: PageRequest) -> Result<Page, EngineError> {
    if req.offset < 0 {
        return Err(EngineError::bad_request("page offset must not be negative"));
    }
    if req.size <= 0 {
        return Err(EngineError::bad_request("page size must be positive"));
    }
    let size = req.size.min(MAX_PAGE_SIZE);
    Ok(Page {
        offset: usize::try_from(req.offset)
            .map_err(|_| EngineError::bad_request("page offset out of range"))?,
        size: usize::try_from(size)
            .map_err(|_| EngineError::bad_request("page size out of range"))?,
    })
}

/// Non-empty after trimming and at most `max` bytes.
pub(crate) fn validate_text(field: &str, value: &str, max: usize) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::bad_request(format!("{field} must not be blank")));
    }
    if value.len() > max {
        return Err(EngineError::bad_request(format!("{field} longer than {max} bytes")));
    }
    Ok(())
}

pub(crate) fn validate_email(email: &str) -> Result<(), EngineError> {
    validate_text("email", email, MAX_EMAIL_LEN)?;
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !email.contains(' ') => {
            Ok(())
        }
        _ => Err(EngineError::bad_request(format!("invalid email: {email}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: Ms = 1_700_000_000_000;
    const H: Ms = 3_600_000;

    #[test]
    fn span_must_be_ordered() {
        assert!(matches!(
            validate_booking_span(NOW + 2 * H, NOW + H, NOW),
            Err(EngineError::BadRequest(_))
        ));
        assert!(matches!(
            validate_booking_span(NOW + H, NOW + H, NOW),
            Err(EngineError::BadRequest(_))
        ));
    }

    #[test]
    fn span_must_not_start_in_past() {
        let result = validate_booking_span(NOW - 1, NOW + H, NOW);
        assert!(matches!(result, Err(EngineError::BadRequest(msg)) if msg.contains("start")));
    }

    #[test]
    fn span_starting_now_is_accepted() {
        assert_eq!(
            validate_booking_span(NOW, NOW + H, NOW).unwrap(),
            Span::new(NOW, NOW + H)
        );
    }

    #[test]
    fn span_out_of_range_rejected() {
        assert!(validate_booking_span(NOW, MAX_VALID_TIMESTAMP_MS + 1, NOW).is_err());
    }

    #[test]
    fn page_bounds() {
        assert_eq!(
            validate_page(PageRequest { offset: 2, size: 10 }).unwrap(),
            Page { offset: 2, size: 10 }
        );
        assert!(validate_page(PageRequest { offset: -1, size: 10 }).is_err());
        assert!(validate_page(PageRequest { offset: 0, size: 0 }).is_err());
    }

    #[test]
    fn oversized_page_is_clamped_not_rejected() {
        assert_eq!(
            validate_page(PageRequest { offset: 1, size: 5000 }).unwrap(),
            Page { offset: 1, size: MAX_PAGE_SIZE as usize }
        );
        assert_eq!(
            validate_page(PageRequest { offset: 0, size: MAX_PAGE_SIZE }).unwrap().size,
            MAX_PAGE_SIZE as usize
        );
    }

    #[test]
    fn email_shape() {
        assert!(validate_email("a@b.c").is_ok());
        assert!(validate_email("no-at-sign").is_err());
        assert!(validate_email("@b.c").is_err());
        assert!(validate_email("a b@c.d").is_err());
        assert!(validate_email("   ").is_err());
    }

    #[test]
    fn text_limits() {
        assert!(validate_text("name", "drill", 10).is_ok());
        assert!(validate_text("name", "  ", 10).is_err());
        assert!(validate_text("name", "abcdefghijk", 10).is_err());
    }
}
