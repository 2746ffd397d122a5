use super::fetch::FetchResponse;
use crate::error::FetchError;
use crate::models::Outcome;

/// Classify the result of one fetch
pub fn classify(
    result: &Result<FetchResponse, FetchError>,
    permanent_statuses: &[u16],
) -> Outcome {
    match result {
        Err(FetchError::Transport(_) | FetchError::Timeout(_) | FetchError::InvalidBody(_)) => {
            Outcome::Transport
        }
        Err(FetchError::BlockedPage) => Outcome::BlockedPage,
        Err(FetchError::Http(status)) => classify_status(*status, permanent_statuses),
        Ok(response) if response.is_blocked_page => Outcome::BlockedPage,
        Ok(response) => classify_status(response.status, permanent_statuses),
    }
}

fn classify_status(status: u16, permanent_statuses: &[u16]) -> Outcome {
    match status {
        200..=299 => Outcome::Success,
        429 => Outcome::RateLimited,
        s if permanent_statuses.contains(&s) => Outcome::Permanent,
        _ => Outcome::HttpError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const PERMANENT: &[u16] = &[400, 403, 404];

    fn ok(status: u16) -> Result<FetchResponse, FetchError> {
        Ok(FetchResponse::new(status, "{}"))
    }

    #[test]
    fn test_status_classes() {
        assert_eq!(classify(&ok(200), PERMANENT), Outcome::Success);
        assert_eq!(classify(&ok(204), PERMANENT), Outcome::Success);
        assert_eq!(classify(&ok(429), PERMANENT), Outcome::RateLimited);
        assert_eq!(classify(&ok(404), PERMANENT), Outcome::Permanent);
        assert_eq!(classify(&ok(500), PERMANENT), Outcome::HttpError);
        assert_eq!(classify(&ok(410), PERMANENT), Outcome::HttpError);
    }

    #[test]
    fn test_blocked_page_beats_status() {
        let mut response = FetchResponse::new(200, "<html>");
        response.is_blocked_page = true;
        assert_eq!(classify(&Ok(response), PERMANENT), Outcome::BlockedPage);
        assert_eq!(classify(&Err(FetchError::BlockedPage), PERMANENT), Outcome::BlockedPage);
    }

    #[test]
    fn test_fetch_errors() {
        assert_eq!(
            classify(&Err(FetchError::Transport("reset".into())), PERMANENT),
            Outcome::Transport
        );
        assert_eq!(
            classify(&Err(FetchError::Timeout(Duration::from_secs(1))), PERMANENT),
            Outcome::Transport
        );
        assert_eq!(classify(&Err(FetchError::Http(403)), PERMANENT), Outcome::Permanent);
        assert_eq!(classify(&Err(FetchError::Http(429)), PERMANENT), Outcome::RateLimited);
    }
}
