//! Error types for the scraping procedure.
//!
//! Application flow uses `anyhow::Result`; the per-reference browser
//! procedure raises `StepError` so terminal failures can be classified in
//! the final report and metrics.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the per-reference processing procedure.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("reference filter did not settle: {0}")]
    Filter(String),

    #[error("book view did not open: {0}")]
    OpenBookView(String),

    #[error("report popup did not appear within {0:?}")]
    PopupTimeout(Duration),

    #[error("report download failed: {0}")]
    Download(String),

    #[error("session expired and re-login failed: {0}")]
    SessionRefresh(String),
}

/// Coarse failure classification recorded per terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Filter,
    OpenBookView,
    PopupTimeout,
    Download,
    SessionRefresh,
    TaskTimeout,
    Other,
}

impl FailureKind {
    /// Classify an error raised by the processing procedure.
    pub fn classify(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<StepError>() {
            Some(StepError::Filter(_)) => FailureKind::Filter,
            Some(StepError::OpenBookView(_)) => FailureKind::OpenBookView,
            Some(StepError::PopupTimeout(_)) => FailureKind::PopupTimeout,
            Some(StepError::Download(_)) => FailureKind::Download,
            Some(StepError::SessionRefresh(_)) => FailureKind::SessionRefresh,
            None => FailureKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Filter => "filter",
            FailureKind::OpenBookView => "open_book_view",
            FailureKind::PopupTimeout => "popup_timeout",
            FailureKind::Download => "download",
            FailureKind::SessionRefresh => "session_refresh",
            FailureKind::TaskTimeout => "task_timeout",
            FailureKind::Other => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_step_errors() {
        let err = anyhow::Error::new(StepError::Filter("input missing".into()));
        assert_eq!(FailureKind::classify(&err), FailureKind::Filter);

        let err = anyhow::Error::new(StepError::PopupTimeout(Duration::from_secs(30)));
        assert_eq!(FailureKind::classify(&err), FailureKind::PopupTimeout);
    }

    #[test]
    fn classify_falls_back_to_other() {
        let err = anyhow::anyhow!("page crashed");
        assert_eq!(FailureKind::classify(&err), FailureKind::Other);
    }
}
