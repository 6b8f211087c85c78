use std::error::Error;
use std::fmt::{Display, Formatter, Result as FmtResult};

use crate::session::{SummaryKind, UploadSummary};

pub const EXIT_FAILED: i32 = 1;
pub const EXIT_PARTIAL: i32 = 2;
pub const EXIT_REAUTH: i32 = 3;

/// Ends the process with a specific code once `main` sees it.
#[derive(Debug)]
pub struct ExitCodeError {
    code: i32,
    message: Option<String>,
}

impl ExitCodeError {
    pub fn silent(code: i32) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn with_message(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// `None` when every file made it.
    pub fn for_summary(summary: &UploadSummary) -> Option<Self> {
        if summary.needs_reauthentication() {
            return Some(Self::with_message(
                EXIT_REAUTH,
                "Session expired while waiting for processing. Run 'photodrop auth --token <token>' and upload again.",
            ));
        }
        match summary.kind() {
            SummaryKind::AllSucceeded => None,
            SummaryKind::PartialSuccess => Some(Self::silent(EXIT_PARTIAL)),
            SummaryKind::AllFailed | SummaryKind::Cancelled => Some(Self::silent(EXIT_FAILED)),
        }
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl Display for ExitCodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        if let Some(message) = self.message() {
            write!(f, "{message}")
        } else {
            write!(f, "process exited with code {}", self.code)
        }
    }
}

impl Error for ExitCodeError {}
