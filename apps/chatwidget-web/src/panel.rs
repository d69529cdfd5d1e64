//! Content of the static panel that replaces the mount point after a terminal failure.

use chatwidget_core::{ErrorCode, WidgetError};

pub(crate) const PANEL_STYLES: &[(&str, &str)] = &[
    ("box-sizing", "border-box"),
    ("display", "flex"),
    ("flex-direction", "column"),
    ("align-items", "center"),
    ("justify-content", "center"),
    ("gap", "8px"),
    ("min-height", "160px"),
    ("padding", "24px"),
    ("border", "1px solid #e2e8f0"),
    ("border-radius", "8px"),
    ("background", "#f8fafc"),
    ("color", "#334155"),
    ("font-family", "system-ui, sans-serif"),
    ("font-size", "14px"),
    ("text-align", "center"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FailurePanel {
    pub heading: &'static str,
    pub detail: String,
    pub hint: Option<&'static str>,
    pub code: &'static str,
}

impl FailurePanel {
    pub(crate) fn for_error(error: &WidgetError) -> Self {
        let heading = match error.code {
            ErrorCode::ConfigurationError | ErrorCode::ContainerNotFound => {
                "Chat widget is misconfigured"
            }
            ErrorCode::AuthFailed | ErrorCode::PopupBlocked => "Sign-in did not complete",
            _ => "Chat is temporarily unavailable",
        };
        let hint = match error.code {
            ErrorCode::PopupBlocked => Some("Allow pop-ups for this site, then reload the page."),
            _ if error.retryable => Some("Reload the page to try again."),
            _ => None,
        };
        Self {
            heading,
            detail: error.message.clone(),
            hint,
            code: error.code.as_str(),
        }
    }

    /// Text lines in display order.
    pub(crate) fn lines(&self) -> Vec<String> {
        let mut lines = vec![self.heading.to_string(), self.detail.clone()];
        if let Some(hint) = self.hint {
            lines.push(hint.to_string());
        }
        lines.push(format!("Error code: {}", self.code));
        lines
    }
}
