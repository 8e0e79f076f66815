use std::path;

use chrono::Timelike;

const MAX_NANOS: u32 = 999_999_999;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NameError {
    Empty,
    Invalid,
}

impl NameError {
    pub fn message(self) -> &'static str {
        match self {
            NameError::Empty => "File name is empty.",
            NameError::Invalid => "Wrong file name.",
        }
    }
}

fn is_forbidden_char(c: char) -> bool {
    // NUL would be rejected by the filesystem anyway, but later and as a 500
    path::is_separator(c) || c == '\0'
}

/// Checks the client supplied logical name. The name ends up as the tail of
/// a single path component, so anything that could escape the work
/// directory is refused.
pub fn validate_base_name(name: Option<&str>) -> Result<&str, NameError> {
    let name = match name {
        Some(name) if !name.is_empty() => name,
        _ => return Err(NameError::Empty),
    };

    if name.chars().any(is_forbidden_char) {
        return Err(NameError::Invalid);
    }

    Ok(name)
}

/// `HHMMSS.NNNNNNNNN_<base_name>`, sorting the same way as the timestamps
/// it was built from within one day.
pub fn format_name<T: Timelike>(now: &T, base_name: &str) -> String {
    // chrono reports a leap second as nanosecond >= 1_000_000_000
    let nanos = now.nanosecond().min(MAX_NANOS);
    format!(
        "{:02}{:02}{:02}.{:09}_{}",
        now.hour(),
        now.minute(),
        now.second(),
        nanos,
        base_name
    )
}
