//! Queue key builders for all Partflow broker entries.
//!
//! Centralising key construction prevents typos and makes it easy
//! to find every key the application uses.

use partflow_entity::job::JobKind;

/// Queue key for a kind's pending handles.
pub fn queue(kind: JobKind) -> String {
    format!("queue:{kind}")
}

/// Dead-letter list key for a kind.
pub fn dead_letter(kind: JobKind) -> String {
    format!("dead:{kind}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_key() {
        assert_eq!(queue(JobKind::Transcode), "queue:transcode");
        assert_eq!(dead_letter(JobKind::ConvertDocument), "dead:convert_document");
    }
}
