//! Dead-letter sink used when no database is configured.

use mentor_rating_core::dead_letter::{DeadLetter, DeadLetterSink};
use std::future::Future;
use std::pin::Pin;

/// Writes dead letters to the log at `error` level and drops them.
///
/// The payload is logged as lossy UTF-8 so an operator can replay it by hand.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingDeadLetterSink;

impl DeadLetterSink for LoggingDeadLetterSink {
    fn park(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
        Box::pin(async move {
            let payload = letter
                .record
                .payload
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();

            tracing::error!(
                topic = %letter.record.topic,
                partition = letter.record.partition,
                offset = letter.record.offset,
                key = ?letter.record.key,
                attempts = letter.attempts,
                first_failed_at = %letter.first_failed_at,
                error = %letter.error_message,
                payload = %payload,
                "Review event dead-lettered"
            );
            Ok(())
        })
    }
}
