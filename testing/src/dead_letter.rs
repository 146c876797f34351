//! Capturing dead-letter sink.

use mentor_rating_core::dead_letter::{DeadLetter, DeadLetterSink};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// Keeps every parked message in memory.
#[derive(Clone, Default)]
pub struct InMemoryDeadLetterSink {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetterSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything parked so far, oldest first.
    #[must_use]
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().unwrap().clone()
    }

    /// Number of parked messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.letters.lock().unwrap().len()
    }

    /// True when nothing was parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.letters.lock().unwrap().is_empty()
    }
}

impl DeadLetterSink for InMemoryDeadLetterSink {
    fn park(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
        Box::pin(async move {
            self.letters.lock().unwrap().push(letter);
            Ok(())
        })
    }
}
