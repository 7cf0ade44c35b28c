//! Thread-safe, async-friendly access to one session.
//!
//! Guest calls block. [`SharedSession`] serializes them behind a mutex and
//! runs each one on tokio's blocking pool so async callers never stall a
//! runtime worker.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::error;

use grammar_bridge_common::BridgeError;

use crate::engine::{GrammarEngine, ParseResult};
use crate::session::GrammarSession;

/// A [`GrammarSession`] shared between threads and tasks.
///
/// Cloning is cheap; all clones drive the same session. At most one call
/// is in flight at a time.
pub struct SharedSession<E> {
    inner: Arc<Mutex<GrammarSession<E>>>,
}

impl<E> Clone for SharedSession<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> SharedSession<E>
where
    E: GrammarEngine + Send + 'static,
{
    /// Wrap `session` for shared use.
    pub fn new(session: GrammarSession<E>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    /// Lock the session for synchronous use.
    pub fn lock(&self) -> MutexGuard<'_, GrammarSession<E>> {
        self.inner.lock()
    }

    /// Compile `grammar` under `name` on the blocking pool.
    pub async fn compile(
        &self,
        grammar: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<(), BridgeError> {
        let grammar = grammar.into();
        let name = name.into();
        self.run(move |session| session.compile_grammar(&grammar, &name))
            .await
    }

    /// Parse `input` with grammar `name` on the blocking pool.
    pub async fn parse(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<ParseResult, BridgeError> {
        let name = name.into();
        let input = input.into();
        self.run(move |session| session.parse_input(&name, &input))
            .await
    }

    async fn run<R, F>(&self, f: F) -> Result<R, BridgeError>
    where
        R: Send + 'static,
        F: FnOnce(&mut GrammarSession<E>) -> Result<R, BridgeError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut session = inner.lock();
            f(&mut *session)
        })
        .await
        .map_err(|e| {
            error!(error = %e, "Session worker did not complete");
            BridgeError::WorkerFailed {
                reason: e.to_string(),
            }
        })?
    }
}

impl<E> std::fmt::Debug for SharedSession<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSession")
            .field("strong_count", &Arc::strong_count(&self.inner))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts every grammar; echoes input, panics on "panic".
    struct EchoEngine;

    impl GrammarEngine for EchoEngine {
        fn compile(&mut self, _grammar: &str, _name: &str) -> Result<(), BridgeError> {
            Ok(())
        }

        fn parse(&mut self, name: &str, input: &str) -> Result<ParseResult, BridgeError> {
            assert_ne!(input, "panic", "engine panicked");
            Ok(ParseResult {
                grammar: name.to_string(),
                output: input.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_concurrent_parses() {
        let shared = SharedSession::new(GrammarSession::new(EchoEngine));
        shared.compile("g = { ANY }", "g").await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let shared = shared.clone();
                tokio::spawn(async move { shared.parse("g", format!("input-{i}")).await })
            })
            .collect();

        for (i, task) in tasks.into_iter().enumerate() {
            let result = task.await.unwrap().unwrap();
            assert_eq!(result.output, format!("input-{i}"));
        }
    }

    #[tokio::test]
    async fn test_unknown_grammar_async() {
        let shared = SharedSession::new(GrammarSession::new(EchoEngine));
        let result = shared.parse("missing", "x").await;
        assert!(matches!(result, Err(BridgeError::UnknownGrammar { .. })));
    }

    #[tokio::test]
    async fn test_worker_panic_reported() {
        let shared = SharedSession::new(GrammarSession::new(EchoEngine));
        shared.compile("g = { ANY }", "g").await.unwrap();

        let result = shared.parse("g", "panic").await;
        assert!(matches!(result, Err(BridgeError::WorkerFailed { .. })));
    }

    #[test]
    fn test_sync_access_through_lock() {
        let shared = SharedSession::new(GrammarSession::new(EchoEngine));
        tokio_test::block_on(shared.compile("g = { ANY }", "g")).unwrap();

        assert_eq!(shared.lock().compiled_grammars(), ["g"]);
    }
}
