//! Compile-then-parse session over one grammar engine.
//!
//! Each grammar name moves from [`GrammarStatus::Uninitialized`] to
//! [`GrammarStatus::Ready`] on its first successful compile. Parsing with a
//! name that is not ready fails before the engine is called.
//!
//! Names are capabilities: once ready, a name is bound to the exact text
//! it was compiled from. Compiling the same text again is a no-op;
//! compiling different text under it is a [`BridgeError::GrammarConflict`].
//!
//! An engine with [`GrammarSlots::Single`] forgets its previous grammar on
//! every compile. The session mirrors that: a successful compile moves
//! every other ready name back to uninitialized, so parsing with an
//! evicted name fails fast instead of reaching the engine.

use std::collections::HashMap;

use tracing::{debug, info, instrument, warn};

use grammar_bridge_common::{BridgeError, GrammarEntry, GrammarSlots};

use crate::engine::{GrammarEngine, ParseResult};

/// Whether a grammar name may be parsed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrammarStatus {
    /// Never compiled, every compile attempt failed, or evicted by a
    /// later compile on a single-slot engine.
    Uninitialized,
    /// Compiled successfully; parse calls are allowed.
    Ready,
}

/// Drives a [`GrammarEngine`] through the compile-then-parse protocol.
#[derive(Debug)]
pub struct GrammarSession<E> {
    engine: E,

    /// Ready grammars by name, with the text they were compiled from.
    grammars: HashMap<String, String>,

    poisoned: Option<String>,
}

impl<E: GrammarEngine> GrammarSession<E> {
    /// Start a session with no grammars compiled.
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            grammars: HashMap::new(),
            poisoned: None,
        }
    }

    /// Compile `grammar` under `name`.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::GrammarCompile`] if the engine rejects the text (or
    ///   `name` is empty); the name stays uninitialized
    /// - [`BridgeError::GrammarConflict`] if `name` is ready with other text
    /// - [`BridgeError::InstancePoisoned`] after an earlier fatal failure
    /// - any call failure reported by the engine
    #[instrument(skip(self, grammar), fields(grammar_len = grammar.len()))]
    pub fn compile_grammar(&mut self, grammar: &str, name: &str) -> Result<(), BridgeError> {
        self.check_poisoned()?;

        if name.is_empty() {
            return Err(BridgeError::GrammarCompile {
                grammar: String::new(),
                diagnostic: "grammar name must not be empty".into(),
            });
        }

        if let Some(existing) = self.grammars.get(name) {
            if existing == grammar {
                debug!(grammar = name, "Grammar already compiled from identical text");
                return Ok(());
            }
            warn!(grammar = name, "Refusing to recompile grammar with different text");
            return Err(BridgeError::GrammarConflict {
                grammar: name.to_string(),
            });
        }

        let result = self.engine.compile(grammar, name);
        self.observe(&result);
        result?;

        if self.engine.grammar_slots() == GrammarSlots::Single {
            self.evict_all_but(name);
        }
        self.grammars.insert(name.to_string(), grammar.to_string());
        info!(grammar = name, "Grammar compiled");
        Ok(())
    }

    /// Parse `input` with the grammar compiled under `name`.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::UnknownGrammar`] if `name` is not ready; the engine
    ///   is not called
    /// - [`BridgeError::Parse`] if the input does not match
    /// - [`BridgeError::InstancePoisoned`] after an earlier fatal failure
    /// - any call failure reported by the engine
    #[instrument(skip(self, input), fields(input_len = input.len()))]
    pub fn parse_input(&mut self, name: &str, input: &str) -> Result<ParseResult, BridgeError> {
        if !self.grammars.contains_key(name) {
            return Err(BridgeError::unknown_grammar(name));
        }
        self.check_poisoned()?;

        let result = self.engine.parse(name, input);
        self.observe(&result);

        match &result {
            Ok(_) => debug!(grammar = name, "Input matched"),
            Err(BridgeError::Parse { diagnostic, .. }) => {
                debug!(grammar = name, %diagnostic, "Input did not match");
            }
            Err(_) => {}
        }
        result
    }

    /// Compile every entry in order, stopping at the first failure.
    ///
    /// Returns how many entries were compiled.
    pub fn compile_all(&mut self, entries: &[GrammarEntry]) -> Result<usize, BridgeError> {
        for entry in entries {
            self.compile_grammar(&entry.source, &entry.name)?;
        }
        Ok(entries.len())
    }

    /// Status of `name` in this session.
    pub fn status(&self, name: &str) -> GrammarStatus {
        if self.grammars.contains_key(name) {
            GrammarStatus::Ready
        } else {
            GrammarStatus::Uninitialized
        }
    }

    /// Names of every ready grammar, sorted.
    pub fn compiled_grammars(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.grammars.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Returns `true` once a fatal failure has made the engine unusable.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// The underlying engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// End the session and return the engine.
    pub fn into_engine(self) -> E {
        self.engine
    }

    fn evict_all_but(&mut self, name: &str) {
        self.grammars.retain(|existing, _| {
            let keep = existing == name;
            if !keep {
                debug!(grammar = %existing, replaced_by = name, "Grammar evicted");
            }
            keep
        });
    }

    fn check_poisoned(&self) -> Result<(), BridgeError> {
        match &self.poisoned {
            Some(reason) => Err(BridgeError::InstancePoisoned {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn observe<T>(&mut self, result: &Result<T, BridgeError>) {
        if let Err(e) = result {
            if e.poisons_instance() && self.poisoned.is_none() {
                self.poisoned = Some(e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory engine: grammars must contain '=', input must start with
    /// the grammar's first letter, and "trap" crashes it.
    #[derive(Default)]
    struct FakeEngine {
        compiled: HashMap<String, char>,
        compile_calls: usize,
        parse_calls: usize,
        single_slot: bool,
    }

    impl GrammarEngine for FakeEngine {
        fn grammar_slots(&self) -> GrammarSlots {
            if self.single_slot {
                GrammarSlots::Single
            } else {
                GrammarSlots::PerName
            }
        }

        fn compile(&mut self, grammar: &str, name: &str) -> Result<(), BridgeError> {
            self.compile_calls += 1;
            match (grammar.contains('='), grammar.chars().next()) {
                (true, Some(first)) => {
                    if self.single_slot {
                        self.compiled.clear();
                    }
                    self.compiled.insert(name.to_string(), first);
                    Ok(())
                }
                _ => Err(BridgeError::GrammarCompile {
                    grammar: name.to_string(),
                    diagnostic: "expected rule definition".into(),
                }),
            }
        }

        fn parse(&mut self, name: &str, input: &str) -> Result<ParseResult, BridgeError> {
            self.parse_calls += 1;
            if input == "trap" {
                return Err(BridgeError::trap("unreachable", None));
            }
            // Like the real engine, an unknown rule is a crash
            let Some(&first) = self.compiled.get(name) else {
                return Err(BridgeError::trap("undefined rule", None));
            };
            if input.starts_with(first) {
                Ok(ParseResult {
                    grammar: name.to_string(),
                    output: input.to_string(),
                })
            } else {
                Err(BridgeError::Parse {
                    grammar: name.to_string(),
                    diagnostic: format!("expected {first}"),
                })
            }
        }
    }

    fn session() -> GrammarSession<FakeEngine> {
        GrammarSession::new(FakeEngine::default())
    }

    #[test]
    fn test_parse_before_compile_skips_engine() {
        let mut session = session();

        let result = session.parse_input("alpha", "a");

        assert!(matches!(result, Err(BridgeError::UnknownGrammar { .. })));
        assert_eq!(session.engine().parse_calls, 0);
        assert_eq!(session.status("alpha"), GrammarStatus::Uninitialized);
    }

    #[test]
    fn test_compile_then_parse() {
        let mut session = session();
        session.compile_grammar("a = { \"a\" }", "alpha").unwrap();

        assert_eq!(session.status("alpha"), GrammarStatus::Ready);
        let result = session.parse_input("alpha", "abc").unwrap();
        assert_eq!(result.grammar, "alpha");

        let result = session.parse_input("alpha", "xyz");
        assert!(matches!(result, Err(BridgeError::Parse { .. })));
        assert!(!session.is_poisoned());
    }

    #[test]
    fn test_failed_compile_stays_uninitialized() {
        let mut session = session();

        let result = session.compile_grammar("no rules here", "alpha");
        assert!(matches!(result, Err(BridgeError::GrammarCompile { .. })));
        assert_eq!(session.status("alpha"), GrammarStatus::Uninitialized);

        let result = session.parse_input("alpha", "a");
        assert!(matches!(result, Err(BridgeError::UnknownGrammar { .. })));
    }

    #[test]
    fn test_compile_is_per_name() {
        let mut session = session();
        session.compile_grammar("a = { \"a\" }", "alpha").unwrap();

        let result = session.parse_input("beta", "a");
        assert!(matches!(result, Err(BridgeError::UnknownGrammar { .. })));
    }

    #[test]
    fn test_identical_recompile_is_noop() {
        let mut session = session();
        session.compile_grammar("a = { \"a\" }", "alpha").unwrap();
        session.compile_grammar("a = { \"a\" }", "alpha").unwrap();

        assert_eq!(session.engine().compile_calls, 1);
    }

    #[test]
    fn test_conflicting_recompile_rejected() {
        let mut session = session();
        session.compile_grammar("a = { \"a\" }", "alpha").unwrap();

        let result = session.compile_grammar("b = { \"b\" }", "alpha");
        assert!(matches!(
            result,
            Err(BridgeError::GrammarConflict { grammar }) if grammar == "alpha"
        ));

        // Original grammar still in effect
        assert!(session.parse_input("alpha", "a").is_ok());
        assert_eq!(session.engine().compile_calls, 1);
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut session = session();
        let result = session.compile_grammar("a = { \"a\" }", "");
        assert!(matches!(result, Err(BridgeError::GrammarCompile { .. })));
        assert_eq!(session.engine().compile_calls, 0);
    }

    #[test]
    fn test_trap_poisons_session() {
        let mut session = session();
        session.compile_grammar("a = { \"a\" }", "alpha").unwrap();

        let result = session.parse_input("alpha", "trap");
        assert!(matches!(result, Err(BridgeError::RuntimeTrap { .. })));
        assert!(session.is_poisoned());

        let result = session.parse_input("alpha", "a");
        assert!(matches!(result, Err(BridgeError::InstancePoisoned { .. })));
        let result = session.compile_grammar("b = { \"b\" }", "beta");
        assert!(matches!(result, Err(BridgeError::InstancePoisoned { .. })));
        assert_eq!(session.engine().parse_calls, 1);
    }

    #[test]
    fn test_compile_all_stops_at_first_failure() {
        let mut session = session();
        let entries = [
            GrammarEntry::new("alpha", "a = { \"a\" }"),
            GrammarEntry::new("broken", "nothing"),
            GrammarEntry::new("beta", "b = { \"b\" }"),
        ];

        let result = session.compile_all(&entries);

        assert!(matches!(
            result,
            Err(BridgeError::GrammarCompile { grammar, .. }) if grammar == "broken"
        ));
        assert_eq!(session.compiled_grammars(), ["alpha"]);
    }

    fn single_slot_session() -> GrammarSession<FakeEngine> {
        GrammarSession::new(FakeEngine {
            single_slot: true,
            ..Default::default()
        })
    }

    #[test]
    fn test_single_slot_compile_evicts_previous_grammar() {
        let mut session = single_slot_session();
        session.compile_grammar("a = { \"a\" }", "alpha").unwrap();
        session.compile_grammar("b = { \"b\" }", "beta").unwrap();

        assert_eq!(session.status("alpha"), GrammarStatus::Uninitialized);
        assert_eq!(session.status("beta"), GrammarStatus::Ready);
        assert_eq!(session.compiled_grammars(), ["beta"]);

        let result = session.parse_input("alpha", "a");
        assert!(matches!(result, Err(BridgeError::UnknownGrammar { .. })));
        assert!(!session.is_poisoned());
        assert_eq!(session.engine().parse_calls, 0);

        assert!(session.parse_input("beta", "b").is_ok());
    }

    #[test]
    fn test_single_slot_recompile_restores_grammar() {
        let mut session = single_slot_session();
        session.compile_grammar("a = { \"a\" }", "alpha").unwrap();
        session.compile_grammar("b = { \"b\" }", "beta").unwrap();

        // Evicted, so compiling again reaches the engine
        session.compile_grammar("a = { \"a\" }", "alpha").unwrap();
        assert_eq!(session.engine().compile_calls, 3);
        assert_eq!(session.compiled_grammars(), ["alpha"]);
        assert!(session.parse_input("alpha", "a").is_ok());
    }

    #[test]
    fn test_single_slot_failed_compile_keeps_current_grammar() {
        let mut session = single_slot_session();
        session.compile_grammar("a = { \"a\" }", "alpha").unwrap();

        assert!(session.compile_grammar("broken", "beta").is_err());
        assert_eq!(session.compiled_grammars(), ["alpha"]);
    }

    #[test]
    fn test_recompile_compares_full_text() {
        let mut session = session();
        session.compile_grammar("a = { \"a\" }", "alpha").unwrap();

        // Same length and prefix, different text
        let result = session.compile_grammar("a = { \"b\" }", "alpha");
        assert!(matches!(result, Err(BridgeError::GrammarConflict { .. })));
    }

    #[test]
    fn test_compiled_grammars_sorted() {
        let mut session = session();
        let entries = [
            GrammarEntry::new("zeta", "z = { \"z\" }"),
            GrammarEntry::new("alpha", "a = { \"a\" }"),
        ];

        assert_eq!(session.compile_all(&entries).unwrap(), 2);
        assert_eq!(session.compiled_grammars(), ["alpha", "zeta"]);
    }
}
