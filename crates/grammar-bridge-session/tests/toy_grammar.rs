//! Grammar sessions against a real guest.
//!
//! The guest is `fixtures/toy_grammar.wat`: it accepts any grammar text
//! containing `=`, matches a single leading ASCII letter, and traps on
//! input starting with `!`.

use grammar_bridge_common::{BridgeError, EngineConfig, ExecutionConfig, GuestAbiConfig};
use grammar_bridge_core::{CompiledModule, GuestInstance, ImportSurface, SandboxStore, WasmEngine};
use grammar_bridge_host::register_all;
use grammar_bridge_session::{
    GrammarEngine, GrammarSession, GrammarStatus, SharedSession, WasmGrammarEngine,
};

const TOY_GRAMMAR: &str = include_str!("fixtures/toy_grammar.wat");
const ALPHA: &str = "alpha = { 'a'..'z' | 'A'..'Z' }";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("grammar_bridge=debug")
        .with_test_writer()
        .try_init();
}

struct Fixture {
    store: SandboxStore,
    session: GrammarSession<WasmGrammarEngine>,
}

fn fixture() -> Fixture {
    fixture_with(&ExecutionConfig::default())
}

fn fixture_with(execution: &ExecutionConfig) -> Fixture {
    init_tracing();

    let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
    let store = SandboxStore::new(&engine, execution).unwrap();
    let mut imports = ImportSurface::empty(&engine);
    register_all(&mut imports).unwrap();

    let module = CompiledModule::from_wat(engine.inner(), TOY_GRAMMAR).unwrap();
    let instance = GuestInstance::instantiate(&store, &module, &imports).unwrap();
    let engine = WasmGrammarEngine::attach(instance, &GuestAbiConfig::default()).unwrap();

    Fixture {
        store,
        session: GrammarSession::new(engine),
    }
}

#[test]
fn test_alpha_scenario() {
    let Fixture {
        store: _store,
        mut session,
    } = fixture();

    session.compile_grammar(ALPHA, "alpha").unwrap();
    assert_eq!(session.status("alpha"), GrammarStatus::Ready);

    let result = session.parse_input("alpha", "a").unwrap();
    assert_eq!(result.grammar, "alpha");
    assert_eq!(result.output, "- alpha: \"a\"");

    let result = session.parse_input("alpha", "1");
    assert!(matches!(
        result,
        Err(BridgeError::Parse { grammar, diagnostic }) if grammar == "alpha" && diagnostic == "no match"
    ));

    // A non-match is not a crash
    assert!(!session.is_poisoned());
    assert!(session.parse_input("alpha", "Z").is_ok());
}

#[test]
fn test_parse_before_compile() {
    let Fixture {
        store: _store,
        mut session,
    } = fixture();

    let result = session.parse_input("alpha", "a");
    assert!(matches!(result, Err(BridgeError::UnknownGrammar { .. })));
}

#[test]
fn test_guest_rejects_grammar() {
    let Fixture {
        store: _store,
        mut session,
    } = fixture();

    let result = session.compile_grammar("alpha { 'a' }", "alpha");
    assert!(matches!(
        result,
        Err(BridgeError::GrammarCompile { grammar, diagnostic })
            if grammar == "alpha" && diagnostic == "expected rule definition"
    ));
    assert_eq!(session.status("alpha"), GrammarStatus::Uninitialized);
    assert!(!session.is_poisoned());
}

#[test]
fn test_guest_trap_poisons_instance() {
    let Fixture {
        store: _store,
        mut session,
    } = fixture();
    session.compile_grammar(ALPHA, "alpha").unwrap();

    let result = session.parse_input("alpha", "!boom");
    assert!(matches!(
        result,
        Err(BridgeError::RuntimeTrap { code: Some(code), .. }) if code == "UnreachableCodeReached"
    ));

    assert!(session.is_poisoned());
    assert!(session.engine().instance().is_poisoned());

    let result = session.parse_input("alpha", "a");
    assert!(matches!(result, Err(BridgeError::InstancePoisoned { .. })));
}

#[test]
fn test_poisoning_survives_session_teardown() {
    let Fixture {
        store: _store,
        session,
    } = fixture();
    let mut engine = session.into_engine();
    engine.compile(ALPHA, "alpha").unwrap();

    assert!(engine.parse("alpha", "!").is_err());

    // Poisoning lives on the instance, not only in the session
    let result = engine.compile(ALPHA, "beta");
    assert!(matches!(result, Err(BridgeError::InstancePoisoned { .. })));
}

#[test]
fn test_recompile_policy_against_guest() {
    let Fixture { store, mut session } = fixture();

    session.compile_grammar(ALPHA, "alpha").unwrap();
    let calls_before = store.with_context(|ctx| ctx.metrics.calls);

    session.compile_grammar(ALPHA, "alpha").unwrap();
    assert_eq!(store.with_context(|ctx| ctx.metrics.calls), calls_before);

    let result = session.compile_grammar("alpha = { 'a' }", "alpha");
    assert!(matches!(result, Err(BridgeError::GrammarConflict { .. })));
}

#[test]
fn test_guest_logs_reach_store() {
    let Fixture { store, mut session } = fixture();
    session.compile_grammar(ALPHA, "alpha").unwrap();

    store.with_context(|ctx| {
        assert!(ctx.logs.iter().any(|entry| entry.message == "grammar compiled"));
    });
}

#[test]
fn test_guest_logs_are_capped_and_drained() {
    let Fixture { store, session } = fixture_with(&ExecutionConfig {
        max_guest_logs: 4,
        ..Default::default()
    });
    let mut engine = session.into_engine();

    // Bypass the session so every compile reaches the guest
    for _ in 0..10 {
        engine.compile(ALPHA, "alpha").unwrap();
    }
    store.with_context(|ctx| assert_eq!(ctx.logs.len(), 4));

    let drained = store.take_logs();
    assert_eq!(drained.len(), 4);
    assert!(drained.iter().all(|entry| entry.message == "grammar compiled"));
    store.with_context(|ctx| assert!(ctx.logs.is_empty()));

    engine.compile(ALPHA, "alpha").unwrap();
    store.with_context(|ctx| assert_eq!(ctx.logs.len(), 1));
}

#[test]
fn test_missing_grammar_exports() {
    init_tracing();
    let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
    let store = SandboxStore::new(&engine, &ExecutionConfig::default()).unwrap();
    let module = CompiledModule::from_wat(
        engine.inner(),
        r#"
        (module
            (memory (export "memory") 1)
            (func (export "alloc") (param i32) (result i32) (i32.const 0))
            (func (export "compile_grammar") (param i32) (result i64) (i64.const 0))
        )
        "#,
    )
    .unwrap();
    let instance =
        GuestInstance::instantiate(&store, &module, &ImportSurface::empty(&engine)).unwrap();

    let result = WasmGrammarEngine::attach(instance, &GuestAbiConfig::default());
    assert!(matches!(
        result,
        Err(BridgeError::ExportSignatureMismatch { name, .. }) if name == "compile_grammar"
    ));
}

#[tokio::test]
async fn test_shared_session_over_guest() {
    let Fixture { store, session } = fixture();
    let shared = SharedSession::new(session);

    shared.compile(ALPHA, "alpha").await.unwrap();
    let result = shared.parse("alpha", "q").await.unwrap();
    assert_eq!(result.output, "- alpha: \"q\"");

    let result = shared.parse("alpha", "7").await;
    assert!(matches!(result, Err(BridgeError::Parse { .. })));

    // Parses from the worker pool still run inside the caller's store
    assert!(store.with_context(|ctx| ctx.metrics.calls) > 0);
}
