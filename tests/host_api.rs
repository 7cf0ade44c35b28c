//! End-to-end tests of the host-facing API.

use grammar_bridge::{
    Bridge, BridgeConfig, BridgeError, ConfigFile, EngineConfig, ExecutionConfig, GrammarSlots,
    GrammarStatus, GuestAbiConfig, ImportSurface, Session, SharedSession, compile_grammar,
    create_instance, load_engine, load_module, load_module_file, open_session, open_store,
    parse_input, standard_imports,
};

const TOY_GRAMMAR: &str =
    include_str!("../crates/grammar-bridge-session/tests/fixtures/toy_grammar.wat");
const ALPHA: &str = "alpha = { 'a'..'z' | 'A'..'Z' }";

/// Exports `run`, `memory` and nothing else; no imports.
const MINIMAL_MODULE: &[u8] = &[
    0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
    0x01, 0x04, 0x01, 0x60, 0x00, 0x00, // type: () -> ()
    0x03, 0x02, 0x01, 0x00, // function: type 0
    0x05, 0x03, 0x01, 0x00, 0x01, // memory: min 1 page
    0x07, 0x10, 0x02, // export: 2 entries
    0x06, b'm', b'e', b'm', b'o', b'r', b'y', 0x02, 0x00, // "memory"
    0x03, b'r', b'u', b'n', 0x00, 0x00, // "run"
    0x0a, 0x04, 0x01, 0x02, 0x00, 0x0b, // code: empty body
];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("grammar_bridge=debug")
        .with_test_writer()
        .try_init();
}

fn toy_bytes() -> Vec<u8> {
    wat::parse_str(TOY_GRAMMAR).unwrap()
}

fn store_id(session: &Session) -> String {
    session.engine().store().unwrap().id().to_string()
}

fn quiet_engine() -> EngineConfig {
    EngineConfig {
        epoch_interruption: false,
        ..Default::default()
    }
}

#[test]
fn test_module_exports_survive_instantiation() {
    init_tracing();
    let engine = load_engine(&quiet_engine()).unwrap();
    let store = open_store(&engine, &ExecutionConfig::default()).unwrap();

    let module = load_module(&store, MINIMAL_MODULE).unwrap();
    let instance = create_instance(&store, &module, &ImportSurface::empty(&engine)).unwrap();

    assert_eq!(
        instance.exports().keys().collect::<Vec<_>>(),
        module.exports().keys().collect::<Vec<_>>()
    );
    assert!(instance.exports().contains_key("memory"));
    assert!(instance.exports().contains_key("run"));
}

#[test]
fn test_malformed_artifact() {
    let engine = load_engine(&quiet_engine()).unwrap();
    let store = open_store(&engine, &ExecutionConfig::default()).unwrap();

    let result = load_module(&store, b"definitely not wasm");
    assert!(matches!(result, Err(BridgeError::ModuleCompile { .. })));

    let truncated = &MINIMAL_MODULE[..MINIMAL_MODULE.len() - 3];
    let result = load_module(&store, truncated);
    assert!(matches!(result, Err(BridgeError::ModuleCompile { .. })));
}

#[test]
fn test_missing_module_file() {
    let engine = load_engine(&quiet_engine()).unwrap();
    let store = open_store(&engine, &ExecutionConfig::default()).unwrap();

    let result = load_module_file(&store, "/nonexistent/peg_engine.wasm");
    assert!(matches!(result, Err(BridgeError::ModuleCompile { .. })));
}

#[test]
fn test_unsatisfied_import() {
    init_tracing();
    let engine = load_engine(&quiet_engine()).unwrap();
    let store = open_store(&engine, &ExecutionConfig::default()).unwrap();
    let module = load_module(&store, &toy_bytes()).unwrap();

    // The toy engine imports env.log
    let result = create_instance(&store, &module, &ImportSurface::empty(&engine));
    match result {
        Err(BridgeError::ImportResolution { missing, .. }) => {
            assert_eq!(missing, ["env::log"]);
        }
        other => panic!("expected ImportResolution, got {other:?}"),
    }
}

#[test]
fn test_step_by_step_alpha_scenario() {
    init_tracing();
    let engine = load_engine(&quiet_engine()).unwrap();
    let store = open_store(&engine, &ExecutionConfig::default()).unwrap();
    let module = load_module(&store, &toy_bytes()).unwrap();
    let imports = standard_imports(&engine).unwrap();
    let instance = create_instance(&store, &module, &imports).unwrap();
    let mut session = open_session(instance, &GuestAbiConfig::default()).unwrap();

    let result = parse_input(&mut session, "alpha", "a");
    assert!(matches!(result, Err(BridgeError::UnknownGrammar { .. })));

    compile_grammar(&mut session, ALPHA, "alpha").unwrap();

    let matched = parse_input(&mut session, "alpha", "a").unwrap();
    assert_eq!(matched.output, "- alpha: \"a\"");

    let result = parse_input(&mut session, "alpha", "1");
    assert!(matches!(result, Err(BridgeError::Parse { .. })));
}

#[test]
fn test_parse_after_release() {
    init_tracing();
    let engine = load_engine(&quiet_engine()).unwrap();
    let store = open_store(&engine, &ExecutionConfig::default()).unwrap();
    let module = load_module(&store, &toy_bytes()).unwrap();
    let instance = create_instance(&store, &module, &standard_imports(&engine).unwrap()).unwrap();
    let mut session = open_session(instance, &GuestAbiConfig::default()).unwrap();
    session.compile_grammar(ALPHA, "alpha").unwrap();

    store.release();

    let result = session.parse_input("alpha", "a");
    assert!(matches!(result, Err(BridgeError::StoreReleased)));

    // Never-compiled names still fail before touching the store
    let result = session.parse_input("beta", "a");
    assert!(matches!(result, Err(BridgeError::UnknownGrammar { .. })));
}

#[test]
fn test_module_from_other_engine() {
    let first = load_engine(&quiet_engine()).unwrap();
    let second = load_engine(&quiet_engine()).unwrap();
    let store = open_store(&first, &ExecutionConfig::default()).unwrap();
    let other_store = open_store(&second, &ExecutionConfig::default()).unwrap();

    let module = load_module(&other_store, MINIMAL_MODULE).unwrap();
    let result = create_instance(&store, &module, &ImportSurface::empty(&first));
    assert!(matches!(result, Err(BridgeError::EngineMismatch { .. })));
}

#[test]
fn test_bridge_compiles_configured_grammars() {
    init_tracing();
    let file = ConfigFile::from_toml(
        r#"
        [runtime.engine]
        epoch_interruption = false

        [runtime.execution]
        max_fuel = 1_000_000

        [runtime.abi]
        grammar_slots = "per_name"

        [[grammars]]
        name = "alpha"
        source = "alpha = { 'a'..'z' | 'A'..'Z' }"

        [[grammars]]
        name = "letter"
        source = "letter = { ASCII_ALPHA }"
        "#,
    )
    .unwrap();

    let bridge = Bridge::from_config_file(file).unwrap();
    assert_eq!(bridge.grammars().len(), 2);
    assert!(!bridge.engine().is_epoch_enabled());

    let mut session = bridge.open_session(&toy_bytes()).unwrap();
    assert_eq!(session.compiled_grammars(), ["alpha", "letter"]);
    assert_eq!(session.status("letter"), GrammarStatus::Ready);
    assert!(session.parse_input("letter", "x").is_ok());
}

#[test]
fn test_bridge_single_slot_keeps_last_configured_grammar() {
    let file = ConfigFile::from_toml(
        r#"
        [[grammars]]
        name = "alpha"
        source = "alpha = { 'a'..'z' | 'A'..'Z' }"

        [[grammars]]
        name = "letter"
        source = "letter = { ASCII_ALPHA }"
        "#,
    )
    .unwrap();

    let bridge = Bridge::from_config_file(file).unwrap();
    assert_eq!(bridge.config().abi.grammar_slots, GrammarSlots::Single);

    let mut session = bridge.open_session(&toy_bytes()).unwrap();
    assert_eq!(session.compiled_grammars(), ["letter"]);
    let result = session.parse_input("alpha", "a");
    assert!(matches!(result, Err(BridgeError::UnknownGrammar { .. })));
}

#[test]
fn test_bridge_rejects_bad_configured_grammar() {
    let file = ConfigFile::from_toml(
        r#"
        [[grammars]]
        name = "broken"
        source = "no rule here"
        "#,
    )
    .unwrap();

    let bridge = Bridge::from_config_file(file).unwrap();
    let result = bridge.open_session(&toy_bytes());
    assert!(matches!(
        result,
        Err(BridgeError::GrammarCompile { grammar, .. }) if grammar == "broken"
    ));
}

#[test]
fn test_sessions_get_their_own_store() {
    let bridge = Bridge::new(BridgeConfig::default()).unwrap();
    let module = bridge.compile_module(&toy_bytes()).unwrap();

    let mut first = bridge.open_session_with(&module).unwrap();
    let mut second = bridge.open_session_with(&module).unwrap();
    assert_ne!(store_id(&first), store_id(&second));

    first.compile_grammar(ALPHA, "alpha").unwrap();
    // Grammar state is per instance
    let result = second.parse_input("alpha", "a");
    assert!(matches!(result, Err(BridgeError::UnknownGrammar { .. })));

    // A crash in one session leaves the other usable
    assert!(first.parse_input("alpha", "!").is_err());
    second.compile_grammar(ALPHA, "alpha").unwrap();
    assert!(second.parse_input("alpha", "a").is_ok());
}

#[test]
fn test_recovery_after_trap_tears_down_store() {
    init_tracing();
    let bridge = Bridge::new(BridgeConfig::default()).unwrap();
    let module = bridge.compile_module(&toy_bytes()).unwrap();

    let mut session = bridge.open_session_with(&module).unwrap();
    session.compile_grammar(ALPHA, "alpha").unwrap();
    let result = session.parse_input("alpha", "!");
    assert!(matches!(result, Err(BridgeError::RuntimeTrap { .. })));
    assert!(session.is_poisoned());

    let handle = session.engine().instance().store_handle().clone();
    drop(session);
    assert!(handle.is_released());

    let mut replacement = bridge.open_session_with(&module).unwrap();
    assert_ne!(store_id(&replacement), handle.store_id().to_string());
    replacement.compile_grammar(ALPHA, "alpha").unwrap();
    assert_eq!(
        replacement.parse_input("alpha", "a").unwrap().output,
        "- alpha: \"a\""
    );
}

#[tokio::test]
async fn test_shared_session_from_bridge() {
    let bridge = Bridge::new(BridgeConfig::default()).unwrap();
    let shared = SharedSession::new(bridge.open_session(&toy_bytes()).unwrap());

    shared.compile(ALPHA, "alpha").await.unwrap();

    let (a, b) = tokio::join!(shared.parse("alpha", "a"), shared.parse("alpha", "b"));
    assert_eq!(a.unwrap().output, "- alpha: \"a\"");
    assert_eq!(b.unwrap().output, "- alpha: \"b\"");
}
