//! Compile-then-parse grammar sessions.
//!
//! - [`GrammarEngine`]: the narrow compile/parse interface a session drives
//! - [`WasmGrammarEngine`]: a guest instance speaking the grammar calling
//!   convention
//! - [`GrammarSession`]: per-name state machine that refuses to parse with
//!   uncompiled grammars
//! - [`SharedSession`]: mutex-guarded session with async entry points

pub mod engine;
pub mod session;
pub mod shared;

pub use engine::{GrammarEngine, ParseResult, WasmGrammarEngine};
pub use session::{GrammarSession, GrammarStatus};
pub use shared::SharedSession;
