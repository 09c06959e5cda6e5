//! Static deobfuscation of string-array obfuscated JavaScript.
//!
//! The pipeline parses a script, locates the string-table / shuffle / decoder
//! helpers by shape, evaluates just those helpers in an isolated boa context,
//! then replaces every decoder call with the string it returns and folds
//! constants until nothing changes.
//!
//! ```no_run
//! use string_array_deob::{deobfuscate, DeobConfig};
//!
//! let out = deobfuscate("var a = 1 + 2;", &DeobConfig::default())?;
//! for diagnostic in &out.diagnostics {
//!     eprintln!("{diagnostic}");
//! }
//! println!("{}", out.code);
//! # Ok::<(), string_array_deob::DeobError>(())
//! ```

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod extractor;
pub mod fold;
pub mod locator;
pub mod pipeline;
pub mod rewriter;
pub mod sandbox;
pub mod tree;

pub use config::{DeobConfig, LoopTest, PatternConfig, SandboxConfig};
pub use diagnostics::{Diagnostic, DiagnosticKind, Location};
pub use error::{ConfigError, DeobError, LocateError, SandboxError};
pub use locator::{Candidate, MatchEnv, PatternName, PatternTable, Predicate};
pub use pipeline::{deobfuscate, DeobOutput, Pipeline, RunStats};
