//! Process-wide tracer
//!
//! A host runtime has one callback slot for call events; this module is that
//! slot. It holds at most one [`Tracer`] for the life of the process, with an
//! explicit lifecycle: [`install`] creates it (disabled unless the config
//! says otherwise), and `enable()`/`disable()` on the returned reference turn
//! event delivery on and off.
//!
//! # Example
//!
//! ```
//! use latencywatch::{config::TracerConfig, global, trace_scope};
//!
//! fn parse() -> usize {
//!     trace_scope!("parse");
//!     42
//! }
//!
//! let tracer = global::get_or_install(TracerConfig::default()).unwrap();
//! tracer.enable();
//! parse();
//! assert!(tracer.snapshot().find(concat!(module_path!(), "::parse")).is_some());
//! ```

use crate::config::TracerConfig;
use crate::error::{Result, TracerError};
use crate::hook::{CallGuard, Tracer};
use crate::identity::FunctionId;
use std::sync::OnceLock;

static GLOBAL: OnceLock<Tracer> = OnceLock::new();

/// Install the process-wide tracer
///
/// # Errors
///
/// [`TracerError::AlreadyInstalled`] if a tracer is already installed, or any
/// initialization error from [`Tracer::new`].
pub fn install(config: TracerConfig) -> Result<&'static Tracer> {
    if GLOBAL.get().is_some() {
        return Err(TracerError::AlreadyInstalled);
    }
    let tracer = Tracer::new(config)?;
    GLOBAL
        .set(tracer)
        .map_err(|_| TracerError::AlreadyInstalled)?;
    tracing::info!("global call tracer installed");
    GLOBAL.get().ok_or(TracerError::AlreadyInstalled)
}

/// Return the installed tracer, installing one with `config` if needed
///
/// `config` is ignored when a tracer already exists.
pub fn get_or_install(config: TracerConfig) -> Result<&'static Tracer> {
    match install(config) {
        Err(TracerError::AlreadyInstalled) => {
            GLOBAL.get().ok_or(TracerError::AlreadyInstalled)
        }
        other => other,
    }
}

/// The installed tracer, if any
pub fn global() -> Option<&'static Tracer> {
    GLOBAL.get()
}

/// Open a scoped call on the global tracer
///
/// Returns `None` when no tracer is installed. Used by [`crate::trace_scope!`].
pub fn enter(function: FunctionId) -> Option<CallGuard<'static>> {
    GLOBAL.get().map(|tracer| tracer.enter(function))
}

/// Identity of the enclosing call site, built once and cached
///
/// The qualified name is the current module path joined with `$name`; file
/// and line come from the invocation.
#[macro_export]
macro_rules! function_id {
    ($name:literal) => {{
        static ID: ::std::sync::OnceLock<$crate::identity::FunctionId> =
            ::std::sync::OnceLock::new();
        ID.get_or_init(|| {
            $crate::identity::FunctionId::new(
                concat!(module_path!(), "::", $name),
                file!(),
                line!(),
            )
        })
        .clone()
    }};
}

/// Trace the rest of the enclosing block as a call to `$name`
///
/// Does nothing when no global tracer is installed or tracing is disabled.
#[macro_export]
macro_rules! trace_scope {
    ($name:literal) => {
        let _latencywatch_guard = $crate::global::enter($crate::function_id!($name));
    };
}
