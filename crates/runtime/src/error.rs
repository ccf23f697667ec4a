//! Errors surfaced by the runtime binary: config loading plus whatever
//! the engine itself reports (spec §7's taxonomy, reused rather than
//! wrapped in a second enum of its own kinds).

use thiserror::Error;

use balloons::PolicyError;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("could not read config file {path:?}: {source}")]
    ConfigRead { path: String, source: std::io::Error },

    #[error("could not parse config: {0}")]
    ConfigParse(String),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}
