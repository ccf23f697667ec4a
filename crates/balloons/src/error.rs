//! The error taxonomy raised by the balloon policy (spec §7).

use thiserror::Error;

use allocator::AllocatorError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// Surfaced to the reconfig caller; never raised after running state
    /// has started to mutate.
    #[error("configuration invalid: {0}")]
    ConfigurationInvalid(String),

    /// Bubbled up from the tree or priority allocator.
    #[error("insufficient CPUs: {0}")]
    InsufficientCpus(#[from] AllocatorError),

    /// `new-balloon-must` hit the definition's `maxBalloons` cap.
    #[error("balloon definition {definition:?} has reached its instance cap")]
    MaxBalloonsReached { definition: String },

    /// An annotation named a balloon definition that does not exist.
    #[error("annotation names unknown balloon definition {name:?}")]
    UnknownAnnotation { name: String },

    /// No fill method in the chain (including the mandatory final
    /// `new-balloon-must` fallback) produced a balloon.
    #[error("no suitable balloon instance for definition {definition:?}")]
    NoSuitableBalloon { definition: String },

    /// A core invariant was violated (e.g. releasing a CPU the balloon
    /// never held). Always fatal to the operation in progress, never to
    /// the process: logged and returned, the caller decides what to do.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    /// `release_resources` or `dismiss` named a container not present in
    /// any balloon's pod map.
    #[error("container {0:?} is not assigned to any balloon")]
    UnknownContainer(String),
}
