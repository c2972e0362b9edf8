use thiserror::Error;

/// Recoverable class registration failures.
///
/// Contract violations such as a 256th virtual override are panics instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("class {name} is already registered")]
    DuplicateClass { name: String },

    #[error("invalid class or member name {name:?}")]
    InvalidName { name: String },

    #[error("class {class} exposes {count} methods, more than {max}", max = crate::class::MAX_METHODS)]
    TooManyMethods { class: String, count: usize },

    #[error("method {class}.{method} is registered twice")]
    DuplicateMethod { class: String, method: String },

    #[error("property {class}.{property} refers to unknown accessor {accessor}")]
    UnknownAccessor { class: String, property: String, accessor: String },
}
