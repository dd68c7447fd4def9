use thiserror::Error;

/// Errors that stop a run before any virtual user starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("stage list is empty; at least one stage is required")]
    EmptyStages,

    #[error("invalid duration '{value}' for {context}")]
    InvalidDuration { value: String, context: String },

    #[error("invalid metric selector '{0}': {1}")]
    InvalidSelector(String, String),

    #[error("invalid threshold expression '{expr}' on '{selector}': {reason}")]
    InvalidExpression {
        selector: String,
        expr: String,
        reason: String,
    },

    #[error("threshold '{expr}' on '{selector}': statistic '{stat}' is not defined for {kind} metrics")]
    StatisticNotApplicable {
        selector: String,
        expr: String,
        stat: String,
        kind: String,
    },

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
}
