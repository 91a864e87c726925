use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Expected a duration such as 30s, 5m or 250ms.")]
    DurationEmpty,
    #[error("Duration '{value}' must start with a number.")]
    InvalidDurationFormat { value: String },
    #[error("Duration '{value}' has an unreadable amount: {source}")]
    InvalidDurationNumber {
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("Duration does not fit in 64-bit milliseconds.")]
    DurationOverflow,
    #[error("Unknown duration unit '{unit}'. Use ms, s, m or h.")]
    InvalidDurationUnit { unit: String },
    #[error("Duration must be longer than zero.")]
    DurationZero,
    #[error("Value must be at least {min}.")]
    ValueTooSmall { min: u64 },
    #[error("Expected a whole number: {source}")]
    InvalidNumber {
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("Unknown database kind '{value}'. Use mysql, postgresql, or another driver name.")]
    InvalidDatabaseKind { value: String },
    #[error("Invalid database endpoint '{value}': {reason}")]
    InvalidEndpoint { value: String, reason: String },
    #[error("Unknown command '{value}'. Use prepare, run, stop, collect, or clean.")]
    InvalidCommand { value: String },
    #[error("Unknown lifecycle phase '{value}'.")]
    InvalidPhase { value: String },
    #[cfg(test)]
    #[error("Test expectation failed: {message}")]
    TestExpectation { message: &'static str },
    #[cfg(test)]
    #[error("Test expectation failed: {message}: {value}")]
    TestExpectationValue {
        message: &'static str,
        value: String,
    },
}
