use thiserror::Error;

/// Main error type for the Simrun system
#[derive(Error, Debug)]
pub enum SrError {
    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("Module error: {0}")]
    Module(#[from] ModuleError),

    #[error("Execution tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("Optimization error: {0}")]
    Optimization(#[from] OptimizationError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Errors raised while parsing or evaluating an expression formula
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Unexpected character '{character}' at position {position} in '{formula}'")]
    UnexpectedCharacter {
        formula: String,
        character: char,
        position: usize,
    },

    #[error("Unexpected end of formula '{formula}'")]
    UnexpectedEnd { formula: String },

    #[error("Unexpected token '{token}' in '{formula}'")]
    UnexpectedToken { formula: String, token: String },

    #[error("Unknown function '{name}'")]
    UnknownFunction { name: String },

    #[error("Unknown reference '{name}'")]
    UnknownReference { name: String },

    #[error("Formula '{formula}' evaluates to a non-finite value")]
    NonFinite { formula: String },
}

/// Errors raised while splitting a sample into fixed and varied parameters
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolutionError {
    #[error("Parameter '{parameter}' of sample '{sample}' is bound to unknown name '{name}'")]
    UnknownBinding {
        sample: String,
        parameter: String,
        name: String,
    },

    #[error("Could not evaluate expression '{name}' = '{formula}' in sample '{sample}': {source}")]
    Expression {
        sample: String,
        name: String,
        formula: String,
        #[source]
        source: ExpressionError,
    },

    #[error("Invalid range for variable '{variable}': start {start}, stop {stop}, step {step}")]
    InvalidRange {
        variable: String,
        start: f64,
        stop: f64,
        step: f64,
    },

    #[error("Evaluation set {index} does not exist in sample '{sample}' ({available} available)")]
    EvaluationSetOutOfRange {
        sample: String,
        index: usize,
        available: usize,
    },

    #[error("Variation row {row} is outside the grid of {rows} rows")]
    RowOutOfRange { row: usize, rows: usize },

    #[error("Expected {expected} variable values, got {actual}")]
    VectorLength { expected: usize, actual: usize },
}

/// Errors raised by a user module or the worker pipeline around it
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModuleError {
    #[error("Module not found: {name}")]
    NotFound { name: String },

    #[error("Invalid parameter '{parameter}': {message}")]
    InvalidParameter { parameter: String, message: String },

    #[error("Missing parameter '{parameter}'")]
    MissingParameter { parameter: String },

    #[error("Module run failed: {message}")]
    RunFailed { message: String },

    #[error("Module panicked: {message}")]
    Panicked { message: String },
}

/// Errors raised while building the execution tree
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TreeError {
    #[error("No enabled samples to execute")]
    NoSamples,

    #[error("Node {id} does not exist")]
    UnknownNode { id: usize },

    #[error("Node {id} is not a sample leaf")]
    NotASampleLeaf { id: usize },
}

/// Errors raised by the optimization drivers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizationError {
    #[error("Unknown solver method: {method}")]
    UnknownMethod { method: String },

    #[error("No objective value named '{name}' in results of '{leaf}'")]
    MissingObjective { leaf: String, name: String },

    #[error("No objective name configured for sample '{sample}'")]
    NoObjective { sample: String },

    #[error("No varied variables to optimize in '{leaf}'")]
    NothingToOptimize { leaf: String },

    #[error("Evaluation of '{leaf}' failed: {message}")]
    EvaluationFailed { leaf: String, message: String },

    #[error("Worker of '{leaf}' disconnected")]
    Disconnected { leaf: String },

    #[error("Optimization stopped on request")]
    Stopped,
}

/// Result type alias for Simrun operations
pub type SrResult<T> = Result<T, SrError>;

/// Helper trait for converting string errors
pub trait IntoSrError {
    fn into_sr_error(self) -> SrError;
}

impl IntoSrError for String {
    fn into_sr_error(self) -> SrError {
        SrError::Internal(self)
    }
}

impl IntoSrError for &str {
    fn into_sr_error(self) -> SrError {
        SrError::Internal(self.to_string())
    }
}

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::SrError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::SrError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::SrError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ResolutionError::InvalidRange {
            variable: "VAR_0".to_string(),
            start: 0.0,
            stop: 10.0,
            step: 0.0,
        };

        assert!(error.to_string().contains("Invalid range"));
        assert!(error.to_string().contains("VAR_0"));
    }

    #[test]
    fn test_error_conversion() {
        let resolution_error = ResolutionError::VectorLength {
            expected: 2,
            actual: 3,
        };
        let sr_error: SrError = resolution_error.into();

        match sr_error {
            SrError::Resolution(_) => (),
            _ => panic!("Expected Resolution error"),
        }
    }

    #[test]
    fn test_expression_error_is_source_of_resolution_error() {
        let error = ResolutionError::Expression {
            sample: "s".into(),
            name: "EXPR_0".into(),
            formula: "2*".into(),
            source: ExpressionError::UnexpectedEnd {
                formula: "2*".into(),
            },
        };
        let source = std::error::Error::source(&error).expect("source");
        assert!(source.to_string().contains("Unexpected end"));
    }

    #[test]
    fn test_macros() {
        let _validation_err = validation_error!("Invalid value: {}", 42);
        let _internal_err = internal_error!("Something went wrong");
        let _config_err = config_error!("Missing required field: {}", "module");
    }
}
