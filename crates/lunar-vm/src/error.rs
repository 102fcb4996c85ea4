use crate::value::Value;
use lunar_core::LuaError;
use thiserror::Error;

/// Everything that can go wrong while loading or running a chunk.
#[derive(Debug, Error)]
pub enum Error {
    /// The chunk failed to lex, parse or compile. Nothing was executed.
    #[error("{chunk}:{error}")]
    Static { chunk: String, error: LuaError },

    /// A value raised by `error()` or by a fault in running code.
    #[error("{}", describe(value))]
    Runtime {
        value: Value,
        /// Frames unwound on the way out, innermost first.
        traceback: Vec<String>,
    },

    #[error("module '{name}' not found:{}", list_tried(tried))]
    ModuleNotFound { name: String, tried: Vec<String> },

    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A coroutine yielded these values. Caught by `resume`; escapes only
    /// when yielding outside of a coroutine is attempted.
    #[error("attempt to yield from outside a coroutine")]
    Yield(Vec<Value>),
}

fn describe(value: &Value) -> String {
    match value {
        Value::Str(_) | Value::Number(_) => value.to_string(),
        other => format!("(error object is a {} value)", other.type_name()),
    }
}

fn list_tried(tried: &[String]) -> String {
    tried.iter().map(|p| format!("\n\tno file '{p}'")).collect()
}

impl Error {
    pub fn runtime(value: impl Into<Value>) -> Self {
        Error::Runtime {
            value: value.into(),
            traceback: Vec::new(),
        }
    }

    /// Short category name.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Static { error, .. } => error.kind(),
            Error::Runtime { .. } => "runtime",
            Error::ModuleNotFound { .. } => "module-not-found",
            Error::Io { .. } => "io",
            Error::Yield(_) => "yield",
        }
    }

    /// The value a protected call hands back to Lua code.
    pub fn into_value(self) -> Value {
        match self {
            Error::Runtime { value, .. } => value,
            other => Value::from(other.to_string()),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Error::Runtime { value, .. } => value.clone(),
            other => Value::from(other.to_string()),
        }
    }

    pub fn traceback(&self) -> &[String] {
        match self {
            Error::Runtime { traceback, .. } => traceback,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinct() {
        let stat = Error::Static {
            chunk: "a.lua".into(),
            error: LuaError::Compile {
                line: 2,
                message: "break outside a loop at line 2".into(),
            },
        };
        assert_eq!(stat.kind(), "compile");
        assert_eq!(stat.to_string(), "a.lua:2: break outside a loop at line 2");
        assert_eq!(Error::runtime("boom").kind(), "runtime");
    }

    #[test]
    fn module_not_found_lists_paths() {
        let e = Error::ModuleNotFound {
            name: "helpers".into(),
            tried: vec!["./test/helpers.lua".into(), "./test/helpers/init.lua".into()],
        };
        assert_eq!(
            e.to_string(),
            "module 'helpers' not found:\n\tno file './test/helpers.lua'\n\tno file './test/helpers/init.lua'"
        );
    }

    #[test]
    fn non_string_error_objects() {
        assert_eq!(Error::runtime(Value::Nil).to_string(), "(error object is a nil value)");
        assert_eq!(Error::runtime(42.0).to_string(), "42");
    }
}
