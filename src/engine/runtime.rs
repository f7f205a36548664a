//! The inference capability driven by the daemon loop.

use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use crate::tensor::TensorBatch;

/// Errors raised by an inference runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("could not load runtime library {path:?}: {reason}")]
    Library { path: PathBuf, reason: String },

    #[error("runtime library {path:?} does not export `{symbol}`")]
    MissingSymbol { path: PathBuf, symbol: &'static str },

    #[error("`{entry}` returned {code}: {message}")]
    Status {
        entry: &'static str,
        code: i32,
        message: String,
    },

    #[error("invalid runtime argument: {0}")]
    Argument(String),
}

/// Ordered `key=value` initialization arguments handed to the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeArgs {
    pairs: Vec<(String, String)>,
}

impl RuntimeArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parse one `key=value` pair. The value may itself contain `=`.
    pub fn parse_pair(text: &str) -> Result<(String, String), RuntimeError> {
        match text.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(RuntimeError::Argument(format!(
                "expected key=value, got `{}`",
                text
            ))),
        }
    }

    /// Read a JSON object; non-string values are passed as their JSON text.
    pub fn from_json_str(text: &str) -> crate::Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(map) = value else {
            return Err(RuntimeError::Argument("runtime config must be a JSON object".into()).into());
        };

        Ok(map
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect())
    }

    pub fn from_json_file(path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

impl FromIterator<(String, String)> for RuntimeArgs {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            pairs: iter.into_iter().collect(),
        }
    }
}

impl Extend<(String, String)> for RuntimeArgs {
    fn extend<I: IntoIterator<Item = (String, String)>>(&mut self, iter: I) {
        self.pairs.extend(iter);
    }
}

/// Fixed entry points of an inference engine.
///
/// `run_inference` takes the input batch by value: once called, the caller
/// has no further access to it. Whatever the runtime wrote into `output`
/// stays valid until the next call to `cleanup`.
pub trait InferenceRuntime {
    fn initialize(&mut self) -> Result<(), RuntimeError>;

    fn initialize_with_args(&mut self, args: &RuntimeArgs) -> Result<(), RuntimeError>;

    fn load_model(&mut self, path: &Path) -> Result<(), RuntimeError>;

    fn run_inference(
        &mut self,
        input: TensorBatch,
        output: &mut TensorBatch,
    ) -> Result<(), RuntimeError>;

    /// Release per-cycle scratch state.
    fn cleanup(&mut self) -> Result<(), RuntimeError>;

    fn destroy(&mut self) -> Result<(), RuntimeError>;

    fn error_message(&self) -> String;

    fn version(&self) -> String;

    fn name(&self) -> String;

    /// Initialize (with `args` when there are any) and load the model.
    fn start(&mut self, args: &RuntimeArgs, model: &Path) -> Result<(), RuntimeError> {
        if args.is_empty() {
            self.initialize()?;
        } else {
            self.initialize_with_args(args)?;
        }
        log::info!("Runtime {} {} initialized", self.name(), self.version());

        self.load_model(model)?;
        log::info!("Loaded model {:?}", model);
        Ok(())
    }
}

impl<R: InferenceRuntime + ?Sized> InferenceRuntime for Box<R> {
    fn initialize(&mut self) -> Result<(), RuntimeError> {
        (**self).initialize()
    }

    fn initialize_with_args(&mut self, args: &RuntimeArgs) -> Result<(), RuntimeError> {
        (**self).initialize_with_args(args)
    }

    fn load_model(&mut self, path: &Path) -> Result<(), RuntimeError> {
        (**self).load_model(path)
    }

    fn run_inference(
        &mut self,
        input: TensorBatch,
        output: &mut TensorBatch,
    ) -> Result<(), RuntimeError> {
        (**self).run_inference(input, output)
    }

    fn cleanup(&mut self) -> Result<(), RuntimeError> {
        (**self).cleanup()
    }

    fn destroy(&mut self) -> Result<(), RuntimeError> {
        (**self).destroy()
    }

    fn error_message(&self) -> String {
        (**self).error_message()
    }

    fn version(&self) -> String {
        (**self).version()
    }

    fn name(&self) -> String {
        (**self).name()
    }
}
