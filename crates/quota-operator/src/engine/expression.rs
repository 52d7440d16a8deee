use cel_interpreter::{Context, Program, Value};
use snafu::Snafu;

/// Upper bound on the length of a single expression.
pub const DEFAULT_MAX_EXPRESSION_LENGTH: usize = 10 * 1024;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("expression is {length} characters long, the limit is {limit}"))]
    ExpressionTooLong { length: usize, limit: usize },

    #[snafu(display("failed to parse expression: {message}"))]
    ParseExpression { message: String },

    #[snafu(display("failed to bind variable {name:?}: {message}"))]
    BindVariable { name: String, message: String },

    #[snafu(display("failed to evaluate expression: {message}"))]
    EvaluateExpression { message: String },

    #[snafu(display("expression must evaluate to a boolean, got {kind}"))]
    NotABoolean { kind: &'static str },

    #[snafu(display("expression must evaluate to a scalar, got {kind}"))]
    NotAScalar { kind: &'static str },
}

/// The variable environment an expression is evaluated against.
///
/// `trigger` is always present; `user` and `requestInfo` are only supplied
/// on the admission path and evaluate to `null` elsewhere.
#[derive(Clone, Debug, Default)]
pub struct Environment {
    pub trigger: serde_json::Value,
    pub user: Option<serde_json::Value>,
    pub request_info: Option<serde_json::Value>,
}

impl Environment {
    pub fn for_trigger(trigger: serde_json::Value) -> Self {
        Self {
            trigger,
            user: None,
            request_info: None,
        }
    }

    fn bind(&self, context: &mut Context) -> Result<(), Error> {
        bind_variable(context, "trigger", &self.trigger)?;
        bind_variable(context, "user", &self.user)?;
        bind_variable(context, "requestInfo", &self.request_info)
    }
}

fn bind_variable<T: serde::Serialize>(
    context: &mut Context,
    name: &str,
    value: &T,
) -> Result<(), Error> {
    context
        .add_variable(name, value)
        .map_err(|err| Error::BindVariable {
            name: name.to_owned(),
            message: err.to_string(),
        })
}

/// Compiles and evaluates CEL expressions over an [`Environment`].
#[derive(Clone, Debug)]
pub struct ExpressionEngine {
    max_length: usize,
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_EXPRESSION_LENGTH,
        }
    }
}

impl ExpressionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn with_max_length(max_length: usize) -> Self {
        Self { max_length }
    }

    /// Checks the length limit and the expression syntax without
    /// evaluating. The boolean requirement can only be enforced at
    /// evaluation time.
    pub fn validate(&self, source: &str) -> Result<(), Error> {
        self.compile(source).map(|_| ())
    }

    /// Evaluates a guard expression to a boolean.
    pub fn evaluate_bool(&self, source: &str, environment: &Environment) -> Result<bool, Error> {
        match self.evaluate(source, environment)? {
            Value::Bool(value) => Ok(value),
            other => NotABooleanSnafu {
                kind: value_kind(&other),
            }
            .fail(),
        }
    }

    /// Evaluates an expression to a scalar rendered as a string, the form
    /// template substitution splices into string fields.
    pub fn evaluate_scalar(&self, source: &str, environment: &Environment) -> Result<String, Error> {
        match self.evaluate(source, environment)? {
            Value::String(value) => Ok(value.as_str().to_owned()),
            Value::Int(value) => Ok(value.to_string()),
            Value::UInt(value) => Ok(value.to_string()),
            Value::Float(value) => Ok(value.to_string()),
            Value::Bool(value) => Ok(value.to_string()),
            other => NotAScalarSnafu {
                kind: value_kind(&other),
            }
            .fail(),
        }
    }

    fn evaluate(&self, source: &str, environment: &Environment) -> Result<Value, Error> {
        let program = self.compile(source)?;
        let mut context = Context::default();
        environment.bind(&mut context)?;
        program
            .execute(&context)
            .map_err(|err| Error::EvaluateExpression {
                message: err.to_string(),
            })
    }

    fn compile(&self, source: &str) -> Result<Program, Error> {
        if source.len() > self.max_length {
            return ExpressionTooLongSnafu {
                length: source.len(),
                limit: self.max_length,
            }
            .fail();
        }

        Program::compile(source).map_err(|err| Error::ParseExpression {
            message: err.to_string(),
        })
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "bool",
        Value::Int(_) | Value::UInt(_) => "integer",
        Value::Float(_) => "float",
        Value::String(_) => "string",
        Value::Null => "null",
        Value::List(_) => "list",
        Value::Map(_) => "map",
        _ => "complex value",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn workload_environment() -> Environment {
        Environment::for_trigger(json!({
            "metadata": {
                "name": "batch-runner",
                "labels": { "tier": "gold" },
            },
            "spec": { "replicas": 3 },
        }))
    }

    #[test]
    fn guard_over_trigger_fields() {
        let engine = ExpressionEngine::new();
        let environment = workload_environment();

        assert!(
            engine
                .evaluate_bool("trigger.metadata.labels.tier == 'gold'", &environment)
                .expect("guard evaluates")
        );
        assert!(
            !engine
                .evaluate_bool("trigger.spec.replicas > 5", &environment)
                .expect("guard evaluates")
        );
    }

    #[test]
    fn unsupplied_user_evaluates_to_null() {
        let engine = ExpressionEngine::new();

        assert!(
            engine
                .evaluate_bool("user == null", &workload_environment())
                .expect("guard evaluates")
        );
    }

    #[test]
    fn non_boolean_guard_is_rejected() {
        let engine = ExpressionEngine::new();

        assert!(matches!(
            engine.evaluate_bool("trigger.metadata.name", &workload_environment()),
            Err(Error::NotABoolean { kind: "string" })
        ));
    }

    #[test]
    fn scalar_rendering_stringifies_numbers() {
        let engine = ExpressionEngine::new();

        assert_eq!(
            engine
                .evaluate_scalar("trigger.spec.replicas", &workload_environment())
                .expect("scalar evaluates"),
            "3"
        );
    }

    #[test]
    fn map_result_is_not_a_scalar() {
        let engine = ExpressionEngine::new();

        assert!(matches!(
            engine.evaluate_scalar("trigger.metadata", &workload_environment()),
            Err(Error::NotAScalar { .. })
        ));
    }

    #[test]
    fn syntax_error_is_reported() {
        let engine = ExpressionEngine::new();

        assert!(matches!(
            engine.validate("trigger.metadata.name =="),
            Err(Error::ParseExpression { .. })
        ));
    }

    #[test]
    fn oversized_expression_is_rejected() {
        let engine = ExpressionEngine::with_max_length(16);

        assert!(matches!(
            engine.validate("trigger.metadata.name == 'much-too-long'"),
            Err(Error::ExpressionTooLong { .. })
        ));
    }
}
