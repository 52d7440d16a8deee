use snafu::Snafu;

use super::expression::{self, Environment, ExpressionEngine};

/// Delimiter family marking embedded expressions in template strings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Delimiters {
    pub open: &'static str,
    pub close: &'static str,
}

/// Delimiters of admission-created claim templates.
pub const CLAIM_DELIMITERS: Delimiters = Delimiters {
    open: "{{",
    close: "}}",
};

/// Delimiters of policy-created grant templates.
pub const GRANT_DELIMITERS: Delimiters = Delimiters {
    open: "${",
    close: "}",
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("unterminated expression starting at byte {offset} of {input:?}"))]
    UnterminatedExpression { input: String, offset: usize },

    #[snafu(display("invalid expression {source_text:?} in template"))]
    InvalidExpression {
        source: expression::Error,
        source_text: String,
    },
}

/// Renders record templates by substituting expression values into string
/// fields.
///
/// Only strings are inspected; numbers, booleans, arrays and objects are
/// copied verbatim (arrays and objects recursively). Integer amounts
/// therefore cannot be produced by an expression.
#[derive(Clone, Debug)]
pub struct TemplateEngine {
    delimiters: Delimiters,
    expressions: ExpressionEngine,
}

impl TemplateEngine {
    pub fn new(delimiters: Delimiters) -> Self {
        Self {
            delimiters,
            expressions: ExpressionEngine::new(),
        }
    }

    /// Renders one string field, splicing each embedded expression value.
    pub fn render_string(&self, input: &str, environment: &Environment) -> Result<String, Error> {
        let mut output = String::with_capacity(input.len());
        for segment in self.segments(input)? {
            match segment {
                Segment::Literal(text) => output.push_str(text),
                Segment::Expression(source) => {
                    let value = self
                        .expressions
                        .evaluate_scalar(source, environment)
                        .map_err(|err| Error::InvalidExpression {
                            source: err,
                            source_text: source.to_owned(),
                        })?;
                    output.push_str(&value);
                }
            }
        }
        Ok(output)
    }

    /// Renders a record value tree: strings through [`Self::render_string`],
    /// arrays and objects recursively, everything else verbatim.
    pub fn render_value(
        &self,
        value: &serde_json::Value,
        environment: &Environment,
    ) -> Result<serde_json::Value, Error> {
        match value {
            serde_json::Value::String(input) => self
                .render_string(input, environment)
                .map(serde_json::Value::String),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| self.render_value(item, environment))
                .collect::<Result<_, _>>()
                .map(serde_json::Value::Array),
            serde_json::Value::Object(fields) => fields
                .iter()
                .map(|(key, item)| Ok((key.clone(), self.render_value(item, environment)?)))
                .collect::<Result<_, _>>()
                .map(serde_json::Value::Object),
            other => Ok(other.clone()),
        }
    }

    /// Compiles every embedded expression of one string without rendering.
    pub fn validate_string(&self, input: &str) -> Result<(), Error> {
        for segment in self.segments(input)? {
            if let Segment::Expression(source) = segment {
                self.expressions
                    .validate(source)
                    .map_err(|err| Error::InvalidExpression {
                        source: err,
                        source_text: source.to_owned(),
                    })?;
            }
        }
        Ok(())
    }

    /// Compiles every embedded expression of a record value tree.
    pub fn validate_value(&self, value: &serde_json::Value) -> Result<(), Error> {
        match value {
            serde_json::Value::String(input) => self.validate_string(input),
            serde_json::Value::Array(items) => {
                items.iter().try_for_each(|item| self.validate_value(item))
            }
            serde_json::Value::Object(fields) => {
                fields.values().try_for_each(|item| self.validate_value(item))
            }
            _ => Ok(()),
        }
    }

    fn segments<'a>(&self, input: &'a str) -> Result<Vec<Segment<'a>>, Error> {
        let Delimiters { open, close } = self.delimiters;
        let mut segments = Vec::new();
        let mut rest = input;
        let mut offset = 0;

        while let Some(start) = rest.find(open) {
            if start > 0 {
                segments.push(Segment::Literal(&rest[..start]));
            }
            let after_open = &rest[start + open.len()..];
            let end = after_open
                .find(close)
                .ok_or_else(|| Error::UnterminatedExpression {
                    input: input.to_owned(),
                    offset: offset + start,
                })?;
            segments.push(Segment::Expression(after_open[..end].trim()));
            offset += start + open.len() + end + close.len();
            rest = &after_open[end + close.len()..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest));
        }
        Ok(segments)
    }
}

#[derive(Debug, Eq, PartialEq)]
enum Segment<'a> {
    Literal(&'a str),
    Expression(&'a str),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn environment() -> Environment {
        Environment::for_trigger(json!({
            "metadata": { "name": "phoenix", "namespace": "default" },
            "spec": { "tier": "gold" },
        }))
    }

    #[test]
    fn renders_embedded_expression() {
        let engine = TemplateEngine::new(GRANT_DELIMITERS);

        let rendered = engine
            .render_string("grant-${ trigger.metadata.name }", &environment())
            .expect("rendered");

        assert_eq!(rendered, "grant-phoenix");
    }

    #[test]
    fn renders_multiple_expressions_in_one_string() {
        let engine = TemplateEngine::new(CLAIM_DELIMITERS);

        let rendered = engine
            .render_string(
                "{{ trigger.metadata.namespace }}/{{ trigger.metadata.name }}",
                &environment(),
            )
            .expect("rendered");

        assert_eq!(rendered, "default/phoenix");
    }

    #[test]
    fn literal_strings_pass_through() {
        let engine = TemplateEngine::new(GRANT_DELIMITERS);

        assert_eq!(
            engine.render_string("no expressions here", &environment()).expect("rendered"),
            "no expressions here"
        );
    }

    #[test]
    fn unterminated_expression_is_an_error() {
        let engine = TemplateEngine::new(GRANT_DELIMITERS);

        assert!(matches!(
            engine.render_string("grant-${ trigger.metadata.name", &environment()),
            Err(Error::UnterminatedExpression { .. })
        ));
    }

    #[test]
    fn value_tree_rendering_keeps_non_strings_verbatim() {
        let engine = TemplateEngine::new(GRANT_DELIMITERS);
        let template = json!({
            "consumerRef": {
                "kind": "Organization",
                "name": "${ trigger.metadata.name }",
            },
            "allowances": [{
                "resourceType": "resourcemanager.miloapis.com/projects",
                "buckets": [{ "amount": 10 }],
            }],
        });

        let rendered = engine.render_value(&template, &environment()).expect("rendered");

        assert_eq!(rendered["consumerRef"]["name"], "phoenix");
        assert_eq!(rendered["allowances"][0]["buckets"][0]["amount"], 10);
    }

    #[test]
    fn validation_reports_bad_expressions_without_an_environment() {
        let engine = TemplateEngine::new(CLAIM_DELIMITERS);

        assert!(engine.validate_string("{{ trigger.metadata.name }}").is_ok());
        assert!(matches!(
            engine.validate_string("{{ trigger. }}"),
            Err(Error::InvalidExpression { .. })
        ));
    }

    #[test]
    fn claim_delimiters_ignore_grant_delimiters() {
        let engine = TemplateEngine::new(CLAIM_DELIMITERS);

        assert_eq!(
            engine
                .render_string("${ not.an.expression }", &environment())
                .expect("rendered"),
            "${ not.an.expression }"
        );
    }
}
