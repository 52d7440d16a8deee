//! Guard expression evaluation and record template rendering.
//!
//! Policies carry CEL guard expressions and record templates whose string
//! fields embed CEL expressions between schema-defined delimiters. The
//! expression engine evaluates guards to booleans; the template engine
//! substitutes expression values into string fields and copies everything
//! else verbatim, so amounts can never be expression-driven.

pub mod expression;
pub mod template;

pub use expression::{Environment, ExpressionEngine};
pub use template::{CLAIM_DELIMITERS, Delimiters, GRANT_DELIMITERS, TemplateEngine};
