//! Predicate AST for typed queries.
//!
//! Filters are built by the query DSL (`ontic-query`), compiled to SQL by
//! the storage backends, and evaluated in-process by [`crate::eval`]. The
//! three consumers share this one AST so their semantics cannot drift.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// Returns `true` if `segment` matches `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A dot-separated path addressing a (possibly nested) payload field.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parses a path, validating every segment against the grammar.
    pub fn parse(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(EngineError::validation("field path must not be empty"));
        }
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        for segment in &segments {
            if !is_valid_segment(segment) {
                return Err(EngineError::validation(format!(
                    "invalid path segment `{segment}` in `{path}`"
                )));
            }
        }
        Ok(Self { segments })
    }

    /// Single-segment path; the segment must already be valid.
    pub fn root(segment: impl Into<String>) -> Result<Self> {
        let segment = segment.into();
        if !is_valid_segment(&segment) {
            return Err(EngineError::validation(format!(
                "invalid field name `{segment}`"
            )));
        }
        Ok(Self {
            segments: vec![segment],
        })
    }

    /// Returns a new path with `path` appended (dot-separated, validated).
    pub fn join(&self, path: &str) -> Result<Self> {
        let tail = Self::parse(path)?;
        let mut segments = self.segments.clone();
        segments.extend(tail.segments);
        Ok(Self { segments })
    }

    /// Path segments in order.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// First segment; the declared field the path starts at.
    pub fn head(&self) -> &str {
        &self.segments[0]
    }

    /// Whether the path is a bare field reference.
    pub fn is_root(&self) -> bool {
        self.segments.len() == 1
    }

    /// SQLite JSON1 path expression (`$.a.b`).
    pub fn json_path(&self) -> String {
        format!("$.{}", self.segments.join("."))
    }

    /// JSON path relative to a different root, used inside `json_each`.
    pub fn json_path_from(&self, skip: usize) -> String {
        format!("$.{}", self.segments[skip..].join("."))
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

/// A scalar literal usable in comparisons.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    /// JSON value equivalent.
    pub fn to_json(&self) -> Value {
        match self {
            Scalar::Null => Value::Null,
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Int(i) => Value::from(*i),
            Scalar::Float(f) => Value::from(*f),
            Scalar::Str(s) => Value::String(s.clone()),
        }
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Str(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Str(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::Int(v as i64)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

/// Comparison operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
    StartsWith,
    EndsWith,
    Contains,
    IsNull,
    IsNotNull,
    IsTrue,
    IsFalse,
}

impl CompareOp {
    /// SQL operator text for the binary scalar operators.
    pub fn sql(&self) -> Option<&'static str> {
        match self {
            CompareOp::Eq => Some("="),
            CompareOp::Ne => Some("<>"),
            CompareOp::Gt => Some(">"),
            CompareOp::Ge => Some(">="),
            CompareOp::Lt => Some("<"),
            CompareOp::Le => Some("<="),
            _ => None,
        }
    }
}

/// Right-hand side of a comparison.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    /// No operand (null/boolean tests).
    None,
    /// A single scalar.
    Scalar(Scalar),
    /// A list of scalars (`in_`).
    List(Vec<Scalar>),
}

/// `path OP operand` over a scalar field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub path: FieldPath,
    pub op: CompareOp,
    pub operand: Operand,
}

/// Existential comparison over a list field: true iff some element's
/// `item_path` satisfies `op operand`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExistsComparison {
    /// Path of the list field.
    pub list_path: FieldPath,
    /// Path inside each element; empty segments means the element itself.
    pub item_path: Option<FieldPath>,
    pub op: CompareOp,
    pub operand: Operand,
}

/// Boolean combination of comparisons.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Compare(Comparison),
    Exists(ExistsComparison),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
    /// A malformed construction (bad path grammar); carries the error so
    /// it surfaces as a typed validation failure at build time.
    Invalid(String),
}

impl Filter {
    /// Validates operator/operand combinations. Called by the query
    /// builder before a filter is accepted, so malformed predicates fail
    /// at build time rather than at scan time.
    pub fn validate(&self) -> Result<()> {
        match self {
            Filter::Compare(c) => validate_comparison(c.op, &c.operand, &c.path),
            Filter::Exists(e) => validate_comparison(e.op, &e.operand, &e.list_path),
            Filter::And(a, b) | Filter::Or(a, b) => {
                a.validate()?;
                b.validate()
            }
            Filter::Not(inner) => inner.validate(),
            Filter::Invalid(message) => Err(EngineError::validation(message.clone())),
        }
    }

    /// All comparison paths mentioned by the filter, existential list
    /// paths included. Used for typed-column classification.
    pub fn paths(&self) -> Vec<&FieldPath> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a FieldPath>) {
        match self {
            Filter::Compare(c) => out.push(&c.path),
            Filter::Exists(e) => out.push(&e.list_path),
            Filter::And(a, b) | Filter::Or(a, b) => {
                a.collect_paths(out);
                b.collect_paths(out);
            }
            Filter::Not(inner) => inner.collect_paths(out),
            Filter::Invalid(_) => {}
        }
    }
}

fn validate_comparison(op: CompareOp, operand: &Operand, path: &FieldPath) -> Result<()> {
    match op {
        CompareOp::Eq | CompareOp::Ne => match operand {
            Operand::Scalar(Scalar::Null) => Err(EngineError::validation(format!(
                "`{path}`: equality with null is not allowed; use is_null()/is_not_null()"
            ))),
            Operand::Scalar(Scalar::Bool(_)) => Err(EngineError::validation(format!(
                "`{path}`: equality with booleans is not allowed; use is_true()/is_false()"
            ))),
            Operand::Scalar(_) => Ok(()),
            _ => Err(EngineError::validation(format!(
                "`{path}`: {op:?} requires a scalar operand"
            ))),
        },
        CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le => match operand {
            Operand::Scalar(Scalar::Null) | Operand::Scalar(Scalar::Bool(_)) => {
                Err(EngineError::validation(format!(
                    "`{path}`: ordered comparison requires a number or string"
                )))
            }
            Operand::Scalar(_) => Ok(()),
            _ => Err(EngineError::validation(format!(
                "`{path}`: {op:?} requires a scalar operand"
            ))),
        },
        CompareOp::In => match operand {
            Operand::List(items) => {
                if items.iter().any(|s| matches!(s, Scalar::Null)) {
                    Err(EngineError::validation(format!(
                        "`{path}`: in_() does not accept null members"
                    )))
                } else {
                    Ok(())
                }
            }
            _ => Err(EngineError::validation(format!(
                "`{path}`: in_() requires a list operand"
            ))),
        },
        CompareOp::StartsWith | CompareOp::EndsWith | CompareOp::Contains => match operand {
            Operand::Scalar(Scalar::Str(_)) => Ok(()),
            _ => Err(EngineError::validation(format!(
                "`{path}`: string predicates require a string operand"
            ))),
        },
        CompareOp::IsNull | CompareOp::IsNotNull | CompareOp::IsTrue | CompareOp::IsFalse => {
            match operand {
                Operand::None => Ok(()),
                _ => Err(EngineError::validation(format!(
                    "`{path}`: {op:?} takes no operand"
                ))),
            }
        }
    }
}

impl std::ops::BitAnd for Filter {
    type Output = Filter;
    fn bitand(self, rhs: Filter) -> Filter {
        Filter::And(Box::new(self), Box::new(rhs))
    }
}

impl std::ops::BitOr for Filter {
    type Output = Filter;
    fn bitor(self, rhs: Filter) -> Filter {
        Filter::Or(Box::new(self), Box::new(rhs))
    }
}

impl std::ops::Not for Filter {
    type Output = Filter;
    fn not(self) -> Filter {
        Filter::Not(Box::new(self))
    }
}
