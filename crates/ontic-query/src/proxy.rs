//! Field proxies: immutable references to payload paths.
//!
//! A proxy is built from a field name and extended with `.path(..)`;
//! comparison methods produce [`Filter`] nodes. Path-grammar violations
//! are carried inside the proxy and surface as typed validation errors
//! when the filter reaches a builder, so the fluent surface never
//! panics.

use ontic_core::filter::{
    CompareOp, Comparison, ExistsComparison, FieldPath, Filter, Operand, Scalar,
};

/// Starts a proxy at a root field.
pub fn field(name: &str) -> FieldProxy {
    FieldProxy {
        path: FieldPath::root(name).map_err(|e| e.to_string()),
    }
}

/// An immutable reference to a (possibly nested) payload path.
#[derive(Clone, Debug)]
pub struct FieldProxy {
    /// The parsed path, or the deferred grammar error.
    pub(crate) path: Result<FieldPath, String>,
}

impl FieldProxy {
    /// Extends the path with dot-separated segments.
    pub fn path(&self, tail: &str) -> FieldProxy {
        FieldProxy {
            path: self
                .path
                .clone()
                .and_then(|p| p.join(tail).map_err(|e| e.to_string())),
        }
    }

    /// Index-style extension: `field("a").at("b")` equals `a.b`.
    pub fn at(&self, segment: &str) -> FieldProxy {
        self.path(segment)
    }

    fn compare(&self, op: CompareOp, operand: Operand) -> Filter {
        match &self.path {
            Ok(path) => Filter::Compare(Comparison {
                path: path.clone(),
                op,
                operand,
            }),
            Err(message) => invalid(message),
        }
    }

    // -- Scalar comparisons --------------------------------------------------

    pub fn eq(&self, value: impl Into<Scalar>) -> Filter {
        self.compare(CompareOp::Eq, Operand::Scalar(value.into()))
    }

    pub fn ne(&self, value: impl Into<Scalar>) -> Filter {
        self.compare(CompareOp::Ne, Operand::Scalar(value.into()))
    }

    pub fn gt(&self, value: impl Into<Scalar>) -> Filter {
        self.compare(CompareOp::Gt, Operand::Scalar(value.into()))
    }

    pub fn ge(&self, value: impl Into<Scalar>) -> Filter {
        self.compare(CompareOp::Ge, Operand::Scalar(value.into()))
    }

    pub fn lt(&self, value: impl Into<Scalar>) -> Filter {
        self.compare(CompareOp::Lt, Operand::Scalar(value.into()))
    }

    pub fn le(&self, value: impl Into<Scalar>) -> Filter {
        self.compare(CompareOp::Le, Operand::Scalar(value.into()))
    }

    /// Membership test; an empty list yields an always-empty result.
    pub fn in_<S: Into<Scalar>>(&self, values: impl IntoIterator<Item = S>) -> Filter {
        self.compare(
            CompareOp::In,
            Operand::List(values.into_iter().map(Into::into).collect()),
        )
    }

    // -- String predicates ---------------------------------------------------

    pub fn startswith(&self, needle: &str) -> Filter {
        self.compare(CompareOp::StartsWith, Operand::Scalar(needle.into()))
    }

    pub fn endswith(&self, needle: &str) -> Filter {
        self.compare(CompareOp::EndsWith, Operand::Scalar(needle.into()))
    }

    pub fn contains(&self, needle: &str) -> Filter {
        self.compare(CompareOp::Contains, Operand::Scalar(needle.into()))
    }

    // -- Null / boolean tests ------------------------------------------------

    pub fn is_null(&self) -> Filter {
        self.compare(CompareOp::IsNull, Operand::None)
    }

    pub fn is_not_null(&self) -> Filter {
        self.compare(CompareOp::IsNotNull, Operand::None)
    }

    pub fn is_true(&self) -> Filter {
        self.compare(CompareOp::IsTrue, Operand::None)
    }

    pub fn is_false(&self) -> Filter {
        self.compare(CompareOp::IsFalse, Operand::None)
    }

    // -- Existential predicates ----------------------------------------------

    /// Existential proxy over the elements of this list field.
    pub fn any(&self) -> ListElemProxy {
        ListElemProxy {
            list_path: self.path.clone(),
            item_path: None,
        }
    }

    /// Existential proxy over `inner_path` inside each list element.
    pub fn any_path(&self, inner_path: &str) -> ListElemProxy {
        let item_path = FieldPath::parse(inner_path).map_err(|e| e.to_string());
        ListElemProxy {
            list_path: self.path.clone(),
            item_path: Some(item_path),
        }
    }
}

/// Existential comparison builder over list elements.
#[derive(Clone, Debug)]
pub struct ListElemProxy {
    list_path: Result<FieldPath, String>,
    item_path: Option<Result<FieldPath, String>>,
}

impl ListElemProxy {
    fn compare(&self, op: CompareOp, operand: Operand) -> Filter {
        let list_path = match &self.list_path {
            Ok(p) => p.clone(),
            Err(message) => return invalid(message),
        };
        let item_path = match &self.item_path {
            None => None,
            Some(Ok(p)) => Some(p.clone()),
            Some(Err(message)) => return invalid(message),
        };
        Filter::Exists(ExistsComparison {
            list_path,
            item_path,
            op,
            operand,
        })
    }

    pub fn eq(&self, value: impl Into<Scalar>) -> Filter {
        self.compare(CompareOp::Eq, Operand::Scalar(value.into()))
    }

    pub fn ne(&self, value: impl Into<Scalar>) -> Filter {
        self.compare(CompareOp::Ne, Operand::Scalar(value.into()))
    }

    pub fn gt(&self, value: impl Into<Scalar>) -> Filter {
        self.compare(CompareOp::Gt, Operand::Scalar(value.into()))
    }

    pub fn ge(&self, value: impl Into<Scalar>) -> Filter {
        self.compare(CompareOp::Ge, Operand::Scalar(value.into()))
    }

    pub fn lt(&self, value: impl Into<Scalar>) -> Filter {
        self.compare(CompareOp::Lt, Operand::Scalar(value.into()))
    }

    pub fn le(&self, value: impl Into<Scalar>) -> Filter {
        self.compare(CompareOp::Le, Operand::Scalar(value.into()))
    }

    pub fn in_<S: Into<Scalar>>(&self, values: impl IntoIterator<Item = S>) -> Filter {
        self.compare(
            CompareOp::In,
            Operand::List(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn contains(&self, needle: &str) -> Filter {
        self.compare(CompareOp::Contains, Operand::Scalar(needle.into()))
    }
}

/// An invalid proxy collapses to [`Filter::Invalid`], carrying the
/// original grammar error to the build-time validation.
fn invalid(message: &str) -> Filter {
    Filter::Invalid(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparison_builds_a_filter() {
        let f = field("name").eq("Alice");
        assert!(f.validate().is_ok());
        match f {
            Filter::Compare(c) => {
                assert_eq!(c.path.to_string(), "name");
                assert_eq!(c.op, CompareOp::Eq);
            }
            _ => panic!("expected comparison"),
        }
    }

    #[test]
    fn nested_paths_extend() {
        let f = field("address").path("city.name").eq("Berlin");
        match f {
            Filter::Compare(c) => assert_eq!(c.path.to_string(), "address.city.name"),
            _ => panic!("expected comparison"),
        }
    }

    #[test]
    fn bad_path_surfaces_at_validation() {
        let f = field("0bad").eq("x");
        assert!(f.validate().is_err());
        let f = field("a").path("b..c").eq(1);
        assert!(f.validate().is_err());
    }

    #[test]
    fn any_path_builds_existential() {
        let f = field("orders").any_path("total").gt(100);
        assert!(f.validate().is_ok());
        assert!(matches!(f, Filter::Exists(_)));
    }

    #[test]
    fn operators_compose() {
        let f = (field("age").ge(18) & field("name").startswith("A")) | !field("active").is_true();
        assert!(f.validate().is_ok());
    }
}
