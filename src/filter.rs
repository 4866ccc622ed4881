//! Predicate filter engine: operand/operator trees over one table's columns
//!
//! A filter is a tree of boolean combinators (`NOT`, `AND`, `OR`) over leaf
//! comparisons (`EQUAL`, `LESS`, `LESS_EQUAL`, `GREATER`, `GREATER_EQUAL`).
//! Shape and comparability are validated eagerly against the table schema;
//! evaluation afterwards cannot hit an incomparable pair, and a row value
//! that is missing or null simply fails the comparison instead of erroring.

use crate::error::{Result, StoreError};
use crate::table::Row;
use crate::types::{self, ColumnType, TableSchema, Value};
use std::cmp::Ordering;

/// Filter operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Not,
    And,
    Or,
    Equal,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl FilterOp {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "NOT" => Ok(FilterOp::Not),
            "AND" => Ok(FilterOp::And),
            "OR" => Ok(FilterOp::Or),
            "EQUAL" => Ok(FilterOp::Equal),
            "LESS" => Ok(FilterOp::Less),
            "LESS_EQUAL" => Ok(FilterOp::LessEqual),
            "GREATER" => Ok(FilterOp::Greater),
            "GREATER_EQUAL" => Ok(FilterOp::GreaterEqual),
            other => Err(StoreError::validation(
                "filter",
                format!("unknown filter operator '{}'", other),
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FilterOp::Not => "NOT",
            FilterOp::And => "AND",
            FilterOp::Or => "OR",
            FilterOp::Equal => "EQUAL",
            FilterOp::Less => "LESS",
            FilterOp::LessEqual => "LESS_EQUAL",
            FilterOp::Greater => "GREATER",
            FilterOp::GreaterEqual => "GREATER_EQUAL",
        }
    }

    fn is_combinator(&self) -> bool {
        matches!(self, FilterOp::Not | FilterOp::And | FilterOp::Or)
    }
}

/// Filter operand, decoded once at the request boundary.
#[derive(Debug, Clone)]
pub enum Operand {
    /// Reference to a column of the queried table.
    Column(String),
    /// Typed constant.
    Constant(ColumnType, Value),
    /// Explicit null; with `EQUAL` this is the is-null test.
    Null,
    /// Nested filter, only valid under a combinator.
    Filter(Box<FilterNode>),
}

/// One node of the filter tree.
#[derive(Debug, Clone)]
pub struct FilterNode {
    pub op: FilterOp,
    pub operands: Vec<Operand>,
}

impl FilterNode {
    pub fn new(op: FilterOp, operands: Vec<Operand>) -> Self {
        Self { op, operands }
    }

    /// Validate shape, arity, column references and operand comparability.
    pub fn validate(&self, schema: &TableSchema) -> Result<()> {
        match self.op {
            FilterOp::Not => {
                if self.operands.len() != 1 {
                    return Err(StoreError::validation(
                        "filter",
                        format!("NOT takes exactly 1 operand, got {}", self.operands.len()),
                    ));
                }
                self.require_nested(schema)
            }
            FilterOp::And | FilterOp::Or => {
                if self.operands.len() < 2 {
                    return Err(StoreError::validation(
                        "filter",
                        format!(
                            "{} takes at least 2 operands, got {}",
                            self.op.name(),
                            self.operands.len()
                        ),
                    ));
                }
                self.require_nested(schema)
            }
            FilterOp::Equal => self.validate_comparison(schema, true),
            FilterOp::Less | FilterOp::LessEqual | FilterOp::Greater | FilterOp::GreaterEqual => {
                self.validate_comparison(schema, false)
            }
        }
    }

    fn require_nested(&self, schema: &TableSchema) -> Result<()> {
        for operand in &self.operands {
            match operand {
                Operand::Filter(nested) => nested.validate(schema)?,
                _ => {
                    return Err(StoreError::validation(
                        "filter",
                        format!("{} operands must be nested filters", self.op.name()),
                    ));
                }
            }
        }
        Ok(())
    }

    fn validate_comparison(&self, schema: &TableSchema, allow_null: bool) -> Result<()> {
        if self.operands.len() != 2 {
            return Err(StoreError::validation(
                "filter",
                format!(
                    "{} takes exactly 2 operands, got {}",
                    self.op.name(),
                    self.operands.len()
                ),
            ));
        }
        let mut column_types = Vec::new();
        let mut has_column = false;
        for operand in &self.operands {
            match operand {
                Operand::Filter(_) => {
                    return Err(StoreError::validation(
                        "filter",
                        format!("{} cannot take a nested filter operand", self.op.name()),
                    ));
                }
                Operand::Null if !allow_null => {
                    return Err(StoreError::validation(
                        "filter",
                        format!("{} cannot take a null operand", self.op.name()),
                    ));
                }
                Operand::Null => {}
                Operand::Column(name) => {
                    let column_type = schema.column_type(name).ok_or_else(|| {
                        StoreError::validation(name, "unknown column in filter".to_string())
                    })?;
                    has_column = true;
                    column_types.push((name.as_str(), column_type));
                }
                Operand::Constant(column_type, _) => {
                    if *column_type == ColumnType::Unknown {
                        return Err(StoreError::validation(
                            "filter",
                            "constant operand has unknown type",
                        ));
                    }
                    column_types.push(("constant", *column_type));
                }
            }
        }
        if !has_column {
            return Err(StoreError::validation(
                "filter",
                format!("{} requires at least one column operand", self.op.name()),
            ));
        }
        if let [(na, ta), (nb, tb)] = column_types.as_slice() {
            if !ColumnType::is_comparable(*ta, *tb) {
                return Err(StoreError::validation(
                    "filter",
                    format!(
                        "{} ({}) and {} ({}) are not comparable",
                        na,
                        ta.name(),
                        nb,
                        tb.name()
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Whether the row matches this (already validated) filter.
    pub fn matches(&self, row: &Row) -> Result<bool> {
        match self.op {
            FilterOp::Not => match self.operands.first() {
                Some(Operand::Filter(nested)) => Ok(!nested.matches(row)?),
                _ => Err(StoreError::validation(
                    "filter",
                    "NOT operand must be a nested filter",
                )),
            },
            FilterOp::And => {
                for operand in &self.operands {
                    if let Operand::Filter(nested) = operand {
                        if !nested.matches(row)? {
                            return Ok(false);
                        }
                    }
                }
                Ok(true)
            }
            FilterOp::Or => {
                for operand in &self.operands {
                    if let Operand::Filter(nested) = operand {
                        if nested.matches(row)? {
                            return Ok(true);
                        }
                    }
                }
                Ok(false)
            }
            FilterOp::Equal => self.eval_equal(row),
            FilterOp::Less => self.eval_ordered(row, |o| o == Ordering::Less),
            FilterOp::LessEqual => self.eval_ordered(row, |o| o != Ordering::Greater),
            FilterOp::Greater => self.eval_ordered(row, |o| o == Ordering::Greater),
            FilterOp::GreaterEqual => self.eval_ordered(row, |o| o != Ordering::Less),
        }
    }

    fn binary_operands(&self) -> Result<(&Operand, &Operand)> {
        match self.operands.as_slice() {
            [a, b] => Ok((a, b)),
            _ => Err(StoreError::validation(
                "filter",
                format!("{} takes exactly 2 operands", self.op.name()),
            )),
        }
    }

    fn eval_equal(&self, row: &Row) -> Result<bool> {
        let (left, right) = self.binary_operands()?;
        let a = resolve(left, row);
        let b = resolve(right, row);
        // A null operand turns EQUAL into the is-null test, which matches
        // explicit null and never-written alike.
        if matches!(left, Operand::Null) {
            return Ok(!matches!(b, Resolved::Value(_)));
        }
        if matches!(right, Operand::Null) {
            return Ok(!matches!(a, Resolved::Value(_)));
        }
        match (a, b) {
            (Resolved::Value(va), Resolved::Value(vb)) => {
                Ok(types::compare(va, vb)? == Ordering::Equal)
            }
            _ => Ok(false),
        }
    }

    fn eval_ordered(&self, row: &Row, accept: impl Fn(Ordering) -> bool) -> Result<bool> {
        let (left, right) = self.binary_operands()?;
        match (resolve(left, row), resolve(right, row)) {
            (Resolved::Value(va), Resolved::Value(vb)) => {
                Ok(accept(types::compare(va, vb)?))
            }
            _ => Ok(false),
        }
    }
}

enum Resolved<'a> {
    /// Column never written for this row.
    Missing,
    /// Explicit null (stored, or the null operand itself).
    Null,
    Value(&'a Value),
}

fn resolve<'a>(operand: &'a Operand, row: &'a Row) -> Resolved<'a> {
    match operand {
        Operand::Column(name) => match row.get(name) {
            None => Resolved::Missing,
            Some(Value::Null) => Resolved::Null,
            Some(value) => Resolved::Value(value),
        },
        Operand::Constant(_, value) => Resolved::Value(value),
        Operand::Null => Resolved::Null,
        Operand::Filter(_) => Resolved::Missing,
    }
}
