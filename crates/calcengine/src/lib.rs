#![forbid(unsafe_code)]

//! Evaluate formula expressions against in-memory rows.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use calcengine::prelude::*;
//!
//! # async fn run() {
//! let rows = vec![
//!     Row::new(1).with_field("g", "a").with_field("value", 1.0),
//!     Row::new(2).with_field("g", "b").with_field("value", 5.0),
//! ];
//! let calculator = Calculator::new(Arc::new(CalculationContext::new(rows)));
//!
//! let total = parse_expression("sum(1, 2, 3) * 2").expect("formula parses");
//! assert_eq!(calculator.evaluate(&total).await.value(), Some(&CalcValue::Number(12.0)));
//!
//! let by_group = Expression::group(["g"], "sum");
//! let result = calculator.evaluate(&by_group).await;
//! assert!(result.is_success());
//! # }
//! ```

pub use ce_expr::{
    Argument, BinaryOp, CalcError, CalcResult, CalcValue, CalculationContext, CalculationResult,
    Calculator, ExprId, ExprNode, Expression, ExpressionParser, FormulaParser, FunctionImpl,
    FunctionRegistry, LiteralValue, MAX_NESTING, PLANNED_FUNCTIONS, ResultCache, UnaryOp,
    is_identifier, parse_expression,
};
pub use ce_groupby::{
    Aggregation, GroupByError, GroupTable, RankOptions, RankTable, group_key, group_rows,
    rank_rows,
};
pub use ce_runtime::{
    EvaluationLedger, EvaluationOutcome, EvaluationRecord, RuntimeError, RuntimeMode,
    RuntimePolicy,
};
pub use ce_types::{DType, Row, RowId, TypeError, Value};

pub mod prelude {
    pub use crate::{
        Argument, BinaryOp, CalcValue, CalculationContext, CalculationResult, Calculator,
        Expression, FunctionRegistry, Row, RuntimePolicy, UnaryOp, Value, parse_expression,
    };
}
