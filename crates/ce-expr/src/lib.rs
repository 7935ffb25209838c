#![forbid(unsafe_code)]

mod functions;
mod parser;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, RwLock};

use ce_groupby::{
    Aggregation, GroupByError, GroupTable, RankOptions, RankTable, group_rows, rank_rows,
};
use ce_runtime::{EvaluationLedger, EvaluationOutcome, EvaluationRecord, RuntimePolicy};
use ce_types::{Row, TypeError, Value, coerce_text};
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use functions::{FunctionImpl, FunctionRegistry, PLANNED_FUNCTIONS};
pub use parser::{ExpressionParser, FormulaParser, MAX_NESTING, parse_expression};

// ── Expression Model ───────────────────────────────────────────────────

static NEXT_EXPR_ID: AtomicU64 = AtomicU64::new(1);

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is a valid regex")
});

/// Whether `text` reads as a variable name rather than a literal.
#[must_use]
pub fn is_identifier(text: &str) -> bool {
    IDENTIFIER.is_match(text)
}

/// Identity of an expression node; the result cache is keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExprId(pub String);

impl ExprId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A process-unique id of the form `expr-<n>`.
    #[must_use]
    pub fn fresh() -> Self {
        Self(format!(
            "expr-{}",
            NEXT_EXPR_ID.fetch_add(1, Ordering::Relaxed)
        ))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum UnaryOp {
    Plus,
    Minus,
}

impl UnaryOp {
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Plus => "+",
            Self::Minus => "-",
        }
    }

    #[must_use]
    pub fn apply(self, operand: f64) -> f64 {
        match self {
            Self::Plus => operand,
            Self::Minus => -operand,
        }
    }
}

impl FromStr for UnaryOp {
    type Err = CalcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "+" => Ok(Self::Plus),
            "-" => Ok(Self::Minus),
            other => Err(CalcError::UnknownUnaryOperator(other.to_owned())),
        }
    }
}

impl TryFrom<String> for UnaryOp {
    type Error = CalcError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UnaryOp> for &'static str {
    fn from(op: UnaryOp) -> Self {
        op.symbol()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Pow => "^",
        }
    }

    /// Division fails only when the divisor is exactly zero.
    pub fn apply(self, left: f64, right: f64) -> CalcResult<f64> {
        match self {
            Self::Add => Ok(left + right),
            Self::Sub => Ok(left - right),
            Self::Mul => Ok(left * right),
            Self::Div if right == 0.0 => Err(CalcError::DivisionByZero),
            Self::Div => Ok(left / right),
            Self::Pow => Ok(left.powf(right)),
        }
    }
}

impl FromStr for BinaryOp {
    type Err = CalcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "+" => Ok(Self::Add),
            "-" => Ok(Self::Sub),
            "*" => Ok(Self::Mul),
            "/" => Ok(Self::Div),
            "^" => Ok(Self::Pow),
            other => Err(CalcError::UnknownOperator(other.to_owned())),
        }
    }
}

impl TryFrom<String> for BinaryOp {
    type Error = CalcError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BinaryOp> for &'static str {
    fn from(op: BinaryOp) -> Self {
        op.symbol()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LiteralValue {
    Number(f64),
    Text(String),
}

/// A function argument: an already-parsed tree, or raw source text that is
/// parsed each time the enclosing function is evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Argument {
    Source { expression: String },
    Parsed(Expression),
}

impl Argument {
    #[must_use]
    pub fn source(expression: impl Into<String>) -> Self {
        Self::Source {
            expression: expression.into(),
        }
    }
}

impl From<Expression> for Argument {
    fn from(expression: Expression) -> Self {
        Self::Parsed(expression)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ExprNode {
    Literal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<LiteralValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Unary {
        operator: UnaryOp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operand: Option<Box<Expression>>,
    },
    Basic {
        operator: BinaryOp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        left: Option<Box<Expression>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        right: Option<Box<Expression>>,
    },
    Ternary {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<Box<Expression>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        true_branch: Option<Box<Expression>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        false_branch: Option<Box<Expression>>,
    },
    Function {
        function_name: String,
        #[serde(default)]
        arguments: Vec<Argument>,
    },
    Group {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_by: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aggregation: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value_field: Option<String>,
    },
    Rank {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rank_by: Option<Vec<String>>,
        #[serde(default)]
        is_normalized: bool,
        #[serde(default)]
        is_cumulative: bool,
    },
    Advanced {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation: Option<String>,
    },
    #[serde(other)]
    Unrecognized,
}

impl ExprNode {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Literal { .. } => "literal",
            Self::Unary { .. } => "unary",
            Self::Basic { .. } => "basic",
            Self::Ternary { .. } => "ternary",
            Self::Function { .. } => "function",
            Self::Group { .. } => "group",
            Self::Rank { .. } => "rank",
            Self::Advanced { .. } => "advanced",
            Self::Unrecognized => "unrecognized",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expression {
    pub id: ExprId,
    #[serde(flatten)]
    pub node: ExprNode,
}

impl Expression {
    #[must_use]
    pub fn new(node: ExprNode) -> Self {
        Self {
            id: ExprId::fresh(),
            node,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = ExprId::new(id);
        self
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.node.kind()
    }

    #[must_use]
    pub fn number(value: f64) -> Self {
        Self::new(ExprNode::Literal {
            value: Some(LiteralValue::Number(value)),
            name: None,
        })
    }

    /// A text literal. Text that reads as an identifier is resolved as a
    /// variable when evaluated.
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::new(ExprNode::Literal {
            value: Some(LiteralValue::Text(value.into())),
            name: None,
        })
    }

    #[must_use]
    pub fn variable(name: impl Into<String>) -> Self {
        Self::new(ExprNode::Literal {
            value: None,
            name: Some(name.into()),
        })
    }

    #[must_use]
    pub fn unary(operator: UnaryOp, operand: Expression) -> Self {
        Self::new(ExprNode::Unary {
            operator,
            operand: Some(Box::new(operand)),
        })
    }

    #[must_use]
    pub fn basic(operator: BinaryOp, left: Expression, right: Expression) -> Self {
        Self::new(ExprNode::Basic {
            operator,
            left: Some(Box::new(left)),
            right: Some(Box::new(right)),
        })
    }

    #[must_use]
    pub fn ternary(condition: Expression, when_true: Expression, when_false: Expression) -> Self {
        Self::new(ExprNode::Ternary {
            condition: Some(Box::new(condition)),
            true_branch: Some(Box::new(when_true)),
            false_branch: Some(Box::new(when_false)),
        })
    }

    #[must_use]
    pub fn function(name: impl Into<String>, arguments: Vec<Argument>) -> Self {
        Self::new(ExprNode::Function {
            function_name: name.into(),
            arguments,
        })
    }

    #[must_use]
    pub fn group<I, S>(group_by: I, aggregation: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ExprNode::Group {
            group_by: Some(group_by.into_iter().map(Into::into).collect()),
            aggregation: Some(aggregation.into()),
            value_field: None,
        })
    }

    #[must_use]
    pub fn rank<I, S>(rank_by: I, normalized: bool, cumulative: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ExprNode::Rank {
            rank_by: Some(rank_by.into_iter().map(Into::into).collect()),
            is_normalized: normalized,
            is_cumulative: cumulative,
        })
    }

    #[must_use]
    pub fn advanced(operation: Option<String>) -> Self {
        Self::new(ExprNode::Advanced { operation })
    }
}

// ── Results ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CalcValue {
    Number(f64),
    Groups(GroupTable),
    Ranks(RankTable),
}

impl CalcValue {
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Number(_) => "number",
            Self::Groups(_) => "groups",
            Self::Ranks(_) => "ranks",
        }
    }

    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_groups(&self) -> Option<&GroupTable> {
        match self {
            Self::Groups(table) => Some(table),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_ranks(&self) -> Option<&RankTable> {
        match self {
            Self::Ranks(table) => Some(table),
            _ => None,
        }
    }

    /// Append the numbers this value contributes to a function call: groups
    /// in table order, ranks in row-id order.
    fn flatten_into(&self, out: &mut Vec<f64>) {
        match self {
            Self::Number(value) => out.push(*value),
            Self::Groups(table) => out.extend(table.values()),
            Self::Ranks(table) => out.extend(table.values().copied()),
        }
    }
}

impl From<f64> for CalcValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationResult {
    pub success: bool,
    pub value: Option<CalcValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CalculationResult {
    #[must_use]
    pub fn ok(value: CalcValue) -> Self {
        Self {
            success: true,
            value: Some(value),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.success
    }

    #[must_use]
    pub fn value(&self) -> Option<&CalcValue> {
        self.value.as_ref()
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// The value on success, the error message otherwise.
    pub fn into_result(self) -> Result<CalcValue, String> {
        match (self.success, self.value) {
            (true, Some(value)) => Ok(value),
            _ => Err(self
                .error
                .unwrap_or_else(|| "calculation produced no value".to_owned())),
        }
    }
}

// ── Context & Cache ────────────────────────────────────────────────────

/// Memo table of successful results keyed by expression id.
///
/// Clones share one table, so a cache can outlive a context or be shared by
/// several. Nothing here invalidates entries; owners call [`clear`] or
/// [`remove`] when the underlying rows change.
///
/// [`clear`]: ResultCache::clear
/// [`remove`]: ResultCache::remove
#[derive(Debug, Clone, Default)]
pub struct ResultCache {
    entries: Arc<Mutex<HashMap<ExprId, CalcValue>>>,
}

impl ResultCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ExprId, CalcValue>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn get(&self, id: &ExprId) -> Option<CalcValue> {
        self.lock().get(id).cloned()
    }

    pub fn insert(&self, id: ExprId, value: CalcValue) {
        self.lock().insert(id, value);
    }

    #[must_use]
    pub fn contains(&self, id: &ExprId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn remove(&self, id: &ExprId) -> Option<CalcValue> {
        self.lock().remove(id)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Rows, variables and the result cache a [`Calculator`] evaluates against.
#[derive(Debug, Default)]
pub struct CalculationContext {
    rows: Vec<Row>,
    variables: RwLock<HashMap<String, Value>>,
    cache: ResultCache,
}

impl CalculationContext {
    #[must_use]
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows,
            variables: RwLock::new(HashMap::new()),
            cache: ResultCache::new(),
        }
    }

    #[must_use]
    pub fn with_variables<I, K, V>(self, variables: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        {
            let mut map = self
                .variables
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            map.extend(
                variables
                    .into_iter()
                    .map(|(name, value)| (name.into(), value.into())),
            );
        }
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    #[must_use]
    pub fn variable(&self, name: &str) -> Option<Value> {
        self.variables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn set_variable(&self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.variables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value.into())
    }

    pub fn remove_variable(&self, name: &str) -> Option<Value> {
        self.variables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    #[must_use]
    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }
}

// ── Errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalcError {
    #[error("Invalid {kind} expression: missing {missing}")]
    MissingOperand {
        kind: &'static str,
        missing: &'static str,
    },
    #[error("Undefined variable: {0}")]
    UndefinedVariable(String),
    #[error("Unknown operator: {0}")]
    UnknownOperator(String),
    #[error("Unknown unary operator: {0}")]
    UnknownUnaryOperator(String),
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Unknown function: {0}")]
    UnknownFunction(String),
    #[error("Unknown expression type: {0}")]
    UnknownExpressionKind(String),
    #[error("{0} not implemented")]
    NotImplemented(String),
    #[error("expected a number but the operand produced {0}")]
    NonNumericOperand(&'static str),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("evaluation panicked: {0}")]
    Panicked(String),
    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),
    #[error(transparent)]
    GroupBy(#[from] GroupByError),
    #[error(transparent)]
    Type(#[from] TypeError),
}

pub type CalcResult<T> = Result<T, CalcError>;

// ── Calculator ─────────────────────────────────────────────────────────

/// Evaluates expressions against a shared [`CalculationContext`].
///
/// Successful results are memoized in the context's cache under the
/// expression's id; a repeated id is answered from the cache without
/// re-evaluating, even if variables changed in between. Failures are never
/// cached.
pub struct Calculator {
    context: Arc<CalculationContext>,
    functions: Arc<FunctionRegistry>,
    parser: Arc<dyn ExpressionParser>,
    policy: RuntimePolicy,
    ledger: Mutex<EvaluationLedger>,
}

impl Calculator {
    #[must_use]
    pub fn new(context: Arc<CalculationContext>) -> Self {
        Self {
            context,
            functions: Arc::new(FunctionRegistry::new()),
            parser: Arc::new(FormulaParser),
            policy: RuntimePolicy::default(),
            ledger: Mutex::new(EvaluationLedger::new()),
        }
    }

    #[must_use]
    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = Arc::new(functions);
        self
    }

    #[must_use]
    pub fn with_parser(mut self, parser: Arc<dyn ExpressionParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Replaces the policy and starts a fresh ledger sized by it.
    #[must_use]
    pub fn with_policy(mut self, policy: RuntimePolicy) -> Self {
        self.ledger = Mutex::new(EvaluationLedger::with_capacity(policy.ledger_capacity));
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn context(&self) -> &Arc<CalculationContext> {
        &self.context
    }

    #[must_use]
    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    #[must_use]
    pub fn policy(&self) -> &RuntimePolicy {
        &self.policy
    }

    /// Snapshot of the evaluations recorded so far.
    #[must_use]
    pub fn ledger(&self) -> EvaluationLedger {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn evaluate(&self, expression: &Expression) -> CalculationResult {
        let cache = self.context.cache();
        if let Some(value) = cache.get(&expression.id) {
            self.record(expression, EvaluationOutcome::CacheHit, None);
            return CalculationResult::ok(value);
        }

        let outcome = AssertUnwindSafe(self.dispatch(expression))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(CalcError::Panicked(panic_message(payload.as_ref()))));

        match outcome {
            Ok(value) => {
                cache.insert(expression.id.clone(), value.clone());
                self.record(expression, EvaluationOutcome::Computed, None);
                CalculationResult::ok(value)
            }
            Err(err) => {
                let message = err.to_string();
                self.record(expression, EvaluationOutcome::Failed, Some(message.clone()));
                CalculationResult::failure(message)
            }
        }
    }

    fn record(&self, expression: &Expression, outcome: EvaluationOutcome, detail: Option<String>) {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            expression_id = %expression.id,
            kind = expression.kind(),
            ?outcome,
            error = detail.as_deref(),
            "evaluation finished"
        );

        if !self.policy.record_ledger {
            return;
        }
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(EvaluationRecord::now(
                expression.id.as_str(),
                expression.kind(),
                outcome,
                detail,
            ));
    }

    /// Top-level entry: bare literals and unrecognized kinds are rejected
    /// here even though literals are valid operands.
    async fn dispatch(&self, expression: &Expression) -> CalcResult<CalcValue> {
        match &expression.node {
            ExprNode::Literal { .. } | ExprNode::Unrecognized => Err(
                CalcError::UnknownExpressionKind(expression.kind().to_owned()),
            ),
            _ => self.eval_node(expression, 0).await,
        }
    }

    /// `depth` is the distance from the evaluated root; trees deeper than
    /// [`MAX_NESTING`] fail instead of exhausting the stack.
    fn eval_node<'a>(
        &'a self,
        expression: &'a Expression,
        depth: usize,
    ) -> BoxFuture<'a, CalcResult<CalcValue>> {
        async move {
            if depth > MAX_NESTING {
                return Err(CalcError::TooDeep(MAX_NESTING));
            }
            let depth = depth + 1;
            match &expression.node {
                ExprNode::Literal { value, name } => self
                    .eval_literal(value.as_ref(), name.as_deref())
                    .map(CalcValue::Number),
                ExprNode::Unary { operator, operand } => {
                    let operand = operand.as_deref().ok_or(CalcError::MissingOperand {
                        kind: "unary",
                        missing: "operand",
                    })?;
                    let value = self.eval_number(operand, depth).await?;
                    Ok(CalcValue::Number(operator.apply(value)))
                }
                ExprNode::Basic {
                    operator,
                    left,
                    right,
                } => {
                    let (Some(left), Some(right)) = (left.as_deref(), right.as_deref()) else {
                        return Err(CalcError::MissingOperand {
                            kind: "basic",
                            missing: "operands",
                        });
                    };
                    let left = self.eval_number(left, depth).await?;
                    let right = self.eval_number(right, depth).await?;
                    operator.apply(left, right).map(CalcValue::Number)
                }
                ExprNode::Ternary {
                    condition,
                    true_branch,
                    false_branch,
                } => {
                    let (Some(condition), Some(when_true), Some(when_false)) = (
                        condition.as_deref(),
                        true_branch.as_deref(),
                        false_branch.as_deref(),
                    ) else {
                        return Err(CalcError::MissingOperand {
                            kind: "ternary",
                            missing: "branches",
                        });
                    };
                    let branch = if is_truthy(self.eval_number(condition, depth).await?) {
                        when_true
                    } else {
                        when_false
                    };
                    self.eval_node(branch, depth).await
                }
                ExprNode::Function {
                    function_name,
                    arguments,
                } => self.eval_function(function_name, arguments, depth).await,
                ExprNode::Group {
                    group_by,
                    aggregation,
                    value_field,
                } => self.eval_group(
                    group_by.as_deref(),
                    aggregation.as_deref(),
                    value_field.as_deref(),
                ),
                ExprNode::Rank {
                    rank_by,
                    is_normalized,
                    is_cumulative,
                } => self.eval_rank(
                    rank_by.as_deref(),
                    RankOptions {
                        normalized: *is_normalized,
                        cumulative: *is_cumulative,
                    },
                ),
                ExprNode::Advanced { .. } => {
                    Err(CalcError::NotImplemented("Advanced analytics".to_owned()))
                }
                ExprNode::Unrecognized => Err(CalcError::UnknownExpressionKind(
                    expression.kind().to_owned(),
                )),
            }
        }
        .boxed()
    }

    async fn eval_number(&self, expression: &Expression, depth: usize) -> CalcResult<f64> {
        match self.eval_node(expression, depth).await? {
            CalcValue::Number(value) => Ok(value),
            other => Err(CalcError::NonNumericOperand(other.kind_name())),
        }
    }

    /// The value is consulted before the name; identifier-shaped text in
    /// either position is a variable reference.
    fn eval_literal(&self, value: Option<&LiteralValue>, name: Option<&str>) -> CalcResult<f64> {
        match (value, name) {
            (Some(LiteralValue::Number(number)), _) => Ok(*number),
            (Some(LiteralValue::Text(text)), _) => self.resolve_text(text),
            (None, Some(name)) => self.resolve_text(name),
            (None, None) => Err(CalcError::MissingOperand {
                kind: "literal",
                missing: "value",
            }),
        }
    }

    fn resolve_text(&self, text: &str) -> CalcResult<f64> {
        if !is_identifier(text) {
            return Ok(coerce_text(text));
        }
        self.context
            .variable(text)
            .map(|value| value.coerce_number())
            .ok_or_else(|| CalcError::UndefinedVariable(text.to_owned()))
    }

    async fn eval_function(
        &self,
        name: &str,
        arguments: &[Argument],
        depth: usize,
    ) -> CalcResult<CalcValue> {
        let pending: Vec<_> = arguments
            .iter()
            .map(|argument| self.eval_argument(argument, depth))
            .collect();
        let values: Vec<CalcValue> = stream::iter(pending)
            .buffered(self.policy.argument_concurrency())
            .try_collect()
            .await?;

        let function = self
            .functions
            .get(name)
            .ok_or_else(|| CalcError::UnknownFunction(name.to_owned()))?;

        let mut numbers = Vec::with_capacity(values.len());
        for value in &values {
            value.flatten_into(&mut numbers);
        }
        function(&numbers).map(CalcValue::Number)
    }

    fn eval_argument<'a>(
        &'a self,
        argument: &'a Argument,
        depth: usize,
    ) -> BoxFuture<'a, CalcResult<CalcValue>> {
        async move {
            match argument {
                Argument::Parsed(expression) => self.eval_node(expression, depth).await,
                Argument::Source { expression } => {
                    let parsed = self.parser.parse(expression)?;
                    self.eval_node(&parsed, depth).await
                }
            }
        }
        .boxed()
    }

    fn eval_group(
        &self,
        group_by: Option<&[String]>,
        aggregation: Option<&str>,
        value_field: Option<&str>,
    ) -> CalcResult<CalcValue> {
        let group_by = group_by.ok_or(CalcError::MissingOperand {
            kind: "group",
            missing: "groupBy",
        })?;
        let aggregation: Aggregation = aggregation
            .ok_or(CalcError::MissingOperand {
                kind: "group",
                missing: "aggregation",
            })?
            .parse()?;
        let value_field = value_field.unwrap_or(&self.policy.value_field);
        let table = group_rows(
            self.context.rows(),
            group_by,
            aggregation,
            value_field,
            &self.policy,
        )?;
        Ok(CalcValue::Groups(table))
    }

    fn eval_rank(&self, rank_by: Option<&[String]>, options: RankOptions) -> CalcResult<CalcValue> {
        let rank_by = rank_by.ok_or(CalcError::MissingOperand {
            kind: "rank",
            missing: "rankBy",
        })?;
        Ok(CalcValue::Ranks(rank_rows(self.context.rows(), rank_by, options)))
    }
}

impl fmt::Debug for Calculator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Calculator")
            .field("context", &self.context)
            .field("functions", &self.functions)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn is_truthy(value: f64) -> bool {
    value != 0.0 && !value.is_nan()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ce_groupby::GroupTable;
    use ce_runtime::{EvaluationOutcome, RuntimePolicy};
    use ce_types::{Row, RowId};
    use proptest::prelude::*;

    use super::{
        Argument, BinaryOp, CalcError, CalcValue, CalculationContext, CalculationResult,
        Calculator, ExprId, ExprNode, Expression, FunctionRegistry, MAX_NESTING, ResultCache,
        UnaryOp, parse_expression,
    };

    fn calculator() -> Calculator {
        Calculator::new(Arc::new(CalculationContext::default()))
    }

    fn sample_rows() -> Vec<Row> {
        vec![
            Row::new(1).with_field("g", "a").with_field("value", 1.0),
            Row::new(2).with_field("g", "a").with_field("value", 3.0),
            Row::new(3).with_field("g", "b").with_field("value", 5.0),
        ]
    }

    async fn eval_source(calculator: &Calculator, source: &str) -> CalculationResult {
        let expr = parse_expression(source).expect("formula parses");
        calculator.evaluate(&expr).await
    }

    fn number(result: &CalculationResult) -> f64 {
        result
            .value()
            .and_then(CalcValue::as_number)
            .unwrap_or_else(|| panic!("expected a number, got {result:?}"))
    }

    fn counting_registry(calls: &Arc<AtomicUsize>) -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        let calls = Arc::clone(calls);
        registry.register("tick", move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(42.0)
        });
        registry
    }

    // ── Arithmetic ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn arithmetic_follows_precedence() {
        let calc = calculator();
        assert_eq!(number(&eval_source(&calc, "2 + 3").await), 5.0);
        assert_eq!(number(&eval_source(&calc, "(2+3)*4").await), 20.0);
        assert_eq!(number(&eval_source(&calc, "2 + 3 * 4").await), 14.0);
        assert_eq!(number(&eval_source(&calc, "2 ^ 10").await), 1024.0);
        assert_eq!(number(&eval_source(&calc, "-3 + 1").await), -2.0);
        assert_eq!(number(&eval_source(&calc, "7 / 2").await), 3.5);
    }

    #[tokio::test]
    async fn division_by_zero_fails() {
        let result = eval_source(&calculator(), "5/0").await;
        assert!(!result.is_success());
        assert_eq!(result.error(), Some("Division by zero"));
        assert_eq!(result.value(), None);
    }

    #[tokio::test]
    async fn unary_operators() {
        let calc = calculator();
        let plus = Expression::unary(UnaryOp::Plus, Expression::number(4.0));
        let minus = Expression::unary(UnaryOp::Minus, Expression::number(4.0));
        assert_eq!(number(&calc.evaluate(&plus).await), 4.0);
        assert_eq!(number(&calc.evaluate(&minus).await), -4.0);
    }

    #[tokio::test]
    async fn missing_operands_are_reported_per_kind() {
        let calc = calculator();
        let basic = Expression::new(ExprNode::Basic {
            operator: BinaryOp::Add,
            left: Some(Box::new(Expression::number(1.0))),
            right: None,
        });
        let unary = Expression::new(ExprNode::Unary {
            operator: UnaryOp::Minus,
            operand: None,
        });
        let ternary = Expression::new(ExprNode::Ternary {
            condition: Some(Box::new(Expression::number(1.0))),
            true_branch: None,
            false_branch: Some(Box::new(Expression::number(2.0))),
        });

        assert_eq!(
            calc.evaluate(&basic).await.error(),
            Some("Invalid basic expression: missing operands")
        );
        assert_eq!(
            calc.evaluate(&unary).await.error(),
            Some("Invalid unary expression: missing operand")
        );
        assert_eq!(
            calc.evaluate(&ternary).await.error(),
            Some("Invalid ternary expression: missing branches")
        );
    }

    #[test]
    fn operator_symbols_outside_the_set_are_rejected() {
        assert_eq!(
            "%".parse::<BinaryOp>(),
            Err(CalcError::UnknownOperator("%".to_owned()))
        );
        assert_eq!(
            "!".parse::<UnaryOp>(),
            Err(CalcError::UnknownUnaryOperator("!".to_owned()))
        );
        let err = serde_json::from_str::<Expression>(
            r#"{"id": "e", "type": "basic", "operator": "%"}"#,
        )
        .expect_err("unknown operator");
        assert!(err.to_string().contains("Unknown operator: %"));
    }

    // ── Variables & literals ───────────────────────────────────────────

    #[tokio::test]
    async fn variables_resolve_from_context() {
        let context = CalculationContext::default().with_variables([("x", 4.0), ("y", 0.5)]);
        let calc = Calculator::new(Arc::new(context));
        assert_eq!(number(&eval_source(&calc, "x * 2 + y").await), 8.5);
    }

    #[tokio::test]
    async fn undefined_variable_is_not_cached() {
        let calc = calculator();
        let expr = parse_expression("x + 1").expect("parse");

        let first = calc.evaluate(&expr).await;
        assert_eq!(first.error(), Some("Undefined variable: x"));
        assert!(!calc.context().cache().contains(&expr.id));

        calc.context().set_variable("x", 9.0);
        let second = calc.evaluate(&expr).await;
        assert_eq!(number(&second), 10.0);
    }

    #[tokio::test]
    async fn text_literals_read_as_variables_or_numbers() {
        let context = CalculationContext::default().with_variables([("rate", "0.25")]);
        let calc = Calculator::new(Arc::new(context));

        let sum = |arg: Expression| Expression::function("sum", vec![arg.into()]);
        assert_eq!(number(&calc.evaluate(&sum(Expression::text("rate"))).await), 0.25);
        assert_eq!(number(&calc.evaluate(&sum(Expression::text("12"))).await), 12.0);
        assert!(number(&calc.evaluate(&sum(Expression::text("12 apples"))).await).is_nan());

        // A value takes precedence over a name.
        let both = Expression::new(ExprNode::Literal {
            value: Some(super::LiteralValue::Number(3.0)),
            name: Some("rate".to_owned()),
        });
        assert_eq!(number(&calc.evaluate(&sum(both)).await), 3.0);

        let neither = Expression::new(ExprNode::Literal {
            value: None,
            name: None,
        });
        assert_eq!(
            calc.evaluate(&sum(neither)).await.error(),
            Some("Invalid literal expression: missing value")
        );
    }

    #[tokio::test]
    async fn top_level_literal_is_an_unknown_kind() {
        let result = calculator().evaluate(&Expression::number(1.0)).await;
        assert_eq!(result.error(), Some("Unknown expression type: literal"));
    }

    #[tokio::test]
    async fn unrecognized_wire_kind_fails() {
        let expr: Expression =
            serde_json::from_str(r#"{"id": "m1", "type": "mystery", "payload": 3}"#)
                .expect("unknown kinds still deserialize");
        assert_eq!(expr.node, ExprNode::Unrecognized);
        let result = calculator().evaluate(&expr).await;
        assert_eq!(result.error(), Some("Unknown expression type: unrecognized"));
    }

    // ── Ternary ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn ternary_only_evaluates_the_taken_branch() {
        let calc = calculator();
        assert_eq!(number(&eval_source(&calc, "1 ? 5 : 1/0").await), 5.0);
        assert_eq!(number(&eval_source(&calc, "0 ? 1/0 : 7").await), 7.0);
        assert_eq!(number(&eval_source(&calc, "(2 - 2) ? undefined_name : 8").await), 8.0);
    }

    #[tokio::test]
    async fn ternary_treats_nan_as_false() {
        let calc = calculator();
        let expr = Expression::ternary(
            Expression::text("not a number"),
            Expression::number(1.0),
            Expression::number(2.0),
        );
        assert_eq!(number(&calc.evaluate(&expr).await), 2.0);
    }

    // ── Functions ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn builtin_functions_evaluate() {
        let calc = calculator();
        assert_eq!(number(&eval_source(&calc, "sum(1,2,3)").await), 6.0);
        assert_eq!(number(&eval_source(&calc, "AVG(2, 4)").await), 3.0);
        assert_eq!(number(&eval_source(&calc, "max(1, 9, 4) - min(3, 2)").await), 7.0);
        assert_eq!(number(&eval_source(&calc, "count()").await), 0.0);
        assert_eq!(number(&eval_source(&calc, "sum()").await), 0.0);
    }

    #[tokio::test]
    async fn unknown_function_fails() {
        let result = eval_source(&calculator(), "unknown(1,2)").await;
        assert!(result.error().expect("error").contains("Unknown function"));
    }

    #[tokio::test]
    async fn argument_errors_surface_before_lookup() {
        let result = eval_source(&calculator(), "unknown(1/0)").await;
        assert_eq!(result.error(), Some("Division by zero"));
    }

    #[tokio::test]
    async fn planned_functions_report_not_implemented() {
        let calc = calculator();
        let result = eval_source(&calc, "percentile(1, 2)").await;
        assert_eq!(result.error(), Some("Percentile calculation not implemented"));
        let result = eval_source(&calc, "tsne(1)").await;
        assert_eq!(result.error(), Some("t-SNE transformation not implemented"));
    }

    #[tokio::test]
    async fn advanced_is_not_implemented() {
        let result = calculator()
            .evaluate(&Expression::advanced(Some("clustering".to_owned())))
            .await;
        assert_eq!(result.error(), Some("Advanced analytics not implemented"));
    }

    #[tokio::test]
    async fn source_arguments_are_parsed_on_evaluation() {
        let context = CalculationContext::default().with_variables([("x", 10.0)]);
        let calc = Calculator::new(Arc::new(context));
        let expr = Expression::function(
            "sum",
            vec![
                Argument::source("1 + 2"),
                Argument::source("x / 5"),
                Expression::number(4.0).into(),
            ],
        );
        assert_eq!(number(&calc.evaluate(&expr).await), 9.0);

        let broken = Expression::function("sum", vec![Argument::source("1 +")]);
        let result = calc.evaluate(&broken).await;
        assert!(result.error().expect("error").starts_with("parse error"));
    }

    #[tokio::test]
    async fn nested_functions_mix_with_arithmetic() {
        let calc = calculator();
        assert_eq!(number(&eval_source(&calc, "sum(1, 2) * 2").await), 6.0);
        assert_eq!(number(&eval_source(&calc, "max(sum(1, 2), 2 ^ 2)").await), 4.0);
    }

    #[tokio::test]
    async fn panicking_function_becomes_failure() {
        let mut registry = FunctionRegistry::new();
        registry.register("explode", |_| panic!("boom"));
        let calc = calculator().with_functions(registry);
        let result = eval_source(&calc, "explode(1)").await;
        assert_eq!(result.error(), Some("evaluation panicked: boom"));
    }

    #[tokio::test]
    async fn long_formulas_fail_instead_of_overflowing() {
        let calc = calculator();
        let source = vec!["1"; 20_000].join(" + ");
        let expr = Expression::function("sum", vec![Argument::source(source)]);
        let result = calc.evaluate(&expr).await;
        assert!(!result.is_success());
        let error = result.error().expect("error message");
        assert!(error.starts_with("parse error"), "{error}");
        assert!(error.contains("nests deeper than"), "{error}");

        let fits = vec!["1"; MAX_NESTING - 1].join(" + ");
        assert_eq!(number(&eval_source(&calc, &fits).await), (MAX_NESTING - 1) as f64);
    }

    #[tokio::test]
    async fn hand_built_deep_trees_are_rejected() {
        let calc = calculator();
        let mut deep = Expression::number(1.0);
        for _ in 0..MAX_NESTING * 2 {
            deep = Expression::basic(BinaryOp::Add, deep, Expression::number(1.0));
        }
        let result = calc.evaluate(&deep).await;
        assert_eq!(
            result.error(),
            Some(CalcError::TooDeep(MAX_NESTING).to_string().as_str())
        );
        assert!(!calc.context().cache().contains(&deep.id));

        let mut shallow = Expression::number(1.0);
        for _ in 0..MAX_NESTING {
            shallow = Expression::unary(UnaryOp::Minus, shallow);
        }
        assert_eq!(number(&calc.evaluate(&shallow).await), 1.0);
    }

    // ── Caching ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn repeated_id_is_served_from_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calc = calculator().with_functions(counting_registry(&calls));
        let expr = parse_expression("tick() + 1").expect("parse");

        assert_eq!(number(&calc.evaluate(&expr).await), 43.0);
        assert_eq!(number(&calc.evaluate(&expr).await), 43.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            calc.context().cache().get(&expr.id),
            Some(CalcValue::Number(43.0))
        );

        let ledger = calc.ledger();
        assert_eq!(ledger.count(EvaluationOutcome::Computed), 1);
        assert_eq!(ledger.count(EvaluationOutcome::CacheHit), 1);
    }

    #[tokio::test]
    async fn identical_trees_with_distinct_ids_do_not_share_entries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calc = calculator().with_functions(counting_registry(&calls));
        let first = parse_expression("tick()").expect("parse");
        let second = parse_expression("tick()").expect("parse");

        calc.evaluate(&first).await;
        calc.evaluate(&second).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(calc.context().cache().len(), 2);
    }

    #[tokio::test]
    async fn cached_result_survives_variable_changes_until_cleared() {
        let context = Arc::new(CalculationContext::default().with_variables([("x", 1.0)]));
        let calc = Calculator::new(Arc::clone(&context));
        let expr = parse_expression("x + 1").expect("parse");

        assert_eq!(number(&calc.evaluate(&expr).await), 2.0);
        context.set_variable("x", 5.0);
        assert_eq!(number(&calc.evaluate(&expr).await), 2.0);

        context.cache().remove(&expr.id);
        assert_eq!(number(&calc.evaluate(&expr).await), 6.0);
    }

    #[tokio::test]
    async fn shared_cache_spans_contexts() {
        let cache = ResultCache::new();
        let expr = parse_expression("1 + 1").expect("parse").with_id("shared");
        let first = Calculator::new(Arc::new(
            CalculationContext::default().with_cache(cache.clone()),
        ));
        first.evaluate(&expr).await;

        let second = Calculator::new(Arc::new(
            CalculationContext::default().with_cache(cache.clone()),
        ));
        second.evaluate(&expr).await;
        assert!(cache.contains(&ExprId::new("shared")));
        assert_eq!(second.ledger().count(EvaluationOutcome::CacheHit), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn ledger_can_be_disabled() {
        let calc = calculator().with_policy(RuntimePolicy {
            record_ledger: false,
            ..RuntimePolicy::strict()
        });
        eval_source(&calc, "1 + 1").await;
        assert!(calc.ledger().records().is_empty());
    }

    #[tokio::test]
    async fn failures_are_recorded_with_detail() {
        let calc = calculator();
        let expr = parse_expression("nope(1)").expect("parse");
        calc.evaluate(&expr).await;
        let ledger = calc.ledger();
        let record = &ledger.records()[0];
        assert_eq!(record.outcome, EvaluationOutcome::Failed);
        assert_eq!(record.kind, "function");
        assert_eq!(record.expression_id, expr.id.as_str());
        assert_eq!(record.detail.as_deref(), Some("Unknown function: nope"));
    }

    #[tokio::test]
    async fn ledger_keeps_only_the_most_recent_evaluations() {
        let calc = calculator().with_policy(RuntimePolicy {
            ledger_capacity: 3,
            ..RuntimePolicy::strict()
        });
        let expr = parse_expression("2 * 21").expect("parse");
        for _ in 0..10 {
            calc.evaluate(&expr).await;
        }
        let ledger = calc.ledger();
        assert_eq!(ledger.records().len(), 3);
        assert_eq!(ledger.count(EvaluationOutcome::CacheHit), 3);
        assert_eq!(ledger.count(EvaluationOutcome::Computed), 0);
    }

    // ── Group & rank ───────────────────────────────────────────────────

    #[tokio::test]
    async fn group_sums_by_key() {
        let calc = Calculator::new(Arc::new(CalculationContext::new(sample_rows())));
        let result = calc.evaluate(&Expression::group(["g"], "sum")).await;
        let groups = result.value().and_then(CalcValue::as_groups).expect("groups");
        assert_eq!(groups.get("a"), Some(4.0));
        assert_eq!(groups.get("b"), Some(5.0));

        let unique = calc.evaluate(&Expression::group(["g"], "countUnique")).await;
        let groups = unique.value().and_then(CalcValue::as_groups).expect("groups");
        assert_eq!(groups.get("a"), Some(2.0));
    }

    #[tokio::test]
    async fn group_errors() {
        let calc = Calculator::new(Arc::new(CalculationContext::new(sample_rows())));
        let result = calc.evaluate(&Expression::group(["g"], "median")).await;
        assert_eq!(result.error(), Some("Unknown aggregation type: median"));

        let missing = Expression::new(ExprNode::Group {
            group_by: None,
            aggregation: Some("sum".to_owned()),
            value_field: None,
        });
        assert_eq!(
            calc.evaluate(&missing).await.error(),
            Some("Invalid group expression: missing groupBy")
        );
    }

    #[tokio::test]
    async fn group_value_field_overrides_policy_default() {
        let rows = vec![
            Row::new(1).with_field("g", "x").with_field("amount", 2.0),
            Row::new(2).with_field("g", "x").with_field("amount", 8.0),
        ];
        let calc = Calculator::new(Arc::new(CalculationContext::new(rows)));
        let expr = Expression::new(ExprNode::Group {
            group_by: Some(vec!["g".to_owned()]),
            aggregation: Some("average".to_owned()),
            value_field: Some("amount".to_owned()),
        });
        let result = calc.evaluate(&expr).await;
        assert_eq!(
            result.value(),
            Some(&CalcValue::Groups(GroupTable::new(vec![("x".to_owned(), 5.0)])))
        );
    }

    #[tokio::test]
    async fn rank_variants() {
        let rows = vec![
            Row::new(1).with_field("score", 10.0),
            Row::new(2).with_field("score", 20.0),
            Row::new(3).with_field("score", 30.0),
        ];
        let calc = Calculator::new(Arc::new(CalculationContext::new(rows)));
        let ranks = |result: CalculationResult| -> Vec<f64> {
            result
                .value()
                .and_then(CalcValue::as_ranks)
                .expect("ranks")
                .values()
                .copied()
                .collect()
        };

        assert_eq!(
            ranks(calc.evaluate(&Expression::rank(["score"], false, false)).await),
            vec![1.0, 2.0, 3.0]
        );
        assert_eq!(
            ranks(calc.evaluate(&Expression::rank(["score"], true, false)).await),
            vec![1.0 / 3.0, 2.0 / 3.0, 1.0]
        );
        assert_eq!(
            ranks(calc.evaluate(&Expression::rank(["score"], false, true)).await),
            vec![1.0, 3.0, 6.0]
        );
    }

    #[tokio::test]
    async fn aggregates_flatten_into_function_arguments() {
        let calc = Calculator::new(Arc::new(CalculationContext::new(sample_rows())));
        let total = Expression::function(
            "sum",
            vec![Expression::group(["g"], "sum").into(), Expression::number(1.0).into()],
        );
        assert_eq!(number(&calc.evaluate(&total).await), 10.0);

        let rank_count = Expression::function(
            "count",
            vec![Expression::rank(["value"], false, false).into()],
        );
        assert_eq!(number(&calc.evaluate(&rank_count).await), 3.0);
    }

    #[tokio::test]
    async fn aggregates_are_not_arithmetic_operands() {
        let calc = Calculator::new(Arc::new(CalculationContext::new(sample_rows())));
        let expr = Expression::basic(
            BinaryOp::Add,
            Expression::group(["g"], "sum"),
            Expression::number(1.0),
        );
        assert_eq!(
            calc.evaluate(&expr).await.error(),
            Some("expected a number but the operand produced groups")
        );
    }

    // ── Wire format ────────────────────────────────────────────────────

    #[tokio::test]
    async fn json_expression_tree_evaluates() {
        let expr: Expression = serde_json::from_str(
            r#"{
                "id": "root",
                "type": "ternary",
                "condition": {"id": "c", "type": "literal", "name": "flag"},
                "trueBranch": {
                    "id": "f",
                    "type": "function",
                    "functionName": "sum",
                    "arguments": [
                        {"expression": "2 * 3"},
                        {"id": "lit", "type": "literal", "value": 4}
                    ]
                },
                "falseBranch": {"id": "z", "type": "literal", "value": 0}
            }"#,
        )
        .expect("expression parses");
        let context = CalculationContext::default().with_variables([("flag", true)]);
        let calc = Calculator::new(Arc::new(context));
        assert_eq!(number(&calc.evaluate(&expr).await), 10.0);
        assert!(calc.context().cache().contains(&ExprId::new("root")));
    }

    #[test]
    fn results_serialize_with_success_flag() {
        let failure = CalculationResult::failure("Division by zero");
        assert_eq!(
            serde_json::to_string(&failure).expect("serialize"),
            r#"{"success":false,"value":null,"error":"Division by zero"}"#
        );
        let ok = CalculationResult::ok(CalcValue::Number(5.0));
        assert_eq!(
            serde_json::to_string(&ok).expect("serialize"),
            r#"{"success":true,"value":{"kind":"number","value":5.0}}"#
        );
        assert_eq!(ok.into_result(), Ok(CalcValue::Number(5.0)));
        assert_eq!(failure.into_result(), Err("Division by zero".to_owned()));
    }

    #[test]
    fn rank_tables_serialize_with_row_id_keys() {
        let mut ranks = ce_groupby::RankTable::new();
        ranks.insert(RowId(2), 1.0);
        let json = serde_json::to_string(&CalcValue::Ranks(ranks.clone())).expect("serialize");
        assert_eq!(json, r#"{"kind":"ranks","value":{"2":1.0}}"#);
        let back: CalcValue = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, CalcValue::Ranks(ranks));
    }

    #[test]
    fn group_tables_serialize_as_ordered_objects() {
        let table = GroupTable::new(vec![("b".to_owned(), 4.0), ("a".to_owned(), 1.5)]);
        let json = serde_json::to_string(&CalcValue::Groups(table.clone())).expect("serialize");
        assert_eq!(json, r#"{"kind":"groups","value":{"b":4.0,"a":1.5}}"#);
        let back: CalcValue = serde_json::from_str(&json).expect("deserialize");
        let groups = back.as_groups().expect("groups");
        assert_eq!(groups, &table);
        assert_eq!(groups.keys().collect::<Vec<_>>(), ["b", "a"]);
        assert_eq!(groups.get("a"), Some(1.5));
    }

    // ── Concurrency ────────────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_evaluations_share_one_context() {
        let context = Arc::new(CalculationContext::new(sample_rows()).with_variables([("k", 3.0)]));
        let calc = Arc::new(Calculator::new(Arc::clone(&context)));

        let mut handles = Vec::new();
        for i in 0..16 {
            let calc = Arc::clone(&calc);
            handles.push(tokio::spawn(async move {
                let expr = parse_expression(&format!("k * {i} + sum(1, 2)")).expect("parse");
                calc.evaluate(&expr).await
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            let result = handle.await.expect("task joins");
            assert_eq!(number(&result), 3.0 * i as f64 + 3.0);
        }
        assert_eq!(context.cache().len(), 16);
    }

    proptest! {
        #[test]
        fn prop_sum_matches_iterator_sum(values in prop::collection::vec(-1_000i32..1_000, 0..20)) {
            let calc = calculator();
            let arguments = values
                .iter()
                .map(|v| Expression::number(f64::from(*v)).into())
                .collect();
            let expr = Expression::function("sum", arguments);
            let result = futures::executor::block_on(calc.evaluate(&expr));
            let expected: f64 = values.iter().map(|v| f64::from(*v)).sum();
            prop_assert_eq!(result.value().and_then(CalcValue::as_number), Some(expected));
        }

        #[test]
        fn prop_parsed_addition_matches_native(a in -10_000i32..10_000, b in -10_000i32..10_000) {
            let calc = calculator();
            let expr = parse_expression(&format!("{a} + {b}")).expect("parse");
            let result = futures::executor::block_on(calc.evaluate(&expr));
            prop_assert_eq!(
                result.value().and_then(CalcValue::as_number),
                Some(f64::from(a) + f64::from(b))
            );
        }
    }
}
