#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ce_expr::{
    CalcValue, CalculationContext, CalculationResult, Calculator, Expression, parse_expression,
};
use ce_groupby::{GroupTable, RankTable};
use ce_runtime::RuntimePolicy;
use ce_types::{Row, RowId, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Absolute tolerance used when comparing numeric results.
pub const NUMERIC_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    /// Policy mode for fixtures that do not carry their own policy.
    pub strict_mode: bool,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            strict_mode: true,
        }
    }

    #[must_use]
    pub fn case_fixture_root(&self) -> PathBuf {
        self.fixture_root.join("cases")
    }

    fn default_policy(&self) -> RuntimePolicy {
        if self.strict_mode {
            RuntimePolicy::strict()
        } else {
            RuntimePolicy::lenient()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_count: usize,
    pub strict_mode: bool,
}

#[must_use]
pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let fixture_count = list_fixture_files(&config.case_fixture_root())
        .map(|files| files.len())
        .unwrap_or_default();

    HarnessReport {
        suite: "smoke",
        fixture_count,
        strict_mode: config.strict_mode,
    }
}

#[derive(Debug, Clone, Default)]
pub struct SuiteOptions {
    pub suite_filter: Option<String>,
}

/// One conformance case: an expression (as source text or a JSON tree),
/// the data it runs against and the result it must produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    pub case_id: String,
    pub suite: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub expression: Option<Expression>,
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default)]
    pub policy: Option<RuntimePolicy>,
    pub expected: FixtureExpected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureExpected {
    Number(f64),
    /// Group entries in the order the engine must emit them.
    Groups(Vec<(String, f64)>),
    Ranks(BTreeMap<RowId, f64>),
    Error(String),
    ErrorContains(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub suite: String,
    pub status: CaseStatus,
    pub mismatch: Option<String>,
    pub ledger_records: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub suite: String,
    pub fixture_count: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<CaseResult>,
}

impl SuiteReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.failed == 0 && self.fixture_count > 0
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("fixture format error: {0}")]
    FixtureFormat(String),
    #[error("suite {suite} is not green: {failed} of {fixture_count} cases failed")]
    NotGreen {
        suite: String,
        failed: usize,
        fixture_count: usize,
    },
}

pub fn run_fixture_suite(config: &HarnessConfig) -> Result<SuiteReport, HarnessError> {
    run_fixture_suite_with_options(config, &SuiteOptions::default())
}

pub fn run_fixture_suite_with_options(
    config: &HarnessConfig,
    options: &SuiteOptions,
) -> Result<SuiteReport, HarnessError> {
    let fixtures = load_fixtures(config, options.suite_filter.as_deref())?;
    let suite = options
        .suite_filter
        .clone()
        .unwrap_or_else(|| "all".to_owned());
    build_report(config, suite, &fixtures)
}

/// One report per fixture suite, in suite-name order.
pub fn run_suites_grouped(
    config: &HarnessConfig,
    options: &SuiteOptions,
) -> Result<Vec<SuiteReport>, HarnessError> {
    let fixtures = load_fixtures(config, options.suite_filter.as_deref())?;
    let mut grouped = BTreeMap::<String, Vec<Fixture>>::new();
    for fixture in fixtures {
        grouped
            .entry(fixture.suite.clone())
            .or_default()
            .push(fixture);
    }

    let mut reports = Vec::with_capacity(grouped.len());
    for (suite, suite_fixtures) in grouped {
        reports.push(build_report(config, suite, &suite_fixtures)?);
    }
    Ok(reports)
}

pub fn enforce_green(reports: &[SuiteReport]) -> Result<(), HarnessError> {
    if reports.is_empty() {
        return Err(HarnessError::FixtureFormat(
            "no fixtures matched the requested suite".to_owned(),
        ));
    }
    match reports.iter().find(|report| !report.is_green()) {
        Some(report) => Err(HarnessError::NotGreen {
            suite: report.suite.clone(),
            failed: report.failed,
            fixture_count: report.fixture_count,
        }),
        None => Ok(()),
    }
}

/// Evaluate one fixture and compare the outcome with its expectation.
pub fn run_fixture(config: &HarnessConfig, fixture: &Fixture) -> Result<CaseResult, HarnessError> {
    let expression = resolve_expression(fixture)?;

    let context = CalculationContext::new(fixture.rows.clone())
        .with_variables(fixture.variables.clone());
    let policy = fixture
        .policy
        .clone()
        .unwrap_or_else(|| config.default_policy());
    let calculator = Calculator::new(Arc::new(context)).with_policy(policy);

    let actual = match expression {
        Ok(expression) => futures::executor::block_on(calculator.evaluate(&expression)),
        Err(parse_error) => CalculationResult::failure(parse_error),
    };
    let mismatch = compare_outcome(&fixture.expected, &actual);

    Ok(CaseResult {
        case_id: fixture.case_id.clone(),
        suite: fixture.suite.clone(),
        status: if mismatch.is_none() {
            CaseStatus::Pass
        } else {
            CaseStatus::Fail
        },
        mismatch,
        ledger_records: calculator.ledger().records().len(),
    })
}

/// The inner `Result` carries a parse failure, which is a case outcome
/// rather than a harness error.
fn resolve_expression(fixture: &Fixture) -> Result<Result<Expression, String>, HarnessError> {
    match (&fixture.source, &fixture.expression) {
        (Some(source), None) => Ok(parse_expression(source).map_err(|err| err.to_string())),
        (None, Some(expression)) => Ok(Ok(expression.clone())),
        _ => Err(HarnessError::FixtureFormat(format!(
            "case {} must set exactly one of `source` or `expression`",
            fixture.case_id
        ))),
    }
}

fn build_report(
    config: &HarnessConfig,
    suite: String,
    fixtures: &[Fixture],
) -> Result<SuiteReport, HarnessError> {
    let mut results = Vec::with_capacity(fixtures.len());
    for fixture in fixtures {
        results.push(run_fixture(config, fixture)?);
    }

    let failed = results
        .iter()
        .filter(|result| matches!(result.status, CaseStatus::Fail))
        .count();
    let passed = results.len().saturating_sub(failed);

    Ok(SuiteReport {
        suite,
        fixture_count: results.len(),
        passed,
        failed,
        results,
    })
}

fn compare_outcome(expected: &FixtureExpected, actual: &CalculationResult) -> Option<String> {
    match (expected, actual.value(), actual.error()) {
        (FixtureExpected::Error(want), _, Some(got)) => {
            (want != got).then(|| format!("expected error {want:?}, got {got:?}"))
        }
        (FixtureExpected::ErrorContains(want), _, Some(got)) => {
            (!got.contains(want.as_str())).then(|| format!("expected error containing {want:?}, got {got:?}"))
        }
        (FixtureExpected::Error(want) | FixtureExpected::ErrorContains(want), Some(value), None) => {
            Some(format!("expected error {want:?}, got value {value:?}"))
        }
        (_, None, Some(got)) => Some(format!("unexpected error: {got}")),
        (FixtureExpected::Number(want), Some(CalcValue::Number(got)), _) => {
            (!numbers_match(*want, *got)).then(|| format!("expected {want}, got {got}"))
        }
        (FixtureExpected::Groups(want), Some(CalcValue::Groups(got)), _) => compare_groups(want, got),
        (FixtureExpected::Ranks(want), Some(CalcValue::Ranks(got)), _) => compare_ranks(want, got),
        (_, Some(value), _) => Some(format!(
            "result kind mismatch: expected {expected:?}, got {value:?}"
        )),
        (_, None, None) => Some("calculation returned neither value nor error".to_owned()),
    }
}

fn compare_groups(expected: &[(String, f64)], actual: &GroupTable) -> Option<String> {
    if expected.len() != actual.len() {
        return Some(format!(
            "group count mismatch: expected {}, got {}",
            expected.len(),
            actual.len()
        ));
    }
    for (position, ((want_key, want), (got_key, got))) in
        expected.iter().zip(actual.entries()).enumerate()
    {
        if want_key != got_key {
            return Some(format!(
                "group key mismatch at position {position}: expected {want_key:?}, got {got_key:?}"
            ));
        }
        if !numbers_match(*want, *got) {
            return Some(format!(
                "group {want_key:?} mismatch: expected {want}, got {got}"
            ));
        }
    }
    None
}

fn compare_ranks(expected: &BTreeMap<RowId, f64>, actual: &RankTable) -> Option<String> {
    if expected.len() != actual.len() {
        return Some(format!(
            "rank count mismatch: expected {}, got {}",
            expected.len(),
            actual.len()
        ));
    }
    for (row, want) in expected {
        match actual.get(row) {
            Some(got) if numbers_match(*want, *got) => {}
            Some(got) => return Some(format!("row {row} rank mismatch: expected {want}, got {got}")),
            None => return Some(format!("row {row} missing from ranks")),
        }
    }
    None
}

fn numbers_match(expected: f64, actual: f64) -> bool {
    if expected.is_nan() || actual.is_nan() {
        return expected.is_nan() && actual.is_nan();
    }
    if expected.is_infinite() || actual.is_infinite() {
        return expected == actual;
    }
    (expected - actual).abs() <= NUMERIC_TOLERANCE
}

fn load_fixtures(
    config: &HarnessConfig,
    suite_filter: Option<&str>,
) -> Result<Vec<Fixture>, HarnessError> {
    let fixture_files = list_fixture_files(&config.case_fixture_root())?;
    let mut fixtures = Vec::with_capacity(fixture_files.len());

    for fixture_path in fixture_files {
        let fixture = load_fixture(&fixture_path)?;
        if suite_filter.is_none_or(|suite| fixture.suite == suite) {
            fixtures.push(fixture);
        }
    }
    fixtures.sort_by(|a, b| a.case_id.cmp(&b.case_id));
    Ok(fixtures)
}

pub fn load_fixture(path: &Path) -> Result<Fixture, HarnessError> {
    let body = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&body)?)
}

fn list_fixture_files(root: &Path) -> Result<Vec<PathBuf>, HarnessError> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(current)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

// ── Fuzz entry points ──────────────────────────────────────────────────

/// Parse arbitrary bytes as a formula and, when that succeeds, evaluate it
/// against an empty context. Must never panic.
pub fn fuzz_parse_expression_bytes(data: &[u8]) {
    let Ok(source) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(expression) = parse_expression(source) else {
        return;
    };
    let calculator = Calculator::new(Arc::new(CalculationContext::default()));
    let _ = futures::executor::block_on(calculator.evaluate(&expression));
}

/// Decode arbitrary bytes as a fixture and run it. Must never panic.
pub fn fuzz_fixture_parse_bytes(data: &[u8]) {
    let Ok(fixture) = serde_json::from_slice::<Fixture>(data) else {
        return;
    };
    let _ = run_fixture(&HarnessConfig::default_paths(), &fixture);
}
