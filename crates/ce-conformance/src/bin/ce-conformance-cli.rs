#![forbid(unsafe_code)]

use ce_conformance::{HarnessConfig, SuiteOptions, enforce_green, run_suites_grouped};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut suite_filter: Option<String> = None;
    let mut emit_json = false;
    let mut require_green = false;
    let mut lenient = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--suite" => {
                let value = args
                    .next()
                    .ok_or("--suite requires a value (e.g. arithmetic)")?;
                suite_filter = Some(value);
            }
            "--json" => {
                emit_json = true;
            }
            "--require-green" => {
                require_green = true;
            }
            "--lenient" => {
                lenient = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                return Err(format!("unknown argument: {other}").into());
            }
        }
    }

    let mut config = HarnessConfig::default_paths();
    config.strict_mode = !lenient;
    let options = SuiteOptions { suite_filter };

    let reports = run_suites_grouped(&config, &options)?;
    if emit_json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            println!(
                "suite={} fixtures={} passed={} failed={} green={}",
                report.suite,
                report.fixture_count,
                report.passed,
                report.failed,
                report.is_green()
            );
            for result in report.results.iter().filter(|result| result.mismatch.is_some()) {
                println!(
                    "  case={} mismatch={}",
                    result.case_id,
                    result.mismatch.as_deref().unwrap_or_default()
                );
            }
        }
    }

    if require_green {
        enforce_green(&reports)?;
    }

    Ok(())
}

fn print_help() {
    println!(
        "ce-conformance-cli\n\
         Usage:\n\
         \tce-conformance-cli [--suite arithmetic] [--json] [--require-green] [--lenient]\n\
         Options:\n\
         \t--suite <name>     Run only fixtures of one suite\n\
         \t--json             Print suite reports as JSON\n\
         \t--require-green    Fail with non-zero exit when any case mismatches\n\
         \t--lenient          Use lenient coercion for fixtures without a policy\n\
         \t-h, --help         Show this help"
    );
}
