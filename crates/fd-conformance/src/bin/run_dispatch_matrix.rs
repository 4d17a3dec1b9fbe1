use std::process::ExitCode;

use fd_conformance::{
    run_demo_conformance, run_dispatch_conformance, run_profiling_conformance, run_smoke,
    run_unbox_error_conformance, HarnessConfig, HarnessReport, StructuredCaseLog,
};
use serde_json::json;

fn emit_logs(logs: &[StructuredCaseLog]) -> Result<(), String> {
    for log in logs {
        let line = serde_json::to_string(log)
            .map_err(|error| format!("failed to serialize case log: {error}"))?;
        println!("{line}");
    }
    Ok(())
}

fn emit_summary(report: &HarnessReport) -> Result<(), String> {
    let line = serde_json::to_string(&json!({
        "suite": report.suite,
        "fixture_count": report.fixture_count,
        "cases_total": report.cases_total,
        "cases_passed": report.cases_passed,
    }))
    .map_err(|error| format!("failed to serialize summary: {error}"))?;
    println!("{line}");
    Ok(())
}

fn run() -> Result<bool, String> {
    let config = HarnessConfig::default_paths();
    let mut all_passed = true;

    let smoke = run_smoke(&config);
    all_passed &= smoke.cases_passed == smoke.cases_total;
    emit_summary(&smoke)?;

    let (report, cases) = run_dispatch_conformance(&config)?;
    emit_logs(&cases.iter().map(|case| case.forensic_log.clone()).collect::<Vec<_>>())?;
    all_passed &= report.cases_passed == report.cases_total;
    emit_summary(&report)?;

    let (report, cases) = run_unbox_error_conformance(&config)?;
    emit_logs(&cases.iter().map(|case| case.forensic_log.clone()).collect::<Vec<_>>())?;
    all_passed &= report.cases_passed == report.cases_total;
    emit_summary(&report)?;

    let (report, cases) = run_profiling_conformance()?;
    emit_logs(&cases.iter().map(|case| case.forensic_log.clone()).collect::<Vec<_>>())?;
    all_passed &= report.cases_passed == report.cases_total;
    emit_summary(&report)?;

    let (report, cases) = run_demo_conformance()?;
    emit_logs(&cases.iter().map(|case| case.forensic_log.clone()).collect::<Vec<_>>())?;
    all_passed &= report.cases_passed == report.cases_total;
    emit_summary(&report)?;

    Ok(all_passed)
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            eprintln!("dispatch matrix finished with failing cases");
            ExitCode::FAILURE
        }
        Err(error) => {
            eprintln!("dispatch matrix aborted: {error}");
            ExitCode::from(2)
        }
    }
}
