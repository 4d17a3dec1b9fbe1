use serde::{Deserialize, Serialize};

/// One forensic record per conformance case. Serialized as a JSON line
/// by the matrix runner so failures can be replayed from the log alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredCaseLog {
    pub ts_utc: String,
    pub suite_id: String,
    pub fixture_id: String,
    pub packet_id: String,
    pub case_id: String,
    pub scenario_id: String,
    pub artifact_refs: Vec<String>,
    pub replay_command: String,
    pub outcome: String,
    pub reason_code: String,
}

impl StructuredCaseLog {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        suite_id: &str,
        fixture_id: &str,
        packet_id: &str,
        case_id: &str,
        scenario_id: String,
        artifact_refs: Vec<String>,
        replay_command: String,
        outcome: &str,
        reason_code: &str,
    ) -> Self {
        Self {
            ts_utc: "1970-01-01T00:00:00Z".to_string(),
            suite_id: suite_id.to_string(),
            fixture_id: fixture_id.to_string(),
            packet_id: packet_id.to_string(),
            case_id: case_id.to_string(),
            scenario_id,
            artifact_refs,
            replay_command,
            outcome: outcome.to_string(),
            reason_code: reason_code.to_string(),
        }
    }
}

/// Compact label for a global-flag configuration, used in scenario ids.
#[must_use]
pub fn flags_label(autograd: bool, tracing: bool, profiling: bool) -> String {
    let mut parts = Vec::new();
    if autograd {
        parts.push("autograd");
    }
    if tracing {
        parts.push("tracing");
    }
    if profiling {
        parts.push("profiling");
    }
    if parts.is_empty() {
        "baseline".to_string()
    } else {
        parts.join("+")
    }
}

#[cfg(test)]
mod tests {
    use super::{flags_label, StructuredCaseLog};

    #[test]
    fn flags_label_covers_combinations() {
        assert_eq!(flags_label(false, false, false), "baseline");
        assert_eq!(flags_label(true, false, false), "autograd");
        assert_eq!(flags_label(false, true, true), "tracing+profiling");
        assert_eq!(flags_label(true, true, true), "autograd+tracing+profiling");
    }

    #[test]
    fn case_log_serializes_to_one_json_object() {
        let log = StructuredCaseLog::new(
            "dispatch_matrix",
            "dispatch_cases.json",
            "FD-P1-003",
            "cpu_pair_baseline",
            "dispatch_matrix/baseline:cpu_pair_baseline".to_string(),
            vec!["crates/fd-conformance/fixtures/dispatch_cases.json".to_string()],
            "cargo test -p fd-conformance dispatch_matrix -- --nocapture".to_string(),
            "pass",
            "routing_ok",
        );
        let encoded = serde_json::to_string(&log).expect("log should serialize");
        assert!(encoded.contains("\"suite_id\":\"dispatch_matrix\""));
        assert!(encoded.contains("\"reason_code\":\"routing_ok\""));

        let decoded: StructuredCaseLog =
            serde_json::from_str(&encoded).expect("log should round-trip");
        assert_eq!(decoded, log);
    }
}
