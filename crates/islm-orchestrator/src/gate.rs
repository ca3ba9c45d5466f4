//! Regression test gate. Suites run against the live database without side
//! effects and their TAP output lands in `islm_test_result`; `migrate` is
//! allowed only while the namespace's most recent result passed.

use anyhow::Result;
use islm_core::{
    Assertion, AssertionOutcome, TapReport, TestResult, TestResultInput, TestSuite,
};
use islm_store_core::LifecycleStore;
use tracing::{info, warn};

const SUITE_PROVENANCE: &str = "islm-gate";

pub struct TestGate<'a> {
    store: &'a dyn LifecycleStore,
    actor: String,
}

impl<'a> TestGate<'a> {
    #[must_use]
    pub fn new(store: &'a dyn LifecycleStore, actor: &str) -> Self {
        Self {
            store,
            actor: actor.to_string(),
        }
    }

    /// Runs every assertion, each inside a rolled-back transaction, and
    /// appends the aggregate result. An assertion that errors counts as
    /// `not ok` with the error text as its diagnostic.
    ///
    /// # Errors
    /// Returns an error only when the result row cannot be written.
    pub fn run_suite(
        &self,
        namespace: &str,
        suite: &TestSuite,
        migration_version: Option<&str>,
    ) -> Result<TestResult> {
        let outcomes: Vec<AssertionOutcome> = suite
            .assertions
            .iter()
            .map(|assertion| self.evaluate(assertion))
            .collect();
        let report = TapReport::from_outcomes(&outcomes);

        let version = migration_version
            .map(str::to_string)
            .or_else(|| suite.migration_version.clone());
        self.append(namespace, &suite.name, version, &report, SUITE_PROVENANCE)
    }

    /// Classifies TAP text produced by an external runner and records it.
    ///
    /// # Errors
    /// Returns an error when the result row cannot be written.
    pub fn record_tap(
        &self,
        namespace: &str,
        test_name: &str,
        migration_version: Option<&str>,
        tap_text: &str,
        provenance: &str,
    ) -> Result<TestResult> {
        let report = TapReport::parse(tap_text);
        self.append(
            namespace,
            test_name,
            migration_version.map(str::to_string),
            &report,
            provenance,
        )
    }

    /// True only when the most recent result for `namespace` passed.
    ///
    /// # Errors
    /// Returns an error when the result table cannot be read.
    pub fn check_gate(&self, namespace: &str) -> Result<bool> {
        Ok(self
            .store
            .latest_test_result(namespace)?
            .is_some_and(|result| result.success))
    }

    fn evaluate(&self, assertion: &Assertion) -> AssertionOutcome {
        let query = match assertion {
            Assertion::Probe { probe, .. } => self.store.dialect().probe_query(probe),
            Assertion::Query { sql, .. } => sql.clone(),
        };

        match self.store.run_assertion(&query) {
            Ok(passed) => AssertionOutcome {
                description: assertion.description().to_string(),
                passed,
                diagnostic: None,
            },
            Err(err) => AssertionOutcome {
                description: assertion.description().to_string(),
                passed: false,
                diagnostic: Some(format!("{err:#}")),
            },
        }
    }

    fn append(
        &self,
        namespace: &str,
        test_name: &str,
        migration_version: Option<String>,
        report: &TapReport,
        provenance: &str,
    ) -> Result<TestResult> {
        let result = self.store.append_test_result(&TestResultInput {
            namespace: namespace.to_string(),
            migration_version,
            test_name: test_name.to_string(),
            tap_output: report.output(),
            success: report.success,
            created_by: self.actor.clone(),
            provenance: Some(provenance.to_string()),
        })?;

        if result.success {
            info!(namespace, test_name, passed = report.passed, "test suite passed");
        } else {
            warn!(
                namespace,
                test_name,
                passed = report.passed,
                failed = report.failed,
                "test suite failed; migrations are blocked for this namespace"
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use islm_core::{Ident, StatusProbe, DEFAULT_ACTOR};
    use islm_store_sqlite::SqliteLifecycleStore;
    use std::path::Path;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_store() -> SqliteLifecycleStore {
        let store = must_ok(SqliteLifecycleStore::open(Path::new(":memory:")));
        must_ok(store.migrate());
        store
    }

    fn table_probe(table: &str) -> StatusProbe {
        StatusProbe::TableExists {
            table: must_ok(Ident::new(table)),
        }
    }

    #[test]
    fn gate_fails_closed_without_results() {
        let store = fixture_store();
        let gate = TestGate::new(&store, DEFAULT_ACTOR);
        assert!(!must_ok(gate.check_gate("dv")));
    }

    #[test]
    fn suite_outcome_drives_the_gate() {
        let store = fixture_store();
        let gate = TestGate::new(&store, DEFAULT_ACTOR);
        let suite = TestSuite {
            name: "ledger".to_string(),
            migration_version: None,
            assertions: vec![
                Assertion::Probe {
                    description: "ledger exists".to_string(),
                    probe: table_probe("islm_governance"),
                },
                Assertion::Query {
                    description: "ledger is empty".to_string(),
                    sql: "SELECT COUNT(*) = 0 FROM islm_governance".to_string(),
                },
            ],
        };

        let passed = must_ok(gate.run_suite("dv", &suite, None));
        assert!(passed.success);
        assert!(passed.tap_output.starts_with("1..2\nok 1 - ledger exists"));
        assert!(must_ok(gate.check_gate("dv")));

        let failing = TestSuite {
            name: "missing".to_string(),
            migration_version: Some("v2024_01_01_00_00_00_x".to_string()),
            assertions: vec![Assertion::Probe {
                description: "hub exists".to_string(),
                probe: table_probe("hub_missing"),
            }],
        };
        let failed = must_ok(gate.run_suite("dv", &failing, None));
        assert!(!failed.success);
        assert_eq!(failed.migration_version.as_deref(), Some("v2024_01_01_00_00_00_x"));
        assert!(!must_ok(gate.check_gate("dv")));
        assert!(!must_ok(gate.check_gate("other")));
    }

    #[test]
    fn erroring_assertion_is_reported_as_not_ok() {
        let store = fixture_store();
        let gate = TestGate::new(&store, DEFAULT_ACTOR);
        let suite = TestSuite {
            name: "broken".to_string(),
            migration_version: None,
            assertions: vec![Assertion::Query {
                description: "reads missing table".to_string(),
                sql: "SELECT COUNT(*) FROM nowhere".to_string(),
            }],
        };

        let result = must_ok(gate.run_suite("dv", &suite, None));
        assert!(!result.success);
        assert!(result.tap_output.contains("not ok 1 - reads missing table"));
        assert!(result.tap_output.contains("# "));
    }

    #[test]
    fn empty_suite_blocks_the_gate() {
        let store = fixture_store();
        let gate = TestGate::new(&store, DEFAULT_ACTOR);
        let suite = TestSuite {
            name: "empty".to_string(),
            migration_version: None,
            assertions: Vec::new(),
        };

        assert!(!must_ok(gate.run_suite("dv", &suite, None)).success);
        assert!(!must_ok(gate.check_gate("dv")));
    }

    #[test]
    fn external_tap_is_classified_and_latest_result_wins() {
        let store = fixture_store();
        let gate = TestGate::new(&store, DEFAULT_ACTOR);

        let failed = must_ok(gate.record_tap(
            "dv",
            "pg_prove",
            None,
            "1..2\nok 1 - a\nnot ok 2 - b",
            "pg_prove",
        ));
        assert!(!failed.success);

        let passed = must_ok(gate.record_tap("dv", "pg_prove", None, "1..1\nok 1 - a", "pg_prove"));
        assert!(passed.success);
        assert_eq!(passed.provenance.as_deref(), Some("pg_prove"));
        assert!(must_ok(gate.check_gate("dv")));
    }
}
