//! Compiler-level tests: parse → plan wiring, variable priority, conditional
//! flattening, determinism and identifier safety.

use std::collections::BTreeMap;

use crate::ir::plan::{OpKind, Plan};
use crate::profile::Profile;
use crate::variables::VariableResolver;
use crate::{compile_with_resolver, ErrorMessages};

fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Compile with a pinned (empty) process environment.
fn compile(
    source: &str,
    profile: &Profile,
    cli: &[(&str, &str)],
) -> Result<Plan, ErrorMessages> {
    let resolver = VariableResolver::new(vars(cli), profile.variables.clone())
        .with_env_lookup(|_| None);
    compile_with_resolver(source, profile, resolver)
}

fn profile_with_vars(pairs: &[(&str, &str)]) -> Profile {
    Profile {
        variables: vars(pairs),
        ..Profile::default()
    }
}

#[test]
fn conditional_selection() {
    let source = "IF ${env} == 'prod' THEN CREATE TABLE x AS SELECT 1 a; \
                  ELSE CREATE TABLE x AS SELECT 2 a; END IF;";

    let plan = compile(source, &Profile::default(), &[("env", "prod")]).unwrap();
    assert_eq!(plan.operations.len(), 1);
    let transform = plan.operations[0].kind.as_transform().unwrap();
    assert!(transform.sql.contains("SELECT 1"), "got: {}", transform.sql);

    let plan = compile(source, &Profile::default(), &[("env", "dev")]).unwrap();
    let transform = plan.operations[0].kind.as_transform().unwrap();
    assert!(transform.sql.contains("SELECT 2"), "got: {}", transform.sql);

    let err = compile(source, &Profile::default(), &[]).unwrap_err();
    assert!(
        err.inner[0].reason.contains("not defined in any scope"),
        "got: {}",
        err.inner[0].reason
    );
}

#[test]
fn no_branch_matches_and_no_else_emits_nothing() {
    let source = "IF ${env} == 'prod' THEN CREATE TABLE x AS SELECT 1 a; END IF;";
    let plan = compile(source, &Profile::default(), &[("env", "dev")]).unwrap();
    assert!(plan.operations.is_empty());
}

#[test]
fn cli_beats_profile_beats_set() {
    let profile = profile_with_vars(&[("region", "us-east")]);
    let source = "SET region = 'us-west'; CREATE TABLE t AS SELECT ${region} r;";

    let plan = compile(source, &profile, &[("region", "eu")]).unwrap();
    let transform = plan.operations[0].kind.as_transform().unwrap();
    assert!(transform.sql.contains("'eu'"), "got: {}", transform.sql);

    // without the CLI binding, the profile still beats SET
    let plan = compile(source, &profile, &[]).unwrap();
    let transform = plan.operations[0].kind.as_transform().unwrap();
    assert!(transform.sql.contains("'us-east'"), "got: {}", transform.sql);

    // with neither, SET wins
    let plan = compile(source, &Profile::default(), &[]).unwrap();
    let transform = plan.operations[0].kind.as_transform().unwrap();
    assert!(transform.sql.contains("'us-west'"), "got: {}", transform.sql);
}

#[test]
fn set_inside_discarded_branch_has_no_effect() {
    let source = "IF ${env} == 'prod' THEN SET flavor = 'full'; END IF; \
                  CREATE TABLE t AS SELECT ${flavor|lite} f;";
    let plan = compile(source, &Profile::default(), &[("env", "dev")]).unwrap();
    let transform = plan.operations[0].kind.as_transform().unwrap();
    assert!(transform.sql.contains("'lite'"), "got: {}", transform.sql);
}

#[test]
fn compilation_is_deterministic() {
    let profile = profile_with_vars(&[("env", "prod")]);
    let source = r#"
        SOURCE s TYPE CSV PARAMS {"path": "in.csv", "has_header": true};
        LOAD t FROM s;
        IF ${env} == 'prod' THEN
            CREATE TABLE u AS SELECT country, count(*) c FROM t GROUP BY country;
        END IF;
        EXPORT SELECT * FROM u TO "out.csv" TYPE CSV OPTIONS {"header": true};
    "#;

    let a = compile(source, &profile, &[]).unwrap();
    let b = compile(source, &profile, &[]).unwrap();
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap()
    );
}

#[test]
fn plan_wires_dependencies_in_statement_order() {
    let source = r#"
        SOURCE s TYPE CSV PARAMS {"path": "in.csv"};
        LOAD t FROM s;
        CREATE TABLE u AS SELECT * FROM t;
        EXPORT SELECT * FROM u TO "out.csv" TYPE CSV;
    "#;
    let plan = compile(source, &Profile::default(), &[]).unwrap();

    let ids: Vec<_> = plan.operations.iter().map(|op| op.id.as_str()).collect();
    assert_eq!(
        ids,
        vec!["000_source_s", "001_load_t", "002_transform_u", "003_export"]
    );

    let load = &plan.operations[1];
    assert!(load.depends_on.contains("000_source_s"));
    let transform = &plan.operations[2];
    assert!(transform.depends_on.contains("001_load_t"));
    let export = &plan.operations[3];
    assert!(export.depends_on.contains("002_transform_u"));
}

#[test]
fn plans_contain_no_conditional_operations() {
    let source = "IF ${a|1} == '1' THEN \
                      IF ${b|2} == '2' THEN SELECT 1; END IF \
                  END IF;";
    let plan = compile(source, &Profile::default(), &[]).unwrap();
    assert_eq!(plan.operations.len(), 1);
    assert!(plan
        .operations
        .iter()
        .all(|op| matches!(op.kind, OpKind::Transform(_))));
}

#[test]
fn injection_in_connector_options_is_rejected_at_plan_time() {
    let profile = Profile::from_yaml(
        "connectors:\n  postgres:\n    type: postgres\n    params:\n      host: localhost\n",
    )
    .unwrap();
    let source = r#"SOURCE x FROM "postgres" OPTIONS {"table": "users; DROP TABLE t"};"#;

    let err = compile(source, &profile, &[]).unwrap_err();
    assert!(
        err.inner[0].reason.contains("invalid identifier"),
        "got: {}",
        err.inner[0].reason
    );
}

#[test]
fn load_from_unknown_source_is_rejected() {
    let err = compile("LOAD t FROM nowhere;", &Profile::default(), &[]).unwrap_err();
    assert!(
        err.inner[0].reason.contains("unknown reference"),
        "got: {}",
        err.inner[0].reason
    );
}

#[test]
fn source_from_unknown_profile_connector_is_rejected() {
    let err = compile(
        r#"SOURCE x FROM "nowhere";"#,
        &Profile::default(),
        &[],
    )
    .unwrap_err();
    assert!(err.inner[0].reason.contains("unknown reference"));
}

#[test]
fn incremental_source_lowers_to_a_cursor_load() {
    let source = r#"
        SOURCE events TYPE postgres PARAMS
            {"host": "db", "table": "events", "sync_mode": "incremental", "cursor_field": "updated_at"};
        LOAD events_raw FROM events MODE APPEND;
    "#;
    let plan = compile(source, &Profile::default(), &[]).unwrap();
    let load = plan.operations[1].kind.as_load().unwrap();
    assert_eq!(load.cursor_field.as_deref(), Some("updated_at"));
}

#[test]
fn errors_carry_position_and_hint() {
    let err = compile("LOAD t FROM nowhere;", &Profile::default(), &[]).unwrap_err();
    let message = &err.inner[0];
    assert!(message.location.is_some());
    assert!(!message.hints.is_empty());
    // the composed display names the source and the offending line
    let display = message.display.as_deref().unwrap();
    assert!(display.contains("pipeline.sf"), "got: {display}");
}

#[test]
fn validate_runs_the_same_analysis() {
    let profile = Profile::default();
    assert!(crate::validate("LOAD t FROM nowhere;", &profile, &BTreeMap::new()).is_err());
    assert!(crate::validate(
        r#"SOURCE s TYPE CSV PARAMS {"path": "x.csv"}; LOAD t FROM s;"#,
        &profile,
        &BTreeMap::new()
    )
    .is_ok());
}
