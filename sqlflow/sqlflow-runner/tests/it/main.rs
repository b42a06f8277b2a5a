//! End-to-end pipeline scenarios: compile with `sqlflow`, execute with the
//! runner, observe files, engine state and connector stores.

use std::collections::BTreeMap;

use sqlflow::ir::plan::Plan;
use sqlflow::profile::Profile;
use sqlflow_runner::data::{DataChunk, DataType, Schema, Value};
use sqlflow_runner::{run, CancelToken, MemoryStore, OpStatus, RunOptions, RunResult};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn compile(source: &str, profile: &Profile, cli: &[(&str, &str)]) -> Plan {
    let cli: BTreeMap<String, String> = cli
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    match sqlflow::compile(source, profile, &cli) {
        Ok(plan) => plan,
        Err(e) => panic!("compilation failed:\n{e}"),
    }
}

fn run_ok(plan: &Plan, profile: &Profile, options: RunOptions) -> RunResult {
    let result = run(plan, profile, options).unwrap();
    assert!(
        result.succeeded(),
        "run failed: {:?}",
        result
            .operations
            .iter()
            .filter(|op| op.status != OpStatus::Succeeded)
            .collect::<Vec<_>>()
    );
    result
}

fn people_chunk(rows: &[(i64, &str)]) -> DataChunk {
    let mut chunk = DataChunk::empty(Schema::new(vec![
        ("id", DataType::Bigint),
        ("name", DataType::Text),
    ]));
    for (id, name) in rows {
        chunk.push_row(vec![Value::Integer(*id), Value::Text(name.to_string())]);
    }
    chunk
}

#[test]
fn csv_load_transform_export() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let in_path = dir.path().join("in.csv");
    let out_path = dir.path().join("out.csv");
    std::fs::write(&in_path, "country\nUS\nCA\nUS\n").unwrap();

    let source = format!(
        r#"
        SOURCE s TYPE CSV PARAMS {{"path": "{in_csv}", "has_header": true}};
        LOAD t FROM s;
        CREATE TABLE u AS SELECT country, count(*) c FROM t GROUP BY country ORDER BY country;
        EXPORT SELECT * FROM u ORDER BY country TO "{out_csv}" TYPE CSV OPTIONS {{"header": true}};
        "#,
        in_csv = in_path.display(),
        out_csv = out_path.display(),
    );

    let profile = Profile::default();
    let plan = compile(&source, &profile, &[]);
    let result = run_ok(&plan, &profile, RunOptions::default());

    assert_eq!(result.operations.len(), 4);
    assert_eq!(result.get("001_load_t").unwrap().rows, 3);
    assert_eq!(result.get("003_export").unwrap().rows, 2);

    let out = std::fs::read_to_string(&out_path).unwrap();
    assert_eq!(out, "country,c\nCA,1\nUS,2\n");
}

#[test]
fn replace_runs_are_idempotent() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let in_path = dir.path().join("in.csv");
    let out_path = dir.path().join("out.csv");
    std::fs::write(&in_path, "v\n1\n2\n").unwrap();

    let source = format!(
        r#"
        SOURCE s TYPE CSV PARAMS {{"path": "{}"}};
        LOAD t FROM s;
        EXPORT SELECT sum(v) total FROM t TO "{}" TYPE CSV;
        "#,
        in_path.display(),
        out_path.display(),
    );

    let profile = Profile::default();
    let plan = compile(&source, &profile, &[]);

    run_ok(&plan, &profile, RunOptions::default());
    let first = std::fs::read_to_string(&out_path).unwrap();

    run_ok(&plan, &profile, RunOptions::default());
    let second = std::fs::read_to_string(&out_path).unwrap();

    assert_eq!(first, second);
    assert_eq!(first, "total\n3\n");
}

#[test]
fn conditional_branch_selects_the_transform() {
    init_logging();
    let store = MemoryStore::new();
    let source = r#"
        IF ${env} == 'prod' THEN
            CREATE TABLE x AS SELECT 1 a;
        ELSE
            CREATE TABLE x AS SELECT 2 a;
        END IF;
        EXPORT SELECT a FROM x TO "x_out" TYPE memory;
    "#;

    let profile = Profile::default();
    let plan = compile(source, &profile, &[("env", "dev")]);
    run_ok(
        &plan,
        &profile,
        RunOptions {
            memory: store.clone(),
            ..RunOptions::default()
        },
    );

    let exported = store.get("x_out").unwrap();
    assert_eq!(exported.columns[0][0], Value::Integer(2));
}

#[test]
fn append_schema_mismatch_leaves_target_unchanged() {
    init_logging();
    let store = MemoryStore::new();

    // seed a source with a column the target doesn't have
    let mut wide = DataChunk::empty(Schema::new(vec![
        ("id", DataType::Bigint),
        ("name", DataType::Text),
        ("extra", DataType::Text),
    ]));
    wide.push_row(vec![
        Value::Integer(9),
        Value::Text("mallory".to_string()),
        Value::Text("boom".to_string()),
    ]);
    store.put("wide", wide);
    store.put("people", people_chunk(&[(1, "ada")]));

    let source = r#"
        SOURCE base TYPE memory PARAMS {"table_name": "people"};
        LOAD t FROM base;
        SOURCE more TYPE memory PARAMS {"table_name": "wide"};
        LOAD t FROM more MODE APPEND;
        EXPORT SELECT * FROM t TO "t_out" TYPE memory;
    "#;

    let dir = tempfile::tempdir().unwrap();
    let profile = Profile {
        engines: sqlflow::profile::Engines {
            duckdb: sqlflow::profile::EngineConfig {
                mode: sqlflow::profile::EngineMode::Persistent,
                path: Some(dir.path().join("wh.db").to_string_lossy().into_owned()),
                memory_limit: None,
            },
        },
        ..Profile::default()
    };
    let plan = compile(source, &profile, &[]);
    let result = run(
        &plan,
        &profile,
        RunOptions {
            memory: store.clone(),
            ..RunOptions::default()
        },
    )
    .unwrap();

    let failed = result.get("003_load_t").unwrap();
    assert_eq!(failed.status, OpStatus::Failed);
    let error = failed.error.as_ref().unwrap();
    assert!(
        error.reason.contains("extra"),
        "expected the offending column in: {}",
        error.reason
    );

    // the export depends on the failed append and must be skipped
    assert_eq!(result.get("004_export").unwrap().status, OpStatus::Skipped);

    // no partial write: the target still holds exactly the first load
    let inspect = compile(
        r#"EXPORT SELECT * FROM t TO "t_after" TYPE memory;"#,
        &profile,
        &[],
    );
    run_ok(
        &inspect,
        &profile,
        RunOptions {
            memory: store.clone(),
            ..RunOptions::default()
        },
    );
    let after = store.get("t_after").unwrap();
    assert_eq!(after.row_count(), 1);
    assert_eq!(after.columns[1][0], Value::Text("ada".to_string()));
}

#[test]
fn merge_load_upserts_on_keys() {
    init_logging();
    let store = MemoryStore::new();
    store.put("first", people_chunk(&[(1, "ada"), (2, "grace")]));
    store.put("second", people_chunk(&[(2, "GRACE"), (3, "lin")]));

    let source = r#"
        SOURCE a TYPE memory PARAMS {"table_name": "first"};
        LOAD t FROM a;
        SOURCE b TYPE memory PARAMS {"table_name": "second"};
        LOAD t FROM b MODE MERGE MERGE_KEYS (id);
        EXPORT SELECT * FROM t ORDER BY id TO "t_out" TYPE memory;
    "#;

    let profile = Profile::default();
    let plan = compile(source, &profile, &[]);
    run_ok(
        &plan,
        &profile,
        RunOptions {
            memory: store.clone(),
            ..RunOptions::default()
        },
    );

    let merged = store.get("t_out").unwrap();
    assert_eq!(merged.row_count(), 3);
    assert_eq!(merged.columns[1][1], Value::Text("GRACE".to_string()));
    assert_eq!(merged.columns[0][2], Value::Integer(3));
}

#[test]
fn incremental_load_reads_past_the_watermark() {
    init_logging();
    let store = MemoryStore::new();
    store.put("events", people_chunk(&[(1, "a"), (2, "b")]));

    let source = r#"
        SOURCE ev TYPE memory PARAMS
            {"table_name": "events", "sync_mode": "incremental", "cursor_field": "id"};
        LOAD t FROM ev MODE APPEND;
    "#;

    let profile = Profile::default();
    let plan = compile(source, &profile, &[]);

    // watermark paths only matter within one engine session, so drive the
    // executor twice against a persistent engine file
    let dir = tempfile::tempdir().unwrap();
    let profile = Profile {
        engines: sqlflow::profile::Engines {
            duckdb: sqlflow::profile::EngineConfig {
                mode: sqlflow::profile::EngineMode::Persistent,
                path: Some(dir.path().join("wh.db").to_string_lossy().into_owned()),
                memory_limit: None,
            },
        },
        ..profile
    };

    let options = || RunOptions {
        memory: store.clone(),
        ..RunOptions::default()
    };

    let first = run_ok(&plan, &profile, options());
    assert_eq!(first.get("001_load_t").unwrap().rows, 2);

    // new rows past the watermark, plus an old one that must not reappear
    store.put("events", people_chunk(&[(1, "a"), (2, "b"), (3, "c")]));
    let second = run_ok(&plan, &profile, options());
    assert_eq!(second.get("001_load_t").unwrap().rows, 1);
}

#[test]
fn cancellation_skips_all_operations() {
    init_logging();
    let cancel = CancelToken::new();
    cancel.cancel();

    let profile = Profile::default();
    let plan = compile("CREATE TABLE x AS SELECT 1 a;", &profile, &[]);
    let result = run(
        &plan,
        &profile,
        RunOptions {
            cancel,
            ..RunOptions::default()
        },
    )
    .unwrap();

    assert_eq!(result.operations[0].status, OpStatus::Skipped);
    assert!(result.operations[0]
        .error
        .as_ref()
        .unwrap()
        .reason
        .contains("canceled"));
}

#[test]
fn failed_operation_skips_transitive_dependents() {
    init_logging();
    let source = r#"
        SOURCE s TYPE CSV PARAMS {"path": "/nowhere/missing.csv"};
        LOAD t FROM s;
        CREATE TABLE u AS SELECT * FROM t;
        EXPORT SELECT * FROM u TO "out" TYPE memory;
    "#;

    let profile = Profile::default();
    let plan = compile(source, &profile, &[]);
    let result = run(&plan, &profile, RunOptions::default()).unwrap();

    assert_eq!(result.get("001_load_t").unwrap().status, OpStatus::Failed);
    assert_eq!(
        result.get("002_transform_u").unwrap().status,
        OpStatus::Skipped
    );
    assert_eq!(result.get("003_export").unwrap().status, OpStatus::Skipped);
}

#[test]
fn describe_connector_reports_the_schema() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("d.csv");
    std::fs::write(&path, "id,name\n1,ada\n").unwrap();

    let profile = Profile::from_yaml(&format!(
        "connectors:\n  people:\n    type: csv\n    params:\n      path: {}\n",
        path.display()
    ))
    .unwrap();

    let schema = sqlflow_runner::describe_connector(&profile, "people").unwrap();
    assert_eq!(schema.names(), vec!["id", "name"]);
    assert_eq!(schema.columns[0].data_type, DataType::Bigint);
}

#[test]
fn profile_connector_reference_with_overrides() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.csv");
    let b = dir.path().join("b.csv");
    std::fs::write(&a, "v\n1\n").unwrap();
    std::fs::write(&b, "v\n2\n").unwrap();

    let profile = Profile::from_yaml(&format!(
        "connectors:\n  files:\n    type: csv\n    params:\n      path: {}\n",
        a.display()
    ))
    .unwrap();

    // OPTIONS overlay the profile connector's params
    let source = format!(
        r#"
        SOURCE s FROM "files" OPTIONS {{"path": "{}"}};
        LOAD t FROM s;
        EXPORT SELECT v FROM t TO "out" TYPE memory;
        "#,
        b.display()
    );

    let store = MemoryStore::new();
    let plan = compile(&source, &profile, &[]);
    run_ok(
        &plan,
        &profile,
        RunOptions {
            memory: store.clone(),
            ..RunOptions::default()
        },
    );

    assert_eq!(store.get("out").unwrap().columns[0][0], Value::Integer(2));
}
