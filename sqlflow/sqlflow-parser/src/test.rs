use serde_json::json;

use crate::ast::*;
use crate::error::Reason;
use crate::parse_source;

fn parse(source: &str) -> Vec<Stmt> {
    strip(parse_source(source, 0).unwrap())
}

/// Drop spans so expected values can be written by hand.
fn strip(stmts: Vec<Stmt>) -> Vec<Stmt> {
    stmts.into_iter().map(strip_stmt).collect()
}

fn strip_stmt(mut stmt: Stmt) -> Stmt {
    stmt.span = None;
    stmt.kind = match stmt.kind {
        StmtKind::If(if_block) => StmtKind::If(IfBlock {
            branches: if_block
                .branches
                .into_iter()
                .map(|(cond, body)| (strip_expr(cond), strip(body)))
                .collect(),
            else_body: if_block.else_body.map(strip),
        }),
        other => other,
    };
    stmt
}

fn strip_expr(mut expr: Expr) -> Expr {
    expr.span = None;
    expr.kind = match expr.kind {
        ExprKind::Unary(u) => ExprKind::Unary(UnaryExpr {
            op: u.op,
            expr: Box::new(strip_expr(*u.expr)),
        }),
        ExprKind::Binary(b) => ExprKind::Binary(BinaryExpr {
            left: Box::new(strip_expr(*b.left)),
            op: b.op,
            right: Box::new(strip_expr(*b.right)),
        }),
        other => other,
    };
    expr
}

#[test]
fn parse_full_pipeline() {
    let stmts = parse(
        r#"
        SOURCE s TYPE CSV PARAMS {"path": "in.csv", "has_header": true};
        LOAD t FROM s;
        CREATE TABLE u AS SELECT country, count(*) c FROM t GROUP BY country;
        EXPORT SELECT * FROM u TO "out.csv" TYPE CSV OPTIONS {"header": true};
        "#,
    );

    assert_eq!(
        stmts,
        vec![
            Stmt::new(StmtKind::SourceDef(SourceDef {
                name: "s".to_string(),
                type_tag: Some("CSV".to_string()),
                params: Some(json!({"path": "in.csv", "has_header": true})),
                from_ref: None,
                options: None,
            })),
            Stmt::new(StmtKind::Load(LoadStmt {
                target_table: "t".to_string(),
                source_ref: "s".to_string(),
                mode: LoadMode::Replace,
                merge_keys: vec![],
            })),
            Stmt::new(StmtKind::Sql(SqlStmt {
                raw: "CREATE TABLE u AS SELECT country, count(*) c FROM t GROUP BY country"
                    .to_string(),
            })),
            Stmt::new(StmtKind::Export(ExportStmt {
                select_sql: "SELECT * FROM u".to_string(),
                destination_uri: "out.csv".to_string(),
                type_tag: "CSV".to_string(),
                options: Some(json!({"header": true})),
            })),
        ]
    );
}

#[test]
fn parse_load_with_merge_keys() {
    let stmts = parse("LOAD users FROM crm MODE MERGE MERGE_KEYS (id, region);");

    assert_eq!(
        stmts,
        vec![Stmt::new(StmtKind::Load(LoadStmt {
            target_table: "users".to_string(),
            source_ref: "crm".to_string(),
            mode: LoadMode::Merge,
            merge_keys: vec!["id".to_string(), "region".to_string()],
        }))]
    );
}

#[test]
fn parse_source_from_profile() {
    let stmts = parse(r#"SOURCE x FROM "postgres" OPTIONS {"table": "users"};"#);

    assert_eq!(
        stmts,
        vec![Stmt::new(StmtKind::SourceDef(SourceDef {
            name: "x".to_string(),
            type_tag: None,
            params: None,
            from_ref: Some("postgres".to_string()),
            options: Some(json!({"table": "users"})),
        }))]
    );
}

#[test]
fn parse_set_keeps_raw_template() {
    let stmts = parse("SET out_path = /data/${env}/out.csv;");

    assert_eq!(
        stmts,
        vec![Stmt::new(StmtKind::Set(SetStmt {
            name: "out_path".to_string(),
            expression: "/data/${env}/out.csv".to_string(),
        }))]
    );
}

#[test]
fn parse_if_else() {
    let stmts = parse(
        "IF ${env} == 'prod' THEN \
             CREATE TABLE x AS SELECT 1 a; \
         ELSE IF ${env} == 'staging' THEN \
             CREATE TABLE x AS SELECT 2 a; \
         ELSE \
             CREATE TABLE x AS SELECT 3 a; \
         END IF;",
    );

    let cond = |name: &str, value: &str| {
        Expr::new(ExprKind::Binary(BinaryExpr {
            left: Box::new(Expr::new(ExprKind::Variable(VariableExpr {
                raw: name.to_string(),
                name: name.to_string(),
                default: None,
            }))),
            op: BinOp::Eq,
            right: Box::new(Expr::new(ExprKind::Literal(Literal::String(
                value.to_string(),
            )))),
        }))
    };
    let body = |n: i64| {
        vec![Stmt::new(StmtKind::Sql(SqlStmt {
            raw: format!("CREATE TABLE x AS SELECT {n} a"),
        }))]
    };

    assert_eq!(
        stmts,
        vec![Stmt::new(StmtKind::If(IfBlock {
            branches: vec![
                (cond("env", "prod"), body(1)),
                (cond("env", "staging"), body(2)),
            ],
            else_body: Some(body(3)),
        }))]
    );
}

#[test]
fn parse_nested_if() {
    let stmts = parse(
        "IF ${a} == '1' THEN \
             IF NOT ${b} == '2' THEN SELECT 1; END IF \
         END IF",
    );

    let Some(StmtKind::If(outer)) = stmts.first().map(|s| &s.kind) else {
        panic!("expected an if block, got {stmts:?}");
    };
    assert_eq!(outer.branches.len(), 1);
    let inner = &outer.branches[0].1;
    assert!(matches!(inner[0].kind, StmtKind::If(_)));
}

#[test]
fn condition_precedence() {
    let stmts = parse("IF ${a} == '1' AND ${b} == '2' OR NOT ${c} == '3' THEN SELECT 1; END IF");

    let Some(StmtKind::If(block)) = stmts.first().map(|s| &s.kind) else {
        panic!("expected an if block");
    };
    // ((a == '1' AND b == '2') OR (NOT (c == '3')))
    let ExprKind::Binary(or) = &block.branches[0].0.kind else {
        panic!("expected a binary expression");
    };
    assert_eq!(or.op, BinOp::Or);
    assert!(
        matches!(&or.left.kind, ExprKind::Binary(and) if and.op == BinOp::And),
        "left side should be the AND chain"
    );
    assert!(matches!(&or.right.kind, ExprKind::Unary(_)));
}

#[test]
fn sql_statement_with_quoted_semicolon() {
    let stmts = parse(r#"CREATE TABLE x AS SELECT ';' a;"#);

    assert_eq!(
        stmts,
        vec![Stmt::new(StmtKind::Sql(SqlStmt {
            raw: r#"CREATE TABLE x AS SELECT ';' a"#.to_string(),
        }))]
    );
}

#[test]
fn comments_are_ignored() {
    let stmts = parse(
        "-- load the raw data\n\
         LOAD t FROM s; -- replace by default\n",
    );
    assert_eq!(stmts.len(), 1);
    assert!(matches!(stmts[0].kind, StmtKind::Load(_)));
}

#[test]
fn missing_semicolon_is_an_error() {
    let errors = parse_source("LOAD t FROM s", 0).unwrap_err();
    assert!(!errors.is_empty());
    assert!(errors[0].span.is_some());
}

#[test]
fn malformed_variable_default_is_an_error() {
    let errors = parse_source("IF ${r|us east} == 'x' THEN SELECT 1; END IF", 0).unwrap_err();
    let reason = errors[0].reason.to_string();
    assert!(reason.contains("must be quoted"), "got: {reason}");
}

#[test]
fn unknown_load_mode_is_an_error() {
    parse_source("LOAD t FROM s MODE SIDEWAYS;", 0).unwrap_err();
}

#[test]
fn error_reasons_render_with_position() {
    let errors = parse_source("SOURCE s TYPE CSV;", 0).unwrap_err();
    // `PARAMS {...}` is mandatory for the inline form
    assert!(matches!(
        errors[0].reason,
        Reason::Expected { .. } | Reason::Simple(_)
    ));
}
