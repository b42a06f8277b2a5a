//! Printing the AST back to `.sf` text.
//!
//! Reparsing printed output yields an equal AST, which is what the
//! round-trip tests assert.

use sqlflow_parser::ast::*;

pub fn write_source(stmts: &[Stmt]) -> String {
    let mut out = String::new();
    for stmt in stmts {
        write_stmt(&mut out, stmt, 0);
    }
    out
}

fn write_stmt(out: &mut String, stmt: &Stmt, indent: usize) {
    let pad = "    ".repeat(indent);
    out.push_str(&pad);

    match &stmt.kind {
        StmtKind::SourceDef(def) => {
            out.push_str(&format!("SOURCE {}", def.name));
            if let Some(from_ref) = &def.from_ref {
                out.push_str(&format!(" FROM {}", quote(from_ref)));
                if let Some(options) = &def.options {
                    out.push_str(&format!(" OPTIONS {options}"));
                }
            } else {
                out.push_str(&format!(
                    " TYPE {} PARAMS {}",
                    def.type_tag.as_deref().unwrap_or_default(),
                    def.params.as_ref().unwrap_or(&serde_json::json!({}))
                ));
            }
            out.push_str(";\n");
        }
        StmtKind::Load(load) => {
            out.push_str(&format!(
                "LOAD {} FROM {} MODE {}",
                load.target_table, load.source_ref, load.mode
            ));
            if !load.merge_keys.is_empty() {
                out.push_str(&format!(" MERGE_KEYS ({})", load.merge_keys.join(", ")));
            }
            out.push_str(";\n");
        }
        StmtKind::Export(export) => {
            out.push_str(&format!(
                "EXPORT {} TO {} TYPE {}",
                export.select_sql,
                quote(&export.destination_uri),
                export.type_tag
            ));
            if let Some(options) = &export.options {
                out.push_str(&format!(" OPTIONS {options}"));
            }
            out.push_str(";\n");
        }
        StmtKind::Set(set) => {
            out.push_str(&format!("SET {} = {};\n", set.name, set.expression));
        }
        StmtKind::Sql(sql) => {
            out.push_str(&format!("{};\n", sql.raw));
        }
        StmtKind::If(block) => {
            for (i, (cond, body)) in block.branches.iter().enumerate() {
                if i == 0 {
                    out.push_str(&format!("IF {} THEN\n", write_expr(cond)));
                } else {
                    out.push_str(&format!("{pad}ELSE IF {} THEN\n", write_expr(cond)));
                }
                for inner in body {
                    write_stmt(out, inner, indent + 1);
                }
            }
            if let Some(body) = &block.else_body {
                out.push_str(&format!("{pad}ELSE\n"));
                for inner in body {
                    write_stmt(out, inner, indent + 1);
                }
            }
            out.push_str(&format!("{pad}END IF;\n"));
        }
    }
}

fn write_expr(expr: &Expr) -> String {
    match &expr.kind {
        ExprKind::Literal(lit) => lit.to_string(),
        ExprKind::Variable(var) => format!("${{{}}}", var.raw),
        ExprKind::Ident(name) => name.clone(),
        ExprKind::Unary(unary) => format!("NOT ({})", write_expr(&unary.expr)),
        ExprKind::Binary(binary) => format!(
            "({} {} {})",
            write_expr(&binary.left),
            binary.op,
            write_expr(&binary.right)
        ),
    }
}

/// Double-quote a string the way the lexer unescapes it.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}
