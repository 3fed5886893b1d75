mod support;

use basalt_common::{BasaltError, ScalarValue};
use basalt_compiler::{
    compile, PlannerConfig, PlanningMode, RelExpr, RelNode, ScalarOp, SortField,
};
use basalt_nquery::types::ColumnType;
use basalt_nquery::{DataSource, DimFilter, Interval, NativeQuery, ScanOrder};
use support::{numfoo_scan, numfoo_tables, planner_ctx, planner_ctx_with, run_scan};

fn str_array(values: &[&str]) -> RelExpr {
    RelExpr::lit(ScalarValue::Array(
        values.iter().map(|v| ScalarValue::from(*v)).collect(),
    ))
}

fn project(exprs: Vec<(RelExpr, &str)>, input: RelNode) -> RelNode {
    RelNode::Project {
        exprs: exprs
            .into_iter()
            .map(|(e, n)| (e, n.to_string()))
            .collect(),
        input: Box::new(input),
    }
}

fn filter(predicate: RelExpr, input: RelNode) -> RelNode {
    RelNode::Filter {
        predicate,
        input: Box::new(input),
    }
}

fn sort(fields: Vec<SortField>, limit: Option<u64>, input: RelNode) -> RelNode {
    RelNode::Sort {
        fields,
        limit,
        offset: None,
        input: Box::new(input),
    }
}

#[test]
fn array_overlap_round_trip_scenario() {
    // SELECT dim3 FROM numfoo WHERE ARRAY_OVERLAP(dim3, ARRAY['a','b']) LIMIT 5
    let plan = sort(
        vec![],
        Some(5),
        project(
            vec![(RelExpr::col("dim3"), "dim3")],
            filter(
                RelExpr::call(
                    ScalarOp::ArrayOverlap,
                    vec![RelExpr::col("dim3"), str_array(&["a", "b"])],
                ),
                numfoo_scan(),
            ),
        ),
    );
    let ctx = planner_ctx(&[]);
    let compiled = compile(&ctx, &plan).unwrap();

    let NativeQuery::Scan(scan) = &compiled.query else {
        panic!("expected scan, got {:?}", compiled.query);
    };
    assert_eq!(scan.data_source, DataSource::table("numfoo"));
    assert_eq!(scan.columns, vec!["dim3".to_string()]);
    assert_eq!(scan.limit, Some(5));
    assert_eq!(
        scan.filter,
        Some(DimFilter::or(vec![
            DimFilter::equality("dim3", ColumnType::String, "a"),
            DimFilter::equality("dim3", ColumnType::String, "b"),
        ]))
    );

    let rows = run_scan(&compiled.query, &numfoo_tables());
    assert_eq!(
        rows,
        vec![
            vec![ScalarValue::Array(vec![
                ScalarValue::from("a"),
                ScalarValue::from("b"),
            ])],
            vec![ScalarValue::Array(vec![
                ScalarValue::from("b"),
                ScalarValue::from("c"),
            ])],
        ]
    );
}

#[test]
fn expression_projection_materializes_virtual_column() {
    let plan = project(
        vec![
            (RelExpr::col("dim1"), "dim1"),
            (
                RelExpr::call(ScalarOp::Strlen, vec![RelExpr::col("dim1")]),
                "len",
            ),
        ],
        numfoo_scan(),
    );
    let ctx = planner_ctx(&[]);
    let compiled = compile(&ctx, &plan).unwrap();
    let NativeQuery::Scan(scan) = &compiled.query else {
        panic!("expected scan");
    };
    assert_eq!(scan.columns, vec!["dim1".to_string(), "v0".to_string()]);
    assert_eq!(scan.virtual_columns.len(), 1);
    assert_eq!(scan.virtual_columns[0].expression, "strlen(\"dim1\")");
    let names: Vec<_> = compiled.signature.names().collect();
    assert_eq!(names, vec!["dim1", "len"]);
    assert_eq!(
        compiled.signature.column_type("len"),
        Some(&ColumnType::Long)
    );
}

#[test]
fn identical_expressions_share_one_virtual_column() {
    let strlen = RelExpr::call(ScalarOp::Strlen, vec![RelExpr::col("dim1")]);
    let plan = project(
        vec![(strlen.clone(), "a"), (strlen, "b")],
        numfoo_scan(),
    );
    let ctx = planner_ctx(&[]);
    let compiled = compile(&ctx, &plan).unwrap();
    let NativeQuery::Scan(scan) = &compiled.query else {
        panic!("expected scan");
    };
    assert_eq!(scan.virtual_columns.len(), 1);
    assert_eq!(scan.columns, vec!["v0".to_string(), "v0".to_string()]);
}

#[test]
fn time_ordering_maps_to_scan_order() {
    let plan = sort(
        vec![SortField {
            column: "__time".to_string(),
            descending: true,
        }],
        Some(10),
        project(
            vec![
                (RelExpr::col("__time"), "__time"),
                (RelExpr::col("dim1"), "dim1"),
            ],
            numfoo_scan(),
        ),
    );
    let ctx = planner_ctx(&[]);
    let compiled = compile(&ctx, &plan).unwrap();
    let NativeQuery::Scan(scan) = &compiled.query else {
        panic!("expected scan");
    };
    assert_eq!(scan.order, ScanOrder::Descending);
    assert_eq!(scan.limit, Some(10));
}

#[test]
fn non_time_ordering_is_rejected_in_coupled_mode() {
    let plan = sort(
        vec![SortField {
            column: "dim1".to_string(),
            descending: false,
        }],
        Some(10),
        project(vec![(RelExpr::col("dim1"), "dim1")], numfoo_scan()),
    );
    let ctx = planner_ctx(&[]);
    let err = compile(&ctx, &plan).unwrap_err();
    assert!(matches!(err, BasaltError::InvalidInput(_)));
}

#[test]
fn non_time_ordering_wraps_a_sub_query_in_decoupled_mode() {
    let plan = sort(
        vec![SortField {
            column: "dim1".to_string(),
            descending: false,
        }],
        Some(10),
        project(vec![(RelExpr::col("dim1"), "dim1")], numfoo_scan()),
    );
    let config = PlannerConfig {
        planning_mode: PlanningMode::Decoupled,
        ..PlannerConfig::default()
    };
    let ctx = planner_ctx_with(config, &[]);
    let compiled = compile(&ctx, &plan).unwrap();
    let NativeQuery::Scan(outer) = &compiled.query else {
        panic!("expected scan");
    };
    assert!(matches!(outer.data_source, DataSource::Query { .. }));
    assert_eq!(outer.order_by.len(), 1);
    assert_eq!(outer.order_by[0].dimension, "dim1");
    assert_eq!(outer.limit, Some(10));
}

#[test]
fn time_range_conjuncts_become_intervals() {
    let predicate = RelExpr::call(
        ScalarOp::And,
        vec![
            RelExpr::binary(ScalarOp::Ge, RelExpr::col("__time"), RelExpr::lit(1000i64)),
            RelExpr::binary(ScalarOp::Lt, RelExpr::col("__time"), RelExpr::lit(2000i64)),
            RelExpr::binary(ScalarOp::Eq, RelExpr::col("dim1"), RelExpr::lit("abc")),
        ],
    );
    let plan = project(
        vec![(RelExpr::col("dim1"), "dim1")],
        filter(predicate, numfoo_scan()),
    );
    let ctx = planner_ctx(&[]);
    let compiled = compile(&ctx, &plan).unwrap();
    let NativeQuery::Scan(scan) = &compiled.query else {
        panic!("expected scan");
    };
    assert_eq!(scan.intervals, vec![Interval::new(1000, 2000)]);
    assert_eq!(
        scan.filter,
        Some(DimFilter::equality("dim1", ColumnType::String, "abc"))
    );
}

#[test]
fn require_time_condition_rejects_eternity() {
    let plan = project(vec![(RelExpr::col("dim1"), "dim1")], numfoo_scan());
    let config = PlannerConfig {
        require_time_condition: true,
        ..PlannerConfig::default()
    };
    let ctx = planner_ctx_with(config.clone(), &[]);
    let err = compile(&ctx, &plan).unwrap_err();
    assert!(matches!(err, BasaltError::InvalidInput(_)));

    let bounded = project(
        vec![(RelExpr::col("dim1"), "dim1")],
        filter(
            RelExpr::binary(ScalarOp::Ge, RelExpr::col("__time"), RelExpr::lit(0i64)),
            numfoo_scan(),
        ),
    );
    let ctx = planner_ctx_with(config, &[]);
    let compiled = compile(&ctx, &bounded).unwrap();
    let NativeQuery::Scan(scan) = &compiled.query else {
        panic!("expected scan");
    };
    assert_eq!(scan.intervals, vec![Interval::new(0, i64::MAX)]);
}

#[test]
fn compilation_is_deterministic() {
    let plan = sort(
        vec![],
        Some(5),
        project(
            vec![
                (RelExpr::col("dim3"), "dim3"),
                (
                    RelExpr::call(ScalarOp::Strlen, vec![RelExpr::col("dim1")]),
                    "len",
                ),
            ],
            filter(
                RelExpr::call(
                    ScalarOp::ArrayOverlap,
                    vec![RelExpr::col("dim3"), str_array(&["a", "b"])],
                ),
                numfoo_scan(),
            ),
        ),
    );
    let ctx = planner_ctx(&[]);
    let first = compile(&ctx, &plan).unwrap();
    let second = compile(&ctx, &plan).unwrap();
    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_value(&first.query).unwrap(),
        serde_json::to_value(&second.query).unwrap()
    );
}

#[test]
fn scan_serializes_with_stable_field_names() {
    let plan = project(vec![(RelExpr::col("dim1"), "dim1")], numfoo_scan());
    let ctx = planner_ctx(&[("sqlQueryId", serde_json::json!("test-id"))]);
    let compiled = compile(&ctx, &plan).unwrap();
    let json = serde_json::to_value(&compiled.query).unwrap();
    assert_eq!(json["queryType"], "scan");
    assert_eq!(json["dataSource"]["type"], "table");
    assert_eq!(json["resultFormat"], "compactedList");
    assert_eq!(json["columns"], serde_json::json!(["dim1"]));
    assert_eq!(json["context"]["sqlQueryId"], "test-id");
    assert_eq!(
        json["intervals"],
        serde_json::json!(
            ["-146136543-09-08T08:23:32.096Z/146140482-04-24T15:36:27.903Z"]
        )
    );
}

#[test]
fn stringify_arrays_controls_external_signature() {
    let plan = project(
        vec![(
            RelExpr::call(ScalarOp::MvToArray, vec![RelExpr::col("dim3")]),
            "d3",
        )],
        numfoo_scan(),
    );
    let ctx = planner_ctx(&[]);
    let stringified = compile(&ctx, &plan).unwrap();
    assert_eq!(
        stringified.signature.column_type("d3"),
        Some(&ColumnType::String)
    );

    let ctx = planner_ctx(&[("sqlStringifyArrays", serde_json::json!(false))]);
    let raw = compile(&ctx, &plan).unwrap();
    assert_eq!(
        raw.signature.column_type("d3"),
        Some(&ColumnType::string_array())
    );
    // native column types carry the true array type either way
    let NativeQuery::Scan(scan) = &raw.query else {
        panic!("expected scan");
    };
    assert_eq!(scan.column_types, vec![ColumnType::string_array()]);
}
