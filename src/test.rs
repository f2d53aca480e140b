//! End-to-end translation scenarios over a small school schema.

use std::collections::HashMap;

use insta::assert_snapshot;

use crate::ast::{CmpOp, Expr, ExprKind, GenExpr, Literal, Qualifier, Subscript};
use crate::error::ErrorKind;
use crate::schema::{Attribute, Entity, EntityId, Schema};
use crate::sql::ast::{SqlAst, Tag};
use crate::sql::functions::Builtin;
use crate::sql::{Dialect, Extractors, Options, Translator};
use crate::types::Ty;

const GROUP: EntityId = EntityId(0);
const STUDENT: EntityId = EntityId(1);
const MARK: EntityId = EntityId(2);
const COURSE: EntityId = EntityId(3);

fn school() -> Schema {
    let mut schema = Schema::new();
    schema.add_entity(Entity {
        name: "Group".to_string(),
        database: "school".to_string(),
        table: "group".to_string(),
        pk_attrs: vec!["id".to_string()],
        pk_columns: vec!["id".to_string()],
        attrs: vec![
            Attribute::value("id", Ty::Int, vec!["id"]).pk(0, 0),
            Attribute::value("number", Ty::Str, vec!["number"]).required(),
            Attribute::set("students", STUDENT, "group"),
        ],
        discriminator: None,
        root: None,
    });
    schema.add_entity(Entity {
        name: "Student".to_string(),
        database: "school".to_string(),
        table: "student".to_string(),
        pk_attrs: vec!["id".to_string()],
        pk_columns: vec!["id".to_string()],
        attrs: vec![
            Attribute::value("id", Ty::Int, vec!["id"]).pk(0, 0),
            Attribute::value("first_name", Ty::Str, vec!["first_name"]).required(),
            Attribute::value("last_name", Ty::Str, vec!["last_name"]).required(),
            Attribute::value("age", Ty::Int, vec!["age"]),
            Attribute::value("dob", Ty::Date, vec!["dob"]),
            Attribute::foreign_key("group", GROUP, vec!["group"], "students").required(),
            Attribute::set("marks", MARK, "student"),
            Attribute::many_to_many("courses", COURSE, "student_course", vec!["course"], "students"),
        ],
        discriminator: None,
        root: None,
    });
    schema.add_entity(Entity {
        name: "Mark".to_string(),
        database: "school".to_string(),
        table: "mark".to_string(),
        pk_attrs: vec!["id".to_string()],
        pk_columns: vec!["id".to_string()],
        attrs: vec![
            Attribute::value("id", Ty::Int, vec!["id"]).pk(0, 0),
            Attribute::value("value", Ty::Int, vec!["value"]).required(),
            Attribute::foreign_key("student", STUDENT, vec!["student"], "marks").required(),
        ],
        discriminator: None,
        root: None,
    });
    schema.add_entity(Entity {
        name: "Course".to_string(),
        database: "school".to_string(),
        table: "course".to_string(),
        pk_attrs: vec!["id".to_string()],
        pk_columns: vec!["id".to_string()],
        attrs: vec![
            Attribute::value("id", Ty::Int, vec!["id"]).pk(0, 0),
            Attribute::value("name", Ty::Str, vec!["name"]).required(),
            Attribute::many_to_many("students", STUDENT, "student_course", vec!["student"], "courses"),
        ],
        discriminator: None,
        root: None,
    });
    schema
}

fn vartypes() -> HashMap<String, Ty> {
    let mut vt = HashMap::new();
    vt.insert("Student".to_string(), Ty::set_of(Ty::Entity(STUDENT)));
    vt.insert("Group".to_string(), Ty::set_of(Ty::Entity(GROUP)));
    vt.insert("Mark".to_string(), Ty::set_of(Ty::Entity(MARK)));
    vt.insert("Course".to_string(), Ty::set_of(Ty::Entity(COURSE)));
    vt.insert("x".to_string(), Ty::Int);
    for builtin in [
        Builtin::Len,
        Builtin::Abs,
        Builtin::Min,
        Builtin::Max,
        Builtin::Sum,
        Builtin::Count,
        Builtin::Avg,
        Builtin::Select,
        Builtin::Exists,
        Builtin::Desc,
        Builtin::Join,
    ] {
        vt.insert(builtin.name().to_string(), Ty::Function(builtin));
    }
    vt
}

fn ext(name: &str) -> Expr {
    Expr::name(name).external(name)
}

fn for_in(name: &str, source: &str) -> Qualifier {
    Qualifier {
        assign: Expr::name(name),
        iter: ext(source),
        ifs: vec![],
    }
}

fn compare(left: Expr, op: CmpOp, right: Expr) -> Expr {
    Expr::new(ExprKind::Compare {
        left: Box::new(left),
        ops: vec![(op, right)],
    })
}

fn call(func: Expr, args: Vec<Expr>) -> Expr {
    Expr::new(ExprKind::Call {
        func: Box::new(func),
        args,
        keywords: vec![],
        star_args: None,
        dstar_args: None,
    })
}

fn int(value: i64) -> Expr {
    Expr::literal(Literal::Int(value))
}

fn string(value: &str) -> Expr {
    Expr::literal(Literal::String(value.to_string()))
}

fn translate(tree: &GenExpr) -> String {
    translate_with(tree, Options::default())
}

fn translate_with(tree: &GenExpr, options: Options) -> String {
    let schema = school();
    let vt = vartypes();
    crate::sql::translate(&schema, tree, &vt, options)
        .unwrap()
        .to_string()
}

fn try_translate(tree: &GenExpr) -> crate::error::Result<SqlAst> {
    let schema = school();
    let vt = vartypes();
    crate::sql::translate(&schema, tree, &vt, Options::default())
}

fn student_cols(alias: &str) -> String {
    ["id", "first_name", "last_name", "age", "dob", "group"]
        .map(|c| format!("(COLUMN {alias} {c})"))
        .join(" ")
}

#[test]
fn test_fk_join_and_where() {
    // s for s in Student if s.group.number == '101'
    let tree = GenExpr {
        expr: Expr::name("s"),
        quals: vec![Qualifier {
            ifs: vec![compare(
                Expr::name("s").getattr("group").getattr("number"),
                CmpOp::Eq,
                string("101"),
            )],
            ..for_in("s", "Student")
        }],
    };
    assert_eq!(
        translate(&tree),
        format!(
            "(SELECT (ALL {}) \
             (FROM (TABLE student s) \
             (TABLE group group-1 (EQ (COLUMN s group) (COLUMN group-1 id)))) \
             (WHERE (EQ (COLUMN group-1 number) (VALUE '101'))))",
            student_cols("s")
        )
    );
}

#[test]
fn test_chained_qualifier_is_distinct() {
    // s for s in Student for m in s.marks if m.value == 5
    let tree = GenExpr {
        expr: Expr::name("s"),
        quals: vec![
            for_in("s", "Student"),
            Qualifier {
                assign: Expr::name("m"),
                iter: Expr::name("s").getattr("marks"),
                ifs: vec![compare(
                    Expr::name("m").getattr("value"),
                    CmpOp::Eq,
                    int(5),
                )],
            },
        ],
    };
    assert_eq!(
        translate(&tree),
        format!(
            "(SELECT (DISTINCT {}) \
             (FROM (TABLE student s) \
             (TABLE mark m (EQ (COLUMN s id) (COLUMN m student)))) \
             (WHERE (EQ (COLUMN m value) (VALUE 5))))",
            student_cols("s")
        )
    );
}

#[test]
fn test_entity_with_correlated_count() {
    // (s, count(s.marks)) for s in Student
    let tree = GenExpr {
        expr: Expr::new(ExprKind::Tuple(vec![
            Expr::name("s"),
            call(ext("count"), vec![Expr::name("s").getattr("marks")]),
        ])),
        quals: vec![for_in("s", "Student")],
    };
    assert_snapshot!(translate(&tree), @"(SELECT (ALL (COLUMN s id) (SELECT (AGGREGATES (COUNT (ALL))) (FROM (TABLE mark mark-1)) (WHERE (EQ (COLUMN s id) (COLUMN mark-1 student))))) (FROM (TABLE student s)))");

    // The row layout has a Student hydrator followed by one scalar.
    let schema = school();
    let vt = vartypes();
    let translator =
        Translator::new(&schema, &tree, Extractors::new(), &vt, Options::default()).unwrap();
    let layout = translator.row_layout().unwrap();
    assert_eq!(layout.len(), 2);
    match (&layout[0], &layout[1]) {
        (
            crate::sql::RowSlot::Entity {
                entity, columns, ..
            },
            crate::sql::RowSlot::Scalar { ty, offset, .. },
        ) => {
            assert_eq!(*entity, STUDENT);
            assert_eq!(columns.clone(), 0..1);
            assert_eq!(*ty, Ty::Int);
            assert_eq!(*offset, 1);
        }
        other => panic!("unexpected row layout: {other:?}"),
    }
    assert!(!translator.aggregated());
}

#[test]
fn test_len_lowered_to_count_subselect() {
    // s for s in Student if len(s.marks) > 3
    let tree = GenExpr {
        expr: Expr::name("s"),
        quals: vec![Qualifier {
            ifs: vec![compare(
                call(ext("len"), vec![Expr::name("s").getattr("marks")]),
                CmpOp::Gt,
                int(3),
            )],
            ..for_in("s", "Student")
        }],
    };
    assert_eq!(
        translate(&tree),
        format!(
            "(SELECT (ALL {}) \
             (FROM (TABLE student s)) \
             (WHERE (GT (SELECT (AGGREGATES (COUNT (ALL))) \
             (FROM (TABLE mark mark-1)) \
             (WHERE (EQ (COLUMN s id) (COLUMN mark-1 student)))) (VALUE 3))))",
            student_cols("s")
        )
    );
}

fn nested_select_bob() -> Expr {
    // select(x for x in Student if x.first_name == 'Bob')
    call(
        ext("select"),
        vec![Expr::new(ExprKind::Comprehension(Box::new(GenExpr {
            expr: Expr::name("x"),
            quals: vec![Qualifier {
                ifs: vec![compare(
                    Expr::name("x").getattr("first_name"),
                    CmpOp::Eq,
                    string("Bob"),
                )],
                ..for_in("x", "Student")
            }],
        })))],
    )
}

#[test]
fn test_entity_in_subquery_uses_in() {
    // s for s in Student if s in select(x for x in Student if ...)
    let tree = GenExpr {
        expr: Expr::name("s"),
        quals: vec![Qualifier {
            ifs: vec![compare(Expr::name("s"), CmpOp::In, nested_select_bob())],
            ..for_in("s", "Student")
        }],
    };
    assert_eq!(
        translate(&tree),
        format!(
            "(SELECT (ALL {}) \
             (FROM (TABLE student s)) \
             (WHERE (IN (COLUMN s id) (SELECT (ALL (COLUMN x id)) \
             (FROM (TABLE student x)) \
             (WHERE (EQ (COLUMN x first_name) (VALUE 'Bob')) \
             (IS_NOT_NULL (COLUMN x id)))))))",
            student_cols("s")
        )
    );
}

#[test]
fn test_row_subquery_without_row_values_uses_exists() {
    // (s.first_name, s.last_name) in select((x.first_name, x.last_name) …)
    // on SQLite, which has no row-value syntax.
    let tree = GenExpr {
        expr: Expr::name("s"),
        quals: vec![Qualifier {
            ifs: vec![compare(
                Expr::new(ExprKind::Tuple(vec![
                    Expr::name("s").getattr("first_name"),
                    Expr::name("s").getattr("last_name"),
                ])),
                CmpOp::In,
                call(
                    ext("select"),
                    vec![Expr::new(ExprKind::Comprehension(Box::new(GenExpr {
                        expr: Expr::new(ExprKind::Tuple(vec![
                            Expr::name("x").getattr("first_name"),
                            Expr::name("x").getattr("last_name"),
                        ])),
                        quals: vec![Qualifier {
                            ifs: vec![compare(
                                Expr::name("x").getattr("age"),
                                CmpOp::Gt,
                                int(20),
                            )],
                            ..for_in("x", "Student")
                        }],
                    })))],
                ),
            )],
            ..for_in("s", "Student")
        }],
    };
    let sql = translate_with(
        &tree,
        Options {
            dialect: Dialect::sqlite(),
            ..Options::default()
        },
    );
    assert!(sql.contains(
        "(EXISTS (FROM (TABLE student x)) \
         (WHERE (GT (COLUMN x age) (VALUE 20)) \
         (EQ (COLUMN s first_name) (COLUMN x first_name)) \
         (EQ (COLUMN s last_name) (COLUMN x last_name))))"
    ));
}

#[test]
fn test_startswith_and_single_column_distinct() {
    // s.first_name for s in Student if s.first_name.startswith('A')
    let tree = GenExpr {
        expr: Expr::name("s").getattr("first_name"),
        quals: vec![Qualifier {
            ifs: vec![call(
                Expr::name("s").getattr("first_name").getattr("startswith"),
                vec![string("A")],
            )],
            ..for_in("s", "Student")
        }],
    };
    assert_snapshot!(translate(&tree), @"(SELECT (DISTINCT (COLUMN s first_name)) (FROM (TABLE student s)) (WHERE (LIKE (COLUMN s first_name) (VALUE 'A%'))))");
}

#[test]
fn test_double_negation_is_eliminated() {
    let plain = GenExpr {
        expr: Expr::name("s"),
        quals: vec![Qualifier {
            ifs: vec![compare(Expr::name("s").getattr("age"), CmpOp::Gt, int(18))],
            ..for_in("s", "Student")
        }],
    };
    let doubled = GenExpr {
        expr: Expr::name("s"),
        quals: vec![Qualifier {
            ifs: vec![Expr::new(ExprKind::Not(Box::new(Expr::new(
                ExprKind::Not(Box::new(compare(
                    Expr::name("s").getattr("age"),
                    CmpOp::Gt,
                    int(18),
                ))),
            ))))],
            ..for_in("s", "Student")
        }],
    };
    assert_eq!(translate(&plain), translate(&doubled));
}

#[test]
fn test_repeated_attribute_joins_once() {
    // s for s in Student if s.group.number == '101' and s.group.number != ''
    let tree = GenExpr {
        expr: Expr::name("s"),
        quals: vec![Qualifier {
            ifs: vec![Expr::new(ExprKind::And(vec![
                compare(
                    Expr::name("s").getattr("group").getattr("number"),
                    CmpOp::Eq,
                    string("101"),
                ),
                compare(
                    Expr::name("s").getattr("group").getattr("number"),
                    CmpOp::Ne,
                    string(""),
                ),
            ]))],
            ..for_in("s", "Student")
        }],
    };
    let schema = school();
    let vt = vartypes();
    let translator =
        Translator::new(&schema, &tree, Extractors::new(), &vt, Options::default()).unwrap();
    // student + one group join, not two
    assert_eq!(translator.from_clause().items.len(), 2);
    assert_eq!(translator.conditions().len(), 2);
}

#[test]
fn test_pk_only_traversal_elides_join() {
    // s.group.id for s in Student: the fk is embedded in the student row
    let tree = GenExpr {
        expr: Expr::name("s").getattr("group").getattr("id"),
        quals: vec![for_in("s", "Student")],
    };
    assert_snapshot!(translate(&tree), @"(SELECT (DISTINCT (COLUMN s group)) (FROM (TABLE student s)))");
}

#[test]
fn test_many_to_many_goes_through_link_table() {
    // c for s in Student for c in s.courses
    let tree = GenExpr {
        expr: Expr::name("c"),
        quals: vec![
            for_in("s", "Student"),
            Qualifier {
                assign: Expr::name("c"),
                iter: Expr::name("s").getattr("courses"),
                ifs: vec![],
            },
        ],
    };
    assert_snapshot!(translate(&tree), @"(SELECT (DISTINCT (COLUMN c id) (COLUMN c name)) (FROM (TABLE student s) (TABLE student_course t-1 (EQ (COLUMN s id) (COLUMN t-1 student))) (TABLE course c (EQ (COLUMN t-1 course) (COLUMN c id)))))");
}

#[test]
fn test_group_by_and_having() {
    // (g.number, count(s)) for g in Group for s in g.students if count(s) > 2
    let tree = GenExpr {
        expr: Expr::new(ExprKind::Tuple(vec![
            Expr::name("g").getattr("number"),
            call(ext("count"), vec![Expr::name("s")]),
        ])),
        quals: vec![
            for_in("g", "Group"),
            Qualifier {
                assign: Expr::name("s"),
                iter: Expr::name("g").getattr("students"),
                ifs: vec![compare(
                    call(ext("count"), vec![Expr::name("s")]),
                    CmpOp::Gt,
                    int(2),
                )],
            },
        ],
    };
    assert_snapshot!(translate(&tree), @"(SELECT (ALL (COLUMN g number) (COUNT (DISTINCT (COLUMN s id)))) (FROM (TABLE group g) (TABLE student s (EQ (COLUMN g id) (COLUMN s group)))) (GROUP_BY (COLUMN g number)) (HAVING (GT (COUNT (DISTINCT (COLUMN s id))) (VALUE 2))))");
}

#[test]
fn test_exists_for_collection_truth() {
    // g for g in Group if g.students
    let tree = GenExpr {
        expr: Expr::name("g"),
        quals: vec![Qualifier {
            ifs: vec![Expr::name("g").getattr("students")],
            ..for_in("g", "Group")
        }],
    };
    assert_snapshot!(translate(&tree), @"(SELECT (ALL (COLUMN g id) (COLUMN g number)) (FROM (TABLE group g)) (WHERE (EXISTS (FROM (TABLE student student-1)) (WHERE (EQ (COLUMN g id) (COLUMN student-1 group))))))");
}

#[test]
fn test_hint_join_materialises_aggregate() {
    // g for g in Group if JOIN(sum(g.students.age)) > 100
    let tree = GenExpr {
        expr: Expr::name("g"),
        quals: vec![Qualifier {
            ifs: vec![compare(
                call(
                    ext("JOIN"),
                    vec![call(
                        ext("sum"),
                        vec![Expr::name("g").getattr("students").getattr("age")],
                    )],
                ),
                CmpOp::Gt,
                int(100),
            )],
            ..for_in("g", "Group")
        }],
    };
    assert_snapshot!(translate(&tree), @"(SELECT (ALL (COLUMN g id) (COLUMN g number)) (FROM (TABLE group g) ((SELECT (ALL (AS (COLUMN student-1 group) group) (AS (SUM (COLUMN student-1 age)) expr-1)) (FROM (TABLE student student-1)) (WHERE (IS_NOT_NULL (COLUMN student-1 age))) (GROUP_BY (COLUMN student-1 group))) t-1 (EQ (COLUMN g id) (COLUMN t-1 group)))) (WHERE (GT (COALESCE (COLUMN t-1 expr-1) (VALUE 0)) (VALUE 100))))");
}

#[test]
fn test_optimize_folds_aggregate_into_outer_query() {
    // count(s.marks) for s in Student, optimized on the traversal
    let tree = GenExpr {
        expr: call(ext("count"), vec![Expr::name("s").getattr("marks")]),
        quals: vec![for_in("s", "Student")],
    };
    let sql = translate_with(
        &tree,
        Options {
            optimize: Some("s-marks".to_string()),
            ..Options::default()
        },
    );
    assert_eq!(
        sql,
        "(SELECT (ALL (COUNT (DISTINCT (COLUMN mark-1 id)))) \
         (FROM (TABLE student s) \
         (TABLE mark mark-1 (EQ (COLUMN s id) (COLUMN mark-1 student)))))"
    );

    // Without the hint the same query reports the candidate path.
    let schema = school();
    let vt = vartypes();
    let translator =
        Translator::new(&schema, &tree, Extractors::new(), &vt, Options::default()).unwrap();
    assert_eq!(translator.can_be_optimized(), Some("s-marks"));
}

#[test]
fn test_count_of_distinct_entity_wraps_query() {
    let tree = GenExpr {
        expr: Expr::name("s"),
        quals: vec![
            for_in("s", "Student"),
            Qualifier {
                assign: Expr::name("m"),
                iter: Expr::name("s").getattr("marks"),
                ifs: vec![compare(
                    Expr::name("m").getattr("value"),
                    CmpOp::Eq,
                    int(5),
                )],
            },
        ],
    };
    let schema = school();
    let vt = vartypes();
    let translator =
        Translator::new(&schema, &tree, Extractors::new(), &vt, Options::default()).unwrap();
    assert!(translator.distinct());
    let (sql, _) = translator
        .construct_sql_ast(None, None, Some(Tag::Count))
        .unwrap();
    assert_snapshot!(sql.to_string(), @"(SELECT (AGGREGATES (COUNT (ALL))) (FROM ((SELECT (DISTINCT (COLUMN s id)) (FROM (TABLE student s) (TABLE mark m (EQ (COLUMN s id) (COLUMN m student)))) (WHERE (EQ (COLUMN m value) (VALUE 5)))) t)))");
}

#[test]
fn test_order_and_limit() {
    let tree = GenExpr {
        expr: Expr::name("s"),
        quals: vec![for_in("s", "Student")],
    };
    let schema = school();
    let vt = vartypes();
    let mut translator =
        Translator::new(&schema, &tree, Extractors::new(), &vt, Options::default()).unwrap();
    translator.order_by(vec![SqlAst::Node(
        Tag::Desc,
        vec![SqlAst::column("s", "age")],
    )]);
    let (sql, offsets) = translator
        .construct_sql_ast(Some((10, 20)), None, None)
        .unwrap();
    let rendered = sql.to_string();
    assert!(rendered.contains("(ORDER_BY (DESC (COLUMN s age)))"));
    assert!(rendered.ends_with("(LIMIT (VALUE 10) (VALUE 10)))"));
    // hydrating select clause reports per-attribute offsets
    let offsets = offsets.unwrap();
    assert_eq!(offsets[0], ("id".to_string(), vec![0]));
    assert_eq!(offsets[5], ("group".to_string(), vec![5]));
}

#[test]
fn test_external_parameter_binding() {
    // s for s in Student if s.age > x
    let tree = GenExpr {
        expr: Expr::name("s"),
        quals: vec![Qualifier {
            ifs: vec![compare(Expr::name("s").getattr("age"), CmpOp::Gt, ext("x"))],
            ..for_in("s", "Student")
        }],
    };
    assert!(translate(&tree).contains("(WHERE (GT (COLUMN s age) (PARAM x)))"));
}

#[test]
fn test_none_comparison_rewrites_to_is_null() {
    let tree = GenExpr {
        expr: Expr::name("s"),
        quals: vec![Qualifier {
            ifs: vec![compare(
                Expr::name("s").getattr("age"),
                CmpOp::Eq,
                Expr::literal(Literal::Null),
            )],
            ..for_in("s", "Student")
        }],
    };
    assert!(translate(&tree).contains("(WHERE (IS_NULL (COLUMN s age)))"));

    let negated = GenExpr {
        expr: Expr::name("s"),
        quals: vec![Qualifier {
            ifs: vec![compare(
                Expr::name("s").getattr("age"),
                CmpOp::Ne,
                Expr::literal(Literal::Null),
            )],
            ..for_in("s", "Student")
        }],
    };
    assert!(translate(&negated).contains("(WHERE (IS_NOT_NULL (COLUMN s age)))"));
}

#[test]
fn test_membership_in_literal_tuple() {
    let tree = GenExpr {
        expr: Expr::name("s"),
        quals: vec![Qualifier {
            ifs: vec![compare(
                Expr::name("s").getattr("age"),
                CmpOp::In,
                Expr::new(ExprKind::Tuple(vec![int(18), int(19), int(20)])),
            )],
            ..for_in("s", "Student")
        }],
    };
    assert!(translate(&tree)
        .contains("(WHERE (IN (COLUMN s age) (VALUE 18) (VALUE 19) (VALUE 20)))"));
}

#[test]
fn test_string_slice_lowered_to_substr() {
    // s for s in Student if s.first_name[0:2] == 'Ab'
    let tree = GenExpr {
        expr: Expr::name("s"),
        quals: vec![Qualifier {
            ifs: vec![compare(
                Expr::new(ExprKind::Subscript {
                    expr: Box::new(Expr::name("s").getattr("first_name")),
                    index: Subscript::Slice {
                        lower: Some(Box::new(int(0))),
                        upper: Some(Box::new(int(2))),
                        step: None,
                    },
                }),
                CmpOp::Eq,
                string("Ab"),
            )],
            ..for_in("s", "Student")
        }],
    };
    assert!(translate(&tree).contains(
        "(WHERE (EQ (SUBSTR (COLUMN s first_name) (VALUE 1) (VALUE 2)) (VALUE 'Ab')))"
    ));
}

#[test]
fn test_date_part_attribute() {
    let tree = GenExpr {
        expr: Expr::name("s"),
        quals: vec![Qualifier {
            ifs: vec![compare(
                Expr::name("s").getattr("dob").getattr("year"),
                CmpOp::Eq,
                int(2000),
            )],
            ..for_in("s", "Student")
        }],
    };
    assert!(translate(&tree).contains("(WHERE (EQ (YEAR (COLUMN s dob)) (VALUE 2000)))"));
}

#[test]
fn test_entity_select_lambda_rewrite() {
    // s for s in Student if s in Student.select(lambda u: u.age > 30)
    let mut vt = vartypes();
    vt.insert(
        "Student.select".to_string(),
        Ty::Method(STUDENT, "select".to_string()),
    );
    let tree = GenExpr {
        expr: Expr::name("s"),
        quals: vec![Qualifier {
            ifs: vec![compare(
                Expr::name("s"),
                CmpOp::In,
                call(
                    Expr::name("Student")
                        .getattr("select")
                        .external("Student.select"),
                    vec![Expr::new(ExprKind::Lambda {
                        params: vec!["u".to_string()],
                        body: Box::new(compare(
                            Expr::name("u").getattr("age"),
                            CmpOp::Gt,
                            int(30),
                        )),
                        varargs: false,
                        kwargs: false,
                    })],
                ),
            )],
            ..for_in("s", "Student")
        }],
    };
    let schema = school();
    let sql = crate::sql::translate(&schema, &tree, &vt, Options::default())
        .unwrap()
        .to_string();
    assert!(sql.contains(
        "(IN (COLUMN s id) (SELECT (ALL (COLUMN u id)) (FROM (TABLE student u)) \
         (WHERE (GT (COLUMN u age) (VALUE 30)) (IS_NOT_NULL (COLUMN u id)))))"
    ));
}

#[test]
fn test_translation_is_deterministic() {
    let tree = GenExpr {
        expr: Expr::name("s"),
        quals: vec![Qualifier {
            ifs: vec![compare(
                Expr::name("s").getattr("group").getattr("number"),
                CmpOp::Eq,
                string("101"),
            )],
            ..for_in("s", "Student")
        }],
    };
    assert_eq!(translate(&tree), translate(&tree));

    let schema = school();
    let vt = vartypes();
    let translator =
        Translator::new(&schema, &tree, Extractors::new(), &vt, Options::default()).unwrap();
    let first = translator.construct_sql_ast(None, None, None).unwrap();
    let second = translator.construct_sql_ast(None, None, None).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_json_round_trip() {
    let tree = GenExpr {
        expr: Expr::name("s"),
        quals: vec![Qualifier {
            ifs: vec![compare(Expr::name("s").getattr("age"), CmpOp::Gt, int(18))],
            ..for_in("s", "Student")
        }],
    };
    let json = crate::json_of_ast(&tree).unwrap();
    let back = crate::ast_of_json(&json).unwrap();
    assert_eq!(tree, back);

    let sql = try_translate(&tree).unwrap();
    let json = crate::json_of_sql(&sql).unwrap();
    let back = crate::sql_of_json(&json).unwrap();
    assert_eq!(sql, back);
}

fn error_kind(tree: &GenExpr) -> ErrorKind {
    let err = try_translate(tree).unwrap_err();
    crate::kind_of(&err)
        .unwrap_or_else(|| panic!("not a translation error: {err}"))
        .clone()
}

#[test]
fn test_duplicate_and_illegal_target_names() {
    let duplicate = GenExpr {
        expr: Expr::name("s"),
        quals: vec![for_in("s", "Student"), for_in("s", "Group")],
    };
    assert!(matches!(error_kind(&duplicate), ErrorKind::Translation(msg) if msg.contains("Duplicate name")));

    let illegal = GenExpr {
        expr: Expr::name("__s"),
        quals: vec![for_in("__s", "Student")],
    };
    assert!(matches!(error_kind(&illegal), ErrorKind::Translation(msg) if msg.contains("Illegal name")));
}

#[test]
fn test_parameter_cannot_be_query_result() {
    let tree = GenExpr {
        expr: ext("x"),
        quals: vec![for_in("s", "Student")],
    };
    assert!(matches!(error_kind(&tree), ErrorKind::Translation(msg) if msg.contains("cannot be used as query result")));
}

#[test]
fn test_incomparable_types_are_reported() {
    let tree = GenExpr {
        expr: Expr::name("s"),
        quals: vec![Qualifier {
            ifs: vec![compare(
                Expr::name("s").getattr("age"),
                CmpOp::Eq,
                string("young"),
            )],
            ..for_in("s", "Student")
        }],
    };
    let err = try_translate(&tree).unwrap_err();
    assert!(matches!(
        crate::kind_of(&err),
        Some(ErrorKind::Incomparable { .. })
    ));
    let message = err.downcast_ref::<crate::Error>().unwrap().to_string();
    assert_eq!(
        message,
        "Incomparable types 'int' and 'unicode' in expression: s.age == 'young'"
    );
}

#[test]
fn test_method_without_call_is_diagnosed() {
    let tree = GenExpr {
        expr: Expr::name("s"),
        quals: vec![Qualifier {
            ifs: vec![compare(
                Expr::name("s").getattr("first_name").getattr("upper"),
                CmpOp::Eq,
                string("A"),
            )],
            ..for_in("s", "Student")
        }],
    };
    assert!(matches!(error_kind(&tree), ErrorKind::Translation(msg) if msg.contains("forgotten parentheses")));
}

#[test]
fn test_cartesian_product_across_sets_is_rejected() {
    // sum over arithmetic between unrelated traversals
    let tree = GenExpr {
        expr: call(
            ext("sum"),
            vec![Expr::new(ExprKind::Binary {
                left: Box::new(Expr::name("s").getattr("marks").getattr("value")),
                op: crate::ast::BinOp::Add,
                right: Box::new(
                    Expr::name("s")
                        .getattr("group")
                        .getattr("students")
                        .getattr("age"),
                ),
            })],
        ),
        quals: vec![for_in("s", "Student")],
    };
    assert!(matches!(error_kind(&tree), ErrorKind::Translation(msg) if msg.contains("Cartesian product")));
}

#[test]
fn test_mixed_aggregation_semantics_are_rejected() {
    // count(s.marks) is an already-grouped subquery, count(s) a plain
    // aggregate; comparing them has no single grouping level.
    let tree = GenExpr {
        expr: Expr::name("s"),
        quals: vec![Qualifier {
            ifs: vec![compare(
                call(ext("count"), vec![Expr::name("s").getattr("marks")]),
                CmpOp::Eq,
                call(ext("count"), vec![Expr::name("s")]),
            )],
            ..for_in("s", "Student")
        }],
    };
    assert!(matches!(error_kind(&tree), ErrorKind::Unsupported(msg) if msg.contains("different semantics")));
}

#[test]
fn test_left_join_rejects_second_collection() {
    let tree = GenExpr {
        expr: Expr::name("s"),
        quals: vec![for_in("s", "Student"), for_in("g", "Group")],
    };
    let schema = school();
    let vt = vartypes();
    let err = crate::sql::translate(
        &schema,
        &tree,
        &vt,
        Options {
            left_join: true,
            ..Options::default()
        },
    )
    .unwrap_err();
    assert!(matches!(
        crate::kind_of(&err),
        Some(ErrorKind::Translation(msg)) if msg.contains("left join")
    ));
}
