//! End-to-end engine tests against a scripted backend.
//!
//! The backend replays canned result sets in order and records every
//! statement it receives, so these tests assert both the SQL the engine
//! emits (statement counts, batching, `= ANY` fan-in) and the shape of the
//! assembled results, without a running database.

use manor::{
    Backend, Column, ColumnType, Filter, FilterValue, Manager, OrmError, OrmResult,
    QuerySetPaginator, Record, RelationKind, Schema, SchemaRegistry, SetFunction, SetFunctions,
    SqlValue, Table, TransactionBackend,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Replays queued result sets in order; `execute` reports the queued set's
/// length as the affected-row count. Reports itself as inside a transaction
/// so multi-statement operations run sequentially and never call `begin`.
#[derive(Default)]
struct ScriptedBackend {
    responses: Mutex<VecDeque<Vec<Record>>>,
    log: Mutex<Vec<(String, usize)>>,
}

impl ScriptedBackend {
    fn new() -> Self {
        Self::default()
    }

    fn push_response(&self, rows: Vec<Record>) {
        self.responses.lock().unwrap().push_back(rows);
    }

    fn statements(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(s, _)| s.clone()).collect()
    }

    fn param_counts(&self) -> Vec<usize> {
        self.log.lock().unwrap().iter().map(|(_, n)| *n).collect()
    }

    fn next_response(&self, sql: &str, params: &[SqlValue]) -> Vec<Record> {
        self.log
            .lock()
            .unwrap()
            .push((sql.to_string(), params.len()));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default()
    }
}

impl Backend for ScriptedBackend {
    async fn fetch_all(&self, sql: &str, params: &[SqlValue]) -> OrmResult<Vec<Record>> {
        Ok(self.next_response(sql, params))
    }

    async fn fetch_one(&self, sql: &str, params: &[SqlValue]) -> OrmResult<Option<Record>> {
        Ok(self.next_response(sql, params).into_iter().next())
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> OrmResult<u64> {
        Ok(self.next_response(sql, params).len() as u64)
    }

    fn in_transaction(&self) -> bool {
        true
    }

    async fn begin(&self) -> OrmResult<TransactionBackend> {
        Err(OrmError::Other("scripted backend cannot begin".to_string()))
    }
}

fn schema() -> Arc<Schema> {
    let users = Table::new("users")
        .column(Column::new("id", ColumnType::BigInt).primary_key())
        .column(Column::new("email", ColumnType::Text).unique())
        .column(Column::new("name", ColumnType::Text))
        .column(Column::new("logins", ColumnType::Int))
        .relation("posts", RelationKind::OneToMany, "posts")
        .relation(
            "groups",
            RelationKind::ManyToMany {
                through: "memberships".to_string(),
            },
            "groups",
        );
    let posts = Table::new("posts")
        .column(Column::new("id", ColumnType::BigInt).primary_key())
        .column(Column::new("author_id", ColumnType::BigInt))
        .column(Column::new("title", ColumnType::Text))
        .foreign_key("author_id", "users", "id")
        .relation("author", RelationKind::OneToOne, "users");
    let groups = Table::new("groups")
        .column(Column::new("id", ColumnType::BigInt).primary_key())
        .column(Column::new("label", ColumnType::Text));
    let memberships = Table::new("memberships")
        .column(Column::new("user_id", ColumnType::BigInt))
        .column(Column::new("group_id", ColumnType::BigInt))
        .foreign_key("user_id", "users", "id")
        .foreign_key("group_id", "groups", "id");

    let mut reg = SchemaRegistry::new();
    for t in [users, posts, groups, memberships] {
        reg.declare(t).unwrap();
    }
    reg.finalize().unwrap()
}

fn user_record(id: i64, name: &str) -> Record {
    let mut rec = Record::from_pairs([("id", id)]);
    rec.set("email", format!("{name}@example.com"));
    rec.set("name", name);
    rec.set("logins", 0_i32);
    rec
}

fn post_record(id: i64, author_id: i64, title: &str) -> Record {
    let mut rec = Record::from_pairs([("id", id)]);
    rec.set("author_id", author_id);
    rec.set("title", title);
    rec
}

#[tokio::test]
async fn create_inserts_and_returns_row() {
    let backend = ScriptedBackend::new();
    backend.push_response(vec![user_record(1, "ada")]);

    let mgr = Manager::new(schema(), "users").unwrap();
    let mut rec = Record::from_pairs([("email", "ada@example.com")]);
    rec.set("name", "ada");
    rec.set("logins", 0_i32);
    let row = mgr.create(&backend, rec).await.unwrap();

    assert_eq!(row.get("id"), Some(&SqlValue::BigInt(1)));
    let stmts = backend.statements();
    assert_eq!(stmts.len(), 1);
    assert_eq!(
        stmts[0],
        "INSERT INTO users (email, name, logins) VALUES ($1, $2, $3) RETURNING *"
    );
}

#[tokio::test]
async fn bulk_insert_batches_and_writes_back_generated_keys() {
    let backend = ScriptedBackend::new();
    // 5 rows with batch size 2 -> 3 statements; each returns generated ids
    // in insertion order.
    backend.push_response(vec![
        Record::from_pairs([("id", 101_i64)]),
        Record::from_pairs([("id", 102_i64)]),
    ]);
    backend.push_response(vec![
        Record::from_pairs([("id", 103_i64)]),
        Record::from_pairs([("id", 104_i64)]),
    ]);
    backend.push_response(vec![Record::from_pairs([("id", 105_i64)])]);

    let mgr = Manager::new(schema(), "users").unwrap();
    let mut rows: Vec<Record> = (0..5)
        .map(|i| {
            let mut rec = Record::from_pairs([("email", format!("u{i}@example.com"))]);
            rec.set("name", format!("u{i}"));
            rec.set("logins", 0_i32);
            rec
        })
        .collect();
    mgr.bulk_insert(&backend, &mut rows, Some(2)).await.unwrap();

    let stmts = backend.statements();
    assert_eq!(stmts.len(), 3);
    assert!(stmts[0].starts_with("INSERT INTO users (email, name, logins) VALUES "));
    assert!(stmts[0].ends_with("RETURNING id"));
    // 2 rows x 3 columns, then 2 x 3, then 1 x 3.
    assert_eq!(backend.param_counts(), vec![6, 6, 3]);

    let ids: Vec<_> = rows.iter().map(|r| r.get("id").cloned()).collect();
    assert_eq!(
        ids,
        vec![
            Some(SqlValue::BigInt(101)),
            Some(SqlValue::BigInt(102)),
            Some(SqlValue::BigInt(103)),
            Some(SqlValue::BigInt(104)),
            Some(SqlValue::BigInt(105)),
        ]
    );
}

#[tokio::test]
async fn bulk_update_sums_affected_counts_across_batches() {
    let backend = ScriptedBackend::new();
    backend.push_response(vec![Record::new(), Record::new()]);
    backend.push_response(vec![Record::new()]);

    let mgr = Manager::new(schema(), "users").unwrap();
    let rows: Vec<Record> = (1..=3_i64)
        .map(|id| {
            let mut rec = Record::from_pairs([("id", id)]);
            rec.set("logins", 5_i32);
            rec
        })
        .collect();
    let mut funcs = SetFunctions::new();
    funcs.insert("logins".to_string(), SetFunction::Increment);
    let affected = mgr
        .bulk_update(&backend, rows, &["id"], &funcs, Some(2))
        .await
        .unwrap();

    assert_eq!(affected, 3);
    let stmts = backend.statements();
    assert_eq!(stmts.len(), 2);
    assert_eq!(
        stmts[0],
        "UPDATE users AS t SET logins = t.logins + v.logins \
         FROM (VALUES ($1::int8, $2::int4), ($3, $4)) AS v(id, logins) \
         WHERE t.id = v.id"
    );
    // Second batch: casts only on the first VALUES row of each statement.
    assert!(stmts[1].contains("(VALUES ($1::int8, $2::int4)) AS v(id, logins)"));
}

#[tokio::test]
async fn prefetch_runs_one_secondary_query_per_relation() {
    let backend = ScriptedBackend::new();
    backend.push_response(vec![user_record(1, "ada"), user_record(2, "bob")]);
    backend.push_response(vec![
        post_record(10, 1, "first"),
        post_record(11, 1, "second"),
    ]);

    let qs = Manager::new(schema(), "users").unwrap().all()
        .unwrap()
        .prefetch_related("posts", None)
        .unwrap();
    let rows = qs.all(&backend).await.unwrap();

    let stmts = backend.statements();
    assert_eq!(stmts.len(), 2);
    assert_eq!(stmts[0], "SELECT * FROM users");
    assert_eq!(stmts[1], "SELECT * FROM posts WHERE author_id = ANY($1)");

    let ada_posts = rows[0].related("posts").unwrap().as_many().unwrap();
    assert_eq!(ada_posts.len(), 2);
    // Fetched-but-empty, never NotFetched.
    assert!(rows[1].related("posts").unwrap().as_many().unwrap().is_empty());
}

#[tokio::test]
async fn many_to_many_prefetch_uses_single_aggregated_query() {
    let backend = ScriptedBackend::new();
    backend.push_response(vec![user_record(1, "ada"), user_record(2, "bob")]);
    let mut group = Record::from_pairs([("id", 7_i64)]);
    group.set("label", "ops");
    group.set(
        "__manor_parent_keys",
        SqlValue::Array(vec![SqlValue::BigInt(1), SqlValue::BigInt(2)]),
    );
    backend.push_response(vec![group]);

    let qs = Manager::new(schema(), "users").unwrap().all()
        .unwrap()
        .prefetch_related("groups", None)
        .unwrap();
    let rows = qs.all(&backend).await.unwrap();

    let stmts = backend.statements();
    assert_eq!(stmts.len(), 2);
    assert!(stmts[1].contains("array_agg(user_id)"));
    assert!(stmts[1].contains("WHERE user_id = ANY($1)"));

    for row in &rows {
        let groups = row.related("groups").unwrap().as_many().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].get("label"), Some(&SqlValue::Text("ops".to_string())));
        assert!(groups[0].get("__manor_parent_keys").is_none());
    }
}

#[tokio::test]
async fn nested_prefetch_recurses_into_secondary_rows() {
    let backend = ScriptedBackend::new();
    backend.push_response(vec![user_record(1, "ada")]);
    backend.push_response(vec![post_record(10, 1, "first")]);
    // The nested hop fetches the post's author back through its own FK.
    backend.push_response(vec![user_record(1, "ada")]);

    let qs = Manager::new(schema(), "users").unwrap().all()
        .unwrap()
        .prefetch_related("posts.author", None)
        .unwrap();
    let rows = qs.all(&backend).await.unwrap();

    assert_eq!(backend.statements().len(), 3);
    let posts = rows[0].related("posts").unwrap().as_many().unwrap();
    let author = posts[0].related("author").unwrap().as_one().unwrap().unwrap();
    assert_eq!(author.get("name"), Some(&SqlValue::Text("ada".to_string())));
}

#[tokio::test]
async fn select_related_assembles_joined_rows_in_one_statement() {
    let backend = ScriptedBackend::new();
    let mut joined = post_record(10, 1, "first");
    joined.set("author.id", 1_i64);
    joined.set("author.email", "ada@example.com");
    joined.set("author.name", "ada");
    joined.set("author.logins", 3_i32);
    let mut orphan = post_record(11, 2, "ghost");
    orphan.set("author.id", SqlValue::Null);
    orphan.set("author.email", SqlValue::Null);
    orphan.set("author.name", SqlValue::Null);
    orphan.set("author.logins", SqlValue::Null);
    backend.push_response(vec![joined, orphan]);

    let qs = Manager::new(schema(), "posts").unwrap().all()
        .unwrap()
        .select_related("author")
        .unwrap();
    let rows = qs.all(&backend).await.unwrap();

    let stmts = backend.statements();
    assert_eq!(stmts.len(), 1);
    assert!(stmts[0].contains("LEFT JOIN users AS \"author\""));

    let author = rows[0].related("author").unwrap().as_one().unwrap().unwrap();
    assert_eq!(author.get("name"), Some(&SqlValue::Text("ada".to_string())));
    // All-NULL joined columns mean the LEFT JOIN matched nothing.
    assert_eq!(rows[1].related("author").unwrap().as_one().unwrap(), None);
}

#[tokio::test]
async fn get_or_create_falls_back_to_fetch_on_conflict() {
    let backend = ScriptedBackend::new();
    // DO NOTHING insert returns no row, then the re-fetch finds the existing one.
    backend.push_response(vec![]);
    backend.push_response(vec![user_record(1, "ada")]);

    let mgr = Manager::new(schema(), "users").unwrap();
    let mut rec = Record::from_pairs([("email", "ada@example.com")]);
    rec.set("name", "ada");
    rec.set("logins", 0_i32);
    let (row, created) = mgr.get_or_create(&backend, rec, None).await.unwrap();

    assert!(!created);
    assert_eq!(row.get("id"), Some(&SqlValue::BigInt(1)));
    let stmts = backend.statements();
    assert_eq!(stmts.len(), 2);
    assert!(stmts[0].contains("ON CONFLICT (email) DO NOTHING RETURNING *"));
    assert!(stmts[1].starts_with("SELECT * FROM users WHERE email = $1"));
}

#[tokio::test]
async fn update_or_create_merges_with_set_functions() {
    let backend = ScriptedBackend::new();
    let mut merged = user_record(1, "ada");
    merged.set("logins", 4_i32);
    backend.push_response(vec![merged]);

    let mgr = Manager::new(schema(), "users").unwrap();
    let mut rec = Record::from_pairs([("email", "ada@example.com")]);
    rec.set("name", "ada");
    rec.set("logins", 1_i32);
    let mut funcs = SetFunctions::new();
    funcs.insert("logins".to_string(), SetFunction::Increment);
    let row = mgr
        .update_or_create(&backend, rec, None, &funcs)
        .await
        .unwrap();

    assert_eq!(row.get("logins"), Some(&SqlValue::Int(4)));
    let stmts = backend.statements();
    assert_eq!(stmts.len(), 1);
    assert!(stmts[0].contains("ON CONFLICT (email) DO UPDATE SET"));
    assert!(stmts[0].contains("logins = users.logins + EXCLUDED.logins"));
}

#[test]
fn raw_shapes_and_relation_fetching_are_exclusive() {
    let qs = Manager::new(schema(), "users").unwrap().all().unwrap();
    let err = qs
        .values_list(["id"])
        .unwrap()
        .prefetch_related("posts", None)
        .unwrap_err();
    assert!(matches!(err, OrmError::InvalidQueryComposition(_)));

    let qs = Manager::new(schema(), "users").unwrap().all().unwrap();
    // posts is to-many: joining it would multiply root rows.
    let err = qs.select_related("posts").unwrap_err();
    assert!(matches!(err, OrmError::InvalidQueryComposition(_)));
}

#[test]
fn build_errors_surface_before_any_statement_runs() {
    let backend = ScriptedBackend::new();

    let qs = Manager::new(schema(), "users").unwrap().all().unwrap();
    let err = qs.filter(Filter::pairs([("nope", 1_i64)])).unwrap_err();
    assert!(matches!(err, OrmError::UnresolvedColumn { .. }));
    assert!(backend.statements().is_empty());
}

#[tokio::test]
async fn paginator_pages_forward_with_overfetch() {
    let backend = ScriptedBackend::new();
    backend.push_response(vec![
        user_record(1, "ada"),
        user_record(2, "bob"),
        user_record(3, "eve"),
    ]);

    let qs = Manager::new(schema(), "users").unwrap().all().unwrap();
    let page = QuerySetPaginator::new(qs, "id")
        .limit(2)
        .start_value(1_i64)
        .page(&backend)
        .await
        .unwrap();

    let stmts = backend.statements();
    assert_eq!(
        stmts[0],
        "SELECT * FROM users WHERE id >= $1 ORDER BY id LIMIT $2"
    );
    assert_eq!(page.results.len(), 2);
    assert_eq!(page.next_cursor, Some(SqlValue::BigInt(3)));
}

#[tokio::test]
async fn values_keyed_maps_rows_by_field() {
    let backend = ScriptedBackend::new();
    backend.push_response(vec![user_record(1, "ada"), user_record(2, "bob")]);

    let qs = Manager::new(schema(), "users").unwrap().all().unwrap();
    let by_id = qs.values_keyed(&backend, &["id"]).await.unwrap();

    assert_eq!(by_id.len(), 2);
    assert_eq!(
        by_id[&SqlValue::BigInt(2)].get("name"),
        Some(&SqlValue::Text("bob".to_string()))
    );
}

#[tokio::test]
async fn values_keyed_collision_keeps_the_later_row() {
    let backend = ScriptedBackend::new();
    // Two rows share id 1; the later one must end up in the map.
    backend.push_response(vec![user_record(1, "ada"), user_record(1, "bob")]);

    let qs = Manager::new(schema(), "users").unwrap().all().unwrap();
    let by_id = qs.values_keyed(&backend, &["id"]).await.unwrap();

    assert_eq!(by_id.len(), 1);
    assert_eq!(
        by_id[&SqlValue::BigInt(1)].get("name"),
        Some(&SqlValue::Text("bob".to_string()))
    );
}

#[tokio::test]
async fn raw_shaped_querysets_refuse_count_and_exists() {
    let backend = ScriptedBackend::new();

    let qs = Manager::new(schema(), "users").unwrap().all().unwrap();
    let err = qs
        .values_list(["name"])
        .unwrap()
        .count(&backend)
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::InvalidQueryComposition(_)));

    let qs = Manager::new(schema(), "users").unwrap().all().unwrap();
    let err = qs
        .values_list(["name"])
        .unwrap()
        .exists(&backend)
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::InvalidQueryComposition(_)));

    assert!(backend.statements().is_empty());
}

#[tokio::test]
async fn update_renders_concat_and_field_expressions() {
    let backend = ScriptedBackend::new();
    backend.push_response(vec![Record::new()]);

    let qs = Manager::new(schema(), "users").unwrap().all()
        .unwrap()
        .filter(Filter::pairs([("id", 1_i64)]))
        .unwrap();
    let affected = qs
        .update(
            &backend,
            vec![(
                "name__concat".to_string(),
                FilterValue::Value(SqlValue::Text("!".to_string())),
            )],
        )
        .await
        .unwrap();

    assert_eq!(affected, 1);
    assert_eq!(
        backend.statements()[0],
        "UPDATE users SET name = name || $1 WHERE id = $2"
    );
}
