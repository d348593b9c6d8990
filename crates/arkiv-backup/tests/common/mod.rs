//! Shared student quiz fixture for the integration tests
#![allow(dead_code)]

use std::sync::Arc;

use arkiv_backup::schema::{ContextVar, ReferencePolicy};
use arkiv_backup::{InMemoryMigrationRegistry, MigrationRegistry, Schema, SchemaBuilder};
use arkiv_drivers::sqlite::SqliteConnection;
use arkiv_drivers::{Connection, Value};

pub const TABLE_PREFIX: &str = "mdl_";

const DDL: &str = r#"
CREATE TABLE mdl_studentquiz (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    coursemodule INTEGER NOT NULL,
    name TEXT NOT NULL,
    intro TEXT,
    grade INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE mdl_studentquiz_question (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    studentquizid INTEGER NOT NULL,
    questionid INTEGER NOT NULL,
    state TEXT NOT NULL,
    groupid INTEGER
);
CREATE TABLE mdl_studentquiz_attempt (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    studentquizid INTEGER NOT NULL,
    userid INTEGER NOT NULL,
    categoryid INTEGER
);
CREATE TABLE mdl_studentquiz_comment (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    studentquizquestionid INTEGER NOT NULL,
    comment TEXT,
    parentid INTEGER NOT NULL DEFAULT 0,
    userid INTEGER NOT NULL,
    usermodified INTEGER,
    created INTEGER NOT NULL
);
CREATE TABLE mdl_studentquiz_comment_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    commentid INTEGER NOT NULL,
    content TEXT,
    userid INTEGER NOT NULL,
    action INTEGER NOT NULL,
    timemodified INTEGER NOT NULL
);
CREATE TABLE mdl_studentquiz_progress (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    studentquizquestionid INTEGER,
    userid INTEGER NOT NULL,
    studentquizid INTEGER NOT NULL,
    lastanswercorrect INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    correctattempts INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE mdl_studentquiz_rate (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    studentquizquestionid INTEGER NOT NULL,
    userid INTEGER NOT NULL,
    rate INTEGER NOT NULL
);
"#;

/// Two activities; 42 is the one the tests back up.
///
/// Comments of activity 42, in `ORDER BY parentid, id` order:
/// 10 (top level), 11 (top level, written by unknown user 999),
/// 2 (replies to 9, which comes later), 9 (replies to 10).
///
/// Progress rows have no id of their own and are keyed by question and user;
/// in key order they are 1, 3, 2.
const SEED: &str = r#"
INSERT INTO mdl_studentquiz (id, coursemodule, name, intro, grade)
    VALUES (42, 5, 'Week 1', '<p>Start with @@question:7@@</p>', 10);
INSERT INTO mdl_studentquiz (id, coursemodule, name, intro, grade)
    VALUES (43, 6, 'Week 2', NULL, 0);

INSERT INTO mdl_studentquiz_question (id, studentquizid, questionid, state, groupid)
    VALUES (1, 42, 7, 'approved', NULL);
INSERT INTO mdl_studentquiz_question (id, studentquizid, questionid, state, groupid)
    VALUES (2, 42, 8, 'new', 3);
INSERT INTO mdl_studentquiz_question (id, studentquizid, questionid, state, groupid)
    VALUES (3, 43, 9, 'new', NULL);

INSERT INTO mdl_studentquiz_attempt (id, studentquizid, userid, categoryid) VALUES (1, 42, 100, 50);
INSERT INTO mdl_studentquiz_attempt (id, studentquizid, userid, categoryid) VALUES (2, 42, 101, 50);
INSERT INTO mdl_studentquiz_attempt (id, studentquizid, userid, categoryid) VALUES (3, 43, 100, 51);

INSERT INTO mdl_studentquiz_comment (id, studentquizquestionid, comment, parentid, userid, usermodified, created)
    VALUES (10, 1, 'See @@question:8@@', 0, 100, NULL, 1000);
INSERT INTO mdl_studentquiz_comment (id, studentquizquestionid, comment, parentid, userid, usermodified, created)
    VALUES (11, 2, 'Ghost', 0, 999, NULL, 1001);
INSERT INTO mdl_studentquiz_comment (id, studentquizquestionid, comment, parentid, userid, usermodified, created)
    VALUES (2, 2, 'Reply to reply', 9, 100, 101, 1003);
INSERT INTO mdl_studentquiz_comment (id, studentquizquestionid, comment, parentid, userid, usermodified, created)
    VALUES (9, 1, 'Reply', 10, 101, NULL, 1002);
INSERT INTO mdl_studentquiz_comment (id, studentquizquestionid, comment, parentid, userid, usermodified, created)
    VALUES (12, 3, 'Other quiz', 0, 100, NULL, 1004);

INSERT INTO mdl_studentquiz_comment_history (id, commentid, content, userid, action, timemodified)
    VALUES (1, 10, 'First', 100, 0, 1000);
INSERT INTO mdl_studentquiz_comment_history (id, commentid, content, userid, action, timemodified)
    VALUES (2, 11, 'Ghost', 999, 0, 1001);
INSERT INTO mdl_studentquiz_comment_history (id, commentid, content, userid, action, timemodified)
    VALUES (3, 9, 'Reply', 101, 0, 1002);

INSERT INTO mdl_studentquiz_progress
    (id, studentquizquestionid, userid, studentquizid, lastanswercorrect, attempts, correctattempts)
    VALUES (1, 1, 100, 42, 1, 2, 1);
INSERT INTO mdl_studentquiz_progress
    (id, studentquizquestionid, userid, studentquizid, lastanswercorrect, attempts, correctattempts)
    VALUES (2, 2, 100, 42, 0, 1, 0);
INSERT INTO mdl_studentquiz_progress
    (id, studentquizquestionid, userid, studentquizid, lastanswercorrect, attempts, correctattempts)
    VALUES (3, 1, 101, 42, 1, 3, 3);
INSERT INTO mdl_studentquiz_progress
    (id, studentquizquestionid, userid, studentquizid, lastanswercorrect, attempts, correctattempts)
    VALUES (4, 3, 100, 43, 0, 1, 0);

INSERT INTO mdl_studentquiz_rate (id, studentquizquestionid, userid, rate) VALUES (1, 1, 101, 5);
INSERT INTO mdl_studentquiz_rate (id, studentquizquestionid, userid, rate) VALUES (2, 2, 100, 3);
INSERT INTO mdl_studentquiz_rate (id, studentquizquestionid, userid, rate) VALUES (3, 3, 100, 4);
"#;

pub const ACTIVITY_ID: i64 = 42;
pub const COURSE_MODULE_ID: i64 = 5;

/// Empty database with the student quiz tables.
pub async fn empty_database() -> Arc<SqliteConnection> {
    let conn = SqliteConnection::open_in_memory().expect("open in-memory database");
    conn.execute_batch(DDL).await.expect("create tables");
    Arc::new(conn)
}

/// Database holding activities 42 and 43.
pub async fn seeded_database() -> Arc<SqliteConnection> {
    let conn = empty_database().await;
    conn.execute_batch(SEED).await.expect("seed data");
    conn
}

/// Mappings for the entities restored outside the activity.
pub fn site_registry() -> InMemoryMigrationRegistry {
    let mut registry = InMemoryMigrationRegistry::new();
    for (old, new) in [(100, 1100), (101, 1101)] {
        registry.put("user", old, new).expect("user mapping");
    }
    for (old, new) in [(7, 107), (8, 108), (9, 109)] {
        registry.put("question", old, new).expect("question mapping");
    }
    registry
}

pub fn studentquiz_schema() -> Schema {
    let mut b = SchemaBuilder::new().with_table_prefix(TABLE_PREFIX);

    let quiz = b.element("studentquiz");
    b.define_keys(quiz, ["id"]).unwrap();
    b.define_data(quiz, ["coursemodule", "name", "intro", "grade"])
        .unwrap();
    b.bind_table(
        quiz,
        "studentquiz",
        [
            ("id", ContextVar::ActivityId),
            ("coursemodule", ContextVar::ModuleId),
        ],
    )
    .unwrap();
    b.id_mapping(quiz, "id", "studentquiz").unwrap();
    b.annotate_files(quiz, "mod_studentquiz", "intro", None)
        .unwrap();

    let questions = b.element("questions");
    b.add_child(quiz, questions).unwrap();
    let question = b.element("question");
    b.add_child(questions, question).unwrap();
    b.define_keys(question, ["id"]).unwrap();
    b.define_data(question, ["studentquizid", "questionid", "state", "groupid"])
        .unwrap();
    b.bind_query(
        question,
        "SELECT * FROM {studentquiz_question} WHERE studentquizid = :studentquizid ORDER BY id",
        [("studentquizid", ContextVar::ParentId)],
    )
    .unwrap();
    b.restore_table(question, "studentquiz_question").unwrap();
    b.id_mapping(question, "id", "studentquiz_question").unwrap();
    b.annotate_ids(question, "questionid", "question").unwrap();
    b.annotate_ids_with(question, "groupid", "group", ReferencePolicy::optional_null())
        .unwrap();

    let attempts = b.element("attempts");
    b.add_child(quiz, attempts).unwrap();
    b.mark_user_data(attempts).unwrap();
    let attempt = b.element("attempt");
    b.add_child(attempts, attempt).unwrap();
    b.define_keys(attempt, ["id"]).unwrap();
    b.define_data(attempt, ["studentquizid", "userid", "categoryid"])
        .unwrap();
    b.bind_table(
        attempt,
        "studentquiz_attempt",
        [("studentquizid", ContextVar::ParentId)],
    )
    .unwrap();
    b.id_mapping(attempt, "id", "studentquiz_attempt").unwrap();
    b.annotate_ids(attempt, "userid", "user").unwrap();

    let comments = b.element("comments");
    b.add_child(quiz, comments).unwrap();
    b.mark_user_data(comments).unwrap();
    let comment = b.element("comment");
    b.add_child(comments, comment).unwrap();
    b.define_keys(comment, ["id"]).unwrap();
    b.define_data(
        comment,
        [
            "studentquizquestionid",
            "comment",
            "parentid",
            "userid",
            "usermodified",
            "created",
        ],
    )
    .unwrap();
    b.bind_query(
        comment,
        "SELECT c.* FROM {studentquiz_comment} c \
         JOIN {studentquiz_question} q ON q.id = c.studentquizquestionid \
         WHERE q.studentquizid = :studentquizid \
         ORDER BY c.parentid, c.id",
        [("studentquizid", ContextVar::ParentId)],
    )
    .unwrap();
    b.restore_table(comment, "studentquiz_comment").unwrap();
    b.id_mapping(comment, "id", "studentquiz_comment").unwrap();
    b.annotate_ids(comment, "studentquizquestionid", "studentquiz_question")
        .unwrap();
    b.annotate_ids(comment, "userid", "user").unwrap();
    b.annotate_ids_with(comment, "usermodified", "user", ReferencePolicy::optional_null())
        .unwrap();
    b.annotate_ids_with(
        comment,
        "parentid",
        "studentquiz_comment",
        ReferencePolicy::optional(0),
    )
    .unwrap();
    b.annotate_files(comment, "mod_studentquiz", "comment", Some("id"))
        .unwrap();

    let history = b.element("comment_history");
    b.add_child(comment, history).unwrap();
    b.define_keys(history, ["id"]).unwrap();
    b.define_data(
        history,
        ["commentid", "content", "userid", "action", "timemodified"],
    )
    .unwrap();
    b.bind_table(
        history,
        "studentquiz_comment_history",
        [("commentid", ContextVar::ParentId)],
    )
    .unwrap();
    b.id_mapping(history, "id", "studentquiz_comment_history")
        .unwrap();
    b.annotate_ids(history, "userid", "user").unwrap();

    // Composite keys; the filter column is not an attribute
    let progresses = b.element("progresses");
    b.add_child(quiz, progresses).unwrap();
    b.mark_user_data(progresses).unwrap();
    let progress = b.element("progress");
    b.add_child(progresses, progress).unwrap();
    b.define_keys(progress, ["studentquizquestionid", "userid"])
        .unwrap();
    b.define_data(progress, ["lastanswercorrect", "attempts", "correctattempts"])
        .unwrap();
    b.bind_table(
        progress,
        "studentquiz_progress",
        [("studentquizid", ContextVar::ParentId)],
    )
    .unwrap();
    b.annotate_ids(progress, "studentquizquestionid", "studentquiz_question")
        .unwrap();
    b.annotate_ids(progress, "userid", "user").unwrap();

    let rates = b.element("rates");
    b.add_child(quiz, rates).unwrap();
    b.mark_user_data(rates).unwrap();
    let rate = b.element("rate");
    b.add_child(rates, rate).unwrap();
    b.define_keys(rate, ["userid", "studentquizquestionid"])
        .unwrap();
    b.define_data(rate, ["rate"]).unwrap();
    b.bind_query(
        rate,
        "SELECT r.* FROM {studentquiz_rate} r \
         JOIN {studentquiz_question} q ON q.id = r.studentquizquestionid \
         WHERE q.studentquizid = :studentquizid \
         ORDER BY r.id",
        [("studentquizid", ContextVar::ParentId)],
    )
    .unwrap();
    b.restore_table(rate, "studentquiz_rate").unwrap();
    b.annotate_ids(rate, "userid", "user").unwrap();
    b.annotate_ids(rate, "studentquizquestionid", "studentquiz_question")
        .unwrap();

    b.build().expect("student quiz schema")
}

/// All rows of a table as `(column, value)` lists, ordered by id.
pub async fn rows(conn: &SqliteConnection, table: &str) -> Vec<Vec<(String, Value)>> {
    let sql = format!("SELECT * FROM {}{} ORDER BY id", TABLE_PREFIX, table);
    let result = conn.query(&sql, &[]).await.expect("select rows");
    result
        .rows
        .iter()
        .map(|row| {
            row.columns()
                .iter()
                .cloned()
                .zip(row.values.iter().cloned())
                .collect()
        })
        .collect()
}

/// One column of every row of a table, ordered by id.
pub async fn column(conn: &SqliteConnection, table: &str, column: &str) -> Vec<Value> {
    let sql = format!(
        "SELECT \"{}\" FROM {}{} ORDER BY id",
        column, TABLE_PREFIX, table
    );
    let result = conn.query(&sql, &[]).await.expect("select column");
    result
        .rows
        .iter()
        .map(|row| row.get(0).cloned().unwrap_or(Value::Null))
        .collect()
}
