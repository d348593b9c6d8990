//! Backup and restore command implementations.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arkiv_backup::schema::SchemaFile;
use arkiv_backup::{
    BackupEngine, EngineSettings, InMemoryMigrationRegistry, JobContext, JsonStreamSink,
    RestoreJob, Restorer, Schema, helpers,
};
use arkiv_drivers::{Connection, ConnectionConfig, DriverRegistry};

use crate::{Cli, Commands};

pub async fn run(cli: Cli) -> Result<()> {
    let settings = match &cli.settings {
        Some(path) => EngineSettings::load(path)?,
        None => EngineSettings::default(),
    };

    match cli.command {
        Commands::Backup {
            database,
            schema,
            activity_id,
            course_module_id,
            no_user_data,
            output,
            gzip,
        } => {
            let schema = load_schema(&schema, &settings)?;
            let mut job = JobContext::new(activity_id, course_module_id);
            if no_user_data || !settings.backup.include_user_data {
                job = job.without_user_data();
            }
            backup(
                &database,
                &schema,
                &job,
                output.as_deref(),
                gzip,
                settings.backup.pretty_json,
            )
            .await
        }
        Commands::Restore {
            database,
            schema,
            input,
            course_module_id,
            no_user_data,
            mappings,
            save_mappings,
        } => {
            let schema = load_schema(&schema, &settings)?;
            let mut job = RestoreJob::new();
            if let Some(id) = course_module_id {
                job = job.with_course_module(id);
            }
            if no_user_data {
                job = job.without_user_data();
            }
            let mut registry = match &mappings {
                Some(path) => load_mappings(path)?,
                None => InMemoryMigrationRegistry::new(),
            };

            restore(&database, &schema, &input, &job, &settings, &mut registry).await?;

            if let Some(path) = save_mappings {
                let text = registry.to_toml_string()?;
                std::fs::write(&path, text)
                    .with_context(|| format!("failed to write {}", path.display()))?;
            }
            Ok(())
        }
    }
}

async fn backup(
    database: &Path,
    schema: &Schema,
    job: &JobContext,
    output: Option<&Path>,
    gzip: bool,
    pretty: bool,
) -> Result<()> {
    let engine = BackupEngine::new(connect(database).await?);

    let writer: Box<dyn Write + Send> = match output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout()),
    };
    let mut writer = BufWriter::new(writer);

    let report = if gzip || pretty {
        let (document, report) = engine.backup_document(schema, job).await?;
        let bytes = if gzip {
            helpers::to_json_compressed(&document)?
        } else {
            helpers::to_json(&document)?.into_bytes()
        };
        writer.write_all(&bytes)?;
        report
    } else {
        let mut sink = JsonStreamSink::new(&mut writer);
        engine.backup(schema, job, &mut sink).await?
    };
    writer.flush()?;

    eprintln!(
        "Backed up {} records ({} referenced ids, {} file areas)",
        report.total_records(),
        report.id_references,
        report.file_areas
    );
    for path in &report.pruned {
        eprintln!("  skipped user data: {path}");
    }
    Ok(())
}

async fn restore(
    database: &Path,
    schema: &Schema,
    input: &Path,
    job: &RestoreJob,
    settings: &EngineSettings,
    registry: &mut InMemoryMigrationRegistry,
) -> Result<()> {
    let bytes = std::fs::read(input).with_context(|| format!("failed to read {}", input.display()))?;
    let document = helpers::read_document(&bytes)
        .with_context(|| format!("invalid backup document {}", input.display()))?;

    let restorer = Restorer::new(connect(database).await?).with_options(settings.restore.clone());
    let result = restorer.restore(schema, &document, job, registry).await?;

    for warning in &result.warnings {
        tracing::warn!(
            element = %warning.element,
            attribute = ?warning.attribute,
            kind = ?warning.kind,
            "{}",
            warning.message
        );
    }

    match result.activity_id {
        Some(id) => println!("Restored activity {id}"),
        None => println!("Restored activity"),
    }
    println!(
        "  {} rows written, {} records dropped, {} warnings",
        result.total_rows(),
        result.records_dropped,
        result.warnings.len()
    );
    Ok(())
}

fn load_schema(path: &Path, settings: &EngineSettings) -> Result<Schema> {
    let file =
        SchemaFile::load(path).with_context(|| format!("failed to load {}", path.display()))?;
    Ok(file.build(&settings.table_prefix)?)
}

fn load_mappings(path: &Path) -> Result<InMemoryMigrationRegistry> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(InMemoryMigrationRegistry::from_toml_str(&text)?)
}

async fn connect(path: &Path) -> Result<Arc<dyn Connection>> {
    let config = ConnectionConfig::new_sqlite(&path.to_string_lossy());
    DriverRegistry::with_defaults()
        .connect(&config)
        .await
        .with_context(|| format!("failed to open {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arkiv_backup::MigrationRegistry;
    use arkiv_drivers::Value;
    use arkiv_drivers::sqlite::SqliteConnection;
    use clap::Parser;

    const TABLES: &str = r#"
        CREATE TABLE mdl_studentquiz (
            id INTEGER PRIMARY KEY AUTOINCREMENT, coursemodule INTEGER NOT NULL,
            name TEXT NOT NULL, intro TEXT, grade INTEGER NOT NULL DEFAULT 0);
        CREATE TABLE mdl_studentquiz_question (
            id INTEGER PRIMARY KEY AUTOINCREMENT, studentquizid INTEGER NOT NULL,
            questionid INTEGER NOT NULL, state TEXT NOT NULL, groupid INTEGER);
        CREATE TABLE mdl_studentquiz_attempt (
            id INTEGER PRIMARY KEY AUTOINCREMENT, studentquizid INTEGER NOT NULL,
            userid INTEGER NOT NULL, categoryid INTEGER);
        CREATE TABLE mdl_studentquiz_comment (
            id INTEGER PRIMARY KEY AUTOINCREMENT, studentquizquestionid INTEGER NOT NULL,
            comment TEXT, parentid INTEGER NOT NULL DEFAULT 0, userid INTEGER NOT NULL,
            usermodified INTEGER, created INTEGER NOT NULL);
        CREATE TABLE mdl_studentquiz_comment_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT, commentid INTEGER NOT NULL, content TEXT,
            userid INTEGER NOT NULL, action INTEGER NOT NULL, timemodified INTEGER NOT NULL);
        CREATE TABLE mdl_studentquiz_progress (
            id INTEGER PRIMARY KEY AUTOINCREMENT, studentquizquestionid INTEGER NOT NULL,
            userid INTEGER NOT NULL, studentquizid INTEGER NOT NULL,
            lastanswercorrect INTEGER NOT NULL, attempts INTEGER NOT NULL,
            correctattempts INTEGER NOT NULL);
        CREATE TABLE mdl_studentquiz_rate (
            id INTEGER PRIMARY KEY AUTOINCREMENT, studentquizquestionid INTEGER NOT NULL,
            userid INTEGER NOT NULL, rate INTEGER NOT NULL);
    "#;

    const SEED: &str = r#"
        INSERT INTO mdl_studentquiz VALUES (42, 5, 'Week 1', 'Try @@question:7@@', 10);
        INSERT INTO mdl_studentquiz_question VALUES (1, 42, 7, 'approved', NULL);
        INSERT INTO mdl_studentquiz_attempt VALUES (1, 42, 100, NULL);
        INSERT INTO mdl_studentquiz_comment VALUES (4, 1, 'Reply', 3, 100, NULL, 1001);
        INSERT INTO mdl_studentquiz_comment VALUES (3, 1, 'Question?', 0, 100, NULL, 1000);
        INSERT INTO mdl_studentquiz_progress VALUES (6, 1, 100, 42, 1, 2, 1);
        INSERT INTO mdl_studentquiz_rate VALUES (8, 1, 100, 4);
    "#;

    fn schema_path() -> String {
        format!("{}/schemas/studentquiz.toml", env!("CARGO_MANIFEST_DIR"))
    }

    async fn create_database(path: &Path, seed: bool) -> SqliteConnection {
        let conn = SqliteConnection::open(&path.to_string_lossy()).unwrap();
        conn.execute_batch(TABLES).await.unwrap();
        if seed {
            conn.execute_batch(SEED).await.unwrap();
        }
        conn
    }

    async fn integers(conn: &SqliteConnection, sql: &str) -> Vec<Value> {
        let result = conn.query(sql, &[]).await.unwrap();
        result
            .rows
            .iter()
            .map(|row| row.get(0).cloned().unwrap_or(Value::Null))
            .collect()
    }

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("arkiv").chain(args.iter().copied())).unwrap()
    }

    #[tokio::test]
    async fn test_backup_then_restore_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = |name: &str| dir.path().join(name).to_string_lossy().into_owned();

        std::fs::write(path("settings.toml"), "table_prefix = \"mdl_\"\n").unwrap();
        std::fs::write(path("mappings.toml"), "[user]\n100 = 1100\n\n[question]\n7 = 107\n")
            .unwrap();
        create_database(Path::new(&path("source.db")), true).await;
        let target = create_database(Path::new(&path("target.db")), false).await;

        run(cli(&[
            "--settings",
            &path("settings.toml"),
            "backup",
            "--database",
            &path("source.db"),
            "--schema",
            &schema_path(),
            "--activity-id",
            "42",
            "--course-module-id",
            "5",
            "--gzip",
            "--output",
            &path("quiz.json.gz"),
        ]))
        .await
        .unwrap();

        run(cli(&[
            "--settings",
            &path("settings.toml"),
            "restore",
            "--database",
            &path("target.db"),
            "--schema",
            &schema_path(),
            "--course-module-id",
            "9",
            "--mappings",
            &path("mappings.toml"),
            "--save-mappings",
            &path("saved.toml"),
            &path("quiz.json.gz"),
        ]))
        .await
        .unwrap();

        assert_eq!(
            integers(&target, "SELECT coursemodule FROM mdl_studentquiz").await,
            vec![Value::Integer(9)]
        );
        assert_eq!(
            integers(&target, "SELECT questionid FROM mdl_studentquiz_question").await,
            vec![Value::Integer(107)]
        );
        assert_eq!(
            integers(&target, "SELECT userid FROM mdl_studentquiz_attempt").await,
            vec![Value::Integer(1100)]
        );
        // Replies point at the restored parent
        assert_eq!(
            integers(
                &target,
                "SELECT parentid FROM mdl_studentquiz_comment ORDER BY created"
            )
            .await,
            vec![Value::Integer(0), Value::Integer(1)]
        );

        // Composite-keyed progress is linked to the new quiz and question
        assert_eq!(
            integers(&target, "SELECT studentquizquestionid FROM mdl_studentquiz_progress").await,
            vec![Value::Integer(1)]
        );
        assert_eq!(
            integers(&target, "SELECT userid FROM mdl_studentquiz_progress").await,
            vec![Value::Integer(1100)]
        );
        assert_eq!(
            integers(&target, "SELECT studentquizid FROM mdl_studentquiz_progress").await,
            vec![Value::Integer(1)]
        );
        assert_eq!(
            integers(&target, "SELECT rate FROM mdl_studentquiz_rate WHERE userid = 1100").await,
            vec![Value::Integer(4)]
        );

        let saved = load_mappings(Path::new(&path("saved.toml"))).unwrap();
        assert_eq!(saved.get("user", 100), Some(1100));
        assert_eq!(saved.get("studentquiz", 42), Some(1));
        assert_eq!(saved.get("studentquiz_comment", 4), Some(2));
    }

    #[tokio::test]
    async fn test_restore_rejects_missing_document() {
        let dir = tempfile::tempdir().unwrap();
        let database = dir.path().join("target.db");
        create_database(&database, false).await;
        let missing = dir.path().join("missing.json");

        let err = run(cli(&[
            "restore",
            "--database",
            &database.to_string_lossy(),
            "--schema",
            &schema_path(),
            &missing.to_string_lossy(),
        ]))
        .await
        .unwrap_err();
        assert!(err.to_string().starts_with("failed to read"));
    }
}
