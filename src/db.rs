use rusqlite::Connection;
use std::path::Path;
use uuid::Uuid;

pub const DB_FILE_NAME: &str = "enroll.sqlite3";

const DEFAULT_EVALUATION_TYPES: [&str; 4] = ["Exam", "Quiz", "Homework", "Project"];

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            email TEXT,
            role TEXT NOT NULL,
            active INTEGER NOT NULL,
            created_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_role ON users(role)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            credits INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sections(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            period TEXT NOT NULL,
            day TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            capacity INTEGER NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(teacher_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_course ON sections(course_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_teacher ON sections(teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_period ON sections(period)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            section_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            enrolled_at TEXT,
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(student_id) REFERENCES users(id),
            UNIQUE(section_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_section ON enrollments(section_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluation_types(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluations(
            id TEXT PRIMARY KEY,
            section_id TEXT NOT NULL,
            evaluation_type_id TEXT NOT NULL,
            title TEXT NOT NULL,
            weight_percent INTEGER NOT NULL,
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(evaluation_type_id) REFERENCES evaluation_types(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evaluations_section ON evaluations(section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            evaluation_id TEXT NOT NULL,
            enrollment_id TEXT NOT NULL,
            score REAL NOT NULL,
            graded_at TEXT,
            FOREIGN KEY(evaluation_id) REFERENCES evaluations(id),
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            UNIQUE(evaluation_id, enrollment_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_evaluation ON grades(evaluation_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_enrollment ON grades(enrollment_id)",
        [],
    )?;

    // Existing workspaces may predate the timestamp columns. Add if needed.
    ensure_users_created_at(&conn)?;
    ensure_enrollments_enrolled_at(&conn)?;
    ensure_grades_graded_at(&conn)?;

    seed_evaluation_types(&conn)?;

    Ok(conn)
}

fn ensure_users_created_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "users", "created_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE users ADD COLUMN created_at TEXT", [])?;
    Ok(())
}

fn ensure_enrollments_enrolled_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "enrollments", "enrolled_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE enrollments ADD COLUMN enrolled_at TEXT", [])?;
    Ok(())
}

fn ensure_grades_graded_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "grades", "graded_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE grades ADD COLUMN graded_at TEXT", [])?;
    Ok(())
}

fn seed_evaluation_types(conn: &Connection) -> anyhow::Result<()> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM evaluation_types", [], |r| r.get(0))?;
    if count > 0 {
        return Ok(());
    }
    for name in DEFAULT_EVALUATION_TYPES {
        conn.execute(
            "INSERT INTO evaluation_types(id, name) VALUES(?, ?)",
            (Uuid::new_v4().to_string(), name),
        )?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
