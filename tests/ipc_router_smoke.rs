use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_enrolld");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn enrolld");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn result_str(value: &serde_json::Value, key: &str) -> String {
    value
        .get("result")
        .and_then(|v| v.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing result.{} in {}", key, value))
        .to_string()
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("enrolld-router-smoke");
    let bundle_out = workspace.join("smoke-backup.enrollbackup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let admin = request(
        &mut stdin,
        &mut reader,
        "3",
        "users.create",
        json!({ "lastName": "Smoke", "firstName": "Admin", "role": "admin" }),
    );
    let admin_id = result_str(&admin, "userId");
    let teacher = request(
        &mut stdin,
        &mut reader,
        "4",
        "users.create",
        json!({ "lastName": "Smoke", "firstName": "Teacher", "role": "teacher" }),
    );
    let teacher_id = result_str(&teacher, "userId");
    let student = request(
        &mut stdin,
        &mut reader,
        "5",
        "users.create",
        json!({ "lastName": "Smoke", "firstName": "Student", "role": "student" }),
    );
    let student_id = result_str(&student, "userId");

    let _ = request(
        &mut stdin,
        &mut reader,
        "6",
        "session.open",
        json!({ "userId": admin_id }),
    );
    let _ = request(&mut stdin, &mut reader, "7", "session.current", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "users.list",
        json!({ "role": "student" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "8b",
        "users.update",
        json!({ "userId": student_id, "patch": { "firstName": "Updated" } }),
    );

    let course = request(
        &mut stdin,
        &mut reader,
        "9",
        "courses.create",
        json!({ "code": "MATH-101", "name": "Calculus I", "credits": 4 }),
    );
    let course_id = result_str(&course, "courseId");
    let _ = request(&mut stdin, &mut reader, "10", "courses.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "10b",
        "courses.update",
        json!({ "courseId": course_id, "patch": { "name": "Calculus I (Honors)" } }),
    );

    let section = request(
        &mut stdin,
        &mut reader,
        "11",
        "sections.create",
        json!({
            "courseId": course_id,
            "teacherId": teacher_id,
            "period": "2026-I",
            "day": "Monday",
            "startTime": "08:00",
            "endTime": "10:00",
            "capacity": 30
        }),
    );
    let section_id = result_str(&section, "sectionId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "sections.list",
        json!({ "period": "2026-I" }),
    );

    let types = request(
        &mut stdin,
        &mut reader,
        "13",
        "evaluationTypes.list",
        json!({}),
    );
    let type_id = types
        .get("result")
        .and_then(|v| v.get("evaluationTypes"))
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|t| t.get("id"))
        .and_then(|v| v.as_str())
        .expect("seeded evaluation type")
        .to_string();

    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "evaluations.checkWeight",
        json!({ "sectionId": section_id, "weightPercent": 100 }),
    );
    let evaluation = request(
        &mut stdin,
        &mut reader,
        "15",
        "evaluations.create",
        json!({
            "sectionId": section_id,
            "evaluationTypeId": type_id,
            "title": "Midterm",
            "weightPercent": 100
        }),
    );
    let evaluation_id = result_str(&evaluation, "evaluationId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "16",
        "evaluations.list",
        json!({ "sectionId": section_id }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "17",
        "enrollment.check",
        json!({ "studentId": student_id, "sectionId": section_id }),
    );
    let enrollment = request(
        &mut stdin,
        &mut reader,
        "18",
        "enrollments.create",
        json!({ "studentId": student_id, "sectionId": section_id }),
    );
    let enrollment_id = result_str(&enrollment, "enrollmentId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "19",
        "enrollments.listByStudent",
        json!({ "studentId": student_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "20",
        "enrollments.listBySection",
        json!({ "sectionId": section_id }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "21",
        "grades.upsert",
        json!({
            "evaluationId": evaluation_id,
            "enrollmentId": enrollment_id,
            "score": 85.5
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "22",
        "grades.listByEnrollment",
        json!({ "enrollmentId": enrollment_id }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "23",
        "reports.studentSummary",
        json!({ "studentId": student_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "24",
        "reports.sectionRoster",
        json!({ "sectionId": section_id }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "25",
        "backup.exportWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "outPath": bundle_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "26",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "inPath": bundle_out.to_string_lossy()
        }),
    );

    // The import dropped the session; reopen before the gated deletes.
    let _ = request(
        &mut stdin,
        &mut reader,
        "27",
        "session.open",
        json!({ "userId": admin_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "28",
        "enrollments.delete",
        json!({ "enrollmentId": enrollment_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "29",
        "evaluations.delete",
        json!({ "evaluationId": evaluation_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "30",
        "sections.delete",
        json!({ "sectionId": section_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "31",
        "courses.delete",
        json!({ "courseId": course_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "32",
        "users.delete",
        json!({ "userId": student_id }),
    );
    let _ = request(&mut stdin, &mut reader, "33", "session.close", json!({}));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
