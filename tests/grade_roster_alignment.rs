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
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn summary_of_card<'a>(
    summary: &'a serde_json::Value,
    section_id: &str,
) -> &'a serde_json::Value {
    summary
        .get("cards")
        .and_then(|v| v.as_array())
        .and_then(|cards| {
            cards
                .iter()
                .find(|c| c.get("sectionId").and_then(|v| v.as_str()) == Some(section_id))
        })
        .and_then(|c| c.get("summary"))
        .expect("card summary for section")
}

fn summary_of_row<'a>(roster: &'a serde_json::Value, student_id: &str) -> &'a serde_json::Value {
    roster
        .get("rows")
        .and_then(|v| v.as_array())
        .and_then(|rows| {
            rows.iter()
                .find(|r| r.get("studentId").and_then(|v| v.as_str()) == Some(student_id))
        })
        .and_then(|r| r.get("summary"))
        .expect("roster row summary for student")
}

#[test]
fn student_card_and_section_roster_agree_on_final_marks() {
    let workspace = temp_dir("enrolld-roster-alignment");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        json!({ "lastName": "Registrar", "firstName": "Ada", "role": "admin" }),
    );
    let admin_id = admin.get("userId").and_then(|v| v.as_str()).unwrap();
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "session.open",
        json!({ "userId": admin_id }),
    );

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "users.create",
        json!({ "lastName": "Faculty", "firstName": "Rosa", "role": "teacher" }),
    );
    let teacher_id = teacher.get("userId").and_then(|v| v.as_str()).unwrap();
    let complete = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "users.create",
        json!({ "lastName": "Ibarra", "firstName": "Sofia", "role": "student" }),
    );
    let complete_id = complete
        .get("userId")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();
    let partial = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "users.create",
        json!({ "lastName": "Moreau", "firstName": "Jean", "role": "student" }),
    );
    let partial_id = partial
        .get("userId")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    let course = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "courses.create",
        json!({ "code": "CS-250", "name": "Data Structures", "credits": 4 }),
    );
    let course_id = course.get("courseId").and_then(|v| v.as_str()).unwrap();
    let section = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "sections.create",
        json!({
            "courseId": course_id,
            "teacherId": teacher_id,
            "period": "2026-I",
            "day": "Wednesday",
            "startTime": "14:00",
            "endTime": "16:00",
            "capacity": 30
        }),
    );
    let section_id = section
        .get("sectionId")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    let types = request_ok(&mut stdin, &mut reader, "9", "evaluationTypes.list", json!({}));
    let type_id = types
        .get("evaluationTypes")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|t| t.get("id"))
        .and_then(|v| v.as_str())
        .expect("seeded evaluation type")
        .to_string();

    let mut eval_ids = Vec::new();
    for (i, title) in ["Midterm", "Final"].iter().enumerate() {
        let created = request_ok(
            &mut stdin,
            &mut reader,
            &format!("e{}", i),
            "evaluations.create",
            json!({
                "sectionId": section_id,
                "evaluationTypeId": type_id,
                "title": title,
                "weightPercent": 50
            }),
        );
        eval_ids.push(
            created
                .get("evaluationId")
                .and_then(|v| v.as_str())
                .unwrap()
                .to_string(),
        );
    }

    let mut enrollment_ids = Vec::new();
    for (i, sid) in [&complete_id, &partial_id].iter().enumerate() {
        let created = request_ok(
            &mut stdin,
            &mut reader,
            &format!("n{}", i),
            "enrollments.create",
            json!({ "studentId": sid, "sectionId": section_id }),
        );
        enrollment_ids.push(
            created
                .get("enrollmentId")
                .and_then(|v| v.as_str())
                .unwrap()
                .to_string(),
        );
    }

    // Complete record: 80 * 0.5 + 60 * 0.5 = 70, exactly at the pass mark.
    request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "grades.upsert",
        json!({
            "evaluationId": eval_ids[0],
            "enrollmentId": enrollment_ids[0],
            "score": 80.0
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "g2",
        "grades.upsert",
        json!({
            "evaluationId": eval_ids[1],
            "enrollmentId": enrollment_ids[0],
            "score": 60.0
        }),
    );
    // Partial record: a perfect midterm alone covers only half the weight.
    request_ok(
        &mut stdin,
        &mut reader,
        "g3",
        "grades.upsert",
        json!({
            "evaluationId": eval_ids[0],
            "enrollmentId": enrollment_ids[1],
            "score": 100.0
        }),
    );

    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "reports.sectionRoster",
        json!({ "sectionId": section_id }),
    );
    let roster = roster.get("roster").expect("roster model");

    let complete_summary = request_ok(
        &mut stdin,
        &mut reader,
        "r2",
        "reports.studentSummary",
        json!({ "studentId": complete_id }),
    );
    let complete_card = summary_of_card(complete_summary.get("summary").unwrap(), &section_id);
    assert_eq!(
        complete_card.get("weightedTotal").and_then(|v| v.as_f64()),
        Some(70.0)
    );
    assert_eq!(
        complete_card.get("percentCovered").and_then(|v| v.as_i64()),
        Some(100)
    );
    assert_eq!(complete_card.get("passed").and_then(|v| v.as_bool()), Some(true));

    let partial_summary = request_ok(
        &mut stdin,
        &mut reader,
        "r3",
        "reports.studentSummary",
        json!({ "studentId": partial_id }),
    );
    let partial_card = summary_of_card(partial_summary.get("summary").unwrap(), &section_id);
    assert_eq!(
        partial_card.get("weightedTotal").and_then(|v| v.as_f64()),
        Some(50.0)
    );
    assert_eq!(
        partial_card.get("percentCovered").and_then(|v| v.as_i64()),
        Some(50)
    );
    assert_eq!(
        partial_card.get("passed").and_then(|v| v.as_bool()),
        Some(false),
        "a partial record never passes, regardless of score"
    );

    // Both surfaces must agree exactly; they share one aggregator.
    assert_eq!(summary_of_row(roster, &complete_id), complete_card);
    assert_eq!(summary_of_row(roster, &partial_id), partial_card);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn grade_entry_rejects_out_of_range_scores() {
    let workspace = temp_dir("enrolld-grade-range");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        json!({ "lastName": "Registrar", "firstName": "Ada", "role": "admin" }),
    );
    let admin_id = admin.get("userId").and_then(|v| v.as_str()).unwrap();
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "session.open",
        json!({ "userId": admin_id }),
    );
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "users.create",
        json!({ "lastName": "Faculty", "firstName": "Omar", "role": "teacher" }),
    );
    let teacher_id = teacher.get("userId").and_then(|v| v.as_str()).unwrap();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "users.create",
        json!({ "lastName": "Reyes", "firstName": "Luz", "role": "student" }),
    );
    let student_id = student.get("userId").and_then(|v| v.as_str()).unwrap();
    let course = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "courses.create",
        json!({ "code": "LING-101", "name": "Linguistics", "credits": 3 }),
    );
    let course_id = course.get("courseId").and_then(|v| v.as_str()).unwrap();
    let section = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "sections.create",
        json!({
            "courseId": course_id,
            "teacherId": teacher_id,
            "period": "2026-I",
            "day": "Thursday",
            "startTime": "09:00",
            "endTime": "11:00",
            "capacity": 20
        }),
    );
    let section_id = section.get("sectionId").and_then(|v| v.as_str()).unwrap();
    let types = request_ok(&mut stdin, &mut reader, "8", "evaluationTypes.list", json!({}));
    let type_id = types
        .get("evaluationTypes")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|t| t.get("id"))
        .and_then(|v| v.as_str())
        .unwrap();
    let evaluation = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "evaluations.create",
        json!({
            "sectionId": section_id,
            "evaluationTypeId": type_id,
            "title": "Essay",
            "weightPercent": 100
        }),
    );
    let evaluation_id = evaluation.get("evaluationId").and_then(|v| v.as_str()).unwrap();
    let enrollment = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "enrollments.create",
        json!({ "studentId": student_id, "sectionId": section_id }),
    );
    let enrollment_id = enrollment
        .get("enrollmentId")
        .and_then(|v| v.as_str())
        .unwrap();

    for (i, score) in [json!(100.5), json!(-1.0), json!("eighty")].iter().enumerate() {
        let value = request(
            &mut stdin,
            &mut reader,
            &format!("b{}", i),
            "grades.upsert",
            json!({
                "evaluationId": evaluation_id,
                "enrollmentId": enrollment_id,
                "score": score
            }),
        );
        assert_eq!(
            value
                .get("error")
                .and_then(|e| e.get("code"))
                .and_then(|v| v.as_str()),
            Some("bad_params"),
            "score {} must be rejected",
            score
        );
    }

    // Boundary values are recordable.
    request_ok(
        &mut stdin,
        &mut reader,
        "ok1",
        "grades.upsert",
        json!({
            "evaluationId": evaluation_id,
            "enrollmentId": enrollment_id,
            "score": 0.0
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "ok2",
        "grades.upsert",
        json!({
            "evaluationId": evaluation_id,
            "enrollmentId": enrollment_id,
            "score": 100.0
        }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
