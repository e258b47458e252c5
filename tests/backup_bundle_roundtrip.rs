use serde_json::json;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

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

#[test]
fn workspace_bundle_round_trips_into_a_fresh_workspace() {
    let source = temp_dir("enrolld-bundle-src");
    let target = temp_dir("enrolld-bundle-dst");
    let bundle = source.join("export.enrollbackup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": source.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "courses.create",
        json!({ "code": "ASTR-140", "name": "Astronomy", "credits": 3 }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "courses.create",
        json!({ "code": "MUS-115", "name": "Music Theory", "credits": 2 }),
    );

    let export = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "backup.exportWorkspaceBundle",
        json!({
            "workspacePath": source.to_string_lossy(),
            "outPath": bundle.to_string_lossy()
        }),
    );
    assert_eq!(
        export.get("bundleFormat").and_then(|v| v.as_str()),
        Some("enroll-workspace-v1")
    );
    assert!(export
        .get("dbSha256")
        .and_then(|v| v.as_str())
        .map(|s| s.len() == 64)
        .unwrap_or(false));

    let import = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": target.to_string_lossy(),
            "inPath": bundle.to_string_lossy()
        }),
    );
    assert_eq!(
        import.get("checksumVerified").and_then(|v| v.as_bool()),
        Some(true)
    );

    // The sidecar is now attached to the imported workspace.
    let listed = request_ok(&mut stdin, &mut reader, "6", "courses.list", json!({}));
    let codes: Vec<&str> = listed
        .get("courses")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|c| c.get("code").and_then(|v| v.as_str()))
                .collect()
        })
        .unwrap_or_default();
    assert_eq!(codes, vec!["ASTR-140", "MUS-115"]);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(source);
    let _ = std::fs::remove_dir_all(target);
}

#[test]
fn tampered_database_entry_fails_the_checksum_gate() {
    let source = temp_dir("enrolld-bundle-tamper-src");
    let target = temp_dir("enrolld-bundle-tamper-dst");
    let bundle = source.join("export.enrollbackup.zip");
    let tampered = source.join("tampered.enrollbackup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": source.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "courses.create",
        json!({ "code": "CHEM-101", "name": "Chemistry", "credits": 4 }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "backup.exportWorkspaceBundle",
        json!({
            "workspacePath": source.to_string_lossy(),
            "outPath": bundle.to_string_lossy()
        }),
    );

    // Rebuild the bundle with the same manifest but a corrupted database
    // entry; the recorded checksum no longer matches.
    {
        let in_file = File::open(&bundle).expect("open bundle");
        let mut archive = ZipArchive::new(in_file).expect("read bundle");
        let mut manifest = String::new();
        archive
            .by_name("manifest.json")
            .expect("manifest entry")
            .read_to_string(&mut manifest)
            .expect("read manifest");
        let mut db_bytes = Vec::new();
        archive
            .by_name("db/enroll.sqlite3")
            .expect("db entry")
            .read_to_end(&mut db_bytes)
            .expect("read db entry");
        let last = db_bytes.len() - 1;
        db_bytes[last] ^= 0xFF;

        let out_file = File::create(&tampered).expect("create tampered bundle");
        let mut zip = ZipWriter::new(out_file);
        let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);
        zip.start_file("manifest.json", opts).expect("start manifest");
        zip.write_all(manifest.as_bytes()).expect("write manifest");
        zip.start_file("db/enroll.sqlite3", opts).expect("start db");
        zip.write_all(&db_bytes).expect("write db");
        zip.finish().expect("finish zip");
    }

    let value = request(
        &mut stdin,
        &mut reader,
        "4",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": target.to_string_lossy(),
            "inPath": tampered.to_string_lossy()
        }),
    );
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    let message = value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    assert!(
        message.contains("checksum"),
        "expected checksum failure, got: {}",
        value
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(source);
    let _ = std::fs::remove_dir_all(target);
}
