//! End-to-end tests against a real `sh` under the local PTY transport.

use shellpilot::{
    ExecOptions, ExitCode, FileTransfer, Session, SessionOptions, ShellError,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn options() -> SessionOptions {
    SessionOptions {
        silence_timeout: 10.0,
        command_timeout: 30.0,
        ..SessionOptions::default()
    }
}

fn shell_session() -> Session {
    Session::pty(options(), ["sh"]).expect("session builds")
}

/// A unique scratch directory for this test process.
fn scratch_dir() -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!("shellpilot-test-{}-{id}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("scratch dir");
    dir
}

#[test]
fn test_exec_against_real_shell() {
    let session = shell_session()
        .run(|sh| {
            let out = sh.exec("echo real-shell-roundtrip")?;
            assert!(out.contains("real-shell-roundtrip"));
            Ok(())
        })
        .expect("run succeeds");
    assert!(session.combined_output().contains("real-shell-roundtrip"));
    assert_eq!(session.buffer_depth(), 0);
}

#[test]
fn test_listing_names_without_prompt_marker() {
    let dir = scratch_dir();
    for name in ["alpha", "bravo", "charlie"] {
        std::fs::write(dir.join(name), name).expect("seed file");
    }
    let dir_arg = dir.display().to_string();

    shell_session()
        .run(move |sh| {
            sh.exec(&format!("cd '{dir_arg}'"))?;
            let out = sh.exec("ls -al")?;
            for name in ["alpha", "bravo", "charlie"] {
                assert!(out.contains(name), "missing {name} in {out:?}");
            }
            assert!(!out.contains("~~#"));
            assert!(sh.last_exit_code().is_none());
            Ok(())
        })
        .expect("run succeeds");

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_real_exit_codes() {
    shell_session()
        .run(|sh| {
            let code = sh.exec_for_code("(exit 42)", ExecOptions::default())?;
            assert_eq!(code, ExitCode::Code(42));

            let code =
                sh.exec_for_code("this-program-doesnt-exist-anywhere", ExecOptions::default())?;
            assert_ne!(code, ExitCode::Code(0));

            let code = sh.exec_for_code("true", ExecOptions::default())?;
            assert_eq!(code, ExitCode::Code(0));
            Ok(())
        })
        .expect("run succeeds");
}

#[test]
fn test_stderr_lands_in_the_transcript() {
    shell_session()
        .run(|sh| {
            // A PTY merges stderr into the single stream.
            let out = sh.exec("echo oops-message >&2")?;
            assert!(out.contains("oops-message"));
            Ok(())
        })
        .expect("run succeeds");
}

fn roundtrip(payload: &[u8]) -> Result<(), ShellError> {
    let dir = scratch_dir();
    let path = dir.join("payload.bin").display().to_string();
    let payload_owned = payload.to_vec();
    let read_back: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let read_slot = Arc::clone(&read_back);
    let sidecar_gone = Arc::new(Mutex::new(false));
    let sidecar_slot = Arc::clone(&sidecar_gone);

    shell_session().run(move |sh| {
        sh.write_file(&path, &payload_owned)?;
        *read_slot.lock().unwrap() = sh.read_file(&path)?;
        let probe = sh.exec_for_code(&format!("test -f '{path}.b64'"), ExecOptions::default())?;
        *sidecar_slot.lock().unwrap() = probe != ExitCode::Code(0);
        Ok(())
    })?;

    assert_eq!(read_back.lock().unwrap().as_slice(), payload);
    assert!(
        *sidecar_gone.lock().unwrap(),
        "the .b64 sidecar must be removed"
    );
    std::fs::remove_dir_all(&dir).ok();
    Ok(())
}

#[test]
fn test_file_roundtrip_small_text() {
    roundtrip(b"Hello World!\nThis is a test file.").expect("roundtrip");
}

#[test]
fn test_file_roundtrip_many_lines() {
    let text: String = (0..300)
        .map(|i| format!("line {i}: the quick brown fox jumps over the lazy dog\n"))
        .collect();
    roundtrip(text.as_bytes()).expect("roundtrip");
}

#[test]
fn test_file_roundtrip_binary_blob() {
    // 16001 bytes with NULs and high bytes.
    let blob: Vec<u8> = (0..16_001u32).map(|i| (i.wrapping_mul(7).wrapping_add(13) % 256) as u8).collect();
    assert!(blob.contains(&0));
    assert!(blob.iter().any(|&b| b > 0x7f));
    roundtrip(&blob).expect("roundtrip");
}

#[test]
fn test_quit_now_ends_quietly() {
    shell_session()
        .run(|sh| {
            sh.exec("true")?;
            Err(ShellError::QuitNow)
        })
        .expect("QuitNow is a silent unwind");
}
