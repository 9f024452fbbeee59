//! End-to-end driver tests against the scripted in-memory shell.

use parking_lot::Mutex;
use shellpilot::testing::ScriptedShell;
use shellpilot::{
    ExecOptions, ExitCode, ExitCodePolicy, HookEvent, HookFlow, HookName, InputMode, MenuConsole,
    PosixShell, RestartNow, Session, SessionOptions, ShellError,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn options() -> SessionOptions {
    SessionOptions {
        command_timeout: 10.0,
        ..SessionOptions::default()
    }
}

fn posix_session(transport: shellpilot::testing::ScriptedTransport) -> Session {
    Session::new(options(), Box::new(transport), Arc::new(PosixShell::new()))
        .expect("session builds")
}

#[test]
fn test_exec_returns_command_output_without_prompt() {
    let transport = ScriptedShell::new("~~#")
        .on("ls -al", "alpha\nbravo\ncharlie")
        .build();

    let seen = Arc::new(Mutex::new(String::new()));
    let seen_in_script = Arc::clone(&seen);
    let session = posix_session(transport)
        .run(move |sh| {
            let out = sh.exec("ls -al")?;
            *seen_in_script.lock() = out;
            assert!(sh.last_exit_code().is_none());
            Ok(())
        })
        .expect("run succeeds");

    let out = seen.lock().clone();
    assert_eq!(out, "alpha\nbravo\ncharlie\n");
    assert!(!out.contains("~~#"));
    assert!(!session.stdout().contains("~~#"));
    // The transcript keeps the echoed command between the two prompts.
    assert!(session.combined_output().contains("~~# ls -al"));
    assert_eq!(session.buffer_depth(), 0);
}

#[test]
fn test_exit_code_retrieval() {
    let transport = ScriptedShell::new("~~#")
        .on_status("this-program-doesnt-exist", "not found", 127)
        .on_status("(exit 42)", "", 42)
        .build();

    let session = posix_session(transport)
        .run(|sh| {
            let code = sh.exec_for_code("this-program-doesnt-exist", ExecOptions::default())?;
            assert_ne!(code, ExitCode::Code(0));

            let code = sh.exec_for_code("(exit 42)", ExecOptions::default())?;
            assert_eq!(code, ExitCode::Code(42));
            Ok(())
        })
        .expect("run succeeds");

    assert_eq!(session.last_exit_code(), Some(ExitCode::Code(42)));
}

#[test]
fn test_non_zero_exit_code_raises_when_configured() {
    let transport = ScriptedShell::new("~~#").on_status("false", "", 1).build();

    let result = posix_session(transport).run(|sh| {
        sh.exec_opts(
            "false",
            ExecOptions {
                retrieve_exit_code: Some(true),
                on_non_zero_exit_code: Some(ExitCodePolicy::Raise),
                ..ExecOptions::default()
            },
        )?;
        Ok(())
    });

    assert!(matches!(result, Err(ShellError::NonZeroExitCode(1))));
}

#[test]
fn test_silence_timeout_after_nudges() {
    let transport = ScriptedShell::new("~~#").hang_on("stall").build();

    let elapsed = Arc::new(Mutex::new(Duration::ZERO));
    let elapsed_in_script = Arc::clone(&elapsed);
    let result = posix_session(transport).run(move |sh| {
        let started = Instant::now();
        let err = sh
            .exec_opts(
                "stall",
                ExecOptions {
                    silence_timeout: Some(0.3),
                    command_timeout: Some(0.0),
                    ..ExecOptions::default()
                },
            )
            .expect_err("silent shell must time out");
        *elapsed_in_script.lock() = started.elapsed();
        assert!(matches!(err, ShellError::SilenceTimeout));
        Err(err)
    });

    assert!(matches!(result, Err(ShellError::SilenceTimeout)));
    // Three nudges a third of the timeout apart, then the failure check:
    // the whole protocol lands between T and 4T/3 (plus scheduling slop).
    let waited = *elapsed.lock();
    assert!(waited > Duration::from_millis(300), "waited {waited:?}");
    assert!(waited < Duration::from_millis(900), "waited {waited:?}");
}

#[test]
fn test_command_timeout() {
    let transport = ScriptedShell::new("~~#").hang_on("sleep 999").build();

    let result = posix_session(transport).run(|sh| {
        let started = Instant::now();
        let err = sh
            .exec_opts(
                "sleep 999",
                ExecOptions {
                    command_timeout: Some(0.3),
                    ..ExecOptions::default()
                },
            )
            .expect_err("must hit the deadline");
        assert!(matches!(err, ShellError::CommandTimeout));
        assert!(started.elapsed() < Duration::from_secs(2));
        Err(ShellError::QuitNow)
    });

    assert!(result.is_ok(), "QuitNow unwinds silently");
}

#[test]
fn test_timeout_without_error_returns_raw_transcript() {
    let transport = ScriptedShell::new("~~#").hang_on("stall").build();

    let session = posix_session(transport)
        .run(|sh| {
            let raw = sh.exec_opts(
                "stall",
                ExecOptions {
                    command_timeout: Some(0.2),
                    timeout_error: false,
                    ..ExecOptions::default()
                },
            )?;
            // The echoed command is all the transcript ever got.
            assert!(raw.contains("stall"));
            assert_eq!(sh.last_exit_code(), Some(ExitCode::Timeout));
            Ok(())
        })
        .expect("run succeeds");

    assert_eq!(session.last_exit_code(), Some(ExitCode::Timeout));
}

#[test]
fn test_hook_order_when_script_fails() {
    let transport = ScriptedShell::new("~~#").build();
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let mut session = posix_session(transport);
    for (name, tag) in [
        (HookName::BeforeInit, "before_init"),
        (HookName::AfterInit, "after_init"),
        (HookName::BeforeTerm, "before_term"),
        (HookName::AfterTerm, "after_term"),
    ] {
        let log = Arc::clone(&log);
        session.add_hook(name, move |_, _| {
            log.lock().push(tag);
            Ok(HookFlow::Continue)
        });
    }
    let log_for_exception = Arc::clone(&log);
    session.add_hook(HookName::OnException, move |_, event| {
        if let HookEvent::Exception { .. } = event {
            log_for_exception.lock().push("on_exception");
        }
        Ok(HookFlow::Continue)
    });

    let result = session.run(|_| Err(ShellError::InvalidOption("script boom".into())));
    assert!(result.is_err());
    assert_eq!(
        *log.lock(),
        vec![
            "before_init",
            "after_init",
            "on_exception",
            "before_term",
            "after_term"
        ]
    );
}

#[test]
fn test_failing_before_init_skips_script_and_term() {
    let transport = ScriptedShell::new("~~#").build();
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let mut session = posix_session(transport);
    let log_bi = Arc::clone(&log);
    session.add_hook(HookName::BeforeInit, move |_, _| {
        log_bi.lock().push("before_init");
        Err(ShellError::InvalidOption("init boom".into()))
    });
    for (name, tag) in [
        (HookName::AfterInit, "after_init"),
        (HookName::BeforeTerm, "before_term"),
        (HookName::AfterTerm, "after_term"),
    ] {
        let log = Arc::clone(&log);
        session.add_hook(name, move |_, _| {
            log.lock().push(tag);
            Ok(HookFlow::Continue)
        });
    }

    let script_ran = Arc::new(Mutex::new(false));
    let script_flag = Arc::clone(&script_ran);
    let result = session.run(move |_| {
        *script_flag.lock() = true;
        Ok(())
    });

    assert!(result.is_err());
    assert!(!*script_ran.lock(), "user block must not run");
    assert_eq!(*log.lock(), vec!["before_init", "after_term"]);
}

#[test]
fn test_run_level_hooks_fire_in_order() {
    let transport = ScriptedShell::new("~~#").greeting("device ready\n").build();
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let mut session = posix_session(transport);
    for (name, tag) in [
        (HookName::OnInit, "on_init"),
        (HookName::OnBeforeRun, "on_before_run"),
        (HookName::BeforeInit, "before_init"),
        (HookName::AfterInit, "after_init"),
        (HookName::BeforeTerm, "before_term"),
        (HookName::AfterTerm, "after_term"),
        (HookName::OnAfterRun, "on_after_run"),
    ] {
        let log = Arc::clone(&log);
        session.add_hook(name, move |_, _| {
            log.lock().push(tag);
            Ok(HookFlow::Continue)
        });
    }
    // The debug hook sees the connect greeting; recording only the first
    // chunk pins where connect happened in the sequence.
    let log_for_output = Arc::clone(&log);
    session.add_hook(HookName::OnDebug, move |_, _| {
        let mut log = log_for_output.lock();
        if !log.contains(&"first_output") {
            log.push("first_output");
        }
        Ok(HookFlow::Continue)
    });

    session.run(|_| Ok(())).expect("run succeeds");

    // on_init and on_before_run precede connect (the greeting); the worker
    // strand's init/term hooks come next; on_after_run closes the run on
    // the reactor strand after the worker has been joined.
    assert_eq!(
        *log.lock(),
        vec![
            "on_init",
            "on_before_run",
            "first_output",
            "before_init",
            "after_init",
            "before_term",
            "after_term",
            "on_after_run",
        ]
    );
}

#[test]
fn test_handled_exception_is_suppressed() {
    let transport = ScriptedShell::new("~~#").build();
    let mut session = posix_session(transport);
    session.add_hook(HookName::OnException, |_, event| {
        if let HookEvent::Exception { error } = event {
            assert!(matches!(error, ShellError::InvalidOption(_)));
        }
        Ok(HookFlow::Break)
    });

    let result = session.run(|_| Err(ShellError::InvalidOption("handled".into())));
    assert!(result.is_ok(), "a Break hook suppresses the error");
}

#[test]
fn test_menu_console_setup_and_restart_sentinel() {
    let menu = "\n*** Device console ***\n\n 0) Logout\n 8) Shell\n 9) Reboot\n\nEnter an option: ";
    let transport = ScriptedShell::new("~~#")
        .greeting(menu)
        .on_raw("8", "\n[2.7.2-RELEASE][admin@edge.local]/root: ")
        .build();
    let log = transport.command_log();

    let dialect = Arc::new(MenuConsole::new());
    let dialect_for_session: Arc<dyn shellpilot::Dialect> = Arc::clone(&dialect) as Arc<dyn shellpilot::Dialect>;
    let session = Session::new(options(), Box::new(transport), dialect_for_session)
        .expect("session builds");

    let result = session.run(|sh| {
        let out = sh.exec("uname")?;
        assert!(out.is_empty() || !out.contains("Enter an option"));
        Err(ShellError::custom(RestartNow))
    });
    assert!(result.is_ok(), "restart sentinel is handled by the dialect");

    let info = dialect.device_info().expect("device identity parsed");
    assert_eq!(info.version, "2.7.2-RELEASE");
    assert_eq!(info.user, "admin");
    assert_eq!(info.host, "edge.local");
    assert_eq!(info.path, "/root");

    // The dialect swapped the quit command before teardown ran.
    let commands = log.lock().clone();
    assert!(commands.contains(&"/sbin/reboot".to_string()));
    assert!(!commands.contains(&"exit".to_string()));
}

#[test]
fn test_monitor_answers_interactive_question() {
    let transport = ScriptedShell::new("~~#")
        .on_raw("ask", "continue? ")
        .on("yes", "done")
        .build();

    posix_session(transport)
        .run(|sh| {
            let out = sh.exec_monitored("ask", ExecOptions::default(), |chunk, _| {
                chunk.contains("continue?").then(|| "yes".to_string())
            })?;
            assert!(out.contains("done"));
            Ok(())
        })
        .expect("run succeeds");
}

#[test]
fn test_echo_gated_input_mode() {
    let transport = ScriptedShell::new("~~#").on("pwd", "/root").build();
    let opts = SessionOptions {
        unbuffered_input: InputMode::Echo,
        command_timeout: 10.0,
        ..SessionOptions::default()
    };
    let session = Session::new(opts, Box::new(transport), Arc::new(PosixShell::new()))
        .expect("session builds");

    session
        .run(|sh| {
            let out = sh.exec("pwd")?;
            assert_eq!(out, "/root\n");
            Ok(())
        })
        .expect("run succeeds");
}

#[test]
fn test_constructor_rejects_oversized_prompt() {
    let transport = ScriptedShell::new("~~#").build();
    let opts = SessionOptions {
        prompt: "x".repeat(200),
        ..SessionOptions::default()
    };
    let result = Session::new(opts, Box::new(transport), Arc::new(PosixShell::new()));
    assert!(matches!(result, Err(ShellError::PromptTooLong(_))));
}

#[test]
fn test_session_is_single_use() {
    let transport = ScriptedShell::new("~~#").build();
    let session = posix_session(transport)
        .run(|_| Ok(()))
        .expect("first run succeeds");

    let again = session.run(|_| Ok(()));
    assert!(matches!(again, Err(ShellError::SessionCompleted)));
}

#[test]
fn test_quit_that_closes_the_channel_is_quiet() {
    let transport = ScriptedShell::new("~~#").close_on("exit").build();
    let session = posix_session(transport)
        .run(|sh| {
            sh.exec("true")?;
            Ok(())
        })
        .expect("teardown over a closing channel must not error");
    assert_eq!(session.buffer_depth(), 0);
}

#[test]
fn test_change_quit_through_ctl() {
    let transport = ScriptedShell::new("~~#").build();
    let log = transport.command_log();
    let mut session = posix_session(transport);
    session.add_hook(HookName::BeforeTerm, |ctl, _| {
        ctl.change_quit("logout");
        Ok(HookFlow::Continue)
    });

    session.run(|_| Ok(())).expect("run succeeds");
    assert!(log.lock().contains(&"logout".to_string()));
}
