use snipbox::Outcome;

use super::{gateway, run, shutdown};

#[tokio::test]
#[ignore = "requires root"]
async fn test_python_hello_world() {
    let gateway = gateway(100);

    let (result, chunks) = run(&gateway, "python", "print(1 + 1)", None).await;

    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout, "2\n");
    assert!(!result.truncated);
    assert_eq!(chunks.concat(), "2\n");

    shutdown(gateway).await;
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_stdin_is_delivered() {
    let gateway = gateway(110);

    let (result, _) = run(
        &gateway,
        "py",
        "import sys\nprint(sys.stdin.read().upper(), end='')",
        Some("test input\n"),
    )
    .await;

    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(result.stdout, "TEST INPUT\n");

    shutdown(gateway).await;
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_uncaught_exception_is_runtime_error() {
    let gateway = gateway(120);

    let (result, _) = run(&gateway, "python", "1 / 0", None).await;

    assert_eq!(result.outcome, Outcome::RuntimeError);
    assert_eq!(result.exit_code, Some(1));
    assert!(result.stderr.contains("ZeroDivisionError"));

    shutdown(gateway).await;
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_infinite_loop_times_out() {
    let gateway = gateway(130);

    let (result, _) = run(&gateway, "bash", "while true; do :; done", None).await;

    assert_eq!(result.outcome, Outcome::TimedOut);
    assert!(result.duration.as_secs_f64() < 15.0);

    shutdown(gateway).await;
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_sleeping_program_hits_wall_clock() {
    let gateway = gateway(140);

    let (result, _) = run(&gateway, "python", "import time\ntime.sleep(60)", None).await;

    assert_eq!(result.outcome, Outcome::TimedOut);

    shutdown(gateway).await;
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_memory_bomb_exceeds_resources() {
    let gateway = gateway(150);

    let (result, _) = run(
        &gateway,
        "python",
        "chunks = []\nwhile True:\n    chunks.append(bytearray(16 * 1024 * 1024))",
        None,
    )
    .await;

    // RLIMIT_AS surfaces as MemoryError inside Python, cgroups as an OOM kill
    assert_eq!(result.outcome, Outcome::ResourceExceeded, "stderr: {}", result.stderr);

    shutdown(gateway).await;
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_output_flood_is_truncated() {
    let gateway = gateway(160);

    let (result, _) = run(&gateway, "bash", "yes snipbox", None).await;

    assert!(result.truncated);
    assert!(result.stdout.len() + result.stderr.len() <= 65536);
    assert!(result.stdout.starts_with("snipbox\n"));

    shutdown(gateway).await;
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_output_streams_before_completion() {
    let gateway = gateway(170);

    let (result, chunks) = run(
        &gateway,
        "bash",
        "for i in 1 2 3; do echo $i; sleep 0.3; done",
        None,
    )
    .await;

    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(result.stdout, "1\n2\n3\n");
    assert!(chunks.len() >= 2, "output arrived in one piece: {chunks:?}");

    shutdown(gateway).await;
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_sandboxes_do_not_share_state() {
    let gateway = gateway(180);

    let (first, _) = run(
        &gateway,
        "bash",
        "echo secret > /box/left_behind; echo done",
        None,
    )
    .await;
    assert_eq!(first.outcome, Outcome::Completed);

    let (second, _) = run(&gateway, "bash", "cat /box/left_behind", None).await;
    assert_eq!(second.outcome, Outcome::RuntimeError);
    assert!(!second.stdout.contains("secret"));

    shutdown(gateway).await;
}
