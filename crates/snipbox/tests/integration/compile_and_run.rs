use snipbox::Outcome;

use super::{gateway, run, shutdown};

#[tokio::test]
#[ignore = "requires root"]
async fn test_c_compile_and_run() {
    let gateway = gateway(200);

    let source = r#"
#include <stdio.h>

int main(void) {
    int a, b;
    if (scanf("%d %d", &a, &b) != 2) return 2;
    printf("%d\n", a + b);
    return 0;
}
"#;
    let (result, _) = run(&gateway, "c", source, Some("40 2\n")).await;

    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(result.stdout, "42\n");

    shutdown(gateway).await;
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_c_compile_error_is_reported() {
    let gateway = gateway(210);

    let (result, _) = run(&gateway, "c", "int main(void) { return undeclared; }", None).await;

    assert_eq!(result.outcome, Outcome::RuntimeError);
    assert!(result.stderr.contains("undeclared"));
    assert!(result.stdout.is_empty());

    shutdown(gateway).await;
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_c_segfault_is_runtime_error() {
    let gateway = gateway(220);

    let source = "int main(void) { int *p = 0; *p = 1; return 0; }";
    let (result, _) = run(&gateway, "c", source, None).await;

    assert_eq!(result.outcome, Outcome::RuntimeError);

    shutdown(gateway).await;
}
