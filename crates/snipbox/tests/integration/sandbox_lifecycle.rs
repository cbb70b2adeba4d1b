use snipbox::isolate::IsolateBox;
use snipbox::{IsolateBackend, SandboxBackend};

use super::test_config;

#[tokio::test]
#[ignore = "requires root"]
async fn test_box_init_and_cleanup() {
    let config = test_config();
    let mut sandbox = IsolateBox::init(300, config.isolate_binary(), config.cgroup)
        .await
        .expect("Failed to create sandbox");

    // Verify box directory exists
    let path = sandbox.path().to_path_buf();
    assert!(path.exists());

    sandbox.cleanup().await.expect("Failed to cleanup sandbox");
    assert!(!path.join("box").exists());
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_box_write_file() {
    let config = test_config();
    let mut sandbox = IsolateBox::init(301, config.isolate_binary(), config.cgroup)
        .await
        .expect("Failed to create sandbox");

    sandbox
        .write_file("main.py", b"print('hi')")
        .await
        .expect("Failed to write file");

    let host_path = sandbox.file_path("main.py").unwrap();
    assert_eq!(std::fs::read(host_path).unwrap(), b"print('hi')");

    // Paths escaping the box are refused
    assert!(sandbox.file_path("../escape").is_err());

    sandbox.cleanup().await.expect("Failed to cleanup");
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_backend_creates_distinct_boxes() {
    let config = test_config();
    let backend = IsolateBackend::from_config(&config);

    let first = backend.create(310).await.expect("Failed to create box");
    let second = backend.create(311).await.expect("Failed to create second box");
    assert_ne!(first.id(), second.id());

    first.destroy().await.expect("Failed to destroy first box");
    second.destroy().await.expect("Failed to destroy second box");
}
