//! Whole-project orchestration against the in-memory engine.

mod common;

use std::time::Duration;

use common::{FakeDriver, PROJECT_ID, RecordingReporter, container, orchestrator, project, test_settings};
use platdev::PlatformError;
use platdev::address::ROUTER_CONTAINER;
use platdev::container::ContainerState;
use platdev::lifecycle::LifecycleState;
use platdev::reporter::NullReporter;
use platdev_protocol::{
    BUILD_COMMAND, DESCRIPTOR_PATH, OPEN_COMMAND, ROUTES_DIR, SHUTDOWN_COMMAND, decode_open_payload,
};

const WEB_AND_DB: &str = r#"
apps:
  - name: web
    type: php:8.2
    relationships:
      db: "mysqldb:mysql"
services:
  - name: mysqldb
    type: mysql:10.6
"#;

const SINGLE_SERVICE: &str = r#"
services:
  - name: cache
    type: redis:7.0
"#;

#[tokio::test]
async fn start_twice_creates_once() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new();
    let orchestrator = orchestrator(&driver, test_settings());
    let mut project = project(dir.path(), SINGLE_SERVICE);

    orchestrator.start(&mut project, &NullReporter).await.unwrap();
    orchestrator.start(&mut project, &NullReporter).await.unwrap();

    assert_eq!(driver.creates(), 1);
    assert_eq!(driver.starts(), 1);
    assert_eq!(driver.pulls(), vec!["docker.io/platdev/redis:7.0".to_string()]);

    let status = orchestrator.status(&project).await.unwrap();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].state, LifecycleState::Opened);
    assert_eq!(status[0].container, container("cache", "svc"));
}

#[tokio::test]
async fn losing_the_create_race_still_starts() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new();
    let cache = container("cache", "svc");
    driver.race_create(&cache);

    let orchestrator = orchestrator(&driver, test_settings());
    let mut project = project(dir.path(), SINGLE_SERVICE);
    orchestrator.start(&mut project, &NullReporter).await.unwrap();

    assert_eq!(driver.creates(), 0);
    let started = driver.container(&cache).unwrap();
    assert_eq!(started.status.state, ContainerState::Running);
    assert!(driver.file(&cache, DESCRIPTOR_PATH).is_some());
    assert_eq!(driver.execs_of(OPEN_COMMAND).len(), 1);
}

#[tokio::test]
async fn relationships_flow_from_service_to_app() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new();
    let db = container("mysqldb", "svc");
    let web = container("web", "app");
    driver.set_open_output(
        &db,
        r#"{"mysql": {"username": "user", "password": "secret", "path": "main"}}"#,
    );

    let orchestrator = orchestrator(&driver, test_settings());
    let mut project = project(dir.path(), WEB_AND_DB);
    orchestrator.start(&mut project, &NullReporter).await.unwrap();

    let opens = driver.execs_of(OPEN_COMMAND);
    let opened: Vec<_> = opens.iter().map(|exec| exec.container.as_str()).collect();
    assert_eq!(opened, vec![db.as_str(), web.as_str()]);

    let db_ip = driver.container(&db).unwrap().status.ip.unwrap();
    let resolved = project.relationships_for("web").unwrap();
    let records = &resolved["db"];
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.service, "mysqldb");
    assert_eq!(record.rel, "mysql");
    assert_eq!(record.scheme, "mysql");
    assert_eq!(record.port, 3306);
    assert_eq!(record.host, db);
    assert_eq!(record.hostname, db);
    assert_eq!(record.ip, db_ip);
    assert_eq!(record.username.as_deref(), Some("user"));
    assert_eq!(record.path.as_deref(), Some("main"));

    // The app received the same records on its open stdin.
    let stdin = opens[1].stdin.clone().unwrap();
    let payload = decode_open_payload(stdin.trim()).unwrap();
    assert_eq!(payload.relationships["db"], records.clone());

    let descriptor: serde_json::Value =
        serde_json::from_slice(&driver.file(&web, DESCRIPTOR_PATH).unwrap()).unwrap();
    assert_eq!(descriptor["kind"], "app");
    assert_eq!(descriptor["relationships"]["db"], "mysqldb:mysql");

    assert_eq!(project.ledger().entries().len(), 1);
}

#[tokio::test]
async fn unresolved_relationship_warns_and_continues() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new();
    let reporter = RecordingReporter::default();
    let orchestrator = orchestrator(&driver, test_settings());
    let mut project = project(dir.path(), WEB_AND_DB);

    // mysqldb publishes nothing.
    orchestrator.start(&mut project, &reporter).await.unwrap();

    assert!(project.relationships_for("web").unwrap().is_empty());
    let warnings = reporter.warnings();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("'db'"));
}

#[tokio::test]
async fn cycle_aborts_before_any_container_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new();
    let orchestrator = orchestrator(&driver, test_settings());
    let mut project = project(
        dir.path(),
        r#"
services:
  - name: alpha
    type: redis
    relationships:
      peer: beta
  - name: beta
    type: redis
    relationships:
      peer: alpha
"#,
    );

    let err = orchestrator.start(&mut project, &NullReporter).await.unwrap_err();
    match err {
        PlatformError::CyclicDependency { names } => assert_eq!(names, vec!["alpha", "beta"]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(driver.creates(), 0);
    assert!(driver.pulls().is_empty());
}

#[tokio::test]
async fn missing_image_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new();
    driver.mark_missing("docker.io/platdev/nosuch:1.0");
    let orchestrator = orchestrator(&driver, test_settings());
    let mut project = project(
        dir.path(),
        r#"
services:
  - name: ghost
    type: nosuch:1.0
"#,
    );

    let err = orchestrator.start(&mut project, &NullReporter).await.unwrap_err();
    assert!(matches!(err, PlatformError::ImageNotFound(ref image) if image == "docker.io/platdev/nosuch:1.0"));
    assert_eq!(driver.creates(), 0);
}

#[tokio::test]
async fn stale_container_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new();
    let name = container("cache", "svc");
    driver.add_container(&name, "docker.io/platdev/redis:6.0", ContainerState::Exited);

    let orchestrator = orchestrator(&driver, test_settings());
    let mut project = project(dir.path(), SINGLE_SERVICE);
    orchestrator.start(&mut project, &NullReporter).await.unwrap();

    assert_eq!(driver.removes(), 1);
    assert_eq!(driver.creates(), 1);
    let started = driver.container(&name).unwrap();
    assert!(started.status.is_running());
    assert_eq!(started.config.image, "docker.io/platdev/redis:7.0");
}

#[tokio::test]
async fn stalled_shutdown_does_not_block_stop() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new();
    let orchestrator = orchestrator(&driver, test_settings());
    let mut project = project(
        dir.path(),
        r#"
services:
  - name: one
    type: redis
  - name: two
    type: redis
  - name: three
    type: memcached
  - name: four
    type: memcached
  - name: five
    type: redis
"#,
    );
    orchestrator.start(&mut project, &NullReporter).await.unwrap();

    let stuck = container("three", "svc");
    driver.stall_shutdown(&stuck);

    let reporter = RecordingReporter::default();
    let report = tokio::time::timeout(Duration::from_secs(5), orchestrator.stop(&mut project, &reporter))
        .await
        .expect("stop must finish despite the stalled shutdown")
        .unwrap();

    assert!(report.is_success(), "{report}");
    assert_eq!(report.completed.len(), 5);
    assert!(driver.container_names().is_empty());
    assert_eq!(driver.execs_of(SHUTDOWN_COMMAND).len(), 5);

    let forced: Vec<_> = driver
        .stops()
        .into_iter()
        .filter(|(_, grace)| *grace == Some(0))
        .map(|(name, _)| name)
        .collect();
    assert_eq!(forced, vec![stuck.clone()]);
    assert!(reporter.warnings().iter().any(|w| w.contains(&stuck)));
}

#[tokio::test]
async fn readiness_wait_honours_open_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new();
    driver.stall_readiness(&container("cache", "svc"));
    let settings = platdev::OrchestratorSettings {
        open_timeout: Some(Duration::from_millis(100)),
        ..test_settings()
    };
    let orchestrator = orchestrator(&driver, settings);
    let mut project = project(dir.path(), SINGLE_SERVICE);

    let err = orchestrator.start(&mut project, &NullReporter).await.unwrap_err();
    assert!(matches!(err, PlatformError::Timeout { .. }), "{err}");
    assert!(driver.execs_of(OPEN_COMMAND).is_empty());
}

#[tokio::test]
async fn purge_of_one_slot_leaves_other_slots() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new();
    let db = container("mysqldb", "svc");
    for volume in [
        db.clone(),
        format!("{db}-2"),
        format!("{}-2", container("web", "app")),
        format!("{db}-3"),
        "platdev-otherproj-mysqldb-svc-2".to_string(),
    ] {
        driver.add_volume(&volume);
    }

    let orchestrator = orchestrator(&driver, test_settings());
    let mut project = project(dir.path(), WEB_AND_DB);

    let report = orchestrator
        .purge(&mut project, Some(2), &NullReporter)
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.completed.len(), 2);
    assert_eq!(
        driver.volumes(),
        vec![
            db.clone(),
            format!("{db}-3"),
            "platdev-otherproj-mysqldb-svc-2".to_string(),
        ]
    );

    let err = orchestrator
        .purge(&mut project, Some(1), &NullReporter)
        .await
        .unwrap_err();
    assert!(matches!(err, PlatformError::Precondition(_)));
    assert!(driver.volumes().contains(&db));
}

#[tokio::test]
async fn full_purge_stops_and_removes_every_volume() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new();
    let orchestrator = orchestrator(&driver, test_settings());
    let mut project = project(dir.path(), WEB_AND_DB);
    orchestrator.start(&mut project, &NullReporter).await.unwrap();
    driver.add_volume(&format!("{}-2", container("mysqldb", "svc")));

    let report = orchestrator.purge(&mut project, None, &NullReporter).await.unwrap();
    assert!(report.is_success());
    assert!(driver.container_names().is_empty());
    assert!(driver.volumes().is_empty());
}

#[tokio::test]
async fn copy_slot_replaces_destination() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new();
    let db = container("mysqldb", "svc");
    let files = container("web", "app");
    driver.add_volume(&db);
    driver.add_volume(&files);
    driver.add_volume(&format!("{}-3", container("old", "svc")));

    let orchestrator = orchestrator(&driver, test_settings());
    let project = project(dir.path(), WEB_AND_DB);

    let report = orchestrator.copy_slot(&project, 3, &NullReporter).await.unwrap();
    assert!(report.is_success(), "{report}");

    let slots = orchestrator.slot_volumes(&project).await.unwrap();
    assert_eq!(slots[&1], vec![db.clone(), files.clone()]);
    assert_eq!(slots[&3], vec![format!("{db}-3"), format!("{files}-3")]);

    let copies = driver.transients();
    assert_eq!(copies.len(), 2);
    assert!(copies.iter().all(|helper| helper.volumes.len() == 2));

    let err = orchestrator.copy_slot(&project, 1, &NullReporter).await.unwrap_err();
    assert!(matches!(err, PlatformError::Precondition(_)));
}

#[tokio::test]
async fn switching_slot_addresses_new_volumes() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new();
    let orchestrator = orchestrator(&driver, test_settings());
    let mut project = project(dir.path(), SINGLE_SERVICE);

    project.set_slot(2).unwrap();
    orchestrator.start(&mut project, &NullReporter).await.unwrap();

    let name = container("cache", "svc");
    assert_eq!(driver.volumes(), vec![format!("{name}-2")]);
    assert!(driver.container(&name).is_some());
    assert!(project.set_slot(0).is_err());
}

#[tokio::test]
async fn commit_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new();
    let orchestrator = orchestrator(&driver, test_settings());
    let mut project = project(dir.path(), WEB_AND_DB);
    let image = format!("{}-commit:latest", container("web", "app"));

    // Nothing to commit before the app runs.
    let err = orchestrator
        .commit(&mut project, "web", &NullReporter)
        .await
        .unwrap_err();
    assert!(matches!(err, PlatformError::Precondition(_)));

    orchestrator.start(&mut project, &NullReporter).await.unwrap();
    orchestrator.commit(&mut project, "web", &NullReporter).await.unwrap();
    assert!(driver.has_image(&image));

    let err = orchestrator
        .commit(&mut project, "mysqldb", &NullReporter)
        .await
        .unwrap_err();
    assert!(matches!(err, PlatformError::Precondition(_)));

    let err = orchestrator
        .delete_commit(&mut project, "web", &NullReporter)
        .await
        .unwrap_err();
    assert!(matches!(err, PlatformError::Precondition(_)));

    orchestrator.stop(&mut project, &NullReporter).await.unwrap();
    orchestrator
        .delete_commit(&mut project, "web", &NullReporter)
        .await
        .unwrap();
    assert!(!driver.has_image(&image));

    let err = orchestrator
        .delete_commit(&mut project, "web", &NullReporter)
        .await
        .unwrap_err();
    assert!(matches!(err, PlatformError::NotFound { what: "commit", .. }));
}

const APP_WITH_BUILD: &str = r#"
apps:
  - name: web
    type: php:8.2
    hooks:
      build: composer install
"#;

#[tokio::test]
async fn committed_app_skips_build_until_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new();
    let web = container("web", "app");
    let commit = format!("{web}-commit:latest");
    driver.add_image(&commit);

    let orchestrator = orchestrator(&driver, test_settings());
    let mut project = project(dir.path(), APP_WITH_BUILD);

    orchestrator.start(&mut project, &NullReporter).await.unwrap();
    assert_eq!(driver.container(&web).unwrap().config.image, commit);
    assert!(driver.execs_of(BUILD_COMMAND).is_empty());
    assert!(driver.pulls().is_empty());

    orchestrator.build(&mut project, &NullReporter).await.unwrap();
    assert_eq!(driver.execs_of(BUILD_COMMAND).len(), 1);
}

#[tokio::test]
async fn uncommitted_app_builds_once() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new();
    let orchestrator = orchestrator(&driver, test_settings());
    let mut project = project(dir.path(), APP_WITH_BUILD);

    orchestrator.start(&mut project, &NullReporter).await.unwrap();
    orchestrator.start(&mut project, &NullReporter).await.unwrap();

    assert_eq!(driver.execs_of(BUILD_COMMAND).len(), 1);
    assert!(project.handle("web").unwrap().built);
}

#[tokio::test]
async fn failed_build_carries_its_log() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new();
    driver.fail_build(&container("web", "app"), "sh: composer: not found\n");
    let orchestrator = orchestrator(&driver, test_settings());
    let mut project = project(dir.path(), APP_WITH_BUILD);

    let err = orchestrator.start(&mut project, &NullReporter).await.unwrap_err();
    match err {
        PlatformError::BuildFailed { name, output } => {
            assert_eq!(name, "web");
            assert!(output.contains("composer: not found"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn volume_mounts_are_prepared_and_realized() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new();
    let orchestrator = orchestrator(&driver, test_settings());
    let mut project = project(
        dir.path(),
        r#"
apps:
  - name: web
    type: php:8.2
    mounts:
      /app/files:
        source: local
        source_path: files
"#,
    );

    orchestrator.start(&mut project, &NullReporter).await.unwrap();

    let web = container("web", "app");
    assert_eq!(driver.volumes(), vec![web.clone()]);

    let helpers = driver.transients();
    assert_eq!(helpers.len(), 1);
    assert_eq!(helpers[0].image, test_settings().helper_image);

    let config = driver.container(&web).unwrap().config;
    let mount = config
        .volumes
        .iter()
        .find(|mount| mount.target == "/app/files")
        .unwrap();
    assert_eq!(mount.source, web);
    assert_eq!(mount.subpath.as_deref(), Some("mounts/files"));

    let realized = driver
        .execs()
        .into_iter()
        .any(|exec| exec.container == web && exec.user.as_deref() == Some("root") && exec.command[0] == "sh");
    assert!(realized);
}

#[tokio::test]
async fn router_receives_project_routes() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new();
    let settings = platdev::OrchestratorSettings {
        router_enabled: true,
        ..test_settings()
    };
    let orchestrator = orchestrator(&driver, settings.clone());
    let mut project = project(
        dir.path(),
        r#"
apps:
  - name: web
    type: php:8.2
routes:
  - pattern: "https://{default}/"
    upstream: "web:http"
"#,
    );

    orchestrator.start(&mut project, &NullReporter).await.unwrap();

    let router = driver.container(ROUTER_CONTAINER).unwrap();
    assert!(router.status.is_running());
    assert_eq!(router.config.image, settings.router_image);

    let routes = driver
        .file(ROUTER_CONTAINER, &format!("{ROUTES_DIR}/{PROJECT_ID}.json"))
        .unwrap();
    let routes: serde_json::Value = serde_json::from_slice(&routes).unwrap();
    assert_eq!(routes["project"], PROJECT_ID);
    assert_eq!(routes["routes"][0]["upstream"], "web:http");

    // Project stop leaves the shared router alone; stop --all does not.
    orchestrator.stop(&mut project, &NullReporter).await.unwrap();
    assert_eq!(driver.container_names(), vec![ROUTER_CONTAINER.to_string()]);
    orchestrator.stop_all(&NullReporter).await.unwrap();
    assert!(driver.container_names().is_empty());
}

#[tokio::test]
async fn deploy_runs_hooks_of_running_apps() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new();
    let orchestrator = orchestrator(&driver, test_settings());
    let mut project = project(
        dir.path(),
        r#"
apps:
  - name: web
    type: php:8.2
    hooks:
      deploy: php artisan migrate
"#,
    );

    assert!(orchestrator.deploy(&project, &NullReporter).await.is_err());

    orchestrator.start(&mut project, &NullReporter).await.unwrap();
    orchestrator.deploy(&project, &NullReporter).await.unwrap();

    let deploys = driver.execs_of(platdev_protocol::DEPLOY_COMMAND);
    assert_eq!(deploys.len(), 1);
    assert_eq!(deploys[0].stdin.as_deref(), Some("php artisan migrate"));
}

#[tokio::test]
async fn status_after_stop_is_absent() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new();
    let orchestrator = orchestrator(&driver, test_settings());
    let mut project = project(dir.path(), WEB_AND_DB);

    orchestrator.start(&mut project, &NullReporter).await.unwrap();
    orchestrator.stop(&mut project, &NullReporter).await.unwrap();

    let status = orchestrator.status(&project).await.unwrap();
    assert!(status.iter().all(|s| s.state == LifecycleState::Absent));
    assert_eq!(status[0].name, "mysqldb");
}
