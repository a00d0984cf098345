//! End-to-end runs through the command facade.
//!
//! Containers are bootstrapped by the real `berth init`; clients are
//! in-memory duplex pipes.

use std::path::PathBuf;
use std::time::Duration;

use berth::attach::SessionEnd;
use berth::exec::ClientStreams;
use berth::facade::{AttachStreams, CommandFacade, RunOptions};
use berth::filesystem::BindMount;
use berth::runtime::{ContainerConfig, ContainerStatus, RuntimeConfig, RuntimeMonitor};
use berth_common::{BerthError, ContainerId};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::time::timeout;

const LIMIT: Duration = Duration::from_secs(10);
const DETACH: &[u8] = b"\x10\x11";

fn facade() -> (CommandFacade, TempDir) {
    let temp = TempDir::new().unwrap();
    let config = RuntimeConfig::default()
        .with_root(temp.path().join("root"))
        .with_init_path(env!("CARGO_BIN_EXE_berth"))
        .with_drain_timeout(Duration::from_millis(500));
    (CommandFacade::new(RuntimeMonitor::new(config)), temp)
}

/// The far ends of a client's streams.
struct Client {
    input: DuplexStream,
    output: DuplexStream,
    error: DuplexStream,
}

fn client() -> (ClientStreams, Client) {
    let (input, stdin) = duplex(64 * 1024);
    let (stdout, output) = duplex(64 * 1024);
    let (stderr, error) = duplex(64 * 1024);
    (
        ClientStreams::new(stdin, stdout, stderr),
        Client {
            input,
            output,
            error,
        },
    )
}

fn command(args: &[&str]) -> ContainerConfig {
    ContainerConfig::new("base", args.iter().map(ToString::to_string).collect())
}

fn interactive(args: &[&str], tty: bool) -> RunOptions {
    let mut config = command(args);
    config.open_stdin = true;
    config.tty = tty;
    RunOptions::new(config)
}

async fn read_until(reader: &mut DuplexStream, needle: &[u8]) -> Vec<u8> {
    let mut seen = Vec::new();
    let mut buf = [0u8; 1024];
    timeout(LIMIT, async {
        while !seen.windows(needle.len()).any(|w| w == needle) {
            let n = reader.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream ended before {needle:?}");
            seen.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .unwrap();
    seen
}

async fn read_all(reader: &mut DuplexStream) -> String {
    let mut out = String::new();
    timeout(LIMIT, reader.read_to_string(&mut out))
        .await
        .unwrap()
        .unwrap();
    out
}

async fn single_container(facade: &CommandFacade) -> ContainerId {
    timeout(LIMIT, async {
        loop {
            if let Some(record) = facade.monitor().list().first() {
                return record.id.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap()
}

#[test_log::test(tokio::test)]
async fn foreground_run_streams_output_and_exit_code() {
    let (facade, _temp) = facade();
    let (streams, mut client) = client();

    let outcome = facade
        .run(
            RunOptions::new(command(&["sh", "-c", "echo out; echo err >&2; exit 3"])),
            streams,
        )
        .await
        .unwrap();

    assert_eq!(outcome.session, Some(SessionEnd::ContainerExited));
    assert_eq!(outcome.exit_code, Some(3));
    assert_eq!(read_all(&mut client.output).await, "out\n");
    assert_eq!(read_all(&mut client.error).await, "err\n");

    let logs = facade.logs(outcome.id.short()).unwrap();
    assert!(logs.iter().any(|e| e.log == "out\n" && e.stream == "stdout"));
    assert!(logs.iter().any(|e| e.log == "err\n" && e.stream == "stderr"));
}

#[tokio::test]
async fn detached_run_prints_the_full_id() {
    let (facade, _temp) = facade();
    let (streams, mut client) = client();

    let mut options = RunOptions::new(command(&["sleep", "30"]));
    options.detach = true;
    let outcome = facade.run(options, streams).await.unwrap();

    assert_eq!(outcome.session, None);
    assert_eq!(read_all(&mut client.output).await, format!("{}\n", outcome.id));
    assert_eq!(outcome.id.as_str().len(), ContainerId::FULL_LENGTH);

    facade.kill(outcome.id.as_str()).await.unwrap();
}

#[tokio::test]
async fn run_without_output_streams_prints_the_id() {
    let (facade, _temp) = facade();
    let (streams, mut client) = client();

    let mut options = RunOptions::new(command(&["true"]));
    options.attach = AttachStreams::from_names(&["stdin"]).unwrap();
    drop(client.input);
    let outcome = facade.run(options, streams).await.unwrap();

    assert_eq!(read_all(&mut client.output).await, format!("{}\n", outcome.id));
}

#[tokio::test]
async fn cidfile_holds_the_untruncated_id() {
    let (facade, temp) = facade();
    let (streams, _client) = client();
    let cidfile: PathBuf = temp.path().join("cid");

    let mut options = RunOptions::new(command(&["true"]));
    options.detach = true;
    options.config.cidfile = Some(cidfile.clone());
    let outcome = facade.run(options, streams).await.unwrap();

    let written = std::fs::read_to_string(&cidfile).unwrap();
    assert_eq!(written.len(), ContainerId::FULL_LENGTH);
    assert_eq!(written, outcome.id.as_str());
}

#[tokio::test]
async fn non_tty_disconnect_ends_a_stdin_consumer() {
    let (facade, _temp) = facade();
    let (streams, mut client) = client();

    let runner = facade.clone();
    let run = tokio::spawn(async move { runner.run(interactive(&["cat"], false), streams).await });

    client.input.write_all(b"hello\n").await.unwrap();
    read_until(&mut client.output, b"hello\n").await;
    drop(client.input);

    let outcome = timeout(LIMIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.session, Some(SessionEnd::ContainerExited));
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(
        facade.inspect(outcome.id.as_str()).unwrap().status,
        ContainerStatus::Exited { exit_code: 0 }
    );
}

#[tokio::test]
async fn tty_disconnect_leaves_the_container_running() {
    let (facade, _temp) = facade();
    let (streams, mut client) = client();

    let runner = facade.clone();
    let run = tokio::spawn(async move { runner.run(interactive(&["cat"], true), streams).await });

    client.input.write_all(b"ping\n").await.unwrap();
    read_until(&mut client.output, b"ping").await;
    drop(client.input);

    let outcome = timeout(LIMIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.session, Some(SessionEnd::ClientDisconnected));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let id = outcome.id.as_str();
    assert!(facade.inspect(id).unwrap().status.is_running());

    facade.kill(id).await.unwrap();
    assert!(facade.inspect(id).unwrap().status.is_finished());
}

#[tokio::test]
async fn split_detach_sequence_leaves_the_container_running() {
    let (facade, _temp) = facade();
    let (streams, mut client) = client();

    let runner = facade.clone();
    let run = tokio::spawn(async move { runner.run(interactive(&["cat"], true), streams).await });
    let id = single_container(&facade).await;

    client.input.write_all(&DETACH[..1]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.input.write_all(&DETACH[1..]).await.unwrap();
    drop(client.input);

    let outcome = timeout(LIMIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.session, Some(SessionEnd::Detached));
    assert_eq!(outcome.id, id);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(facade.inspect(id.as_str()).unwrap().status.is_running());

    facade.kill(id.as_str()).await.unwrap();
    facade.kill(id.as_str()).await.unwrap();
    assert_eq!(
        facade.inspect(id.as_str()).unwrap().status,
        ContainerStatus::Exited { exit_code: 137 }
    );
}

#[tokio::test]
async fn interleaved_detach_bytes_are_forwarded() {
    let (facade, _temp) = facade();
    let (streams, mut client) = client();

    let runner = facade.clone();
    let run = tokio::spawn(async move {
        runner
            .run(interactive(&["od", "-An", "-tx1"], false), streams)
            .await
    });

    client.input.write_all(b"\x10x\x11").await.unwrap();
    drop(client.input);

    let outcome = timeout(LIMIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.session, Some(SessionEnd::ContainerExited));
    let dumped = read_all(&mut client.output).await;
    assert_eq!(dumped.split_whitespace().collect::<Vec<_>>(), ["10", "78", "11"]);
}

#[tokio::test]
async fn reattach_does_not_close_stdin_on_disconnect() {
    let (facade, _temp) = facade();
    let (streams, _first) = client();

    let mut options = interactive(&["cat"], false);
    options.detach = true;
    let id = facade.run(options, streams).await.unwrap().id;

    for round in 0..2 {
        let (streams, mut client) = client();
        let attacher = facade.clone();
        let target = id.short().to_string();
        let session = tokio::spawn(async move { attacher.attach(&target, streams, None).await });

        let line = format!("round {round}\n");
        client.input.write_all(line.as_bytes()).await.unwrap();
        read_until(&mut client.output, line.as_bytes()).await;
        drop(client.input);

        let end = timeout(LIMIT, session).await.unwrap().unwrap().unwrap();
        assert_eq!(end, SessionEnd::ClientDisconnected);
        assert!(facade.inspect(id.as_str()).unwrap().status.is_running());
    }

    facade.kill(id.as_str()).await.unwrap();
}

#[tokio::test]
async fn attach_to_an_exited_container_is_rejected() {
    let (facade, _temp) = facade();
    let (streams, _client) = client();

    let outcome = facade
        .run(RunOptions::new(command(&["true"])), streams)
        .await
        .unwrap();

    let (streams, _client) = client();
    let err = facade.attach(outcome.id.as_str(), streams, None).await.unwrap_err();
    assert!(matches!(err, BerthError::InvalidState { .. }));
}

#[tokio::test]
async fn workdir_is_honoured_for_system_directories() {
    let (facade, _temp) = facade();
    let (streams, mut client) = client();

    let mut config = command(&["pwd"]);
    config.workdir = Some(PathBuf::from("/tmp"));
    let outcome = facade.run(RunOptions::new(config), streams).await.unwrap();

    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(read_all(&mut client.output).await, "/tmp\n");
}

#[tokio::test]
async fn container_environment_is_rebuilt() {
    let (facade, _temp) = facade();
    let (streams, mut client) = client();

    let mut config = command(&["env"]);
    config.env = vec!["FOO=bar".into()];
    facade.run(RunOptions::new(config), streams).await.unwrap();

    let env = read_all(&mut client.output).await;
    let lines: Vec<&str> = env.lines().collect();
    assert!(lines.contains(&"FOO=bar"));
    assert!(lines.contains(&"HOME=/"));
    assert!(lines.iter().any(|l| l.starts_with("PATH=")));
    assert!(!lines.iter().any(|l| l.starts_with("CARGO")));
}

#[tokio::test]
async fn missing_program_exits_127() {
    let (facade, _temp) = facade();
    let (streams, mut client) = client();

    let outcome = facade
        .run(RunOptions::new(command(&["berth-no-such-program"])), streams)
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, Some(127));
    assert!(read_all(&mut client.error).await.contains("Unable to locate"));
}

#[tokio::test]
async fn root_bind_mount_is_rejected_before_create() {
    let (facade, _temp) = facade();
    let (streams, _client) = client();

    let mut config = command(&["true"]);
    config.binds = vec!["/:/host".parse::<BindMount>().unwrap()];
    let err = facade.run(RunOptions::new(config), streams).await.unwrap_err();

    assert!(matches!(err, BerthError::InvalidBindMount { .. }));
    assert!(facade.list().unwrap().is_empty());
}

#[tokio::test]
async fn missing_bind_source_is_rejected() {
    let (facade, temp) = facade();
    let (streams, _client) = client();

    let mut config = command(&["true"]);
    let source = temp.path().join("absent");
    config.binds = vec![format!("{}:/data", source.display()).parse().unwrap()];

    assert!(matches!(
        facade.run(RunOptions::new(config), streams).await,
        Err(BerthError::InvalidBindMount { .. })
    ));
}

#[tokio::test]
async fn rm_with_detach_is_rejected() {
    let (facade, _temp) = facade();
    let (streams, _client) = client();

    let mut options = RunOptions::new(command(&["true"]));
    options.detach = true;
    options.config.auto_remove = true;

    assert!(matches!(
        facade.run(options, streams).await,
        Err(BerthError::Config { .. })
    ));
}

#[tokio::test]
async fn foreground_rm_removes_after_exit() {
    let (facade, _temp) = facade();
    let (streams, _client) = client();

    let mut config = command(&["sh", "-c", "exit 5"]);
    config.auto_remove = true;
    let outcome = facade.run(RunOptions::new(config), streams).await.unwrap();
    assert_eq!(outcome.exit_code, Some(5));

    timeout(LIMIT, async {
        while facade.inspect(outcome.id.as_str()).is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(facade.list().unwrap().is_empty());
}

#[tokio::test]
async fn wait_on_exited_and_missing_containers() {
    let (facade, _temp) = facade();
    let (streams, _client) = client();

    let outcome = facade
        .run(RunOptions::new(command(&["sh", "-c", "exit 7"])), streams)
        .await
        .unwrap();

    assert_eq!(facade.wait(outcome.id.as_str()).await.unwrap(), 7);
    assert!(matches!(
        facade.wait("ffffffffffff").await,
        Err(BerthError::ContainerNotFound { .. })
    ));
}

#[tokio::test]
async fn persisted_state_survives_the_monitor() {
    let (facade, temp) = facade();
    let (streams, _client) = client();

    let outcome = facade
        .run(RunOptions::new(command(&["sh", "-c", "echo kept; exit 2"])), streams)
        .await
        .unwrap();

    let config = RuntimeConfig::default()
        .with_root(temp.path().join("root"))
        .with_init_path(env!("CARGO_BIN_EXE_berth"));
    let fresh = CommandFacade::new(RuntimeMonitor::new(config));
    let short = outcome.id.short();

    assert_eq!(fresh.wait(short).await.unwrap(), 2);
    assert_eq!(fresh.logs(short).unwrap()[0].log, "kept\n");
    assert_eq!(fresh.list().unwrap().len(), 1);

    fresh.remove(short).unwrap();
    assert!(fresh.list().unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn supervised_container_is_reachable_from_a_fresh_facade() {
    let temp = TempDir::new().unwrap();
    let config = RuntimeConfig::default()
        .with_root(temp.path().join("root"))
        .with_init_path(env!("CARGO_BIN_EXE_berth"))
        .with_supervisor(env!("CARGO_BIN_EXE_berth"));

    let mut options = interactive(&["cat"], false);
    options.detach = true;
    let (streams, _client) = client();
    let id = CommandFacade::new(RuntimeMonitor::new(config.clone()))
        .run(options, streams)
        .await
        .unwrap()
        .id;

    // Nothing of the launching facade is left; the shim owns the container.
    let facade = CommandFacade::new(RuntimeMonitor::new(config));
    assert!(facade.monitor().list().is_empty());
    assert!(facade.inspect(id.short()).unwrap().status.is_running());

    let (streams, mut client) = client();
    let attacher = facade.clone();
    let target = id.short().to_string();
    let session = tokio::spawn(async move { attacher.attach(&target, streams, None).await });

    client.input.write_all(b"ping\n").await.unwrap();
    read_until(&mut client.output, b"ping\n").await;
    client.input.write_all(DETACH).await.unwrap();

    let end = timeout(LIMIT, session).await.unwrap().unwrap().unwrap();
    assert_eq!(end, SessionEnd::Detached);
    assert!(facade.inspect(id.as_str()).unwrap().status.is_running());

    timeout(LIMIT, facade.kill(id.as_str())).await.unwrap().unwrap();
    assert_eq!(facade.wait(id.as_str()).await.unwrap(), 137);
    assert!(facade.logs(id.as_str()).unwrap().iter().any(|e| e.log == "ping\n"));
}

#[cfg(feature = "integration")]
#[tokio::test]
async fn hostname_is_set_in_a_new_uts_namespace() {
    for hostname in ["box", "berth-test-01"] {
        let (facade, _temp) = facade();
        let (streams, mut client) = client();

        let mut config = command(&["hostname"]);
        config.hostname = Some(hostname.to_string());
        let outcome = facade.run(RunOptions::new(config), streams).await.unwrap();

        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(read_all(&mut client.output).await, format!("{hostname}\n"));
    }
}
