use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use chrono::Utc;

use super::parsing::*;
use super::*;
use crate::error_handling::types::RuntimeError;

#[test]
fn parse_size_handles_decimal_and_binary_units() {
    assert_eq!(parse_size("648B"), Some(648));
    assert_eq!(parse_size("1.5kB"), Some(1_500));
    assert_eq!(parse_size("2KiB"), Some(2_048));
    assert_eq!(parse_size("12.5MiB"), Some(13_107_200));
    assert_eq!(parse_size("1GB"), Some(1_000_000_000));
    assert_eq!(parse_size(" 1.94GiB "), Some(2_083_059_138));
    assert_eq!(parse_size("0B"), Some(0));
    assert_eq!(parse_size("12 parsecs"), None);
    assert_eq!(parse_size(""), None);
}

#[test]
fn parse_stats_line_converts_to_megabytes_and_kilobytes() {
    let line = r#"{"BlockIO":"2MiB / 1MiB","CPUPerc":"12.50%","Container":"abc","MemPerc":"1.00%","MemUsage":"512MiB / 2GiB","Name":"berth-runtime-1","NetIO":"10KiB / 4KiB","PIDs":"20"}"#;

    let stats = parse_stats_line(line).unwrap_or_else(|e| panic!("{}", e));

    assert_eq!(stats.memory_usage_mb, 512);
    assert_eq!(stats.memory_total_mb, 2048);
    assert!((stats.cpu_usage - 12.5).abs() < f64::EPSILON);
    assert_eq!(stats.io_read_kb, 2048);
    assert_eq!(stats.io_write_kb, 1024);
    assert_eq!(stats.net_read_kb, 10);
    assert_eq!(stats.net_write_kb, 4);
}

#[test]
fn parse_stats_line_ignores_terminal_noise_before_json() {
    let line = "\u{1b}[2J\u{1b}[H{\"BlockIO\":\"0B / 0B\",\"CPUPerc\":\"0.00%\",\"MemUsage\":\"0B / 0B\",\"NetIO\":\"0B / 0B\"}";

    let stats = parse_stats_line(line).unwrap_or_else(|e| panic!("{}", e));

    assert_eq!(stats, ResourceStats::default());
}

#[test]
fn parse_stats_line_rejects_malformed_pairs() {
    let line = r#"{"BlockIO":"n/a","CPUPerc":"0%","MemUsage":"1B","NetIO":"0B / 0B"}"#;
    assert!(matches!(parse_stats_line(line), Err(RuntimeError::Parse(_))));
}

#[test]
fn parse_inspect_strips_leading_slash_and_reads_labels() {
    let line = r#"{"Id":"f00d","Name":"/berth-runtime-3","State":{"Status":"running","Running":true},"Config":{"Labels":{"Software":"Berth","ServerId":"3"}}}"#;

    let info = parse_inspect(line).unwrap_or_else(|e| panic!("{}", e));

    assert_eq!(info.id, "f00d");
    assert_eq!(info.name, "berth-runtime-3");
    assert!(info.running);
    assert_eq!(info.instance_id(), Some(3));
}

#[test]
fn parse_inspect_accepts_null_labels() {
    let line = r#"{"Id":"1","Name":"/other","State":{"Running":false},"Config":{"Labels":null}}"#;

    let info = parse_inspect(line).unwrap_or_else(|e| panic!("{}", e));

    assert!(!info.running);
    assert!(info.labels.is_empty());
    assert_eq!(info.instance_id(), None);
}

#[test]
fn parse_ps_line_reads_comma_separated_labels() {
    let line = r#"{"ID":"abc","Image":"ghcr.io/game:latest","Labels":"ServerId=12,Software=Berth,com.example=a=b","Names":"berth-runtime-12","State":"running","Status":"Up 2 hours"}"#;

    let info = parse_ps_line(line).unwrap_or_else(|e| panic!("{}", e));

    assert_eq!(info.name, "berth-runtime-12");
    assert!(info.running);
    assert_eq!(info.instance_id(), Some(12));
    assert_eq!(info.labels.get("com.example").map(String::as_str), Some("a=b"));
}

#[test]
fn parse_ps_line_exited_container_is_not_running() {
    let line = r#"{"ID":"abc","Labels":"","Names":"berth-install-4","State":"exited"}"#;

    let info = parse_ps_line(line).unwrap_or_else(|e| panic!("{}", e));

    assert!(!info.running);
    assert!(info.labels.is_empty());
}

#[test]
fn parse_event_line_reads_actor() {
    let line = r#"{"status":"die","id":"abc","Type":"container","Action":"die","Actor":{"ID":"abc","Attributes":{"exitCode":"137","name":"berth-runtime-5","ServerId":"5","Software":"Berth"}},"scope":"local","time":1700000000}"#;

    let event = parse_event_line(line).unwrap_or_else(|e| panic!("{}", e));

    assert_eq!(event.kind, "container");
    assert_eq!(event.action, "die");
    assert_eq!(event.actor_id, "abc");
    assert_eq!(event.attributes.get("exitCode").map(String::as_str), Some("137"));
}

#[test]
fn parse_event_line_keeps_only_action_verb() {
    let line = r#"{"Type":"container","Action":"exec_start: /bin/sh -c healthcheck","Actor":{"ID":"abc","Attributes":{}}}"#;

    let event = parse_event_line(line).unwrap_or_else(|e| panic!("{}", e));

    assert_eq!(event.action, "exec_start");
}

#[test]
fn owned_instance_id_requires_marker() {
    let mut labels = HashMap::new();
    labels.insert(String::from(INSTANCE_LABEL), String::from("9"));
    assert_eq!(owned_instance_id(&labels), None);

    labels.insert(String::from(SOFTWARE_LABEL), String::from("Other"));
    assert_eq!(owned_instance_id(&labels), None);

    labels.insert(String::from(SOFTWARE_LABEL), String::from(SOFTWARE_MARKER));
    assert_eq!(owned_instance_id(&labels), Some(9));

    labels.insert(String::from(INSTANCE_LABEL), String::from("not-a-number"));
    assert_eq!(owned_instance_id(&labels), None);
}

#[test]
fn container_event_accessors() {
    let mut attributes = HashMap::new();
    attributes.insert(String::from("exitCode"), String::from("1"));
    attributes.insert(String::from("name"), String::from("/berth-runtime-1"));
    let event = ContainerEvent {
        container_id: String::from("abc"),
        action: String::from("die"),
        attributes,
        received_at: Utc::now(),
    };

    assert!(event.is_die());
    assert_eq!(event.exit_code(), Some(1));
    assert_eq!(event.container_name(), Some("berth-runtime-1"));
    assert_eq!(event.label("missing"), None);
}

#[test]
fn create_args_cover_limits_mounts_and_ports() {
    let mut labels = BTreeMap::new();
    labels.insert(String::from(SOFTWARE_LABEL), String::from(SOFTWARE_MARKER));
    labels.insert(String::from(INSTANCE_LABEL), String::from("1"));
    let spec = ContainerSpec {
        name: String::from("berth-runtime-1"),
        hostname: String::from("berth-runtime-1"),
        image: String::from("ghcr.io/game:latest"),
        env: vec![(String::from("STARTUP"), String::from("java -jar server.jar"))],
        labels,
        user: Some(String::from("998:998")),
        working_dir: Some(String::from("/home/container")),
        command: Vec::new(),
        mounts: vec![Mount {
            source: PathBuf::from("/var/lib/berth/volumes/1"),
            target: String::from("/home/container"),
            read_only: false,
        }],
        ports: vec![PortBinding {
            container_port: 25565,
            protocol: Protocol::Udp,
            host_ip: String::from("0.0.0.0"),
            host_port: 25565,
        }],
        cap_drop: vec![String::from("net_raw")],
        dns: vec![String::from("1.1.1.1")],
        tmpfs: vec![(String::from("/tmp"), String::from("rw,exec,nosuid,size=100M"))],
        memory_bytes: Some(1024),
        memory_reservation_bytes: Some(512),
        memory_swap_bytes: Some(-1),
        cpu_quota: Some(100_000),
        cpu_period: Some(100_000),
        cpu_shares: None,
        blkio_weight: Some(100),
        pids_limit: Some(100),
        oom_kill_disable: true,
        interactive: true,
    };

    let args = DockerCli::create_args(&spec);
    let joined = args.join(" ");

    assert_eq!(args[0], "create");
    assert_eq!(args.last().map(String::as_str), Some("ghcr.io/game:latest"));
    assert!(joined.contains("--name berth-runtime-1"));
    assert!(joined.contains("--interactive"));
    assert!(joined.contains("--label ServerId=1"));
    assert!(joined.contains("--label Software=Berth"));
    assert!(args.contains(&String::from("STARTUP=java -jar server.jar")));
    assert!(joined.contains("--user 998:998"));
    assert!(joined.contains(
        "--mount type=bind,source=/var/lib/berth/volumes/1,target=/home/container"
    ));
    assert!(joined.contains("--publish 0.0.0.0:25565:25565/udp"));
    assert!(joined.contains("--cap-drop net_raw"));
    assert!(joined.contains("--dns 1.1.1.1"));
    assert!(joined.contains("--tmpfs /tmp:rw,exec,nosuid,size=100M"));
    assert!(joined.contains("--memory 1024b"));
    assert!(joined.contains("--memory-reservation 512b"));
    assert!(joined.contains("--memory-swap -1"));
    assert!(joined.contains("--cpu-quota 100000"));
    assert!(!joined.contains("--cpu-shares"));
    assert!(joined.contains("--pids-limit 100"));
    assert!(joined.contains("--oom-kill-disable"));
}

#[test]
fn create_args_place_command_after_image() {
    let spec = ContainerSpec {
        name: String::from("berth-install-2"),
        image: String::from("alpine"),
        command: vec![String::from("bash"), String::from("/mnt/install/install.sh")],
        ..Default::default()
    };

    let args = DockerCli::create_args(&spec);
    let image_at = args.iter().position(|a| a == "alpine").expect("image present");

    assert_eq!(&args[image_at + 1..], ["bash", "/mnt/install/install.sh"]);
    assert!(!args.contains(&String::from("--hostname")));
    assert!(!args.contains(&String::from("--interactive")));
}

#[tokio::test]
async fn missing_binary_reports_unavailable() {
    let runtime = DockerCli::new("/nonexistent/berth-docker-binary");

    let result = runtime.list().await;

    assert!(matches!(result, Err(RuntimeError::Unavailable(_))));
}
