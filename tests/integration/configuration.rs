//! Configuration exchange followed by file monitoring

use std::fs;
use std::io::Write;

use hostwatch::agent::AgentState;
use hostwatch::protocol::Message;
use pretty_assertions::assert_eq;

use super::helpers::{Fabric, HOSTNAME};

#[tokio::test]
async fn test_configured_agent_reports_file_matches() {
    let mut fabric = Fabric::new("");
    let log = fabric.path("x.log");
    fs::write(&log, "ERROR before the agent started\n").unwrap();
    fabric.write_host_config(&format!(
        "file: {}\nmatch: ERROR\nactive: \nalert_all: tags=ERR message=Found error\n",
        log.display()
    ));

    // the first heartbeat goes out after 5s, the request is answered right away
    let steps = fabric.until_configured(10).await;
    assert_eq!(steps, 6);

    let files = &fabric.agent.monitors().files;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].rule().path, log);

    // the consumer starts at the end of the file
    let traffic = fabric.step().await;
    assert!(traffic.to_server.is_empty());

    let mut file = fs::OpenOptions::new().append(true).open(&log).unwrap();
    file.write_all(b"12:00:01 ERROR disk failure\n12:00:02 all good\n")
        .unwrap();

    let traffic = fabric.step().await;
    let expected = format!("ERR%%{}%%Found error", log.display());
    match traffic.to_server.as_slice() {
        [Message::Alert(alert)] => {
            assert_eq!(alert.hostname, HOSTNAME);
            assert_eq!(alert.text, expected);
        }
        other => panic!("expected one alert, got {other:?}"),
    }
    assert_eq!(traffic.commands_to_agent(), vec!["ACK"]);
    assert!(fabric.agent.queue().is_empty());

    let events = fabric.events();
    assert!(events.contains(&format!("%%{HOSTNAME}%%")));
    assert!(events.contains(&expected));
    assert!(!events.contains("before the agent started"));
}

#[tokio::test]
async fn test_unknown_host_keeps_requesting() {
    let mut fabric = Fabric::new("");
    fs::remove_file(fabric.host_config_path()).unwrap();

    let mut requests = 0;
    for _ in 0..30 {
        let traffic = fabric.step().await;
        requests += traffic
            .commands_to_server()
            .iter()
            .filter(|command| **command == "CONFREQ")
            .count();
        assert!(!traffic.commands_to_agent().contains(&"CONFIG"));
    }

    // server selected at 6s, then one request every 10s
    assert_eq!(requests, 3);
    assert_eq!(fabric.agent.state(), AgentState::ServerSelected);
}
