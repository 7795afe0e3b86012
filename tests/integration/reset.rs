//! Host configuration changes reach the agent through RESET

use hostwatch::agent::AgentState;
use pretty_assertions::assert_eq;

use super::helpers::Fabric;

#[tokio::test]
async fn test_changed_host_file_reconfigures_agent() {
    let mut fabric = Fabric::new("");
    let log = fabric.path("x.log");
    fabric.write_host_config(&format!(
        "file: {}\nmatch: ERROR\nalert_all: tags=ERR\n",
        log.display()
    ));
    fabric.until_configured(10).await;
    assert_eq!(fabric.agent.monitors().files.len(), 1);

    // let the server register the host file before it changes
    for _ in 0..6 {
        fabric.step().await;
    }
    fabric.write_host_config(
        "ps_command: ps -ef\nprocess: sshd\nalert_running: tags=PROC min=1 max=1 message=sshd not running\n",
    );

    let mut reset_seen = false;
    for _ in 0..11 {
        let traffic = fabric.step().await;
        if traffic.commands_to_agent().contains(&"RESET") {
            reset_seen = true;
            break;
        }
    }
    assert!(reset_seen, "no RESET within one scan interval");
    assert_eq!(fabric.agent.state(), AgentState::ServerSelected);
    assert!(fabric.agent.monitors().files.is_empty());

    // the next request goes out 10s after the reset
    let steps = fabric.until_configured(15).await;
    assert_eq!(steps, 10);

    let monitors = fabric.agent.monitors();
    assert!(monitors.files.is_empty());
    assert_eq!(monitors.processes.rules().len(), 1);
    assert_eq!(monitors.processes.command(), ["ps", "-ef"]);
}
