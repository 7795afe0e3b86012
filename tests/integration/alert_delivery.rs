//! At-least-once alert delivery over a lossy channel

use hostwatch::protocol::{Alert, Message};
use pretty_assertions::assert_eq;

use super::helpers::Fabric;

#[tokio::test]
async fn test_lost_acks_cause_retransmission_in_order() {
    let mut fabric = Fabric::new("");
    fabric.until_configured(10).await;

    let now = fabric.now;
    fabric.agent.enqueue(&Alert::new("T", None, "first"), now);
    fabric.agent.enqueue(&Alert::new("T", None, "second"), now);
    let ids: Vec<String> = fabric.agent.queue().iter().map(|entry| entry.id.clone()).collect();

    let mut sent = Vec::new();
    for step in 0..24 {
        // the first transmission and its retry lose their ACK
        fabric.lose_replies = step < 12;

        let traffic = fabric.step().await;
        for message in traffic.to_server {
            if let Message::Alert(alert) = message {
                sent.push(alert.id);
            }
        }
    }

    assert_eq!(sent, vec![ids[0].clone(), ids[0].clone(), ids[0].clone(), ids[1].clone()]);
    assert!(fabric.agent.queue().is_empty());

    // every copy is recorded, duplicates included
    let events = fabric.events();
    assert_eq!(events.matches(&format!("%%{}%%", ids[0])).count(), 3);
    assert_eq!(events.matches(&format!("%%{}%%", ids[1])).count(), 1);
}
