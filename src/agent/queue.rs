//! Alert queue - ordered, acknowledged delivery of alerts to the server
//!
//! Only the head of the queue is ever on the wire. It is retransmitted every
//! [`RETRY_INTERVAL_SECS`] until an `ACK` with its id arrives; later entries wait in order.
//! A full queue drops new alerts instead of blocking the producer.

use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::protocol::{Alert, AlertDatagram};

/// Default number of alerts kept before new ones are dropped
pub const DEFAULT_CAPACITY: usize = 256;

/// Seconds between two transmissions of the unacknowledged head
pub const RETRY_INTERVAL_SECS: i64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertEntry {
    /// `<created at>_<sequence>`, unique for the lifetime of the agent
    pub id: String,
    pub text: String,
    /// `None` until the entry is first sent
    pub next_send: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct AlertQueue {
    entries: VecDeque<AlertEntry>,
    capacity: usize,
    sequence: u64,
}

impl Default for AlertQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl AlertQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            sequence: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn head(&self) -> Option<&AlertEntry> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AlertEntry> {
        self.entries.iter()
    }

    /// Queue an alert. Returns `false` (and drops the alert) when the queue is full.
    pub fn enqueue(&mut self, alert: &Alert, now: DateTime<Utc>) -> bool {
        let text = alert.to_string();

        if self.entries.len() >= self.capacity {
            warn!("alert not queued (queue full): {text}");
            return false;
        }

        let id = format!("{}_{}", now.timestamp(), self.sequence);
        self.sequence += 1;

        info!("queueing {id}: {text}");
        self.entries.push_back(AlertEntry {
            id,
            text,
            next_send: None,
            created_at: now,
        });

        true
    }

    /// Returns the head as a datagram if it is due for (re)transmission and
    /// pushes its deadline [`RETRY_INTERVAL_SECS`] into the future.
    pub fn due(&mut self, hostname: &str, now: DateTime<Utc>) -> Option<AlertDatagram> {
        let head = self.entries.front_mut()?;

        if head.next_send.is_some_and(|deadline| now <= deadline) {
            return None;
        }

        if head.next_send.is_some() {
            debug!("resending unacknowledged alert {}", head.id);
        }
        head.next_send = Some(now + TimeDelta::seconds(RETRY_INTERVAL_SECS));

        Some(AlertDatagram {
            hostname: hostname.to_string(),
            id: head.id.clone(),
            created_at: head.created_at.timestamp(),
            text: head.text.clone(),
        })
    }

    /// Removes the head if `id` names it. Acknowledgements for anything else are ignored.
    pub fn acknowledge(&mut self, id: &str) -> bool {
        match self.entries.front() {
            Some(head) if head.id == id => {
                debug!("alert {id} acknowledged");
                self.entries.pop_front();
                true
            }
            _ => {
                debug!("ignoring acknowledgement for {id}");
                false
            }
        }
    }
}
