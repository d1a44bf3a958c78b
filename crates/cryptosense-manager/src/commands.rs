//! Per-sensor command queue.
//!
//! Commands are held in memory only. A delivered command that requires an
//! acknowledgement stays queued until acked, and is handed out again once
//! `redelivery_after` passes without one. Commands that need no ack are
//! dropped as soon as they are delivered.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use cryptosense_core::wire::{AckStatus, Command, CommandResponse};

use crate::error::{ManagerError, Result};

/// Default wait before an unacknowledged command is delivered again.
pub const DEFAULT_REDELIVERY_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Queued,
    Delivered(DateTime<Utc>),
}

#[derive(Debug, Clone)]
struct Entry {
    command: Command,
    state: DeliveryState,
    enqueued_at: DateTime<Utc>,
}

pub struct CommandQueue {
    queues: Mutex<HashMap<String, Vec<Entry>>>,
    redelivery_after: Duration,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_REDELIVERY_SECS))
    }
}

impl CommandQueue {
    pub fn new(redelivery_after: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            redelivery_after,
        }
    }

    pub fn enqueue(&self, sensor_id: &str, command: Command) {
        tracing::info!(
            sensor_id,
            command_id = %command.id,
            command_type = %command.kind,
            priority = command.priority,
            "Command queued"
        );
        self.queues
            .lock()
            .entry(sensor_id.to_string())
            .or_default()
            .push(Entry {
                command,
                state: DeliveryState::Queued,
                enqueued_at: Utc::now(),
            });
    }

    /// Commands due for delivery, highest priority first.
    pub fn take(&self, sensor_id: &str) -> Vec<Command> {
        self.take_at(sensor_id, Utc::now())
    }

    fn take_at(&self, sensor_id: &str, now: DateTime<Utc>) -> Vec<Command> {
        let mut queues = self.queues.lock();
        let Some(entries) = queues.get_mut(sensor_id) else {
            return Vec::new();
        };

        let mut due: Vec<(i32, DateTime<Utc>, Command)> = Vec::new();
        for entry in entries.iter_mut() {
            let ready = match entry.state {
                DeliveryState::Queued => true,
                DeliveryState::Delivered(at) => now - at >= self.redelivery_after,
            };
            if ready {
                if matches!(entry.state, DeliveryState::Delivered(_)) {
                    tracing::warn!(
                        sensor_id,
                        command_id = %entry.command.id,
                        "Redelivering unacknowledged command"
                    );
                }
                entry.state = DeliveryState::Delivered(now);
                due.push((entry.command.priority, entry.enqueued_at, entry.command.clone()));
            }
        }
        entries.retain(|e| e.command.requires_ack);
        if entries.is_empty() {
            queues.remove(sensor_id);
        }

        due.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        due.into_iter().map(|(_, _, c)| c).collect()
    }

    /// Record an acknowledgement, removing the command from the queue.
    pub fn acknowledge(&self, sensor_id: &str, response: &CommandResponse) -> Result<()> {
        let mut queues = self.queues.lock();
        let unknown = || ManagerError::UnknownCommand {
            sensor_id: sensor_id.to_string(),
            command_id: response.command_id.clone(),
        };
        let entries = queues.get_mut(sensor_id).ok_or_else(unknown)?;
        let pos = entries
            .iter()
            .position(|e| e.command.id == response.command_id)
            .ok_or_else(unknown)?;
        entries.remove(pos);
        if entries.is_empty() {
            queues.remove(sensor_id);
        }

        match response.status {
            AckStatus::Processed => tracing::info!(
                sensor_id,
                command_id = %response.command_id,
                "Command acknowledged"
            ),
            AckStatus::Failed | AckStatus::Ignored => tracing::warn!(
                sensor_id,
                command_id = %response.command_id,
                status = ?response.status,
                message = %response.message,
                "Command not applied"
            ),
        }
        Ok(())
    }

    /// Number of commands still held for a sensor.
    pub fn len(&self, sensor_id: &str) -> usize {
        self.queues.lock().get(sensor_id).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, sensor_id: &str) -> bool {
        self.len(sensor_id) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptosense_core::wire::CommandType;

    fn ack(command: &Command, status: AckStatus) -> CommandResponse {
        CommandResponse {
            command_id: command.id.clone(),
            sensor_id: "s1".into(),
            status,
            message: String::new(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn delivered_by_priority() {
        let queue = CommandQueue::default();
        let low = Command::new(CommandType::StartCapture);
        let mut high = Command::new(CommandType::Stop);
        high.priority = 10;
        queue.enqueue("s1", low.clone());
        queue.enqueue("s1", high.clone());

        let taken = queue.take("s1");
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].id, high.id);
        assert_eq!(taken[1].id, low.id);
        assert!(queue.take("other").is_empty());
    }

    #[test]
    fn unacked_commands_are_redelivered_after_timeout() {
        let queue = CommandQueue::new(Duration::seconds(60));
        let cmd = Command::new(CommandType::Restart);
        queue.enqueue("s1", cmd.clone());

        let now = Utc::now();
        assert_eq!(queue.take_at("s1", now).len(), 1);
        assert!(queue.take_at("s1", now + Duration::seconds(30)).is_empty());
        let again = queue.take_at("s1", now + Duration::seconds(61));
        assert_eq!(again[0].id, cmd.id);

        queue.acknowledge("s1", &ack(&cmd, AckStatus::Processed)).unwrap();
        assert!(queue.is_empty("s1"));
        assert!(queue.take_at("s1", now + Duration::hours(1)).is_empty());
    }

    #[test]
    fn fire_and_forget_commands_are_dropped_on_delivery() {
        let queue = CommandQueue::default();
        let mut cmd = Command::new(CommandType::StartCapture);
        cmd.requires_ack = false;
        queue.enqueue("s1", cmd);

        assert_eq!(queue.take("s1").len(), 1);
        assert_eq!(queue.len("s1"), 0);
    }

    #[test]
    fn unknown_ack_is_rejected() {
        let queue = CommandQueue::default();
        let cmd = Command::new(CommandType::Stop);
        let err = queue
            .acknowledge("s1", &ack(&cmd, AckStatus::Ignored))
            .unwrap_err();
        assert_eq!(err.code(), "unknown_command");

        queue.enqueue("s1", cmd.clone());
        queue.acknowledge("s1", &ack(&cmd, AckStatus::Failed)).unwrap();
        assert!(queue.acknowledge("s1", &ack(&cmd, AckStatus::Failed)).is_err());
    }
}
