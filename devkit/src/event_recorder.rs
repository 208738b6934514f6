/*!
Enregistreur d'événements de flotte

Vide le récepteur unique d'un `FleetSimulator` et garde les événements
dans l'ordre de réception. Les requêtes (par type, par device, tailles de
lots) servent aux assertions des tests.
*/

use anyhow::Result;
use chrono::Duration as WallDuration;
use serde_json::Value;
use std::collections::HashMap;
use symbion_loadtest::{Event, EventType};
use tokio::sync::mpsc;

#[derive(Debug, Default, Clone)]
pub struct EventRecorder {
    events: Vec<Event>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Récupère ce qui est déjà dans la file, sans attendre.
    pub fn drain(&mut self, receiver: &mut mpsc::Receiver<Event>) -> usize {
        let before = self.events.len();
        while let Ok(event) = receiver.try_recv() {
            self.events.push(event);
        }
        let drained = self.events.len() - before;
        log::debug!("📥 Drained {} fleet events", drained);
        drained
    }

    /// Lit jusqu'à la fermeture du flux (après `FleetSimulator::stop`).
    pub async fn drain_until_closed(&mut self, mut receiver: mpsc::Receiver<Event>) -> usize {
        let before = self.events.len();
        while let Some(event) = receiver.recv().await {
            self.events.push(event);
        }
        self.events.len() - before
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.events.iter().filter(|e| e.event_type == event_type).count()
    }

    pub fn of_type(&self, event_type: EventType) -> Vec<&Event> {
        self.events.iter().filter(|e| e.event_type == event_type).collect()
    }

    pub fn for_device(&self, device_id: &str) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| e.device_id.as_deref() == Some(device_id))
            .collect()
    }

    pub fn counts_by_type(&self) -> HashMap<EventType, usize> {
        let mut counts = HashMap::new();
        for event in &self.events {
            *counts.entry(event.event_type).or_insert(0) += 1;
        }
        counts
    }

    /// Tailles des lots terminés, dans l'ordre.
    pub fn batch_sizes(&self) -> Vec<u64> {
        self.of_type(EventType::BatchCompleted)
            .into_iter()
            .filter_map(|e| e.data_u64("batch_size"))
            .collect()
    }

    /// Écart d'horloge murale entre le premier et le dernier événement.
    pub fn span(&self) -> Option<WallDuration> {
        let first = self.events.first()?;
        let last = self.events.last()?;
        Some(last.timestamp - first.timestamp)
    }

    pub fn assert_count(&self, event_type: EventType, expected: usize) -> Result<()> {
        let actual = self.count(event_type);
        if actual != expected {
            anyhow::bail!("Expected {} {:?} events, got {}", expected, event_type, actual);
        }
        log::info!("✅ {:?}: {} events as expected", event_type, actual);
        Ok(())
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.events)?)
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
