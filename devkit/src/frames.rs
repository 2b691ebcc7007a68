/*!
Frame recorder for subscriber tests

Collects the text frames a dashboard subscriber receives and offers
assertions on their order and content.
*/

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;

/// One snapshot or update frame as seen on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    pub machines: Vec<Value>,
    pub alerts: Vec<Value>,
}

impl Frame {
    pub fn is_snapshot(&self) -> bool {
        self.kind == "snapshot"
    }

    pub fn machine(&self, id: &str) -> Option<&Value> {
        self.machines.iter().find(|m| m["id"] == id)
    }

    pub fn machine_ids(&self) -> Vec<&str> {
        self.machines.iter().filter_map(|m| m["id"].as_str()).collect()
    }

    pub fn status_of(&self, id: &str) -> Option<&str> {
        self.machine(id).and_then(|m| m["status"].as_str())
    }
}

#[derive(Debug, Default)]
pub struct FrameRecorder {
    frames: Vec<Frame>,
}

impl FrameRecorder {
    pub fn new() -> Self {
        env_logger::try_init().ok();
        Self::default()
    }

    pub fn record(&mut self, text: &str) -> Result<&Frame> {
        let frame: Frame = serde_json::from_str(text)?;
        log::debug!("recorded {} frame: {} machines, {} alerts", frame.kind, frame.machines.len(), frame.alerts.len());
        self.frames.push(frame);
        Ok(&self.frames[self.frames.len() - 1])
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn last(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn updates(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter().filter(|f| !f.is_snapshot())
    }

    /// Exactly one snapshot, and it came first.
    pub fn assert_snapshot_first(&self) -> Result<()> {
        let Some(first) = self.frames.first() else {
            anyhow::bail!("no frames recorded");
        };
        if !first.is_snapshot() {
            anyhow::bail!("first frame is '{}', expected snapshot", first.kind);
        }
        let snapshots = self.frames.iter().filter(|f| f.is_snapshot()).count();
        if snapshots != 1 {
            anyhow::bail!("expected exactly one snapshot, got {snapshots}");
        }
        Ok(())
    }

    /// Status of `id` in the most recent frame.
    pub fn assert_status(&self, id: &str, expected: &str) -> Result<()> {
        let Some(last) = self.last() else {
            anyhow::bail!("no frames recorded");
        };
        match last.status_of(id) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!("machine '{id}': expected status {expected}, got {actual}"),
            None => anyhow::bail!("machine '{id}' missing from last frame"),
        }
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
