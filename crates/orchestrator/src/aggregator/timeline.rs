//! Flat visualization timeline rebuilt from a recorded result

use serde::{Deserialize, Serialize};

use tandem_common::{CollaborativeExecutionResult, TimelineEventType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SegmentLane {
    Device(String),
    Sync(String),
}

/// One interval on the timeline, in milliseconds from the run's start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineSegment {
    pub lane: SegmentLane,
    pub label: String,
    pub start_offset_ms: u64,
    pub end_offset_ms: u64,
    pub success: bool,
}

/// Build step and sync segments sorted by start offset.
///
/// A step starts at its recorded `step_start` event when the result carries a
/// timeline, otherwise right after the device's previous step. Its end is
/// always start plus recorded duration.
pub fn build_segments(result: &CollaborativeExecutionResult) -> Vec<TimelineSegment> {
    let offset_of = |at: chrono::DateTime<chrono::Utc>| -> u64 {
        (at - result.start_time).num_milliseconds().max(0) as u64
    };

    let mut segments = Vec::new();

    for device in &result.devices {
        let mut starts = result
            .timeline
            .iter()
            .filter(|e| {
                e.event_type == TimelineEventType::StepStart && e.device_id.as_deref() == Some(device.alias.as_str())
            })
            .map(|e| offset_of(e.timestamp));

        let mut cursor = 0;
        for step in &device.steps {
            let start = starts.next().unwrap_or(cursor).max(cursor);
            let end = start + step.result.duration_ms;
            segments.push(TimelineSegment {
                lane: SegmentLane::Device(device.alias.clone()),
                label: step.instruction.clone(),
                start_offset_ms: start,
                end_offset_ms: end,
                success: step.result.success,
            });
            cursor = end;
        }
    }

    for sync in &result.sync_points {
        let start = offset_of(sync.start_time);
        segments.push(TimelineSegment {
            lane: SegmentLane::Sync(sync.id.clone()),
            label: format!("sync {}", sync.id),
            start_offset_ms: start,
            end_offset_ms: start + sync.duration_ms,
            success: !sync.timed_out,
        });
    }

    segments.sort_by_key(|s| s.start_offset_ms);
    segments
}
