//! Mesh metrics.
//!
//! Thin facade over the `metrics` crate so call sites stay one line. No exporter
//! is installed here; the embedding process decides where the counters go.

use metrics::{counter, gauge};

pub struct MeshMetrics;

impl MeshMetrics {
    pub fn record_refs_allocated(count: u32) {
        counter!("mesh_ref_allocations_total").increment(1);
        counter!("mesh_ref_ids_allocated_total").increment(count as u64);
    }

    pub fn record_allocation_failure() {
        counter!("mesh_ref_allocation_failures_total").increment(1);
    }

    pub fn record_role_event(kind: &'static str) {
        counter!("mesh_role_events_total", "kind" => kind).increment(1);
    }

    pub fn record_connection_rejected(reason: &'static str) {
        counter!("mesh_connections_rejected_total", "reason" => reason).increment(1);
    }

    pub fn set_registered_connections(count: usize) {
        gauge!("mesh_registered_connections").set(count as f64);
    }

    pub fn record_send_dropped() {
        counter!("mesh_sends_dropped_total").increment(1);
    }

    pub fn record_demuxed(plane: &'static str) {
        counter!("mesh_group_messages_total", "plane" => plane).increment(1);
    }
}
