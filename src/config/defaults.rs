//! Default value functions for configuration.
//!
//! Separated into its own module for clarity and reuse.

// =============================================================================
// Listener Defaults
// =============================================================================

pub fn default_handshake_timeout() -> u64 {
    10
}

pub fn default_max_frame() -> usize {
    replicad_proto::MAX_FRAME_LENGTH
}

// =============================================================================
// Loop and Worker Defaults
// =============================================================================

pub fn default_long_unit_ms() -> u64 {
    500
}

pub fn default_invoker_workers() -> usize {
    4
}

// =============================================================================
// Session Defaults
// =============================================================================

/// Seven minutes, long enough to ride out a client network switch.
pub fn default_grace_period() -> u64 {
    7 * 60
}

pub fn default_flush_interval() -> u64 {
    60
}

pub fn default_outbound_queue() -> usize {
    512
}

pub fn default_resume_backlog() -> usize {
    1024
}

pub fn default_messages_per_second() -> u32 {
    100
}

// =============================================================================
// Reboot Defaults
// =============================================================================

pub fn default_reboot_hour() -> u32 {
    5
}

pub fn default_reboot_warnings() -> Vec<u64> {
    vec![30, 20, 15, 10, 5, 2]
}
