use std::time::Duration;

use anyhow::bail;
use bitflags::bitflags;

bitflags! {
    /// What the outbound call tracker's sweep does with a call that exceeded its run timeout
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TimeoutAction: u8 {
        const LOG = 0b01;
        const FAIL = 0b10;
        const LOG_AND_FAIL = Self::LOG.bits() | Self::FAIL.bits();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallTimeouts {
    /// How long a call waits for a disconnected peer to become connected before failing with
    ///  [crate::error::RpcError::ConnectTimeout]. `None` waits indefinitely.
    pub connect_timeout: Option<Duration>,
    /// How long a call may stay in progress before `action` is applied. This is checked by a
    ///  periodic sweep, so the effective timeout may be longer by up to one sweep interval.
    pub run_timeout: Option<Duration>,
    pub action: TimeoutAction,
}
impl CallTimeouts {
    pub fn none() -> CallTimeouts {
        CallTimeouts {
            connect_timeout: None,
            run_timeout: None,
            action: TimeoutAction::LOG,
        }
    }
}

/// Decides what happens to inbound calls that are still running when their peer is stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStopMode {
    CancelInboundCalls,
    /// In-flight inbound calls are left running, and results that are mere cancellation errors
    ///  are never sent - callers only ever see their own disconnect / cancellation
    KeepInboundCallsIncomplete,
}

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub protocol_version: u8,

    pub call_timeout_check_period: Duration,
    pub log_delayed_call_limit: usize,
    pub call_summary_log_period: Duration,
    pub call_summary_log_min_count: usize,
    pub call_abort_cycle_count: usize,
    pub call_abort_cycle_period: Duration,
    pub default_call_timeouts: CallTimeouts,

    pub handshake_timeout: Duration,
    pub reconnect_delay_min: Duration,
    pub reconnect_delay_max: Duration,
    /// > 1.0
    pub reconnect_delay_factor: f64,
    /// pause before a rerouted call is reattempted, to avoid spinning while routing settles
    pub reroute_delay: Duration,
    pub peer_stop_mode: PeerStopMode,

    pub keep_alive_period: Duration,
    pub keep_alive_timeout: Duration,
    pub object_release_period: Duration,
    pub object_release_timeout: Duration,
    pub object_abort_cycle_count: usize,
    pub object_abort_cycle_period: Duration,

    /// The consumer acknowledges every `stream_ack_period` items
    pub stream_ack_period: i64,
    /// The producer never has more than `stream_ack_advance` unacknowledged items in flight
    pub stream_ack_advance: i64,
    pub stream_batch_size: usize,
}

impl RpcConfig {
    pub fn new() -> RpcConfig {
        RpcConfig {
            protocol_version: 1,
            call_timeout_check_period: Duration::from_secs(1),
            log_delayed_call_limit: 50,
            call_summary_log_period: Duration::from_secs(60),
            call_summary_log_min_count: 1,
            call_abort_cycle_count: 3,
            call_abort_cycle_period: Duration::from_millis(100),
            default_call_timeouts: CallTimeouts::none(),
            handshake_timeout: Duration::from_secs(10),
            reconnect_delay_min: Duration::from_millis(100),
            reconnect_delay_max: Duration::from_secs(10),
            reconnect_delay_factor: 1.5,
            reroute_delay: Duration::from_millis(100),
            peer_stop_mode: PeerStopMode::CancelInboundCalls,
            keep_alive_period: Duration::from_secs(15),
            keep_alive_timeout: Duration::from_secs(55),
            object_release_period: Duration::from_secs(10),
            object_release_timeout: Duration::from_secs(65),
            object_abort_cycle_count: 3,
            object_abort_cycle_period: Duration::from_millis(100),
            stream_ack_period: 30,
            stream_ack_advance: 61,
            stream_batch_size: 64,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, period) in [
            ("call_timeout_check_period", self.call_timeout_check_period),
            ("call_summary_log_period", self.call_summary_log_period),
            ("keep_alive_period", self.keep_alive_period),
            ("object_release_period", self.object_release_period),
        ] {
            if period.is_zero() {
                bail!("{} must not be zero", name);
            }
        }

        if self.keep_alive_timeout <= self.keep_alive_period {
            bail!("keep_alive_timeout must be longer than keep_alive_period");
        }
        if self.stream_ack_advance < 1 {
            bail!("stream_ack_advance must be positive");
        }
        if self.stream_ack_period < 1 || self.stream_ack_period > self.stream_ack_advance {
            bail!("stream_ack_period must be between 1 and stream_ack_advance");
        }
        if self.stream_batch_size == 0 {
            bail!("stream_batch_size must be positive");
        }
        if self.reconnect_delay_factor < 1.0 {
            bail!("reconnect_delay_factor must be at least 1.0");
        }
        if self.reconnect_delay_min > self.reconnect_delay_max {
            bail!("reconnect_delay_min must not exceed reconnect_delay_max");
        }
        Ok(())
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig::new()
    }
}
