//! # Settings
//!
//! Everything tunable about an actor system, serde-friendly so it can come from a config file.
//! Durations are stored as `*_ms` integers and exposed through `Duration` getters.
//!
//! Every settings type has a `Default`, `with_*` builders, a `validate()` and a `for_testing()`
//! constructor with short intervals.

use crate::cluster::wire::ProtocolVersion;
use crate::error::FrameworkError;
use crate::identity::{ActorPath, Node};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const MAILBOX_CAPACITY_DEFAULT: usize = 1024;
pub const MAX_ACTORS_DEFAULT: usize = 100_000;
pub const DEFAULT_PORT: u16 = 7337;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorSystemSettings {
    pub system_name: String,
    /// Capacity of each user mailbox, unless overridden in the props.
    pub mailbox_capacity: usize,
    /// Upper bound on live actors; spawning beyond it fails with `CapacityExhausted`.
    pub max_actors: usize,
    pub cluster: ClusterSettings,
}

impl Default for ActorSystemSettings {
    fn default() -> Self {
        Self {
            system_name: "default".to_string(),
            mailbox_capacity: MAILBOX_CAPACITY_DEFAULT,
            max_actors: MAX_ACTORS_DEFAULT,
            cluster: ClusterSettings::default(),
        }
    }
}

impl ActorSystemSettings {
    /// A local, non-clustered system.
    pub fn new(system_name: impl Into<String>) -> Self {
        Self {
            system_name: system_name.into(),
            ..Default::default()
        }
    }

    /// A clustered system bound to `bind`; the system name is taken from the node.
    pub fn clustered(bind: Node) -> Self {
        Self {
            system_name: bind.system_name.clone(),
            cluster: ClusterSettings::new(bind),
            ..Default::default()
        }
    }

    pub fn for_testing(system_name: impl Into<String>) -> Self {
        Self {
            system_name: system_name.into(),
            mailbox_capacity: 256,
            max_actors: 10_000,
            cluster: ClusterSettings::default(),
        }
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    pub fn with_max_actors(mut self, max_actors: usize) -> Self {
        self.max_actors = max_actors;
        self
    }

    pub fn with_cluster(mut self, cluster: ClusterSettings) -> Self {
        self.cluster = cluster;
        self
    }

    /// The endpoint this system answers on.
    pub fn node(&self) -> Node {
        let bind = &self.cluster.bind;
        Node::new(self.system_name.clone(), bind.host.clone(), bind.port)
            .with_protocol(bind.protocol.clone())
    }

    pub fn validate(&self) -> Result<(), FrameworkError> {
        ActorPath::validate_segment(&self.system_name)
            .map_err(|e| FrameworkError::invalid_config(format!("system_name: {e}")))?;
        if self.system_name.contains('@') || self.system_name.contains(':') {
            return Err(FrameworkError::invalid_config(
                "system_name must not contain `@` or `:`",
            ));
        }
        if self.mailbox_capacity == 0 {
            return Err(FrameworkError::invalid_config(
                "mailbox_capacity must be positive",
            ));
        }
        if self.max_actors == 0 {
            return Err(FrameworkError::invalid_config("max_actors must be positive"));
        }
        if self.cluster.enabled {
            self.cluster.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub enabled: bool,
    /// Host, port and protocol to listen on. The system name comes from the system settings.
    pub bind: Node,
    pub seed_nodes: Vec<Node>,
    pub protocol_version: ProtocolVersion,
    pub handshake_timeout_ms: u64,
    pub handshake_retry: BackoffSettings,
    pub swim: SwimSettings,
    pub receptionist: ReceptionistSettings,
    /// How long a down member is kept before it is removed.
    pub down_removal_grace_ms: u64,
    /// Shut the whole system down once this node learns it was marked down.
    pub shutdown_on_self_down: bool,
    /// Frames buffered per peer while its association is still being established.
    pub pending_frames_max: usize,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: Node::new("default", "127.0.0.1", DEFAULT_PORT),
            seed_nodes: Vec::new(),
            protocol_version: ProtocolVersion::CURRENT,
            handshake_timeout_ms: 3_000,
            handshake_retry: BackoffSettings::default(),
            swim: SwimSettings::default(),
            receptionist: ReceptionistSettings::default(),
            down_removal_grace_ms: 30_000,
            shutdown_on_self_down: true,
            pending_frames_max: 1_024,
        }
    }
}

impl ClusterSettings {
    pub fn new(bind: Node) -> Self {
        Self {
            enabled: true,
            bind,
            ..Default::default()
        }
    }

    pub fn for_testing(bind: Node) -> Self {
        Self {
            enabled: true,
            bind,
            seed_nodes: Vec::new(),
            protocol_version: ProtocolVersion::CURRENT,
            handshake_timeout_ms: 1_000,
            handshake_retry: BackoffSettings::for_testing(),
            swim: SwimSettings::for_testing(),
            receptionist: ReceptionistSettings::for_testing(),
            down_removal_grace_ms: 500,
            shutdown_on_self_down: true,
            pending_frames_max: 256,
        }
    }

    pub fn with_seed_node(mut self, seed: Node) -> Self {
        self.seed_nodes.push(seed);
        self
    }

    pub fn with_seed_nodes(mut self, seeds: Vec<Node>) -> Self {
        self.seed_nodes = seeds;
        self
    }

    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_swim(mut self, swim: SwimSettings) -> Self {
        self.swim = swim;
        self
    }

    pub fn with_receptionist(mut self, receptionist: ReceptionistSettings) -> Self {
        self.receptionist = receptionist;
        self
    }

    pub fn with_shutdown_on_self_down(mut self, enabled: bool) -> Self {
        self.shutdown_on_self_down = enabled;
        self
    }

    pub fn with_down_removal_grace_ms(mut self, grace_ms: u64) -> Self {
        self.down_removal_grace_ms = grace_ms;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn down_removal_grace(&self) -> Duration {
        Duration::from_millis(self.down_removal_grace_ms)
    }

    pub fn validate(&self) -> Result<(), FrameworkError> {
        if self.handshake_timeout_ms == 0 {
            return Err(FrameworkError::invalid_config(
                "handshake_timeout_ms must be positive",
            ));
        }
        if self.pending_frames_max == 0 {
            return Err(FrameworkError::invalid_config(
                "pending_frames_max must be positive",
            ));
        }
        self.handshake_retry.validate()?;
        self.swim.validate()?;
        self.receptionist.validate()
    }
}

/// Exponential backoff for transient association failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// `None` retries until the peer is declared down.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl BackoffSettings {
    pub fn for_testing() -> Self {
        Self {
            initial_delay_ms: 20,
            max_delay_ms: 200,
            multiplier: 2.0,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(32) as i32);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    pub fn validate(&self) -> Result<(), FrameworkError> {
        if self.initial_delay_ms == 0 || self.max_delay_ms < self.initial_delay_ms {
            return Err(FrameworkError::invalid_config(
                "backoff delays must satisfy 0 < initial_delay_ms <= max_delay_ms",
            ));
        }
        if self.multiplier < 1.0 {
            return Err(FrameworkError::invalid_config(
                "backoff multiplier must be at least 1.0",
            ));
        }
        Ok(())
    }
}

/// Failure detector knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwimSettings {
    pub probe_interval_ms: u64,
    /// Must be shorter than the probe interval.
    pub ping_timeout_ms: u64,
    /// Members asked to probe on our behalf after a direct ping times out.
    pub indirect_probe_count: usize,
    /// Members probed per protocol period.
    pub probe_fanout: usize,
    /// Protocol periods a suspect has to refute before it is declared dead.
    pub suspicion_timeout_periods: u32,
    pub gossip_max_per_message: usize,
    pub gossip_retransmit_multiplier: u32,
}

impl Default for SwimSettings {
    fn default() -> Self {
        Self {
            probe_interval_ms: 1_000,
            ping_timeout_ms: 300,
            indirect_probe_count: 3,
            probe_fanout: 1,
            suspicion_timeout_periods: 5,
            gossip_max_per_message: 8,
            gossip_retransmit_multiplier: 3,
        }
    }
}

impl SwimSettings {
    pub fn for_testing() -> Self {
        Self {
            probe_interval_ms: 100,
            ping_timeout_ms: 40,
            indirect_probe_count: 2,
            probe_fanout: 1,
            suspicion_timeout_periods: 3,
            gossip_max_per_message: 8,
            gossip_retransmit_multiplier: 3,
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn suspicion_timeout(&self) -> Duration {
        self.probe_interval() * self.suspicion_timeout_periods
    }

    pub fn validate(&self) -> Result<(), FrameworkError> {
        if self.ping_timeout_ms == 0 || self.ping_timeout_ms >= self.probe_interval_ms {
            return Err(FrameworkError::invalid_config(
                "ping_timeout_ms must be positive and shorter than probe_interval_ms",
            ));
        }
        if self.probe_fanout == 0 {
            return Err(FrameworkError::invalid_config("probe_fanout must be positive"));
        }
        if self.suspicion_timeout_periods == 0 {
            return Err(FrameworkError::invalid_config(
                "suspicion_timeout_periods must be positive",
            ));
        }
        if self.gossip_max_per_message == 0 || self.gossip_retransmit_multiplier == 0 {
            return Err(FrameworkError::invalid_config(
                "gossip limits must be positive",
            ));
        }
        Ok(())
    }
}

/// Receptionist anti-entropy knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceptionistSettings {
    /// Pull interval right after a pull returned a full batch.
    pub sync_interval_fast_ms: u64,
    pub sync_interval_slow_ms: u64,
    pub sync_batch_max: usize,
}

impl Default for ReceptionistSettings {
    fn default() -> Self {
        Self {
            sync_interval_fast_ms: 100,
            sync_interval_slow_ms: 1_000,
            sync_batch_max: 100,
        }
    }
}

impl ReceptionistSettings {
    pub fn for_testing() -> Self {
        Self {
            sync_interval_fast_ms: 20,
            sync_interval_slow_ms: 100,
            sync_batch_max: 100,
        }
    }

    pub fn with_sync_batch_max(mut self, batch_max: usize) -> Self {
        self.sync_batch_max = batch_max;
        self
    }

    pub fn sync_interval_fast(&self) -> Duration {
        Duration::from_millis(self.sync_interval_fast_ms)
    }

    pub fn sync_interval_slow(&self) -> Duration {
        Duration::from_millis(self.sync_interval_slow_ms)
    }

    pub fn validate(&self) -> Result<(), FrameworkError> {
        if self.sync_interval_fast_ms == 0 || self.sync_interval_slow_ms < self.sync_interval_fast_ms
        {
            return Err(FrameworkError::invalid_config(
                "sync intervals must satisfy 0 < fast <= slow",
            ));
        }
        if self.sync_batch_max == 0 {
            return Err(FrameworkError::invalid_config(
                "sync_batch_max must be positive",
            ));
        }
        Ok(())
    }
}
