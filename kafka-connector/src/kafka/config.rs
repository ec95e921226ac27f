use rdkafka::ClientConfig;

/// rdkafka client configuration with the settings the connector relies on.
///
/// Offsets are always committed explicitly by the connector, so auto commit and
/// auto offset store are disabled for every consumer built here.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    /// Group-managed consumer (topic or pattern subscription)
    pub fn for_group_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "45000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Consumer used with manual assignment or only for metadata queries.
    /// `group.id` is still needed to commit and read committed offsets.
    pub fn for_assigned_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000");

        Self { config }
    }

    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Where to start when the group has no committed offset: earliest, latest or error
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Eager protocols (range, roundrobin) revoke everything before assigning;
    /// cooperative-sticky only moves the partitions that change owner.
    pub fn with_assignment_strategy(mut self, strategy: &str) -> Self {
        self.config.set("partition.assignment.strategy", strategy);
        self
    }

    pub fn with_session_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("session.timeout.ms", ms.to_string());
        self
    }

    pub fn with_max_poll_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("max.poll.interval.ms", ms.to_string());
        self
    }

    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.config.set("client.id", client_id);
        self
    }

    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// rdkafka producer configuration
pub struct ProducerConfigBuilder {
    config: ClientConfig,
}

impl ProducerConfigBuilder {
    pub fn new(bootstrap_servers: &str) -> Self {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("statistics.interval.ms", "10000")
            .set("enable.idempotence", "true");
        Self { config }
    }

    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    pub fn with_linger_ms(mut self, ms: u32) -> Self {
        self.config.set("linger.ms", ms.to_string());
        self
    }

    pub fn with_message_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("message.timeout.ms", ms.to_string());
        self
    }

    pub fn with_compression_codec(mut self, codec: &str) -> Self {
        self.config.set("compression.codec", codec);
        self
    }

    pub fn with_queue_mib(mut self, mib: u32) -> Self {
        self.config
            .set("queue.buffering.max.kbytes", (mib * 1024).to_string());
        self
    }

    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_consumer_disables_auto_commit() {
        let config = ConsumerConfigBuilder::for_group_consumer("localhost:9092", "connector")
            .with_offset_reset("earliest")
            .build();

        assert_eq!(config.get("group.id"), Some("connector"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn test_assigned_consumer_has_no_group_timeouts() {
        let config =
            ConsumerConfigBuilder::for_assigned_consumer("localhost:9092", "connector").build();

        assert_eq!(config.get("session.timeout.ms"), None);
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
    }

    #[test]
    fn test_producer_tls_and_queue_settings() {
        let config = ProducerConfigBuilder::new("localhost:9092")
            .with_tls(true)
            .with_queue_mib(4)
            .build();

        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(config.get("queue.buffering.max.kbytes"), Some("4096"));
    }
}
