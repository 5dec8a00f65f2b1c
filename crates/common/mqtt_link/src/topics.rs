use crate::errors::LinkError;
use rumqttc::QoS;
use rumqttc::SubscribeFilter;

/// A set of MQTT subscription patterns, all at the same QoS.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TopicFilter {
    pub patterns: Vec<String>,
    pub qos: QoS,
}

impl Default for TopicFilter {
    fn default() -> Self {
        TopicFilter::empty()
    }
}

impl TopicFilter {
    /// Check that the pattern is valid and build a new topic filter.
    pub fn new(pattern: &str) -> Result<TopicFilter, LinkError> {
        let mut filter = TopicFilter::empty();
        filter.add(pattern)?;
        Ok(filter)
    }

    /// An empty topic filter
    pub fn empty() -> TopicFilter {
        TopicFilter {
            patterns: vec![],
            qos: QoS::AtLeastOnce,
        }
    }

    /// Check that the pattern is valid and add it to this topic filter.
    pub fn add(&mut self, pattern: &str) -> Result<(), LinkError> {
        if rumqttc::valid_filter(pattern) {
            self.patterns.push(pattern.into());
            Ok(())
        } else {
            Err(LinkError::InvalidFilter {
                pattern: pattern.into(),
            })
        }
    }

    /// Merge another filter into this one.
    pub fn add_all(&mut self, other: TopicFilter) {
        self.patterns.extend(other.patterns);
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The list of `SubscribeFilter` expected by rumqttc.
    pub(crate) fn filters(&self) -> Vec<SubscribeFilter> {
        let qos = self.qos;
        self.patterns
            .iter()
            .map(|path| SubscribeFilter {
                path: path.clone(),
                qos,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_and_wildcard_filters() {
        assert!(TopicFilter::new("vineguard/org/site/node/telemetry").is_ok());
        assert!(TopicFilter::new("vineguard/+/+/+/cmd").is_ok());
        assert!(TopicFilter::new("vineguard/#").is_ok());
    }

    #[test]
    fn rejects_malformed_filters() {
        assert!(TopicFilter::new("").is_err());
        assert!(TopicFilter::new("vineguard/#/cmd").is_err());
    }

    #[test]
    fn collects_patterns_at_qos_one() {
        let mut filter = TopicFilter::new("a/b").unwrap();
        filter.add("c/+").unwrap();

        let filters = filter.filters();
        assert_eq!(filters.len(), 2);
        assert!(filters.iter().all(|f| f.qos == QoS::AtLeastOnce));
    }
}
