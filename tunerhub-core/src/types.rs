//! Channel, tuner and filter definitions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Broadcast channel type.
///
/// A tuner declares the set of types it can receive; a channel belongs to
/// exactly one. The short upper-case names are what command templates see
/// through `{{channel_type}}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelType {
    /// Digital terrestrial television.
    #[serde(rename = "GR", alias = "terrestrial")]
    Terrestrial,
    /// BS satellite.
    #[serde(rename = "BS", alias = "satellite")]
    BS,
    /// 110 degree CS satellite.
    #[serde(rename = "CS")]
    CS,
    /// 124/128 degree CS satellite.
    #[serde(rename = "SKY")]
    SKY,
    /// Cable television.
    #[serde(rename = "CATV", alias = "cable")]
    CATV,
}

impl ChannelType {
    /// Short name used in configuration files and command templates.
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelType::Terrestrial => "GR",
            ChannelType::BS => "BS",
            ChannelType::CS => "CS",
            ChannelType::SKY => "SKY",
            ChannelType::CATV => "CATV",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a channel for tuner sharing.
///
/// Two requests can share one capture only if their keys are equal; the
/// display name plays no part in it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ChannelKey {
    pub channel_type: ChannelType,
    pub channel: String,
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel_type, self.channel)
    }
}

/// A named channel. Immutable after load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    /// Tuning parameter handed to the capture command as `{{channel}}`.
    pub channel: String,
    /// Extra arguments handed to the capture command as `{{extra_args}}`.
    #[serde(default)]
    pub extra_args: String,
}

impl Channel {
    pub fn new(
        name: impl Into<String>,
        channel_type: ChannelType,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            channel_type,
            channel: channel.into(),
            extra_args: String::new(),
        }
    }

    pub fn with_extra_args(mut self, extra_args: impl Into<String>) -> Self {
        self.extra_args = extra_args.into();
        self
    }

    pub fn key(&self) -> ChannelKey {
        ChannelKey {
            channel_type: self.channel_type,
            channel: self.channel.clone(),
        }
    }

    /// Whether both channels tune to the same physical stream.
    pub fn same_stream(&self, other: &Channel) -> bool {
        self.channel_type == other.channel_type && self.channel == other.channel
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.name, self.channel_type, self.channel)
    }
}

/// Static definition of one tuner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunerSpec {
    pub name: String,
    pub types: Vec<ChannelType>,
    /// Capture command template.
    pub command: String,
}

impl TunerSpec {
    pub fn new(name: impl Into<String>, types: Vec<ChannelType>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types,
            command: command.into(),
        }
    }

    pub fn supports(&self, channel_type: ChannelType) -> bool {
        self.types.contains(&channel_type)
    }
}

/// One stage of the filter chain. No command means passthrough.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub command: Option<String>,
}

impl FilterSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
        }
    }

    pub fn passthrough() -> Self {
        Self::default()
    }

    /// The command template, if this stage does anything.
    pub fn command(&self) -> Option<&str> {
        self.command
            .as_deref()
            .map(str::trim)
            .filter(|cmd| !cmd.is_empty())
    }

    pub fn is_passthrough(&self) -> bool {
        self.command().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_key_ignores_name() {
        let a = Channel::new("NHK", ChannelType::Terrestrial, "27");
        let b = Channel::new("NHK-E", ChannelType::Terrestrial, "27");
        let c = Channel::new("BS1", ChannelType::BS, "27");

        assert_eq!(a.key(), b.key());
        assert!(a.same_stream(&b));
        assert_ne!(a.key(), c.key());
        assert!(!a.same_stream(&c));
    }

    #[test]
    fn test_filter_spec_passthrough() {
        assert!(FilterSpec::passthrough().is_passthrough());
        assert!(FilterSpec::new("   ").is_passthrough());
        assert_eq!(FilterSpec::new(" cat ").command(), Some("cat"));
    }

    #[test]
    fn test_tuner_supports() {
        let spec = TunerSpec::new("tuner0", vec![ChannelType::BS, ChannelType::CS], "cat");
        assert!(spec.supports(ChannelType::CS));
        assert!(!spec.supports(ChannelType::Terrestrial));
    }

    #[test]
    fn test_channel_type_names() {
        assert_eq!(ChannelType::Terrestrial.to_string(), "GR");
        assert_eq!(ChannelType::CATV.as_str(), "CATV");
    }
}
