//! Read-only channel catalog.

use std::collections::HashMap;

use crate::error::CatalogError;
use crate::types::Channel;

/// Immutable name -> channel map, built once at startup.
///
/// Lookups take `&self` only, so a catalog behind an `Arc` can be shared by
/// any number of request handlers without locking.
#[derive(Debug, Clone, Default)]
pub struct ChannelCatalog {
    channels: Vec<Channel>,
    by_name: HashMap<String, usize>,
}

impl ChannelCatalog {
    /// Build a catalog, rejecting duplicate names.
    pub fn new(channels: Vec<Channel>) -> Result<Self, CatalogError> {
        let mut by_name = HashMap::with_capacity(channels.len());
        for (index, channel) in channels.iter().enumerate() {
            if by_name.insert(channel.name.clone(), index).is_some() {
                return Err(CatalogError::Duplicate(channel.name.clone()));
            }
        }
        Ok(Self { channels, by_name })
    }

    /// Look up a channel by name.
    pub fn resolve(&self, name: &str) -> Result<&Channel, CatalogError> {
        self.by_name
            .get(name)
            .map(|&index| &self.channels[index])
            .ok_or_else(|| CatalogError::NotFound(name.to_string()))
    }

    /// Channels in configuration order.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelType;

    fn catalog() -> ChannelCatalog {
        ChannelCatalog::new(vec![
            Channel::new("NHK", ChannelType::Terrestrial, "27"),
            Channel::new("BS1", ChannelType::BS, "BS15_0"),
        ])
        .unwrap()
    }

    #[test]
    fn test_resolve() {
        let catalog = catalog();
        let ch = catalog.resolve("BS1").unwrap();
        assert_eq!(ch.channel, "BS15_0");
        assert_eq!(ch.channel_type, ChannelType::BS);
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn test_resolve_unknown() {
        let catalog = catalog();
        assert_eq!(
            catalog.resolve("CX"),
            Err(CatalogError::NotFound("CX".to_string()))
        );
    }

    #[test]
    fn test_duplicate_name() {
        let result = ChannelCatalog::new(vec![
            Channel::new("NHK", ChannelType::Terrestrial, "27"),
            Channel::new("NHK", ChannelType::Terrestrial, "26"),
        ]);
        assert_eq!(result.unwrap_err(), CatalogError::Duplicate("NHK".to_string()));
    }

    #[test]
    fn test_order_is_preserved() {
        let catalog = catalog();
        let names: Vec<_> = catalog.channels().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["NHK", "BS1"]);
    }
}
