//! Core data model for the tunerhub tuner server.
//!
//! This crate holds everything that is pure and shared: the channel and tuner
//! definitions loaded from configuration, the read-only channel catalog and
//! the command template engine used to render capture/filter commands.
//!
//! ```rust
//! use tunerhub_core::{Channel, ChannelCatalog, ChannelType, TemplateContext, render};
//!
//! let catalog = ChannelCatalog::new(vec![
//!     Channel::new("NHK", ChannelType::Terrestrial, "27"),
//! ]).unwrap();
//!
//! let channel = catalog.resolve("NHK").unwrap();
//! let ctx = TemplateContext::new(channel).with_tuner("tuner0");
//! let cmd = render("recpt1 {{channel}} - -", &ctx).unwrap();
//! assert_eq!(cmd, "recpt1 27 - -");
//! ```

pub mod catalog;
pub mod error;
pub mod template;
pub mod types;

pub use catalog::ChannelCatalog;
pub use error::{CatalogError, TemplateError};
pub use template::{render, validate, TemplateContext, PLACEHOLDERS};
pub use types::{Channel, ChannelKey, ChannelType, FilterSpec, TunerSpec};
