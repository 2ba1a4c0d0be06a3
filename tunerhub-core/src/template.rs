//! Command template engine.
//!
//! Capture and filter commands are configured as strings with `{{name}}`
//! placeholders, e.g. `recpt1 --device /dev/px4video0 {{channel}} {{duration}} -`.
//! Rendering is a pure function of the template and a [`TemplateContext`].
//!
//! Recognized placeholders:
//!
//! | name           | value                                         |
//! |----------------|-----------------------------------------------|
//! | `channel`      | tuning parameter of the channel               |
//! | `channel_type` | `GR`, `BS`, `CS`, `SKY` or `CATV`             |
//! | `channel_name` | display name of the channel                   |
//! | `extra_args`   | per-channel extra arguments (may be empty)    |
//! | `duration`     | duration hint in seconds, `-` when unknown    |
//! | `tuner`        | name of the tuner running the command         |

use std::borrow::Cow;

use crate::error::TemplateError;
use crate::types::Channel;

/// Every placeholder name the engine understands.
pub const PLACEHOLDERS: &[&str] = &[
    "channel",
    "channel_type",
    "channel_name",
    "extra_args",
    "duration",
    "tuner",
];

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Values available to a template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    channel: &'a Channel,
    tuner: Option<&'a str>,
    duration: Option<u64>,
}

impl<'a> TemplateContext<'a> {
    pub fn new(channel: &'a Channel) -> Self {
        Self {
            channel,
            tuner: None,
            duration: None,
        }
    }

    pub fn with_tuner(mut self, tuner: &'a str) -> Self {
        self.tuner = Some(tuner);
        self
    }

    pub fn with_duration(mut self, duration: Option<u64>) -> Self {
        self.duration = duration;
        self
    }

    fn lookup(&self, name: &str) -> Result<Cow<'a, str>, TemplateError> {
        match name {
            "channel" => {
                if self.channel.channel.is_empty() {
                    Err(TemplateError::MissingField("channel"))
                } else {
                    Ok(Cow::Borrowed(self.channel.channel.as_str()))
                }
            }
            "channel_type" => Ok(Cow::Borrowed(self.channel.channel_type.as_str())),
            "channel_name" => Ok(Cow::Borrowed(self.channel.name.as_str())),
            "extra_args" => Ok(Cow::Borrowed(self.channel.extra_args.as_str())),
            "duration" => Ok(match self.duration {
                Some(secs) => Cow::Owned(secs.to_string()),
                None => Cow::Borrowed("-"),
            }),
            "tuner" => self
                .tuner
                .map(Cow::Borrowed)
                .ok_or(TemplateError::MissingField("tuner")),
            other => Err(TemplateError::UnknownPlaceholder(other.to_string())),
        }
    }
}

/// Walk the template, replacing each placeholder with `resolve(name)`.
fn expand<'a, F>(template: &str, mut resolve: F) -> Result<String, TemplateError>
where
    F: FnMut(&str) -> Result<Cow<'a, str>, TemplateError>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let inner = &rest[start + OPEN.len()..];
        let end = inner
            .find(CLOSE)
            .ok_or(TemplateError::Unterminated(offset + start))?;
        let name = inner[..end].trim();
        out.push_str(&resolve(name)?);

        let consumed = start + OPEN.len() + end + CLOSE.len();
        offset += consumed;
        rest = &rest[consumed..];
    }
    out.push_str(rest);

    Ok(out)
}

/// Render `template` against `ctx`.
pub fn render(template: &str, ctx: &TemplateContext<'_>) -> Result<String, TemplateError> {
    let rendered = expand(template, |name| ctx.lookup(name))?;
    if rendered.trim().is_empty() {
        return Err(TemplateError::Empty);
    }
    Ok(rendered)
}

/// Check that `template` is well formed and only uses known placeholders.
///
/// Does not need a channel, so it can run while the configuration is loaded.
pub fn validate(template: &str) -> Result<(), TemplateError> {
    let rendered = expand(template, |name| {
        if PLACEHOLDERS.contains(&name) {
            Ok(Cow::Borrowed("x"))
        } else {
            Err(TemplateError::UnknownPlaceholder(name.to_string()))
        }
    })?;
    if rendered.trim().is_empty() {
        return Err(TemplateError::Empty);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelType;

    fn nhk() -> Channel {
        Channel::new("NHK", ChannelType::Terrestrial, "27").with_extra_args("--lnb 15")
    }

    #[test]
    fn test_render_all_placeholders() {
        let ch = nhk();
        let ctx = TemplateContext::new(&ch)
            .with_tuner("tuner0")
            .with_duration(Some(30));
        let cmd = render(
            "rec {{channel_type}} {{ channel }} {{duration}} {{extra_args}} # {{channel_name}}@{{tuner}}",
            &ctx,
        )
        .unwrap();
        assert_eq!(cmd, "rec GR 27 30 --lnb 15 # NHK@tuner0");
    }

    #[test]
    fn test_duration_defaults_to_dash() {
        let ch = nhk();
        let ctx = TemplateContext::new(&ch);
        assert_eq!(render("rec {{channel}} {{duration}} -", &ctx).unwrap(), "rec 27 - -");
    }

    #[test]
    fn test_unknown_placeholder() {
        let ch = nhk();
        let ctx = TemplateContext::new(&ch);
        assert_eq!(
            render("rec {{sid}}", &ctx),
            Err(TemplateError::UnknownPlaceholder("sid".to_string()))
        );
        assert_eq!(
            validate("rec {{sid}}"),
            Err(TemplateError::UnknownPlaceholder("sid".to_string()))
        );
    }

    #[test]
    fn test_unterminated() {
        assert_eq!(validate("rec {{channel}} {{oops"), Err(TemplateError::Unterminated(16)));
    }

    #[test]
    fn test_missing_fields() {
        let ch = Channel::new("Broken", ChannelType::BS, "");
        let ctx = TemplateContext::new(&ch);
        assert_eq!(render("rec {{channel}}", &ctx), Err(TemplateError::MissingField("channel")));

        let ch = nhk();
        let ctx = TemplateContext::new(&ch);
        assert_eq!(render("rec {{tuner}}", &ctx), Err(TemplateError::MissingField("tuner")));
    }

    #[test]
    fn test_empty_template() {
        let ch = nhk();
        assert_eq!(render("  ", &TemplateContext::new(&ch)), Err(TemplateError::Empty));
        assert_eq!(validate(""), Err(TemplateError::Empty));
    }

    #[test]
    fn test_no_placeholders() {
        let ch = nhk();
        assert_eq!(render("cat", &TemplateContext::new(&ch)).unwrap(), "cat");
    }
}
