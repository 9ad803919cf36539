use super::{DecodedMessage, Discriminator};

/// Parses one fixed-schema payload. `Ok(None)` means the message was
/// understood but carries nothing worth emitting.
pub type ParseFn = fn(&[u8]) -> Result<Option<DecodedMessage>, prost::DecodeError>;

/// Static tag → parser table for fixed-schema platforms.
pub struct DispatchTable {
    entries: &'static [(&'static str, ParseFn)],
}

impl DispatchTable {
    #[must_use]
    pub const fn new(entries: &'static [(&'static str, ParseFn)]) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn lookup(&self, tag: &str) -> Option<ParseFn> {
        self.entries
            .iter()
            .find_map(|(name, parse)| (*name == tag).then_some(*parse))
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.lookup(tag).is_some()
    }

    /// Decode one tagged payload. Unknown tags and parse failures produce
    /// nothing.
    pub fn dispatch(&self, tag: &str, payload: &[u8]) -> Option<DecodedMessage> {
        let Some(parse) = self.lookup(tag) else {
            tracing::trace!(tag, "no parser registered for message tag");
            return None;
        };
        match parse(payload) {
            Ok(Some(mut message)) => {
                if let Discriminator::Method(method) = &message.discriminator {
                    if method.is_empty() {
                        message.discriminator = Discriminator::Method(tag.to_string());
                    }
                }
                Some(message)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(tag, error = %e, "failed to decode message payload");
                None
            }
        }
    }
}
