//! Topic and pattern validation
//!
//! Key rules:
//! - At most 256 bytes, split on `/` into 1 to 8 layers, none of them empty
//! - Published topics must not contain `+` or `#` at all
//! - Subscription patterns may use `+` anywhere and `#` only as the last layer
//! - A first layer of `$SYS` is reserved for privileged connections
//!
//! Wildcards are whole layers. `a+b` is rejected in patterns as well.

use std::fmt;

use bytes::Bytes;

/// Maximum topic length in bytes
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Maximum number of layers in a topic or pattern
pub const MAX_TOPIC_LAYERS: usize = 8;

/// Reserved first layer for broker-internal topics
pub const SYSTEM_LAYER: &[u8] = b"$SYS";

const SEPARATOR: u8 = b'/';

/// What the topic is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Concrete topic in a PUB (and its reply-to)
    Publish,
    /// Pattern in a SUB
    Subscribe,
}

/// Whether the caller may use `$SYS` topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Privilege {
    #[default]
    Standard,
    System,
}

/// Wildcards present in a validated pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WildcardKind {
    None,
    SingleLayer,
    MultiLayer,
    Both,
}

impl WildcardKind {
    fn with_single(self) -> Self {
        match self {
            WildcardKind::None | WildcardKind::SingleLayer => WildcardKind::SingleLayer,
            WildcardKind::MultiLayer | WildcardKind::Both => WildcardKind::Both,
        }
    }

    fn with_multi(self) -> Self {
        match self {
            WildcardKind::None | WildcardKind::MultiLayer => WildcardKind::MultiLayer,
            WildcardKind::SingleLayer | WildcardKind::Both => WildcardKind::Both,
        }
    }
}

/// Topic validation failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    Empty,
    TooLong(usize),
    TooManyLayers(usize),
    EmptyLayer,
    WildcardInPublish,
    MultiLayerNotLast,
    /// `+` or `#` sharing a layer with other bytes
    PartialWildcard,
    Reserved,
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "topic is empty"),
            Self::TooLong(len) => write!(
                f,
                "topic is {} bytes, maximum is {}",
                len, MAX_TOPIC_LENGTH
            ),
            Self::TooManyLayers(n) => write!(
                f,
                "topic has {} layers, maximum is {}",
                n, MAX_TOPIC_LAYERS
            ),
            Self::EmptyLayer => write!(f, "topic contains an empty layer"),
            Self::WildcardInPublish => write!(f, "wildcards are not allowed in published topics"),
            Self::MultiLayerNotLast => write!(f, "'#' must be the last layer"),
            Self::PartialWildcard => write!(f, "wildcards must occupy a whole layer"),
            Self::Reserved => write!(f, "topic is reserved"),
        }
    }
}

impl std::error::Error for TopicError {}

/// One layer of a validated topic or pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token<'a> {
    Literal(&'a [u8]),
    /// `+`
    SingleLayer,
    /// `#`
    MultiLayer,
}

impl<'a> Token<'a> {
    fn parse(layer: &'a [u8]) -> Self {
        match layer {
            b"+" => Token::SingleLayer,
            b"#" => Token::MultiLayer,
            literal => Token::Literal(literal),
        }
    }
}

/// A topic or pattern that passed validation.
///
/// Keeps the separator positions found during validation so layers can be
/// walked again without rescanning the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidTopic {
    raw: Bytes,
    separators: [u8; MAX_TOPIC_LAYERS - 1],
    layer_count: u8,
    role: Role,
    wildcard: WildcardKind,
}

impl ValidTopic {
    pub fn as_bytes(&self) -> &Bytes {
        &self.raw
    }

    pub fn into_bytes(self) -> Bytes {
        self.raw
    }

    /// Same topic backed by its own allocation instead of a frame slice
    pub fn detached(&self) -> Self {
        Self {
            raw: Bytes::copy_from_slice(&self.raw),
            ..self.clone()
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn wildcard(&self) -> WildcardKind {
        self.wildcard
    }

    pub fn layer_count(&self) -> usize {
        self.layer_count as usize
    }

    /// Layer `index`, without its separators
    pub fn layer(&self, index: usize) -> Option<&[u8]> {
        let count = self.layer_count();
        if index >= count {
            return None;
        }
        let start = if index == 0 {
            0
        } else {
            self.separators[index - 1] as usize + 1
        };
        let end = if index + 1 == count {
            self.raw.len()
        } else {
            self.separators[index] as usize
        };
        Some(&self.raw[start..end])
    }

    pub fn layers(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.layer_count()).filter_map(move |i| self.layer(i))
    }

    pub fn tokens(&self) -> impl Iterator<Item = Token<'_>> + '_ {
        self.layers().map(Token::parse)
    }

    /// First layer is `$SYS`
    pub fn is_reserved(&self) -> bool {
        self.layer(0) == Some(SYSTEM_LAYER)
    }

    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.raw)
    }
}

/// Validate `raw` for the given role.
///
/// Checks run in order: length, layer count, empty layers, wildcard
/// placement, then the `$SYS` reservation.
pub fn validate_topic(
    raw: &Bytes,
    role: Role,
    privilege: Privilege,
) -> Result<ValidTopic, TopicError> {
    if raw.is_empty() {
        return Err(TopicError::Empty);
    }
    if raw.len() > MAX_TOPIC_LENGTH {
        return Err(TopicError::TooLong(raw.len()));
    }

    let mut separators = [0u8; MAX_TOPIC_LAYERS - 1];
    let mut separator_count = 0;
    for (pos, byte) in raw.iter().enumerate() {
        if *byte == SEPARATOR {
            if separator_count < separators.len() {
                // Positions fit in u8: the last byte cannot be a valid separator
                separators[separator_count] = pos as u8;
            }
            separator_count += 1;
        }
    }

    let layer_count = separator_count + 1;
    if layer_count > MAX_TOPIC_LAYERS {
        return Err(TopicError::TooManyLayers(layer_count));
    }

    let topic = ValidTopic {
        raw: raw.clone(),
        separators,
        layer_count: layer_count as u8,
        role,
        wildcard: WildcardKind::None,
    };

    let mut wildcard = WildcardKind::None;
    for (index, layer) in topic.layers().enumerate() {
        if layer.is_empty() {
            return Err(TopicError::EmptyLayer);
        }
        match (Token::parse(layer), role) {
            (Token::Literal(literal), _) => {
                if literal.iter().any(|b| *b == b'+' || *b == b'#') {
                    return Err(match role {
                        Role::Publish => TopicError::WildcardInPublish,
                        Role::Subscribe => TopicError::PartialWildcard,
                    });
                }
            }
            (_, Role::Publish) => return Err(TopicError::WildcardInPublish),
            (Token::SingleLayer, Role::Subscribe) => wildcard = wildcard.with_single(),
            (Token::MultiLayer, Role::Subscribe) => {
                if index + 1 != layer_count {
                    return Err(TopicError::MultiLayerNotLast);
                }
                wildcard = wildcard.with_multi();
            }
        }
    }

    if topic.is_reserved() && privilege != Privilege::System {
        return Err(TopicError::Reserved);
    }

    Ok(ValidTopic { wildcard, ..topic })
}

/// Check whether a concrete topic matches a pattern.
///
/// Both are compared layer by layer on their raw bytes; neither is validated
/// here. Used by authorization rules, which live outside the subscription
/// index.
pub fn topic_matches_pattern(pattern: &[u8], topic: &[u8]) -> bool {
    let mut pattern_layers = pattern.split(|b| *b == SEPARATOR);
    let mut topic_layers = topic.split(|b| *b == SEPARATOR);

    loop {
        match (pattern_layers.next(), topic_layers.next()) {
            (Some(b"#"), _) => return true,
            (Some(b"+"), Some(_)) => {}
            (Some(p), Some(t)) => {
                if p != t {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}
